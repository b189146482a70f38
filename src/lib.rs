//! Larch: remote service discovery and broadcast for multi-isolate
//! applications.
//!
//! A set of independently running processes ("isolates") forming one logical
//! application discover each other's exported services, exchange live
//! service-availability events, and resolve the endpoints needed to build
//! remote proxies, without a central broker.
//!
//! # Architecture
//!
//! ```text
//! export ──▶ RemoteServiceRepository ──▶ RemoteServiceBroadcaster
//!                                          │            │
//!                            directed signals        multicast packets
//!                            (HTTP, directory-       (UDP group + HTTP
//!                             resolved targets)       registry pulls)
//!                                          │            │
//!                                          ▼            ▼
//!                                 peer broadcaster.ingest_event
//!                                          │
//!                                          ▼
//!                              ServiceNotification subscribers
//! ```
//!
//! Two independent transports carry the same event vocabulary: directed
//! signals for isolates listed in the [`directory`], and a multicast
//! discovery sub-protocol for peers that only support multicast bootstrap.
//! Both converge on one merge path into the repository, and consumers
//! observe the result as typed [`broadcast::ServiceNotification`] messages
//! on a subscription channel.
//!
//! The view is eventually consistent: sends that fail are skipped and
//! logged, and the periodic re-announcement task is the self-healing bound
//! for anything a peer missed.

pub mod bootstrap;
pub mod broadcast;
pub mod config;
pub mod directory;
pub mod error;
pub mod intents;
pub mod model;
pub mod multicast;
pub mod repository;
pub mod server;
pub mod signals;

pub use bootstrap::{bootstrap_isolate, IsolateHandle};
pub use broadcast::{RemoteServiceBroadcaster, ServiceNotification};
pub use config::IsolateConfig;
pub use directory::{DirectoryConfig, DirectoryEntry, IsolateAccess, SignalDirectory, TargetGroup};
pub use error::Error;
pub use model::{
    EndpointDescription, RemoteEventBatch, RemoteServiceEvent, RemoteServiceRegistration,
};
pub use repository::{MergeOutcome, RemoteServiceRepository};
