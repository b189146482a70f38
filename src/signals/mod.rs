//! Signal transport abstraction.
//!
//! Signals are directed or group-addressed protocol messages. The broadcast
//! handler only speaks to the [`SignalTransport`] trait; the concrete wiring
//! (HTTP in production, an in-process hub in tests) is injected at bootstrap.
//!
//! Two delivery modes exist:
//! - `fire`: one-way, bounded timeout, no reply expected
//! - `send`: request/response, the reply payload is returned to the caller
//!
//! A transport also declares the intents it guarantees for the services it
//! carries; the export gate unions them with the service's own intents.

pub mod http;

pub use http::HttpSignalTransport;

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::directory::IsolateAccess;

/// Prefix of every broadcaster signal name.
pub const SIGNAL_PREFIX: &str = "/larch/remote-service-broadcaster";

/// Carries one serialized [`crate::model::RemoteEventBatch`].
pub const SIGNAL_REMOTE_EVENT: &str = "/larch/remote-service-broadcaster/remote-event";

/// Asks a peer for REGISTERED events covering all its exports.
pub const SIGNAL_REQUEST_ENDPOINTS: &str = "/larch/remote-service-broadcaster/request-endpoints";

/// Wire envelope of a directed signal.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SignalEnvelope {
    /// UID of the emitting isolate.
    pub sender: String,
    /// Signal payload; absent for signals that carry no data
    /// (e.g. `request-endpoints`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl SignalEnvelope {
    pub fn new(sender: impl Into<String>, payload: Option<serde_json::Value>) -> Self {
        Self {
            sender: sender.into(),
            payload,
        }
    }
}

/// Transport failures. All of them are recoverable: the caller skips the
/// target, logs a warning, and carries on with the remaining targets.
#[derive(Debug, Snafu)]
pub enum TransportError {
    #[snafu(display("request to {target} timed out after {timeout_ms} ms"))]
    Timeout { target: String, timeout_ms: u64 },

    #[snafu(display("request to {target} failed: {source}"))]
    Unreachable { target: String, source: reqwest::Error },

    #[snafu(display("{target} answered HTTP {status}"))]
    Status { target: String, status: u16 },

    #[snafu(display("invalid response payload from {target}: {detail}"))]
    Payload { target: String, detail: String },
}

impl TransportError {
    /// True for an HTTP 404, which some callers treat as a benign miss
    /// (e.g. a multicast `update` for an endpoint that is already gone).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status: 404, .. })
    }
}

/// Point-to-point and group messaging used to carry protocol signals.
#[async_trait]
pub trait SignalTransport: Send + Sync {
    /// Intents this transport guarantees for services it carries.
    fn intents(&self) -> &BTreeSet<String>;

    /// One-way delivery with a bounded timeout. A timed-out send is treated
    /// identically to a failed send by callers.
    async fn fire(
        &self,
        target: &IsolateAccess,
        signal: &str,
        envelope: &SignalEnvelope,
    ) -> Result<(), TransportError>;

    /// Request/response delivery. `Ok(None)` means the peer had nothing to
    /// say, which is a valid reply.
    async fn send(
        &self,
        target: &IsolateAccess,
        signal: &str,
        envelope: &SignalEnvelope,
    ) -> Result<Option<serde_json::Value>, TransportError>;
}
