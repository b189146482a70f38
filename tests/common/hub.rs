//! In-memory signal transport for integration tests.
//!
//! The hub routes directed signals between broadcasters registered under the
//! `host:port` pair their directory entries resolve to. Delivery is
//! synchronous and in-process, which makes the protocol flows deterministic
//! without binding sockets.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use larch::broadcast::RemoteServiceBroadcaster;
use larch::directory::{DirectoryConfig, IsolateAccess, SignalDirectory};
use larch::repository::RemoteServiceRepository;
use larch::signals::{SignalEnvelope, SignalTransport, TransportError};
use parking_lot::Mutex;

#[derive(Default)]
pub struct SignalHub {
    intents: BTreeSet<String>,
    peers: Mutex<HashMap<String, Arc<RemoteServiceBroadcaster>>>,
}

impl SignalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_intents(intents: impl IntoIterator<Item = String>) -> Arc<Self> {
        Arc::new(Self {
            intents: intents.into_iter().collect(),
            peers: Mutex::new(HashMap::new()),
        })
    }

    pub fn register(&self, access_key: String, broadcaster: Arc<RemoteServiceBroadcaster>) {
        self.peers.lock().insert(access_key, broadcaster);
    }

    /// Simulates a peer crash: signals to it start failing.
    pub fn disconnect(&self, access_key: &str) {
        self.peers.lock().remove(access_key);
    }

    fn lookup(
        &self,
        target: &IsolateAccess,
    ) -> Result<Arc<RemoteServiceBroadcaster>, TransportError> {
        let key = format!("{}:{}", target.host, target.port);
        self.peers
            .lock()
            .get(&key)
            .cloned()
            .ok_or(TransportError::Status {
                target: key,
                status: 503,
            })
    }
}

#[async_trait]
impl SignalTransport for SignalHub {
    fn intents(&self) -> &BTreeSet<String> {
        &self.intents
    }

    async fn fire(
        &self,
        target: &IsolateAccess,
        signal: &str,
        envelope: &SignalEnvelope,
    ) -> Result<(), TransportError> {
        let peer = self.lookup(target)?;
        peer.dispatch_signal(&envelope.sender, signal, envelope.payload.clone())
            .await;
        Ok(())
    }

    async fn send(
        &self,
        target: &IsolateAccess,
        signal: &str,
        envelope: &SignalEnvelope,
    ) -> Result<Option<serde_json::Value>, TransportError> {
        let peer = self.lookup(target)?;
        Ok(peer
            .dispatch_signal(&envelope.sender, signal, envelope.payload.clone())
            .await)
    }
}

/// Creates a broadcaster wired to the hub and registers it under its own
/// `host-{uid}:1` key (the shape produced by `fixtures::directory_for`).
pub fn hub_isolate(
    hub: &Arc<SignalHub>,
    uid: &str,
    directory: DirectoryConfig,
) -> Arc<RemoteServiceBroadcaster> {
    let repository = Arc::new(RemoteServiceRepository::new(uid));
    let directory = Arc::new(SignalDirectory::new(uid, directory));
    let broadcaster = Arc::new(RemoteServiceBroadcaster::new(
        repository,
        directory,
        Arc::clone(hub) as Arc<dyn SignalTransport>,
    ));
    hub.register(format!("host-{uid}:1"), Arc::clone(&broadcaster));
    broadcaster
}
