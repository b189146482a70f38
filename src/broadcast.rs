//! Broadcast protocol handler.
//!
//! The handler is stateless request/event dispatch over the repository: it
//! turns local export/unexport calls into outbound signals, inbound signals
//! into repository merges, and repository changes into typed notifications.
//!
//! # Notifications
//!
//! Consumers subscribe to a [`tokio::sync::broadcast`] channel of
//! [`ServiceNotification`] values instead of registering callbacks. A slow
//! subscriber lags on its own receiver and observes `Lagged`; it never blocks
//! protocol ingestion, and one subscriber cannot affect the others.
//!
//! # Failure policy
//!
//! A failed or timed-out send to one target is logged and skipped, the
//! remaining targets are still attempted, and nothing is rolled back: peers
//! that missed an event converge on the next periodic re-announcement.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::directory::{SignalDirectory, TargetGroup};
use crate::error::Error;
use crate::intents;
use crate::model::{RemoteEventBatch, RemoteServiceEvent, RemoteServiceRegistration};
use crate::repository::{MergeOutcome, RemoteServiceRepository};
use crate::signals::{
    SignalEnvelope, SignalTransport, SIGNAL_REMOTE_EVENT, SIGNAL_REQUEST_ENDPOINTS,
};

/// Buffered notifications per subscriber before it starts lagging.
const NOTIFICATION_CHANNEL_CAPACITY: usize = 256;

/// Buffered local events for the multicast packet emitter.
const LOCAL_EVENT_CHANNEL_CAPACITY: usize = 64;

/// Typed message published for every observed remote-service change.
#[derive(Clone, Debug)]
pub enum ServiceNotification {
    /// A service of another isolate became available.
    Appeared {
        registration: RemoteServiceRegistration,
    },
    /// Properties (and possibly endpoints) of a known service changed.
    Modified {
        registration: RemoteServiceRegistration,
        changed_properties: Option<std::collections::BTreeMap<String, serde_json::Value>>,
    },
    /// A service went away, either explicitly unregistered or because its
    /// isolate was lost. The two are indistinguishable on purpose.
    Lost { sender: String, service_id: String },
}

/// The per-isolate protocol handler.
pub struct RemoteServiceBroadcaster {
    repository: Arc<RemoteServiceRepository>,
    directory: Arc<SignalDirectory>,
    transport: Arc<dyn SignalTransport>,
    notifications: broadcast::Sender<ServiceNotification>,
    local_events: broadcast::Sender<RemoteServiceEvent>,
}

impl RemoteServiceBroadcaster {
    pub fn new(
        repository: Arc<RemoteServiceRepository>,
        directory: Arc<SignalDirectory>,
        transport: Arc<dyn SignalTransport>,
    ) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        let (local_events, _) = broadcast::channel(LOCAL_EVENT_CHANNEL_CAPACITY);
        Self {
            repository,
            directory,
            transport,
            notifications,
            local_events,
        }
    }

    /// UID of the local isolate.
    pub fn local_uid(&self) -> &str {
        self.repository.local_uid()
    }

    pub fn repository(&self) -> &Arc<RemoteServiceRepository> {
        &self.repository
    }

    pub fn directory(&self) -> &Arc<SignalDirectory> {
        &self.directory
    }

    /// Subscribes to remote-service notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceNotification> {
        self.notifications.subscribe()
    }

    /// Subscribes to the stream of locally emitted events (exports,
    /// unexports, property updates). Consumed by the multicast peer.
    pub fn subscribe_local_events(&self) -> broadcast::Receiver<RemoteServiceEvent> {
        self.local_events.subscribe()
    }

    /// Exports a local service and announces it to all other isolates.
    ///
    /// The intent gate runs first: when the transports cannot guarantee the
    /// intents the service requires, the export is refused and nothing is
    /// stored or sent.
    pub async fn export_service(
        &self,
        mut registration: RemoteServiceRegistration,
    ) -> Result<(), Error> {
        let required = intents::required_intents(&registration.service_properties)?;
        let provided =
            intents::provided_intents(&registration.service_properties, self.transport.intents())?;
        if !intents::intents_resolved(&provided, &required) {
            let missing: Vec<String> = required.difference(&provided).cloned().collect();
            return Err(Error::UnresolvedIntents { missing });
        }
        registration.provided_intents = provided;

        let event = self.repository.export(registration)?;
        info!(
            service_id = %event.registration().service_id,
            kind = event.kind(),
            "exported local service"
        );
        self.publish_local(event.clone());
        self.broadcast_events(std::slice::from_ref(&event)).await;
        Ok(())
    }

    /// Withdraws a local export. Returns whether the service was exported.
    pub async fn unexport_service(&self, service_id: &str) -> bool {
        let Some(event) = self.repository.unexport(service_id) else {
            debug!(service_id, "unexport of unknown service ignored");
            return false;
        };
        info!(service_id, "unexported local service");
        self.publish_local(event.clone());
        self.broadcast_events(std::slice::from_ref(&event)).await;
        true
    }

    /// Applies a property change to a local export and announces it.
    /// Returns whether the service was exported.
    pub async fn update_service(
        &self,
        service_id: &str,
        changes: std::collections::BTreeMap<String, serde_json::Value>,
    ) -> bool {
        let Some(event) = self.repository.update_properties(service_id, changes) else {
            debug!(service_id, "update of unknown service ignored");
            return false;
        };
        self.publish_local(event.clone());
        self.broadcast_events(std::slice::from_ref(&event)).await;
        true
    }

    /// Entry point for inbound directed signals.
    ///
    /// Returns the reply payload, if the signal produces one. Malformed
    /// payloads are logged and dropped without affecting anything else.
    pub async fn dispatch_signal(
        &self,
        sender: &str,
        signal: &str,
        payload: Option<serde_json::Value>,
    ) -> Option<serde_json::Value> {
        if sender == self.local_uid() {
            // Loopback: signals we addressed to a group that includes us.
            return None;
        }
        match signal {
            SIGNAL_REMOTE_EVENT => {
                let Some(payload) = payload else {
                    warn!(sender, "remote-event signal without payload");
                    return None;
                };
                match serde_json::from_value::<RemoteEventBatch>(payload) {
                    Ok(batch) => {
                        for event in batch.events {
                            self.ingest_event(event).await;
                        }
                    }
                    Err(error) => {
                        warn!(sender, %error, "discarding malformed remote-event payload");
                    }
                }
                None
            }
            SIGNAL_REQUEST_ENDPOINTS => {
                let batch = self.request_endpoints_reply();
                match batch {
                    Some(batch) => {
                        debug!(sender, events = batch.events.len(), "answering endpoints request");
                        serde_json::to_value(batch).ok()
                    }
                    // Nothing exported: silence is a valid reply.
                    None => None,
                }
            }
            other => {
                warn!(sender, signal = other, "ignoring unknown signal");
                None
            }
        }
    }

    /// Builds the REGISTERED batch answering a `request-endpoints` signal,
    /// or `None` when this isolate exports nothing.
    pub fn request_endpoints_reply(&self) -> Option<RemoteEventBatch> {
        let registrations = self.repository.local_registrations();
        if registrations.is_empty() {
            return None;
        }
        let events = registrations
            .into_iter()
            .filter(|registration| !registration.endpoints.is_empty())
            .map(|registration| RemoteServiceEvent::Registered { registration })
            .collect();
        Some(RemoteEventBatch::new(events))
    }

    /// Merges one inbound event and notifies subscribers.
    ///
    /// Host resolution happens here: each endpoint whose host is still
    /// unknown is resolved through the directory, and endpoints that cannot
    /// be resolved are dropped individually. Only a registration left with
    /// no usable endpoint at all is skipped.
    pub async fn ingest_event(&self, mut event: RemoteServiceEvent) {
        if event.registration().sender == self.local_uid() {
            return;
        }

        if !matches!(event, RemoteServiceEvent::Unregistered { .. }) {
            let directory = &self.directory;
            let registration = event.registration_mut();
            let service_id = registration.service_id.clone();
            registration.endpoints.retain_mut(|endpoint| {
                if endpoint.host.is_some() {
                    return true;
                }
                match directory.resolve_host_for_node(&endpoint.node) {
                    Some(host) => {
                        endpoint.resolve_host(&host);
                        true
                    }
                    None => {
                        warn!(
                            service_id = %service_id,
                            endpoint = %endpoint.uid,
                            node = %endpoint.node,
                            "dropping endpoint with unresolvable node"
                        );
                        false
                    }
                }
            });
            if registration.endpoints.is_empty() {
                warn!(
                    service_id = %service_id,
                    "skipping event: no endpoint left after host resolution"
                );
                return;
            }
        }

        let changed_properties = match &event {
            RemoteServiceEvent::Updated {
                changed_properties, ..
            } => changed_properties.clone(),
            _ => None,
        };

        match self.repository.merge(&event) {
            Ok(outcome) => {
                let registration = event.registration();
                debug!(
                    sender = %registration.sender,
                    service_id = %registration.service_id,
                    kind = event.kind(),
                    ?outcome,
                    "merged remote event"
                );
                let notification = match outcome {
                    MergeOutcome::Inserted => Some(ServiceNotification::Appeared {
                        registration: registration.clone(),
                    }),
                    MergeOutcome::Updated => Some(ServiceNotification::Modified {
                        registration: registration.clone(),
                        changed_properties,
                    }),
                    MergeOutcome::Removed => Some(ServiceNotification::Lost {
                        sender: registration.sender.clone(),
                        service_id: registration.service_id.clone(),
                    }),
                    MergeOutcome::AlreadyAbsent => None,
                };
                if let Some(notification) = notification {
                    let _ = self.notifications.send(notification);
                }
            }
            Err(error) => {
                warn!(
                    sender = %event.registration().sender,
                    kind = event.kind(),
                    %error,
                    "rejected remote event"
                );
            }
        }
    }

    /// Presence hook: an isolate became reachable.
    ///
    /// Asks it for its exports and merges the reply. The request is directed,
    /// so a missing directory entry only produces a warning.
    pub async fn isolate_ready(&self, uid: &str) {
        if uid == self.local_uid() {
            return;
        }
        let Some(access) = self.directory.resolve(uid) else {
            warn!(isolate = uid, "ready isolate is not in the directory, skipping");
            return;
        };
        let envelope = SignalEnvelope::new(self.local_uid(), None);
        match self
            .transport
            .send(&access, SIGNAL_REQUEST_ENDPOINTS, &envelope)
            .await
        {
            Ok(Some(value)) => match serde_json::from_value::<RemoteEventBatch>(value) {
                Ok(batch) => {
                    debug!(isolate = uid, events = batch.events.len(), "received endpoints");
                    for event in batch.events {
                        self.ingest_event(event).await;
                    }
                }
                Err(error) => {
                    warn!(isolate = uid, %error, "discarding malformed endpoints reply");
                }
            },
            Ok(None) => debug!(isolate = uid, "isolate has no exports"),
            Err(error) => warn!(isolate = uid, %error, "endpoints request failed"),
        }
    }

    /// Presence hook: an isolate vanished.
    ///
    /// Purges its registrations and notifies subscribers as if each service
    /// had been unregistered explicitly.
    pub fn isolate_lost(&self, uid: &str) {
        let removed = self.repository.purge_sender(uid);
        if removed.is_empty() {
            return;
        }
        info!(isolate = uid, services = removed.len(), "purged lost isolate");
        for registration in removed {
            let _ = self.notifications.send(ServiceNotification::Lost {
                sender: registration.sender,
                service_id: registration.service_id,
            });
        }
    }

    /// Spawns the periodic re-announcement task.
    ///
    /// Every interval the full local registration set is re-broadcast to all
    /// other isolates as one batched remote-event signal. This is the
    /// self-healing bound for peers that missed an event or applied one out
    /// of order.
    pub fn spawn_resync(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let broadcaster = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so a fresh isolate
            // does not double-announce right after its exports.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("resync task shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let registrations = broadcaster.repository.local_registrations();
                        if registrations.is_empty() {
                            continue;
                        }
                        let events: Vec<RemoteServiceEvent> = registrations
                            .into_iter()
                            .map(|registration| RemoteServiceEvent::Registered { registration })
                            .collect();
                        debug!(events = events.len(), "periodic re-announcement");
                        broadcaster.broadcast_events(&events).await;
                    }
                }
            }
        })
    }

    fn publish_local(&self, event: RemoteServiceEvent) {
        let _ = self.local_events.send(event);
    }

    /// Sends the given events to every other isolate in the directory.
    async fn broadcast_events(&self, events: &[RemoteServiceEvent]) {
        let batch = RemoteEventBatch::new(events.to_vec());
        let payload = match serde_json::to_value(&batch) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(%error, "failed to serialize event batch");
                return;
            }
        };
        let envelope = SignalEnvelope::new(self.local_uid(), Some(payload));

        for (uid, access) in self.directory.resolve_group(TargetGroup::Others) {
            if let Err(error) = self
                .transport
                .fire(&access, SIGNAL_REMOTE_EVENT, &envelope)
                .await
            {
                warn!(isolate = %uid, %error, "signal send failed, skipping target");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{DirectoryConfig, IsolateAccess};
    use crate::model::{EndpointDescription, PROP_EXPORTED_INTENTS};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeSet;

    struct NullTransport {
        intents: BTreeSet<String>,
    }

    #[async_trait]
    impl SignalTransport for NullTransport {
        fn intents(&self) -> &BTreeSet<String> {
            &self.intents
        }

        async fn fire(
            &self,
            _target: &IsolateAccess,
            _signal: &str,
            _envelope: &SignalEnvelope,
        ) -> Result<(), crate::signals::TransportError> {
            Ok(())
        }

        async fn send(
            &self,
            _target: &IsolateAccess,
            _signal: &str,
            _envelope: &SignalEnvelope,
        ) -> Result<Option<serde_json::Value>, crate::signals::TransportError> {
            Ok(None)
        }
    }

    fn broadcaster(transport_intents: &[&str]) -> Arc<RemoteServiceBroadcaster> {
        let repository = Arc::new(RemoteServiceRepository::new("iso-local"));
        let directory = Arc::new(SignalDirectory::new("iso-local", DirectoryConfig::default()));
        let transport = Arc::new(NullTransport {
            intents: transport_intents.iter().map(|s| s.to_string()).collect(),
        });
        Arc::new(RemoteServiceBroadcaster::new(repository, directory, transport))
    }

    fn registration(service_id: &str) -> RemoteServiceRegistration {
        RemoteServiceRegistration::new(
            service_id,
            ["calc".to_string()],
            vec![EndpointDescription::new(
                "calc", "jsonrpc", "http", "node-1", 9010, "/JSON-RPC",
            )],
        )
    }

    #[tokio::test]
    async fn export_refused_when_intents_unresolved() {
        let broadcaster = broadcaster(&[]);
        let mut reg = registration("svc-1");
        reg.service_properties
            .insert(PROP_EXPORTED_INTENTS.into(), json!("confidentiality"));

        let result = broadcaster.export_service(reg).await;
        assert!(matches!(result, Err(Error::UnresolvedIntents { .. })));
        assert!(broadcaster.repository().local_registrations().is_empty());
    }

    #[tokio::test]
    async fn export_allowed_when_transport_provides_intents() {
        let broadcaster = broadcaster(&["confidentiality"]);
        let mut reg = registration("svc-1");
        reg.service_properties
            .insert(PROP_EXPORTED_INTENTS.into(), json!("confidentiality"));

        broadcaster.export_service(reg).await.unwrap();
        let stored = broadcaster.repository().local_registrations();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].provided_intents.contains("confidentiality"));
    }

    #[tokio::test]
    async fn request_endpoints_reply_is_silent_when_empty() {
        let broadcaster = broadcaster(&[]);
        assert!(broadcaster.request_endpoints_reply().is_none());
        assert!(broadcaster
            .dispatch_signal("iso-peer", SIGNAL_REQUEST_ENDPOINTS, None)
            .await
            .is_none());

        broadcaster.export_service(registration("svc-1")).await.unwrap();
        let reply = broadcaster
            .dispatch_signal("iso-peer", SIGNAL_REQUEST_ENDPOINTS, None)
            .await
            .expect("reply expected");
        let batch: RemoteEventBatch = serde_json::from_value(reply).unwrap();
        assert_eq!(batch.events.len(), 1);
    }

    #[tokio::test]
    async fn malformed_remote_event_payload_is_discarded() {
        let broadcaster = broadcaster(&[]);
        let reply = broadcaster
            .dispatch_signal("iso-peer", SIGNAL_REMOTE_EVENT, Some(json!({"bogus": 1})))
            .await;
        assert!(reply.is_none());
        assert!(broadcaster.repository().remote_registrations().is_empty());
    }

    #[tokio::test]
    async fn ingest_drops_unresolvable_endpoints_individually() {
        let broadcaster = broadcaster(&[]);
        broadcaster
            .directory()
            .set_node_address("node-known", "10.0.0.5");

        let mut reg = registration("svc-1");
        reg.sender = "iso-peer".into();
        reg.endpoints = vec![
            EndpointDescription::new("a", "jsonrpc", "http", "node-known", 1, "/a"),
            EndpointDescription::new("b", "jsonrpc", "http", "node-unknown", 2, "/b"),
        ];

        broadcaster
            .ingest_event(RemoteServiceEvent::Registered { registration: reg })
            .await;

        let stored = broadcaster
            .repository()
            .remote_registration("iso-peer", "svc-1")
            .expect("registration should be merged");
        assert_eq!(stored.endpoints.len(), 1);
        assert_eq!(stored.endpoints[0].host.as_deref(), Some("10.0.0.5"));
    }

    #[tokio::test]
    async fn ingest_skips_registration_with_no_resolvable_endpoint() {
        let broadcaster = broadcaster(&[]);
        let mut reg = registration("svc-1");
        reg.sender = "iso-peer".into();

        broadcaster
            .ingest_event(RemoteServiceEvent::Registered { registration: reg })
            .await;
        assert!(broadcaster.repository().remote_registrations().is_empty());
    }

    #[tokio::test]
    async fn isolate_lost_notifies_per_purged_service() {
        let broadcaster = broadcaster(&[]);
        broadcaster
            .directory()
            .set_node_address("node-1", "10.0.0.5");
        let mut receiver = broadcaster.subscribe();

        for id in ["a", "b", "c"] {
            let mut reg = registration(id);
            reg.sender = "iso-peer".into();
            broadcaster
                .ingest_event(RemoteServiceEvent::Registered { registration: reg })
                .await;
        }
        // Drain the three Appeared notifications.
        for _ in 0..3 {
            assert!(matches!(
                receiver.recv().await.unwrap(),
                ServiceNotification::Appeared { .. }
            ));
        }

        broadcaster.isolate_lost("iso-peer");
        for _ in 0..3 {
            assert!(matches!(
                receiver.recv().await.unwrap(),
                ServiceNotification::Lost { .. }
            ));
        }
        assert!(broadcaster.repository().remote_registrations().is_empty());
    }
}
