//! Fixture builders shared across integration tests.

use std::collections::BTreeMap;
use std::time::Duration;

use larch::directory::{DirectoryConfig, DirectoryEntry, IsolateKind};
use larch::model::{EndpointDescription, RemoteServiceRegistration};

/// Standard test timeout duration.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds a directory where every listed isolate runs on its own node
/// `node-{uid}` with host `host-{uid}` and port 1. The in-memory signal hub
/// addresses peers by that `host:port` pair.
pub fn directory_for(uids: &[&str]) -> DirectoryConfig {
    DirectoryConfig {
        isolates: uids
            .iter()
            .map(|uid| DirectoryEntry {
                uid: uid.to_string(),
                name: uid.to_string(),
                node: format!("node-{uid}"),
                port: 1,
                kind: IsolateKind::Isolate,
            })
            .collect(),
        nodes: uids
            .iter()
            .map(|uid| (format!("node-{uid}"), format!("host-{uid}")))
            .collect(),
    }
}

/// A registration with one jsonrpc endpoint hosted on `node-{owner}`, so any
/// isolate whose directory came from [`directory_for`] can resolve it.
pub fn registration_with_endpoint(service_id: &str, owner: &str) -> RemoteServiceRegistration {
    RemoteServiceRegistration::new(
        service_id,
        ["calc".to_string()],
        vec![EndpointDescription::new(
            service_id,
            "jsonrpc",
            "http",
            format!("node-{owner}"),
            9010,
            "/JSON-RPC",
        )],
    )
}

/// Polls `condition` until it returns true or the timeout elapses.
pub async fn wait_for<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Property map helper.
pub fn props(entries: &[(&str, serde_json::Value)]) -> BTreeMap<String, serde_json::Value> {
    entries
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}
