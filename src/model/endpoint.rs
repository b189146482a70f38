//! One reachable access point for an exported service.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Description of a single network-reachable access point.
///
/// The `uid` is assigned at creation and never changes. The `host` is not
/// known at creation time on the importing side: registrations travel with
/// the *node name* of the exporter, and the host is filled in from the signal
/// directory when the registration is ingested. [`resolve_host`] is the only
/// mutation this type allows.
///
/// [`resolve_host`]: EndpointDescription::resolve_host
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointDescription {
    /// Globally unique endpoint identifier, immutable after creation.
    pub uid: String,
    /// Endpoint name, used by proxy layers to prefix method calls.
    pub name: String,
    /// Transport kind, e.g. `"jsonrpc"`.
    pub transport: String,
    /// Wire protocol, e.g. `"http"`.
    pub protocol: String,
    /// Name of the node hosting the endpoint; resolved to a host address
    /// through the signal directory.
    pub node: String,
    /// Resolved host address. `None` until a directory lookup succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// TCP/UDP port of the access point.
    pub port: u16,
    /// Path component of the access point, always `/`-prefixed.
    pub path: String,
}

impl EndpointDescription {
    /// Creates an endpoint with a fresh UID and an unresolved host.
    pub fn new(
        name: impl Into<String>,
        transport: impl Into<String>,
        protocol: impl Into<String>,
        node: impl Into<String>,
        port: u16,
        path: impl Into<String>,
    ) -> Self {
        let path = path.into();
        let path = if path.starts_with('/') { path } else { format!("/{path}") };
        Self {
            uid: Uuid::new_v4().to_string(),
            name: name.into(),
            transport: transport.into(),
            protocol: protocol.into(),
            node: node.into(),
            host: None,
            port,
            path,
        }
    }

    /// Fills in the resolved host address.
    ///
    /// Returns `true` when the host was set or re-resolved to the same
    /// value, `false` when a different host was already recorded (the first
    /// resolution wins; the caller decides whether to log).
    pub fn resolve_host(&mut self, host: &str) -> bool {
        match &self.host {
            None => {
                self.host = Some(host.to_string());
                true
            }
            Some(current) => current == host,
        }
    }

    /// Full URL of the access point, once the host is resolved.
    pub fn url(&self) -> Option<String> {
        self.host
            .as_ref()
            .map(|host| format!("{}://{}:{}{}", self.protocol, host, self.port, self.path))
    }
}
