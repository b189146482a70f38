//! One exported service and its access points.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::model::EndpointDescription;

/// A service exported by one isolate, reachable through one or more
/// endpoints.
///
/// `service_id` is the stable identity: it survives endpoint changes and is
/// the key under which peers track the registration. A registration with no
/// endpoint is invalid; removing the last endpoint removes the registration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RemoteServiceRegistration {
    /// Stable service identity, unique within the exporting isolate.
    pub service_id: String,
    /// Capability names the service implements. Never empty.
    pub exported_interfaces: BTreeSet<String>,
    /// Service properties, opaque to the protocol except for the reserved
    /// `service.*` keys.
    #[serde(default)]
    pub service_properties: BTreeMap<String, Value>,
    /// Access points, ordered by preference. Never empty.
    pub endpoints: Vec<EndpointDescription>,
    /// Intents the exporter guarantees for this service.
    #[serde(default)]
    pub provided_intents: BTreeSet<String>,
    /// UID of the exporting isolate.
    pub sender: String,
}

impl RemoteServiceRegistration {
    /// Creates a registration with empty properties and intents.
    pub fn new(
        service_id: impl Into<String>,
        exported_interfaces: impl IntoIterator<Item = String>,
        endpoints: Vec<EndpointDescription>,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            exported_interfaces: exported_interfaces.into_iter().collect(),
            service_properties: BTreeMap::new(),
            endpoints,
            provided_intents: BTreeSet::new(),
            sender: String::new(),
        }
    }

    /// Checks the repository invariants.
    pub fn validate(&self) -> Result<(), Error> {
        if self.endpoints.is_empty() {
            return Err(Error::InvalidRegistration {
                service_id: self.service_id.clone(),
                reason: "no endpoint".into(),
            });
        }
        if self.exported_interfaces.is_empty() {
            return Err(Error::InvalidRegistration {
                service_id: self.service_id.clone(),
                reason: "no exported interface".into(),
            });
        }
        Ok(())
    }
}
