//! Value types exchanged by the discovery protocol.
//!
//! Everything in this module is a plain serde value: endpoints, registrations
//! and events are built by the emitting side, serialized as-is, and consumed
//! by the receiving side. None of these types hold locks or references into
//! the repository.

mod endpoint;
mod event;
mod registration;

pub use endpoint::EndpointDescription;
pub use event::{RemoteEventBatch, RemoteServiceEvent};
pub use registration::RemoteServiceRegistration;

use std::collections::BTreeMap;

use serde_json::Value;

/// Prefix shared by all export-side service properties.
pub const PROP_EXPORTED_PREFIX: &str = "service.exported.";

/// Interfaces a service asks to export.
pub const PROP_EXPORTED_INTERFACES: &str = "service.exported.interfaces";

/// Export configurations (transport kinds) a service asks for.
pub const PROP_EXPORTED_CONFIGS: &str = "service.exported.configs";

/// Intents a service requires from the transport that exports it.
pub const PROP_EXPORTED_INTENTS: &str = "service.exported.intents";

/// Additional required intents, merged with [`PROP_EXPORTED_INTENTS`].
pub const PROP_EXPORTED_INTENTS_EXTRA: &str = "service.exported.intents.extra";

/// Intents a service guarantees by itself, independent of the transport.
pub const PROP_INTENTS: &str = "service.intents";

/// Marker set on the import side of a remote service.
pub const PROP_IMPORTED: &str = "service.imported";

/// Configurations the service was imported with.
pub const PROP_IMPORTED_CONFIGS: &str = "service.imported.configs";

/// Isolate UID the service was imported from.
pub const PROP_IMPORTED_FROM: &str = "service.imported.from";

/// Rewrites exported service properties for the importing side.
///
/// Drops every `service.exported.*` key, marks the result as imported and
/// records the exporting isolate. The export configurations are carried over
/// under their import-side key so proxy factories can still pick a transport.
pub fn filter_import_properties(
    properties: &BTreeMap<String, Value>,
    host_isolate: &str,
) -> BTreeMap<String, Value> {
    let mut filtered: BTreeMap<String, Value> = properties
        .iter()
        .filter(|(key, _)| !key.starts_with(PROP_EXPORTED_PREFIX))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    filtered.insert(PROP_IMPORTED.into(), Value::Bool(true));
    filtered.insert(PROP_IMPORTED_FROM.into(), Value::String(host_isolate.into()));

    if let Some(configs) = properties.get(PROP_EXPORTED_CONFIGS) {
        filtered.insert(PROP_IMPORTED_CONFIGS.into(), configs.clone());
    }

    filtered
}
