//! Protocol events and the wire batch.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::RemoteServiceRegistration;

/// The unit of protocol exchange.
///
/// Events are immutable values: the emitting side builds them, the receiving
/// side merges them into its repository and discards them. `UPDATED` may
/// carry the changed property subset so receivers can apply a partial update
/// instead of replacing the whole property map.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteServiceEvent {
    Registered {
        registration: RemoteServiceRegistration,
    },
    Updated {
        registration: RemoteServiceRegistration,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        changed_properties: Option<BTreeMap<String, Value>>,
    },
    Unregistered {
        registration: RemoteServiceRegistration,
    },
}

impl RemoteServiceEvent {
    /// The registration the event is about.
    pub fn registration(&self) -> &RemoteServiceRegistration {
        match self {
            Self::Registered { registration }
            | Self::Updated { registration, .. }
            | Self::Unregistered { registration } => registration,
        }
    }

    /// Mutable access, used for host resolution on ingestion.
    pub fn registration_mut(&mut self) -> &mut RemoteServiceRegistration {
        match self {
            Self::Registered { registration }
            | Self::Updated { registration, .. }
            | Self::Unregistered { registration } => registration,
        }
    }

    /// Event kind as its wire name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "REGISTERED",
            Self::Updated { .. } => "UPDATED",
            Self::Unregistered { .. } => "UNREGISTERED",
        }
    }
}

/// Wire payload of the `remote-event` signal.
///
/// Always an array, even for a single event. Receivers reject the whole
/// payload if it does not parse as this shape; there is no single-object or
/// heterogeneous-collection fallback.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RemoteEventBatch {
    pub events: Vec<RemoteServiceEvent>,
}

impl RemoteEventBatch {
    pub fn new(events: Vec<RemoteServiceEvent>) -> Self {
        Self { events }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
