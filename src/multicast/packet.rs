//! Multicast packet model.
//!
//! One JSON packet per event, small enough for a single UDP datagram. Bulk
//! data never travels over multicast: packets only carry the identity of an
//! endpoint plus the HTTP access coordinates to pull the details from.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::RemoteServiceEvent;

/// Kind of a multicast packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketEvent {
    /// "Who is there?"; peers answer with `discovered`.
    Discovery,
    /// Answer to `discovery`; the receiver pulls the sender's registry.
    Discovered,
    /// A single endpoint appeared; pull it by uid.
    Add,
    /// A single endpoint changed; pull it by uid.
    Update,
    /// A single endpoint disappeared; no pull needed.
    Remove,
}

/// HTTP coordinates of a peer's registry endpoint. The host is not carried:
/// it is taken from the packet's source address, which cannot lie about
/// reachability the way a self-reported IP can.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryAccess {
    pub path: String,
    pub port: u16,
}

/// The on-wire multicast packet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MulticastPacket {
    /// UID of the emitting isolate; used for loopback suppression.
    pub sender: String,
    pub event: PacketEvent,
    /// Endpoint uid, for `add`/`update`/`remove`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Registry access of the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<RegistryAccess>,
    /// Changed property subset, only for `update`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_properties: Option<BTreeMap<String, Value>>,
}

impl MulticastPacket {
    pub fn discovery(sender: impl Into<String>, access: RegistryAccess) -> Self {
        Self {
            sender: sender.into(),
            event: PacketEvent::Discovery,
            uid: None,
            access: Some(access),
            new_properties: None,
        }
    }

    pub fn discovered(sender: impl Into<String>, access: RegistryAccess) -> Self {
        Self {
            sender: sender.into(),
            event: PacketEvent::Discovered,
            uid: None,
            access: Some(access),
            new_properties: None,
        }
    }

    /// Translates a locally emitted repository event into its packet.
    pub fn from_local_event(
        sender: impl Into<String>,
        event: &RemoteServiceEvent,
        access: RegistryAccess,
    ) -> Self {
        let (kind, registration, new_properties) = match event {
            RemoteServiceEvent::Registered { registration } => {
                (PacketEvent::Add, registration, None)
            }
            RemoteServiceEvent::Updated {
                registration,
                changed_properties,
            } => (PacketEvent::Update, registration, changed_properties.clone()),
            RemoteServiceEvent::Unregistered { registration } => {
                (PacketEvent::Remove, registration, None)
            }
        };
        Self {
            sender: sender.into(),
            event: kind,
            uid: Some(registration.service_id.clone()),
            access: Some(access),
            new_properties,
        }
    }

    /// The registration identity this packet refers to, when it has one.
    pub fn endpoint_uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }
}

/// Receive buffer size for the listener; a packet must fit one datagram.
pub const MAX_PACKET_BYTES: usize = 1500;
