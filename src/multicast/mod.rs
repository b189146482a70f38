//! Multicast discovery sub-protocol.
//!
//! Interoperates with isolates that only support multicast bootstrap:
//! periodic UDP `discovery` beacons, per-event packets, and a pull-based
//! HTTP registry for the bulk data that does not fit a datagram. Everything
//! received here is translated into the same REGISTERED/UPDATED/UNREGISTERED
//! vocabulary as the directed-signal path, so both transports share one
//! downstream merge path.

mod packet;
mod peer;
mod registry;

pub use packet::{MulticastPacket, PacketEvent, RegistryAccess};
pub use peer::MulticastPeer;
pub use registry::{
    registration_from_map, registration_to_map, registry_router, SERVER_PLACEHOLDER,
};
