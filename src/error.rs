//! Core error taxonomy for the discovery engine.
//!
//! Only true invariant violations surface as errors; expected "not found"
//! conditions are `Option` returns on the APIs that produce them. Transport
//! failures live in [`crate::signals::TransportError`], configuration errors
//! next to the configuration code.

use snafu::Snafu;

/// Errors raised at the model and repository boundaries.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum Error {
    /// A registration that violates the repository invariants (no endpoint,
    /// no exported interface) is rejected before it reaches the maps.
    #[snafu(display("invalid registration {service_id}: {reason}"))]
    InvalidRegistration { service_id: String, reason: String },

    /// An intent property was neither a string nor an array of strings.
    #[snafu(display("property {key} must be a string or an array of strings, got {found}"))]
    TypeMismatch { key: String, found: &'static str },

    /// The available transports cannot guarantee the intents the service
    /// requires; the service must not cross the process boundary.
    #[snafu(display("unresolved intents, missing {missing:?}"))]
    UnresolvedIntents { missing: Vec<String> },

    /// A received event, packet, or registry map did not have the expected
    /// shape. The offending element is discarded, never the whole batch.
    #[snafu(display("malformed payload: {detail}"))]
    MalformedPayload { detail: String },
}
