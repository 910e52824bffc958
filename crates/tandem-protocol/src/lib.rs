//! Wire envelopes for commands and events crossing a process boundary.
//!
//! Only the envelope shape needed to preserve scheduling and routing
//! semantics lives here: opaque hash-chainable tokens, and routing slips
//! serialized as ordered lists of absolute locator strings (pending hops
//! carry a `?tag=arrived` query that identity comparisons strip).

mod envelope;

pub use envelope::{
    CommandEnvelope, CommandPayload, Envelope, EventEnvelope, EventPayload, ProtocolError,
};
