//! The application-level message delivered between endpoints.

use metronome_core::{SmallBuffer, Time};

/// A timestamped endpoint-to-endpoint message as seen by federates and
/// filter operators.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointMessage {
    pub time: Time,
    pub source: String,
    pub dest: String,
    /// The first sender, preserved across filters and retransmission.
    pub original_source: String,
    pub original_dest: String,
    pub payload: SmallBuffer,
}

impl EndpointMessage {
    pub fn new(source: &str, dest: &str, time: Time, payload: impl Into<SmallBuffer>) -> Self {
        EndpointMessage {
            time,
            source: source.to_string(),
            dest: dest.to_string(),
            original_source: source.to_string(),
            original_dest: dest.to_string(),
            payload: payload.into(),
        }
    }
}
