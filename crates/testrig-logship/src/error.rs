//! Delivery failures.

use thiserror::Error;

/// A batch could not be delivered.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// The collector refused the batch; sending it again will not help.
    #[error("collector rejected the batch with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("collector still answered {status} after {attempts} attempt(s)")]
    RetriesExhausted { status: u16, attempts: u32 },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("could not encode the batch: {0}")]
    Encode(#[from] serde_json::Error),
}

impl DeliveryError {
    /// Authentication and malformed-request responses.
    pub fn is_rejection(&self) -> bool {
        matches!(self, DeliveryError::Rejected { .. })
    }
}
