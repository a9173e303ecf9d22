//! Index error types.

use thiserror::Error;

pub type IndexResult<T> = Result<T, IndexError>;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("owner index {0} does not fit the wire form")]
    OwnerOutOfRange(usize),

    #[error("keys {0:?} and {1:?} share a digest but have different owners")]
    Collision(String, String),

    #[error("malformed {what}: {reason}")]
    Decode { what: &'static str, reason: String },
}

impl IndexError {
    pub(crate) fn decode(what: &'static str, reason: impl Into<String>) -> Self {
        IndexError::Decode {
            what,
            reason: reason.into(),
        }
    }
}
