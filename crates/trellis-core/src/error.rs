//! Error types for Trellis Core.

use thiserror::Error;

/// Core errors that can occur while building or decoding primitives.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid device key: {0}")]
    InvalidDeviceKey(String),

    #[error("invalid object key: {0}")]
    InvalidObjectKey(String),

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}
