use thiserror::Error;

use crate::traits::usb_transport::TransportError;

/// Errors surfaced by the capture engine's public operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("malformed descriptor data: {0}")]
    DescriptorError(String),

    #[error("no suitable isochronous IN endpoint for the requested format")]
    NoSuitableEndpoint,

    #[error("configuration failed: {0}")]
    ConfigurationFailed(String),

    #[error("device programming failed: {0}")]
    ProgrammingFailed(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}
