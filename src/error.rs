use crate::coap::message::CodecError;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum VillageError {
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Failed to reach resource: {0}")]
    Connect(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Write failed: {0}")]
    WriteFailure(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Method not allowed on {0}")]
    MethodNotAllowed(String),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Invalid threshold policy: {0}")]
    InvalidPolicy(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, VillageError>;
