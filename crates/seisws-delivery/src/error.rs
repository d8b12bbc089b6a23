use seisws_types::ServiceError;
use thiserror::Error;

use crate::mseed::CodecError;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("archive read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed record: {0}")]
    Codec(#[from] CodecError),

    #[error("record source unavailable: {0}")]
    Source(String),

    #[error("fetch worker failed: {0}")]
    Worker(String),
}

impl From<DeliveryError> for ServiceError {
    fn from(err: DeliveryError) -> Self {
        ServiceError::SourceFailure(err.to_string())
    }
}
