use thiserror::Error;

use crate::domain::PayloadError;
use crate::ports::StoreError;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid payload: {0}")]
    Payload(#[from] PayloadError),

    #[error("invalid configuration: {0}")]
    Config(String),
}
