use thiserror::Error;

use crate::{backend::BackendError, storage::StoreError};

/// Top-level error taxonomy. Config errors are fatal at construction,
/// backend errors terminate the operation that required the external call,
/// store errors are fatal only on connect.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
