use shared::error::{FailureClass, RemoteError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("local store failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl SyncError {
    pub fn class(&self) -> FailureClass {
        match self {
            SyncError::Remote(err) => err.class(),
            SyncError::Storage(_) => FailureClass::FatalLocalStorage,
        }
    }
}
