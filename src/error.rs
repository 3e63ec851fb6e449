use thiserror::Error;

use crate::backend::BackendError;
use crate::config::ConfigError;
use crate::model::conversion::ConversionError;
use crate::model::RecordId;

/// View-level failures. Per-record write failures never surface here; they
/// are kept in the store's `failed` map instead.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Procedure {0} has not been saved yet")]
    Unsaved(RecordId),

    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

#[derive(Debug, Error)]
pub enum OtListError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
