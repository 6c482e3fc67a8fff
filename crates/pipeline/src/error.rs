use vidgen_core::error::CoreError;

use crate::store::StoreError;

/// Errors surfaced by coordinator and gateway operations.
///
/// Provider failures never show up here: they are classified into
/// [`vidgen_core::failure::ErrorKind`] and recorded on the run instead.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
