//! Controller error type.

use crate::manifest::ManifestError;
use crate::registry::RegistryError;
use crate::store::StoreError;

/// Errors surfaced to the operator.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),
}
