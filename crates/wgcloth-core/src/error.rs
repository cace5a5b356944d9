//! Error kinds shared across the wgcloth crates.

use thiserror::Error;

/// Unified error type for the wgcloth engine.
///
/// Every fallible public operation in the engine returns [`ClothResult`].
#[derive(Debug, Error)]
pub enum ClothError {
    /// A missing entity, component, storage, or registered type.
    #[error("not found: {0}")]
    NotFound(String),

    /// A component was added to an entity that already carries it.
    #[error("duplicate: {0}")]
    Duplicate(String),

    /// A finalized structure was mutated (e.g. adding an edge to a built
    /// sparsity pattern).
    #[error("frozen: {0}")]
    Frozen(String),

    /// GPU adapter, device, or resource creation failed, or the driver
    /// surfaced a validation error.
    #[error("device error: {0}")]
    Device(String),

    /// A shader or asset file was not found or could not be read.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// WGSL parsing or validation failed.
    #[error("shader error in `{path}`: {message}")]
    Shader {
        /// Path of the offending shader file.
        path: String,
        /// Parser or validator diagnostic.
        message: String,
    },

    /// A transaction-discipline violation, e.g. beginning a transaction while
    /// another one is active.
    #[error("concurrency violation: {0}")]
    Concurrency(String),
}

/// Convenience alias for `Result<T, ClothError>`.
pub type ClothResult<T> = Result<T, ClothError>;
