//! Error types for ponderar
//!
//! One central error enum, returned by every fallible operation in the
//! crate. Allocation sizing overflow is deliberately *not* an error: per the
//! allocator contract it yields an empty buffer the caller can test for.

use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, PonderarError>;

/// Errors surfaced by allocation, weight storage, and the blob store.
///
/// `FileNotFound` and `UnsupportedWeightType` are operator configuration
/// errors: callers normally treat them as fatal. Everything else is
/// recoverable and surfaced to the immediate caller.
#[derive(Debug, Error)]
pub enum PonderarError {
    /// The weights file does not exist (operator configuration error)
    #[error("weights file '{path}' does not exist")]
    FileNotFound {
        /// Path that was probed
        path: PathBuf,
    },

    /// Weight type tag outside the closed set {F32, Bf16, Sfp8, Nuq4}
    #[error("unsupported weight type tag {tag}")]
    UnsupportedWeightType {
        /// The offending wire tag
        tag: u8,
    },

    /// Structural header of the blob store is missing or malformed
    #[error("malformed blob header: {reason}")]
    MalformedHeader {
        /// What failed to parse
        reason: String,
    },

    /// Config section present but internally inconsistent
    #[error("bad model config: {reason}")]
    BadConfig {
        /// Which invariant the config violates
        reason: String,
    },

    /// Tokenizer section present but unreadable
    #[error("bad tokenizer section: {reason}")]
    BadTokenizer {
        /// Why the section could not be read
        reason: String,
    },

    /// A named tensor payload could not be read
    #[error("failed reading tensor '{name}': {reason}")]
    TensorPayload {
        /// Tensor name from the directory
        name: String,
        /// Underlying failure
        reason: String,
    },

    /// A tensor named in the traversal is absent from the file
    #[error("tensor '{name}' missing from blob store")]
    MissingTensor {
        /// Tensor name from the traversal
        name: String,
    },

    /// Legacy scale list length does not match the config's expectation.
    /// Never silently rounded or truncated.
    #[error("scale list has {actual} entries, config expects {expected}")]
    ScaleCountMismatch {
        /// `ModelConfig::num_tensor_scales`
        expected: usize,
        /// Entries actually present in the file
        actual: usize,
    },

    /// NUMA bind syscall failed; the region is still usable, just unbound
    #[error("failed to bind {bytes} bytes to node {node}: errno {errno}")]
    BindFailed {
        /// Target NUMA node
        node: usize,
        /// Region size
        bytes: usize,
        /// OS error code
        errno: i32,
    },

    /// Generic I/O failure (open, read, write, mmap)
    #[error("I/O error: {message}")]
    Io {
        /// Description including the path where relevant
        message: String,
    },
}

impl From<std::io::Error> for PonderarError {
    fn from(e: std::io::Error) -> Self {
        PonderarError::Io {
            message: e.to_string(),
        }
    }
}
