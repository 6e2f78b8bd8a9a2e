//! Error types for id parsing.

use thiserror::Error;

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    /// The input string was empty.
    #[error("id is empty")]
    Empty,

    /// A machine id segment was not valid.
    #[error("invalid machine id {id:?}")]
    InvalidMachineId {
        /// The offending input.
        id: String,
    },

    /// A nonce was not in `machine-{authority}:{uuid}` form.
    #[error("invalid nonce {nonce:?}")]
    InvalidNonce {
        /// The offending input.
        nonce: String,
    },
}
