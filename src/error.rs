/**
 * Engine errors
 * Every rejected operation surfaces one of these kinds to its caller
 */

use crate::types::Identity;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("identity {0} already has an active template")]
    AlreadyRegistered(Identity),

    #[error("identity {0} has no active template")]
    NotRegistered(Identity),

    #[error("attempt index {index} out of range for {identity} (length {length})")]
    IndexOutOfRange {
        identity: Identity,
        index: usize,
        length: usize,
    },

    #[error("decryption request {0} is unknown or already resolved")]
    InvalidRequest(u64),

    #[error("decryption proof rejected for request {0}")]
    InvalidProof(u64),

    #[error("{caller} is not allowed to {action}")]
    Unauthorized { caller: Identity, action: String },

    #[error("attempt {index} of {identity} is already resolved")]
    AlreadyResolved { identity: Identity, index: usize },

    #[error("coprocessor failure: {0}")]
    Coprocessor(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::AlreadyRegistered(_) => "already_registered",
            EngineError::NotRegistered(_) => "not_registered",
            EngineError::IndexOutOfRange { .. } => "index_out_of_range",
            EngineError::InvalidRequest(_) => "invalid_request",
            EngineError::InvalidProof(_) => "invalid_proof",
            EngineError::Unauthorized { .. } => "unauthorized",
            EngineError::AlreadyResolved { .. } => "already_resolved",
            EngineError::Coprocessor(_) => "coprocessor",
            EngineError::Config(_) => "config",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
