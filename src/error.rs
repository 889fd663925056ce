// Error taxonomy shared by every layer of the node

use crate::consensus::ValidationError;
use crate::core::{Hash256, OutPoint};
use thiserror::Error;

/// Conflicts with state the node already holds
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConflictError {
    /// Input already claimed by a pending mempool transaction
    #[error("output {outpoint} already spent by pending transaction {spender}")]
    DoubleSpend { outpoint: OutPoint, spender: Hash256 },

    /// Mempool at capacity and the newcomer pays the lowest fee rate
    #[error("mempool full")]
    MempoolFull,

    /// Block already marked invalid earlier
    #[error("block {0} previously rejected")]
    KnownInvalid(Hash256),
}

/// Node error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// Bytes that do not parse into a well-formed value
    #[error("malformed data: {0}")]
    Malformed(String),

    /// Consensus rule violation
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Double-spend or duplicate
    #[error("conflict: {0}")]
    Conflict(#[from] ConflictError),

    /// Peer unreachable, timed out or misbehaving
    #[error("network error: {0}")]
    Network(String),

    /// Storage unavailable
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl NodeError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        NodeError::Malformed(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        NodeError::Network(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        NodeError::Persistence(msg.into())
    }

    /// Reason code sent back to peers in a `Reject` message
    pub fn reject_code(&self) -> RejectCode {
        match self {
            NodeError::Malformed(_) => RejectCode::Malformed,
            NodeError::Validation(_) => RejectCode::Invalid,
            NodeError::Conflict(_) => RejectCode::Conflict,
            NodeError::Network(_) => RejectCode::Network,
            NodeError::Persistence(_) => RejectCode::Internal,
        }
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Malformed(err.to_string())
    }
}

impl From<sled::Error> for NodeError {
    fn from(err: sled::Error) -> Self {
        NodeError::Persistence(err.to_string())
    }
}

/// Wire-level classification of a rejection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectCode {
    Malformed = 0x01,
    Invalid = 0x10,
    Conflict = 0x12,
    Network = 0x20,
    Internal = 0x40,
}

impl RejectCode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(RejectCode::Malformed),
            0x10 => Some(RejectCode::Invalid),
            0x12 => Some(RejectCode::Conflict),
            0x20 => Some(RejectCode::Network),
            0x40 => Some(RejectCode::Internal),
            _ => None,
        }
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_codes() {
        assert_eq!(NodeError::malformed("x").reject_code(), RejectCode::Malformed);
        assert_eq!(
            NodeError::from(ValidationError::InvalidProofOfWork).reject_code(),
            RejectCode::Invalid
        );
        assert_eq!(
            NodeError::from(ConflictError::MempoolFull).reject_code(),
            RejectCode::Conflict
        );
    }

    #[test]
    fn test_reject_code_byte_roundtrip() {
        for code in [
            RejectCode::Malformed,
            RejectCode::Invalid,
            RejectCode::Conflict,
            RejectCode::Network,
            RejectCode::Internal,
        ] {
            assert_eq!(RejectCode::from_byte(code as u8), Some(code));
        }
        assert_eq!(RejectCode::from_byte(0xee), None);
    }

    #[test]
    fn test_io_error_is_malformed() {
        let err: NodeError = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(matches!(err, NodeError::Malformed(_)));
    }
}
