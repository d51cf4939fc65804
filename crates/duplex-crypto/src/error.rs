//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Sealed payload shorter than nonce + tag
    #[error("sealed payload too short: {0} bytes")]
    Truncated(usize),

    /// Encoding or decoding of an inner record failed
    #[error("invalid message format: {0}")]
    InvalidMessage(String),

    /// Derived state was produced under a different call key
    #[error("derived state does not belong to this call key")]
    KeyMismatch,

    /// Derived state uses a format this build does not understand
    #[error("unsupported derived-state format {0}")]
    UnsupportedFormat(u8),

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,
}

impl From<bincode::Error> for CryptoError {
    fn from(err: bincode::Error) -> Self {
        CryptoError::InvalidMessage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CryptoError::InvalidKeyLength {
            expected: 256,
            actual: 12,
        };
        assert_eq!(err.to_string(), "invalid key length: expected 256, got 12");
        assert_eq!(
            CryptoError::UnsupportedFormat(9).to_string(),
            "unsupported derived-state format 9"
        );
    }
}
