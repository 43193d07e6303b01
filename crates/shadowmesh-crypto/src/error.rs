//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
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

    /// Invalid nonce length
    #[error("invalid nonce length")]
    InvalidNonceLength,

    /// Hybrid KEM ciphertext malformed or wrong size
    #[error("invalid hybrid KEM ciphertext")]
    InvalidCiphertext,

    /// A component public key was malformed
    #[error("invalid public key")]
    InvalidPublicKey,

    /// A component signature was malformed (wrong length, bad encoding)
    #[error("invalid signature encoding")]
    InvalidSignature,

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,

    /// Nonce overflow (counter exhausted)
    #[error("nonce counter exhausted, rekey required")]
    NonceOverflow,
}
