//! Cryptographic error types.

use thiserror::Error;

/// Errors that can occur during cryptographic operations.
///
/// Error messages never include key material or plaintext. A
/// [`CryptoError::DecryptionFailed`] deliberately does not say whether the
/// key was wrong or the ciphertext was corrupted; OAEP unpadding failures
/// must stay indistinguishable to avoid oracle leakage.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key generation failed (entropy source failure). Fatal, never retried.
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Key bytes did not parse as a PEM-encoded PKCS#1 private key.
    #[error("malformed key: {0}")]
    MalformedKey(String),

    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed: wrong key, corrupted or truncated ciphertext.
    #[error("decryption failed")]
    DecryptionFailed,
}
