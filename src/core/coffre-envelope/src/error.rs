//! Envelope engine error types.

use std::path::PathBuf;

use thiserror::Error;

use coffre_crypto::CryptoError;

/// Errors that can occur in the Envelope Engine.
///
/// None of these are transient; the engine performs no retries. Messages
/// carry the key version and failing stage for logging but never key
/// material or plaintext.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// No key file exists for the requested version. The expected outcome
    /// when a caller references a version that was never provisioned.
    #[error("encryption key file not found for version {version}: {path}")]
    KeyFileNotFound {
        /// Requested key version.
        version: i64,
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configured master key cannot unwrap this key file.
    #[error("master key cannot decrypt encryption key version {version}")]
    MasterKeyMismatch {
        /// Key version whose file failed to decrypt.
        version: i64,
        /// Underlying decryption error.
        #[source]
        source: CryptoError,
    },

    /// The key file decrypted but its plaintext is not a valid key.
    #[error("malformed encryption key version {version}")]
    MalformedKey {
        /// Key version whose plaintext failed to parse.
        version: i64,
        /// Underlying parse error.
        #[source]
        source: CryptoError,
    },

    /// Generating a fresh data key failed. Fatal, never retried.
    #[error("data key generation failed")]
    DataKeyGeneration(#[source] CryptoError),

    /// An encrypt stage failed.
    #[error("encryption failed for key version {version} at stage: {stage}")]
    EncryptionFailed {
        /// Key version in use.
        version: i64,
        /// Which stage failed (payload or data key wrap).
        stage: &'static str,
        /// Underlying crypto error.
        #[source]
        source: CryptoError,
    },

    /// A decrypt stage failed. Wrong key, corrupted ciphertext, and
    /// truncated ciphertext surface identically.
    #[error("decryption failed for key version {version} at stage: {stage}")]
    DecryptionFailed {
        /// Key version in use.
        version: i64,
        /// Which stage failed (data key unwrap, data key parse, or payload).
        stage: &'static str,
        /// Underlying crypto error.
        #[source]
        source: CryptoError,
    },
}
