//! # Coffre Envelope Engine
//!
//! Envelope encryption with a three-tier asymmetric key hierarchy:
//!
//! - **Master Key**: supplied at process start, protects every Encryption Key.
//! - **Encryption Key**: one RSA keypair per integer version, persisted as
//!   `encryption_key_v_<N>.pem` encrypted under the Master Key, loaded lazily
//!   and cached for the process lifetime.
//! - **Data Key**: a fresh RSA keypair generated per encrypted payload, never
//!   persisted on its own. Its only durable form is a [`DataKeyRef`]: its
//!   serialization encrypted under the matching Encryption Key, stored by the
//!   caller alongside the ciphertext.
//!
//! ## Operational limitations
//!
//! Cached Encryption Keys are never refreshed or evicted; rotating a
//! compromised key out of service requires a process restart with new
//! configuration. New secrets should be written under the newest version,
//! old versions stay readable indefinitely.
//!
//! Data keys are full RSA-4096 keypairs, so every `encrypt` call pays a
//! keypair generation — orders of magnitude slower than a symmetric data
//! key. Ciphertext shapes (modulus-sized blocks) and key-ref contents are
//! compatibility surface for already-persisted data; do not substitute a
//! symmetric scheme here.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;

pub use error::EnvelopeError;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroizing;

use coffre_crypto::AsymmetricKey;

/// Identifies which Encryption Key generation wrapped a data key.
pub type KeyVersion = i64;

/// Builds the on-disk path of one Encryption Key version.
pub fn key_file_path(key_dir: &Path, version: KeyVersion) -> PathBuf {
    key_dir.join(format!("encryption_key_v_{version}.pem"))
}

// ============================================================================
// Types
// ============================================================================

/// Durable reference to the data key that encrypted one payload.
///
/// Callers persist this next to the ciphertext and hand it back verbatim to
/// [`EnvelopeEngine::decrypt`]. The version field is load-bearing: a
/// mismatched version decrypts garbage or fails outright.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataKeyRef {
    /// Encryption Key version that wrapped the data key.
    pub version: KeyVersion,
    /// The serialized data key, encrypted under that Encryption Key.
    pub encrypted_key: Vec<u8>,
}

// ============================================================================
// Key Version Manager
// ============================================================================

/// One Encryption Key version, fully materialized through the Master Key.
///
/// Immutable once built: nothing mutates or refreshes the held key.
pub struct KeyVersionManager {
    version: KeyVersion,
    key: AsymmetricKey,
}

impl KeyVersionManager {
    /// Reads, unwraps, and parses the key file for `version`.
    ///
    /// # Errors
    ///
    /// - [`EnvelopeError::KeyFileNotFound`] if the version was never
    ///   provisioned.
    /// - [`EnvelopeError::MasterKeyMismatch`] if the master key cannot
    ///   decrypt the file (wrong master key for this deployment).
    /// - [`EnvelopeError::MalformedKey`] if the decrypted bytes are not a
    ///   valid PEM/PKCS#1 key.
    pub fn load(
        version: KeyVersion,
        key_dir: &Path,
        master_key: &AsymmetricKey,
    ) -> Result<Self, EnvelopeError> {
        let path = key_file_path(key_dir, version);

        let wrapped = std::fs::read(&path).map_err(|source| EnvelopeError::KeyFileNotFound {
            version,
            path: path.clone(),
            source,
        })?;

        let raw_key = master_key
            .decrypt(&wrapped)
            .map_err(|source| EnvelopeError::MasterKeyMismatch { version, source })?;

        let key = AsymmetricKey::from_pem(&raw_key)
            .map_err(|source| EnvelopeError::MalformedKey { version, source })?;

        debug!(version, path = %path.display(), "encryption key loaded");

        Ok(Self { version, key })
    }

    /// The version this manager materializes.
    pub fn version(&self) -> KeyVersion {
        self.version
    }

    /// Encrypts under this version's Encryption Key.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, coffre_crypto::CryptoError> {
        self.key.encrypt(plaintext)
    }

    /// Decrypts under this version's Encryption Key.
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, coffre_crypto::CryptoError> {
        self.key.decrypt(ciphertext)
    }
}

// ============================================================================
// Envelope Engine
// ============================================================================

/// The Envelope Engine turns plaintext into ciphertext plus a recoverable
/// key reference, and back.
///
/// One instance is shared by all request handlers. Construction performs no
/// I/O; each Encryption Key version loads on first use and stays cached for
/// the life of the instance.
pub struct EnvelopeEngine {
    key_dir: PathBuf,
    master_key: AsymmetricKey,
    managers: Mutex<HashMap<KeyVersion, Arc<KeyVersionManager>>>,
}

impl EnvelopeEngine {
    /// Creates an engine over `key_dir` with the given master key.
    pub fn new(key_dir: impl Into<PathBuf>, master_key: AsymmetricKey) -> Self {
        let key_dir = key_dir.into();
        info!(key_dir = %key_dir.display(), "envelope engine initialized");

        Self {
            key_dir,
            master_key,
            managers: Mutex::new(HashMap::new()),
        }
    }

    /// Gets the manager for `version`, loading and caching it on first use.
    ///
    /// Lookup-or-insert runs under one lock so concurrent first use of the
    /// same version reads the key file exactly once.
    fn manager(&self, version: KeyVersion) -> Result<Arc<KeyVersionManager>, EnvelopeError> {
        let mut managers = self
            .managers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if let Some(manager) = managers.get(&version) {
            return Ok(Arc::clone(manager));
        }

        let manager = Arc::new(KeyVersionManager::load(
            version,
            &self.key_dir,
            &self.master_key,
        )?);
        managers.insert(version, Arc::clone(&manager));

        Ok(manager)
    }

    /// Encrypts `plaintext` under a fresh data key wrapped by `version`.
    ///
    /// Returns the ciphertext and the [`DataKeyRef`] the caller must persist
    /// alongside it. The data key is used for exactly this payload and is
    /// discarded here.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        version: KeyVersion,
    ) -> Result<(Vec<u8>, DataKeyRef), EnvelopeError> {
        let manager = self.manager(version)?;

        let data_key = AsymmetricKey::generate().map_err(EnvelopeError::DataKeyGeneration)?;

        let ciphertext = data_key
            .encrypt(plaintext)
            .map_err(|source| EnvelopeError::EncryptionFailed {
                version,
                stage: "payload",
                source,
            })?;

        let raw_data_key = data_key
            .to_pem()
            .map_err(|source| EnvelopeError::EncryptionFailed {
                version,
                stage: "data key serialization",
                source,
            })?;

        let encrypted_key =
            manager
                .encrypt(&raw_data_key)
                .map_err(|source| EnvelopeError::EncryptionFailed {
                    version,
                    stage: "data key wrap",
                    source,
                })?;

        debug!(
            version,
            plaintext_len = plaintext.len(),
            ciphertext_len = ciphertext.len(),
            "payload encrypted"
        );

        Ok((
            ciphertext,
            DataKeyRef {
                version,
                encrypted_key,
            },
        ))
    }

    /// Recovers the data key named by `data_key_ref` and decrypts
    /// `ciphertext` with it.
    ///
    /// Every stage failure surfaces as [`EnvelopeError::DecryptionFailed`]
    /// (or a key-loading error); partial results are never returned.
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        data_key_ref: &DataKeyRef,
    ) -> Result<Zeroizing<Vec<u8>>, EnvelopeError> {
        let version = data_key_ref.version;
        let manager = self.manager(version)?;

        let raw_data_key = manager.decrypt(&data_key_ref.encrypted_key).map_err(|source| {
            EnvelopeError::DecryptionFailed {
                version,
                stage: "data key unwrap",
                source,
            }
        })?;

        let data_key =
            AsymmetricKey::from_pem(&raw_data_key).map_err(|source| {
                EnvelopeError::DecryptionFailed {
                    version,
                    stage: "data key parse",
                    source,
                }
            })?;

        data_key
            .decrypt(ciphertext)
            .map_err(|source| EnvelopeError::DecryptionFailed {
                version,
                stage: "payload",
                source,
            })
    }
}

impl std::fmt::Debug for EnvelopeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeEngine")
            .field("key_dir", &self.key_dir)
            .field("master_key", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use std::sync::OnceLock;
    use tempfile::TempDir;

    /// RSA-4096 generation is slow, so tests share fixed keys and only the
    /// engine's own data keys are generated per call.
    fn master_key() -> &'static AsymmetricKey {
        static KEY: OnceLock<AsymmetricKey> = OnceLock::new();
        KEY.get_or_init(|| AsymmetricKey::generate().unwrap())
    }

    fn encryption_key() -> &'static AsymmetricKey {
        static KEY: OnceLock<AsymmetricKey> = OnceLock::new();
        KEY.get_or_init(|| AsymmetricKey::generate().unwrap())
    }

    /// Writes `key` as version `version`, wrapped under `wrapping_key`.
    fn provision(
        dir: &Path,
        version: KeyVersion,
        key: &AsymmetricKey,
        wrapping_key: &AsymmetricKey,
    ) {
        let pem = key.to_pem().unwrap();
        let wrapped = wrapping_key.encrypt(&pem).unwrap();
        std::fs::write(key_file_path(dir, version), wrapped).unwrap();
    }

    fn engine_with_v1() -> (TempDir, EnvelopeEngine) {
        let tmp = TempDir::new().unwrap();
        provision(tmp.path(), 1, encryption_key(), master_key());
        let engine = EnvelopeEngine::new(tmp.path(), master_key().clone());
        (tmp, engine)
    }

    #[test]
    fn test_envelope_roundtrip() {
        let (_tmp, engine) = engine_with_v1();

        let (ciphertext, key_ref) = engine.encrypt(b"plain text", 1).unwrap();

        assert_eq!(key_ref.version, 1);
        assert_eq!(ciphertext.len() % 512, 0);
        assert_ne!(ciphertext, b"plain text");

        let plaintext = engine.decrypt(&ciphertext, &key_ref).unwrap();
        assert_eq!(&*plaintext, b"plain text");

        // Same directory and master key, fresh instance: still decrypts.
        let other = EnvelopeEngine::new(_tmp.path(), master_key().clone());
        assert_eq!(&*other.decrypt(&ciphertext, &key_ref).unwrap(), b"plain text");

        // No file for version 2.
        let result = engine.encrypt(b"plain text", 2);
        assert!(matches!(
            result,
            Err(EnvelopeError::KeyFileNotFound { version: 2, .. })
        ));
    }

    #[test]
    fn test_manager_delegates_to_held_key() {
        let tmp = TempDir::new().unwrap();
        provision(tmp.path(), 3, encryption_key(), master_key());

        let manager = KeyVersionManager::load(3, tmp.path(), master_key()).unwrap();
        assert_eq!(manager.version(), 3);

        let ciphertext = manager.encrypt(b"held key").unwrap();
        assert_eq!(&*manager.decrypt(&ciphertext).unwrap(), b"held key");
        // The held key is the provisioned one, not the master key.
        assert_eq!(
            &*encryption_key().decrypt(&ciphertext).unwrap(),
            b"held key"
        );
    }

    #[test]
    fn test_empty_payload() {
        let (_tmp, engine) = engine_with_v1();

        let (ciphertext, key_ref) = engine.encrypt(b"", 1).unwrap();
        assert!(ciphertext.is_empty());
        assert!(engine.decrypt(&ciphertext, &key_ref).unwrap().is_empty());
    }

    #[test]
    fn test_data_key_fresh_per_call() {
        let (_tmp, engine) = engine_with_v1();

        let (ct1, ref1) = engine.encrypt(b"same payload", 1).unwrap();
        let (ct2, ref2) = engine.encrypt(b"same payload", 1).unwrap();

        assert_ne!(ref1.encrypted_key, ref2.encrypted_key);
        assert_ne!(ct1, ct2);
    }

    #[test]
    fn test_missing_key_file() {
        let tmp = TempDir::new().unwrap();
        let engine = EnvelopeEngine::new(tmp.path(), master_key().clone());

        let err = engine.encrypt(b"data", 7).unwrap_err();
        match err {
            EnvelopeError::KeyFileNotFound { version, path, .. } => {
                assert_eq!(version, 7);
                assert_eq!(path, tmp.path().join("encryption_key_v_7.pem"));
            },
            other => panic!("expected KeyFileNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_wrong_master_key() {
        let tmp = TempDir::new().unwrap();
        // File wrapped by a key that is not this engine's master key.
        provision(tmp.path(), 1, encryption_key(), encryption_key());

        let engine = EnvelopeEngine::new(tmp.path(), master_key().clone());
        let result = engine.encrypt(b"data", 1);

        assert!(matches!(
            result,
            Err(EnvelopeError::MasterKeyMismatch { version: 1, .. })
        ));
    }

    #[test]
    fn test_malformed_key_file() {
        let tmp = TempDir::new().unwrap();
        let wrapped = master_key().encrypt(b"not a pem key at all").unwrap();
        std::fs::write(key_file_path(tmp.path(), 1), wrapped).unwrap();

        let engine = EnvelopeEngine::new(tmp.path(), master_key().clone());
        let result = engine.encrypt(b"data", 1);

        assert!(matches!(
            result,
            Err(EnvelopeError::MalformedKey { version: 1, .. })
        ));
    }

    #[test]
    fn test_version_isolation() {
        let tmp = TempDir::new().unwrap();
        provision(tmp.path(), 1, encryption_key(), master_key());
        // Version 2 holds a different encryption key.
        provision(tmp.path(), 2, master_key(), master_key());

        let engine = EnvelopeEngine::new(tmp.path(), master_key().clone());
        let (ciphertext, key_ref) = engine.encrypt(b"versioned", 1).unwrap();

        let mismatched = DataKeyRef {
            version: 2,
            encrypted_key: key_ref.encrypted_key.clone(),
        };
        let result = engine.decrypt(&ciphertext, &mismatched);

        assert!(matches!(
            result,
            Err(EnvelopeError::DecryptionFailed { version: 2, .. })
        ));
    }

    #[test]
    fn test_tampered_ciphertext() {
        let (_tmp, engine) = engine_with_v1();

        let (mut ciphertext, key_ref) = engine.encrypt(b"tamper target", 1).unwrap();
        ciphertext[42] ^= 0xFF;

        let result = engine.decrypt(&ciphertext, &key_ref);
        assert!(matches!(
            result,
            Err(EnvelopeError::DecryptionFailed { version: 1, .. })
        ));
    }

    #[test]
    fn test_tampered_encrypted_key() {
        let (_tmp, engine) = engine_with_v1();

        let (ciphertext, mut key_ref) = engine.encrypt(b"tamper target", 1).unwrap();
        key_ref.encrypted_key[0] ^= 0xFF;

        let result = engine.decrypt(&ciphertext, &key_ref);
        assert!(matches!(
            result,
            Err(EnvelopeError::DecryptionFailed { version: 1, .. })
        ));
    }

    #[test]
    fn test_construction_does_no_io() {
        // Nonexistent directory is fine until a version is actually used.
        let engine = EnvelopeEngine::new("/does/not/exist", master_key().clone());
        let result = engine.encrypt(b"data", 1);
        assert!(matches!(result, Err(EnvelopeError::KeyFileNotFound { .. })));
    }

    #[test]
    fn test_concurrent_first_use_loads_once() {
        let (_tmp, engine) = engine_with_v1();
        let engine = Arc::new(engine);

        let handles: Vec<_> = (0..3)
            .map(|i| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    let payload = format!("payload {i}");
                    let (ciphertext, key_ref) = engine.encrypt(payload.as_bytes(), 1).unwrap();
                    let plaintext = engine.decrypt(&ciphertext, &key_ref).unwrap();
                    assert_eq!(&*plaintext, payload.as_bytes());
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let managers = engine
            .managers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        assert_eq!(managers.len(), 1);
    }
}
