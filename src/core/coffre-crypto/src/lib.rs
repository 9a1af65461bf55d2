//! # Coffre Crypto
//!
//! Core cryptographic primitives for Coffre.
//!
//! This crate provides the asymmetric primitive underneath the envelope
//! encryption engine:
//! - RSA-4096 keypair generation
//! - Chunked RSA-OAEP (SHA-512) encryption of arbitrary-length byte streams
//! - PEM/PKCS#1 serialization with stable round-tripping

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod keys;

pub use error::CryptoError;
pub use keys::{AsymmetricKey, RSA_KEY_BITS};
