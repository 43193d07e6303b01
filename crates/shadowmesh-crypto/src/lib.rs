//! # ShadowMesh Crypto
//!
//! Hybrid post-quantum + classical cryptographic primitives for ShadowMesh.
//!
//! This crate provides:
//! - ML-KEM-1024 + X25519 hybrid key encapsulation
//! - ML-DSA-87 + Ed25519 hybrid digital signatures
//! - HKDF-SHA256 key derivation (hybrid secret combination, session keys)
//! - ChaCha20-Poly1305 per-direction frame AEAD
//! - Secure random number generation
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Notes |
//! |----------|-----------|-------|
//! | KEM (post-quantum) | ML-KEM-1024 | FIPS 203 |
//! | KEM (classical) | X25519 | fresh ephemeral per encapsulation |
//! | Signatures (post-quantum) | ML-DSA-87 | FIPS 204, 4627-byte signatures |
//! | Signatures (classical) | Ed25519 | deterministic |
//! | KDF | HKDF-SHA256 | hybrid-secret combination and session keys |
//! | AEAD | ChaCha20-Poly1305 | per-direction frame encryption |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod constant_time;
pub mod error;
pub mod hybrid;
pub mod kdf;
pub mod mldsa;
pub mod mlkem;
pub mod random;
pub mod session_keys;
pub mod signatures;
pub mod x25519;

pub use error::CryptoError;
pub use hybrid::{HybridCiphertext, HybridKeypair, HybridSignature, HybridVerifyKey, PeerId};

/// X25519 public key size
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

/// X25519 secret key size
pub const X25519_SECRET_KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 key size
pub const CHACHA_KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 nonce size
pub const CHACHA_NONCE_SIZE: usize = 12;

/// Ed25519 public key size
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 secret key size
pub const ED25519_SECRET_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const ED25519_SIGNATURE_SIZE: usize = 64;
