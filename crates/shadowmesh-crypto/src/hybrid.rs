//! Hybrid post-quantum + classical key exchange and signatures (C2).
//!
//! Composes [`crate::mlkem`] with [`crate::x25519`] for key exchange, and
//! [`crate::mldsa`] with [`crate::signatures`] (Ed25519) for signatures.
//! Every operation here is a pure function over byte arrays; no I/O, no
//! global state.

use rand_core::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use zeroize::ZeroizeOnDrop;

use crate::{kdf, mldsa, mlkem, signatures, x25519, CryptoError};

/// Size of a [`PeerId`] in bytes.
pub const PEER_ID_SIZE: usize = 32;
/// Size of a hybrid KEM public key bundle (ML-KEM public || X25519 public).
pub const HYBRID_KEM_PUBLIC_KEY_SIZE: usize = mlkem::PUBLIC_KEY_SIZE + 32;
/// Size of a hybrid KEM ciphertext (ML-KEM ciphertext || ephemeral X25519 public).
pub const HYBRID_KEM_CIPHERTEXT_SIZE: usize = mlkem::CIPHERTEXT_SIZE + 32;
/// Size of a hybrid verify key bundle (ML-DSA public || Ed25519 public).
pub const HYBRID_VERIFY_KEY_SIZE: usize = mldsa::PUBLIC_KEY_SIZE + 32;
/// Size of a hybrid signature (ML-DSA signature || Ed25519 signature).
pub const HYBRID_SIGNATURE_SIZE: usize = mldsa::SIGNATURE_SIZE + 64;

const HYBRID_KEX_SALT: &[u8] = b"shadowmesh-hybrid-kex";
const HYBRID_KEX_INFO: &[u8] = b"ShadowMesh-v1-Hybrid-KEM";

/// 32-byte peer identifier: `SHA-256(ML-DSA-public || Ed25519-public)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PeerId([u8; PEER_ID_SIZE]);

impl PeerId {
    /// Derive a `PeerId` from a peer's verify-key bundle.
    #[must_use]
    pub fn derive(ml_dsa_public: &[u8; mldsa::PUBLIC_KEY_SIZE], ed25519_public: &[u8; 32]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(ml_dsa_public);
        hasher.update(ed25519_public);
        let digest = hasher.finalize();
        let mut out = [0u8; PEER_ID_SIZE];
        out.copy_from_slice(&digest);
        Self(out)
    }

    /// Raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; PEER_ID_SIZE] {
        &self.0
    }

    /// Wrap raw bytes (e.g. received over the wire).
    #[must_use]
    pub fn from_bytes(bytes: [u8; PEER_ID_SIZE]) -> Self {
        Self(bytes)
    }
}

/// A peer's long-lived identity keypair: KEM + signature material.
///
/// Held by the local endpoint only; the public projection is
/// [`HybridVerifyKey`] plus [`HybridKemPublicKey`].
#[derive(ZeroizeOnDrop)]
pub struct HybridKeypair {
    ml_kem: mlkem::DecapsulationKey,
    #[zeroize(skip)]
    ml_kem_public: mlkem::EncapsulationKey,
    x25519: x25519::PrivateKey,
    ml_dsa: mldsa::SigningKey,
    ed25519: signatures::SigningKey,
    /// Creation time, seconds since Unix epoch. Metadata only; callers may
    /// override expiry policy.
    pub created_at: u64,
    /// Suggested expiry, seconds since Unix epoch (`created_at + 300`).
    pub expires_at: u64,
}

/// Public KEM bundle: ML-KEM-1024 public key || X25519 public key.
#[derive(Clone)]
pub struct HybridKemPublicKey {
    /// ML-KEM-1024 encapsulation key.
    pub ml_kem_public: mlkem::EncapsulationKey,
    /// X25519 public key.
    pub x25519_public: x25519::PublicKey,
}

/// Public verify-key bundle: ML-DSA-87 public key || Ed25519 public key.
#[derive(Clone)]
pub struct HybridVerifyKey {
    /// ML-DSA-87 verifying key.
    pub ml_dsa_public: mldsa::VerifyingKey,
    /// Ed25519 verifying key.
    pub ed25519_public: signatures::VerifyingKey,
}

/// Hybrid KEM ciphertext: ML-KEM ciphertext || fresh ephemeral X25519 public key.
#[derive(Clone)]
pub struct HybridCiphertext {
    ml_kem_ct: mlkem::Ciphertext,
    x25519_ephemeral_public: x25519::PublicKey,
}

/// Combined hybrid shared secret, 32 bytes, already passed through HKDF.
#[derive(ZeroizeOnDrop)]
pub struct HybridSharedSecret(pub(crate) [u8; 32]);

/// Hybrid signature: ML-DSA-87 signature || Ed25519 signature.
#[derive(Clone)]
pub struct HybridSignature {
    ml_dsa_sig: mldsa::Signature,
    ed25519_sig: signatures::Signature,
}

/// Generate a fresh hybrid keypair (KEM + signature material).
pub fn generate_hybrid_keypair<R: RngCore + CryptoRng>(rng: &mut R, now_unix: u64) -> HybridKeypair {
    let kem = mlkem::generate(rng);
    let x25519_sk = x25519::PrivateKey::generate(rng);
    let (ml_dsa_sk, _) = mldsa::generate(rng);
    let ed25519_sk = signatures::SigningKey::generate(rng);
    HybridKeypair {
        ml_kem: kem.decapsulation_key,
        ml_kem_public: kem.encapsulation_key,
        x25519: x25519_sk,
        ml_dsa: ml_dsa_sk,
        ed25519: ed25519_sk,
        created_at: now_unix,
        expires_at: now_unix + 300,
    }
}

impl HybridKeypair {
    /// Public KEM bundle, shared with peers so they can encapsulate to us.
    #[must_use]
    pub fn kem_public_key(&self) -> HybridKemPublicKey {
        HybridKemPublicKey {
            ml_kem_public: self.ml_kem_public.clone(),
            x25519_public: self.x25519.public_key(),
        }
    }

    /// Public verify-key bundle, used by peers to authenticate our signatures.
    #[must_use]
    pub fn verify_key(&self) -> HybridVerifyKey {
        HybridVerifyKey {
            ml_dsa_public: self.ml_dsa.verifying_key(),
            ed25519_public: self.ed25519.verifying_key(),
        }
    }

    /// This keypair's `PeerId`.
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.verify_key().peer_id()
    }

    /// Decapsulate a hybrid ciphertext addressed to this keypair, producing
    /// the combined 32-byte shared secret via HKDF-SHA256.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidCiphertext`] if either component
    /// ciphertext is malformed.
    pub fn decapsulate(&self, ct: &HybridCiphertext) -> Result<HybridSharedSecret, CryptoError> {
        let ml_kem_ss = self.ml_kem.decapsulate(&ct.ml_kem_ct)?;
        let x25519_ss = self
            .x25519
            .exchange(&ct.x25519_ephemeral_public)
            .ok_or(CryptoError::InvalidCiphertext)?;
        combine_shared_secrets(ml_kem_ss.as_bytes(), x25519_ss.as_bytes())
    }

    /// Sign `message` with both component signing keys.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> HybridSignature {
        HybridSignature {
            ml_dsa_sig: self.ml_dsa.sign(message),
            ed25519_sig: self.ed25519.sign(message),
        }
    }
}

impl HybridKemPublicKey {
    /// Encapsulate a fresh shared secret to this public key. A fresh X25519
    /// ephemeral keypair is generated per call, so ciphertexts against the
    /// same public key are never repeated.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] on an underlying KEM
    /// failure (practically unreachable for a well-formed key).
    pub fn encapsulate<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
    ) -> Result<(HybridCiphertext, HybridSharedSecret), CryptoError> {
        let (ml_kem_ct, ml_kem_ss) = self.ml_kem_public.encapsulate(rng)?;
        let ephemeral_sk = x25519::PrivateKey::generate(rng);
        let x25519_ss = ephemeral_sk
            .exchange(&self.x25519_public)
            .ok_or(CryptoError::InvalidCiphertext)?;
        let shared = combine_shared_secrets(ml_kem_ss.as_bytes(), x25519_ss.as_bytes())?;
        let ct = HybridCiphertext {
            ml_kem_ct,
            x25519_ephemeral_public: ephemeral_sk.public_key(),
        };
        Ok((ct, shared))
    }

    /// Encode to the fixed-size wire form.
    #[must_use]
    pub fn to_bytes(&self) -> Box<[u8; HYBRID_KEM_PUBLIC_KEY_SIZE]> {
        let mut out = Box::new([0u8; HYBRID_KEM_PUBLIC_KEY_SIZE]);
        out[..mlkem::PUBLIC_KEY_SIZE].copy_from_slice(&self.ml_kem_public.to_bytes());
        out[mlkem::PUBLIC_KEY_SIZE..].copy_from_slice(self.x25519_public.as_bytes());
        out
    }

    /// Decode from the fixed-size wire form.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the ML-KEM component
    /// does not decode.
    pub fn from_bytes(bytes: &[u8; HYBRID_KEM_PUBLIC_KEY_SIZE]) -> Result<Self, CryptoError> {
        let mut ml_kem_bytes = [0u8; mlkem::PUBLIC_KEY_SIZE];
        ml_kem_bytes.copy_from_slice(&bytes[..mlkem::PUBLIC_KEY_SIZE]);
        let mut x25519_bytes = [0u8; 32];
        x25519_bytes.copy_from_slice(&bytes[mlkem::PUBLIC_KEY_SIZE..]);
        Ok(Self {
            ml_kem_public: mlkem::EncapsulationKey::from_bytes(&ml_kem_bytes)?,
            x25519_public: x25519::PublicKey::from_bytes(x25519_bytes),
        })
    }
}

impl HybridVerifyKey {
    /// This verify key's `PeerId`.
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        PeerId::derive(
            self.ml_dsa_public.to_bytes().as_ref(),
            &self.ed25519_public.to_bytes(),
        )
    }

    /// Verify a hybrid signature. Both component signatures must validate.
    pub fn verify(&self, message: &[u8], signature: &HybridSignature) -> bool {
        self.ml_dsa_public
            .verify(message, &signature.ml_dsa_sig)
            .is_ok()
            && self
                .ed25519_public
                .verify(message, &signature.ed25519_sig)
                .is_ok()
    }

    /// Encode to the fixed-size wire form.
    #[must_use]
    pub fn to_bytes(&self) -> Box<[u8; HYBRID_VERIFY_KEY_SIZE]> {
        let mut out = vec![0u8; HYBRID_VERIFY_KEY_SIZE].into_boxed_slice();
        out[..mldsa::PUBLIC_KEY_SIZE].copy_from_slice(self.ml_dsa_public.to_bytes().as_ref());
        out[mldsa::PUBLIC_KEY_SIZE..].copy_from_slice(&self.ed25519_public.to_bytes());
        out.try_into().expect("fixed-size buffer")
    }
}

impl HybridCiphertext {
    /// Encode to the fixed-size wire form.
    #[must_use]
    pub fn to_bytes(&self) -> Box<[u8; HYBRID_KEM_CIPHERTEXT_SIZE]> {
        let mut out = vec![0u8; HYBRID_KEM_CIPHERTEXT_SIZE].into_boxed_slice();
        out[..mlkem::CIPHERTEXT_SIZE].copy_from_slice(self.ml_kem_ct.as_bytes());
        out[mlkem::CIPHERTEXT_SIZE..].copy_from_slice(self.x25519_ephemeral_public.as_bytes());
        out.try_into().expect("fixed-size buffer")
    }

    /// Decode from the fixed-size wire form.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; HYBRID_KEM_CIPHERTEXT_SIZE]) -> Self {
        let mut ml_kem_bytes = [0u8; mlkem::CIPHERTEXT_SIZE];
        ml_kem_bytes.copy_from_slice(&bytes[..mlkem::CIPHERTEXT_SIZE]);
        let mut x25519_bytes = [0u8; 32];
        x25519_bytes.copy_from_slice(&bytes[mlkem::CIPHERTEXT_SIZE..]);
        Self {
            ml_kem_ct: mlkem::Ciphertext::from_bytes(ml_kem_bytes),
            x25519_ephemeral_public: x25519::PublicKey::from_bytes(x25519_bytes),
        }
    }
}

impl HybridSharedSecret {
    /// Raw 32-byte combined secret. Feed into session-key HKDF only.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl HybridSignature {
    /// Encode to the fixed-size wire form.
    #[must_use]
    pub fn to_bytes(&self) -> Box<[u8; HYBRID_SIGNATURE_SIZE]> {
        let mut out = vec![0u8; HYBRID_SIGNATURE_SIZE].into_boxed_slice();
        out[..mldsa::SIGNATURE_SIZE].copy_from_slice(self.ml_dsa_sig.as_bytes());
        out[mldsa::SIGNATURE_SIZE..].copy_from_slice(self.ed25519_sig.as_bytes());
        out.try_into().expect("fixed-size buffer")
    }

    /// Decode from the fixed-size wire form.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; HYBRID_SIGNATURE_SIZE]) -> Self {
        let mut ml_dsa_bytes = Box::new([0u8; mldsa::SIGNATURE_SIZE]);
        ml_dsa_bytes.copy_from_slice(&bytes[..mldsa::SIGNATURE_SIZE]);
        let mut ed25519_bytes = [0u8; 64];
        ed25519_bytes.copy_from_slice(&bytes[mldsa::SIGNATURE_SIZE..]);
        Self {
            ml_dsa_sig: mldsa::Signature::from_bytes(ml_dsa_bytes),
            ed25519_sig: signatures::Signature::from_bytes(ed25519_bytes),
        }
    }
}

fn combine_shared_secrets(
    ml_kem_ss: &[u8; 32],
    x25519_ss: &[u8; 32],
) -> Result<HybridSharedSecret, CryptoError> {
    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(ml_kem_ss);
    ikm[32..].copy_from_slice(x25519_ss);
    let secret = kdf::hkdf_sha256_32(&ikm, HYBRID_KEX_SALT, HYBRID_KEX_INFO)?;
    Ok(HybridSharedSecret(secret))
}

/// Free function form of [`HybridVerifyKey::verify`], for callers that only
/// hold the decoded signature and verify key (matches the shape described
/// in component design).
#[must_use]
pub fn hybrid_verify(
    message: &[u8],
    signature: &HybridSignature,
    verify_key: &HybridVerifyKey,
) -> bool {
    verify_key.verify(message, signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn encapsulate_decapsulate_agree() {
        let alice = generate_hybrid_keypair(&mut OsRng, 1_000);
        let bob = generate_hybrid_keypair(&mut OsRng, 1_000);

        let (ct, ss_sender) = bob.kem_public_key().encapsulate(&mut OsRng).unwrap();
        let ss_receiver = bob.decapsulate(&ct).unwrap();
        assert_eq!(ss_sender.as_bytes(), ss_receiver.as_bytes());

        let _ = alice; // alice unused beyond being a distinct peer in this test
    }

    #[test]
    fn ciphertexts_are_fresh_across_calls() {
        let bob = generate_hybrid_keypair(&mut OsRng, 1_000);
        let pk = bob.kem_public_key();
        let (ct1, _) = pk.encapsulate(&mut OsRng).unwrap();
        let (ct2, _) = pk.encapsulate(&mut OsRng).unwrap();
        assert_ne!(ct1.to_bytes(), ct2.to_bytes());
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let kp = generate_hybrid_keypair(&mut OsRng, 1_000);
        let msg = b"hello peer";
        let sig = kp.sign(msg);
        assert!(hybrid_verify(msg, &sig, &kp.verify_key()));
    }

    #[test]
    fn tampered_signature_fails() {
        let kp = generate_hybrid_keypair(&mut OsRng, 1_000);
        let msg = b"hello peer";
        let mut sig_bytes = kp.sign(msg).to_bytes();
        sig_bytes[0] ^= 0xFF;
        let tampered = HybridSignature::from_bytes(&sig_bytes);
        assert!(!hybrid_verify(msg, &tampered, &kp.verify_key()));
    }

    #[test]
    fn ciphertext_round_trips_through_wire_bytes() {
        let kp = generate_hybrid_keypair(&mut OsRng, 1_000);
        let (ct, _) = kp.kem_public_key().encapsulate(&mut OsRng).unwrap();
        let bytes = ct.to_bytes();
        let restored = HybridCiphertext::from_bytes(&bytes);
        assert_eq!(kp.decapsulate(&ct).unwrap().as_bytes(), kp.decapsulate(&restored).unwrap().as_bytes());
    }

    #[test]
    fn peer_id_is_stable_for_same_verify_key() {
        let kp = generate_hybrid_keypair(&mut OsRng, 1_000);
        assert_eq!(kp.peer_id(), kp.verify_key().peer_id());
    }
}
