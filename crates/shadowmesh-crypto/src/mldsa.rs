//! ML-DSA-87 post-quantum digital signatures (FIPS 204).
//!
//! Thin wrapper around the RustCrypto `ml-dsa` crate, mirroring
//! [`crate::signatures`]'s Ed25519 wrapper shape.
//!
//! The final FIPS 204 form of ML-DSA-87 signatures is 4627 bytes; earlier
//! Dilithium Round-3 drafts used 4595. This crate targets the final form
//! (see `DESIGN.md` for the resolved ambiguity).

use ml_dsa::{EncodedSigningKey, EncodedVerifyingKey, KeyGen, MlDsa87, Signature as MlDsaSignature};
use rand_core::{CryptoRng, RngCore};
use signature::{Signer, Verifier};
use zeroize::ZeroizeOnDrop;

use crate::CryptoError;

/// ML-DSA-87 public key size in bytes.
pub const PUBLIC_KEY_SIZE: usize = 2592;
/// ML-DSA-87 private key size in bytes.
pub const PRIVATE_KEY_SIZE: usize = 4864;
/// ML-DSA-87 signature size in bytes (final FIPS 204 form).
pub const SIGNATURE_SIZE: usize = 4627;

/// ML-DSA-87 signature.
#[derive(Clone)]
pub struct Signature(Box<[u8; SIGNATURE_SIZE]>);

/// ML-DSA-87 signing key (private).
#[derive(ZeroizeOnDrop)]
pub struct SigningKey(ml_dsa::SigningKey<MlDsa87>);

/// ML-DSA-87 verifying key (public).
#[derive(Clone)]
pub struct VerifyingKey(ml_dsa::VerifyingKey<MlDsa87>);

/// Generate a fresh ML-DSA-87 keypair.
pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> (SigningKey, VerifyingKey) {
    let kp = MlDsa87::key_gen(rng);
    (
        SigningKey(kp.signing_key().clone()),
        VerifyingKey(kp.verifying_key().clone()),
    )
}

impl SigningKey {
    /// Sign a message, producing a fixed-size ML-DSA-87 signature.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig: MlDsaSignature<MlDsa87> = self.0.sign(message);
        let mut bytes = Box::new([0u8; SIGNATURE_SIZE]);
        bytes.copy_from_slice(sig.encode().as_slice());
        Signature(bytes)
    }

    /// Derive the corresponding verifying key.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey(self.0.verifying_key())
    }

    /// Serialize to the fixed-size wire form.
    #[must_use]
    pub fn to_bytes(&self) -> Box<[u8; PRIVATE_KEY_SIZE]> {
        let encoded: EncodedSigningKey<MlDsa87> = self.0.encode();
        let mut out = Box::new([0u8; PRIVATE_KEY_SIZE]);
        out.copy_from_slice(encoded.as_slice());
        out
    }
}

impl VerifyingKey {
    /// Verify a signature on a message.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] if the signature does not
    /// authenticate the message under this key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        let sig = MlDsaSignature::<MlDsa87>::decode(signature.0.as_slice().into())
            .ok_or(CryptoError::InvalidSignature)?;
        self.0
            .verify(message, &sig)
            .map_err(|_| CryptoError::InvalidSignature)
    }

    /// Serialize to the fixed-size wire form.
    #[must_use]
    pub fn to_bytes(&self) -> Box<[u8; PUBLIC_KEY_SIZE]> {
        let encoded: EncodedVerifyingKey<MlDsa87> = self.0.encode();
        let mut out = Box::new([0u8; PUBLIC_KEY_SIZE]);
        out.copy_from_slice(encoded.as_slice());
        out
    }

    /// Parse from the fixed-size wire form.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the bytes do not decode
    /// to a valid ML-DSA-87 verifying key.
    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_SIZE]) -> Result<Self, CryptoError> {
        let encoded: EncodedVerifyingKey<MlDsa87> = (*bytes).into();
        Ok(Self(ml_dsa::VerifyingKey::<MlDsa87>::decode(&encoded)))
    }
}

impl Signature {
    /// Wrap raw signature bytes.
    #[must_use]
    pub fn from_bytes(bytes: Box<[u8; SIGNATURE_SIZE]>) -> Self {
        Self(bytes)
    }

    /// Raw signature bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }
}
