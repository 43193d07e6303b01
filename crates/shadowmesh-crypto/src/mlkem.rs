//! ML-KEM-1024 post-quantum key encapsulation (FIPS 203).
//!
//! Thin wrapper around the RustCrypto `ml-kem` crate, mirroring the shape
//! of [`crate::x25519`]: a decapsulation (private) key, an encapsulation
//! (public) key, and a shared secret, all fixed-size and zeroized on drop.

use ml_kem::kem::{Decapsulate, Encapsulate};
use ml_kem::{EncodedSizeUser, KemCore, MlKem1024};
use rand_core::{CryptoRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::CryptoError;

/// ML-KEM-1024 encapsulation (public) key size in bytes.
pub const PUBLIC_KEY_SIZE: usize = 1568;
/// ML-KEM-1024 decapsulation (private) key size in bytes.
pub const PRIVATE_KEY_SIZE: usize = 3168;
/// ML-KEM-1024 ciphertext size in bytes.
pub const CIPHERTEXT_SIZE: usize = 1568;
/// ML-KEM shared secret size in bytes.
pub const SHARED_SECRET_SIZE: usize = 32;

/// ML-KEM-1024 decapsulation key (private).
#[derive(ZeroizeOnDrop)]
pub struct DecapsulationKey(ml_kem::kem::DecapsulationKey<<MlKem1024 as KemCore>::Params>);

/// ML-KEM-1024 encapsulation key (public).
#[derive(Clone)]
pub struct EncapsulationKey(ml_kem::kem::EncapsulationKey<<MlKem1024 as KemCore>::Params>);

/// ML-KEM ciphertext produced by encapsulation.
#[derive(Clone)]
pub struct Ciphertext([u8; CIPHERTEXT_SIZE]);

/// Shared secret agreed by encapsulator and decapsulator.
#[derive(ZeroizeOnDrop, Zeroize)]
pub struct SharedSecret([u8; SHARED_SECRET_SIZE]);

/// A freshly generated ML-KEM-1024 keypair.
pub struct Keypair {
    /// Private half, used to decapsulate.
    pub decapsulation_key: DecapsulationKey,
    /// Public half, shared with peers for encapsulation.
    pub encapsulation_key: EncapsulationKey,
}

/// Generate a fresh ML-KEM-1024 keypair.
pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Keypair {
    let (dk, ek) = MlKem1024::generate(rng);
    Keypair {
        decapsulation_key: DecapsulationKey(dk),
        encapsulation_key: EncapsulationKey(ek),
    }
}

impl EncapsulationKey {
    /// Encapsulate a fresh shared secret against this public key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] if the underlying KEM
    /// operation fails (practically unreachable for a well-formed key).
    pub fn encapsulate<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
    ) -> Result<(Ciphertext, SharedSecret), CryptoError> {
        let (ct, ss) = self
            .0
            .encapsulate(rng)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        let mut ct_bytes = [0u8; CIPHERTEXT_SIZE];
        ct_bytes.copy_from_slice(ct.as_slice());
        let mut ss_bytes = [0u8; SHARED_SECRET_SIZE];
        ss_bytes.copy_from_slice(ss.as_slice());
        Ok((Ciphertext(ct_bytes), SharedSecret(ss_bytes)))
    }

    /// Serialize to the fixed-size wire form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        let mut out = [0u8; PUBLIC_KEY_SIZE];
        out.copy_from_slice(self.0.as_bytes().as_slice());
        out
    }

    /// Parse from the fixed-size wire form.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the bytes do not decode
    /// to a valid ML-KEM-1024 encapsulation key.
    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_SIZE]) -> Result<Self, CryptoError> {
        let encoded = (*bytes).into();
        Ok(Self(ml_kem::kem::EncapsulationKey::<
            <MlKem1024 as KemCore>::Params,
        >::from_bytes(&encoded)))
    }
}

impl DecapsulationKey {
    /// Decapsulate a shared secret from a ciphertext produced for this key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidCiphertext`] if the ciphertext is
    /// malformed. A corrupted-but-well-formed ciphertext still returns a
    /// shared secret (IND-CCA2 property): it simply will not match the
    /// encapsulator's.
    pub fn decapsulate(&self, ciphertext: &Ciphertext) -> Result<SharedSecret, CryptoError> {
        let encoded = ciphertext.0.into();
        let ss = self
            .0
            .decapsulate(&encoded)
            .map_err(|_| CryptoError::InvalidCiphertext)?;
        let mut ss_bytes = [0u8; SHARED_SECRET_SIZE];
        ss_bytes.copy_from_slice(ss.as_slice());
        Ok(SharedSecret(ss_bytes))
    }
}

impl Ciphertext {
    /// Wrap raw ciphertext bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; CIPHERTEXT_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw ciphertext bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; CIPHERTEXT_SIZE] {
        &self.0
    }
}

impl SharedSecret {
    /// Raw shared secret bytes. Feed this into HKDF, never use directly as
    /// a symmetric key.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_SIZE] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn encapsulate_decapsulate_round_trip() {
        let kp = generate(&mut OsRng);
        let (ct, ss_sender) = kp.encapsulation_key.encapsulate(&mut OsRng).unwrap();
        let ss_receiver = kp.decapsulation_key.decapsulate(&ct).unwrap();
        assert_eq!(ss_sender.as_bytes(), ss_receiver.as_bytes());
    }

    #[test]
    fn encapsulations_are_fresh() {
        let kp = generate(&mut OsRng);
        let (ct1, _) = kp.encapsulation_key.encapsulate(&mut OsRng).unwrap();
        let (ct2, _) = kp.encapsulation_key.encapsulate(&mut OsRng).unwrap();
        assert_ne!(ct1.as_bytes(), ct2.as_bytes());
    }

    #[test]
    fn public_key_round_trips_through_bytes() {
        let kp = generate(&mut OsRng);
        let bytes = kp.encapsulation_key.to_bytes();
        let restored = EncapsulationKey::from_bytes(&bytes).unwrap();
        assert_eq!(restored.to_bytes(), bytes);
    }
}
