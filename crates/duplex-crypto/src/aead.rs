//! `XChaCha20-Poly1305` AEAD sealing.
//!
//! Every datagram on a media path and every signaling payload is sealed
//! with a fresh random 192-bit nonce that travels in front of the
//! ciphertext:
//!
//! ```text
//! ┌──────────────┬──────────────────────────┬─────────┐
//! │  nonce (24)  │  ciphertext (n)          │ tag (16)│
//! └──────────────┴──────────────────────────┴─────────┘
//! ```
//!
//! The extended nonce makes random generation safe: the birthday bound is
//! 2^96 messages, far beyond the lifetime of a call.

use crate::CryptoError;
use crate::random::random_24;
use chacha20poly1305::{
    XChaCha20Poly1305,
    aead::{Aead, KeyInit, Payload},
};
use zeroize::ZeroizeOnDrop;

/// Authentication tag size (16 bytes / 128 bits).
pub const TAG_SIZE: usize = 16;

/// XChaCha20-Poly1305 nonce size (24 bytes / 192 bits).
pub const NONCE_SIZE: usize = 24;

/// AEAD key size (32 bytes / 256 bits).
pub const KEY_SIZE: usize = 32;

/// Smallest sealed payload: a nonce and a tag around an empty plaintext.
pub const SEAL_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// XChaCha20-Poly1305 nonce (24 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Create a nonce from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a nonce from a slice.
    #[must_use]
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; NONCE_SIZE] = slice.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Generate a random nonce from the OS CSPRNG.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the CSPRNG fails.
    pub fn random() -> Result<Self, CryptoError> {
        Ok(Self(random_24()?))
    }

    /// Get raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    fn as_generic(&self) -> &chacha20poly1305::XNonce {
        chacha20poly1305::XNonce::from_slice(&self.0)
    }
}

/// AEAD encryption key (32 bytes).
///
/// Key is zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Encrypt plaintext with associated data.
    ///
    /// Returns ciphertext with appended authentication tag (`plaintext.len()` + 16 bytes).
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` if AEAD encryption fails.
    pub fn encrypt(
        &self,
        nonce: &Nonce,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new((&self.0).into());

        cipher
            .encrypt(
                nonce.as_generic(),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt ciphertext with associated data.
    ///
    /// Input must include the authentication tag at the end.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::DecryptionFailed` on authentication failure.
    pub fn decrypt(
        &self,
        nonce: &Nonce,
        ciphertext_and_tag: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext_and_tag.len() < TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        let cipher = XChaCha20Poly1305::new((&self.0).into());

        cipher
            .decrypt(
                nonce.as_generic(),
                Payload {
                    msg: ciphertext_and_tag,
                    aad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl std::fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AeadKey(..)")
    }
}

/// One-directional sealer bound to a purpose label.
///
/// The label is authenticated as associated data so a payload sealed for
/// one purpose (say, signaling) never opens as another (a path datagram),
/// even if the keys were to coincide.
#[derive(Clone, Debug)]
pub struct PacketSealer {
    key: AeadKey,
    label: &'static [u8],
}

impl PacketSealer {
    /// Create a sealer for `label` under `key`.
    #[must_use]
    pub fn new(key: AeadKey, label: &'static [u8]) -> Self {
        Self { key, label }
    }

    /// Seal `plaintext` into `nonce || ciphertext || tag`.
    ///
    /// # Errors
    ///
    /// Returns an error if nonce generation or encryption fails.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = Nonce::random()?;
        let ciphertext = self.key.encrypt(&nonce, plaintext, self.label)?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(nonce.as_bytes());
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open a payload produced by the peer's matching sealer.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Truncated`] if the payload cannot hold a nonce
    /// and a tag, or [`CryptoError::DecryptionFailed`] if it does not
    /// authenticate.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(CryptoError::Truncated(sealed.len()));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce).ok_or(CryptoError::Truncated(sealed.len()))?;
        self.key.decrypt(&nonce, ciphertext, self.label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealer(byte: u8, label: &'static [u8]) -> PacketSealer {
        PacketSealer::new(AeadKey::new([byte; KEY_SIZE]), label)
    }

    #[test]
    fn test_seal_open() {
        let s = sealer(1, b"test");
        let sealed = s.seal(b"hello peer").unwrap();
        assert_eq!(sealed.len(), SEAL_OVERHEAD + 10);
        assert_eq!(s.open(&sealed).unwrap(), b"hello peer");
    }

    #[test]
    fn test_nonces_are_fresh() {
        let s = sealer(1, b"test");
        let a = s.seal(b"same").unwrap();
        let b = s.seal(b"same").unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
    }

    #[test]
    fn test_wrong_key_rejected() {
        let sealed = sealer(1, b"test").seal(b"payload").unwrap();
        assert_eq!(
            sealer(2, b"test").open(&sealed),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_label_is_authenticated() {
        let sealed = sealer(1, b"link").seal(b"payload").unwrap();
        assert_eq!(
            sealer(1, b"signaling").open(&sealed),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_tampering_detected() {
        let s = sealer(3, b"test");
        let mut sealed = s.seal(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(s.open(&sealed).is_err());
    }

    #[test]
    fn test_truncated_rejected() {
        let s = sealer(3, b"test");
        assert_eq!(s.open(&[0u8; 10]), Err(CryptoError::Truncated(10)));
        assert_eq!(s.open(&[]), Err(CryptoError::Truncated(0)));
    }

    proptest::proptest! {
        #[test]
        fn prop_any_bit_flip_is_rejected(
            payload in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..256),
            position in proptest::prelude::any::<proptest::sample::Index>(),
            bit in 0u8..8,
        ) {
            let s = sealer(4, b"prop");
            let mut sealed = s.seal(&payload).unwrap();
            let index = position.index(sealed.len());
            sealed[index] ^= 1 << bit;
            proptest::prop_assert!(s.open(&sealed).is_err());
        }
    }
}
