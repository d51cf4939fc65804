//! Context-separated key derivation over BLAKE3.

/// BLAKE3 Key Derivation Function with context.
///
/// Every key the engine uses is derived from the call key through a `Kdf`
/// with its own context string, so no two purposes ever share key material.
pub struct Kdf {
    context: &'static str,
}

impl Kdf {
    /// Create a KDF with a specific context string.
    ///
    /// # Example
    ///
    /// ```
    /// use duplex_crypto::hash::Kdf;
    ///
    /// let kdf = Kdf::new("duplex-example");
    /// let a = kdf.derive_key(b"input key material");
    /// let b = Kdf::new("duplex-other").derive_key(b"input key material");
    /// assert_ne!(a, b);
    /// ```
    #[must_use]
    pub fn new(context: &'static str) -> Self {
        Self { context }
    }

    /// Derive output from input key material.
    pub fn derive(&self, ikm: &[u8], output: &mut [u8]) {
        let mut hasher = blake3::Hasher::new_derive_key(self.context);
        hasher.update(ikm);

        let mut reader = hasher.finalize_xof();
        reader.fill(output);
    }

    /// Derive a 32-byte key.
    #[must_use]
    pub fn derive_key(&self, ikm: &[u8]) -> [u8; 32] {
        let mut output = [0u8; 32];
        self.derive(ikm, &mut output);
        output
    }

    /// Derive an 8-byte value (fingerprints).
    #[must_use]
    pub fn derive_8(&self, ikm: &[u8]) -> [u8; 8] {
        let mut output = [0u8; 8];
        self.derive(ikm, &mut output);
        output
    }
}
