use aes_gcm::{aead::Aead, Aes128Gcm, Key, KeyInit, Nonce};
use sha2::{Digest, Sha224};
use subtle::ConstantTimeEq;

const DEFAULT_KEY: &[u8] = b"roomcast_login_key";

/// Server-side key used to derive per-subscriber secrets.
///
/// The secret for a subscriber id is a pure function of `(key, id)`, so any
/// handler holding the same `LoginKey` can authenticate a request without
/// shared session state.
#[derive(Debug, Clone)]
pub struct LoginKey {
    key: Vec<u8>,
}

impl LoginKey {
    /// Wrap a configured login key, falling back to a built-in default when
    /// the configuration left it empty.
    #[must_use]
    pub fn new(key: &[u8]) -> Self {
        let key = if key.is_empty() { DEFAULT_KEY } else { key };
        Self { key: key.to_vec() }
    }

    /// Derive the secret for `id`.
    ///
    /// The secret is `AES-128-GCM.seal(id ‖ key)` where the cipher key is
    /// `sha224(id ‖ key)[0..16]` and the nonce `sha224(id ‖ key)[16..28]`.
    #[must_use]
    #[expect(
        clippy::missing_panics_doc,
        reason = "key and nonce sizes are fixed by the digest split"
    )]
    pub fn derive(&self, id: u32) -> Vec<u8> {
        let mut data = Vec::with_capacity(4 + self.key.len());
        data.extend_from_slice(&id.to_be_bytes());
        data.extend_from_slice(&self.key);

        let digest = Sha224::digest(&data);
        let cipher = Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(&digest[..16]));
        cipher
            .encrypt(Nonce::from_slice(&digest[16..28]), data.as_slice())
            .unwrap()
    }

    /// Check `secret` against the recomputed value for `id` in constant time.
    #[must_use]
    pub fn verify(&self, id: u32, secret: &[u8]) -> bool {
        self.derive(id).ct_eq(secret).into()
    }
}

#[cfg(test)]
mod tests {
    use super::LoginKey;

    #[test]
    fn derive_is_deterministic() {
        let key = LoginKey::new(b"test_key");
        assert_eq!(key.derive(17), key.derive(17));
    }

    #[test]
    fn secrets_differ_per_id_and_key() {
        let key = LoginKey::new(b"test_key");
        assert_ne!(key.derive(1), key.derive(2));

        let other = LoginKey::new(b"other_key");
        assert_ne!(key.derive(1), other.derive(1));
    }

    #[test]
    fn verify_accepts_derived_secret() {
        let key = LoginKey::new(b"test_key");
        let secret = key.derive(99);
        assert!(key.verify(99, &secret));
    }

    #[test]
    fn verify_rejects_tampering() {
        let key = LoginKey::new(b"test_key");
        let mut secret = key.derive(99);

        assert!(!key.verify(98, &secret));
        assert!(!key.verify(99, &secret[..secret.len() - 1]));
        assert!(!key.verify(99, &[]));

        secret[0] ^= 0x01;
        assert!(!key.verify(99, &secret));
    }

    #[test]
    fn empty_key_uses_default() {
        let empty = LoginKey::new(b"");
        let default = LoginKey::new(super::DEFAULT_KEY);
        assert_eq!(empty.derive(5), default.derive(5));
    }
}
