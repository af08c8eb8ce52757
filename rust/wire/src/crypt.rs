use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use crate::WireError;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Authenticated encryption for the on-wire message blob.  The fragment
/// header stays in the clear; the concatenated key/value blob is sealed with
/// a fresh random nonce per message, and the nonce rides ahead of the
/// ciphertext.  Misdecryption on receipt means the message is treated as
/// corrupt and dropped, never partially applied.
#[derive(Clone)]
pub struct PayloadCipher {
    cipher: ChaCha20Poly1305,
}

impl PayloadCipher {
    /// Build from the configured base64-encoded 32-byte key.
    pub fn from_base64(encoded: &str) -> Result<Self, WireError> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|_| WireError::BadCryptoKey { expected: KEY_LEN })?;
        if raw.len() != KEY_LEN {
            return Err(WireError::BadCryptoKey { expected: KEY_LEN });
        }
        Ok(PayloadCipher {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&raw)),
        })
    }

    pub fn seal(&self, plain: &[u8]) -> Result<Vec<u8>, WireError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plain)
            .map_err(|_| WireError::CipherFailure)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open(&self, blob: &[u8]) -> Result<Vec<u8>, WireError> {
        if blob.len() < NONCE_LEN {
            return Err(WireError::BadDecrypt);
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| WireError::BadDecrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_B64: &str = "mJpC1L1sCXl3Y0kFNy7k0X5handSUkh2ZWxvY2l0eTE=";

    #[test]
    fn seal_open_round_trip() {
        let cipher = PayloadCipher::from_base64(KEY_B64).unwrap();
        let sealed = cipher.seal(b"coherence traffic").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"coherence traffic");
        assert_eq!(cipher.open(&sealed).unwrap(), b"coherence traffic");
    }

    #[test]
    fn nonce_differs_per_message() {
        let cipher = PayloadCipher::from_base64(KEY_B64).unwrap();
        let a = cipher.seal(b"same plaintext").unwrap();
        let b = cipher.seal(b"same plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampering_fails_authentication() {
        let cipher = PayloadCipher::from_base64(KEY_B64).unwrap();
        let mut sealed = cipher.seal(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(cipher.open(&sealed), Err(WireError::BadDecrypt)));
    }

    #[test]
    fn rejects_short_or_malformed_keys() {
        assert!(PayloadCipher::from_base64("not base64 at all!").is_err());
        assert!(PayloadCipher::from_base64("c2hvcnQ=").is_err());
    }
}
