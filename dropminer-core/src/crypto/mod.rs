//! Sealing of the persisted session blob.
//!
//! On disk a sealed blob is `base64(FORMAT || nonce || ciphertext)`. The
//! format byte is bound into the tag as associated data together with the
//! store label, so a blob sealed for another purpose fails to open.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::rngs::OsRng;
use rand_core::TryRngCore;
use std::sync::Arc;

use crate::Error;

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const FORMAT: u8 = 1;
const LABEL: &[u8] = b"dropminer-session";

fn random_bytes<const N: usize>() -> Result<[u8; N], String> {
    let mut out = [0u8; N];
    OsRng.try_fill_bytes(&mut out).map_err(|e| e.to_string())?;
    Ok(out)
}

#[derive(Clone)]
pub struct Encryptor {
    cipher: Arc<Aes256Gcm>,
}

impl Encryptor {
    pub fn new(key: &[u8]) -> Result<Self, Error> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| Error::KeyDerivation(format!("expected a {KEY_LEN}-byte key, got {}", key.len())))?;
        Ok(Self { cipher: Arc::new(cipher) })
    }

    /// A fresh key from the OS random source.
    pub fn generate_key() -> Result<[u8; KEY_LEN], Error> {
        random_bytes().map_err(Error::KeyDerivation)
    }

    fn aad() -> Vec<u8> {
        let mut aad = Vec::with_capacity(LABEL.len() + 1);
        aad.extend_from_slice(LABEL);
        aad.push(FORMAT);
        aad
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<String, Error> {
        let nonce: [u8; NONCE_LEN] = random_bytes().map_err(Error::Encryption)?;
        let aad = Self::aad();
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: &aad })
            .map_err(|e| Error::Encryption(e.to_string()))?;

        let mut out = Vec::with_capacity(1 + NONCE_LEN + sealed.len());
        out.push(FORMAT);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(BASE64.encode(out))
    }

    pub fn open(&self, encoded: &str) -> Result<Vec<u8>, Error> {
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|e| Error::Decryption(format!("not base64: {e}")))?;
        let Some((&format, rest)) = raw.split_first() else {
            return Err(Error::Decryption("empty blob".into()));
        };
        if format != FORMAT {
            return Err(Error::Decryption(format!("unknown blob format {format}")));
        }
        if rest.len() < NONCE_LEN {
            return Err(Error::Decryption("blob shorter than its nonce".into()));
        }
        let (nonce, sealed) = rest.split_at(NONCE_LEN);
        let aad = Self::aad();
        self.cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: sealed, aad: &aad })
            .map_err(|e| Error::Decryption(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrong_key_cannot_open() -> Result<(), Error> {
        let a = Encryptor::new(&Encryptor::generate_key()?)?;
        let b = Encryptor::new(&Encryptor::generate_key()?)?;
        let sealed = a.seal(b"{\"access_token\":\"x\"}")?;
        assert_eq!(a.open(&sealed)?, b"{\"access_token\":\"x\"}".to_vec());
        assert!(matches!(b.open(&sealed), Err(Error::Decryption(_))));
        assert!(matches!(Encryptor::new(&[0u8; 16]), Err(Error::KeyDerivation(_))));
        Ok(())
    }

    #[test]
    fn test_tampered_or_foreign_blobs_are_rejected() -> Result<(), Error> {
        let enc = Encryptor::new(&Encryptor::generate_key()?)?;
        let mut raw = BASE64
            .decode(enc.seal(b"session")?)
            .map_err(|e| Error::Decryption(e.to_string()))?;

        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert!(enc.open(&BASE64.encode(&raw)).is_err());

        raw[0] = 9;
        assert!(enc.open(&BASE64.encode(&raw)).is_err());
        assert!(enc.open("").is_err());
        assert!(enc.open("!!not base64!!").is_err());
        Ok(())
    }
}
