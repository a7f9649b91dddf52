//! At-rest encryption for student LMS tokens held by queued submission requests.
//!
//! AES-256-GCM with a key derived from `TOKEN_ENCRYPTION_KEY` through HMAC-SHA256.
//! Stored layout: nonce (12 bytes) || ciphertext+tag.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

use crate::core::security::SecretToken;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;
const KEY_CONTEXT: &[u8] = b"scanbridge/student-token/aes-256-gcm/v1";

#[derive(Debug, Error)]
pub(crate) enum TokenCipherError {
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("encryption failed")]
    Encryption,
    #[error("ciphertext too short")]
    CiphertextTooShort,
    #[error("decryption failed")]
    Decryption,
    #[error("decrypted token is not valid utf-8")]
    InvalidUtf8,
}

#[derive(Clone)]
pub(crate) struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    pub(crate) fn from_passphrase(passphrase: &str) -> Result<Self, TokenCipherError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(passphrase.as_bytes())
            .map_err(|_| TokenCipherError::KeyDerivation)?;
        mac.update(KEY_CONTEXT);
        let key: [u8; 32] = mac.finalize().into_bytes().into();

        Ok(Self { cipher: Aes256Gcm::new(&key.into()) })
    }

    pub(crate) fn encrypt(&self, token: &SecretToken) -> Result<Vec<u8>, TokenCipherError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), token.expose().as_bytes())
            .map_err(|_| TokenCipherError::Encryption)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub(crate) fn decrypt(&self, sealed: &[u8]) -> Result<SecretToken, TokenCipherError> {
        if sealed.len() <= NONCE_LEN {
            return Err(TokenCipherError::CiphertextTooShort);
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| TokenCipherError::Decryption)?;

        String::from_utf8(plaintext)
            .map(SecretToken::new)
            .map_err(|_| TokenCipherError::InvalidUtf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_token_opens_with_same_passphrase() {
        let cipher = TokenCipher::from_passphrase("passphrase").unwrap();
        let sealed = cipher.encrypt(&SecretToken::new("moodle-token-123")).unwrap();

        assert!(!sealed.windows(16).any(|window| window == b"moodle-token-123"));
        assert_eq!(cipher.decrypt(&sealed).unwrap().expose(), "moodle-token-123");
    }

    #[test]
    fn nonces_differ_between_encryptions() {
        let cipher = TokenCipher::from_passphrase("passphrase").unwrap();
        let token = SecretToken::new("same");
        assert_ne!(cipher.encrypt(&token).unwrap(), cipher.encrypt(&token).unwrap());
    }

    #[test]
    fn wrong_passphrase_or_tampering_fails() {
        let cipher = TokenCipher::from_passphrase("passphrase").unwrap();
        let other = TokenCipher::from_passphrase("other").unwrap();
        let mut sealed = cipher.encrypt(&SecretToken::new("token")).unwrap();

        assert!(matches!(other.decrypt(&sealed), Err(TokenCipherError::Decryption)));

        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(cipher.decrypt(&sealed), Err(TokenCipherError::Decryption)));
        assert!(matches!(cipher.decrypt(&[0u8; 4]), Err(TokenCipherError::CiphertextTooShort)));
    }
}
