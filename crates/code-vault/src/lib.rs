//! Code Vault
//!
//! Keeps submitted code encrypted between upload and execution.
//!
//! - A per-session key is generated when the rental is created. It mixes the
//!   session and device ids with a random nonce, so it cannot be recomputed
//!   from public fields.
//! - Each encryption stretches the session key with PBKDF2-HMAC-SHA256 over a
//!   fresh random salt, then seals the code with ChaCha20-Poly1305 under a
//!   fresh random nonce. Ciphertext, nonce, tag and salt are stored hex encoded.
//! - Decryption fails with [`Error::Tamper`] when the tag does not verify.
//!
//! Neither code nor key material is ever logged; only lengths and
//! [`fingerprint`]s are.

use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, Tag};
use exec_common::{EncryptedPayload, Error, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Default PBKDF2 rounds
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const SALT_SIZE: usize = 16;
const SESSION_KEY_DOMAIN: &[u8] = b"secure-exec-session-key-v1";

/// Derive a session key from the session id, device id and a secret nonce.
///
/// Deterministic for identical inputs; the secrecy comes from `nonce`.
pub fn derive_session_key(session_id: &str, device_id: &str, nonce: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(SESSION_KEY_DOMAIN);
    hasher.update(session_id.as_bytes());
    hasher.update(b"|");
    hasher.update(device_id.as_bytes());
    hasher.update(b"|");
    hasher.update(nonce);
    hex::encode(hasher.finalize())
}

/// Generate a fresh session key using a random 32-byte nonce from the OS RNG.
pub fn generate_session_key(session_id: &str, device_id: &str) -> String {
    let mut nonce = [0u8; 32];
    OsRng.fill_bytes(&mut nonce);
    derive_session_key(session_id, device_id, &nonce)
}

/// Short SHA-256 fingerprint, safe to log
pub fn fingerprint(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex::encode(&digest[..6])
}

/// Encrypts and decrypts code with a session key
#[derive(Debug, Clone)]
pub struct CodeVault {
    kdf_iterations: u32,
}

impl Default for CodeVault {
    fn default() -> Self {
        Self::new(DEFAULT_KDF_ITERATIONS)
    }
}

impl CodeVault {
    pub fn new(kdf_iterations: u32) -> Self {
        Self { kdf_iterations }
    }

    pub fn kdf_iterations(&self) -> u32 {
        self.kdf_iterations
    }

    /// Encrypt `code` under `session_key`. Every call uses a new salt and nonce.
    pub fn encrypt(&self, code: &str, session_key: &str) -> Result<EncryptedPayload> {
        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);

        let cipher = self.cipher(session_key, &salt)?;

        let mut buffer = code.as_bytes().to_vec();
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce_bytes), b"", &mut buffer)
            .map_err(|_| Error::Crypto("Encryption failed".to_string()))?;

        debug!(
            code_len = code.len(),
            code_fingerprint = %fingerprint(code.as_bytes()),
            "Encrypted code"
        );

        Ok(EncryptedPayload {
            ciphertext: hex::encode(&buffer),
            iv: hex::encode(nonce_bytes),
            auth_tag: hex::encode(tag),
            salt: hex::encode(salt),
        })
    }

    /// Decrypt a payload. Any integrity failure is [`Error::Tamper`] and must not be retried.
    pub fn decrypt(&self, payload: &EncryptedPayload, session_key: &str) -> Result<String> {
        let salt = decode_field("salt", &payload.salt, None)?;
        let nonce_bytes = decode_field("iv", &payload.iv, Some(NONCE_SIZE))?;
        let tag_bytes = decode_field("auth_tag", &payload.auth_tag, Some(TAG_SIZE))?;
        let mut buffer = decode_field("ciphertext", &payload.ciphertext, None)?;

        let cipher = self.cipher(session_key, &salt)?;

        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&nonce_bytes),
                b"",
                &mut buffer,
                Tag::from_slice(&tag_bytes),
            )
            .map_err(|_| {
                warn!(
                    ciphertext_len = buffer.len(),
                    "Authentication tag mismatch while decrypting code"
                );
                Error::Tamper
            })?;

        let code = String::from_utf8(buffer)
            .map_err(|_| Error::Crypto("Decrypted code is not valid UTF-8".to_string()))?;

        debug!(
            code_len = code.len(),
            code_fingerprint = %fingerprint(code.as_bytes()),
            "Decrypted code"
        );

        Ok(code)
    }

    fn cipher(&self, session_key: &str, salt: &[u8]) -> Result<ChaCha20Poly1305> {
        if session_key.is_empty() {
            return Err(Error::Crypto("Session key is empty".to_string()));
        }

        let mut key = [0u8; KEY_SIZE];
        pbkdf2::pbkdf2_hmac::<Sha256>(session_key.as_bytes(), salt, self.kdf_iterations, &mut key);

        Ok(ChaCha20Poly1305::new(Key::from_slice(&key)))
    }
}

fn decode_field(name: &str, value: &str, expected_len: Option<usize>) -> Result<Vec<u8>> {
    let bytes = hex::decode(value).map_err(|_| {
        warn!(field = name, "Malformed hex in encrypted payload");
        Error::Tamper
    })?;

    if let Some(len) = expected_len {
        if bytes.len() != len {
            warn!(
                field = name,
                expected = len,
                actual = bytes.len(),
                "Encrypted payload field has wrong length"
            );
            return Err(Error::Tamper);
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Low round count keeps the tests fast; the algorithm is the same.
    fn vault() -> CodeVault {
        CodeVault::new(1_000)
    }

    #[test]
    fn test_round_trip() {
        let vault = vault();
        let key = generate_session_key("session-1", "device-1");
        let code = "import numpy as np\nprint(np.arange(3))\n";

        let payload = vault.encrypt(code, &key).unwrap();
        assert_ne!(payload.ciphertext, hex::encode(code));
        assert_eq!(vault.decrypt(&payload, &key).unwrap(), code);
    }

    #[test]
    fn test_round_trip_empty_and_unicode() {
        let vault = vault();
        let key = generate_session_key("s", "d");

        for code in ["", "print('héllo wörld ✓')"] {
            let payload = vault.encrypt(code, &key).unwrap();
            assert_eq!(vault.decrypt(&payload, &key).unwrap(), code);
        }
    }

    #[test]
    fn test_fresh_iv_and_salt_per_call() {
        let vault = vault();
        let key = generate_session_key("s", "d");

        let a = vault.encrypt("print(1)", &key).unwrap();
        let b = vault.encrypt("print(1)", &key).unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_tampered_tag_is_rejected() {
        let vault = vault();
        let key = generate_session_key("s", "d");
        let mut payload = vault.encrypt("print(1)", &key).unwrap();

        let mut tag = hex::decode(&payload.auth_tag).unwrap();
        tag[0] ^= 0xff;
        payload.auth_tag = hex::encode(tag);

        assert!(matches!(vault.decrypt(&payload, &key), Err(Error::Tamper)));
    }

    #[test]
    fn test_tampered_ciphertext_is_rejected() {
        let vault = vault();
        let key = generate_session_key("s", "d");
        let mut payload = vault.encrypt("print(1)", &key).unwrap();

        let mut body = hex::decode(&payload.ciphertext).unwrap();
        body[0] ^= 0x01;
        payload.ciphertext = hex::encode(body);

        assert!(matches!(vault.decrypt(&payload, &key), Err(Error::Tamper)));
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let vault = vault();
        let payload = vault
            .encrypt("print(1)", &generate_session_key("s", "d"))
            .unwrap();
        let other = generate_session_key("s", "d");

        assert!(matches!(vault.decrypt(&payload, &other), Err(Error::Tamper)));
    }

    #[test]
    fn test_malformed_payload_is_rejected() {
        let vault = vault();
        let key = generate_session_key("s", "d");
        let mut payload = vault.encrypt("print(1)", &key).unwrap();
        payload.iv = "zz".to_string();

        assert!(matches!(vault.decrypt(&payload, &key), Err(Error::Tamper)));
    }

    #[test]
    fn test_session_key_derivation() {
        let nonce = [7u8; 32];
        let a = derive_session_key("s", "d", &nonce);
        let b = derive_session_key("s", "d", &nonce);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        assert_ne!(a, derive_session_key("s", "d", &[8u8; 32]));
        assert_ne!(a, derive_session_key("s", "other", &nonce));

        assert_ne!(
            generate_session_key("s", "d"),
            generate_session_key("s", "d")
        );
    }

    #[test]
    fn test_empty_session_key_is_an_error() {
        let vault = vault();
        assert!(matches!(vault.encrypt("x", ""), Err(Error::Crypto(_))));
    }

    #[test]
    fn test_fingerprint_is_short_and_stable() {
        assert_eq!(fingerprint(b"abc"), fingerprint(b"abc"));
        assert_eq!(fingerprint(b"abc").len(), 12);
        assert_ne!(fingerprint(b"abc"), fingerprint(b"abd"));
    }
}
