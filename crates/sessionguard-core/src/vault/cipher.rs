//! Sealed vault blob format.
//!
//! Layout: `SGV1` · key-ref length (u8) · key-ref bytes · 24-byte nonce ·
//! XChaCha20-Poly1305 ciphertext with tag. The header (magic and key-ref) is
//! bound to the ciphertext as associated data.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;
use zeroize::Zeroizing;

use super::keys::KeyHandle;

const MAGIC: &[u8; 4] = b"SGV1";
const NONCE_LEN: usize = 24;

/// Encrypted blob plus the reference of the key that sealed it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultEntry {
    key_ref: String,
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
}

impl VaultEntry {
    /// Encrypt `plaintext` under `key`
    pub fn seal(key: &KeyHandle, plaintext: &[u8]) -> Result<Self, String> {
        if key.key_ref().len() > usize::from(u8::MAX) {
            return Err("key reference too long".to_string());
        }
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let aad = header(key.key_ref());
        let cipher = XChaCha20Poly1305::new_from_slice(key.bytes())
            .map_err(|_| "invalid key length".to_string())?;
        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| "encryption failed".to_string())?;

        Ok(Self {
            key_ref: key.key_ref().to_string(),
            nonce,
            ciphertext,
        })
    }

    /// Decrypt with `key`; fails on a wrong key or any tampering
    pub fn open(&self, key: &KeyHandle) -> Result<Zeroizing<Vec<u8>>, String> {
        if key.key_ref() != self.key_ref {
            return Err(format!(
                "blob sealed with '{}', got key '{}'",
                self.key_ref,
                key.key_ref()
            ));
        }
        let aad = header(&self.key_ref);
        let cipher = XChaCha20Poly1305::new_from_slice(key.bytes())
            .map_err(|_| "invalid key length".to_string())?;
        cipher
            .decrypt(
                XNonce::from_slice(&self.nonce),
                Payload {
                    msg: &self.ciphertext,
                    aad: &aad,
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| "decryption failed".to_string())
    }

    pub fn key_ref(&self) -> &str {
        &self.key_ref
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = header(&self.key_ref);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let rest = bytes
            .strip_prefix(MAGIC.as_slice())
            .ok_or_else(|| "not a vault blob".to_string())?;
        let (&ref_len, rest) = rest
            .split_first()
            .ok_or_else(|| "truncated header".to_string())?;
        let ref_len = usize::from(ref_len);
        if rest.len() < ref_len + NONCE_LEN {
            return Err("truncated blob".to_string());
        }
        let (key_ref, rest) = rest.split_at(ref_len);
        let key_ref = std::str::from_utf8(key_ref)
            .map_err(|_| "key reference is not UTF-8".to_string())?
            .to_string();
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(nonce_bytes);

        Ok(Self {
            key_ref,
            nonce,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

fn header(key_ref: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAGIC.len() + 1 + key_ref.len());
    out.extend_from_slice(MAGIC);
    // Length checked in seal/decode
    out.push(key_ref.len() as u8);
    out.extend_from_slice(key_ref.as_bytes());
    out
}
