//! C1: serialize/deserialize message fields, with optional AEAD sealing.
//!
//! Grounded on `morp/interface/base.py`'s `_fields_to_body`/`_body_to_fields`:
//! pick a serializer, then if a key is configured, seal the serialized
//! bytes. The original uses Fernet/AES-CFB; this uses AES-256-GCM (an
//! AEAD cipher, which is what spec §4.1 actually calls for) via `aes-gcm`.

use crate::error::CodecError;
use crate::value::Fields;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use sha2::{Digest, Sha256};

/// How message fields are serialized to bytes before (optional) sealing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serializer {
    /// Self-describing, language-agnostic — JSON.
    Json,
    /// Compact binary form for trusted producers/consumers of the same
    /// software — the Rust-native analogue of the original's `pickle`
    /// option.
    Binary,
}

impl std::str::FromStr for Serializer {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Serializer::Json),
            "pickle" | "binary" => Ok(Serializer::Binary),
            other => Err(CodecError::Deserialize(format!(
                "unknown serializer: {other}"
            ))),
        }
    }
}

/// A resolved 32-byte symmetric key, produced by hashing the DSN's `key`
/// option (see `derive_key`).
pub type SealKey = [u8; 32];

/// Hash an arbitrary-length secret down to a fixed 32-byte key, per spec
/// §4.2 ("hashed to a fixed-length symmetric key").
pub fn derive_key(secret: &str) -> SealKey {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

const NONCE_LEN: usize = 12;

fn serialize(fields: &Fields, serializer: Serializer) -> Result<Vec<u8>, CodecError> {
    match serializer {
        Serializer::Json => {
            let obj: serde_json::Map<String, serde_json::Value> = fields
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect();
            serde_json::to_vec(&obj).map_err(|e| CodecError::Serialize(e.to_string()))
        }
        Serializer::Binary => {
            bincode::serialize(fields).map_err(|e| CodecError::Serialize(e.to_string()))
        }
    }
}

fn deserialize(bytes: &[u8], serializer: Serializer) -> Result<Fields, CodecError> {
    match serializer {
        Serializer::Json => {
            let obj: serde_json::Map<String, serde_json::Value> =
                serde_json::from_slice(bytes).map_err(|e| CodecError::Deserialize(e.to_string()))?;
            Ok(obj
                .into_iter()
                .map(|(k, v)| (k, crate::value::Value::from_json(v)))
                .collect())
        }
        Serializer::Binary => {
            bincode::deserialize(bytes).map_err(|e| CodecError::Deserialize(e.to_string()))
        }
    }
}

fn seal(plaintext: &[u8], key: &SealKey) -> Vec<u8> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    // `encrypt` on a correctly sized key/nonce pair cannot fail.
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .expect("AES-256-GCM encryption with a valid key cannot fail");

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&ciphertext);
    out
}

fn unseal(sealed: &[u8], key: &SealKey) -> Result<Vec<u8>, CodecError> {
    if sealed.len() < NONCE_LEN {
        return Err(CodecError::Decrypt);
    }

    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CodecError::Decrypt)
}

/// Encode `fields` into wire bytes, optionally sealing with `key`.
pub fn encode(
    fields: &Fields,
    serializer: Serializer,
    key: Option<&SealKey>,
) -> Result<Vec<u8>, CodecError> {
    let plaintext = serialize(fields, serializer)?;
    Ok(match key {
        Some(key) => seal(&plaintext, key),
        None => plaintext,
    })
}

/// Decode wire bytes back into fields, unsealing with `key` first if one
/// is configured. A decryption failure is fatal and must not reach user
/// code (spec §7).
pub fn decode(
    bytes: &[u8],
    serializer: Serializer,
    key: Option<&SealKey>,
) -> Result<Fields, CodecError> {
    let plaintext = match key {
        Some(key) => unseal(bytes, key)?,
        None => bytes.to_vec(),
    };

    deserialize(&plaintext, serializer)
}
