//! Object path encryption
//!
//! Keys are encrypted one `/`-separated component at a time, so encrypted
//! paths keep their hierarchy and directory listings still work. Each
//! component is sealed under a key chained from its parent components, with
//! a nonce derived from the component itself: equal paths in one bucket
//! encrypt to equal strings, which lookups rely on.
//!
//! Encoded component: base64url(nonce || ciphertext || tag), no padding.

use crate::crypto::{BlockCipher, CipherKind, Key};
use crate::error::{Result, UplinkError};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;

const PATH_ROOT_CONTEXT: &str = "uplink 2019-04-01 bucket path key";
const PATH_CHILD_CONTEXT: &str = "uplink 2019-04-01 path component key";
const PATH_NONCE_CONTEXT: &str = "uplink 2019-04-01 path component nonce";

/// How object keys of a bucket are stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PathCipher {
    /// Keys stored as given
    Unencrypted,
    /// AES-256-GCM per component
    #[default]
    AesGcm,
    /// XChaCha20-Poly1305 per component
    SecretBox,
}

impl PathCipher {
    /// Numeric code used in configuration (0=none, 1=AES-GCM, 2=SecretBox)
    pub fn code(&self) -> u8 {
        match self {
            PathCipher::Unencrypted => 0,
            PathCipher::AesGcm => 1,
            PathCipher::SecretBox => 2,
        }
    }

    fn cipher_kind(&self) -> Option<CipherKind> {
        match self {
            PathCipher::Unencrypted => None,
            PathCipher::AesGcm => Some(CipherKind::AesGcm),
            PathCipher::SecretBox => Some(CipherKind::SecretBox),
        }
    }
}

impl TryFrom<u8> for PathCipher {
    type Error = UplinkError;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            0 => Ok(PathCipher::Unencrypted),
            1 => Ok(PathCipher::AesGcm),
            2 => Ok(PathCipher::SecretBox),
            other => Err(UplinkError::Configuration(format!(
                "unknown path cipher code {} (0=none, 1=AES-GCM, 2=SecretBox)",
                other
            ))),
        }
    }
}

impl fmt::Display for PathCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathCipher::Unencrypted => write!(f, "unencrypted"),
            PathCipher::AesGcm => write!(f, "aes-gcm"),
            PathCipher::SecretBox => write!(f, "secretbox"),
        }
    }
}

/// Encrypts and decrypts object keys below one point of a bucket's tree
#[derive(Clone)]
pub struct PathKey {
    cipher: PathCipher,
    key: Key,
}

impl PathKey {
    /// Key for the top of `bucket`
    pub fn for_bucket(cipher: PathCipher, root: &Key, bucket: &str) -> Self {
        let mut hasher = blake3::Hasher::new_derive_key(PATH_ROOT_CONTEXT);
        hasher.update(root.as_bytes());
        hasher.update(bucket.as_bytes());
        Self {
            cipher,
            key: Key::from_bytes(*hasher.finalize().as_bytes()),
        }
    }

    pub fn cipher(&self) -> PathCipher {
        self.cipher
    }

    /// Encrypt a relative path. Empty components, such as the one after a
    /// trailing `/`, stay empty.
    pub fn encrypt(&self, path: &str) -> Result<String> {
        let Some(kind) = self.cipher.cipher_kind() else {
            return Ok(path.to_string());
        };

        let mut key = self.key.clone();
        let mut out = Vec::new();
        for component in path.split('/') {
            out.push(seal_component(kind, &key, component)?);
            key = child_key(&key, component);
        }
        Ok(out.join("/"))
    }

    /// Reverse of [`PathKey::encrypt`]
    pub fn decrypt(&self, path: &str) -> Result<String> {
        let Some(kind) = self.cipher.cipher_kind() else {
            return Ok(path.to_string());
        };

        let mut key = self.key.clone();
        let mut out = Vec::new();
        for encoded in path.split('/') {
            let component = open_component(kind, &key, encoded)?;
            key = child_key(&key, &component);
            out.push(component);
        }
        Ok(out.join("/"))
    }

    /// Key for paths relative to the directory `prefix` (empty or ending
    /// in `/`)
    pub fn descend(&self, prefix: &str) -> Result<PathKey> {
        if prefix.is_empty() || self.cipher == PathCipher::Unencrypted {
            return Ok(self.clone());
        }
        let Some(dir) = prefix.strip_suffix('/') else {
            return Err(UplinkError::Metainfo(format!(
                "prefix {:?} must end with '/' when paths are encrypted",
                prefix
            )));
        };

        let mut key = self.key.clone();
        for component in dir.split('/') {
            key = child_key(&key, component);
        }
        Ok(PathKey {
            cipher: self.cipher,
            key,
        })
    }
}

impl fmt::Debug for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathKey({})", self.cipher)
    }
}

fn child_key(parent: &Key, component: &str) -> Key {
    let mut hasher = blake3::Hasher::new_derive_key(PATH_CHILD_CONTEXT);
    hasher.update(parent.as_bytes());
    hasher.update(component.as_bytes());
    Key::from_bytes(*hasher.finalize().as_bytes())
}

fn seal_component(kind: CipherKind, key: &Key, component: &str) -> Result<String> {
    if component.is_empty() {
        return Ok(String::new());
    }
    let cipher = BlockCipher::new(kind, key.as_bytes())?;

    let mut hasher = blake3::Hasher::new_derive_key(PATH_NONCE_CONTEXT);
    hasher.update(key.as_bytes());
    hasher.update(component.as_bytes());
    let digest = hasher.finalize();
    let nonce = &digest.as_bytes()[..cipher.nonce_size()];

    let mut sealed = nonce.to_vec();
    sealed.extend(cipher.seal(nonce, component.as_bytes())?);
    Ok(URL_SAFE_NO_PAD.encode(sealed))
}

fn open_component(kind: CipherKind, key: &Key, encoded: &str) -> Result<String> {
    if encoded.is_empty() {
        return Ok(String::new());
    }
    let cipher = BlockCipher::new(kind, key.as_bytes())?;
    let sealed = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| UplinkError::Decryption(format!("path component not base64: {}", e)))?;
    if sealed.len() < cipher.nonce_size() {
        return Err(UplinkError::Decryption(
            "path component too short".to_string(),
        ));
    }
    let (nonce, ciphertext) = sealed.split_at(cipher.nonce_size());
    let plain = cipher.open(nonce, ciphertext)?;
    String::from_utf8(plain)
        .map_err(|_| UplinkError::Decryption("path component is not UTF-8".to_string()))
}
