// ABOUTME: Versioned ChaCha20-Poly1305 encryption for the target-token column.
// ABOUTME: Decrypt distinguishes current, stale-key, and legacy plaintext values so callers can re-encrypt.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::RngCore;
use thiserror::Error;

/// Key size (32 bytes)
pub const KEY_SIZE: usize = 32;

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
const NONCE_SIZE: usize = 12;

/// Poly1305 authentication tag size (16 bytes)
const TAG_SIZE: usize = 16;

/// Errors that can occur during token encryption.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("decryption failed: {0}")]
    Decrypt(String),

    #[error("no key retained for version {0}")]
    UnknownKeyVersion(u32),

    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

/// Result of decrypting a stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptOutcome {
    /// Encrypted under the current key.
    Current(String),
    /// Encrypted under a retained older key.
    Stale(String),
    /// Never encrypted; stored before encryption was enabled.
    Legacy(String),
}

impl DecryptOutcome {
    pub fn plaintext(&self) -> &str {
        match self {
            DecryptOutcome::Current(p) | DecryptOutcome::Stale(p) | DecryptOutcome::Legacy(p) => p,
        }
    }

    pub fn into_plaintext(self) -> String {
        match self {
            DecryptOutcome::Current(p) | DecryptOutcome::Stale(p) | DecryptOutcome::Legacy(p) => p,
        }
    }

    /// Whether the stored value should be rewritten under the current key.
    pub fn needs_reencrypt(&self) -> bool {
        !matches!(self, DecryptOutcome::Current(_))
    }
}

/// Token encryption with an ordered keyring. Version `n` is the key at
/// index `n - 1`; the last key is current and used for every encryption.
///
/// A read-only keyring still decrypts stored values but encrypts nothing,
/// so switching encryption off keeps earlier tokens readable.
#[derive(Clone)]
pub struct Crypto {
    keys: Vec<[u8; KEY_SIZE]>,
    sealing: bool,
}

impl std::fmt::Debug for Crypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crypto")
            .field("current_version", &self.current_version())
            .field("sealing", &self.sealing)
            .finish()
    }
}

impl Crypto {
    /// Build from existing key material, oldest first.
    pub fn new(keys: Vec<[u8; KEY_SIZE]>) -> Result<Self, CryptoError> {
        if keys.is_empty() {
            return Err(CryptoError::InvalidKey("keyring is empty".to_string()));
        }
        Ok(Self {
            keys,
            sealing: true,
        })
    }

    /// A keyring with one fresh random key.
    pub fn generate() -> Self {
        Self {
            keys: vec![random_key()],
            sealing: true,
        }
    }

    /// No keys: tokens are stored and returned verbatim.
    pub fn disabled() -> Self {
        Self {
            keys: Vec::new(),
            sealing: false,
        }
    }

    /// Keep the keys for decryption only; `encrypt` passes values through.
    pub fn read_only(mut self) -> Self {
        self.sealing = false;
        self
    }

    /// Whether new values are encrypted.
    pub fn is_enabled(&self) -> bool {
        self.sealing && !self.keys.is_empty()
    }

    pub fn current_version(&self) -> Option<u32> {
        if self.keys.is_empty() {
            None
        } else {
            Some(self.keys.len() as u32)
        }
    }

    /// Append a fresh key and make it current. Older keys stay readable.
    pub fn rotate(&mut self) -> u32 {
        self.keys.push(random_key());
        self.keys.len() as u32
    }

    /// Decode a keyring from base64 lines, oldest first. Blank lines are skipped.
    pub fn from_encoded(encoded: &str) -> Result<Self, CryptoError> {
        let mut keys = Vec::new();
        for line in encoded.split([',', '\n']).map(str::trim).filter(|l| !l.is_empty()) {
            let bytes = STANDARD
                .decode(line)
                .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
            let key: [u8; KEY_SIZE] = bytes.try_into().map_err(|b: Vec<u8>| {
                CryptoError::InvalidKey(format!("expected {} bytes, got {}", KEY_SIZE, b.len()))
            })?;
            keys.push(key);
        }
        Self::new(keys)
    }

    /// Load the keyring stored at `path`, creating one with a fresh key if
    /// the file does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            let contents = fs::read_to_string(path)?;
            return Self::from_encoded(&contents);
        }
        let crypto = Self::generate();
        crypto.save(path)?;
        tracing::info!(path = %path.display(), "generated new token keyring");
        Ok(crypto)
    }

    /// Persist the keyring, one base64 key per line, via temp file and rename.
    pub fn save(&self, path: &Path) -> Result<(), CryptoError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("tmp");
        let mut file = File::create(&tmp_path)?;
        for key in &self.keys {
            writeln!(file, "{}", STANDARD.encode(key))?;
        }
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Encrypt under the current key as `v<version>:<base64(nonce || ciphertext)>`.
    /// Returns the input unchanged when encryption is disabled.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let version = match self.current_version() {
            Some(version) if self.sealing => version,
            _ => return Ok(plaintext.to_string()),
        };
        let cipher = ChaCha20Poly1305::new_from_slice(&self.keys[version as usize - 1])
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);

        Ok(format!("v{}:{}", version, STANDARD.encode(sealed)))
    }

    /// Decrypt a stored value.
    ///
    /// Values that are not shaped like `v<n>:<base64>` holding at least a
    /// nonce and a tag are legacy plaintext. Well-formed values that fail
    /// authentication are errors.
    pub fn decrypt(&self, value: &str) -> Result<DecryptOutcome, CryptoError> {
        let Some((version, sealed)) = split_sealed(value) else {
            return Ok(self.unsealed(value));
        };

        let key = version
            .checked_sub(1)
            .and_then(|i| self.keys.get(i as usize))
            .ok_or(CryptoError::UnknownKeyVersion(version))?;

        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);

        let cipher = ChaCha20Poly1305::new_from_slice(key)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
        let plain = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
        let plain = String::from_utf8(plain).map_err(|e| CryptoError::Decrypt(e.to_string()))?;

        // Read-only keyrings never rewrite what they read.
        if !self.sealing || Some(version) == self.current_version() {
            Ok(DecryptOutcome::Current(plain))
        } else {
            Ok(DecryptOutcome::Stale(plain))
        }
    }

    fn unsealed(&self, value: &str) -> DecryptOutcome {
        if self.is_enabled() {
            DecryptOutcome::Legacy(value.to_string())
        } else {
            DecryptOutcome::Current(value.to_string())
        }
    }
}

fn random_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    rand::rng().fill_bytes(&mut key);
    key
}

/// Split `v<digits>:<base64>` into its version and decoded bytes, when the
/// bytes are long enough to hold a nonce and a tag.
fn split_sealed(value: &str) -> Option<(u32, Vec<u8>)> {
    let rest = value.strip_prefix('v')?;
    let (digits, payload) = rest.split_once(':')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let sealed = STANDARD.decode(payload).ok()?;
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return None;
    }
    Some((digits.parse().ok()?, sealed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn encrypt_then_decrypt_is_current() {
        let crypto = Crypto::generate();
        let sealed = crypto.encrypt("test-guid").unwrap();

        assert_ne!(sealed, "test-guid");
        assert!(sealed.starts_with("v1:"));
        assert_eq!(
            crypto.decrypt(&sealed).unwrap(),
            DecryptOutcome::Current("test-guid".to_string())
        );
    }

    #[test]
    fn nonces_differ_between_encryptions() {
        let crypto = Crypto::generate();
        assert_ne!(crypto.encrypt("same").unwrap(), crypto.encrypt("same").unwrap());
    }

    #[test]
    fn plaintext_is_legacy() {
        let crypto = Crypto::generate();
        let outcome = crypto.decrypt("plain-token").unwrap();
        assert_eq!(outcome, DecryptOutcome::Legacy("plain-token".to_string()));
        assert!(outcome.needs_reencrypt());
    }

    #[test]
    fn rotated_key_still_decrypts_old_values() {
        let mut crypto = Crypto::generate();
        let old = crypto.encrypt("token").unwrap();

        assert_eq!(crypto.rotate(), 2);
        let new = crypto.encrypt("token").unwrap();
        assert!(new.starts_with("v2:"));

        let outcome = crypto.decrypt(&old).unwrap();
        assert_eq!(outcome, DecryptOutcome::Stale("token".to_string()));
        assert!(outcome.needs_reencrypt());
        assert!(!crypto.decrypt(&new).unwrap().needs_reencrypt());
    }

    #[test]
    fn unknown_version_and_tampering_fail() {
        let crypto = Crypto::generate();
        let sealed = crypto.encrypt("token").unwrap();

        let bumped = sealed.replacen("v1:", "v7:", 1);
        assert!(matches!(
            crypto.decrypt(&bumped),
            Err(CryptoError::UnknownKeyVersion(7))
        ));

        let other = Crypto::generate();
        assert!(matches!(other.decrypt(&sealed), Err(CryptoError::Decrypt(_))));
    }

    #[test]
    fn versioned_looking_plaintext_is_legacy() {
        let crypto = Crypto::generate();
        for value in ["v1:not base64!", "v2:", "v3:YWJj"] {
            assert_eq!(
                crypto.decrypt(value).unwrap(),
                DecryptOutcome::Legacy(value.to_string()),
                "{value}"
            );
        }
    }

    #[test]
    fn read_only_keyring_decrypts_but_does_not_encrypt() {
        let mut crypto = Crypto::generate();
        let old = crypto.encrypt("old").unwrap();
        crypto.rotate();
        let current = crypto.encrypt("current").unwrap();

        let reader = crypto.read_only();
        assert!(!reader.is_enabled());
        assert_eq!(reader.encrypt("token").unwrap(), "token");

        assert_eq!(
            reader.decrypt(&old).unwrap(),
            DecryptOutcome::Current("old".to_string())
        );
        assert_eq!(
            reader.decrypt(&current).unwrap(),
            DecryptOutcome::Current("current".to_string())
        );
        assert!(!reader.decrypt("plain").unwrap().needs_reencrypt());
    }

    #[test]
    fn disabled_passes_values_through() {
        let crypto = Crypto::disabled();
        assert_eq!(crypto.encrypt("token").unwrap(), "token");
        let outcome = crypto.decrypt("token").unwrap();
        assert!(!outcome.needs_reencrypt());
        assert_eq!(outcome.plaintext(), "token");
    }

    #[test]
    fn keyring_persists_across_loads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("token.key");

        let mut first = Crypto::load_or_create(&path).unwrap();
        first.rotate();
        first.save(&path).unwrap();
        let sealed = first.encrypt("token").unwrap();

        let second = Crypto::load_or_create(&path).unwrap();
        assert_eq!(second.current_version(), Some(2));
        assert_eq!(
            second.decrypt(&sealed).unwrap(),
            DecryptOutcome::Current("token".to_string())
        );
    }

    #[test]
    fn from_encoded_rejects_short_keys() {
        let short = STANDARD.encode([1u8; 8]);
        assert!(matches!(
            Crypto::from_encoded(&short),
            Err(CryptoError::InvalidKey(_))
        ));
        assert!(matches!(Crypto::from_encoded(""), Err(CryptoError::InvalidKey(_))));
    }
}
