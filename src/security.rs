//! Master key access and the master-key-bound encryption entry points.
//!
//! The master key store itself is opaque to the engine; all the core
//! requires is that the same key is consistently supplied across the
//! lifetime of whatever wrote the users file and this reader.

use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::crypto::{self, Encryption};
use crate::error::{ConfigError, Error, Result};

/// Relative location of the default master key file under the home
/// directory.
pub const MASTER_KEY_FILE: &str = ".pgvictoria/master.key";

/// Supplies the process-wide symmetric master key.
pub trait SecretStore: Send + Sync {
    fn master_key(&self) -> Result<String>;
}

/// Reads the master key from a base64-encoded file, by default
/// `$HOME/.pgvictoria/master.key`.
pub struct FileSecretStore {
    path: PathBuf,
}

impl FileSecretStore {
    pub fn new() -> Self {
        let home = std::env::var("HOME").unwrap_or_default();
        FileSecretStore {
            path: Path::new(&home).join(MASTER_KEY_FILE),
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        FileSecretStore { path: path.into() }
    }
}

impl Default for FileSecretStore {
    fn default() -> Self {
        FileSecretStore::new()
    }
}

impl SecretStore for FileSecretStore {
    fn master_key(&self) -> Result<String> {
        let content =
            std::fs::read_to_string(&self.path).map_err(|_| Error::Config(ConfigError::MasterKey))?;

        let decoded = BASE64
            .decode(content.trim())
            .map_err(|_| Error::Config(ConfigError::MasterKey))?;

        String::from_utf8(decoded).map_err(|_| Error::Config(ConfigError::MasterKey))
    }
}

/// Encrypts a buffer with the master key.
pub fn encrypt_buffer(
    secrets: &dyn SecretStore,
    plaintext: &[u8],
    mode: Encryption,
) -> Result<Vec<u8>> {
    let master_key = secrets.master_key()?;
    crypto::encrypt(plaintext, &master_key, mode)
}

/// Decrypts a buffer with the master key.
pub fn decrypt_buffer(
    secrets: &dyn SecretStore,
    ciphertext: &[u8],
    mode: Encryption,
) -> Result<Vec<u8>> {
    let master_key = secrets.master_key()?;
    crypto::decrypt(ciphertext, &master_key, mode)
}

/// Encrypts a file with the master key; see [`crypto::encrypt_file`].
pub fn encrypt_file(secrets: &dyn SecretStore, from: &Path, to: Option<&Path>) -> Result<()> {
    let master_key = secrets.master_key()?;
    crypto::encrypt_file(from, to, &master_key)
}

/// Decrypts a file with the master key; see [`crypto::decrypt_file`].
pub fn decrypt_file(secrets: &dyn SecretStore, from: &Path, to: Option<&Path>) -> Result<()> {
    let master_key = secrets.master_key()?;
    crypto::decrypt_file(from, to, &master_key)
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// Secret store with a fixed key, for tests.
    pub struct FixedKey(pub String);

    impl SecretStore for FixedKey {
        fn master_key(&self) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    /// Secret store with no key, for tests of the missing-key status.
    pub struct NoKey;

    impl SecretStore for NoKey {
        fn master_key(&self) -> Result<String> {
            Err(Error::Config(ConfigError::MasterKey))
        }
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.key");
        std::fs::write(&path, BASE64.encode("topsecret")).unwrap();

        let store = FileSecretStore::from_path(&path);
        assert_eq!("topsecret", store.master_key().unwrap());
    }

    #[test]
    fn test_missing_key_file() {
        let store = FileSecretStore::from_path("/nonexistent/master.key");
        assert!(matches!(
            store.master_key(),
            Err(Error::Config(ConfigError::MasterKey))
        ));
    }

    #[test]
    fn test_garbage_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.key");
        std::fs::write(&path, "not base64 at all!!!").unwrap();

        let store = FileSecretStore::from_path(&path);
        assert!(store.master_key().is_err());
    }

    #[test]
    fn test_buffer_wrappers_round_trip() {
        let secrets = FixedKey("master".into());

        for mode in [Encryption::Aes256Cbc, Encryption::Aes128Ctr] {
            let ciphertext = encrypt_buffer(&secrets, b"payload", mode).unwrap();
            let plaintext = decrypt_buffer(&secrets, &ciphertext, mode).unwrap();
            assert_eq!(b"payload", &plaintext[..]);
        }
    }

    #[test]
    fn test_file_wrappers_delete_source() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("data.txt");
        std::fs::write(&plain, b"contents").unwrap();

        let secrets = FixedKey("master".into());
        encrypt_file(&secrets, &plain, None).unwrap();
        assert!(!plain.exists());

        let encrypted = dir.path().join("data.txt.aes");
        decrypt_file(&secrets, &encrypted, None).unwrap();
        assert!(!encrypted.exists());
        assert_eq!(b"contents", &std::fs::read(&plain).unwrap()[..]);
    }
}
