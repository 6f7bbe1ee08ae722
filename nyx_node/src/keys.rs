//! Secret key files: one file per key, created on first start.

use std::fs;
use std::io::{Error, ErrorKind};
use std::path::Path;

use rand::thread_rng;

use nyx_crypto::{SecretKey, SigningKey, KEY_SIZE};

fn read_key_bytes(path: &Path) -> std::io::Result<Option<[u8; 32]>> {
    match fs::read(path) {
        Ok(bytes) => {
            if bytes.len() != KEY_SIZE {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("{} is not a {} byte key file", path.display(), KEY_SIZE),
                ));
            }
            let mut key = [0; KEY_SIZE];
            key.copy_from_slice(&bytes);
            Ok(Some(key))
        }
        Err(ref e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Load the identity signing key from `path`, generating and writing a
/// fresh one when the file does not exist.
pub fn load_or_create_identity(path: &Path) -> std::io::Result<SigningKey> {
    match read_key_bytes(path)? {
        Some(bytes) => Ok(SigningKey::from_bytes(&bytes)),
        None => {
            info!("generating identity key at {}", path.display());
            let key = SigningKey::generate(&mut thread_rng());
            fs::write(path, key.to_bytes())?;
            Ok(key)
        }
    }
}

/// Load the onion encryption key from `path`, generating and writing a
/// fresh one when the file does not exist.
pub fn load_or_create_encryption(path: &Path) -> std::io::Result<SecretKey> {
    match read_key_bytes(path)? {
        Some(bytes) => Ok(SecretKey::from(bytes)),
        None => {
            info!("generating encryption key at {}", path.display());
            let key = SecretKey::generate(&mut thread_rng());
            fs::write(path, key.to_bytes())?;
            Ok(key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");

        let first = load_or_create_identity(&path).unwrap();
        let second = load_or_create_identity(&path).unwrap();
        assert_eq!(first.to_bytes(), second.to_bytes());
    }

    #[test]
    fn encryption_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("encryption.key");

        let first = load_or_create_encryption(&path).unwrap();
        let second = load_or_create_encryption(&path).unwrap();
        assert_eq!(first.to_bytes(), second.to_bytes());
    }

    #[test]
    fn truncated_key_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        std::fs::write(&path, b"short").unwrap();
        assert!(load_or_create_identity(&path).is_err());
    }
}
