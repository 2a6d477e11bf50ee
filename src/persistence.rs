// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Encrypted files below the chain data directory.
//!
//! Files are encrypted with ChaCha20-Poly1305 under a key derived from the
//! operator password with Argon2id. The salt lives next to the data in
//! `.salt`. Every file is `nonce || ciphertext`.
//!
//! ```text
//! {root}/{directory}/{name}            live records
//! {root}/archive/{directory}/{name}    archived records
//! {root}/snapshot/{directory}/{name}   snapshots
//! ```

use crate::errors::{InternalError, Result};
use argon2::Argon2;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

const NONCE_SIZE: usize = 12;
const SALT_SIZE: usize = 16;
const SALT_FILE: &str = ".salt";
const TEMP_EXTENSION: &str = "tmp";

/// Name of the directory receiving archived records.
pub const ARCHIVE_DIRECTORY: &str = "archive";
/// Name of the directory receiving snapshots.
pub const SNAPSHOT_DIRECTORY: &str = "snapshot";

/// One decrypted file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    /// Directory the file lives in, relative to the root
    pub directory: String,
    /// File name
    pub name: String,
    /// Decrypted content
    pub content: Vec<u8>,
}

/// Encrypted storage rooted at one directory.
pub struct EncryptedPersistence {
    root: PathBuf,
    key: Zeroizing<[u8; 32]>,
}

impl std::fmt::Debug for EncryptedPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedPersistence")
            .field("root", &self.root)
            .field("key", &"[redacted]")
            .finish()
    }
}

fn io_err(path: &Path, e: std::io::Error) -> InternalError {
    InternalError::Persistence(format!("{}: {e}", path.display()))
}

fn check_component(component: &str) -> Result<()> {
    if component.is_empty()
        || component.starts_with('.')
        || component.contains(['/', '\\'])
        || component == ARCHIVE_DIRECTORY
        || component == SNAPSHOT_DIRECTORY
    {
        return arg_err!(format!("`{component}` cannot be used as a file name"));
    }
    Ok(())
}

/// Write `content` to `path` through a temporary file, readable by the owner
/// only.
fn write_atomically(path: &Path, content: &[u8]) -> Result<()> {
    let temp_path = path.with_extension(TEMP_EXTENSION);
    fs::write(&temp_path, content).map_err(|e| io_err(&temp_path, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&temp_path, fs::Permissions::from_mode(0o600))
            .map_err(|e| io_err(&temp_path, e))?;
    }
    fs::rename(&temp_path, path).map_err(|e| io_err(path, e))
}

impl EncryptedPersistence {
    /// Open (or create) storage at `root`, deriving the file key from
    /// `password`.
    #[instrument(skip(password), err(Debug))]
    pub fn open(root: &Path, password: &str) -> Result<Self> {
        fs::create_dir_all(root).map_err(|e| io_err(root, e))?;
        let salt_path = root.join(SALT_FILE);
        let salt = match fs::read(&salt_path) {
            Ok(salt) if salt.len() == SALT_SIZE => salt,
            Ok(_) => {
                return Err(InternalError::Persistence(format!(
                    "{}: malformed salt",
                    salt_path.display()
                )))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut salt = vec![0u8; SALT_SIZE];
                OsRng.fill_bytes(&mut salt);
                write_atomically(&salt_path, &salt)?;
                salt
            }
            Err(e) => return Err(io_err(&salt_path, e)),
        };

        let mut key = Zeroizing::new([0u8; 32]);
        Argon2::default()
            .hash_password_into(password.as_bytes(), &salt, key.as_mut_slice())
            .map_err(|e| InternalError::Persistence(format!("key derivation failed: {e}")))?;
        Ok(Self {
            root: root.to_path_buf(),
            key,
        })
    }

    /// The storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305> {
        ChaCha20Poly1305::new_from_slice(self.key.as_slice())
            .map_err(|_| InternalError::InternalInvariantFailed)
    }

    fn encrypt(&self, content: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce), content)
            .map_err(|_| InternalError::Persistence("encryption failed".into()))?;
        let mut encrypted = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        encrypted.extend_from_slice(&nonce);
        encrypted.extend_from_slice(&ciphertext);
        Ok(encrypted)
    }

    fn decrypt(&self, path: &Path, encrypted: &[u8]) -> Result<Vec<u8>> {
        if encrypted.len() < NONCE_SIZE {
            return Err(InternalError::Decryption(format!(
                "{}: file too short",
                path.display()
            )));
        }
        let (nonce, ciphertext) = encrypted.split_at(NONCE_SIZE);
        self.cipher()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| InternalError::Decryption(path.display().to_string()))
    }

    fn write_under(&self, base: &Path, directory: &str, name: &str, content: &[u8]) -> Result<()> {
        check_component(directory)?;
        check_component(name)?;
        let directory = base.join(directory);
        fs::create_dir_all(&directory).map_err(|e| io_err(&directory, e))?;
        write_atomically(&directory.join(name), &self.encrypt(content)?)
    }

    /// Encrypt and write `content` to `{root}/{directory}/{name}`.
    pub fn save(&self, directory: &str, name: &str, content: &[u8]) -> Result<()> {
        self.write_under(&self.root, directory, name, content)?;
        debug!("Stored {directory}/{name}");
        Ok(())
    }

    /// Encrypt and write a copy of `content` to the snapshot directory.
    pub fn snapshot(&self, directory: &str, name: &str, content: &[u8]) -> Result<()> {
        self.write_under(&self.root.join(SNAPSHOT_DIRECTORY), directory, name, content)?;
        info!("Stored snapshot of {directory}/{name}");
        Ok(())
    }

    /// Decrypt every live file. Any file that fails to decrypt fails the
    /// whole read.
    #[instrument(skip_all, err(Debug))]
    pub fn read_all(&self) -> Result<Vec<StoredFile>> {
        let mut files = Vec::new();
        let entries = fs::read_dir(&self.root).map_err(|e| io_err(&self.root, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&self.root, e))?;
            let directory = entry.file_name().to_string_lossy().into_owned();
            if !entry.path().is_dir() || check_component(&directory).is_err() {
                continue;
            }
            let inner = fs::read_dir(entry.path()).map_err(|e| io_err(&entry.path(), e))?;
            for file in inner {
                let file = file.map_err(|e| io_err(&entry.path(), e))?;
                let path = file.path();
                if !path.is_file() || path.extension().is_some_and(|ext| ext == TEMP_EXTENSION) {
                    continue;
                }
                let encrypted = fs::read(&path).map_err(|e| io_err(&path, e))?;
                files.push(StoredFile {
                    directory: directory.clone(),
                    name: file.file_name().to_string_lossy().into_owned(),
                    content: self.decrypt(&path, &encrypted)?,
                });
            }
        }
        files.sort_by(|a, b| (&a.directory, &a.name).cmp(&(&b.directory, &b.name)));
        Ok(files)
    }

    /// Move `{root}/{directory}` below the archive directory. An earlier
    /// archive of the same name is kept under a numbered name.
    #[instrument(skip(self), err(Debug))]
    pub fn archive(&self, directory: &str) -> Result<()> {
        check_component(directory)?;
        let source = self.root.join(directory);
        if !source.exists() {
            warn!("Nothing to archive for {directory}");
            return Ok(());
        }
        let archive = self.root.join(ARCHIVE_DIRECTORY);
        fs::create_dir_all(&archive).map_err(|e| io_err(&archive, e))?;
        let mut target = archive.join(directory);
        let mut suffix = 1;
        while target.exists() {
            target = archive.join(format!("{directory}.{suffix}"));
            suffix += 1;
        }
        fs::rename(&source, &target).map_err(|e| io_err(&source, e))?;
        info!("Archived {directory}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn saved_files_read_back_and_are_encrypted() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let persistence = EncryptedPersistence::open(dir.path(), "password")?;
        persistence.save("0xkeep", "membership_1", b"signer bytes")?;
        persistence.save("0xother", "membership_0", b"other signer")?;

        let raw = fs::read(dir.path().join("0xkeep").join("membership_1")).unwrap();
        assert!(!raw.windows(12).any(|w| w == b"signer bytes"));

        let reopened = EncryptedPersistence::open(dir.path(), "password")?;
        let files = reopened.read_all()?;
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].directory, "0xkeep");
        assert_eq!(files[0].name, "membership_1");
        assert_eq!(files[0].content, b"signer bytes");
        Ok(())
    }

    #[test]
    fn wrong_password_fails_loudly() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        EncryptedPersistence::open(dir.path(), "password")?.save("0xkeep", "membership_0", b"x")?;
        let wrong = EncryptedPersistence::open(dir.path(), "guess")?;
        assert!(matches!(wrong.read_all(), Err(InternalError::Decryption(_))));
        Ok(())
    }

    #[test]
    fn archived_and_snapshot_files_are_not_live() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let persistence = EncryptedPersistence::open(dir.path(), "password")?;
        persistence.save("0xkeep", "membership_0", b"first")?;
        persistence.snapshot("0xkeep", "membership_0", b"first")?;
        persistence.archive("0xkeep")?;
        assert!(persistence.read_all()?.is_empty());
        assert!(dir.path().join(ARCHIVE_DIRECTORY).join("0xkeep").exists());
        assert!(dir
            .path()
            .join(SNAPSHOT_DIRECTORY)
            .join("0xkeep")
            .join("membership_0")
            .exists());

        // A second archive of the same keep does not clobber the first.
        persistence.save("0xkeep", "membership_0", b"second")?;
        persistence.archive("0xkeep")?;
        assert!(dir.path().join(ARCHIVE_DIRECTORY).join("0xkeep.1").exists());
        Ok(())
    }

    #[test]
    fn path_components_are_checked() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = EncryptedPersistence::open(dir.path(), "password").unwrap();
        assert!(persistence.save("../escape", "x", b"x").is_err());
        assert!(persistence.save("archive", "x", b"x").is_err());
        assert!(persistence.save("0xkeep", ".salt", b"x").is_err());
    }
}
