// Copyright (c) 2023 Bolt Labs Holdings, Inc
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree and the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree.

//! Last used derivation index per extended public key.
//!
//! Layout: `{data_dir}/derivation_indexes/{prefix}_{last 8 chars}/{index}`,
//! one empty file per used index.

use crate::errors::{InternalError, Result};
use std::{
    fs,
    path::{Path, PathBuf},
};

const DIRECTORY: &str = "derivation_indexes";

fn io_error(path: &Path, e: std::io::Error) -> InternalError {
    InternalError::Persistence(format!("{}: {e}", path.display()))
}

/// Records which child indexes of extended keys were handed out.
#[derive(Debug, Clone)]
pub struct DerivationIndexStore {
    root: PathBuf,
}

impl DerivationIndexStore {
    /// A store below `data_dir`.
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join(DIRECTORY),
        }
    }

    fn directory(&self, extended_key: &str) -> Result<PathBuf> {
        if extended_key.len() < 12 || !extended_key.is_ascii() {
            return Err(InternalError::Configuration(
                "extended key is too short".into(),
            ));
        }
        let prefix = &extended_key[..4];
        let suffix = &extended_key[extended_key.len() - 8..];
        Ok(self.root.join(format!("{prefix}_{suffix}")))
    }

    /// The highest index recorded for `extended_key`.
    pub fn read(&self, extended_key: &str) -> Result<Option<u32>> {
        let directory = self.directory(extended_key)?;
        let entries = match fs::read_dir(&directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&directory, e)),
        };
        let mut highest = None;
        for entry in entries {
            let entry = entry.map_err(|e| io_error(&directory, e))?;
            // Foreign files are ignored.
            if let Some(index) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            {
                highest = highest.max(Some(index));
            }
        }
        Ok(highest)
    }

    /// Record `index` as used for `extended_key`.
    pub fn save(&self, extended_key: &str, index: u32) -> Result<()> {
        let directory = self.directory(extended_key)?;
        fs::create_dir_all(&directory).map_err(|e| io_error(&directory, e))?;
        let path = directory.join(index.to_string());
        fs::write(&path, []).map_err(|e| io_error(&path, e))
    }
}
