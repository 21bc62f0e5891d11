use crate::error::Result;
use crate::fsutil::write_atomic;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use xxhash_rust::xxh3::Xxh3;

/// One file as seen in a directory listing; no file contents involved.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ListedFile {
    pub name: String,
    pub size: u64,
    pub mtime: i64,
}

/// Order-independent fingerprint of a directory's candidate files.
pub fn fingerprint(files: &[ListedFile]) -> u64 {
    let mut sorted: Vec<&ListedFile> = files.iter().collect();
    sorted.sort();
    let mut hasher = Xxh3::new();
    for file in sorted {
        hasher.update(file.name.as_bytes());
        hasher.update(&[0]);
        hasher.update(&file.size.to_le_bytes());
        hasher.update(&file.mtime.to_le_bytes());
    }
    hasher.digest()
}

/// Per-directory fingerprints from the previous scan of one root, keyed by
/// root-relative directory path.
#[derive(Debug, Default)]
pub struct ListingCache {
    path: Option<PathBuf>,
    dirs: BTreeMap<String, u64>,
}

#[derive(Serialize, Deserialize, Default)]
struct ListingFile {
    dirs: BTreeMap<String, u64>,
}

impl ListingCache {
    /// In-memory only; `save` is a no-op.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// A missing or unreadable file starts an empty cache.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let dirs = match fs::read(&path) {
            Ok(raw) => match serde_json::from_slice::<ListingFile>(&raw) {
                Ok(file) => file.dirs,
                Err(err) => {
                    log::warn!("Discarding listing cache {}: {}", path.display(), err);
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self {
            path: Some(path),
            dirs,
        }
    }

    pub fn is_unchanged(&self, dir: &str, fingerprint: u64) -> bool {
        self.dirs.get(dir) == Some(&fingerprint)
    }

    /// Replaces the recorded fingerprints with exactly `dirs`.
    pub fn replace(&mut self, dirs: BTreeMap<String, u64>) {
        self.dirs = dirs;
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec(&ListingFile {
            dirs: self.dirs.clone(),
        })?;
        write_atomic(path, &bytes)
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
