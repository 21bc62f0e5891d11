//! Durable, rebuildable catalog of one browsing root.
//!
//! A catalog is a set of immutable, hash-named CSV snapshots plus a small
//! pointer file naming the current one. The same pair is kept in the root
//! itself and in a per-root mirror under the cache directory; the pointer is
//! always rewritten last, so a reader never sees a pointer without its
//! snapshot.

use crate::error::{Error, Result};
use crate::fsutil::write_atomic;
use crate::models::{CatalogEntry, ContentHash, FastKey, Format};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use xxhash_rust::xxh3::xxh3_128;

pub const POINTER_NAME: &str = ".catalog.pointer";
const SNAPSHOT_PREFIX: &str = ".catalog.";
const SNAPSHOT_SUFFIX: &str = ".csv";
const HEADER: &str = "fast_key,file_size,content_hash,capture_date,format,path";

pub fn snapshot_file_name(hash: &str) -> String {
    format!("{SNAPSHOT_PREFIX}{hash}{SNAPSHOT_SUFFIX}")
}

/// Self-hash of serialized snapshot bytes.
pub fn snapshot_hash(bytes: &[u8]) -> String {
    format!("{:032x}", xxh3_128(bytes))
}

fn is_snapshot_hash(value: &str) -> bool {
    value.len() == 32 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Serializes rows in the iterator's order; callers pass them sorted by path.
pub fn encode_snapshot<'a>(entries: impl IntoIterator<Item = &'a CatalogEntry>) -> Vec<u8> {
    let mut out = String::with_capacity(4096);
    out.push_str(HEADER);
    out.push('\n');
    for entry in entries {
        out.push_str(&entry.fast_key.head_hex());
        out.push(',');
        out.push_str(&entry.fast_key.size.to_string());
        out.push(',');
        if let Some(hash) = entry.content_hash {
            out.push_str(&hash.to_hex());
        }
        out.push(',');
        out.push_str(&entry.capture_date.to_string());
        out.push(',');
        out.push_str(entry.format.as_str());
        out.push(',');
        out.push_str(&quote_path(&entry.path));
        out.push('\n');
    }
    out.into_bytes()
}

fn quote_path(path: &str) -> String {
    if path.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", path.replace('"', "\"\""))
    } else {
        path.to_string()
    }
}

fn unquote_path(raw: &str) -> String {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        raw[1..raw.len() - 1].replace("\"\"", "\"")
    } else {
        raw.to_string()
    }
}

/// Splits on newlines outside quoted fields, so quoted paths may contain them.
fn records(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    for (idx, byte) in text.bytes().enumerate() {
        match byte {
            b'"' => quoted = !quoted,
            b'\n' if !quoted => {
                out.push(text[start..idx].strip_suffix('\r').unwrap_or(&text[start..idx]));
                start = idx + 1;
            }
            _ => {}
        }
    }
    if start < text.len() {
        out.push(&text[start..]);
    }
    out
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<Vec<CatalogEntry>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::CorruptSnapshot(format!("not utf-8: {e}")))?;
    let mut lines = records(text).into_iter();
    match lines.next() {
        Some(HEADER) => {}
        other => {
            return Err(Error::CorruptSnapshot(format!(
                "unexpected header {other:?}"
            )))
        }
    }
    let mut entries = Vec::new();
    for (idx, line) in lines.enumerate() {
        if line.is_empty() {
            continue;
        }
        let corrupt = |what: &str| Error::CorruptSnapshot(format!("row {}: {what}", idx + 1));
        let cols: Vec<&str> = line.splitn(6, ',').collect();
        if cols.len() != 6 {
            return Err(corrupt("expected 6 columns"));
        }
        let fast_key = FastKey::from_parts(cols[0], cols[1]).ok_or_else(|| corrupt("bad fast key"))?;
        let content_hash = if cols[2].is_empty() {
            None
        } else {
            Some(cols[2].parse::<ContentHash>().map_err(|e| corrupt(&e))?)
        };
        let capture_date = cols[3].parse::<i64>().map_err(|_| corrupt("bad capture date"))?;
        let format = cols[4].parse::<Format>().map_err(|e| corrupt(&e))?;
        entries.push(CatalogEntry {
            path: unquote_path(cols[5]),
            fast_key,
            content_hash,
            capture_date,
            format,
        });
    }
    Ok(entries)
}

/// One directory that can hold a pointer and its snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotLocation {
    dir: PathBuf,
}

impl SnapshotLocation {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn pointer_path(&self) -> PathBuf {
        self.dir.join(POINTER_NAME)
    }

    pub fn snapshot_path(&self, hash: &str) -> PathBuf {
        self.dir.join(snapshot_file_name(hash))
    }

    pub fn read_pointer(&self) -> Result<String> {
        let raw = fs::read_to_string(self.pointer_path())?;
        let hash = raw.trim().to_string();
        if !is_snapshot_hash(&hash) {
            return Err(Error::CorruptSnapshot(format!(
                "pointer in {} holds {hash:?}",
                self.dir.display()
            )));
        }
        Ok(hash)
    }

    /// Resolves the pointer and returns its snapshot, verified against its self-hash.
    pub fn load(&self) -> Result<(String, Vec<CatalogEntry>)> {
        let hash = self.read_pointer()?;
        let bytes = fs::read(self.snapshot_path(&hash))?;
        let actual = snapshot_hash(&bytes);
        if actual != hash {
            return Err(Error::CorruptSnapshot(format!(
                "snapshot {hash} in {} hashes to {actual}",
                self.dir.display()
            )));
        }
        Ok((hash, decode_snapshot(&bytes)?))
    }

    pub fn write_snapshot(&self, hash: &str, bytes: &[u8]) -> Result<()> {
        write_atomic(&self.snapshot_path(hash), bytes)
    }

    pub fn write_pointer(&self, hash: &str) -> Result<()> {
        write_atomic(&self.pointer_path(), format!("{hash}\n").as_bytes())
    }

    /// Removes every snapshot not named in `keep`.
    pub fn prune(&self, keep: &[&str]) {
        let Ok(read_dir) = fs::read_dir(&self.dir) else {
            return;
        };
        for entry in read_dir.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(hash) = name
                .strip_prefix(SNAPSHOT_PREFIX)
                .and_then(|rest| rest.strip_suffix(SNAPSHOT_SUFFIX))
            else {
                continue;
            };
            if !is_snapshot_hash(hash) || keep.contains(&hash) {
                continue;
            }
            if let Err(err) = fs::remove_file(entry.path()) {
                log::debug!("Failed to prune snapshot {}: {}", entry.path().display(), err);
            }
        }
    }
}

/// Disk side of a catalog: the ordered locations plus the last published hashes.
#[derive(Debug)]
pub struct SnapshotStore {
    locations: Vec<SnapshotLocation>,
    current: Option<String>,
    previous: Option<String>,
}

impl SnapshotStore {
    pub fn new(locations: Vec<SnapshotLocation>) -> Self {
        Self {
            locations,
            current: None,
            previous: None,
        }
    }

    /// Tries each location in order; any failure falls through to the next,
    /// and exhausting them all yields a cold start rather than an error.
    pub fn load(&mut self) -> Vec<CatalogEntry> {
        for location in &self.locations {
            match location.load() {
                Ok((hash, entries)) => {
                    log::info!(
                        "Loaded catalog {} ({} entries) from {}",
                        hash,
                        entries.len(),
                        location.dir().display()
                    );
                    self.current = Some(hash);
                    return entries;
                }
                Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                    log::debug!("No catalog in {}", location.dir().display());
                }
                Err(err) => {
                    log::warn!(
                        "Discarding catalog in {}: {}",
                        location.dir().display(),
                        err
                    );
                }
            }
        }
        log::info!("No valid catalog found; starting empty");
        Vec::new()
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Writes the snapshot to every location first, then swaps the pointers of
    /// the locations that accepted it.
    pub fn publish(&mut self, bytes: &[u8]) -> Result<String> {
        let hash = snapshot_hash(bytes);
        let mut written = Vec::new();
        for location in &self.locations {
            match location.write_snapshot(&hash, bytes) {
                Ok(()) => written.push(location),
                Err(err) => log::warn!(
                    "Snapshot write to {} failed: {}",
                    location.dir().display(),
                    err
                ),
            }
        }
        if written.is_empty() {
            return Err(Error::Init(format!(
                "snapshot {hash} could not be written to any catalog location"
            )));
        }

        let mut pointed = 0;
        for location in &written {
            match location.write_pointer(&hash) {
                Ok(()) => pointed += 1,
                Err(err) => log::warn!(
                    "Pointer update in {} failed: {}",
                    location.dir().display(),
                    err
                ),
            }
        }
        if pointed == 0 {
            return Err(Error::Init(format!("no pointer could be updated to {hash}")));
        }

        if self.current.as_deref() != Some(hash.as_str()) {
            self.previous = self.current.take();
            self.current = Some(hash.clone());
        }
        let mut keep = vec![hash.as_str()];
        if let Some(previous) = self.previous.as_deref() {
            keep.push(previous);
        }
        for location in &written {
            location.prune(&keep);
        }
        log::info!("Published catalog snapshot {hash}");
        Ok(hash)
    }
}

/// Added, changed and removed rows between the catalog and a fresh listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogDiff {
    pub added: Vec<(String, FastKey)>,
    pub changed: Vec<(String, FastKey)>,
    pub removed: Vec<String>,
}

impl CatalogDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

/// In-memory side of a catalog. Mutations never touch disk.
#[derive(Debug, Clone, Default)]
pub struct WorkingCopy {
    entries: BTreeMap<String, CatalogEntry>,
}

impl WorkingCopy {
    pub fn from_entries(entries: impl IntoIterator<Item = CatalogEntry>) -> Self {
        let mut copy = Self::default();
        copy.upsert(entries);
        copy
    }

    /// Merges rows by path. A known content hash survives an upsert that
    /// carries the same fast key but no hash.
    pub fn upsert(&mut self, entries: impl IntoIterator<Item = CatalogEntry>) {
        for mut entry in entries {
            if entry.content_hash.is_none() {
                if let Some(existing) = self.entries.get(&entry.path) {
                    if existing.fast_key == entry.fast_key {
                        entry.content_hash = existing.content_hash;
                    }
                }
            }
            self.entries.insert(entry.path.clone(), entry);
        }
    }

    pub fn remove<'a>(&mut self, paths: impl IntoIterator<Item = &'a String>) {
        for path in paths {
            self.entries.remove(path);
        }
    }

    pub fn diff(&self, discovered: &HashMap<String, FastKey>) -> CatalogDiff {
        let mut diff = CatalogDiff::default();
        for (path, key) in discovered {
            match self.entries.get(path) {
                None => diff.added.push((path.clone(), *key)),
                Some(entry) if entry.fast_key != *key => diff.changed.push((path.clone(), *key)),
                Some(_) => {}
            }
        }
        diff.removed = self
            .entries
            .keys()
            .filter(|path| !discovered.contains_key(*path))
            .cloned()
            .collect();
        diff.added.sort();
        diff.changed.sort();
        diff
    }

    pub fn get(&self, path: &str) -> Option<&CatalogEntry> {
        self.entries.get(path)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_snapshot(self.entries.values())
    }
}

/// The catalog of one browsing root: disk store plus working copy.
#[derive(Debug)]
pub struct Catalog {
    root: PathBuf,
    store: SnapshotStore,
    working: WorkingCopy,
}

impl Catalog {
    /// Opens the catalog, preferring the in-root pointer over the mirror.
    /// Never fails: unusable state degrades to an empty catalog.
    pub fn open(root: &Path, mirror_dir: &Path) -> Self {
        let mut store = SnapshotStore::new(vec![
            SnapshotLocation::new(root),
            SnapshotLocation::new(mirror_dir),
        ]);
        let entries = store.load();
        Self {
            root: root.to_path_buf(),
            store,
            working: WorkingCopy::from_entries(entries),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn upsert(&mut self, entries: impl IntoIterator<Item = CatalogEntry>) {
        self.working.upsert(entries);
    }

    pub fn remove<'a>(&mut self, paths: impl IntoIterator<Item = &'a String>) {
        self.working.remove(paths);
    }

    pub fn publish(&mut self) -> Result<String> {
        let bytes = self.working.encode();
        self.store.publish(&bytes)
    }

    pub fn diff(&self, discovered: &HashMap<String, FastKey>) -> CatalogDiff {
        self.working.diff(discovered)
    }

    pub fn current_snapshot(&self) -> Option<&str> {
        self.store.current()
    }

    pub fn working(&self) -> &WorkingCopy {
        &self.working
    }

    /// Known (fast key, content hash) pairs, for seeding the hash memo.
    pub fn known_hashes(&self) -> Vec<(FastKey, ContentHash)> {
        self.working
            .entries()
            .filter_map(|e| e.content_hash.map(|h| (e.fast_key, h)))
            .collect()
    }

    pub fn into_parts(self) -> (PathBuf, SnapshotStore, WorkingCopy) {
        (self.root, self.store, self.working)
    }
}
