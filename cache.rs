use crate::config::CacheConfig;
use crate::error::Result;
use crate::fsutil::write_atomic;
use crate::models::{ArtifactKind, ContentHash};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use sysinfo::System;

type ArtifactKey = (ContentHash, ArtifactKind);

struct Slot {
    bytes: Arc<Vec<u8>>,
    tick: u64,
}

/// Least-recently-used map bounded by entry count and total bytes.
struct MemoryTier {
    slots: HashMap<ArtifactKey, Slot>,
    order: BTreeMap<u64, ArtifactKey>,
    bytes: u64,
    tick: u64,
    max_entries: usize,
    max_bytes: u64,
}

impl MemoryTier {
    fn new(max_entries: usize, max_bytes: u64) -> Self {
        Self {
            slots: HashMap::new(),
            order: BTreeMap::new(),
            bytes: 0,
            tick: 0,
            max_entries,
            max_bytes,
        }
    }

    fn get(&mut self, key: &ArtifactKey) -> Option<Arc<Vec<u8>>> {
        self.tick += 1;
        let tick = self.tick;
        let slot = self.slots.get_mut(key)?;
        self.order.remove(&slot.tick);
        slot.tick = tick;
        self.order.insert(tick, *key);
        Some(slot.bytes.clone())
    }

    fn insert(&mut self, key: ArtifactKey, bytes: Arc<Vec<u8>>) {
        let size = bytes.len() as u64;
        if size > self.max_bytes || self.max_entries == 0 {
            return;
        }
        self.remove(&key);
        self.tick += 1;
        self.order.insert(self.tick, key);
        self.slots.insert(
            key,
            Slot {
                bytes,
                tick: self.tick,
            },
        );
        self.bytes += size;
        while self.slots.len() > self.max_entries || self.bytes > self.max_bytes {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            if let Some(slot) = self.slots.remove(&oldest) {
                self.bytes -= slot.bytes.len() as u64;
            }
        }
    }

    fn remove(&mut self, key: &ArtifactKey) {
        if let Some(slot) = self.slots.remove(key) {
            self.order.remove(&slot.tick);
            self.bytes -= slot.bytes.len() as u64;
        }
    }

    fn clear(&mut self) {
        self.slots.clear();
        self.order.clear();
        self.bytes = 0;
    }
}

/// Sizes the memory tier as a fraction of currently available memory.
pub fn memory_budget(config: &CacheConfig) -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    let available = sys.available_memory();
    let budget = (available as f64 * config.memory_fraction) as u64;
    budget.clamp(config.min_memory_bytes, config.max_memory_bytes.max(config.min_memory_bytes))
}

/// Content-hash keyed artifact store: bounded memory tier over a sharded disk tier.
///
/// Disk layout is `{dir}/{shard}/{hash}.{ext}` where `shard` is the first two
/// hex characters of the hash.
pub struct ContentCache {
    dir: PathBuf,
    memory: Mutex<MemoryTier>,
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
}

impl ContentCache {
    pub fn open(dir: impl Into<PathBuf>, config: &CacheConfig) -> Result<Self> {
        let budget = memory_budget(config);
        log::info!(
            "Content cache memory budget: {} bytes, {} entries",
            budget,
            config.max_memory_entries
        );
        Self::with_limits(dir, config.max_memory_entries, budget)
    }

    pub fn with_limits(dir: impl Into<PathBuf>, max_entries: usize, max_bytes: u64) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            memory: Mutex::new(MemoryTier::new(max_entries, max_bytes)),
            memory_hits: AtomicU64::new(0),
            disk_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn artifact_path(&self, hash: &ContentHash, kind: ArtifactKind) -> PathBuf {
        self.dir
            .join(hash.shard())
            .join(format!("{}.{}", hash, kind.ext()))
    }

    /// Memory first, then disk (promoting a disk hit into memory). `None`
    /// means the caller has to generate the artifact.
    pub fn get(&self, hash: &ContentHash, kind: ArtifactKind) -> Result<Option<Arc<Vec<u8>>>> {
        let key = (*hash, kind);
        if let Some(bytes) = self.lock_memory().get(&key) {
            self.memory_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(bytes));
        }
        match fs::read(self.artifact_path(hash, kind)) {
            Ok(bytes) => {
                self.disk_hits.fetch_add(1, Ordering::Relaxed);
                let bytes = Arc::new(bytes);
                self.lock_memory().insert(key, bytes.clone());
                Ok(Some(bytes))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn put(&self, hash: &ContentHash, kind: ArtifactKind, bytes: Vec<u8>) -> Result<Arc<Vec<u8>>> {
        write_atomic(&self.artifact_path(hash, kind), &bytes)?;
        let bytes = Arc::new(bytes);
        self.lock_memory().insert((*hash, kind), bytes.clone());
        Ok(bytes)
    }

    pub fn contains(&self, hash: &ContentHash, kind: ArtifactKind) -> bool {
        self.lock_memory().slots.contains_key(&(*hash, kind))
            || self.artifact_path(hash, kind).exists()
    }

    /// Drops the memory tier only; disk artifacts stay.
    pub fn evict_memory(&self) {
        self.lock_memory().clear();
    }

    /// Explicit cache clear: both tiers.
    pub fn clear(&self) -> Result<()> {
        self.lock_memory().clear();
        if self.dir.exists() {
            for entry in fs::read_dir(&self.dir)? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    fs::remove_dir_all(entry.path())?;
                }
            }
        }
        log::info!("Cleared content cache at {}", self.dir.display());
        Ok(())
    }

    /// (entries, bytes) held in memory.
    pub fn memory_usage(&self) -> (usize, u64) {
        let memory = self.lock_memory();
        (memory.slots.len(), memory.bytes)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn lock_memory(&self) -> std::sync::MutexGuard<'_, MemoryTier> {
        self.memory.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(b: u8) -> ContentHash {
        ContentHash::from_bytes([b; 16])
    }

    #[test]
    fn put_then_get_returns_identical_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::with_limits(dir.path(), 16, 1 << 20).unwrap();
        assert!(cache.get(&hash(1), ArtifactKind::Thumbnail).unwrap().is_none());
        cache
            .put(&hash(1), ArtifactKind::Thumbnail, b"thumb".to_vec())
            .unwrap();
        let got = cache.get(&hash(1), ArtifactKind::Thumbnail).unwrap().unwrap();
        assert_eq!(got.as_slice(), b"thumb");
        assert!(cache.get(&hash(1), ArtifactKind::Metadata).unwrap().is_none());
        assert!(cache
            .artifact_path(&hash(1), ArtifactKind::Thumbnail)
            .ends_with("01/01010101010101010101010101010101.thumb"));
    }

    #[test]
    fn disk_tier_survives_a_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = ContentCache::with_limits(dir.path(), 16, 1 << 20).unwrap();
            cache.put(&hash(2), ArtifactKind::Metadata, b"{}".to_vec()).unwrap();
        }
        let cache = ContentCache::with_limits(dir.path(), 16, 1 << 20).unwrap();
        assert_eq!(
            cache.get(&hash(2), ArtifactKind::Metadata).unwrap().unwrap().as_slice(),
            b"{}"
        );
        assert_eq!(cache.stats().disk_hits, 1);
        cache.get(&hash(2), ArtifactKind::Metadata).unwrap();
        assert_eq!(cache.stats().memory_hits, 1);
    }

    #[test]
    fn memory_tier_evicts_least_recently_used() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::with_limits(dir.path(), 2, 1 << 20).unwrap();
        cache.put(&hash(1), ArtifactKind::Thumbnail, vec![1; 10]).unwrap();
        cache.put(&hash(2), ArtifactKind::Thumbnail, vec![2; 10]).unwrap();
        cache.get(&hash(1), ArtifactKind::Thumbnail).unwrap();
        cache.put(&hash(3), ArtifactKind::Thumbnail, vec![3; 10]).unwrap();

        let memory = cache.lock_memory();
        assert!(memory.slots.contains_key(&(hash(1), ArtifactKind::Thumbnail)));
        assert!(!memory.slots.contains_key(&(hash(2), ArtifactKind::Thumbnail)));
        assert_eq!(memory.bytes, 20);
    }

    #[test]
    fn memory_tier_respects_byte_budget() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::with_limits(dir.path(), 100, 25).unwrap();
        cache.put(&hash(1), ArtifactKind::Thumbnail, vec![1; 10]).unwrap();
        cache.put(&hash(2), ArtifactKind::Thumbnail, vec![2; 10]).unwrap();
        cache.put(&hash(3), ArtifactKind::Thumbnail, vec![3; 10]).unwrap();
        assert_eq!(cache.memory_usage(), (2, 20));
        // Evicted from memory, still served from disk.
        assert!(cache.get(&hash(1), ArtifactKind::Thumbnail).unwrap().is_some());
    }

    #[test]
    fn clear_removes_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::with_limits(dir.path(), 16, 1 << 20).unwrap();
        cache.put(&hash(4), ArtifactKind::Thumbnail, vec![4; 4]).unwrap();
        cache.clear().unwrap();
        assert!(!cache.contains(&hash(4), ArtifactKind::Thumbnail));
        assert!(cache.get(&hash(4), ArtifactKind::Thumbnail).unwrap().is_none());
    }

    #[test]
    fn budget_is_clamped() {
        let config = CacheConfig {
            memory_fraction: 0.0,
            max_memory_entries: 10,
            min_memory_bytes: 1024,
            max_memory_bytes: 4096,
        };
        assert_eq!(memory_budget(&config), 1024);
    }
}
