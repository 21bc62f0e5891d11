//! Mirrors catalog entries to an object store.
//!
//! Remote layout per namespace:
//! `photos/{ns}/{hash}.dat` (format recorded as object metadata),
//! `thumbnails/{ns}/{hash}.jpg`, and a catalog snapshot/pointer pair under
//! `catalogs/{ns}/` laid out like the local one.

use crate::addresser;
use crate::cache::ContentCache;
use crate::catalog::{self, SnapshotLocation, WorkingCopy, POINTER_NAME};
use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::events::{EventBus, LibraryEvent};
use crate::models::{ArtifactKind, BackupQueueItem, CatalogEntry, ContentHash, Format, Namespace};
use crate::remote::ObjectStore;
use crate::thumbnails;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

const PURGE_PREFIXES: [&str; 4] = ["photos", "thumbnails", "catalogs", "users"];
const PURGE_CHUNK: usize = 1000;

pub fn photo_key(ns: &Namespace, hash: &ContentHash) -> String {
    format!("photos/{ns}/{hash}.dat")
}

pub fn thumbnail_key(ns: &Namespace, hash: &ContentHash) -> String {
    format!("thumbnails/{ns}/{hash}.jpg")
}

pub fn catalog_pointer_key(ns: &Namespace) -> String {
    format!("catalogs/{ns}/{POINTER_NAME}")
}

pub fn catalog_snapshot_key(ns: &Namespace, snapshot: &str) -> String {
    format!("catalogs/{ns}/{}", catalog::snapshot_file_name(snapshot))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemResult {
    Uploaded {
        hash: ContentHash,
        deduplicated: bool,
    },
    Failed {
        error: String,
        retryable: bool,
    },
    /// Not attempted; the item stays queued for a later batch.
    Skipped,
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub outcomes: Vec<(String, ItemResult)>,
    pub uploaded: usize,
    pub deduplicated: usize,
    pub failed: usize,
    pub skipped: usize,
    pub quota_exceeded: bool,
    pub remote_unavailable: bool,
    pub cancelled: bool,
    /// Remote snapshot after the batch, if one was published or already current.
    pub snapshot: Option<String>,
}

impl BatchReport {
    fn record(&mut self, path: &str, result: ItemResult) {
        match &result {
            ItemResult::Uploaded { deduplicated, .. } => {
                self.uploaded += 1;
                if *deduplicated {
                    self.deduplicated += 1;
                }
            }
            ItemResult::Failed { .. } => self.failed += 1,
            ItemResult::Skipped => self.skipped += 1,
        }
        self.outcomes.push((path.to_string(), result));
    }
}

#[derive(Debug, Clone, Default)]
pub struct PulledCatalog {
    pub snapshot: Option<String>,
    pub entries: Vec<CatalogEntry>,
    /// Served from the local mirror because the remote could not be reached.
    pub offline: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// (prefix, deleted, failed)
    pub prefixes: Vec<(String, usize, usize)>,
}

impl PurgeReport {
    pub fn deleted(&self) -> usize {
        self.prefixes.iter().map(|(_, deleted, _)| deleted).sum()
    }

    pub fn failed(&self) -> usize {
        self.prefixes.iter().map(|(_, _, failed)| failed).sum()
    }
}

/// What this engine knows about the remote catalog.
#[derive(Default)]
struct RemoteCatalog {
    /// Last pointer read or written.
    pointer: Option<String>,
    /// Rows uploaded but not yet in a published remote snapshot.
    pending: Vec<CatalogEntry>,
}

pub struct SyncEngine {
    store: Arc<dyn ObjectStore>,
    namespace: Namespace,
    retry: RetryConfig,
    root: PathBuf,
    cache: Arc<ContentCache>,
    mirror: SnapshotLocation,
    events: EventBus,
    // Held for the whole batch so batches run one after another.
    remote: AsyncMutex<RemoteCatalog>,
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Init(format!("Task join error: {e}")))?
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        namespace: Namespace,
        retry: RetryConfig,
        root: impl Into<PathBuf>,
        cache: Arc<ContentCache>,
        mirror_dir: impl Into<PathBuf>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            namespace,
            retry,
            root: root.into(),
            cache,
            mirror: SnapshotLocation::new(mirror_dir),
            events,
            remote: AsyncMutex::new(RemoteCatalog::default()),
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Runs `op` under the per-call timeout, retrying retryable failures with
    /// doubling backoff capped at `backoff_max`.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = self.retry.backoff_base();
        let mut attempt = 0;
        loop {
            let outcome = match tokio::time::timeout(self.retry.request_timeout(), op()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::RemoteUnavailable(format!("{what} timed out"))),
            };
            match outcome {
                Err(err) if err.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    log::debug!(
                        "{what} failed (attempt {attempt}/{}): {err}; retrying in {:?}",
                        self.retry.max_retries,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.retry.backoff_max());
                }
                other => return other,
            }
        }
    }

    /// Uploads `items` in order, then publishes the merged remote catalog once.
    ///
    /// A quota failure or an unreachable remote stops the batch; items not yet
    /// attempted are reported as `Skipped`. Per-item local failures never stop it.
    pub async fn run_batch(&self, items: Vec<BackupQueueItem>, cancel: &AtomicBool) -> BatchReport {
        let mut remote = self.remote.lock().await;
        let mut report = BatchReport::default();

        let mut uploaded_entries = Vec::new();
        let mut halted = false;
        for item in &items {
            if halted {
                report.record(&item.path, ItemResult::Skipped);
                continue;
            }
            if cancel.load(Ordering::Relaxed) {
                report.cancelled = true;
                halted = true;
                report.record(&item.path, ItemResult::Skipped);
                continue;
            }
            match self.upload_item(item).await {
                Ok((hash, deduplicated)) => {
                    log::info!(
                        "{} {} as {}",
                        if deduplicated { "Deduplicated" } else { "Uploaded" },
                        item.path,
                        hash
                    );
                    self.events.emit(LibraryEvent::ItemUploaded {
                        path: item.path.clone(),
                        hash,
                        deduplicated,
                    });
                    let mut entry = item.to_entry();
                    entry.content_hash = Some(hash);
                    uploaded_entries.push(entry);
                    report.record(&item.path, ItemResult::Uploaded { hash, deduplicated });
                }
                Err(Error::QuotaExceeded(reason)) => {
                    log::warn!("Remote quota exceeded while uploading {}: {}", item.path, reason);
                    self.events.emit(LibraryEvent::QuotaExceeded { reason });
                    report.quota_exceeded = true;
                    halted = true;
                    report.record(&item.path, ItemResult::Skipped);
                }
                Err(err) => {
                    let retryable = err.is_retryable();
                    log::warn!("Backup of {} failed: {}", item.path, err);
                    self.events.emit(LibraryEvent::ItemFailed {
                        path: item.path.clone(),
                        error: err.to_string(),
                    });
                    if retryable {
                        report.remote_unavailable = true;
                        halted = true;
                        self.events.emit(LibraryEvent::RemoteUnavailable {
                            reason: err.to_string(),
                        });
                    }
                    report.record(
                        &item.path,
                        ItemResult::Failed {
                            error: err.to_string(),
                            retryable,
                        },
                    );
                }
            }
        }

        remote.pending.extend(uploaded_entries);
        report.snapshot = remote.pointer.clone();
        if !remote.pending.is_empty() {
            match self.publish_remote_catalog(&mut remote).await {
                Ok(hash) => report.snapshot = Some(hash),
                Err(Error::QuotaExceeded(reason)) => {
                    log::warn!("Remote quota exceeded while publishing the catalog: {reason}");
                    report.quota_exceeded = true;
                    self.events.emit(LibraryEvent::QuotaExceeded { reason });
                }
                Err(err) => {
                    log::warn!(
                        "Remote catalog publish deferred ({} rows pending): {err}",
                        remote.pending.len()
                    );
                    report.remote_unavailable = true;
                    self.events.emit(LibraryEvent::RemoteUnavailable {
                        reason: err.to_string(),
                    });
                }
            }
        }
        log::info!(
            "Batch done: {} uploaded ({} deduplicated), {} failed, {} skipped",
            report.uploaded,
            report.deduplicated,
            report.failed,
            report.skipped
        );
        report
    }

    /// Uploads the file as it is now on disk. The key is the hash of the bytes
    /// read, which may differ from the hash recorded when the item was queued.
    async fn upload_item(&self, item: &BackupQueueItem) -> Result<(ContentHash, bool)> {
        let path = self.root.join(&item.path);
        let (bytes, hash) = blocking(move || {
            let bytes = std::fs::read(&path).map_err(|e| Error::unreadable(&path, e))?;
            let hash = addresser::content_hash_of(&bytes);
            Ok((bytes, hash))
        })
        .await?;
        if let Some(queued) = item.content_hash.filter(|queued| *queued != hash) {
            log::info!("{} changed since it was queued ({queued}); uploading as {hash}", item.path);
        }

        // The thumbnail goes up first, so an existing photo object implies its
        // thumbnail unless the photo could not be rendered.
        let key = photo_key(&self.namespace, &hash);
        let thumb_key = thumbnail_key(&self.namespace, &hash);
        if self.with_retry("exists", || self.store.exists(&key)).await? {
            if !self.with_retry("exists", || self.store.exists(&thumb_key)).await? {
                self.upload_thumbnail(&thumb_key, hash, item.format, &bytes).await?;
            }
            return Ok((hash, true));
        }

        self.upload_thumbnail(&thumb_key, hash, item.format, &bytes).await?;
        let metadata = vec![("format".to_string(), item.format.as_str().to_string())];
        self.with_retry("upload photo", || self.store.put(&key, bytes.clone(), &metadata))
            .await?;
        Ok((hash, false))
    }

    async fn upload_thumbnail(&self, key: &str, hash: ContentHash, format: Format, bytes: &[u8]) -> Result<()> {
        if let Some(thumbnail) = self.local_thumbnail(hash, format, bytes).await {
            self.with_retry("upload thumbnail", || self.store.put(key, thumbnail.to_vec(), &[]))
                .await?;
        }
        Ok(())
    }

    /// Cached thumbnail, or one rendered from `bytes` and cached. Photos that
    /// cannot be rendered are uploaded without one.
    async fn local_thumbnail(&self, hash: ContentHash, format: Format, bytes: &[u8]) -> Option<Arc<Vec<u8>>> {
        match self.cache.get(&hash, ArtifactKind::Thumbnail) {
            Ok(Some(thumb)) => return Some(thumb),
            Ok(None) => {}
            Err(err) => log::debug!("Thumbnail cache read for {hash} failed: {err}"),
        }
        let owned = bytes.to_vec();
        let cache = self.cache.clone();
        let rendered = blocking(move || {
            let thumb = thumbnails::render_thumbnail(&owned, format)?;
            cache.put(&hash, ArtifactKind::Thumbnail, thumb)
        })
        .await;
        match rendered {
            Ok(thumb) => Some(thumb),
            Err(err) => {
                log::warn!("No thumbnail for {hash}: {err}");
                None
            }
        }
    }

    /// Current remote catalog to merge onto. A corrupt remote catalog is
    /// replaced by the last verified copy in the mirror; an unreachable one is
    /// an error so nothing is published over rows we have not seen.
    async fn fetch_merge_base(&self) -> Result<(Option<String>, Vec<CatalogEntry>)> {
        match self.fetch_remote_catalog().await {
            Ok(base) => Ok(base),
            Err(err @ Error::CorruptSnapshot(_)) => {
                log::warn!("Remote catalog is corrupt ({err}); rebuilding from the local mirror");
                match self.mirror.load() {
                    Ok((_, entries)) => Ok((None, entries)),
                    Err(_) => Ok((None, Vec::new())),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Pointer then snapshot, verified against its self-hash.
    async fn fetch_remote_catalog(&self) -> Result<(Option<String>, Vec<CatalogEntry>)> {
        let pointer_key = catalog_pointer_key(&self.namespace);
        let Some(raw) = self.with_retry("read pointer", || self.store.get(&pointer_key)).await? else {
            return Ok((None, Vec::new()));
        };
        let hash = String::from_utf8_lossy(&raw).trim().to_string();
        if hash.len() != 32 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::CorruptSnapshot(format!("remote pointer holds {hash:?}")));
        }
        let snapshot_key = catalog_snapshot_key(&self.namespace, &hash);
        let bytes = self
            .with_retry("read snapshot", || self.store.get(&snapshot_key))
            .await?
            .ok_or_else(|| Error::CorruptSnapshot(format!("remote snapshot {hash} is missing")))?;
        let actual = catalog::snapshot_hash(&bytes);
        if actual != hash {
            return Err(Error::CorruptSnapshot(format!(
                "remote snapshot {hash} hashes to {actual}"
            )));
        }
        let entries = catalog::decode_snapshot(&bytes)?;
        self.mirror_snapshot(&hash, &bytes);
        Ok((Some(hash), entries))
    }

    fn mirror_snapshot(&self, hash: &str, bytes: &[u8]) {
        let mirrored = self
            .mirror
            .write_snapshot(hash, bytes)
            .and_then(|_| self.mirror.write_pointer(hash));
        match mirrored {
            Ok(()) => self.mirror.prune(&[hash]),
            Err(err) => log::warn!("Could not mirror remote catalog {hash}: {err}"),
        }
    }

    /// Merges pending rows onto the freshly read remote catalog, then writes
    /// the snapshot first and the pointer last. Skipped when nothing changed.
    async fn publish_remote_catalog(&self, remote: &mut RemoteCatalog) -> Result<String> {
        let (base_pointer, base) = self.fetch_merge_base().await?;
        let mut working = WorkingCopy::from_entries(base);
        working.upsert(remote.pending.iter().cloned());
        let bytes = working.encode();
        let hash = catalog::snapshot_hash(&bytes);
        if base_pointer.as_deref() == Some(hash.as_str()) {
            remote.pointer = base_pointer;
            remote.pending.clear();
            return Ok(hash);
        }
        let snapshot_key = catalog_snapshot_key(&self.namespace, &hash);
        self.with_retry("upload snapshot", || self.store.put(&snapshot_key, bytes.clone(), &[]))
            .await?;
        let pointer_key = catalog_pointer_key(&self.namespace);
        let pointer = format!("{hash}\n").into_bytes();
        self.with_retry("update pointer", || self.store.put(&pointer_key, pointer.clone(), &[]))
            .await?;
        remote.pointer = Some(hash.clone());
        remote.pending.clear();
        self.mirror_snapshot(&hash, &bytes);
        self.events.emit(LibraryEvent::RemoteCatalogPublished {
            snapshot: hash.clone(),
        });
        log::info!("Published remote catalog {hash} for {}", self.namespace);
        Ok(hash)
    }

    /// Fetches the remote catalog for browsing. When the remote cannot be
    /// reached or holds a corrupt catalog, the last mirrored copy is served.
    pub async fn pull_catalog(&self) -> PulledCatalog {
        let fetched = self.fetch_remote_catalog().await;
        match fetched {
            Ok((snapshot, entries)) => {
                self.remote.lock().await.pointer = snapshot.clone();
                PulledCatalog {
                    snapshot,
                    entries,
                    offline: false,
                }
            }
            Err(err) => {
                let offline = err.is_retryable();
                if offline {
                    self.events.emit(LibraryEvent::RemoteUnavailable {
                        reason: err.to_string(),
                    });
                }
                log::warn!("Remote catalog pull failed ({err}); using local mirror");
                match self.mirror.load() {
                    Ok((hash, entries)) => PulledCatalog {
                        snapshot: Some(hash),
                        entries,
                        offline,
                    },
                    Err(_) => PulledCatalog {
                        offline,
                        ..PulledCatalog::default()
                    },
                }
            }
        }
    }

    /// Read-through: local cache first, then the remote thumbnail, which is
    /// cached so it is downloaded at most once.
    pub async fn remote_thumbnail(&self, hash: &ContentHash) -> Result<Option<Arc<Vec<u8>>>> {
        if let Some(thumb) = self.cache.get(hash, ArtifactKind::Thumbnail)? {
            return Ok(Some(thumb));
        }
        let key = thumbnail_key(&self.namespace, hash);
        match self.with_retry("read thumbnail", || self.store.get(&key)).await? {
            Some(bytes) => Ok(Some(self.cache.put(hash, ArtifactKind::Thumbnail, bytes)?)),
            None => Ok(None),
        }
    }

    /// Deletes every object owned by the namespace. Individual delete failures
    /// are counted, not returned.
    pub async fn purge_namespace(&self) -> Result<PurgeReport> {
        let mut remote = self.remote.lock().await;
        let mut report = PurgeReport::default();
        for prefix in PURGE_PREFIXES {
            let prefix = format!("{prefix}/{}/", self.namespace);
            let keys = self.with_retry("list", || self.store.list(&prefix)).await?;
            let (mut deleted, mut failed) = (0, 0);
            for chunk in keys.chunks(PURGE_CHUNK) {
                for key in chunk {
                    match self.with_retry("delete", || self.store.delete(key)).await {
                        Ok(()) => deleted += 1,
                        Err(err) => {
                            log::warn!("Failed to delete {key}: {err}");
                            failed += 1;
                        }
                    }
                }
                log::info!("Purged {deleted}/{} objects under {prefix}", keys.len());
            }
            report.prefixes.push((prefix, deleted, failed));
        }
        *remote = RemoteCatalog::default();
        if let Err(err) = std::fs::remove_dir_all(self.mirror.dir()) {
            if err.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Could not clear remote mirror {}: {}", self.mirror.dir().display(), err);
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FastKey;
    use crate::remote::MemoryStore;
    use image::{DynamicImage, ImageOutputFormat, RgbImage};
    use std::io::Cursor;
    use uuid::Uuid;

    struct Fixture {
        root: tempfile::TempDir,
        cache_dir: tempfile::TempDir,
        store: Arc<MemoryStore>,
        namespace: Namespace,
        events: EventBus,
    }

    fn png(seed: u8) -> Vec<u8> {
        let img = RgbImage::from_fn(16, 8, |x, y| image::Rgb([seed, x as u8, y as u8]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageOutputFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            request_timeout_secs: 5,
            max_retries: 1,
            backoff_base_ms: 1,
            backoff_max_ms: 2,
        }
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                root: tempfile::tempdir().unwrap(),
                cache_dir: tempfile::tempdir().unwrap(),
                store: Arc::new(MemoryStore::new()),
                namespace: Namespace(Uuid::new_v4()),
                events: EventBus::new(),
            }
        }

        fn engine(&self) -> SyncEngine {
            let cache = Arc::new(
                ContentCache::with_limits(self.cache_dir.path().join("content"), 64, 1 << 20).unwrap(),
            );
            SyncEngine::new(
                self.store.clone(),
                self.namespace,
                fast_retry(),
                self.root.path(),
                cache,
                self.cache_dir.path().join("remote"),
                self.events.clone(),
            )
        }

        fn item(&self, name: &str, bytes: &[u8], with_hash: bool) -> BackupQueueItem {
            std::fs::write(self.root.path().join(name), bytes).unwrap();
            BackupQueueItem::from_entry(
                &CatalogEntry {
                    path: name.to_string(),
                    fast_key: FastKey {
                        head: bytes.len() as u64,
                        size: bytes.len() as u64,
                    },
                    content_hash: with_hash.then(|| addresser::content_hash_of(bytes)),
                    capture_date: 1,
                    format: Format::Png,
                },
                0,
            )
        }

        fn snapshot_keys(&self) -> Vec<String> {
            self.store
                .keys(&format!("catalogs/{}/", self.namespace))
                .into_iter()
                .filter(|k| k.ends_with(".csv"))
                .collect()
        }
    }

    #[tokio::test]
    async fn identical_content_is_uploaded_once() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let items = vec![fx.item("a.png", &png(1), true), fx.item("copy-of-a.png", &png(1), false)];
        let report = engine.run_batch(items, &AtomicBool::new(false)).await;

        assert_eq!((report.uploaded, report.deduplicated), (2, 1));
        let hash = addresser::content_hash_of(&png(1));
        assert_eq!(fx.store.keys(&format!("photos/{}/", fx.namespace)), vec![photo_key(&fx.namespace, &hash)]);
        let stored = fx.store.object(&photo_key(&fx.namespace, &hash)).unwrap();
        assert_eq!(stored.metadata, vec![("format".to_string(), "PNG".to_string())]);
        assert!(fx.store.object(&thumbnail_key(&fx.namespace, &hash)).is_some());
        // photo + thumbnail + snapshot + pointer
        assert_eq!(fx.store.put_count(), 4);
    }

    #[tokio::test]
    async fn batch_publishes_exactly_one_snapshot() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let items: Vec<_> = (0..5u8)
            .map(|i| fx.item(&format!("{i}.png"), &png(i), true))
            .collect();
        let report = engine.run_batch(items.clone(), &AtomicBool::new(false)).await;
        assert_eq!(report.uploaded, 5);
        assert_eq!(report.deduplicated, 0);
        assert_eq!(fx.snapshot_keys().len(), 1);
        let snapshot = report.snapshot.clone().unwrap();

        // Re-queuing the same content costs only existence checks.
        let puts = fx.store.put_count();
        let again = engine.run_batch(items, &AtomicBool::new(false)).await;
        assert_eq!(again.deduplicated, 5);
        assert_eq!(again.snapshot, Some(snapshot));
        assert_eq!(fx.store.put_count(), puts);
    }

    #[tokio::test]
    async fn quota_halts_the_batch_and_leaves_the_rest_queued() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let events = fx.events.subscribe();
        fx.store.set_quota(Some(2));
        let items: Vec<_> = (0..3u8)
            .map(|i| fx.item(&format!("{i}.png"), &png(i), true))
            .collect();
        let report = engine.run_batch(items, &AtomicBool::new(false)).await;

        assert!(report.quota_exceeded);
        assert_eq!(report.uploaded, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.skipped, 2);
        assert!(events
            .try_iter()
            .any(|e| matches!(e, LibraryEvent::QuotaExceeded { .. })));
    }

    #[tokio::test]
    async fn unreachable_remote_fails_the_item_and_stops() {
        let fx = Fixture::new();
        let engine = fx.engine();
        fx.store.set_offline(true);
        let items: Vec<_> = (0..3u8)
            .map(|i| fx.item(&format!("{i}.png"), &png(i), true))
            .collect();
        let report = engine.run_batch(items, &AtomicBool::new(false)).await;
        assert!(report.remote_unavailable);
        assert_eq!((report.failed, report.skipped), (1, 2));
        assert!(matches!(
            report.outcomes[0].1,
            ItemResult::Failed { retryable: true, .. }
        ));
        assert!(report.snapshot.is_none());
    }

    #[tokio::test]
    async fn missing_local_file_does_not_stop_the_batch() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let gone = fx.item("gone.png", &png(9), false);
        std::fs::remove_file(fx.root.path().join("gone.png")).unwrap();
        let items = vec![gone, fx.item("ok.png", &png(3), true)];
        let report = engine.run_batch(items, &AtomicBool::new(false)).await;
        assert_eq!((report.failed, report.uploaded), (1, 1));
        assert!(matches!(
            report.outcomes[0].1,
            ItemResult::Failed { retryable: false, .. }
        ));
    }

    #[tokio::test]
    async fn pull_serves_the_mirror_when_offline() {
        let fx = Fixture::new();
        fx.engine()
            .run_batch(vec![fx.item("a.png", &png(1), true)], &AtomicBool::new(false))
            .await;

        let engine = fx.engine();
        let pulled = engine.pull_catalog().await;
        assert!(!pulled.offline);
        assert_eq!(pulled.entries.len(), 1);
        assert_eq!(pulled.entries[0].path, "a.png");

        fx.store.set_offline(true);
        let offline = engine.pull_catalog().await;
        assert!(offline.offline);
        assert_eq!(offline.snapshot, pulled.snapshot);
        assert_eq!(offline.entries, pulled.entries);
    }

    #[tokio::test]
    async fn remote_thumbnails_are_read_through_the_cache() {
        let fx = Fixture::new();
        fx.engine()
            .run_batch(vec![fx.item("a.png", &png(1), true)], &AtomicBool::new(false))
            .await;
        let hash = addresser::content_hash_of(&png(1));

        // A fresh cache directory stands in for another device.
        let other = Fixture {
            root: tempfile::tempdir().unwrap(),
            cache_dir: tempfile::tempdir().unwrap(),
            store: fx.store.clone(),
            namespace: fx.namespace,
            events: EventBus::new(),
        };
        let engine = other.engine();
        let thumb = engine.remote_thumbnail(&hash).await.unwrap().unwrap();
        assert!(thumb.starts_with(&[0xFF, 0xD8]));

        fx.store.set_offline(true);
        let cached = engine.remote_thumbnail(&hash).await.unwrap().unwrap();
        assert_eq!(cached, thumb);
        let missing = ContentHash::from_bytes([0; 16]);
        assert!(engine.remote_thumbnail(&missing).await.is_err());
    }

    #[tokio::test]
    async fn purge_removes_every_namespace_prefix() {
        let fx = Fixture::new();
        let engine = fx.engine();
        engine
            .run_batch(vec![fx.item("a.png", &png(1), true)], &AtomicBool::new(false))
            .await;
        fx.store
            .put(&format!("users/{}/profile.json", fx.namespace), b"{}".to_vec(), &[])
            .await
            .unwrap();
        fx.store.put("photos/someone-else/x.dat", vec![1], &[]).await.unwrap();

        let report = engine.purge_namespace().await.unwrap();
        assert_eq!(report.deleted(), 5);
        assert_eq!(report.failed(), 0);
        assert_eq!(fx.store.keys("").len(), 1);
        assert!(engine.pull_catalog().await.entries.is_empty());
    }

    #[tokio::test]
    async fn file_edited_after_queueing_is_keyed_by_its_current_bytes() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let item = fx.item("a.png", &png(1), true);
        let queued_hash = item.content_hash.unwrap();
        std::fs::write(fx.root.path().join("a.png"), png(2)).unwrap();

        let report = engine.run_batch(vec![item], &AtomicBool::new(false)).await;
        let current = addresser::content_hash_of(&png(2));
        assert_eq!(
            report.outcomes[0].1,
            ItemResult::Uploaded {
                hash: current,
                deduplicated: false
            }
        );
        assert!(fx.store.object(&photo_key(&fx.namespace, &queued_hash)).is_none());
        let stored = fx.store.object(&photo_key(&fx.namespace, &current)).unwrap();
        assert_eq!(addresser::content_hash_of(&stored.bytes), current);

        let pulled = engine.pull_catalog().await;
        assert_eq!(pulled.entries[0].content_hash, Some(current));
    }

    #[tokio::test]
    async fn devices_sharing_a_namespace_keep_each_others_rows() {
        let a = Fixture::new();
        let b = Fixture {
            root: tempfile::tempdir().unwrap(),
            cache_dir: tempfile::tempdir().unwrap(),
            store: a.store.clone(),
            namespace: a.namespace,
            events: EventBus::new(),
        };
        let (engine_a, engine_b) = (a.engine(), b.engine());
        let cancel = AtomicBool::new(false);
        engine_a.run_batch(vec![a.item("a1.png", &png(1), true)], &cancel).await;
        engine_b.run_batch(vec![b.item("b1.png", &png(2), true)], &cancel).await;
        engine_a.run_batch(vec![a.item("a2.png", &png(3), true)], &cancel).await;

        let mut paths: Vec<_> = engine_b
            .pull_catalog()
            .await
            .entries
            .into_iter()
            .map(|e| e.path)
            .collect();
        paths.sort();
        assert_eq!(paths, vec!["a1.png", "a2.png", "b1.png"]);
    }

    /// Writes go through; reads fail while `reads_down` is set.
    struct ReadOutage {
        inner: Arc<MemoryStore>,
        reads_down: AtomicBool,
    }

    #[async_trait::async_trait]
    impl ObjectStore for ReadOutage {
        async fn exists(&self, key: &str) -> Result<bool> {
            self.inner.exists(key).await
        }

        async fn put(&self, key: &str, bytes: Vec<u8>, metadata: &[(String, String)]) -> Result<()> {
            self.inner.put(key, bytes, metadata).await
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            if self.reads_down.load(Ordering::SeqCst) {
                return Err(Error::RemoteUnavailable("reads are down".into()));
            }
            self.inner.get(key).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.list(prefix).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn catalog_publish_waits_until_the_remote_catalog_can_be_read() {
        let fx = Fixture::new();
        let store = Arc::new(ReadOutage {
            inner: fx.store.clone(),
            reads_down: AtomicBool::new(true),
        });
        let cache = Arc::new(ContentCache::with_limits(fx.cache_dir.path().join("content"), 64, 1 << 20).unwrap());
        let engine = SyncEngine::new(
            store.clone(),
            fx.namespace,
            fast_retry(),
            fx.root.path(),
            cache,
            fx.cache_dir.path().join("remote"),
            fx.events.clone(),
        );

        let report = engine
            .run_batch(vec![fx.item("a.png", &png(1), true)], &AtomicBool::new(false))
            .await;
        assert_eq!(report.uploaded, 1);
        assert!(report.remote_unavailable);
        assert!(report.snapshot.is_none());
        assert!(fx.store.object(&catalog_pointer_key(&fx.namespace)).is_none());

        store.reads_down.store(false, Ordering::SeqCst);
        let report = engine
            .run_batch(vec![fx.item("b.png", &png(2), true)], &AtomicBool::new(false))
            .await;
        assert!(report.snapshot.is_some());
        let mut paths: Vec<_> = engine.pull_catalog().await.entries.into_iter().map(|e| e.path).collect();
        paths.sort();
        assert_eq!(paths, vec!["a.png", "b.png"]);
    }

    #[tokio::test]
    async fn thumbnail_is_uploaded_before_its_photo() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let hash = addresser::content_hash_of(&png(1));
        fx.store.set_quota(Some(1));
        let report = engine
            .run_batch(vec![fx.item("a.png", &png(1), true)], &AtomicBool::new(false))
            .await;
        assert!(report.quota_exceeded);
        assert!(fx.store.object(&photo_key(&fx.namespace, &hash)).is_none());

        fx.store.set_quota(None);
        let report = engine
            .run_batch(vec![fx.item("a.png", &png(1), true)], &AtomicBool::new(false))
            .await;
        assert_eq!((report.uploaded, report.deduplicated), (1, 0));
        assert!(fx.store.object(&thumbnail_key(&fx.namespace, &hash)).is_some());
        assert!(fx.store.object(&photo_key(&fx.namespace, &hash)).is_some());
    }

    #[tokio::test]
    async fn deduplicated_photo_gets_its_missing_thumbnail() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let hash = addresser::content_hash_of(&png(1));
        fx.store
            .put(&photo_key(&fx.namespace, &hash), png(1), &[])
            .await
            .unwrap();

        let report = engine
            .run_batch(vec![fx.item("a.png", &png(1), true)], &AtomicBool::new(false))
            .await;
        assert_eq!(report.deduplicated, 1);
        let thumb = fx.store.object(&thumbnail_key(&fx.namespace, &hash)).unwrap();
        assert!(thumb.bytes.starts_with(&[0xFF, 0xD8]));
    }
}
