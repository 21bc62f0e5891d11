use crate::addresser::ContentAddresser;
use crate::artifacts::CatalogArtifactProducer;
use crate::backup::BackupQueue;
use crate::cache::{CacheStats, ContentCache};
use crate::catalog_handle::CatalogHandle;
use crate::config::{AppPaths, Settings};
use crate::error::{Error, Result};
use crate::events::{EventBus, LibraryEvent};
use crate::listing::ListingCache;
use crate::models::{ArtifactKind, BackupQueueItem, CatalogEntry, ContentHash, PhotoMetadata};
use crate::remote::{ObjectStore, OpendalStore};
use crate::scan::{DiscoveryScanner, ScanManager, ScanReport};
use crate::scheduler::{Priority, PriorityScheduler, RequestHandle, RequestState};
use crate::sync::{BatchReport, PulledCatalog, PurgeReport, SyncEngine};
use crossbeam_channel::Receiver;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

struct RemoteSide {
    engine: Arc<SyncEngine>,
    backup: BackupQueue,
}

/// One browsing root with its cache, scheduler and optional remote backup.
pub struct PhotoLibrary {
    root: PathBuf,
    events: EventBus,
    cache: Arc<ContentCache>,
    catalog: CatalogHandle,
    scanner: Arc<DiscoveryScanner>,
    scans: ScanManager,
    scheduler: PriorityScheduler,
    remote: Option<RemoteSide>,
}

impl PhotoLibrary {
    /// Opens `root`, connecting to S3 when `settings.remote` is set.
    pub fn open(root: impl Into<PathBuf>, paths: &AppPaths, settings: &Settings) -> Result<Self> {
        let store = match &settings.remote {
            Some(remote) => Some(Arc::new(OpendalStore::s3(remote)?) as Arc<dyn ObjectStore>),
            None => None,
        };
        Self::open_with_store(root, paths, settings, store)
    }

    /// Like `open`, with an explicit object store. `settings.remote` still
    /// supplies the namespace and retry policy.
    pub fn open_with_store(
        root: impl Into<PathBuf>,
        paths: &AppPaths,
        settings: &Settings,
        store: Option<Arc<dyn ObjectStore>>,
    ) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(Error::Path(format!("{} is not a directory", root.display())));
        }
        let events = EventBus::new();
        let cache = Arc::new(ContentCache::open(&paths.content_dir, &settings.cache)?);
        let catalog = CatalogHandle::open(&root, &paths.catalog_mirror(&root))?;

        let listing = if settings.scan.use_listing_cache {
            ListingCache::load(paths.listing_cache(&root))
        } else {
            ListingCache::disabled()
        };
        let scanner = Arc::new(DiscoveryScanner::new(
            catalog.clone(),
            Arc::new(ContentAddresser::new()),
            listing,
            events.clone(),
            &settings.scan.extra_extensions,
        ));
        let scheduler = PriorityScheduler::new(
            settings.scheduler.concurrency,
            settings.scheduler.prefetch_pages,
            cache.clone(),
            Arc::new(CatalogArtifactProducer::new(catalog.clone())),
            events.clone(),
        )?;

        let remote = match (store, &settings.remote) {
            (Some(store), Some(config)) => {
                let engine = Arc::new(SyncEngine::new(
                    store,
                    config.namespace,
                    config.retry.clone(),
                    &root,
                    cache.clone(),
                    paths.remote_mirror(&config.namespace),
                    events.clone(),
                ));
                let backup = BackupQueue::open(
                    paths.backup_queue(&root),
                    settings.backup.clone(),
                    engine.clone(),
                    events.clone(),
                )?;
                Some(RemoteSide { engine, backup })
            }
            (Some(_), None) => {
                return Err(Error::Config("an object store needs remote settings".into()));
            }
            _ => None,
        };

        log::info!(
            "Opened library at {} ({} catalog entries, remote {})",
            root.display(),
            catalog.view().len(),
            if remote.is_some() { "enabled" } else { "disabled" }
        );
        Ok(Self {
            root,
            events,
            cache,
            catalog,
            scanner,
            scans: ScanManager::new(),
            scheduler,
            remote,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn subscribe(&self) -> Receiver<LibraryEvent> {
        self.events.subscribe()
    }

    pub fn list_entries(&self) -> Vec<CatalogEntry> {
        self.catalog.view().entries().to_vec()
    }

    pub fn current_snapshot(&self) -> Option<String> {
        self.catalog.current_snapshot()
    }

    /// Scans on the calling thread.
    pub fn scan(&self, cancel: &AtomicBool) -> Result<ScanReport> {
        self.scanner.scan(cancel)
    }

    /// Scans on a background thread; progress arrives as events.
    pub fn start_scan(&self) -> Result<String> {
        self.scans.start(self.scanner.clone())
    }

    pub fn cancel_scan(&self) -> Result<()> {
        self.scans.cancel_current()
    }

    pub fn is_scanning(&self) -> bool {
        self.scans.is_scanning()
    }

    pub fn last_scan(&self) -> Option<ScanReport> {
        self.scans.last_report()
    }

    /// Queues generation for the cell at `index` in the presentation grid.
    pub fn request_artifact(&self, hash: ContentHash, kind: ArtifactKind, index: usize) -> RequestHandle {
        self.scheduler.request(hash, kind, Priority::Background, Some(index))
    }

    pub fn cancel_request(&self, handle: &RequestHandle) {
        self.scheduler.cancel(handle)
    }

    pub fn set_visible_range(&self, first: usize, last: usize) {
        self.scheduler.set_visible_range(first, last)
    }

    /// Thumbnail JPEG bytes, generating at visible priority on a miss.
    /// `None` when the photo cannot be rendered or `wait` elapses first.
    pub fn thumbnail(&self, hash: &ContentHash, wait: Duration) -> Result<Option<Arc<Vec<u8>>>> {
        self.artifact(hash, ArtifactKind::Thumbnail, wait)
    }

    pub fn metadata(&self, hash: &ContentHash, wait: Duration) -> Result<Option<PhotoMetadata>> {
        match self.artifact(hash, ArtifactKind::Metadata, wait)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn artifact(&self, hash: &ContentHash, kind: ArtifactKind, wait: Duration) -> Result<Option<Arc<Vec<u8>>>> {
        if let Some(bytes) = self.cache.get(hash, kind)? {
            return Ok(Some(bytes));
        }
        let handle = self.scheduler.request(*hash, kind, Priority::Visible, None);
        match handle.wait_timeout(wait) {
            RequestState::Done => self.cache.get(hash, kind),
            state => {
                log::debug!("{kind:?} for {hash} not available ({state:?})");
                Ok(None)
            }
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) -> Result<()> {
        self.cache.clear()
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    fn remote(&self) -> Result<&RemoteSide> {
        self.remote
            .as_ref()
            .ok_or_else(|| Error::Config("no remote configured".into()))
    }

    /// Marks catalog rows (by root-relative path) for backup.
    pub fn enqueue_for_backup(&self, paths: &[String]) -> Result<usize> {
        let remote = self.remote()?;
        let view = self.catalog.view();
        let entries = paths
            .iter()
            .map(|path| {
                view.get(path)
                    .cloned()
                    .ok_or_else(|| Error::Path(format!("{path} is not in the catalog")))
            })
            .collect::<Result<Vec<_>>>()?;
        remote.backup.enqueue(&entries)
    }

    pub fn backup_queue_state(&self) -> Vec<BackupQueueItem> {
        self.remote
            .as_ref()
            .map(|remote| remote.backup.state())
            .unwrap_or_default()
    }

    /// Starts the backup inactivity timer; needs a tokio runtime.
    pub fn start_backup_timer(&self) -> Option<JoinHandle<()>> {
        self.remote.as_ref().map(|remote| remote.backup.start_timer())
    }

    pub async fn flush_backup(&self) -> Result<BatchReport> {
        self.remote()?.backup.flush().await
    }

    pub fn cancel_backup(&self) {
        if let Some(remote) = &self.remote {
            remote.backup.cancel_running();
        }
    }

    pub async fn pull_remote(&self) -> Result<PulledCatalog> {
        Ok(self.remote()?.engine.pull_catalog().await)
    }

    pub async fn remote_thumbnail(&self, hash: &ContentHash) -> Result<Option<Arc<Vec<u8>>>> {
        self.remote()?.engine.remote_thumbnail(hash).await
    }

    pub async fn purge_remote(&self) -> Result<PurgeReport> {
        let remote = self.remote()?;
        log::warn!("Purging remote namespace {}", remote.engine.namespace());
        remote.engine.purge_namespace().await
    }
}
