use crate::config::BackupConfig;
use crate::error::Result;
use crate::events::{EventBus, LibraryEvent};
use crate::fsutil::write_atomic;
use crate::models::{BackupQueueItem, BackupState, CatalogEntry};
use crate::sync::{BatchReport, ItemResult, SyncEngine};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Serialize, Deserialize, Default)]
struct QueueFile {
    items: Vec<BackupQueueItem>,
}

struct QueueState {
    items: Vec<BackupQueueItem>,
    version: u64,
}

struct QueueInner {
    path: PathBuf,
    config: BackupConfig,
    engine: Arc<SyncEngine>,
    events: EventBus,
    state: Mutex<QueueState>,
    // Last version on disk; also serializes writers.
    persisted: Mutex<u64>,
    touched: watch::Sender<u64>,
    cancel: AtomicBool,
}

/// User-marked photos waiting for upload. Persisted on every change; an
/// inactivity timer turns bursts of marking into one sync batch.
#[derive(Clone)]
pub struct BackupQueue {
    inner: Arc<QueueInner>,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn load_items(path: &Path) -> Vec<BackupQueueItem> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(_) => return Vec::new(),
    };
    match serde_json::from_slice::<QueueFile>(&raw) {
        Ok(file) => file.items,
        Err(err) => {
            log::warn!("Discarding unreadable backup queue {}: {}", path.display(), err);
            Vec::new()
        }
    }
}

impl BackupQueue {
    /// Loads persisted state. Items caught mid-upload by a crash go back to `queued`.
    pub fn open(path: impl Into<PathBuf>, config: BackupConfig, engine: Arc<SyncEngine>, events: EventBus) -> Result<Self> {
        let path = path.into();
        let mut items = load_items(&path);
        let mut recovered = 0;
        for item in items.iter_mut() {
            if item.state == BackupState::Uploading {
                item.state = BackupState::Queued;
                recovered += 1;
            }
        }
        if recovered > 0 {
            log::info!("Re-queued {recovered} interrupted uploads from {}", path.display());
        }
        let (touched, _) = watch::channel(0);
        let queue = Self {
            inner: Arc::new(QueueInner {
                path,
                config,
                engine,
                events,
                state: Mutex::new(QueueState { items, version: 1 }),
                persisted: Mutex::new(0),
                touched,
                cancel: AtomicBool::new(false),
            }),
        };
        queue.persist()?;
        Ok(queue)
    }

    /// Starts the inactivity timer on the current tokio runtime.
    pub fn start_timer(&self) -> JoinHandle<()> {
        let rx = self.inner.touched.subscribe();
        let weak = Arc::downgrade(&self.inner);
        let idle = self.inner.config.idle();
        tokio::spawn(run_timer(weak, rx, idle))
    }

    /// Marks entries for backup. Already queued or uploaded content is left
    /// alone; changed or previously failed items start over.
    pub fn enqueue(&self, entries: &[CatalogEntry]) -> Result<usize> {
        let queued_at = now();
        let mut changed = Vec::new();
        {
            let mut state = self.lock();
            for entry in entries {
                match state.items.iter_mut().find(|i| i.path == entry.path) {
                    Some(item) => {
                        let same_content = item.fast_key == entry.fast_key;
                        let restart = !same_content || item.state == BackupState::Failed;
                        if restart && item.state != BackupState::Uploading {
                            *item = BackupQueueItem::from_entry(entry, queued_at);
                            changed.push(entry.path.clone());
                        }
                    }
                    None => {
                        state.items.push(BackupQueueItem::from_entry(entry, queued_at));
                        changed.push(entry.path.clone());
                    }
                }
            }
            if !changed.is_empty() {
                state.version += 1;
            }
        }
        if changed.is_empty() {
            return Ok(0);
        }
        self.persist()?;
        for path in &changed {
            self.inner.events.emit(LibraryEvent::BackupStateChanged {
                path: path.clone(),
                state: BackupState::Queued,
            });
        }
        self.inner.touched.send_modify(|v| *v += 1);
        Ok(changed.len())
    }

    pub fn state(&self) -> Vec<BackupQueueItem> {
        self.lock().items.clone()
    }

    /// Asks a running batch to stop after the current item.
    pub fn cancel_running(&self) {
        self.inner.cancel.store(true, Ordering::Relaxed);
    }

    /// Runs one batch over every eligible item now, without waiting for the timer.
    pub async fn flush(&self) -> Result<BatchReport> {
        let (batch, previous) = self.take_eligible();
        if batch.is_empty() {
            return Ok(BatchReport::default());
        }
        if let Err(err) = self.persist() {
            self.restore(&batch, &previous);
            return Err(err);
        }
        for item in &batch {
            self.emit_state(&item.path, BackupState::Uploading);
        }
        self.inner.cancel.store(false, Ordering::Relaxed);
        log::info!("Starting backup batch of {} items", batch.len());
        let report = self.inner.engine.run_batch(batch, &self.inner.cancel).await;
        self.apply(&report, &previous);
        self.persist()?;
        Ok(report)
    }

    /// Earliest pending retry of a failed item, relative to now.
    fn next_retry_in(&self) -> Option<Duration> {
        let now = now();
        self.lock()
            .items
            .iter()
            .filter(|i| i.state == BackupState::Failed)
            .filter_map(|i| i.next_attempt_at)
            .min()
            .map(|at| Duration::from_secs(at.saturating_sub(now).max(0) as u64))
    }

    fn take_eligible(&self) -> (Vec<BackupQueueItem>, Vec<BackupState>) {
        let now = now();
        let mut state = self.lock();
        let mut batch = Vec::new();
        let mut previous = Vec::new();
        for item in state.items.iter_mut() {
            let eligible = match item.state {
                BackupState::Queued => true,
                BackupState::Failed => item.next_attempt_at.map(|at| at <= now).unwrap_or(false),
                _ => false,
            };
            if eligible {
                previous.push(item.state);
                item.state = BackupState::Uploading;
                batch.push(item.clone());
            }
        }
        if !batch.is_empty() {
            state.version += 1;
        }
        (batch, previous)
    }

    /// Puts a batch that never started back into the states it was taken from.
    fn restore(&self, batch: &[BackupQueueItem], previous: &[BackupState]) {
        let mut state = self.lock();
        for (taken, prior) in batch.iter().zip(previous) {
            if let Some(item) = state
                .items
                .iter_mut()
                .find(|i| i.path == taken.path && i.state == BackupState::Uploading)
            {
                item.state = *prior;
            }
        }
        state.version += 1;
    }

    fn apply(&self, report: &BatchReport, previous: &[BackupState]) {
        let now = now();
        let mut transitions = Vec::new();
        {
            let mut state = self.lock();
            for ((path, result), prior) in report.outcomes.iter().zip(previous) {
                let Some(item) = state
                    .items
                    .iter_mut()
                    .find(|i| &i.path == path && i.state == BackupState::Uploading)
                else {
                    continue;
                };
                match result {
                    ItemResult::Uploaded { hash, .. } => {
                        item.state = BackupState::Uploaded;
                        item.content_hash = Some(*hash);
                        item.last_error = None;
                        item.next_attempt_at = None;
                    }
                    ItemResult::Failed { error, .. } => {
                        let attempts = item.attempts + 1;
                        let config = &self.inner.config;
                        item.attempts = attempts;
                        item.state = BackupState::Failed;
                        item.last_error = Some(error.clone());
                        item.next_attempt_at = (attempts < config.max_attempts)
                            .then(|| now + config.retry_delay(attempts).as_secs() as i64);
                    }
                    ItemResult::Skipped => item.state = *prior,
                }
                transitions.push((path.clone(), item.state));
            }
            state.version += 1;
        }
        for (path, state) in transitions {
            self.emit_state(&path, state);
        }
    }

    fn emit_state(&self, path: &str, state: BackupState) {
        self.inner.events.emit(LibraryEvent::BackupStateChanged {
            path: path.to_string(),
            state,
        });
    }

    /// Writes the current state unless a newer version is already on disk.
    fn persist(&self) -> Result<()> {
        let mut persisted = self.inner.persisted.lock().unwrap_or_else(|p| p.into_inner());
        let (version, bytes) = {
            let state = self.lock();
            if state.version <= *persisted {
                return Ok(());
            }
            let file = QueueFile {
                items: state.items.clone(),
            };
            (state.version, serde_json::to_vec_pretty(&file)?)
        };
        write_atomic(&self.inner.path, &bytes)?;
        *persisted = version;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Waits for a mutation, then for `idle` without further mutations, then runs
/// a batch. Pending retries of failed items also wake it.
async fn run_timer(queue: Weak<QueueInner>, mut touched: watch::Receiver<u64>, idle: Duration) {
    loop {
        let retry_in = match queue.upgrade() {
            Some(inner) => BackupQueue { inner }.next_retry_in(),
            None => return,
        };
        tokio::select! {
            changed = touched.changed() => {
                if changed.is_err() {
                    return;
                }
                loop {
                    tokio::select! {
                        changed = touched.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                        _ = tokio::time::sleep(idle) => break,
                    }
                }
            }
            _ = tokio::time::sleep(retry_in.unwrap_or(Duration::MAX)), if retry_in.is_some() => {}
        }
        let Some(inner) = queue.upgrade() else {
            return;
        };
        if let Err(err) = (BackupQueue { inner }).flush().await {
            log::warn!("Backup batch failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ContentCache;
    use crate::config::RetryConfig;
    use crate::models::{FastKey, Format, Namespace};
    use crate::remote::MemoryStore;
    use std::time::Instant;
    use uuid::Uuid;

    struct Fixture {
        root: tempfile::TempDir,
        state: tempfile::TempDir,
        store: Arc<MemoryStore>,
        engine: Arc<SyncEngine>,
        events: EventBus,
        namespace: Namespace,
    }

    impl Fixture {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            let state = tempfile::tempdir().unwrap();
            let store = Arc::new(MemoryStore::new());
            let events = EventBus::new();
            let namespace = Namespace(Uuid::new_v4());
            let cache = Arc::new(ContentCache::with_limits(state.path().join("content"), 16, 1 << 20).unwrap());
            let retry = RetryConfig {
                request_timeout_secs: 5,
                max_retries: 0,
                backoff_base_ms: 1,
                backoff_max_ms: 1,
            };
            let engine = Arc::new(SyncEngine::new(
                store.clone(),
                namespace,
                retry,
                root.path(),
                cache,
                state.path().join("remote"),
                events.clone(),
            ));
            Self {
                root,
                state,
                store,
                engine,
                events,
                namespace,
            }
        }

        fn queue(&self, config: BackupConfig) -> BackupQueue {
            BackupQueue::open(
                self.state.path().join("backup.json"),
                config,
                self.engine.clone(),
                self.events.clone(),
            )
            .unwrap()
        }

        fn entry(&self, name: &str) -> CatalogEntry {
            let bytes = format!("photo bytes of {name}").into_bytes();
            fs::write(self.root.path().join(name), &bytes).unwrap();
            CatalogEntry {
                path: name.to_string(),
                fast_key: FastKey {
                    head: bytes.len() as u64,
                    size: bytes.len() as u64,
                },
                content_hash: None,
                capture_date: 0,
                format: Format::Jpeg,
            }
        }
    }

    fn config(idle_ms: u64, max_attempts: u32, retry_base_ms: u64) -> BackupConfig {
        BackupConfig {
            idle_ms,
            max_attempts,
            retry_base_ms,
        }
    }

    fn states(queue: &BackupQueue) -> Vec<BackupState> {
        queue.state().iter().map(|i| i.state).collect()
    }

    #[tokio::test]
    async fn idle_timer_runs_one_batch_for_a_burst() {
        let fx = Fixture::new();
        let queue = fx.queue(config(100, 5, 0));
        let events = fx.events.subscribe();
        let timer = queue.start_timer();
        for i in 0..5 {
            queue.enqueue(&[fx.entry(&format!("{i}.jpg"))]).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while states(&queue).iter().any(|s| *s != BackupState::Uploaded) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(states(&queue), vec![BackupState::Uploaded; 5]);
        let snapshots: Vec<_> = fx
            .store
            .keys(&format!("catalogs/{}/", fx.namespace))
            .into_iter()
            .filter(|k| k.ends_with(".csv"))
            .collect();
        assert_eq!(snapshots.len(), 1);
        let published = events
            .try_iter()
            .filter(|e| matches!(e, LibraryEvent::RemoteCatalogPublished { .. }))
            .count();
        assert_eq!(published, 1);
        timer.abort();
    }

    #[tokio::test]
    async fn interrupted_uploads_are_requeued_on_open() {
        let fx = Fixture::new();
        let mut item = BackupQueueItem::from_entry(&fx.entry("a.jpg"), 5);
        item.state = BackupState::Uploading;
        let file = QueueFile { items: vec![item] };
        fs::write(fx.state.path().join("backup.json"), serde_json::to_vec(&file).unwrap()).unwrap();

        let queue = fx.queue(config(1000, 5, 0));
        assert_eq!(states(&queue), vec![BackupState::Queued]);
        let report = queue.flush().await.unwrap();
        assert_eq!(report.uploaded, 1);

        let reopened = fx.queue(config(1000, 5, 0));
        assert_eq!(states(&reopened), vec![BackupState::Uploaded]);
        assert!(reopened.state()[0].content_hash.is_some());
    }

    #[tokio::test]
    async fn unwritable_queue_file_leaves_items_retryable() {
        let fx = Fixture::new();
        let queue = fx.queue(config(1000, 5, 0));
        queue.enqueue(&[fx.entry("a.jpg"), fx.entry("b.jpg")]).unwrap();

        // A directory in place of the queue file makes every save fail.
        let path = fx.state.path().join("backup.json");
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep"), b"x").unwrap();
        assert!(queue.flush().await.is_err());
        assert_eq!(states(&queue), vec![BackupState::Queued; 2]);
        assert_eq!(fx.store.put_count(), 0);

        fs::remove_dir_all(&path).unwrap();
        let report = queue.flush().await.unwrap();
        assert_eq!(report.uploaded, 2);
        assert_eq!(states(&queue), vec![BackupState::Uploaded; 2]);
    }

    #[tokio::test]
    async fn failed_items_wait_for_their_retry_delay() {
        let fx = Fixture::new();
        let queue = fx.queue(config(1000, 5, 60_000));
        queue.enqueue(&[fx.entry("a.jpg")]).unwrap();
        fx.store.set_offline(true);
        queue.flush().await.unwrap();
        let item = &queue.state()[0];
        assert_eq!(item.state, BackupState::Failed);
        assert_eq!(item.attempts, 1);
        assert!(item.next_attempt_at.unwrap() > now());

        fx.store.set_offline(false);
        assert_eq!(queue.flush().await.unwrap().outcomes.len(), 0);

        // Re-marking a failed photo starts it over.
        queue.enqueue(&[fx.entry("a.jpg")]).unwrap();
        assert_eq!(queue.flush().await.unwrap().uploaded, 1);
    }

    #[tokio::test]
    async fn items_stop_retrying_after_max_attempts() {
        let fx = Fixture::new();
        let queue = fx.queue(config(1000, 1, 0));
        queue.enqueue(&[fx.entry("a.jpg")]).unwrap();
        fx.store.set_offline(true);
        queue.flush().await.unwrap();
        fx.store.set_offline(false);
        assert!(queue.state()[0].next_attempt_at.is_none());
        assert_eq!(queue.flush().await.unwrap().outcomes.len(), 0);
        assert_eq!(states(&queue), vec![BackupState::Failed]);
    }

    #[tokio::test]
    async fn quota_leaves_remaining_items_queued() {
        let fx = Fixture::new();
        let queue = fx.queue(config(1000, 5, 0));
        fx.store.set_quota(Some(1));
        queue
            .enqueue(&[fx.entry("a.jpg"), fx.entry("b.jpg"), fx.entry("c.jpg")])
            .unwrap();
        let report = queue.flush().await.unwrap();
        assert!(report.quota_exceeded);
        assert_eq!(
            states(&queue),
            vec![BackupState::Uploaded, BackupState::Queued, BackupState::Queued]
        );
    }

    #[tokio::test]
    async fn enqueue_ignores_already_uploaded_content() {
        let fx = Fixture::new();
        let queue = fx.queue(config(1000, 5, 0));
        let entry = fx.entry("a.jpg");
        assert_eq!(queue.enqueue(&[entry.clone()]).unwrap(), 1);
        queue.flush().await.unwrap();
        assert_eq!(queue.enqueue(&[entry]).unwrap(), 0);
        assert_eq!(states(&queue), vec![BackupState::Uploaded]);
    }
}
