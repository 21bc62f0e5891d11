use crate::addresser::{self, ContentAddresser, FileProbe};
use crate::catalog_handle::CatalogHandle;
use crate::error::{Error, Result};
use crate::events::{EventBus, LibraryEvent};
use crate::exif_reader;
use crate::listing::{self, ListedFile, ListingCache};
use crate::models::{CatalogEntry, FastKey};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;
use walkdir::{DirEntry, WalkDir};

const SUPPORTED_EXT: &[&str] = &[
    "jpg", "jpeg", "png", "tiff", "tif", "heic", "heif", "cr2", "cr3", "nef", "nrw", "arw", "dng",
    "raf", "orf", "rw2",
];

const SYSTEM_DIRS: &[&str] = &["$RECYCLE.BIN", "System Volume Information", "@eaDir", "lost+found"];

const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

type HeadReader = Arc<dyn Fn(&Path) -> Result<FileProbe> + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub discovered: usize,
    pub added: usize,
    pub changed: usize,
    pub removed: usize,
    pub unreadable: usize,
    /// Full-file hashes computed during this scan (memo misses).
    pub hashed: usize,
    /// Directories skipped via the listing fast path.
    pub reused_dirs: usize,
    pub snapshot: Option<String>,
    pub cancelled: bool,
}

struct Candidate {
    rel: String,
    abs: PathBuf,
    listed: ListedFile,
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.') || SYSTEM_DIRS.contains(&name))
        .unwrap_or(false)
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
    Some(parts?.join("/"))
}

fn parent_dir(rel: &str) -> &str {
    rel.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// Walks one browsing root, diffs it against the catalog and publishes the result.
pub struct DiscoveryScanner {
    root: PathBuf,
    addresser: Arc<ContentAddresser>,
    catalog: CatalogHandle,
    listing: Mutex<ListingCache>,
    events: EventBus,
    extensions: Vec<String>,
    read_head: HeadReader,
}

impl DiscoveryScanner {
    pub fn new(
        catalog: CatalogHandle,
        addresser: Arc<ContentAddresser>,
        listing: ListingCache,
        events: EventBus,
        extra_extensions: &[String],
    ) -> Self {
        let view = catalog.view();
        addresser.seed(
            view.entries()
                .iter()
                .filter_map(|e| e.content_hash.map(|hash| (e.fast_key, hash))),
        );
        let mut extensions: Vec<String> = SUPPORTED_EXT.iter().map(|e| e.to_string()).collect();
        extensions.extend(extra_extensions.iter().map(|e| e.trim_start_matches('.').to_lowercase()));
        Self {
            root: catalog.root().to_path_buf(),
            addresser,
            catalog,
            listing: Mutex::new(listing),
            events,
            extensions,
            read_head: Arc::new(addresser::probe),
        }
    }

    #[cfg(test)]
    fn with_head_reader(mut self, read_head: HeadReader) -> Self {
        self.read_head = read_head;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn catalog(&self) -> &CatalogHandle {
        &self.catalog
    }

    fn is_supported(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    }

    /// Candidate files grouped by root-relative directory.
    fn discover(&self, cancel: &AtomicBool, report: &mut ScanReport) -> Result<BTreeMap<String, Vec<Candidate>>> {
        let mut dirs: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();
        let walker = WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e));
        for entry in walker {
            if cancel.load(Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    log::warn!("Skipping unreadable entry under {}: {}", self.root.display(), err);
                    report.unreadable += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() || !self.is_supported(entry.path()) {
                continue;
            }
            let Some(rel) = relative_path(&self.root, entry.path()) else {
                log::warn!("Skipping non UTF-8 path {}", entry.path().display());
                continue;
            };
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(err) => {
                    log::warn!("Skipping {}: {}", entry.path().display(), err);
                    report.unreadable += 1;
                    continue;
                }
            };
            let mtime = metadata
                .modified()
                .ok()
                .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            let name = entry.file_name().to_string_lossy().to_string();
            dirs.entry(parent_dir(&rel).to_string()).or_default().push(Candidate {
                rel,
                abs: entry.into_path(),
                listed: ListedFile {
                    name,
                    size: metadata.len(),
                    mtime,
                },
            });
        }
        Ok(dirs)
    }

    /// Runs one full scan. Cancellation is checked between files; a cancelled
    /// scan publishes nothing.
    pub fn scan(&self, cancel: &AtomicBool) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        match self.scan_inner(cancel, &mut report) {
            Ok(()) => Ok(report),
            Err(Error::Cancelled) => {
                log::info!("Scan of {} cancelled", self.root.display());
                report.cancelled = true;
                Ok(report)
            }
            Err(err) => Err(err),
        }
    }

    fn scan_inner(&self, cancel: &AtomicBool, report: &mut ScanReport) -> Result<()> {
        let started = Instant::now();
        let hashed_before = self.addresser.hash_computations();
        let dirs = self.discover(cancel, report)?;
        report.discovered = dirs.values().map(Vec::len).sum();

        let view = self.catalog.view();
        let mut discovered: HashMap<String, FastKey> = HashMap::with_capacity(report.discovered);
        let mut probes: HashMap<String, (PathBuf, FileProbe)> = HashMap::new();
        let mut fingerprints = BTreeMap::new();
        // Directories with a file we could not read; their fingerprints are not
        // recorded so the next scan looks at every file again.
        let mut incomplete = BTreeSet::new();
        let mut processed = 0usize;
        let mut last_emit = Instant::now();
        {
            let listing = self.listing.lock().unwrap_or_else(|p| p.into_inner());
            for (dir, candidates) in &dirs {
                let listed: Vec<ListedFile> = candidates.iter().map(|c| c.listed.clone()).collect();
                let print = listing::fingerprint(&listed);
                fingerprints.insert(dir.clone(), print);

                let known: Option<Vec<FastKey>> = candidates
                    .iter()
                    .map(|c| view.get(&c.rel).map(|e| e.fast_key))
                    .collect();
                if let (true, Some(keys)) = (listing.is_unchanged(dir, print), known) {
                    for (candidate, key) in candidates.iter().zip(keys) {
                        discovered.insert(candidate.rel.clone(), key);
                    }
                    processed += candidates.len();
                    report.reused_dirs += 1;
                    continue;
                }

                for candidate in candidates {
                    if cancel.load(Ordering::Relaxed) {
                        return Err(Error::Cancelled);
                    }
                    match (self.read_head)(&candidate.abs) {
                        Ok(probe) => {
                            discovered.insert(candidate.rel.clone(), probe.fast_key);
                            probes.insert(candidate.rel.clone(), (candidate.abs.clone(), probe));
                        }
                        Err(err) => {
                            log::warn!("{err}");
                            report.unreadable += 1;
                            incomplete.insert(dir.clone());
                            // Keep the last known row rather than dropping the photo.
                            if let Some(existing) = view.get(&candidate.rel) {
                                discovered.insert(candidate.rel.clone(), existing.fast_key);
                            }
                        }
                    }
                    processed += 1;
                    if last_emit.elapsed() >= PROGRESS_INTERVAL {
                        last_emit = Instant::now();
                        self.emit_progress(report.discovered, processed);
                    }
                }
            }
        }

        let diff = self.catalog.diff(discovered)?;
        report.added = diff.added.len();
        report.changed = diff.changed.len();
        report.removed = diff.removed.len();

        let mut upserts = Vec::with_capacity(diff.added.len() + diff.changed.len());
        for (rel, key) in diff.added.iter().chain(diff.changed.iter()) {
            if cancel.load(Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }
            let probed = match probes.remove(rel) {
                Some(probed) => probed,
                None => {
                    let abs = self.root.join(rel);
                    match (self.read_head)(&abs) {
                        Ok(probe) => (abs, probe),
                        Err(err) => {
                            log::warn!("{err}");
                            report.unreadable += 1;
                            incomplete.insert(parent_dir(rel).to_string());
                            continue;
                        }
                    }
                }
            };
            match self.build_entry(rel, *key, probed) {
                Ok(entry) => upserts.push(entry),
                Err(err) => {
                    log::warn!("Skipping {rel}: {err}");
                    report.unreadable += 1;
                    incomplete.insert(parent_dir(rel).to_string());
                }
            }
        }
        report.hashed = self.addresser.hash_computations() - hashed_before;

        self.catalog.upsert(upserts)?;
        self.catalog.remove(diff.removed)?;

        let existing = self.catalog.current_snapshot();
        report.snapshot = if diff.added.is_empty() && diff.changed.is_empty() && report.removed == 0 && existing.is_some() {
            existing
        } else {
            match self.catalog.publish() {
                Ok(hash) => Some(hash),
                Err(err) => {
                    log::warn!("Publishing catalog for {} failed: {}", self.root.display(), err);
                    existing
                }
            }
        };

        {
            let mut listing = self.listing.lock().unwrap_or_else(|p| p.into_inner());
            fingerprints.retain(|dir, _| !incomplete.contains(dir));
            listing.replace(fingerprints);
            if let Err(err) = listing.save() {
                log::warn!("Could not save listing cache: {err}");
            }
        }

        self.emit_progress(report.discovered, report.discovered);
        self.events.emit(LibraryEvent::ListingUpdated {
            root: self.root.clone(),
            snapshot: report.snapshot.clone(),
            entries: self.catalog.view().len(),
        });
        log::info!(
            "Scanned {} in {:?}: {} files, +{} ~{} -{}, {} hashed, {} unreadable",
            self.root.display(),
            started.elapsed(),
            report.discovered,
            report.added,
            report.changed,
            report.removed,
            report.hashed,
            report.unreadable
        );
        Ok(())
    }

    fn build_entry(&self, rel: &str, key: FastKey, (abs, probe): (PathBuf, FileProbe)) -> Result<CatalogEntry> {
        let hash = self.addresser.resolve(&abs, key)?;
        let ext = abs.extension().and_then(|e| e.to_str());
        let format = addresser::detect_format(&probe.head, ext);
        let capture_date = exif_reader::capture_date(&abs)
            .or(probe.modified)
            .unwrap_or(0);
        Ok(CatalogEntry {
            path: rel.to_string(),
            fast_key: key,
            content_hash: Some(hash),
            capture_date,
            format,
        })
    }

    fn emit_progress(&self, discovered: usize, processed: usize) {
        self.events.emit(LibraryEvent::ScanProgress {
            discovered,
            processed,
        });
    }
}

/// Runs at most one background scan at a time.
#[derive(Clone, Default)]
pub struct ScanManager {
    inner: Arc<ScanManagerInner>,
}

#[derive(Default)]
struct ScanManagerInner {
    current: Mutex<Option<ScanJob>>,
    last_report: Mutex<Option<ScanReport>>,
}

#[derive(Clone)]
struct ScanJob {
    id: String,
    cancel: Arc<AtomicBool>,
}

impl ScanManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, scanner: Arc<DiscoveryScanner>) -> Result<String> {
        let mut current = self.inner.current.lock().unwrap_or_else(|p| p.into_inner());
        if current.is_some() {
            return Err(Error::Init(
                "Scan already running; cancel before starting a new one.".into(),
            ));
        }
        let job_id = Uuid::new_v4().to_string();
        let cancel = Arc::new(AtomicBool::new(false));
        *current = Some(ScanJob {
            id: job_id.clone(),
            cancel: cancel.clone(),
        });

        let manager = self.clone();
        let id = job_id.clone();
        let spawned = thread::Builder::new()
            .name("discovery-scan".into())
            .spawn(move || {
                let outcome = scanner.scan(&cancel);
                manager.finish(&id, outcome);
            });
        if let Err(err) = spawned {
            *current = None;
            return Err(err.into());
        }
        Ok(job_id)
    }

    pub fn cancel_current(&self) -> Result<()> {
        let current = self.inner.current.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(job) = current.as_ref() {
            job.cancel.store(true, Ordering::Relaxed);
            return Ok(());
        }
        Err(Error::Init("No scan running".into()))
    }

    pub fn is_scanning(&self) -> bool {
        self.inner
            .current
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    pub fn last_report(&self) -> Option<ScanReport> {
        self.inner
            .last_report
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn finish(&self, job_id: &str, outcome: Result<ScanReport>) {
        match outcome {
            Ok(report) => {
                *self.inner.last_report.lock().unwrap_or_else(|p| p.into_inner()) = Some(report);
            }
            Err(err) => log::warn!("Scan {job_id} failed: {err}"),
        }
        let mut current = self.inner.current.lock().unwrap_or_else(|p| p.into_inner());
        if current.as_ref().map(|job| job.id == job_id).unwrap_or(false) {
            *current = None;
        }
    }
}
