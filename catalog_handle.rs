//! Single-writer access to a catalog.
//!
//! A writer thread owns the working copy and applies commands in arrival
//! order. Publishing hands the encoded bytes to a separate publisher thread,
//! which does the disk I/O in FIFO order so publishes stay linearized without
//! stalling the writer. Readers take an immutable [`CatalogView`].

use crate::catalog::{Catalog, CatalogDiff, SnapshotStore, WorkingCopy};
use crate::error::{Error, Result};
use crate::models::{CatalogEntry, ContentHash, FastKey};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::thread;

/// Immutable listing of the working copy at one point in time.
#[derive(Debug, Default)]
pub struct CatalogView {
    entries: Vec<CatalogEntry>,
    by_path: HashMap<String, usize>,
    by_hash: HashMap<ContentHash, usize>,
}

impl CatalogView {
    fn build(working: &WorkingCopy) -> Self {
        let entries: Vec<CatalogEntry> = working.entries().cloned().collect();
        let mut by_path = HashMap::with_capacity(entries.len());
        let mut by_hash = HashMap::with_capacity(entries.len());
        for (idx, entry) in entries.iter().enumerate() {
            by_path.insert(entry.path.clone(), idx);
            if let Some(hash) = entry.content_hash {
                by_hash.entry(hash).or_insert(idx);
            }
        }
        Self {
            entries,
            by_path,
            by_hash,
        }
    }

    /// Rows sorted by path.
    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn get(&self, path: &str) -> Option<&CatalogEntry> {
        self.by_path.get(path).map(|&idx| &self.entries[idx])
    }

    /// Any row carrying `hash`; identical files share one.
    pub fn by_hash(&self, hash: &ContentHash) -> Option<&CatalogEntry> {
        self.by_hash.get(hash).map(|&idx| &self.entries[idx])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn distinct_hashes(&self) -> usize {
        self.by_hash.len()
    }
}

enum Command {
    Upsert(Vec<CatalogEntry>),
    Remove(Vec<String>),
    Diff(HashMap<String, FastKey>, Sender<CatalogDiff>),
    Publish(Sender<Result<String>>),
}

struct PublishJob {
    bytes: Vec<u8>,
    reply: Sender<Result<String>>,
}

#[derive(Clone)]
pub struct CatalogHandle {
    root: PathBuf,
    tx: Sender<Command>,
    view: Arc<RwLock<Arc<CatalogView>>>,
    published: Arc<RwLock<Option<String>>>,
}

impl CatalogHandle {
    /// Moves `catalog` onto its writer and publisher threads.
    pub fn spawn(catalog: Catalog) -> Result<Self> {
        let (root, store, working) = catalog.into_parts();
        let view = Arc::new(RwLock::new(Arc::new(CatalogView::build(&working))));
        let published = Arc::new(RwLock::new(store.current().map(str::to_string)));
        let (tx, rx) = unbounded::<Command>();
        let (publish_tx, publish_rx) = unbounded::<PublishJob>();

        {
            let published = published.clone();
            thread::Builder::new()
                .name("catalog-publisher".into())
                .spawn(move || run_publisher(store, publish_rx, published))?;
        }
        {
            let view = view.clone();
            thread::Builder::new()
                .name("catalog-writer".into())
                .spawn(move || run_writer(working, rx, publish_tx, view))?;
        }

        Ok(Self {
            root,
            tx,
            view,
            published,
        })
    }

    pub fn open(root: &Path, mirror_dir: &Path) -> Result<Self> {
        Self::spawn(Catalog::open(root, mirror_dir))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn view(&self) -> Arc<CatalogView> {
        self.view
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn current_snapshot(&self) -> Option<String> {
        self.published
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn upsert(&self, entries: Vec<CatalogEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.send(Command::Upsert(entries))
    }

    pub fn remove(&self, paths: Vec<String>) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        self.send(Command::Remove(paths))
    }

    pub fn diff(&self, discovered: HashMap<String, FastKey>) -> Result<CatalogDiff> {
        let (reply, rx) = bounded(1);
        self.send(Command::Diff(discovered, reply))?;
        rx.recv().map_err(|_| writer_gone())
    }

    /// Blocks until the snapshot and pointers are on disk.
    pub fn publish(&self) -> Result<String> {
        let (reply, rx) = bounded(1);
        self.send(Command::Publish(reply))?;
        rx.recv().map_err(|_| writer_gone())?
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| writer_gone())
    }
}

fn writer_gone() -> Error {
    Error::Init("catalog writer stopped".into())
}

fn run_writer(
    mut working: WorkingCopy,
    rx: Receiver<Command>,
    publish_tx: Sender<PublishJob>,
    view: Arc<RwLock<Arc<CatalogView>>>,
) {
    for command in rx {
        match command {
            Command::Upsert(entries) => {
                working.upsert(entries);
                refresh_view(&working, &view);
            }
            Command::Remove(paths) => {
                working.remove(paths.iter());
                refresh_view(&working, &view);
            }
            Command::Diff(discovered, reply) => {
                let _ = reply.send(working.diff(&discovered));
            }
            Command::Publish(reply) => {
                let job = PublishJob {
                    bytes: working.encode(),
                    reply,
                };
                if let Err(err) = publish_tx.send(job) {
                    let _ = err.0.reply.send(Err(writer_gone()));
                }
            }
        }
    }
    log::debug!("Catalog writer exiting");
}

fn refresh_view(working: &WorkingCopy, view: &RwLock<Arc<CatalogView>>) {
    let next = Arc::new(CatalogView::build(working));
    *view.write().unwrap_or_else(|p| p.into_inner()) = next;
}

fn run_publisher(
    mut store: SnapshotStore,
    rx: Receiver<PublishJob>,
    published: Arc<RwLock<Option<String>>>,
) {
    for job in rx {
        let result = store.publish(&job.bytes);
        if let Ok(hash) = &result {
            *published.write().unwrap_or_else(|p| p.into_inner()) = Some(hash.clone());
        }
        let _ = job.reply.send(result);
    }
    log::debug!("Catalog publisher exiting");
}
