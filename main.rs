use clap::{Parser, Subcommand};
use photo_catalog::cache::ContentCache;
use photo_catalog::config::{AppPaths, Settings};
use photo_catalog::error::{Error, Result};
use photo_catalog::models::ContentHash;
use photo_catalog::remote::{ObjectStore, OpendalStore};
use photo_catalog::sync::SyncEngine;
use photo_catalog::PhotoLibrary;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "photo-catalog", version, about = "Local photo catalog with content-addressed cache and S3 backup")]
struct Cli {
    /// Cache root; defaults to $PHOTO_CATALOG_CACHE_DIR or the platform cache dir.
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// JSON settings file.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan a folder and publish its catalog.
    Scan { root: PathBuf },
    /// Print the catalog of a folder.
    List {
        root: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Write the thumbnail of a photo to a file.
    Thumb {
        root: PathBuf,
        hash: ContentHash,
        #[arg(long, short, default_value = "thumbnail.jpg")]
        out: PathBuf,
    },
    /// Back up photos (root-relative paths) and wait for the batch.
    Backup {
        root: PathBuf,
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Fetch the remote catalog.
    Pull,
    /// Delete every remote object of the configured namespace.
    Purge {
        #[arg(long)]
        yes: bool,
    },
    /// Remove all cached thumbnails and metadata.
    ClearCache,
}

fn remote_engine(paths: &AppPaths, settings: &Settings) -> Result<SyncEngine> {
    let remote = settings
        .remote
        .as_ref()
        .ok_or_else(|| Error::Config("no \"remote\" section in settings".into()))?;
    let store: Arc<dyn ObjectStore> = Arc::new(OpendalStore::s3(remote)?);
    let cache = Arc::new(ContentCache::open(&paths.content_dir, &settings.cache)?);
    Ok(SyncEngine::new(
        store,
        remote.namespace,
        remote.retry.clone(),
        std::env::current_dir()?,
        cache,
        paths.remote_mirror(&remote.namespace),
        Default::default(),
    ))
}

async fn run(cli: Cli) -> Result<()> {
    let paths = match &cli.cache_dir {
        Some(dir) => AppPaths::at(dir)?,
        None => AppPaths::discover()?,
    };
    let settings = Settings::load(cli.settings.as_deref())?;

    match cli.command {
        Command::Scan { root } => {
            let library = PhotoLibrary::open(root, &paths, &settings)?;
            let report = library.scan(&AtomicBool::new(false))?;
            println!(
                "{} files: {} added, {} changed, {} removed, {} unreadable, {} hashed",
                report.discovered, report.added, report.changed, report.removed, report.unreadable, report.hashed
            );
            if let Some(snapshot) = report.snapshot {
                println!("snapshot {snapshot}");
            }
        }
        Command::List { root, json } => {
            let library = PhotoLibrary::open(root, &paths, &settings)?;
            let entries = library.list_entries();
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in entries {
                    let hash = entry.content_hash.map(|h| h.to_hex()).unwrap_or_default();
                    println!("{hash:32}  {:8}  {}", entry.format.as_str(), entry.path);
                }
            }
        }
        Command::Thumb { root, hash, out } => {
            let library = PhotoLibrary::open(root, &paths, &settings)?;
            match library.thumbnail(&hash, Duration::from_secs(30))? {
                Some(bytes) => {
                    std::fs::write(&out, bytes.as_slice())?;
                    println!("wrote {}", out.display());
                }
                None => return Err(Error::Unsupported(format!("no thumbnail for {hash}"))),
            }
        }
        Command::Backup { root, paths: files } => {
            let library = PhotoLibrary::open(root, &paths, &settings)?;
            if library.list_entries().is_empty() {
                library.scan(&AtomicBool::new(false))?;
            }
            let marked = library.enqueue_for_backup(&files)?;
            log::info!("Marked {marked} photos for backup");
            let report = library.flush_backup().await?;
            println!(
                "{} uploaded ({} deduplicated), {} failed, {} skipped",
                report.uploaded, report.deduplicated, report.failed, report.skipped
            );
            if report.quota_exceeded {
                println!("remote quota exceeded; remaining photos stay queued");
            }
        }
        Command::Pull => {
            let engine = remote_engine(&paths, &settings)?;
            let pulled = engine.pull_catalog().await;
            if pulled.offline {
                println!("remote unavailable; showing cached catalog");
            }
            println!(
                "{} entries in snapshot {}",
                pulled.entries.len(),
                pulled.snapshot.as_deref().unwrap_or("-")
            );
        }
        Command::Purge { yes } => {
            if !yes {
                return Err(Error::Config("refusing to purge without --yes".into()));
            }
            let engine = remote_engine(&paths, &settings)?;
            let report = engine.purge_namespace().await?;
            for (prefix, deleted, failed) in &report.prefixes {
                println!("{prefix}: {deleted} deleted, {failed} failed");
            }
        }
        Command::ClearCache => {
            ContentCache::open(&paths.content_dir, &settings.cache)?.clear()?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();

    if let Err(err) = run(Cli::parse()).await {
        log::error!("{err}");
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
