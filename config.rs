use crate::error::{Error, Result};
use crate::models::Namespace;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use xxhash_rust::xxh3::xxh3_64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppPaths {
    pub root: PathBuf,
    pub content_dir: PathBuf,
    pub catalogs_dir: PathBuf,
    pub remote_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl AppPaths {
    /// Resolves the cache root from `PHOTO_CATALOG_CACHE_DIR`, falling back to
    /// the platform cache directory.
    pub fn discover() -> Result<Self> {
        let root = match std::env::var_os("PHOTO_CATALOG_CACHE_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::cache_dir()
                .ok_or_else(|| Error::Path("Failed to get cache dir".to_string()))?
                .join("photo-catalog"),
        };
        Self::at(root)
    }

    pub fn at(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let content_dir = root.join("content");
        let catalogs_dir = root.join("catalogs");
        let remote_dir = root.join("remote");
        let state_dir = root.join("state");

        std::fs::create_dir_all(&content_dir)?;
        std::fs::create_dir_all(&catalogs_dir)?;
        std::fs::create_dir_all(&remote_dir)?;
        std::fs::create_dir_all(&state_dir)?;

        Ok(Self {
            root,
            content_dir,
            catalogs_dir,
            remote_dir,
            state_dir,
        })
    }

    /// Mirror directory for a browsing root, keyed by a hash of its path.
    pub fn catalog_mirror(&self, browsing_root: &Path) -> PathBuf {
        self.catalogs_dir.join(root_key(browsing_root))
    }

    pub fn listing_cache(&self, browsing_root: &Path) -> PathBuf {
        self.state_dir
            .join(format!("listing-{}.json", root_key(browsing_root)))
    }

    pub fn backup_queue(&self, browsing_root: &Path) -> PathBuf {
        self.state_dir
            .join(format!("backup-{}.json", root_key(browsing_root)))
    }

    pub fn remote_mirror(&self, namespace: &Namespace) -> PathBuf {
        self.remote_dir.join(namespace.to_string())
    }
}

fn root_key(browsing_root: &Path) -> String {
    let canonical = browsing_root
        .canonicalize()
        .unwrap_or_else(|_| browsing_root.to_path_buf());
    format!("{:016x}", xxh3_64(canonical.to_string_lossy().as_bytes()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_memory_fraction")]
    pub memory_fraction: f64,
    #[serde(default = "default_max_memory_entries")]
    pub max_memory_entries: usize,
    #[serde(default = "default_min_memory_bytes")]
    pub min_memory_bytes: u64,
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_fraction: default_memory_fraction(),
            max_memory_entries: default_max_memory_entries(),
            min_memory_bytes: default_min_memory_bytes(),
            max_memory_bytes: default_max_memory_bytes(),
        }
    }
}

fn default_memory_fraction() -> f64 {
    0.05
}

fn default_max_memory_entries() -> usize {
    4096
}

fn default_min_memory_bytes() -> u64 {
    16 * 1024 * 1024
}

fn default_max_memory_bytes() -> u64 {
    512 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Viewports beyond the visible range that count as prefetch.
    #[serde(default = "default_prefetch_pages")]
    pub prefetch_pages: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            prefetch_pages: default_prefetch_pages(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_prefetch_pages() -> usize {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_true")]
    pub use_listing_cache: bool,
    #[serde(default)]
    pub extra_extensions: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            use_listing_cache: true,
            extra_extensions: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub endpoint: String,
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    pub namespace: Namespace,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl RetryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

fn default_max_retries() -> usize {
    3
}

fn default_backoff_base_ms() -> u64 {
    250
}

fn default_backoff_max_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_idle_ms")]
    pub idle_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            idle_ms: default_idle_ms(),
            max_attempts: default_max_attempts(),
            retry_base_ms: default_retry_base_ms(),
        }
    }
}

impl BackupConfig {
    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }

    /// Delay before retrying an item that has failed `attempts` times.
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let factor = 1u64 << attempts.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_base_ms.saturating_mul(factor))
    }
}

fn default_idle_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_base_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
    #[serde(default)]
    pub backup: BackupConfig,
}

impl Settings {
    /// Loads settings from a JSON file (missing file means defaults), then
    /// applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)?;
                serde_json::from_str(&raw)
                    .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?
            }
            Some(path) => {
                log::warn!("Settings file {} not found; using defaults", path.display());
                Settings::default()
            }
            None => Settings::default(),
        };
        settings.apply_env();
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env(&mut self) {
        if let Ok(raw) = std::env::var("PHOTO_CATALOG_CONCURRENCY") {
            match raw.parse::<usize>() {
                Ok(value) => self.scheduler.concurrency = value,
                Err(_) => log::warn!("Ignoring invalid PHOTO_CATALOG_CONCURRENCY={raw}"),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.concurrency == 0 {
            return Err(Error::Config("scheduler.concurrency must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.cache.memory_fraction) {
            return Err(Error::Config("cache.memory_fraction must be within 0..=1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_settings_fill_in_defaults() {
        let raw = r#"{ "scheduler": { "concurrency": 2 }, "backup": { "idle_ms": 5 } }"#;
        let settings: Settings = serde_json::from_str(raw).unwrap();
        assert_eq!(settings.scheduler.concurrency, 2);
        assert_eq!(settings.scheduler.prefetch_pages, 3);
        assert_eq!(settings.backup.idle_ms, 5);
        assert_eq!(settings.backup.max_attempts, 5);
        assert!(settings.remote.is_none());
        assert!(settings.scan.use_listing_cache);
    }

    #[test]
    fn remote_config_requires_namespace_uuid() {
        let raw = r#"{ "endpoint": "http://localhost:9000", "bucket": "photos",
                      "namespace": "4f6c1f8e-8d3c-4a55-9a1e-0b7a0c7d2f11" }"#;
        let remote: RemoteConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(remote.region, "us-east-1");
        assert_eq!(remote.retry.max_retries, 3);

        let bad = r#"{ "endpoint": "x", "bucket": "y", "namespace": "not-a-uuid" }"#;
        assert!(serde_json::from_str::<RemoteConfig>(bad).is_err());
    }

    #[test]
    fn backup_retry_delay_doubles_per_attempt() {
        let backup = BackupConfig::default();
        assert_eq!(backup.retry_delay(1), Duration::from_secs(60));
        assert_eq!(backup.retry_delay(3), Duration::from_secs(240));
        assert_eq!(backup.retry_delay(100), backup.retry_delay(17));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut settings = Settings::default();
        settings.scheduler.concurrency = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn mirror_dirs_are_stable_per_root() {
        let cache = tempfile::tempdir().unwrap();
        let paths = AppPaths::at(cache.path()).unwrap();
        let root = tempfile::tempdir().unwrap();
        assert_eq!(paths.catalog_mirror(root.path()), paths.catalog_mirror(root.path()));
        assert!(paths.content_dir.is_dir());
    }
}
