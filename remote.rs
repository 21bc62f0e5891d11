use crate::config::RemoteConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use opendal::layers::TimeoutLayer;
use opendal::services::S3;
use opendal::{ErrorKind, Operator};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Minimal object storage surface the sync engine needs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// HEAD-equivalent existence check.
    async fn exists(&self, key: &str) -> Result<bool>;

    async fn put(&self, key: &str, bytes: Vec<u8>, metadata: &[(String, String)]) -> Result<()>;

    /// `None` when the object does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Every object key under `prefix`, recursively.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// S3-compatible storage through opendal.
pub struct OpendalStore {
    op: Operator,
}

impl OpendalStore {
    pub fn s3(config: &RemoteConfig) -> Result<Self> {
        let mut builder = S3::default()
            .bucket(&config.bucket)
            .region(&config.region)
            .endpoint(&config.endpoint);
        if let Some(key) = &config.access_key_id {
            builder = builder.access_key_id(key);
        }
        if let Some(secret) = &config.secret_access_key {
            builder = builder.secret_access_key(secret);
        }
        if let Some(token) = &config.session_token {
            builder = builder.session_token(token);
        }
        let op = Operator::new(builder)?
            .layer(TimeoutLayer::new().with_timeout(config.retry.request_timeout()))
            .finish();
        log::info!("Remote store: s3://{} at {}", config.bucket, config.endpoint);
        Ok(Self { op })
    }

    pub fn from_operator(op: Operator) -> Self {
        Self { op }
    }
}

#[async_trait]
impl ObjectStore for OpendalStore {
    async fn exists(&self, key: &str) -> Result<bool> {
        match self.op.stat(key).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, metadata: &[(String, String)]) -> Result<()> {
        if !metadata.is_empty() && self.op.info().full_capability().write_with_user_metadata {
            self.op
                .write_with(key, bytes)
                .user_metadata(metadata.iter().cloned())
                .await?;
        } else {
            self.op.write(key, bytes).await?;
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.op.read(key).await {
            Ok(buf) => Ok(Some(buf.to_vec())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = match self.op.list_with(prefix).recursive(true).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        Ok(entries
            .into_iter()
            .filter(|entry| entry.metadata().is_file())
            .map(|entry| entry.path().to_string())
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.op.delete(key).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub metadata: Vec<(String, String)>,
}

/// In-process store for offline use and tests. Counts writes and can be told
/// to fail like an unreachable or full bucket.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    puts: AtomicUsize,
    offline: AtomicBool,
    quota_after: Mutex<Option<usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails with `RemoteUnavailable` while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Puts beyond `limit` total objects fail with `QuotaExceeded`.
    pub fn set_quota(&self, limit: Option<usize>) {
        *self.quota_after.lock().unwrap_or_else(|p| p.into_inner()) = limit;
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Stored keys starting with `prefix`.
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        self.lock()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.lock().get(key).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, StoredObject>> {
        self.objects.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::RemoteUnavailable("memory store is offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn exists(&self, key: &str) -> Result<bool> {
        self.check_online()?;
        Ok(self.lock().contains_key(key))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, metadata: &[(String, String)]) -> Result<()> {
        self.check_online()?;
        let limit = *self.quota_after.lock().unwrap_or_else(|p| p.into_inner());
        let mut objects = self.lock();
        if let Some(limit) = limit {
            if !objects.contains_key(key) && objects.len() >= limit {
                return Err(Error::QuotaExceeded(format!("{limit} objects")));
            }
        }
        objects.insert(
            key.to_string(),
            StoredObject {
                bytes,
                metadata: metadata.to_vec(),
            },
        );
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_online()?;
        Ok(self.lock().get(key).map(|o| o.bytes.clone()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_online()?;
        Ok(self.keys(prefix))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_online()?;
        self.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trips_and_lists_by_prefix() {
        let store = MemoryStore::new();
        let meta = vec![("format".to_string(), "JPEG".to_string())];
        store.put("photos/u/a.dat", b"a".to_vec(), &meta).await.unwrap();
        store.put("thumbnails/u/a.jpg", b"t".to_vec(), &[]).await.unwrap();
        assert!(store.exists("photos/u/a.dat").await.unwrap());
        assert!(!store.exists("photos/u/b.dat").await.unwrap());
        assert_eq!(store.get("photos/u/a.dat").await.unwrap(), Some(b"a".to_vec()));
        assert_eq!(store.list("photos/").await.unwrap(), vec!["photos/u/a.dat".to_string()]);
        assert_eq!(store.object("photos/u/a.dat").unwrap().metadata, meta);
        store.delete("photos/u/a.dat").await.unwrap();
        assert_eq!(store.get("photos/u/a.dat").await.unwrap(), None);
    }

    #[tokio::test]
    async fn injected_failures_use_the_remote_taxonomy() {
        let store = MemoryStore::new();
        store.set_quota(Some(1));
        store.put("a", vec![1], &[]).await.unwrap();
        let err = store.put("b", vec![2], &[]).await.unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded(_)));

        store.set_offline(true);
        let err = store.exists("a").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn opendal_store_against_memory_service() {
        let op = Operator::new(opendal::services::Memory::default()).unwrap().finish();
        let store = OpendalStore::from_operator(op);
        assert!(!store.exists("catalogs/u/.catalog.pointer").await.unwrap());
        assert_eq!(store.get("missing").await.unwrap(), None);
        store
            .put("catalogs/u/.catalog.pointer", b"abc".to_vec(), &[("k".into(), "v".into())])
            .await
            .unwrap();
        assert!(store.exists("catalogs/u/.catalog.pointer").await.unwrap());
        assert_eq!(store.list("catalogs/").await.unwrap(), vec!["catalogs/u/.catalog.pointer".to_string()]);
        store.delete("catalogs/u/.catalog.pointer").await.unwrap();
        assert!(!store.exists("catalogs/u/.catalog.pointer").await.unwrap());
    }
}
