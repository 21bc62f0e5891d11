use crate::addresser::content_hash_of;
use crate::catalog_handle::CatalogHandle;
use crate::error::{Error, Result};
use crate::models::{ArtifactKind, ContentHash};
use crate::thumbnails;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};

/// Turns a content hash into artifact bytes. Implementations are called from
/// scheduler workers and must check `cancel` between expensive steps.
pub trait ArtifactProducer: Send + Sync {
    fn produce(&self, hash: ContentHash, kind: ArtifactKind, cancel: &AtomicBool) -> Result<Vec<u8>>;
}

/// Resolves the hash to any catalog row carrying it and renders from that file.
pub struct CatalogArtifactProducer {
    catalog: CatalogHandle,
}

impl CatalogArtifactProducer {
    pub fn new(catalog: CatalogHandle) -> Self {
        Self { catalog }
    }
}

impl ArtifactProducer for CatalogArtifactProducer {
    fn produce(&self, hash: ContentHash, kind: ArtifactKind, cancel: &AtomicBool) -> Result<Vec<u8>> {
        let view = self.catalog.view();
        let entry = view
            .by_hash(&hash)
            .ok_or_else(|| Error::Path(format!("no catalog entry for {hash}")))?;
        let path = self.catalog.root().join(&entry.path);
        let bytes = fs::read(&path).map_err(|e| Error::unreadable(&path, e))?;
        // Artifacts are cached under `hash` forever; never render edited bytes into it.
        if content_hash_of(&bytes) != hash {
            return Err(Error::Path(format!(
                "{} changed since it was catalogued as {hash}",
                entry.path
            )));
        }
        if cancel.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }
        match kind {
            ArtifactKind::Thumbnail => thumbnails::render_thumbnail(&bytes, entry.format),
            ArtifactKind::Metadata => {
                let meta = thumbnails::extract_metadata(&bytes, entry.format, Some(entry.capture_date));
                Ok(serde_json::to_vec(&meta)?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CatalogEntry, FastKey, Format, PhotoMetadata};
    use image::{DynamicImage, ImageOutputFormat, RgbImage};
    use std::io::Cursor;

    #[test]
    fn produces_thumbnail_and_metadata_from_catalog_row() {
        let root = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let mut png = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::new(64, 32))
            .write_to(&mut png, ImageOutputFormat::Png)
            .unwrap();
        let bytes = png.into_inner();
        fs::write(root.path().join("a.png"), &bytes).unwrap();
        let hash = content_hash_of(&bytes);

        let catalog = CatalogHandle::open(root.path(), cache.path()).unwrap();
        catalog
            .upsert(vec![CatalogEntry {
                path: "a.png".into(),
                fast_key: FastKey { head: 1, size: bytes.len() as u64 },
                content_hash: Some(hash),
                capture_date: 77,
                format: Format::Png,
            }])
            .unwrap();
        // Round-trip through the writer so the upsert is visible.
        catalog.diff(Default::default()).unwrap();

        let producer = CatalogArtifactProducer::new(catalog);
        let cancel = AtomicBool::new(false);
        let thumb = producer.produce(hash, ArtifactKind::Thumbnail, &cancel).unwrap();
        assert!(thumb.starts_with(&[0xFF, 0xD8]));

        let meta = producer.produce(hash, ArtifactKind::Metadata, &cancel).unwrap();
        let meta: PhotoMetadata = serde_json::from_slice(&meta).unwrap();
        assert_eq!(meta.width, Some(64));
        assert_eq!(meta.capture_date, Some(77));

        let unknown = ContentHash::from_bytes([9; 16]);
        assert!(producer.produce(unknown, ArtifactKind::Thumbnail, &cancel).is_err());

        // Edited on disk but not rescanned yet.
        let mut edited = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::new(32, 32))
            .write_to(&mut edited, ImageOutputFormat::Png)
            .unwrap();
        fs::write(root.path().join("a.png"), edited.into_inner()).unwrap();
        let err = producer.produce(hash, ArtifactKind::Thumbnail, &cancel).unwrap_err();
        assert!(matches!(err, Error::Path(_)));
    }
}
