use crate::error::{Error, Result};
use crate::models::{ContentHash, FastKey, Format};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use xxhash_rust::xxh3::xxh3_64;

pub const HEAD_LEN: usize = 4096;
const STREAM_CHUNK: usize = 256 * 1024;

/// Result of the cheap per-file read: fast key plus the bytes it was computed from.
#[derive(Debug, Clone)]
pub struct FileProbe {
    pub fast_key: FastKey,
    pub head: Vec<u8>,
    pub modified: Option<i64>,
}

/// Reads at most the first 4 KiB and the file's stat; never the whole file.
pub fn probe(path: &Path) -> Result<FileProbe> {
    let mut file = File::open(path).map_err(|e| Error::unreadable(path, e))?;
    let metadata = file.metadata().map_err(|e| Error::unreadable(path, e))?;
    let mut head = Vec::with_capacity(HEAD_LEN);
    (&mut file)
        .take(HEAD_LEN as u64)
        .read_to_end(&mut head)
        .map_err(|e| Error::unreadable(path, e))?;
    let modified = metadata
        .modified()
        .ok()
        .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64);
    Ok(FileProbe {
        fast_key: FastKey {
            head: xxh3_64(&head),
            size: metadata.len(),
        },
        head,
        modified,
    })
}

pub fn fast_key(path: &Path) -> Result<FastKey> {
    probe(path).map(|p| p.fast_key)
}

/// Streams the whole file once through blake3, keeping the first 128 bits.
pub fn content_hash(path: &Path) -> Result<ContentHash> {
    let mut file = File::open(path).map_err(|e| Error::unreadable(path, e))?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; STREAM_CHUNK];
    loop {
        let read = file.read(&mut buf).map_err(|e| Error::unreadable(path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hash_digest(hasher.finalize()))
}

pub fn content_hash_of(bytes: &[u8]) -> ContentHash {
    hash_digest(blake3::hash(bytes))
}

fn hash_digest(digest: blake3::Hash) -> ContentHash {
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest.as_bytes()[..16]);
    ContentHash::from_bytes(out)
}

/// Memoizes FastKey -> ContentHash so unchanged files are never fully re-read.
#[derive(Default)]
pub struct ContentAddresser {
    memo: Mutex<HashMap<FastKey, ContentHash>>,
    computed: AtomicUsize,
}

impl ContentAddresser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, known: impl IntoIterator<Item = (FastKey, ContentHash)>) {
        let mut memo = self.memo.lock().unwrap_or_else(|p| p.into_inner());
        memo.extend(known);
    }

    pub fn lookup(&self, key: &FastKey) -> Option<ContentHash> {
        let memo = self.memo.lock().unwrap_or_else(|p| p.into_inner());
        memo.get(key).copied()
    }

    /// Returns the memoized hash for `key`, computing (and recording) it only on a miss.
    pub fn resolve(&self, path: &Path, key: FastKey) -> Result<ContentHash> {
        if let Some(hash) = self.lookup(&key) {
            return Ok(hash);
        }
        let hash = content_hash(path)?;
        self.computed.fetch_add(1, Ordering::Relaxed);
        log::debug!("Hashed {} -> {}", path.display(), hash);
        let mut memo = self.memo.lock().unwrap_or_else(|p| p.into_inner());
        memo.insert(key, hash);
        Ok(hash)
    }

    /// Number of full-file hashes computed by `resolve` so far.
    pub fn hash_computations(&self) -> usize {
        self.computed.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.memo.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sniffs the container from the leading bytes. The extension only breaks ties
/// between RAW flavours that share a plain TIFF header.
pub fn detect_format(head: &[u8], ext: Option<&str>) -> Format {
    let ext = ext.map(|e| e.to_ascii_lowercase());
    if head.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Format::Jpeg;
    }
    if head.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Format::Png;
    }
    if head.starts_with(b"FUJIFILMCCD-RAW") {
        return Format::RawRaf;
    }
    if head.len() >= 12 && &head[4..8] == b"ftyp" {
        return match &head[8..12] {
            b"crx " => Format::RawCr3,
            b"heic" | b"heix" | b"hevc" | b"hevx" | b"heim" | b"heis" | b"mif1" | b"msf1" => {
                Format::Heif
            }
            _ => Format::Unknown,
        };
    }
    if head.starts_with(b"IIRO") || head.starts_with(b"IIRS") || head.starts_with(b"MMOR") {
        return Format::RawOrf;
    }
    if head.starts_with(&[b'I', b'I', b'U', 0x00]) {
        return Format::RawRw2;
    }
    let tiff = head.starts_with(&[b'I', b'I', 0x2A, 0x00]) || head.starts_with(&[b'M', b'M', 0x00, 0x2A]);
    if tiff {
        if head.len() >= 10 && &head[8..10] == b"CR" {
            return Format::RawCr2;
        }
        return match ext.as_deref() {
            Some("nef") | Some("nrw") => Format::RawNef,
            Some("arw") | Some("srf") | Some("sr2") => Format::RawArw,
            Some("dng") => Format::RawDng,
            Some("cr2") => Format::RawCr2,
            _ => Format::Tiff,
        };
    }
    Format::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn fast_key_reads_only_the_head() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        let mut bytes_a = vec![7u8; HEAD_LEN + 100];
        let mut bytes_b = bytes_a.clone();
        bytes_a[HEAD_LEN + 50] = 1;
        bytes_b[HEAD_LEN + 50] = 2;
        fs::write(&a, &bytes_a).unwrap();
        fs::write(&b, &bytes_b).unwrap();

        // Same head and size: fast keys collide, content hashes do not.
        assert_eq!(fast_key(&a).unwrap(), fast_key(&b).unwrap());
        assert_ne!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }

    #[test]
    fn identical_bytes_share_a_content_hash() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("one.jpg");
        let b = dir.path().join("nested_two.png");
        fs::write(&a, b"same bytes").unwrap();
        fs::write(&b, b"same bytes").unwrap();
        assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
        assert_eq!(content_hash(&a).unwrap(), content_hash_of(b"same bytes"));
    }

    #[test]
    fn resolve_uses_the_memo() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.jpg");
        let b = dir.path().join("b.jpg");
        fs::write(&a, b"photo").unwrap();
        fs::write(&b, b"photo").unwrap();
        let addresser = ContentAddresser::new();
        let key_a = fast_key(&a).unwrap();
        let key_b = fast_key(&b).unwrap();
        let first = addresser.resolve(&a, key_a).unwrap();
        let second = addresser.resolve(&b, key_b).unwrap();
        assert_eq!(first, second);
        assert_eq!(addresser.hash_computations(), 1);
    }

    #[test]
    fn missing_file_is_unreadable() {
        let err = probe(Path::new("/definitely/not/here.jpg")).unwrap_err();
        assert!(matches!(err, Error::Unreadable { .. }));
    }

    #[test]
    fn detects_formats_from_magic_bytes() {
        assert_eq!(detect_format(&[0xFF, 0xD8, 0xFF, 0xE0], None), Format::Jpeg);
        assert_eq!(
            detect_format(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A], Some("jpg")),
            Format::Png
        );
        let mut heic = vec![0, 0, 0, 24];
        heic.extend_from_slice(b"ftypheic");
        assert_eq!(detect_format(&heic, None), Format::Heif);
        let mut cr3 = vec![0, 0, 0, 24];
        cr3.extend_from_slice(b"ftypcrx ");
        assert_eq!(detect_format(&cr3, None), Format::RawCr3);
        let cr2 = [b'I', b'I', 0x2A, 0x00, 0x10, 0, 0, 0, b'C', b'R'];
        assert_eq!(detect_format(&cr2, None), Format::RawCr2);
        let tiff = [b'I', b'I', 0x2A, 0x00, 0x08, 0, 0, 0];
        assert_eq!(detect_format(&tiff, Some("NEF")), Format::RawNef);
        assert_eq!(detect_format(&tiff, Some("tif")), Format::Tiff);
        assert_eq!(detect_format(b"hello", Some("jpg")), Format::Unknown);
    }
}
