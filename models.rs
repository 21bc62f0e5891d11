use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Cheap change-detection identity: hash of the first 4 KiB plus the file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FastKey {
    pub head: u64,
    pub size: u64,
}

impl FastKey {
    pub fn head_hex(&self) -> String {
        format!("{:016x}", self.head)
    }

    pub fn from_parts(head_hex: &str, size: &str) -> Option<Self> {
        Some(Self {
            head: u64::from_str_radix(head_hex, 16).ok()?,
            size: size.parse().ok()?,
        })
    }
}

impl fmt::Display for FastKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}:{}", self.head, self.size)
    }
}

/// 128-bit whole-file digest used for dedup, cache keys and remote keys.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, SerializeDisplay, DeserializeFromStr)]
pub struct ContentHash([u8; 16]);

impl ContentHash {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// First two hex characters; used as the on-disk shard directory.
    pub fn shard(&self) -> String {
        format!("{:02x}", self.0[0])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 || !s.is_ascii() {
            return Err(format!("content hash must be 32 hex characters, got {s:?}"));
        }
        let mut out = [0u8; 16];
        for (idx, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[idx * 2..idx * 2 + 2], 16)
                .map_err(|e| format!("invalid content hash {s:?}: {e}"))?;
        }
        Ok(Self(out))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr)]
pub enum Format {
    Jpeg,
    Png,
    Heif,
    Tiff,
    RawCr2,
    RawCr3,
    RawNef,
    RawArw,
    RawDng,
    RawRaf,
    RawOrf,
    RawRw2,
    Unknown,
}

impl Format {
    pub const ALL: [Format; 13] = [
        Format::Jpeg,
        Format::Png,
        Format::Heif,
        Format::Tiff,
        Format::RawCr2,
        Format::RawCr3,
        Format::RawNef,
        Format::RawArw,
        Format::RawDng,
        Format::RawRaf,
        Format::RawOrf,
        Format::RawRw2,
        Format::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Jpeg => "JPEG",
            Format::Png => "PNG",
            Format::Heif => "HEIF",
            Format::Tiff => "TIFF",
            Format::RawCr2 => "RAW-CR2",
            Format::RawCr3 => "RAW-CR3",
            Format::RawNef => "RAW-NEF",
            Format::RawArw => "RAW-ARW",
            Format::RawDng => "RAW-DNG",
            Format::RawRaf => "RAW-RAF",
            Format::RawOrf => "RAW-ORF",
            Format::RawRw2 => "RAW-RW2",
            Format::Unknown => "UNKNOWN",
        }
    }

    pub fn is_raw(&self) -> bool {
        self.as_str().starts_with("RAW-")
    }

    /// Formats the `image` crate can decode directly.
    pub fn is_decodable(&self) -> bool {
        matches!(self, Format::Jpeg | Format::Png | Format::Tiff)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Format::ALL
            .iter()
            .copied()
            .find(|format| format.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown format {s:?}"))
    }
}

/// One row of a catalog; identified by its root-relative path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub path: String,
    pub fast_key: FastKey,
    pub content_hash: Option<ContentHash>,
    pub capture_date: i64,
    pub format: Format,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ArtifactKind {
    Thumbnail,
    Metadata,
}

impl ArtifactKind {
    pub fn ext(&self) -> &'static str {
        match self {
            ArtifactKind::Thumbnail => "thumb",
            ArtifactKind::Metadata => "meta",
        }
    }
}

/// Structured payload of the `.meta` artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PhotoMetadata {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub capture_date: Option<i64>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub lens: Option<String>,
    pub gps_lat: Option<f64>,
    pub gps_lng: Option<f64>,
    pub format: Option<Format>,
}

/// Opaque user namespace supplied by the identity collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace(pub Uuid);

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Namespace {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Namespace)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupState {
    Queued,
    Uploading,
    Uploaded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupQueueItem {
    pub path: String,
    pub fast_key: FastKey,
    pub content_hash: Option<ContentHash>,
    pub format: Format,
    pub capture_date: i64,
    pub queued_at: i64,
    pub state: BackupState,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub next_attempt_at: Option<i64>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl BackupQueueItem {
    pub fn from_entry(entry: &CatalogEntry, queued_at: i64) -> Self {
        Self {
            path: entry.path.clone(),
            fast_key: entry.fast_key,
            content_hash: entry.content_hash,
            format: entry.format,
            capture_date: entry.capture_date,
            queued_at,
            state: BackupState::Queued,
            attempts: 0,
            next_attempt_at: None,
            last_error: None,
        }
    }

    pub fn to_entry(&self) -> CatalogEntry {
        CatalogEntry {
            path: self.path.clone(),
            fast_key: self.fast_key,
            content_hash: self.content_hash,
            capture_date: self.capture_date,
            format: self.format,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_hex_round_trips_and_shards() {
        let hash = ContentHash::from_bytes([0xab; 16]);
        assert_eq!(hash.to_hex().len(), 32);
        assert_eq!(hash.shard(), "ab");
        assert_eq!(hash.to_hex().parse::<ContentHash>().unwrap(), hash);
        assert!("xyz".parse::<ContentHash>().is_err());
    }

    #[test]
    fn format_names_parse_case_insensitively() {
        assert_eq!("raw-cr2".parse::<Format>().unwrap(), Format::RawCr2);
        assert_eq!("JPEG".parse::<Format>().unwrap(), Format::Jpeg);
        assert!(Format::RawDng.is_raw());
        assert!(!Format::Heif.is_raw());
        assert!("GIF".parse::<Format>().is_err());
    }

    #[test]
    fn backup_item_serializes_hash_as_hex() {
        let entry = CatalogEntry {
            path: "a.jpg".into(),
            fast_key: FastKey { head: 1, size: 2 },
            content_hash: Some(ContentHash::from_bytes([1; 16])),
            capture_date: 10,
            format: Format::Jpeg,
        };
        let item = BackupQueueItem::from_entry(&entry, 99);
        let json = serde_json::to_string(&item).unwrap();
        assert!(json.contains("01010101010101010101010101010101"));
        assert!(json.contains("\"queued\""));
        let back: BackupQueueItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back.to_entry(), entry);
    }
}
