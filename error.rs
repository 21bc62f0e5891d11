use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Json Error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image Error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Unreadable file {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported image: {0}")]
    Unsupported(String),

    #[error("Corrupt catalog snapshot: {0}")]
    CorruptSnapshot(String),

    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Remote quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Path Error: {0}")]
    Path(String),

    #[error("Initialization Failed: {0}")]
    Init(String),
}

impl Error {
    pub fn unreadable(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Unreadable {
            path: path.into(),
            source,
        }
    }

    /// Errors worth another attempt on a later call or batch.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RemoteUnavailable(_))
    }
}

impl From<opendal::Error> for Error {
    fn from(err: opendal::Error) -> Self {
        use opendal::ErrorKind;

        let message = err.to_string();
        // S3-compatible stores report quota as a provider error code, not a kind.
        if message.contains("QuotaExceeded") {
            return Error::QuotaExceeded(message);
        }
        match err.kind() {
            ErrorKind::RateLimited | ErrorKind::PermissionDenied => Error::RemoteUnavailable(message),
            _ if err.is_temporary() => Error::RemoteUnavailable(message),
            ErrorKind::ConfigInvalid => Error::Config(message),
            ErrorKind::NotFound => Error::Path(message),
            ErrorKind::Unsupported => Error::Unsupported(message),
            _ => Error::Remote(message),
        }
    }
}
