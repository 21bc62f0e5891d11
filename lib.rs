pub mod addresser;
pub mod artifacts;
pub mod backup;
pub mod cache;
pub mod catalog;
pub mod catalog_handle;
pub mod config;
pub mod error;
pub mod events;
pub mod exif_reader;
pub mod fsutil;
pub mod library;
pub mod listing;
pub mod models;
pub mod remote;
pub mod scan;
pub mod scheduler;
pub mod sync;
pub mod thumbnails;

pub use error::{Error, Result};
pub use library::PhotoLibrary;
