use crate::error::{Error, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use uuid::Uuid;

/// Writes `bytes` to a hidden temp file beside `dest`, fsyncs it, then renames
/// it over `dest`. Readers see either the old file or the complete new one.
pub fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<()> {
    let dir = dest
        .parent()
        .ok_or_else(|| Error::Path(format!("{} has no parent directory", dest.display())))?;
    fs::create_dir_all(dir)?;
    let name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("artifact");
    let tmp = dir.join(format!(".{name}.{}.tmp", Uuid::new_v4().simple()));
    let result = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, dest)
    })();
    if let Err(err) = result {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    Ok(())
}
