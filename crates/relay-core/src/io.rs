use crate::error::Result;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Directory that holds `path`, created if missing. `.` for bare file names.
fn prepare_parent(path: &Path) -> Result<&Path> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent)?;
            Ok(parent)
        }
        _ => Ok(Path::new(".")),
    }
}

/// Replace `path` with `data` via a synced tempfile in the same directory,
/// so readers see either the old file or the new one.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = NamedTempFile::new_in(prepare_parent(path)?)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Append `text` to `path` in one write, then sync. Creates the file and
/// its parents if needed.
pub fn append_text(path: &Path, text: &str) -> Result<()> {
    prepare_parent(path)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(text.as_bytes())?;
    file.sync_data()?;
    Ok(())
}
