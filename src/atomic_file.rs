//! Write-to-tempfile-then-rename helper, used for every file the pipeline
//! persists across restarts (precision cache, active-markets index,
//! per-market guard environment files) — grounded on original_source's
//! `trade_watcher_final.py` cache save routine.

use std::io;
use std::path::Path;

/// Writes `contents` atomically: write to `<path>.tmp` in the same directory,
/// then rename over `path`. Rename is atomic on the same filesystem, so a
/// reader never observes a partially written file.
pub fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp_path = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("")
    ));
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_atomic_creates_file_with_contents() {
        let dir = std::env::temp_dir().join(format!("atomic-file-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("state.json");
        write_atomic(&path, "{\"a\":1}").unwrap();
        let read_back = std::fs::read_to_string(&path).unwrap();
        assert_eq!(read_back, "{\"a\":1}");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn write_atomic_overwrites_existing_file() {
        let dir = std::env::temp_dir().join(format!("atomic-file-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("state.json");
        write_atomic(&path, "first").unwrap();
        write_atomic(&path, "second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        std::fs::remove_dir_all(&dir).ok();
    }
}
