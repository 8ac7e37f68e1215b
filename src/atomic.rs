//! Atomic file writes: write to a sibling temp file, then rename.
//!
//! Used by the deploy-state file, the session-state file, and the config
//! file so a crash mid-write never leaves a half-written file behind.

use std::path::Path;

use anyhow::{Context, Result};

/// Write `contents` to `path` atomically (temp file in the same directory,
/// then `rename`). `rename` is atomic on the same filesystem on both Linux
/// and macOS, which is why the temp file is created as a sibling.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create directory: {}", dir.display()))?;

    let tmp_path = dir.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string()),
        std::process::id()
    ));

    std::fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file: {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("rename {} -> {}", tmp_path.display(), path.display()))?;
    Ok(())
}
