// =============================================================================
// Atomic file replacement
// =============================================================================
//
// Write to a temporary sibling, fsync it, then rename over the canonical path.
// A crash at any point leaves either the old or the new file in place, never a
// partial one. A stale `.tmp` left by a crash is simply overwritten next time.
// =============================================================================

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Temporary sibling used while `path` is being replaced.
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Atomically replace `path` with `bytes`.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp = tmp_path(path);
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(&tmp, path)?;
    sync_parent(path);
    Ok(())
}

/// Best-effort fsync of the containing directory so the rename itself is
/// durable. Not supported on every platform, so failures are ignored.
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}
