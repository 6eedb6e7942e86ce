//! Output files: temp-then-rename writes into per-page directories.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Temporary file suffix used before atomic rename.
pub const TEMP_SUFFIX: &str = ".part";

/// Path for the temp file: appends `.part` to the final path (e.g. `001.jpg` → `001.jpg.part`).
pub fn temp_path(final_path: &Path) -> PathBuf {
    let mut o = final_path.as_os_str().to_owned();
    o.push(TEMP_SUFFIX);
    PathBuf::from(o)
}

/// Write `data` to `final_path` through a synced temp file and a rename, so
/// readers see either the old file or the complete new one.
pub fn write_atomic(final_path: &Path, data: &[u8]) -> Result<()> {
    if let Some(dir) = final_path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    let tmp = temp_path(final_path);
    let res = (|| -> Result<()> {
        let mut f = File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
        f.write_all(data)
            .with_context(|| format!("write {}", tmp.display()))?;
        f.sync_all().with_context(|| format!("sync {}", tmp.display()))?;
        fs::rename(&tmp, final_path).with_context(|| {
            format!("rename {} -> {}", tmp.display(), final_path.display())
        })?;
        Ok(())
    })();
    if res.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    res
}

/// Pretty JSON variant of [`write_atomic`].
pub fn write_json_atomic<T: serde::Serialize>(final_path: &Path, value: &T) -> Result<()> {
    let mut body = serde_json::to_vec_pretty(value).context("serialize JSON document")?;
    body.push(b'\n');
    write_atomic(final_path, &body)
}

/// Size of `path` if it is an existing regular file with content.
pub fn existing_nonempty(path: &Path) -> Option<u64> {
    let meta = fs::metadata(path).ok()?;
    (meta.is_file() && meta.len() > 0).then_some(meta.len())
}
