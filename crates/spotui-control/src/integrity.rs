//! Stateless filesystem probes the installer builds on.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::platform;
use crate::version::Version;

/// Snapshot of the daemon binary on disk.  Derived on demand, never stored;
/// the installer persists only the verification cache.
#[derive(Debug, Clone)]
pub struct BinaryRecord {
    pub path: PathBuf,
    pub executable: bool,
    pub size_bytes: u64,
    pub modified_at: SystemTime,
    /// Filled in by the installer once the version probe has run.
    pub version: Option<Version>,
}

/// Probe a binary path.  Returns `None` when the file does not exist.
pub fn probe(path: &Path) -> Option<BinaryRecord> {
    let meta = std::fs::metadata(path).ok()?;
    if !meta.is_file() {
        return None;
    }
    Some(BinaryRecord {
        path: path.to_path_buf(),
        executable: is_executable(&meta),
        size_bytes: meta.len(),
        modified_at: meta.modified().ok()?,
        version: None,
    })
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    true
}

/// Binary mtime in epoch milliseconds — the cache key that makes external
/// modification self-detecting.
pub fn mtime_ms(path: &Path) -> Option<i64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    system_time_ms(modified)
}

pub fn system_time_ms(t: SystemTime) -> Option<i64> {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_millis() as i64)
}

/// Whether spotifyd has cached login credentials on disk.  The control plane
/// never parses them; authentication itself is a collaborator concern.
pub fn credentials_cached() -> bool {
    platform::credentials_path().exists()
}

#[cfg(unix)]
pub fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
pub fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn probe_missing_file_is_none() {
        assert!(probe(Path::new("/nonexistent/spotifyd")).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn probe_reports_executable_bit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spotifyd");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"#!/bin/sh\n").unwrap();
        drop(f);

        let record = probe(&path).unwrap();
        assert!(!record.executable);
        assert_eq!(record.size_bytes, 10);

        make_executable(&path).unwrap();
        assert!(probe(&path).unwrap().executable);
    }
}
