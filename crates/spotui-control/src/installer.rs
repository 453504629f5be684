//! Binary installer: verification fast path, download/extract, repair.
//!
//! Verification is tiered to keep the common case fast:
//!   Tier 1 — trust the on-disk cache when platform, arch and binary mtime
//!            all match (no subprocess; single-digit milliseconds).
//!   Tier 2 — existence and executable-bit checks.
//!   Tier 3 — spawn `spotifyd --version` and compare numerically against
//!            the configured minimum.
//!
//! Install and repair are serialized across processes by a lock file beside
//! the binary; a stale lock from a crashed run is reclaimed.

use std::io::Read;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::ControlError;
use crate::integrity;
use crate::platform;
use crate::supervisor::is_pid_alive;
use crate::version::{parse_version_output, Version};

/// Hard timeout for the `--version` subprocess probe.
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Hard timeout for archive extraction.
const EXTRACT_TIMEOUT: Duration = Duration::from_secs(30);
/// Base delay for download retry backoff (doubles per attempt).
const DOWNLOAD_BACKOFF_BASE: Duration = Duration::from_millis(500);

// ── states & results ──────────────────────────────────────────────────────────

/// Installer state machine.  Exactly one state is current at any time;
/// `Valid` is the only state playback startup may proceed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstallState {
    #[default]
    NotChecked,
    Checking,
    Valid,
    Missing,
    Corrupted,
    Outdated,
    WrongArch,
    NoPermissions,
    Installing,
    Repairing,
    Error,
}

#[derive(Debug, Clone)]
pub struct VerificationResult {
    pub state: InstallState,
    pub version: Option<Version>,
    pub can_proceed: bool,
    pub needs_install: bool,
    pub needs_repair: bool,
}

impl VerificationResult {
    fn valid(version: Version) -> Self {
        Self {
            state: InstallState::Valid,
            version: Some(version),
            can_proceed: true,
            needs_install: false,
            needs_repair: false,
        }
    }

    fn missing() -> Self {
        Self {
            state: InstallState::Missing,
            version: None,
            can_proceed: false,
            needs_install: true,
            needs_repair: false,
        }
    }

    fn broken(state: InstallState, version: Option<Version>) -> Self {
        Self {
            state,
            version,
            can_proceed: false,
            needs_install: false,
            needs_repair: true,
        }
    }
}

/// Install progress phases, published for UI consumption.
#[derive(Debug, Clone)]
pub enum InstallProgress {
    Resolving,
    Downloading {
        attempt: u32,
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
    },
    Extracting,
    Verifying,
    Complete,
}

pub type ProgressTx = mpsc::UnboundedSender<InstallProgress>;

#[derive(Debug, Clone)]
pub enum InstallOutcome {
    /// Binary present, executable and verified.
    Ready { version: Version },
    /// Another process holds the install lock; it is doing the work.
    InProgress { pid: u32 },
}

// ── verification cache ────────────────────────────────────────────────────────

/// Persisted beside the binary.  Valid only when platform/arch match the
/// host AND `binary_modified_at_ms` equals the binary's current mtime, so an
/// externally replaced binary invalidates the cache by itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VerificationCache {
    version: String,
    verified_at: DateTime<Utc>,
    platform: String,
    arch: String,
    binary_modified_at_ms: i64,
}

// ── install lock ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    pid: u32,
    acquired_at_ms: i64,
}

struct InstallLock {
    path: PathBuf,
    stale_after: Duration,
}

/// Removes the lock file on drop, including on forced shutdown paths that
/// unwind through the installer.
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl InstallLock {
    fn acquire(&self) -> Result<LockGuard, ControlError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        for first_try in [true, false] {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(file) => {
                    let record = LockRecord {
                        pid: std::process::id(),
                        acquired_at_ms: Utc::now().timestamp_millis(),
                    };
                    serde_json::to_writer(file, &record).map_err(std::io::Error::other)?;
                    return Ok(LockGuard {
                        path: self.path.clone(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && first_try => {
                    match self.read_holder() {
                        Some(record) if self.is_stale(&record) => {
                            warn!(
                                "reclaiming stale install lock from pid {} at {}",
                                record.pid,
                                self.path.display()
                            );
                            let _ = std::fs::remove_file(&self.path);
                        }
                        Some(record) => {
                            return Err(ControlError::InstallLockHeld { pid: record.pid });
                        }
                        // Unreadable lock: treat as crashed writer.
                        None => {
                            let _ = std::fs::remove_file(&self.path);
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let pid = self.read_holder().map(|r| r.pid).unwrap_or(0);
                    return Err(ControlError::InstallLockHeld { pid });
                }
                Err(e) => return Err(e.into()),
            }
        }
        unreachable!("lock acquire loop always returns");
    }

    fn read_holder(&self) -> Option<LockRecord> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn is_stale(&self, record: &LockRecord) -> bool {
        let age_ms = Utc::now().timestamp_millis() - record.acquired_at_ms;
        age_ms > self.stale_after.as_millis() as i64 || !is_pid_alive(record.pid)
    }
}

// ── installer ─────────────────────────────────────────────────────────────────

pub struct Installer {
    binary_path: PathBuf,
    cache_path: PathBuf,
    lock: InstallLock,
    /// Operator-supplied binary: verified fully every call, cache bypassed.
    custom_binary: bool,
    min_version: String,
    release_version: String,
    release_base_url: String,
    download_attempts: u32,
    state_tx: watch::Sender<InstallState>,
    http: reqwest::Client,
}

impl Installer {
    pub fn new(config: &Config) -> Self {
        let (binary_path, custom_binary) = match &config.daemon.binary_path {
            Some(path) => (path.clone(), true),
            None => (platform::managed_binary_path(), false),
        };
        Self::at_paths(
            config,
            binary_path,
            custom_binary,
            platform::verification_cache_path(),
            platform::install_lock_path(),
        )
    }

    /// Construction with explicit paths.  Lock-file and cache behaviour are
    /// independently testable this way.
    pub fn at_paths(
        config: &Config,
        binary_path: PathBuf,
        custom_binary: bool,
        cache_path: PathBuf,
        lock_path: PathBuf,
    ) -> Self {
        let (state_tx, _) = watch::channel(InstallState::NotChecked);
        Self {
            binary_path,
            cache_path,
            lock: InstallLock {
                path: lock_path,
                stale_after: Duration::from_secs(config.install.lock_stale_secs),
            },
            custom_binary,
            min_version: config.install.min_version.clone(),
            release_version: config.install.release_version.clone(),
            release_base_url: config.install.release_base_url.clone(),
            download_attempts: config.install.download_attempts.max(1),
            state_tx,
            http: reqwest::Client::new(),
        }
    }

    pub fn binary_path(&self) -> &PathBuf {
        &self.binary_path
    }

    pub fn state(&self) -> InstallState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<InstallState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: InstallState) {
        self.state_tx.send_replace(state);
    }

    // ── verify ────────────────────────────────────────────────────────────────

    pub async fn verify(&self) -> Result<VerificationResult, ControlError> {
        self.set_state(InstallState::Checking);

        // Tier 1: cached verification.  Skipped for operator-supplied paths.
        if !self.custom_binary {
            if let Some(version) = self.cached_verification() {
                debug!("verification cache hit for {}", self.binary_path.display());
                self.set_state(InstallState::Valid);
                return Ok(VerificationResult::valid(version));
            }
        }

        // Tier 2: filesystem probes.
        let record = match integrity::probe(&self.binary_path) {
            Some(record) => record,
            None => {
                info!("spotifyd binary missing at {}", self.binary_path.display());
                self.set_state(InstallState::Missing);
                return Ok(VerificationResult::missing());
            }
        };
        if !record.executable {
            info!("spotifyd binary not executable: {}", self.binary_path.display());
            self.set_state(InstallState::NoPermissions);
            return Ok(VerificationResult::broken(InstallState::NoPermissions, None));
        }

        // Tier 3: version probe subprocess.
        let result = match self.probe_version().await {
            ProbeOutcome::Version(version) => {
                if crate::version::is_version_valid(
                    &version.to_string(),
                    &self.min_version,
                ) {
                    if !self.custom_binary {
                        self.write_cache(&version);
                    }
                    VerificationResult::valid(version)
                } else {
                    info!("spotifyd {} is older than required {}", version, self.min_version);
                    VerificationResult::broken(InstallState::Outdated, Some(version))
                }
            }
            ProbeOutcome::WrongArch => {
                warn!("spotifyd binary is for a different architecture");
                VerificationResult::broken(InstallState::WrongArch, None)
            }
            ProbeOutcome::Corrupted(reason) => {
                warn!("spotifyd binary failed version probe: {}", reason);
                VerificationResult::broken(InstallState::Corrupted, None)
            }
        };

        self.set_state(result.state);
        Ok(result)
    }

    fn cached_verification(&self) -> Option<Version> {
        let content = std::fs::read_to_string(&self.cache_path).ok()?;
        let cache: VerificationCache = serde_json::from_str(&content).ok()?;

        let (os, arch) = platform::resolve_platform().ok()?;
        if cache.platform != os || cache.arch != arch {
            debug!("verification cache is for {}-{}, host is {}-{}",
                cache.platform, cache.arch, os, arch);
            return None;
        }

        let mtime = integrity::mtime_ms(&self.binary_path)?;
        if mtime != cache.binary_modified_at_ms {
            debug!("binary mtime changed since cache was written, re-verifying");
            return None;
        }

        Version::from_str(&cache.version).ok().filter(|v| {
            crate::version::is_version_valid(&v.to_string(), &self.min_version)
        })
    }

    fn write_cache(&self, version: &Version) {
        let Ok((os, arch)) = platform::resolve_platform() else {
            return;
        };
        let Some(mtime) = integrity::mtime_ms(&self.binary_path) else {
            return;
        };
        let cache = VerificationCache {
            version: version.to_string(),
            verified_at: Utc::now(),
            platform: os.to_string(),
            arch: arch.to_string(),
            binary_modified_at_ms: mtime,
        };
        if let Ok(json) = serde_json::to_string_pretty(&cache) {
            if let Err(e) = std::fs::write(&self.cache_path, json) {
                warn!("failed to write verification cache: {}", e);
            }
        }
    }

    fn drop_cache(&self) {
        let _ = std::fs::remove_file(&self.cache_path);
    }

    async fn probe_version(&self) -> ProbeOutcome {
        let output = tokio::time::timeout(
            VERSION_PROBE_TIMEOUT,
            tokio::process::Command::new(&self.binary_path)
                .arg("--version")
                .kill_on_drop(true)
                .output(),
        )
        .await;

        let output = match output {
            Err(_) => {
                return ProbeOutcome::Corrupted(format!(
                    "version probe timed out after {VERSION_PROBE_TIMEOUT:?}"
                ))
            }
            Ok(Err(e)) if e.raw_os_error() == Some(exec_format_errno()) => {
                return ProbeOutcome::WrongArch
            }
            Ok(Err(e)) => return ProbeOutcome::Corrupted(format!("spawn failed: {e}")),
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            return ProbeOutcome::Corrupted(format!("exit status {}", output.status));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match parse_version_output(&stdout) {
            Some(version) => ProbeOutcome::Version(version),
            None => ProbeOutcome::Corrupted(format!(
                "no version in output: {}",
                stdout.trim()
            )),
        }
    }

    // ── install ───────────────────────────────────────────────────────────────

    pub async fn install(
        &self,
        progress: Option<ProgressTx>,
    ) -> Result<InstallOutcome, ControlError> {
        // An operator-supplied path is outside our managed directory; we
        // never write a release over it.
        if self.custom_binary {
            return Err(ControlError::CustomBinaryUnusable(self.state()));
        }

        let _guard = match self.lock.acquire() {
            Ok(guard) => guard,
            Err(ControlError::InstallLockHeld { pid }) => {
                info!("install already running in pid {}, not racing it", pid);
                return Ok(InstallOutcome::InProgress { pid });
            }
            Err(e) => return Err(e),
        };

        self.set_state(InstallState::Installing);
        send_progress(&progress, InstallProgress::Resolving);

        // Platform resolution happens before any network traffic; an
        // unsupported host fails here and never downloads anything.
        let (os, arch) = platform::resolve_platform()?;
        let asset = platform::release_asset_name(os, arch);
        let url = format!(
            "{}/v{}/{}",
            self.release_base_url, self.release_version, asset
        );

        info!("installing spotifyd {} from {}", self.release_version, url);
        let archive = self.download_with_retry(&url, &progress).await?;

        send_progress(&progress, InstallProgress::Extracting);
        self.extract_binary(archive).await?;
        integrity::make_executable(&self.binary_path)?;
        self.drop_cache();

        send_progress(&progress, InstallProgress::Verifying);
        let verification = self.verify().await?;
        match verification.version {
            Some(version) if verification.can_proceed => {
                info!("spotifyd {} installed at {}", version, self.binary_path.display());
                send_progress(&progress, InstallProgress::Complete);
                Ok(InstallOutcome::Ready { version })
            }
            _ => {
                self.set_state(InstallState::Error);
                Err(ControlError::Extract(format!(
                    "freshly installed binary failed verification ({:?})",
                    verification.state
                )))
            }
        }
    }

    async fn download_with_retry(
        &self,
        url: &str,
        progress: &Option<ProgressTx>,
    ) -> Result<Vec<u8>, ControlError> {
        let mut last_error = String::new();

        for attempt in 1..=self.download_attempts {
            if attempt > 1 {
                let delay = DOWNLOAD_BACKOFF_BASE * 2u32.pow(attempt - 2);
                info!("download attempt {} after {:?} backoff", attempt, delay);
                tokio::time::sleep(delay).await;
            }

            match self.download_once(url, attempt, progress).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    warn!("download attempt {} failed: {}", attempt, e);
                    last_error = e;
                }
            }
        }

        self.set_state(InstallState::Error);
        Err(ControlError::Download(format!(
            "{} attempts exhausted, last error: {}",
            self.download_attempts, last_error
        )))
    }

    async fn download_once(
        &self,
        url: &str,
        attempt: u32,
        progress: &Option<ProgressTx>,
    ) -> Result<Vec<u8>, String> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status()));
        }

        let total_bytes = response.content_length();
        let mut stream = response.bytes_stream();
        let mut bytes: Vec<u8> = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| e.to_string())?;
            bytes.extend_from_slice(&chunk);
            send_progress(
                progress,
                InstallProgress::Downloading {
                    attempt,
                    downloaded_bytes: bytes.len() as u64,
                    total_bytes,
                },
            );
        }

        Ok(bytes)
    }

    /// Unpack the release archive and place the daemon binary at
    /// `binary_path`.  The archive layout varies between releases, so the
    /// entry is matched by file name rather than path.
    async fn extract_binary(&self, archive: Vec<u8>) -> Result<(), ControlError> {
        let target = self.binary_path.clone();
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let extracted = tokio::time::timeout(
            EXTRACT_TIMEOUT,
            tokio::task::spawn_blocking(move || extract_daemon_from_tar_gz(&archive, &target)),
        )
        .await;

        match extracted {
            Err(_) => {
                self.set_state(InstallState::Error);
                Err(ControlError::Extract(format!(
                    "extraction timed out after {EXTRACT_TIMEOUT:?}"
                )))
            }
            Ok(Err(join)) => {
                self.set_state(InstallState::Error);
                Err(ControlError::Extract(format!("extraction task failed: {join}")))
            }
            Ok(Ok(result)) => result.map_err(|e| {
                self.set_state(InstallState::Error);
                ControlError::Extract(e)
            }),
        }
    }

    // ── repair ────────────────────────────────────────────────────────────────

    /// Dispatch on the verification verdict.  `NoPermissions` needs only a
    /// chmod; a corrupted, outdated or wrong-arch binary is replaced
    /// wholesale.  Anything else is not repairable and is returned as a hard
    /// failure naming the offending state.
    pub async fn repair(
        &self,
        result: &VerificationResult,
        progress: Option<ProgressTx>,
    ) -> Result<InstallOutcome, ControlError> {
        // Repair deletes and reinstalls, which must never touch a file the
        // operator pointed us at.  They asked us not to manage it.
        if self.custom_binary {
            warn!(
                "operator-supplied binary at {} failed verification ({:?}); leaving it alone",
                self.binary_path.display(),
                result.state
            );
            self.set_state(InstallState::Error);
            return Err(ControlError::CustomBinaryUnusable(result.state));
        }

        match result.state {
            InstallState::NoPermissions => {
                self.set_state(InstallState::Repairing);
                info!("repairing permissions on {}", self.binary_path.display());
                integrity::make_executable(&self.binary_path)?;
                let verification = self.verify().await?;
                match verification.version {
                    Some(version) if verification.can_proceed => {
                        Ok(InstallOutcome::Ready { version })
                    }
                    // chmod fixed the bit but uncovered another problem
                    // (e.g. an old version that was unreadable before).
                    _ => Box::pin(self.repair(&verification, progress)).await,
                }
            }
            InstallState::Corrupted | InstallState::Outdated | InstallState::WrongArch => {
                self.set_state(InstallState::Repairing);
                info!(
                    "replacing {:?} spotifyd binary at {}",
                    result.state,
                    self.binary_path.display()
                );
                match std::fs::remove_file(&self.binary_path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                self.drop_cache();
                self.install(progress).await
            }
            state => {
                self.set_state(InstallState::Error);
                Err(ControlError::Unrepairable(state))
            }
        }
    }
}

enum ProbeOutcome {
    Version(Version),
    WrongArch,
    Corrupted(String),
}

#[cfg(unix)]
fn exec_format_errno() -> i32 {
    libc::ENOEXEC
}

#[cfg(not(unix))]
fn exec_format_errno() -> i32 {
    193 // ERROR_BAD_EXE_FORMAT
}

fn send_progress(progress: &Option<ProgressTx>, update: InstallProgress) {
    if let Some(tx) = progress {
        let _ = tx.send(update);
    }
}

fn extract_daemon_from_tar_gz(
    bytes: &[u8],
    target: &std::path::Path,
) -> Result<(), String> {
    let gz = flate2::read::GzDecoder::new(std::io::Cursor::new(bytes));
    let mut archive = tar::Archive::new(gz);

    for entry in archive.entries().map_err(|e| e.to_string())? {
        let mut entry = entry.map_err(|e| e.to_string())?;
        let path = entry.path().map_err(|e| e.to_string())?;
        let is_daemon = path
            .file_name()
            .map(|n| n == platform::DAEMON_PROCESS_NAME)
            .unwrap_or(false);
        if !is_daemon {
            continue;
        }

        let mut buffer = Vec::new();
        entry.read_to_end(&mut buffer).map_err(|e| e.to_string())?;
        std::fs::write(target, buffer).map_err(|e| e.to_string())?;
        return Ok(());
    }

    Err(format!(
        "'{}' not found in release archive",
        platform::DAEMON_PROCESS_NAME
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_roundtrips_through_json() {
        let cache = VerificationCache {
            version: "0.4.1".into(),
            verified_at: Utc::now(),
            platform: "linux".into(),
            arch: "x86_64".into(),
            binary_modified_at_ms: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&cache).unwrap();
        let back: VerificationCache = serde_json::from_str(&json).unwrap();
        assert_eq!(back.version, cache.version);
        assert_eq!(back.binary_modified_at_ms, cache.binary_modified_at_ms);
    }

    #[test]
    fn stale_lock_detection() {
        let lock = InstallLock {
            path: PathBuf::from("/tmp/unused.lock"),
            stale_after: Duration::from_secs(300),
        };
        // Fresh lock held by us: live.
        let live = LockRecord {
            pid: std::process::id(),
            acquired_at_ms: Utc::now().timestamp_millis(),
        };
        assert!(!lock.is_stale(&live));
        // Old timestamp: stale even if the pid were alive.
        let old = LockRecord {
            pid: std::process::id(),
            acquired_at_ms: Utc::now().timestamp_millis() - 3_600_000,
        };
        assert!(lock.is_stale(&old));
        // Dead pid: stale regardless of age.
        let dead = LockRecord {
            pid: u32::MAX - 1,
            acquired_at_ms: Utc::now().timestamp_millis(),
        };
        assert!(lock.is_stale(&dead));
    }

    #[test]
    fn tar_extraction_finds_nested_binary() {
        let mut tar_bytes = Vec::new();
        {
            let gz = flate2::write::GzEncoder::new(&mut tar_bytes, flate2::Compression::fast());
            let mut builder = tar::Builder::new(gz);
            let payload = b"#!/bin/sh\necho spotifyd 9.9.9\n";
            let mut header = tar::Header::new_gnu();
            header.set_size(payload.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder
                .append_data(&mut header, "release/bin/spotifyd", payload.as_slice())
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("spotifyd");
        extract_daemon_from_tar_gz(&tar_bytes, &target).unwrap();
        assert!(target.exists());
        let content = std::fs::read_to_string(&target).unwrap();
        assert!(content.contains("spotifyd 9.9.9"));
    }

    #[test]
    fn archive_without_daemon_is_an_error() {
        let mut tar_bytes = Vec::new();
        {
            let gz = flate2::write::GzEncoder::new(&mut tar_bytes, flate2::Compression::fast());
            let mut builder = tar::Builder::new(gz);
            let payload = b"readme";
            let mut header = tar::Header::new_gnu();
            header.set_size(payload.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "README.md", payload.as_slice())
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("spotifyd");
        assert!(extract_daemon_from_tar_gz(&tar_bytes, &target).is_err());
    }
}
