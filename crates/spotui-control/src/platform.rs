//! Per-user paths, environment overrides, and host platform resolution.

use std::path::PathBuf;

use crate::error::ControlError;

/// Environment override: absolute path to a custom spotifyd binary.
/// When set, the installer bypasses its verification cache entirely.
pub const ENV_BINARY_PATH: &str = "SPOTUI_SPOTIFYD_PATH";

/// Environment override: force the legacy playerctl-based protocol backend
/// instead of the native D-Bus client.
pub const ENV_FORCE_LEGACY: &str = "SPOTUI_FORCE_LEGACY_MPRIS";

/// Process name of the playback daemon, as seen by pgrep.
pub const DAEMON_PROCESS_NAME: &str = "spotifyd";

pub fn data_dir() -> PathBuf {
    // ~/.local/share/spotui (XDG layout on every unix, for consistency)
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".local")
        .join("share")
        .join("spotui")
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("spotui")
}

/// Directory the installer manages: the daemon binary plus its sidecar files.
pub fn binary_dir() -> PathBuf {
    data_dir().join("bin")
}

pub fn managed_binary_path() -> PathBuf {
    binary_dir().join(DAEMON_PROCESS_NAME)
}

/// Verification cache sits beside the binary so the two move together.
pub fn verification_cache_path() -> PathBuf {
    binary_dir().join("spotifyd.verified.json")
}

pub fn install_lock_path() -> PathBuf {
    binary_dir().join("install.lock")
}

/// spotifyd writes its cached login credentials here after a successful
/// `spotifyd authenticate`.  The control plane only checks existence.
pub fn credentials_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".cache")
        .join("spotifyd")
        .join("oauth")
        .join("credentials.json")
}

/// Resolve the (os, arch) pair used to pick a release archive.  This runs
/// before any network call; an unsupported pair fails install immediately.
pub fn resolve_platform() -> Result<(&'static str, &'static str), ControlError> {
    let os = if cfg!(target_os = "linux") {
        "linux"
    } else if cfg!(target_os = "macos") {
        "macos"
    } else {
        return Err(unsupported());
    };

    let arch = if cfg!(target_arch = "x86_64") {
        "x86_64"
    } else if cfg!(target_arch = "aarch64") {
        "aarch64"
    } else {
        return Err(unsupported());
    };

    Ok((os, arch))
}

fn unsupported() -> ControlError {
    ControlError::UnsupportedPlatform {
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
    }
}

/// Name of the release asset for an (os, arch) pair.
pub fn release_asset_name(os: &str, arch: &str) -> String {
    format!("spotifyd-{os}-{arch}-default.tar.gz")
}

/// Find the spotifyd binary to run.
/// Priority: 1. custom config path  2. environment variable
/// 3. installer-managed binary  4. system PATH.
pub fn find_daemon_binary(custom_path: Option<&PathBuf>) -> Option<PathBuf> {
    if let Some(path) = custom_path {
        if path.exists() {
            return Some(path.clone());
        }
    }

    if let Ok(path) = std::env::var(ENV_BINARY_PATH) {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
    }

    let managed = managed_binary_path();
    if managed.exists() {
        return Some(managed);
    }

    find_on_path(DAEMON_PROCESS_NAME)
}

pub fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var("PATH").ok()?;
    for dir in path.split(':') {
        let p = PathBuf::from(dir).join(name);
        if p.exists() {
            return Some(p);
        }
    }
    None
}

pub fn find_playerctl_binary() -> Option<PathBuf> {
    find_on_path("playerctl")
}

pub fn force_legacy_backend() -> bool {
    matches!(
        std::env::var(ENV_FORCE_LEGACY).as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_files_live_beside_the_binary() {
        let bin = managed_binary_path();
        let cache = verification_cache_path();
        let lock = install_lock_path();
        assert_eq!(bin.parent(), cache.parent());
        assert_eq!(bin.parent(), lock.parent());
    }

    #[test]
    fn asset_name_carries_platform_and_arch() {
        let name = release_asset_name("linux", "x86_64");
        assert!(name.contains("linux"));
        assert!(name.contains("x86_64"));
        assert!(name.ends_with(".tar.gz"));
    }
}
