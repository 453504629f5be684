//! Playback control plane for spotui.
//!
//! Owns everything between the UI and a spotifyd daemon: installing and
//! verifying the binary, supervising the process, speaking the MPRIS
//! control protocol, and reconciling optimistic UI state with what the
//! daemon actually reports.

pub mod config;
pub mod connection;
pub mod error;
pub mod installer;
pub mod integrity;
pub mod mpris;
pub mod platform;
pub mod reconciler;
pub mod supervisor;
pub mod version;

pub use config::Config;
pub use connection::{ConnectionStatus, ConnectionSupervisor};
pub use error::ControlError;
pub use installer::{InstallOutcome, InstallProgress, InstallState, Installer, VerificationResult};
pub use mpris::{build_client, PlaybackState, PlayerControl, RepeatMode, TrackInfo};
pub use reconciler::{ActionKind, Notice, QueueEntry, Reconciler};
pub use supervisor::{DaemonStatus, ProcessSupervisor, StartOutcome};
pub use version::Version;

/// File logging into the data dir.  stdout stays clean for whatever UI
/// embeds this crate; RUST_LOG overrides the default level.
pub fn init_file_logging() -> anyhow::Result<std::path::PathBuf> {
    let data_dir = platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("control.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    Ok(log_path)
}
