//! Control-protocol client for the daemon's media-player interface.
//!
//! Two backends live behind the [`PlayerControl`] trait: the native D-Bus
//! client built on zbus proxies, and a legacy fallback that shells out to
//! `playerctl` for environments where the native session bus is unusable.
//! Everything above the trait speaks milliseconds; the wire protocol's
//! microsecond units never leak past this module.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use zbus::zvariant::{Array, ObjectPath, OwnedValue, Str};
use zbus::{names::BusName, proxy, Connection};

use crate::config::Config;
use crate::error::ControlError;
use crate::platform;

/// Bus names the daemon may register under.  A unique suffix (e.g.
/// `.spotifyd.instance1234`) is matched by prefix.
pub const MPRIS_BUS_PREFIXES: [&str; 2] = [
    "org.mpris.MediaPlayer2.spotifyd",
    "org.mpris.MediaPlayer2.spotify",
];

/// Timeout on every legacy-backend subprocess invocation.
const PLAYERCTL_TIMEOUT: Duration = Duration::from_secs(2);

// ── state types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RepeatMode {
    #[default]
    None,
    Playlist,
    Track,
}

impl RepeatMode {
    pub fn cycle(self) -> Self {
        match self {
            Self::None => Self::Playlist,
            Self::Playlist => Self::Track,
            Self::Track => Self::None,
        }
    }

    pub fn as_loop_status(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Playlist => "Playlist",
            Self::Track => "Track",
        }
    }

    pub fn from_loop_status(status: &str) -> Self {
        match status {
            "Playlist" => Self::Playlist,
            "Track" => Self::Track,
            _ => Self::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub art_url: Option<String>,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlaybackState {
    pub is_playing: bool,
    pub position_ms: i64,
    pub duration_ms: i64,
    pub volume: f64,
    pub shuffle: bool,
    pub repeat: RepeatMode,
    pub track: Option<TrackInfo>,
}

// ── trait ─────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait PlayerControl: Send + Sync {
    async fn connect(&self) -> Result<(), ControlError>;
    async fn is_connected(&self) -> bool;
    /// Reconnect if the existing connection has gone stale.
    async fn ensure_connection(&self) -> Result<(), ControlError>;

    async fn play_pause(&self) -> Result<(), ControlError>;
    async fn play_uri(&self, uri: &str) -> Result<(), ControlError>;
    async fn next(&self) -> Result<(), ControlError>;
    async fn previous(&self) -> Result<(), ControlError>;
    /// Relative seek; negative values rewind.
    async fn seek(&self, delta_ms: i64) -> Result<(), ControlError>;
    async fn set_volume(&self, volume: f64) -> Result<(), ControlError>;
    async fn set_shuffle(&self, shuffle: bool) -> Result<(), ControlError>;
    async fn set_repeat(&self, repeat: RepeatMode) -> Result<(), ControlError>;
    async fn get_state(&self) -> Result<PlaybackState, ControlError>;

    /// Toggle shuffle.  Callers that already hold the current value pass it
    /// in to skip a round-trip read.
    async fn toggle_shuffle(&self, known: Option<bool>) -> Result<bool, ControlError> {
        let current = match known {
            Some(value) => value,
            None => self.get_state().await?.shuffle,
        };
        let target = !current;
        self.set_shuffle(target).await?;
        Ok(target)
    }

    /// Advance repeat through None → Playlist → Track → None.
    async fn cycle_repeat(&self, known: Option<RepeatMode>) -> Result<RepeatMode, ControlError> {
        let current = match known {
            Some(mode) => mode,
            None => self.get_state().await?.repeat,
        };
        let target = current.cycle();
        self.set_repeat(target).await?;
        Ok(target)
    }
}

/// Pick a backend from config and environment.  The legacy subprocess
/// backend is only usable when a `playerctl` binary is actually present.
pub fn build_client(config: &Config) -> Arc<dyn PlayerControl> {
    let want_legacy = config.protocol.force_legacy || platform::force_legacy_backend();
    if want_legacy {
        if let Some(binary) = platform::find_playerctl_binary() {
            info!("using legacy playerctl backend at {}", binary.display());
            return Arc::new(PlayerctlClient::new(binary));
        }
        warn!("legacy backend requested but playerctl not found, using native");
    }
    Arc::new(MprisClient::new())
}

// ── native backend ────────────────────────────────────────────────────────────

#[proxy(
    interface = "org.mpris.MediaPlayer2.Player",
    default_path = "/org/mpris/MediaPlayer2"
)]
trait Player {
    fn play_pause(&self) -> zbus::Result<()>;
    fn next(&self) -> zbus::Result<()>;
    fn previous(&self) -> zbus::Result<()>;
    fn seek(&self, offset: i64) -> zbus::Result<()>;
    fn open_uri(&self, uri: &str) -> zbus::Result<()>;

    #[zbus(property)]
    fn playback_status(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn metadata(&self) -> zbus::Result<HashMap<String, OwnedValue>>;

    #[zbus(property)]
    fn volume(&self) -> zbus::Result<f64>;

    #[zbus(property)]
    fn set_volume(&self, volume: f64) -> zbus::Result<()>;

    #[zbus(property)]
    fn shuffle(&self) -> zbus::Result<bool>;

    #[zbus(property)]
    fn set_shuffle(&self, shuffle: bool) -> zbus::Result<()>;

    #[zbus(property)]
    fn loop_status(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn set_loop_status(&self, status: &str) -> zbus::Result<()>;

    #[zbus(property)]
    fn position(&self) -> zbus::Result<i64>;
}

pub struct MprisClient {
    connection: RwLock<Option<Connection>>,
    player: RwLock<Option<PlayerProxy<'static>>>,
}

impl Default for MprisClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MprisClient {
    pub fn new() -> Self {
        Self {
            connection: RwLock::new(None),
            player: RwLock::new(None),
        }
    }

    async fn discover_player(conn: &Connection) -> Result<BusName<'static>, ControlError> {
        let dbus = zbus::fdo::DBusProxy::new(conn).await?;
        let names = dbus.list_names().await?;

        // Only the daemon's own names qualify; falling back to some other
        // media player on the bus would control the wrong thing.
        for name in names.iter() {
            if MPRIS_BUS_PREFIXES
                .iter()
                .any(|prefix| name.as_str().starts_with(prefix))
            {
                debug!("found player service {}", name.as_str());
                return Ok(name.to_owned().into());
            }
        }
        Err(ControlError::PlayerNotFound)
    }

    async fn proxy(&self) -> Result<PlayerProxy<'static>, ControlError> {
        self.player
            .read()
            .await
            .clone()
            .ok_or(ControlError::NotConnected)
    }
}

#[async_trait]
impl PlayerControl for MprisClient {
    async fn connect(&self) -> Result<(), ControlError> {
        let conn = Connection::session().await?;
        let service = Self::discover_player(&conn).await?;
        let player = PlayerProxy::builder(&conn)
            .destination(service)?
            .build()
            .await?;

        *self.connection.write().await = Some(conn);
        *self.player.write().await = Some(player);
        info!("connected to daemon control interface");
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.player.read().await.is_some()
    }

    async fn ensure_connection(&self) -> Result<(), ControlError> {
        if let Some(player) = self.player.read().await.clone() {
            // A cached proxy can outlive the daemon; one cheap property
            // read tells us whether it still answers.
            if player.playback_status().await.is_ok() {
                return Ok(());
            }
            debug!("cached control connection is stale, reconnecting");
        }
        *self.player.write().await = None;
        *self.connection.write().await = None;
        self.connect().await
    }

    async fn play_pause(&self) -> Result<(), ControlError> {
        Ok(self.proxy().await?.play_pause().await?)
    }

    async fn play_uri(&self, uri: &str) -> Result<(), ControlError> {
        Ok(self.proxy().await?.open_uri(uri).await?)
    }

    async fn next(&self) -> Result<(), ControlError> {
        Ok(self.proxy().await?.next().await?)
    }

    async fn previous(&self) -> Result<(), ControlError> {
        Ok(self.proxy().await?.previous().await?)
    }

    async fn seek(&self, delta_ms: i64) -> Result<(), ControlError> {
        // Wire offset is in microseconds.
        Ok(self.proxy().await?.seek(delta_ms * 1000).await?)
    }

    async fn set_volume(&self, volume: f64) -> Result<(), ControlError> {
        Ok(self.proxy().await?.set_volume(volume.clamp(0.0, 1.0)).await?)
    }

    async fn set_shuffle(&self, shuffle: bool) -> Result<(), ControlError> {
        Ok(self.proxy().await?.set_shuffle(shuffle).await?)
    }

    async fn set_repeat(&self, repeat: RepeatMode) -> Result<(), ControlError> {
        Ok(self
            .proxy()
            .await?
            .set_loop_status(repeat.as_loop_status())
            .await?)
    }

    async fn get_state(&self) -> Result<PlaybackState, ControlError> {
        let player = self.proxy().await?;

        // Status failing means the connection is gone; the remaining
        // properties are best-effort because some daemon builds omit them.
        let status = player.playback_status().await?;
        let metadata = player.metadata().await.unwrap_or_default();
        let volume = player.volume().await.unwrap_or(1.0);
        let shuffle = player.shuffle().await.unwrap_or(false);
        let loop_status = player.loop_status().await.unwrap_or_default();
        let position_us = player.position().await.unwrap_or(0);

        Ok(PlaybackState {
            is_playing: status == "Playing",
            position_ms: position_us / 1000,
            duration_ms: track_length_us(&metadata).unwrap_or(0) / 1000,
            volume,
            shuffle,
            repeat: RepeatMode::from_loop_status(&loop_status),
            track: parse_track(&metadata),
        })
    }
}

/// The MPRIS metadata map is string-keyed variants: plain strings for most
/// `xesam:` keys, a string list for artists, an object path for the track
/// id and an i64 for the length.  A missing title means no track loaded.
fn parse_track(metadata: &HashMap<String, OwnedValue>) -> Option<TrackInfo> {
    Some(TrackInfo {
        title: string_field(metadata, "xesam:title")?,
        artist: first_artist(metadata).unwrap_or_default(),
        album: string_field(metadata, "xesam:album").unwrap_or_default(),
        art_url: string_field(metadata, "mpris:artUrl"),
        uri: track_id(metadata).unwrap_or_default(),
    })
}

fn string_field(metadata: &HashMap<String, OwnedValue>, key: &str) -> Option<String> {
    let value = metadata.get(key)?.downcast_ref::<Str>().ok()?;
    Some(value.to_string())
}

fn first_artist(metadata: &HashMap<String, OwnedValue>) -> Option<String> {
    let list = metadata.get("xesam:artist")?.downcast_ref::<Array>().ok()?;
    let first = list.iter().next()?;
    Some(first.downcast_ref::<Str>().ok()?.to_string())
}

fn track_id(metadata: &HashMap<String, OwnedValue>) -> Option<String> {
    let path = metadata.get("mpris:trackid")?.downcast_ref::<ObjectPath>().ok()?;
    Some(path.to_string())
}

fn track_length_us(metadata: &HashMap<String, OwnedValue>) -> Option<i64> {
    metadata.get("mpris:length")?.downcast_ref::<i64>().ok()
}

// ── legacy backend ────────────────────────────────────────────────────────────

/// Shells out to `playerctl -p spotifyd` per command.  Slower and coarser
/// than the native client, but works where zbus cannot reach the session
/// bus (odd display-manager setups, some containers).
pub struct PlayerctlClient {
    binary: PathBuf,
}

impl PlayerctlClient {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    async fn run(&self, args: &[&str]) -> Result<String, ControlError> {
        let output = tokio::time::timeout(
            PLAYERCTL_TIMEOUT,
            tokio::process::Command::new(&self.binary)
                .arg("-p")
                .arg(platform::DAEMON_PROCESS_NAME)
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| ControlError::Timeout(PLAYERCTL_TIMEOUT))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // playerctl reports a missing player on stderr with a nonzero
            // exit, which for us means "not connected".
            if stderr.contains("No players found") || stderr.contains("not found") {
                return Err(ControlError::PlayerNotFound);
            }
            return Err(ControlError::CommandRejected(stderr.trim().to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn metadata_field(&self, key: &str) -> Option<String> {
        self.run(&["metadata", key]).await.ok().filter(|s| !s.is_empty())
    }
}

#[async_trait]
impl PlayerControl for PlayerctlClient {
    async fn connect(&self) -> Result<(), ControlError> {
        // Stateless backend: connecting is just probing that the player
        // answers at all.
        self.run(&["status"]).await.map(|_| ())
    }

    async fn is_connected(&self) -> bool {
        self.run(&["status"]).await.is_ok()
    }

    async fn ensure_connection(&self) -> Result<(), ControlError> {
        self.connect().await
    }

    async fn play_pause(&self) -> Result<(), ControlError> {
        self.run(&["play-pause"]).await.map(|_| ())
    }

    async fn play_uri(&self, uri: &str) -> Result<(), ControlError> {
        self.run(&["open", uri]).await.map(|_| ())
    }

    async fn next(&self) -> Result<(), ControlError> {
        self.run(&["next"]).await.map(|_| ())
    }

    async fn previous(&self) -> Result<(), ControlError> {
        self.run(&["previous"]).await.map(|_| ())
    }

    async fn seek(&self, delta_ms: i64) -> Result<(), ControlError> {
        // playerctl takes relative offsets in seconds with a +/- suffix.
        let seconds = (delta_ms.abs() as f64) / 1000.0;
        let arg = if delta_ms >= 0 {
            format!("{seconds}+")
        } else {
            format!("{seconds}-")
        };
        self.run(&["position", &arg]).await.map(|_| ())
    }

    async fn set_volume(&self, volume: f64) -> Result<(), ControlError> {
        let arg = format!("{:.2}", volume.clamp(0.0, 1.0));
        self.run(&["volume", &arg]).await.map(|_| ())
    }

    async fn set_shuffle(&self, shuffle: bool) -> Result<(), ControlError> {
        let arg = if shuffle { "On" } else { "Off" };
        self.run(&["shuffle", arg]).await.map(|_| ())
    }

    async fn set_repeat(&self, repeat: RepeatMode) -> Result<(), ControlError> {
        self.run(&["loop", repeat.as_loop_status()]).await.map(|_| ())
    }

    async fn get_state(&self) -> Result<PlaybackState, ControlError> {
        let status = self.run(&["status"]).await?;

        let position_ms = self
            .run(&["position"])
            .await
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .map(|secs| (secs * 1000.0) as i64)
            .unwrap_or(0);
        let volume = self
            .run(&["volume"])
            .await
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(1.0);
        let shuffle = matches!(
            self.run(&["shuffle"]).await.as_deref(),
            Ok("On") | Ok("on")
        );
        let repeat = self
            .run(&["loop"])
            .await
            .map(|s| RepeatMode::from_loop_status(&s))
            .unwrap_or_default();

        let title = self.metadata_field("xesam:title").await;
        let track = match title {
            Some(title) => Some(TrackInfo {
                title,
                artist: self.metadata_field("xesam:artist").await.unwrap_or_default(),
                album: self.metadata_field("xesam:album").await.unwrap_or_default(),
                art_url: self.metadata_field("mpris:artUrl").await,
                uri: self.metadata_field("mpris:trackid").await.unwrap_or_default(),
            }),
            None => None,
        };
        let duration_ms = self
            .metadata_field("mpris:length")
            .await
            .and_then(|s| s.parse::<i64>().ok())
            .map(|us| us / 1000)
            .unwrap_or(0);

        Ok(PlaybackState {
            is_playing: status == "Playing",
            position_ms,
            duration_ms,
            volume,
            shuffle,
            repeat,
            track,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeat_mode_cycles_through_all_three() {
        let mut mode = RepeatMode::None;
        mode = mode.cycle();
        assert_eq!(mode, RepeatMode::Playlist);
        mode = mode.cycle();
        assert_eq!(mode, RepeatMode::Track);
        mode = mode.cycle();
        assert_eq!(mode, RepeatMode::None);
    }

    #[test]
    fn loop_status_parsing_is_lenient() {
        assert_eq!(RepeatMode::from_loop_status("Playlist"), RepeatMode::Playlist);
        assert_eq!(RepeatMode::from_loop_status("Track"), RepeatMode::Track);
        assert_eq!(RepeatMode::from_loop_status("None"), RepeatMode::None);
        assert_eq!(RepeatMode::from_loop_status("garbage"), RepeatMode::None);
    }

    #[test]
    fn track_parse_requires_a_title() {
        let mut metadata: HashMap<String, OwnedValue> = HashMap::new();
        assert!(parse_track(&metadata).is_none());

        let title = zbus::zvariant::Value::from("Bird Song")
            .try_to_owned()
            .unwrap();
        metadata.insert("xesam:title".into(), title);
        let track = parse_track(&metadata).unwrap();
        assert_eq!(track.title, "Bird Song");
        assert!(track.artist.is_empty());
        assert!(track.art_url.is_none());
    }

    #[test]
    fn length_converts_microseconds() {
        let mut metadata: HashMap<String, OwnedValue> = HashMap::new();
        metadata.insert(
            "mpris:length".into(),
            zbus::zvariant::Value::from(183_000_000_i64).try_to_owned().unwrap(),
        );
        assert_eq!(track_length_us(&metadata), Some(183_000_000));
    }
}
