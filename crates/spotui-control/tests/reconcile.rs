//! Reconciler and reconnect behaviour against a scripted in-memory player.
//! All tests run under paused time; sleeps auto-advance the clock, so the
//! cooldown and backoff schedules are checked exactly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use spotui_control::mpris::{PlaybackState, PlayerControl, RepeatMode, TrackInfo};
use spotui_control::reconciler::{Notice, QueueEntry, Reconciler};
use spotui_control::{Config, ConnectionStatus, ConnectionSupervisor, ControlError};
use spotui_control::{Installer, ProcessSupervisor};

#[derive(Default)]
struct MockPlayer {
    state: Mutex<PlaybackState>,
    fail_commands: AtomicBool,
    fail_connect: AtomicBool,
    commands: Mutex<Vec<String>>,
    connect_attempts: Mutex<Vec<Instant>>,
}

impl MockPlayer {
    fn with_state(state: PlaybackState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            ..Default::default()
        })
    }

    async fn commands(&self) -> Vec<String> {
        self.commands.lock().await.clone()
    }

    async fn record(&self, command: String) -> Result<(), ControlError> {
        if self.fail_commands.load(Ordering::SeqCst) {
            return Err(ControlError::CommandRejected("scripted failure".into()));
        }
        self.commands.lock().await.push(command);
        Ok(())
    }
}

#[async_trait]
impl PlayerControl for MockPlayer {
    async fn connect(&self) -> Result<(), ControlError> {
        self.connect_attempts.lock().await.push(Instant::now());
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(ControlError::PlayerNotFound);
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        !self.fail_connect.load(Ordering::SeqCst)
    }

    async fn ensure_connection(&self) -> Result<(), ControlError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(ControlError::PlayerNotFound);
        }
        Ok(())
    }

    async fn play_pause(&self) -> Result<(), ControlError> {
        self.record("play_pause".into()).await
    }

    async fn play_uri(&self, uri: &str) -> Result<(), ControlError> {
        self.record(format!("play_uri {uri}")).await
    }

    async fn next(&self) -> Result<(), ControlError> {
        self.record("next".into()).await
    }

    async fn previous(&self) -> Result<(), ControlError> {
        self.record("previous".into()).await
    }

    async fn seek(&self, delta_ms: i64) -> Result<(), ControlError> {
        self.record(format!("seek {delta_ms}")).await
    }

    async fn set_volume(&self, volume: f64) -> Result<(), ControlError> {
        self.record(format!("volume {volume:.2}")).await
    }

    async fn set_shuffle(&self, shuffle: bool) -> Result<(), ControlError> {
        self.record(format!("shuffle {shuffle}")).await
    }

    async fn set_repeat(&self, repeat: RepeatMode) -> Result<(), ControlError> {
        self.record(format!("repeat {repeat:?}")).await
    }

    async fn get_state(&self) -> Result<PlaybackState, ControlError> {
        Ok(self.state.lock().await.clone())
    }
}

fn playing_track(position_ms: i64, duration_ms: i64) -> PlaybackState {
    PlaybackState {
        is_playing: true,
        position_ms,
        duration_ms,
        volume: 1.0,
        track: Some(TrackInfo {
            title: "Current".into(),
            artist: "Artist".into(),
            album: "Album".into(),
            art_url: None,
            uri: "spotify:track:current".into(),
        }),
        ..Default::default()
    }
}

fn reconciler_for(client: Arc<MockPlayer>) -> Reconciler {
    Reconciler::new(client, Config::default().tuning, CancellationToken::new())
}

// Let spawned command tasks run; a 1ms sleep yields and advances time.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn overlay_wins_until_cooldown_expires() {
    let client = MockPlayer::with_state(playing_track(10_000, 180_000));
    let reconciler = reconciler_for(Arc::clone(&client));

    // Seed merged state from the daemon.
    reconciler.poll_tick().await;
    assert!(reconciler.state().await.is_playing);

    // Pause optimistically; the daemon still says Playing.
    reconciler.play_pause().await;
    settle().await;
    assert_eq!(client.commands().await, vec!["play_pause"]);

    // A poll inside the cooldown keeps the optimistic value.
    tokio::time::sleep(Duration::from_millis(500)).await;
    reconciler.poll_tick().await;
    assert!(!reconciler.state().await.is_playing);

    // After the cooldown the daemon-reported value wins again.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    reconciler.poll_tick().await;
    assert!(reconciler.state().await.is_playing);
}

#[tokio::test(start_paused = true)]
async fn rapid_repeats_collapse_to_one_command() {
    let client = MockPlayer::with_state(playing_track(10_000, 180_000));
    let reconciler = reconciler_for(Arc::clone(&client));
    reconciler.poll_tick().await;

    reconciler.play_pause().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    reconciler.play_pause().await;
    settle().await;

    // Second press landed inside the debounce window: dropped, and the
    // merged state still reflects exactly one toggle.
    assert_eq!(client.commands().await.len(), 1);
    assert!(!reconciler.state().await.is_playing);

    tokio::time::sleep(Duration::from_millis(200)).await;
    reconciler.play_pause().await;
    settle().await;
    assert_eq!(client.commands().await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn queue_continuation_fires_exactly_once() {
    let client = MockPlayer::with_state(playing_track(178_500, 180_000));
    let reconciler = reconciler_for(Arc::clone(&client));
    reconciler
        .queue_push(QueueEntry {
            uri: "spotify:track:queued".into(),
            title: Some("Queued".into()),
            artist: None,
        })
        .await;

    reconciler.poll_tick().await;
    assert_eq!(client.commands().await, vec!["play_uri spotify:track:queued"]);

    // Another poll in the same end window must not re-fire.
    reconciler.poll_tick().await;
    assert_eq!(client.commands().await.len(), 1);
    assert!(reconciler.queue_snapshot().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn track_repeat_suppresses_continuation() {
    let mut state = playing_track(178_500, 180_000);
    state.repeat = RepeatMode::Track;
    let client = MockPlayer::with_state(state);
    let reconciler = reconciler_for(Arc::clone(&client));
    reconciler
        .queue_push(QueueEntry {
            uri: "spotify:track:queued".into(),
            title: None,
            artist: None,
        })
        .await;

    reconciler.poll_tick().await;
    assert!(client.commands().await.is_empty());
    assert_eq!(reconciler.queue_snapshot().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_command_rolls_back_and_notifies() {
    let client = MockPlayer::with_state(playing_track(10_000, 180_000));
    let reconciler = reconciler_for(Arc::clone(&client));
    let mut notices = reconciler.subscribe_notices();

    reconciler.poll_tick().await;
    client.fail_commands.store(true, Ordering::SeqCst);

    reconciler.play_pause().await;
    // Optimistic flip is visible immediately...
    assert!(!reconciler.state().await.is_playing);
    settle().await;

    // ...and rolled back once the command comes back rejected.
    assert!(reconciler.state().await.is_playing);
    match notices.try_recv().unwrap() {
        Notice::CommandFailed { message, .. } => {
            assert!(message.contains("scripted failure"));
        }
    }
}

#[tokio::test(start_paused = true)]
async fn repeat_cycle_rolls_back_to_the_previous_mode() {
    let client = MockPlayer::with_state(playing_track(10_000, 180_000));
    let reconciler = reconciler_for(Arc::clone(&client));
    reconciler.poll_tick().await;
    client.fail_commands.store(true, Ordering::SeqCst);

    reconciler.cycle_repeat().await;
    assert_eq!(reconciler.state().await.repeat, RepeatMode::Playlist);
    settle().await;

    // The rejected command restored the pre-cycle mode.
    assert_eq!(reconciler.state().await.repeat, RepeatMode::None);
}

#[tokio::test(start_paused = true)]
async fn reconnect_walks_the_backoff_schedule() {
    let client = MockPlayer::with_state(PlaybackState::default());
    client.fail_connect.store(true, Ordering::SeqCst);

    let config = Config::default();
    let dir = tempfile::tempdir().unwrap();
    let installer = Arc::new(Installer::at_paths(
        &config,
        dir.path().join("spotifyd"),
        false,
        dir.path().join("spotifyd.verified.json"),
        dir.path().join("install.lock"),
    ));
    let supervisor = Arc::new(ProcessSupervisor::new("spotui".into()));
    let connection = ConnectionSupervisor::new(
        installer,
        supervisor,
        Arc::clone(&client) as Arc<dyn PlayerControl>,
        &config,
        CancellationToken::new(),
    );

    let connected = connection.connect_with_backoff().await;
    assert!(!connected);
    assert_eq!(connection.status(), ConnectionStatus::Disconnected);

    // One immediate attempt plus one per configured delay, spaced exactly
    // by the schedule.
    let attempts = client.connect_attempts.lock().await.clone();
    assert_eq!(
        attempts.len(),
        config.tuning.reconnect_delays_ms.len() + 1
    );
    let gaps: Vec<u64> = attempts
        .windows(2)
        .map(|w| w[1].duration_since(w[0]).as_millis() as u64)
        .collect();
    assert_eq!(gaps, config.tuning.reconnect_delays_ms);
}

#[tokio::test(start_paused = true)]
async fn link_drop_mid_session_triggers_reconnect() {
    let client = MockPlayer::with_state(playing_track(10_000, 180_000));
    let config = Config::default();
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let installer = Arc::new(Installer::at_paths(
        &config,
        dir.path().join("spotifyd"),
        false,
        dir.path().join("spotifyd.verified.json"),
        dir.path().join("install.lock"),
    ));
    let supervisor = Arc::new(ProcessSupervisor::new("spotui".into()));
    let connection = Arc::new(ConnectionSupervisor::new(
        installer,
        supervisor,
        Arc::clone(&client) as Arc<dyn PlayerControl>,
        &config,
        cancel.clone(),
    ));
    let reconciler = Reconciler::new(
        Arc::clone(&client) as Arc<dyn PlayerControl>,
        config.tuning.clone(),
        cancel.clone(),
    );

    assert!(connection.connect_with_backoff().await);
    assert_eq!(connection.status(), ConnectionStatus::Connected);

    let watcher = {
        let connection = Arc::clone(&connection);
        let link = reconciler.subscribe_link();
        tokio::spawn(async move { connection.supervise_link(link).await })
    };
    client.connect_attempts.lock().await.clear();

    // The daemon falls off the bus mid-session: the next poll notices, and
    // the watcher re-runs the whole backoff schedule without success.
    client.fail_connect.store(true, Ordering::SeqCst);
    reconciler.poll_tick().await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(connection.status(), ConnectionStatus::Disconnected);
    assert_eq!(
        client.connect_attempts.lock().await.len(),
        config.tuning.reconnect_delays_ms.len() + 1
    );

    // The daemon comes back; the poll loop reports a healthy link and the
    // watcher records the recovery.
    client.fail_connect.store(false, Ordering::SeqCst);
    reconciler.poll_tick().await;
    settle().await;
    assert_eq!(connection.status(), ConnectionStatus::Connected);

    cancel.cancel();
    let _ = watcher.await;
}
