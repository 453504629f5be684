//! State reconciler: merges daemon-reported playback state with
//! short-lived optimistic overlays so the UI reflects a user action
//! immediately, survives the daemon's settling lag, and converges on
//! daemon truth once each overlay's cooldown expires.
//!
//! Also owns the client-side play queue: the daemon has no queue of its
//! own, so near the end of a track the reconciler issues the next queued
//! URI itself, exactly once per track.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TuningConfig;
use crate::mpris::{PlaybackState, PlayerControl, RepeatMode};

// ── actions & notices ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    PlayPause,
    Next,
    Previous,
    Seek,
    Volume,
    Shuffle,
    Repeat,
    PlayUri,
}

/// Out-of-band events for the UI, separate from the state stream.
#[derive(Debug, Clone)]
pub enum Notice {
    CommandFailed { action: ActionKind, message: String },
}

// ── optimistic overlays ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Overlay<T> {
    value: T,
    expires_at: Instant,
}

impl<T: Copy> Overlay<T> {
    fn live(&self, now: Instant) -> Option<T> {
        (now < self.expires_at).then_some(self.value)
    }
}

/// One overlay slot per togglable field.  While a slot is live its value
/// wins over whatever the daemon reports; after expiry the daemon wins.
#[derive(Debug, Default)]
pub(crate) struct Overlays {
    is_playing: Option<Overlay<bool>>,
    shuffle: Option<Overlay<bool>>,
    repeat: Option<Overlay<RepeatMode>>,
}

impl Overlays {
    fn set_is_playing(&mut self, value: bool, expires_at: Instant) {
        self.is_playing = Some(Overlay { value, expires_at });
    }

    fn set_shuffle(&mut self, value: bool, expires_at: Instant) {
        self.shuffle = Some(Overlay { value, expires_at });
    }

    fn set_repeat(&mut self, value: RepeatMode, expires_at: Instant) {
        self.repeat = Some(Overlay { value, expires_at });
    }

    fn clear_is_playing(&mut self) {
        self.is_playing = None;
    }

    fn clear_shuffle(&mut self) {
        self.shuffle = None;
    }

    fn clear_repeat(&mut self) {
        self.repeat = None;
    }

    fn merge(&mut self, mut reported: PlaybackState, now: Instant) -> PlaybackState {
        if let Some(overlay) = self.is_playing {
            match overlay.live(now) {
                Some(value) => reported.is_playing = value,
                None => self.is_playing = None,
            }
        }
        if let Some(overlay) = self.shuffle {
            match overlay.live(now) {
                Some(value) => reported.shuffle = value,
                None => self.shuffle = None,
            }
        }
        if let Some(overlay) = self.repeat {
            match overlay.live(now) {
                Some(value) => reported.repeat = value,
                None => self.repeat = None,
            }
        }
        reported
    }
}

// ── debounce ──────────────────────────────────────────────────────────────────

/// Per-action rate limit: a repeat of the same action inside the window is
/// dropped entirely, it never reaches the daemon.
#[derive(Debug)]
pub(crate) struct Debouncer {
    last: HashMap<ActionKind, Instant>,
    window: Duration,
}

impl Debouncer {
    fn new(window: Duration) -> Self {
        Self {
            last: HashMap::new(),
            window,
        }
    }

    fn should_drop(&mut self, kind: ActionKind, now: Instant) -> bool {
        if let Some(prev) = self.last.get(&kind) {
            if now.duration_since(*prev) < self.window {
                return true;
            }
        }
        self.last.insert(kind, now);
        false
    }
}

// ── play queue ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub uri: String,
    pub title: Option<String>,
    pub artist: Option<String>,
}

/// Client-side queue.  `end_handled` latches once a continuation fires and
/// resets when the reported track changes, so one track end produces at
/// most one play command no matter how many polls land in the window.
#[derive(Debug, Default)]
pub(crate) struct PlayQueue {
    entries: VecDeque<QueueEntry>,
    last_track_uri: Option<String>,
    end_handled: bool,
}

impl PlayQueue {
    fn push(&mut self, entry: QueueEntry) {
        self.entries.push_back(entry);
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn snapshot(&self) -> Vec<QueueEntry> {
        self.entries.iter().cloned().collect()
    }

    fn observe_track(&mut self, uri: Option<&str>) {
        if self.last_track_uri.as_deref() != uri {
            self.last_track_uri = uri.map(str::to_owned);
            self.end_handled = false;
            // The new track may be our own queue head arriving (continuation
            // landed, or the user jumped there); consume it so it does not
            // play twice.
            if let (Some(uri), Some(head)) = (uri, self.entries.front()) {
                if head.uri == uri {
                    self.entries.pop_front();
                }
            }
        }
    }

    fn continuation(&mut self, state: &PlaybackState, threshold_ms: i64) -> Option<QueueEntry> {
        if self.entries.is_empty() || self.end_handled || !state.is_playing {
            return None;
        }
        // Track repeat means the daemon restarts the same track itself.
        if state.repeat == RepeatMode::Track {
            return None;
        }
        if state.duration_ms <= 0 {
            return None;
        }
        let remaining = state.duration_ms - state.position_ms;
        if remaining <= 0 || remaining >= threshold_ms {
            return None;
        }
        self.end_handled = true;
        self.entries.pop_front()
    }
}

// ── reconciler ────────────────────────────────────────────────────────────────

struct Inner {
    overlays: Overlays,
    debounce: Debouncer,
    queue: PlayQueue,
    last_merged: PlaybackState,
}

pub struct Reconciler {
    client: Arc<dyn PlayerControl>,
    inner: Arc<Mutex<Inner>>,
    state_tx: broadcast::Sender<PlaybackState>,
    notice_tx: broadcast::Sender<Notice>,
    link_tx: watch::Sender<bool>,
    cancel: CancellationToken,
    tuning: TuningConfig,
}

impl Reconciler {
    pub fn new(
        client: Arc<dyn PlayerControl>,
        tuning: TuningConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (state_tx, _) = broadcast::channel(16);
        let (notice_tx, _) = broadcast::channel(16);
        let (link_tx, _) = watch::channel(true);
        Self {
            client,
            inner: Arc::new(Mutex::new(Inner {
                overlays: Overlays::default(),
                debounce: Debouncer::new(Duration::from_millis(tuning.debounce_ms)),
                queue: PlayQueue::default(),
                last_merged: PlaybackState::default(),
            })),
            state_tx,
            notice_tx,
            link_tx,
            cancel,
            tuning,
        }
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<PlaybackState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notice_tx.subscribe()
    }

    /// Link health as observed by the poll loop.  `false` after a tick that
    /// could not reach the daemon; flips back once a tick succeeds.  The
    /// connection supervisor drives reconnection off this channel.
    pub fn subscribe_link(&self) -> watch::Receiver<bool> {
        self.link_tx.subscribe()
    }

    pub async fn state(&self) -> PlaybackState {
        self.inner.lock().await.last_merged.clone()
    }

    fn cooldown(&self) -> Duration {
        Duration::from_millis(self.tuning.cooldown_ms)
    }

    /// Poll loop.  Runs until the cancellation token fires.
    pub async fn run(&self) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.tuning.poll_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("reconciler loop cancelled");
                    break;
                }
                _ = ticker.tick() => self.poll_tick().await,
            }
        }
    }

    /// One reconcile pass: fetch daemon state, merge overlays, publish on
    /// change, and fire a queue continuation if a track is ending.
    pub async fn poll_tick(&self) {
        if let Err(e) = self.client.ensure_connection().await {
            debug!("reconcile skipped, not connected: {}", e);
            self.link_tx.send_replace(false);
            return;
        }
        let reported = match self.client.get_state().await {
            Ok(state) => state,
            Err(e) => {
                debug!("reconcile skipped, state read failed: {}", e);
                self.link_tx.send_replace(false);
                return;
            }
        };
        self.link_tx.send_replace(true);

        let now = Instant::now();
        let continuation = {
            let mut inner = self.inner.lock().await;
            inner
                .queue
                .observe_track(reported.track.as_ref().map(|t| t.uri.as_str()));
            let merged = inner.overlays.merge(reported, now);
            let continuation = inner
                .queue
                .continuation(&merged, self.tuning.track_end_threshold_ms);
            if merged != inner.last_merged {
                inner.last_merged = merged.clone();
                let _ = self.state_tx.send(merged);
            }
            continuation
        };

        if let Some(entry) = continuation {
            info!("advancing queue to {}", entry.uri);
            if let Err(e) = self.client.play_uri(&entry.uri).await {
                warn!("queue continuation failed: {}", e);
                let _ = self.notice_tx.send(Notice::CommandFailed {
                    action: ActionKind::PlayUri,
                    message: e.to_string(),
                });
            }
        }
    }

    // ── queue management ──────────────────────────────────────────────────────

    pub async fn queue_push(&self, entry: QueueEntry) {
        self.inner.lock().await.queue.push(entry);
    }

    pub async fn queue_clear(&self) {
        self.inner.lock().await.queue.clear();
    }

    pub async fn queue_snapshot(&self) -> Vec<QueueEntry> {
        self.inner.lock().await.queue.snapshot()
    }

    // ── user actions ──────────────────────────────────────────────────────────

    /// Toggle playback.  The flip shows immediately as an overlay; the
    /// daemon command runs in the background and the overlay is rolled
    /// back (with a notice) if it fails.
    pub async fn play_pause(&self) {
        let now = Instant::now();
        let target = {
            let mut inner = self.inner.lock().await;
            if inner.debounce.should_drop(ActionKind::PlayPause, now) {
                return;
            }
            let target = !inner.last_merged.is_playing;
            inner.overlays.set_is_playing(target, now + self.cooldown());
            inner.last_merged.is_playing = target;
            let _ = self.state_tx.send(inner.last_merged.clone());
            target
        };

        let client = Arc::clone(&self.client);
        let inner = Arc::clone(&self.inner);
        let state_tx = self.state_tx.clone();
        let notice_tx = self.notice_tx.clone();
        self.spawn_cancellable(async move {
            if let Err(e) = client.play_pause().await {
                warn!("play/pause failed: {}", e);
                let mut inner = inner.lock().await;
                inner.overlays.clear_is_playing();
                inner.last_merged.is_playing = !target;
                let _ = state_tx.send(inner.last_merged.clone());
                let _ = notice_tx.send(Notice::CommandFailed {
                    action: ActionKind::PlayPause,
                    message: e.to_string(),
                });
            }
        });
    }

    pub async fn next_track(&self) {
        self.fire_simple(ActionKind::Next, |client| async move {
            client.next().await
        })
        .await;
    }

    pub async fn previous_track(&self) {
        self.fire_simple(ActionKind::Previous, |client| async move {
            client.previous().await
        })
        .await;
    }

    /// Relative seek.  The position jump is applied to the merged state
    /// right away; the next poll replaces it with daemon truth.
    pub async fn seek(&self, delta_ms: i64) {
        let now = Instant::now();
        {
            let mut inner = self.inner.lock().await;
            if inner.debounce.should_drop(ActionKind::Seek, now) {
                return;
            }
            let duration = inner.last_merged.duration_ms;
            let moved = (inner.last_merged.position_ms + delta_ms).max(0);
            inner.last_merged.position_ms = if duration > 0 {
                moved.min(duration)
            } else {
                moved
            };
            let _ = self.state_tx.send(inner.last_merged.clone());
        }

        let client = Arc::clone(&self.client);
        let notice_tx = self.notice_tx.clone();
        self.spawn_cancellable(async move {
            if let Err(e) = client.seek(delta_ms).await {
                warn!("seek failed: {}", e);
                let _ = notice_tx.send(Notice::CommandFailed {
                    action: ActionKind::Seek,
                    message: e.to_string(),
                });
            }
        });
    }

    pub async fn set_volume(&self, volume: f64) {
        let volume = volume.clamp(0.0, 1.0);
        let now = Instant::now();
        {
            let mut inner = self.inner.lock().await;
            if inner.debounce.should_drop(ActionKind::Volume, now) {
                return;
            }
            inner.last_merged.volume = volume;
            let _ = self.state_tx.send(inner.last_merged.clone());
        }

        let client = Arc::clone(&self.client);
        let notice_tx = self.notice_tx.clone();
        self.spawn_cancellable(async move {
            if let Err(e) = client.set_volume(volume).await {
                warn!("volume change failed: {}", e);
                let _ = notice_tx.send(Notice::CommandFailed {
                    action: ActionKind::Volume,
                    message: e.to_string(),
                });
            }
        });
    }

    pub async fn toggle_shuffle(&self) {
        let now = Instant::now();
        let (current, target) = {
            let mut inner = self.inner.lock().await;
            if inner.debounce.should_drop(ActionKind::Shuffle, now) {
                return;
            }
            let current = inner.last_merged.shuffle;
            let target = !current;
            inner.overlays.set_shuffle(target, now + self.cooldown());
            inner.last_merged.shuffle = target;
            let _ = self.state_tx.send(inner.last_merged.clone());
            (current, target)
        };

        let client = Arc::clone(&self.client);
        let inner = Arc::clone(&self.inner);
        let state_tx = self.state_tx.clone();
        let notice_tx = self.notice_tx.clone();
        self.spawn_cancellable(async move {
            if let Err(e) = client.toggle_shuffle(Some(current)).await {
                warn!("shuffle toggle failed: {}", e);
                let mut inner = inner.lock().await;
                inner.overlays.clear_shuffle();
                inner.last_merged.shuffle = !target;
                let _ = state_tx.send(inner.last_merged.clone());
                let _ = notice_tx.send(Notice::CommandFailed {
                    action: ActionKind::Shuffle,
                    message: e.to_string(),
                });
            }
        });
    }

    pub async fn cycle_repeat(&self) {
        let now = Instant::now();
        let current = {
            let mut inner = self.inner.lock().await;
            if inner.debounce.should_drop(ActionKind::Repeat, now) {
                return;
            }
            let current = inner.last_merged.repeat;
            let target = current.cycle();
            inner.overlays.set_repeat(target, now + self.cooldown());
            inner.last_merged.repeat = target;
            let _ = self.state_tx.send(inner.last_merged.clone());
            current
        };

        let client = Arc::clone(&self.client);
        let inner = Arc::clone(&self.inner);
        let state_tx = self.state_tx.clone();
        let notice_tx = self.notice_tx.clone();
        self.spawn_cancellable(async move {
            if let Err(e) = client.cycle_repeat(Some(current)).await {
                warn!("repeat cycle failed: {}", e);
                let mut inner = inner.lock().await;
                inner.overlays.clear_repeat();
                inner.last_merged.repeat = current;
                let _ = state_tx.send(inner.last_merged.clone());
                let _ = notice_tx.send(Notice::CommandFailed {
                    action: ActionKind::Repeat,
                    message: e.to_string(),
                });
            }
        });
    }

    /// Start playing a specific URI, jumping the queue.
    pub async fn play_uri(&self, uri: String) {
        let now = Instant::now();
        {
            let mut inner = self.inner.lock().await;
            if inner.debounce.should_drop(ActionKind::PlayUri, now) {
                return;
            }
            inner.overlays.set_is_playing(true, now + self.cooldown());
            inner.last_merged.is_playing = true;
            let _ = self.state_tx.send(inner.last_merged.clone());
        }

        let client = Arc::clone(&self.client);
        let notice_tx = self.notice_tx.clone();
        self.spawn_cancellable(async move {
            if let Err(e) = client.play_uri(&uri).await {
                warn!("play {} failed: {}", uri, e);
                let _ = notice_tx.send(Notice::CommandFailed {
                    action: ActionKind::PlayUri,
                    message: e.to_string(),
                });
            }
        });
    }

    /// Commands with no optimistic state: debounce, fire, report failure.
    async fn fire_simple<F, Fut>(&self, kind: ActionKind, command: F)
    where
        F: FnOnce(Arc<dyn PlayerControl>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), crate::error::ControlError>> + Send,
    {
        {
            let mut inner = self.inner.lock().await;
            if inner.debounce.should_drop(kind, Instant::now()) {
                return;
            }
        }
        let client = Arc::clone(&self.client);
        let notice_tx = self.notice_tx.clone();
        self.spawn_cancellable(async move {
            if let Err(e) = command(client).await {
                warn!("{:?} failed: {}", kind, e);
                let _ = notice_tx.send(Notice::CommandFailed {
                    action: kind,
                    message: e.to_string(),
                });
            }
        });
    }

    fn spawn_cancellable<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = fut => {}
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playing(position_ms: i64, duration_ms: i64) -> PlaybackState {
        PlaybackState {
            is_playing: true,
            position_ms,
            duration_ms,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn overlay_wins_until_expiry() {
        let mut overlays = Overlays::default();
        let now = Instant::now();
        overlays.set_is_playing(false, now + Duration::from_millis(1500));

        let reported = playing(0, 180_000);
        let merged = overlays.merge(reported.clone(), now + Duration::from_millis(500));
        assert!(!merged.is_playing);

        let merged = overlays.merge(reported, now + Duration::from_millis(1600));
        assert!(merged.is_playing);
        // Expired slot is pruned, not re-applied later.
        assert!(overlays.is_playing.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_drops_rapid_repeats_only() {
        let mut debounce = Debouncer::new(Duration::from_millis(150));
        let now = Instant::now();
        assert!(!debounce.should_drop(ActionKind::PlayPause, now));
        assert!(debounce.should_drop(ActionKind::PlayPause, now + Duration::from_millis(50)));
        // Different action is its own bucket.
        assert!(!debounce.should_drop(ActionKind::Next, now + Duration::from_millis(50)));
        assert!(!debounce.should_drop(ActionKind::PlayPause, now + Duration::from_millis(200)));
    }

    #[test]
    fn queue_fires_once_near_track_end() {
        let mut queue = PlayQueue::default();
        queue.push(QueueEntry {
            uri: "spotify:track:abc".into(),
            title: None,
            artist: None,
        });

        queue.observe_track(Some("spotify:track:current"));
        // Mid-track: nothing.
        assert!(queue.continuation(&playing(60_000, 180_000), 2000).is_none());
        // Inside the end window: fires.
        let entry = queue.continuation(&playing(178_500, 180_000), 2000).unwrap();
        assert_eq!(entry.uri, "spotify:track:abc");
        // Same track, another poll in the window: latched.
        queue.push(QueueEntry {
            uri: "spotify:track:def".into(),
            title: None,
            artist: None,
        });
        assert!(queue.continuation(&playing(179_000, 180_000), 2000).is_none());
        // New track resets the latch.
        queue.observe_track(Some("spotify:track:abc"));
        assert!(queue.continuation(&playing(178_500, 180_000), 2000).is_some());
    }

    #[test]
    fn queue_defers_to_track_repeat() {
        let mut queue = PlayQueue::default();
        queue.push(QueueEntry {
            uri: "spotify:track:abc".into(),
            title: None,
            artist: None,
        });
        queue.observe_track(Some("spotify:track:current"));
        let state = PlaybackState {
            repeat: RepeatMode::Track,
            ..playing(179_000, 180_000)
        };
        assert!(queue.continuation(&state, 2000).is_none());
    }

    #[test]
    fn queue_ignores_paused_and_unknown_duration() {
        let mut queue = PlayQueue::default();
        queue.push(QueueEntry {
            uri: "spotify:track:abc".into(),
            title: None,
            artist: None,
        });
        queue.observe_track(Some("spotify:track:current"));

        let paused = PlaybackState {
            is_playing: false,
            ..playing(179_000, 180_000)
        };
        assert!(queue.continuation(&paused, 2000).is_none());
        assert!(queue.continuation(&playing(179_000, 0), 2000).is_none());
    }
}
