//! Process supervisor for the spotifyd daemon.
//!
//! The supervisor either adopts a healthy daemon that is already running
//! (left over from a previous session, or started by the user) or spawns a
//! fresh one, detached from our process group so it survives us.  A daemon
//! counts as healthy only when the OS process is alive AND it answers on the
//! control bus; a registered-but-dead or alive-but-silent daemon is treated
//! as unhealthy and replaced.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::ControlError;
use crate::integrity;
use crate::mpris::MPRIS_BUS_PREFIXES;
use crate::platform;

/// Polling cadence while waiting for spawn liveness and bus registration.
const WAIT_TICK: Duration = Duration::from_millis(100);
/// Ticks to wait for the spawned process to survive startup.
const LIVENESS_TICKS: u32 = 5;
/// Ticks to wait for the daemon to claim its control-bus name.
const REGISTRATION_TICKS: u32 = 30;
/// Grace period between SIGTERM and SIGKILL when stopping.
const STOP_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<u32>,
    /// Whether spotifyd has cached OAuth credentials on disk, i.e. will
    /// come up signed in without user interaction.
    pub authenticated: bool,
}

#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub pid: u32,
    /// True when an already-running daemon was adopted instead of spawned.
    pub adopted: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy)]
struct SupervisedProcess {
    pid: u32,
    owned_by_us: bool,
    #[allow(dead_code)]
    started_at_ms: i64,
}

pub struct ProcessSupervisor {
    device_name: String,
    tracked: RwLock<Option<SupervisedProcess>>,
    status_tx: watch::Sender<DaemonStatus>,
    // start_or_adopt is not reentrant; concurrent callers queue here.
    start_lock: Mutex<()>,
}

impl ProcessSupervisor {
    pub fn new(device_name: String) -> Self {
        let (status_tx, _) = watch::channel(DaemonStatus::default());
        Self {
            device_name,
            tracked: RwLock::new(None),
            status_tx,
            start_lock: Mutex::new(()),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<DaemonStatus> {
        self.status_tx.subscribe()
    }

    pub fn status(&self) -> DaemonStatus {
        self.status_tx.borrow().clone()
    }

    fn publish(&self, running: bool, pid: Option<u32>) {
        self.status_tx.send_replace(DaemonStatus {
            running,
            pid,
            authenticated: integrity::credentials_cached(),
        });
    }

    /// Recheck the tracked process and republish status.
    pub async fn refresh_status(&self) {
        let tracked = *self.tracked.read().await;
        match tracked {
            Some(t) if is_pid_alive(t.pid) => self.publish(true, Some(t.pid)),
            Some(_) => {
                *self.tracked.write().await = None;
                self.publish(false, None);
            }
            None => self.publish(false, None),
        }
    }

    /// Ensure a healthy daemon is running, preferring adoption over a fresh
    /// spawn.  Unhealthy strays found along the way are killed so they
    /// cannot hold the audio device or the bus name hostage.
    pub async fn start_or_adopt(&self, binary: &Path) -> Result<StartOutcome, ControlError> {
        let _guard = self.start_lock.lock().await;

        // Fast path: the process we already track is still healthy.
        if let Some(t) = *self.tracked.read().await {
            if is_pid_alive(t.pid) && protocol_responsive().await {
                debug!("tracked spotifyd (pid {}) is healthy", t.pid);
                return Ok(StartOutcome {
                    pid: t.pid,
                    adopted: !t.owned_by_us,
                    message: "daemon already running".into(),
                });
            }
            *self.tracked.write().await = None;
        }

        // Look for an existing daemon: the control bus first (authoritative
        // pid), then the process table.
        let mut strays = discover_bus_pids().await;
        for pid in discover_process_pids().await {
            if !strays.contains(&pid) {
                strays.push(pid);
            }
        }

        if !strays.is_empty() && protocol_responsive().await {
            let pid = strays[0];
            info!("adopting running spotifyd (pid {})", pid);
            *self.tracked.write().await = Some(SupervisedProcess {
                pid,
                owned_by_us: false,
                started_at_ms: Utc::now().timestamp_millis(),
            });
            self.publish(true, Some(pid));
            return Ok(StartOutcome {
                pid,
                adopted: true,
                message: "adopted existing daemon".into(),
            });
        }

        // Any process that exists but does not answer the protocol is in
        // the way of a clean start.
        for pid in strays {
            warn!("killing unresponsive spotifyd stray (pid {})", pid);
            terminate_pid(pid, STOP_GRACE);
        }

        self.start_fresh(binary).await
    }

    async fn start_fresh(&self, binary: &Path) -> Result<StartOutcome, ControlError> {
        info!("starting spotifyd from {}", binary.display());

        let mut command = tokio::process::Command::new(binary);
        command
            .arg("--no-daemon")
            .arg("--device-name")
            .arg(&self.device_name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // New session: the daemon must not die with our terminal, and
        // Ctrl-C aimed at us must not reach it.
        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .map_err(|e| ControlError::ProcessSpawn(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| ControlError::ProcessSpawn("spawned without a pid".into()))?;

        // Reap the child when it exits so it never lingers as a zombie.
        let status_tx = self.status_tx.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!("spotifyd (pid {}) exited: {}", pid, status),
                Err(e) => warn!("failed to wait on spotifyd (pid {}): {}", pid, e),
            }
            status_tx.send_replace(DaemonStatus {
                running: false,
                pid: None,
                authenticated: integrity::credentials_cached(),
            });
        });

        // The process has to survive its own startup (config parse, device
        // open) before we call the spawn good.
        for _ in 0..LIVENESS_TICKS {
            tokio::time::sleep(WAIT_TICK).await;
            if !is_pid_alive(pid) {
                return Err(ControlError::ProcessExited);
            }
        }

        *self.tracked.write().await = Some(SupervisedProcess {
            pid,
            owned_by_us: true,
            started_at_ms: Utc::now().timestamp_millis(),
        });
        self.publish(true, Some(pid));

        // Bounded wait for the daemon to claim its bus name.  On timeout
        // the process is left running (and tracked) so the caller can still
        // stop it, but the start is reported as failed.
        for _ in 0..REGISTRATION_TICKS {
            if protocol_responsive().await {
                info!("spotifyd (pid {}) registered on the control bus", pid);
                return Ok(StartOutcome {
                    pid,
                    adopted: false,
                    message: "daemon started".into(),
                });
            }
            tokio::time::sleep(WAIT_TICK).await;
        }

        warn!("spotifyd (pid {}) is running but never registered", pid);
        Err(ControlError::RegistrationTimeout)
    }

    /// Alive AND answering on the control bus.  Alive-but-silent calls for
    /// a reconnect, not a restart.
    pub async fn is_healthy(&self) -> bool {
        match *self.tracked.read().await {
            Some(t) => is_pid_alive(t.pid) && protocol_responsive().await,
            None => false,
        }
    }

    /// Stop the daemon.  A daemon we merely adopted is left running unless
    /// `force` is set; either way we stop tracking it.  With `force`, every
    /// matching process on the system goes, not just the tracked one.
    /// Termination sends SIGTERM immediately and schedules the SIGKILL
    /// escalation on a detached task so shutdown never blocks on the grace
    /// period.
    pub async fn stop(&self, force: bool) {
        let tracked = self.tracked.write().await.take();

        if let Some(t) = tracked {
            if t.owned_by_us || force {
                info!("stopping spotifyd (pid {})", t.pid);
                terminate_pid(t.pid, STOP_GRACE);
            } else {
                info!("leaving adopted spotifyd (pid {}) running", t.pid);
            }
        }

        if force {
            for pid in discover_process_pids().await {
                if Some(pid) != tracked.map(|t| t.pid) {
                    warn!("force-stopping stray spotifyd (pid {})", pid);
                    terminate_pid(pid, STOP_GRACE);
                }
            }
        }

        self.publish(false, None);
    }

    /// Inject tracking state directly, standing in for the spawn/adopt
    /// paths that normally fill it.
    #[cfg(test)]
    async fn track(&self, pid: u32, owned_by_us: bool) {
        *self.tracked.write().await = Some(SupervisedProcess {
            pid,
            owned_by_us,
            started_at_ms: 0,
        });
    }
}

///// Liveness check that treats zombies as dead: a reparented child that
/// exited still answers `kill(pid, 0)` until reaped.
pub(crate) fn is_pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // A pid that does not fit pid_t would alias a process group below.
        if pid == 0 || pid > i32::MAX as u32 {
            return false;
        }
        let alive = unsafe { libc::kill(pid as libc::pid_t, 0) } == 0
            || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
        if !alive {
            return false;
        }
        if let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            // State is the first field after the parenthesized comm.
            if let Some(idx) = stat.rfind(')') {
                if stat[idx + 1..].trim_start().starts_with('Z') {
                    return false;
                }
            }
        }
        true
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// SIGTERM now, SIGKILL from a background task if it is still alive after
/// the grace period.
fn terminate_pid(pid: u32, grace: Duration) {
    #[cfg(unix)]
    {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if is_pid_alive(pid) {
                warn!("spotifyd (pid {}) ignored SIGTERM, sending SIGKILL", pid);
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGKILL);
                }
            }
        });
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, grace);
    }
}

/// Pids of daemons registered on the session bus, via name-owner lookup.
async fn discover_bus_pids() -> Vec<u32> {
    let mut pids = Vec::new();
    let Ok(connection) = zbus::Connection::session().await else {
        return pids;
    };
    let Ok(dbus) = zbus::fdo::DBusProxy::new(&connection).await else {
        return pids;
    };
    let Ok(names) = dbus.list_names().await else {
        return pids;
    };
    for name in names {
        let matches = MPRIS_BUS_PREFIXES
            .iter()
            .any(|prefix| name.as_str().starts_with(prefix));
        if !matches {
            continue;
        }
        if let Ok(pid) = dbus
            .get_connection_unix_process_id(name.clone().into())
            .await
        {
            pids.push(pid);
        }
    }
    pids
}

/// Pids from the process table, for daemons that died on the bus but not in
/// the OS (or the reverse).
async fn discover_process_pids() -> Vec<u32> {
    let output = tokio::process::Command::new("pgrep")
        .arg("-x")
        .arg(platform::DAEMON_PROCESS_NAME)
        .output()
        .await;
    let Ok(output) = output else {
        return Vec::new();
    };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .collect()
}

/// True when some spotifyd-family name is present on the session bus.
pub(crate) async fn protocol_responsive() -> bool {
    let Ok(connection) = zbus::Connection::session().await else {
        return false;
    };
    let Ok(dbus) = zbus::fdo::DBusProxy::new(&connection).await else {
        return false;
    };
    let Ok(names) = dbus.list_names().await else {
        return false;
    };
    names.iter().any(|name| {
        MPRIS_BUS_PREFIXES
            .iter()
            .any(|prefix| name.as_str().starts_with(prefix))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_pid_is_alive() {
        assert!(is_pid_alive(std::process::id()));
    }

    #[test]
    fn absurd_pid_is_dead() {
        assert!(!is_pid_alive(u32::MAX - 1));
    }

    #[tokio::test]
    async fn stop_without_tracked_process_is_a_noop() {
        let supervisor = ProcessSupervisor::new("spotui".into());
        supervisor.stop(false).await;
        assert!(!supervisor.status().running);
    }

    // `sleep` stands in for an externally started daemon; it is not named
    // spotifyd, so the force path's stray sweep cannot touch it and only
    // the tracked-pid signal is under test.
    #[tokio::test]
    async fn adopted_process_survives_stop_unless_forced() {
        let supervisor = ProcessSupervisor::new("spotui".into());
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id();

        supervisor.track(pid, false).await;
        supervisor.stop(false).await;
        assert!(is_pid_alive(pid), "plain stop must not signal an adopted process");

        supervisor.track(pid, false).await;
        supervisor.stop(true).await;
        std::thread::sleep(Duration::from_millis(300));
        assert!(!is_pid_alive(pid), "forced stop must terminate an adopted process");
        let _ = child.wait();
    }

    #[tokio::test]
    async fn owned_process_is_stopped_without_force() {
        let supervisor = ProcessSupervisor::new("spotui".into());
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id();

        supervisor.track(pid, true).await;
        supervisor.stop(false).await;
        std::thread::sleep(Duration::from_millis(300));
        assert!(!is_pid_alive(pid));
        let _ = child.wait();
    }
}
