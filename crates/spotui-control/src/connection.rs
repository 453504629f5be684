//! Startup orchestration and reconnect policy.
//!
//! Chains the full bring-up: verify the binary (installing or repairing if
//! the verdict calls for it), start or adopt the daemon, then connect the
//! protocol client with a bounded backoff schedule.  Every phase is
//! published on a watch channel so a UI can render progress.
//!
//! After startup, `supervise_link` keeps watching the reconciler's link
//! reports and re-runs the backoff schedule when the daemon drops off the
//! bus mid-session.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::ControlError;
use crate::installer::{InstallOutcome, Installer, ProgressTx};
use crate::mpris::PlayerControl;
use crate::supervisor::ProcessSupervisor;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Idle,
    Installing,
    StartingDaemon,
    Connecting,
    Reconnecting {
        attempt: u32,
    },
    Connected,
    /// Connect attempts exhausted; the daemon may still be running.
    Disconnected,
    Failed(String),
}

pub struct ConnectionSupervisor {
    installer: Arc<Installer>,
    supervisor: Arc<ProcessSupervisor>,
    client: Arc<dyn PlayerControl>,
    status_tx: watch::Sender<ConnectionStatus>,
    delays: Vec<Duration>,
    startup_timeout: Duration,
    cancel: CancellationToken,
}

impl ConnectionSupervisor {
    pub fn new(
        installer: Arc<Installer>,
        supervisor: Arc<ProcessSupervisor>,
        client: Arc<dyn PlayerControl>,
        config: &Config,
        cancel: CancellationToken,
    ) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Idle);
        Self {
            installer,
            supervisor,
            client,
            status_tx,
            delays: config
                .tuning
                .reconnect_delays_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
            startup_timeout: Duration::from_secs(config.tuning.startup_timeout_secs),
            cancel,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status_tx.borrow().clone()
    }

    fn publish(&self, status: ConnectionStatus) {
        self.status_tx.send_replace(status);
    }

    /// Full bring-up under a single deadline.  Returns `Ok(true)` when the
    /// client is connected, `Ok(false)` when the chain stopped short of a
    /// connection without a hard error (status says where).
    pub async fn startup(&self, progress: Option<ProgressTx>) -> Result<bool, ControlError> {
        let result = tokio::time::timeout(self.startup_timeout, self.startup_inner(progress)).await;
        match result {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("startup timed out after {:?}", self.startup_timeout);
                self.publish(ConnectionStatus::Failed("startup timed out".into()));
                Err(ControlError::Timeout(self.startup_timeout))
            }
        }
    }

    async fn startup_inner(&self, progress: Option<ProgressTx>) -> Result<bool, ControlError> {
        let verification = self.installer.verify().await?;

        if verification.needs_install || verification.needs_repair {
            self.publish(ConnectionStatus::Installing);
            let outcome = if verification.needs_install {
                self.installer.install(progress).await
            } else {
                self.installer.repair(&verification, progress).await
            };
            match outcome {
                Ok(InstallOutcome::Ready { version }) => {
                    info!("spotifyd {} ready", version);
                }
                Ok(InstallOutcome::InProgress { pid }) => {
                    self.publish(ConnectionStatus::Failed(format!(
                        "installation already running in pid {pid}"
                    )));
                    return Ok(false);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    self.publish(ConnectionStatus::Failed(e.to_string()));
                    return Ok(false);
                }
            }
        } else if !verification.can_proceed {
            self.publish(ConnectionStatus::Failed(format!(
                "binary unusable ({:?})",
                verification.state
            )));
            return Ok(false);
        }

        self.publish(ConnectionStatus::StartingDaemon);
        match self
            .supervisor
            .start_or_adopt(self.installer.binary_path())
            .await
        {
            Ok(started) => {
                info!("daemon up (pid {}, adopted: {})", started.pid, started.adopted);
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                self.publish(ConnectionStatus::Failed(e.to_string()));
                return Ok(false);
            }
        }

        Ok(self.connect_with_backoff().await)
    }

    /// One immediate attempt, then one attempt after each configured delay.
    /// Exhaustion is reported as `Disconnected`, not an error, because the
    /// daemon is usually still coming up and a later retry can succeed.
    pub async fn connect_with_backoff(&self) -> bool {
        self.publish(ConnectionStatus::Connecting);
        if self.try_connect().await {
            self.publish(ConnectionStatus::Connected);
            return true;
        }

        for (i, delay) in self.delays.iter().enumerate() {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.publish(ConnectionStatus::Disconnected);
                    return false;
                }
                _ = tokio::time::sleep(*delay) => {}
            }
            let attempt = (i + 1) as u32;
            self.publish(ConnectionStatus::Reconnecting { attempt });
            if self.try_connect().await {
                self.publish(ConnectionStatus::Connected);
                return true;
            }
        }

        warn!("control connection attempts exhausted");
        self.publish(ConnectionStatus::Disconnected);
        false
    }

    /// React to link-health reports from the reconciler's poll loop (see
    /// `Reconciler::subscribe_link`).  A drop while we believe we are
    /// connected re-runs the backoff schedule; a recovery observed by the
    /// poll loop itself (the client reconnected on its own) is published as
    /// `Connected`.  Runs until the cancellation token fires or the sender
    /// side goes away.
    pub async fn supervise_link(&self, mut link: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                changed = link.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            let up = *link.borrow_and_update();
            if up {
                if self.status() != ConnectionStatus::Connected {
                    info!("control link restored");
                    self.publish(ConnectionStatus::Connected);
                }
            } else if self.status() == ConnectionStatus::Connected {
                warn!("control link lost, reconnecting");
                self.connect_with_backoff().await;
            }
        }
    }

    async fn try_connect(&self) -> bool {
        match self.client.connect().await {
            Ok(()) => true,
            Err(e) => {
                info!("connect attempt failed: {}", e);
                false
            }
        }
    }

    /// Tear down: cancel background work and stop the daemon (adopted
    /// daemons are only stopped when `force` is set).
    pub async fn shutdown(&self, force: bool) {
        self.cancel.cancel();
        self.supervisor.stop(force).await;
        self.publish(ConnectionStatus::Idle);
    }
}
