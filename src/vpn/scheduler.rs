//! Refresh cycles: fetch, generate, write, and restart a running engine.
//!
//! Periodic ticks, manual triggers and the bootstrap call all funnel into
//! the same cycle function, so a cycle never runs twice concurrently.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::error::{VpnError, VpnResult};
use super::generator::{ConfigGenerator, GeneratedConfig};
use super::subscription::SubscriptionSource;
use super::supervisor::ProcessSupervisor;
use super::writer::ConfigWriter;

/// Pending manual triggers beyond this are coalesced.
const TRIGGER_QUEUE: usize = 4;

/// What a successful cycle did with the new config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Written to disk; the engine was not running and picks it up on the
    /// next start.
    Staged,
    /// Written and the running engine was restarted onto it.
    Restarted,
}

#[derive(Debug, Clone, Default)]
pub struct RefreshState {
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub interval: Duration,
    /// Last config that made it to disk.
    pub last_config: Option<Arc<GeneratedConfig>>,
    pub cycles: u64,
    pub failures: u64,
}

struct RefreshRequest {
    respond: Option<oneshot::Sender<VpnResult<RefreshOutcome>>>,
}

/// Cloneable handle for out-of-band refreshes.
#[derive(Clone)]
pub struct RefreshHandle {
    tx: mpsc::Sender<RefreshRequest>,
}

impl RefreshHandle {
    /// Queue a cycle without waiting for it. Returns `false` when the queue
    /// is full or the scheduler is gone.
    pub fn trigger(&self) -> bool {
        self.tx.try_send(RefreshRequest { respond: None }).is_ok()
    }

    /// Run a cycle on the scheduler loop and wait for its result.
    pub async fn refresh(&self) -> VpnResult<RefreshOutcome> {
        let (respond, rx) = oneshot::channel();
        self.tx
            .send(RefreshRequest {
                respond: Some(respond),
            })
            .await
            .map_err(|_| VpnError::SchedulerClosed)?;
        rx.await.map_err(|_| VpnError::SchedulerClosed)?
    }
}

pub struct RefreshScheduler {
    source: Arc<dyn SubscriptionSource>,
    generator: ConfigGenerator,
    writer: ConfigWriter,
    supervisor: Arc<ProcessSupervisor>,
    config_path: PathBuf,
    interval: Duration,
    state: parking_lot::Mutex<RefreshState>,
    cycle: tokio::sync::Mutex<()>,
    trigger_tx: mpsc::Sender<RefreshRequest>,
    trigger_rx: tokio::sync::Mutex<Option<mpsc::Receiver<RefreshRequest>>>,
}

impl RefreshScheduler {
    /// `interval` of zero disables periodic cycles; manual triggers still work.
    pub fn new(
        source: Arc<dyn SubscriptionSource>,
        generator: ConfigGenerator,
        supervisor: Arc<ProcessSupervisor>,
        interval: Duration,
    ) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_QUEUE);
        Self {
            source,
            generator,
            writer: ConfigWriter::new(),
            config_path: supervisor.config_path().to_path_buf(),
            supervisor,
            interval,
            state: parking_lot::Mutex::new(RefreshState {
                interval,
                ..RefreshState::default()
            }),
            cycle: tokio::sync::Mutex::new(()),
            trigger_tx,
            trigger_rx: tokio::sync::Mutex::new(Some(trigger_rx)),
        }
    }

    pub fn handle(&self) -> RefreshHandle {
        RefreshHandle {
            tx: self.trigger_tx.clone(),
        }
    }

    pub fn state(&self) -> RefreshState {
        self.state.lock().clone()
    }

    /// One Fetch → Generate → Write → (Restart) cycle. Any failure before
    /// the write leaves the on-disk config and the process untouched.
    pub async fn refresh_once(&self) -> VpnResult<RefreshOutcome> {
        self.run_cycle(None).await
    }

    /// Drive periodic and manual cycles until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        let Some(mut triggers) = self.trigger_rx.lock().await.take() else {
            tracing::warn!("refresh loop is already running");
            return;
        };

        let mut ticker = periodic_ticker(self.interval);
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "refresh scheduler started"
        );

        loop {
            tokio::select! {
                () = token.cancelled() => {
                    tracing::debug!("refresh scheduler cancelled");
                    break;
                }
                () = next_tick(&mut ticker) => {
                    if let Err(e) = self.run_cycle(Some(&token)).await {
                        log_cycle_error("scheduled", &e);
                    }
                }
                Some(request) = triggers.recv() => {
                    let result = self.run_cycle(Some(&token)).await;
                    if let Err(e) = &result {
                        log_cycle_error("manual", e);
                    }
                    if let Some(respond) = request.respond {
                        let _ = respond.send(result);
                    }
                }
            }
        }

        *self.trigger_rx.lock().await = Some(triggers);
    }

    async fn run_cycle(&self, cancel: Option<&CancellationToken>) -> VpnResult<RefreshOutcome> {
        let _cycle = self.cycle.lock().await;
        self.state.lock().cycles += 1;

        let result = self.cycle_body(cancel).await;
        let mut state = self.state.lock();
        match &result {
            Ok(_) => {
                state.last_success = Some(Utc::now());
                state.last_error = None;
            }
            Err(e) => {
                state.failures += 1;
                state.last_error = Some(e.to_string());
            }
        }
        result
    }

    async fn cycle_body(&self, cancel: Option<&CancellationToken>) -> VpnResult<RefreshOutcome> {
        let fetch = self.source.fetch();
        let profiles = match cancel {
            Some(token) => tokio::select! {
                result = fetch => result?,
                () = token.cancelled() => {
                    return Err(VpnError::Fetch {
                        status: None,
                        reason: "cancelled by shutdown".into(),
                    });
                }
            },
            None => fetch.await?,
        };

        let config = Arc::new(self.generator.generate(&profiles)?);
        self.writer.write(&config, &self.config_path).await?;
        tracing::info!(
            profiles = profiles.len(),
            path = %self.config_path.display(),
            "engine config refreshed"
        );
        self.state.lock().last_config = Some(config);

        match self.supervisor.restart_if_running().await {
            Ok(()) => Ok(RefreshOutcome::Restarted),
            Err(VpnError::NotRunning) => Ok(RefreshOutcome::Staged),
            Err(e) => Err(e),
        }
    }
}

/// `None` disables periodic cycles: a zero interval, or one whose first
/// deadline does not fit in an `Instant`.
fn periodic_ticker(interval: Duration) -> Option<Interval> {
    if interval.is_zero() {
        return None;
    }
    let Some(first) = Instant::now().checked_add(interval) else {
        tracing::warn!(
            interval_secs = interval.as_secs(),
            "refresh interval is out of range, periodic refresh disabled"
        );
        return None;
    };
    let mut ticker = tokio::time::interval_at(first, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(ticker)
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn log_cycle_error(trigger: &str, error: &VpnError) {
    if error.is_recoverable() {
        tracing::warn!(trigger, "refresh failed, keeping previous config: {error}");
    } else {
        tracing::error!(trigger, "refresh failed: {error}");
    }
}
