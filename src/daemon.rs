//! Wires the refresh pipeline, the supervisor and the stats loop together
//! and runs them until a shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::vpn::{
    ConfigGenerator, ProcessState, ProcessSupervisor, RefreshScheduler,
    StatsCollector, SubscriptionFetcher, SubscriptionSource,
};

pub struct Daemon {
    supervisor: Arc<ProcessSupervisor>,
    scheduler: Option<Arc<RefreshScheduler>>,
    stats: Option<Arc<StatsCollector>>,
}

/// Result of `boxkeeper check`.
#[derive(Debug, Clone)]
pub struct CheckReport {
    pub engine_config: PathBuf,
    pub engine_config_exists: bool,
    pub binary: Result<PathBuf, String>,
    pub subscription_url: Option<String>,
}

impl Daemon {
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::with_source(config, subscription_source(config)?)
    }

    /// Build with an explicit profile source; `None` runs the engine on
    /// whatever config is already on disk.
    pub fn with_source(config: &Config, source: Option<Arc<dyn SubscriptionSource>>) -> Result<Self> {
        let generator = ConfigGenerator::new(config.generator_options());
        let supervisor = Arc::new(ProcessSupervisor::new(
            config.supervisor_options(),
            generator.clone(),
        ));
        let scheduler = source.map(|source| {
            Arc::new(RefreshScheduler::new(
                source,
                generator,
                Arc::clone(&supervisor),
                config.refresh_interval(),
            ))
        });
        let stats = config
            .stats_options()
            .map(|options| StatsCollector::new(options, supervisor.clone()).map(Arc::new))
            .transpose()?;

        Ok(Self {
            supervisor,
            scheduler,
            stats,
        })
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn scheduler(&self) -> Option<&Arc<RefreshScheduler>> {
        self.scheduler.as_ref()
    }

    /// Bootstrap refresh, start the engine, then serve until `shutdown` is
    /// cancelled or a termination signal arrives. The engine is stopped
    /// before returning.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        match &self.scheduler {
            Some(scheduler) => {
                if let Err(e) = scheduler.refresh_once().await {
                    tracing::warn!("initial refresh failed, starting with existing config: {e}");
                }
            }
            None => tracing::warn!("no subscription URL configured, periodic refresh disabled"),
        }

        self.supervisor
            .start()
            .await
            .context("failed to start engine")?;

        let mut tasks = tokio::task::JoinSet::new();
        if let Some(scheduler) = &self.scheduler {
            let scheduler = Arc::clone(scheduler);
            let token = shutdown.child_token();
            tasks.spawn(async move { scheduler.run(token).await });
        }
        if let Some(stats) = &self.stats {
            let stats = Arc::clone(stats);
            let token = shutdown.child_token();
            tasks.spawn(async move { stats.run(token).await });
        }

        let result = self.serve(&shutdown).await;

        shutdown.cancel();
        while tasks.join_next().await.is_some() {}
        self.supervisor.stop().await.context("failed to stop engine")?;
        tracing::info!("shutdown complete");
        result
    }

    async fn serve(&self, shutdown: &CancellationToken) -> Result<()> {
        let mut signals = Signals::new()?;
        let mut states = self.supervisor.subscribe();
        let refresh = self.scheduler.as_ref().map(|s| s.handle());

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                event = signals.recv() => match event {
                    SignalEvent::Shutdown => {
                        tracing::info!("shutdown requested");
                        break;
                    }
                    SignalEvent::Refresh => match &refresh {
                        Some(handle) if handle.trigger() => tracing::info!("manual refresh queued"),
                        Some(_) => tracing::warn!("refresh already pending"),
                        None => tracing::warn!("refresh requested but no subscription is configured"),
                    },
                },
                Ok(()) = states.changed() => {
                    if *states.borrow_and_update() == ProcessState::Crashed {
                        let status = self.supervisor.status();
                        let exit = status
                            .last_exit
                            .map(|e| e.to_string())
                            .unwrap_or_else(|| "unknown exit".into());
                        tracing::error!(%exit, "engine crashed and will not be restarted automatically");
                    }
                }
            }
        }
        Ok(())
    }
}

/// Run a single refresh cycle without starting the engine.
pub async fn generate_once(config: &Config) -> Result<PathBuf> {
    let source = subscription_source(config)?.context("subscription.url is not configured")?;
    let daemon = Daemon::with_source(config, Some(source))?;
    let scheduler = daemon
        .scheduler()
        .context("refresh scheduler unavailable")?;
    scheduler.refresh_once().await?;
    Ok(daemon.supervisor().config_path().to_path_buf())
}

pub fn check(config: &Config) -> Result<CheckReport> {
    let daemon = Daemon::with_source(config, None)?;
    let engine_config = daemon.supervisor().config_path().to_path_buf();
    Ok(CheckReport {
        engine_config_exists: engine_config.exists(),
        engine_config,
        binary: daemon.supervisor().locate_binary().map_err(|e| e.to_string()),
        subscription_url: config.subscription.url.clone(),
    })
}

fn subscription_source(config: &Config) -> Result<Option<Arc<dyn SubscriptionSource>>> {
    let Some(url) = config.subscription.url.as_deref() else {
        return Ok(None);
    };
    let fetcher = SubscriptionFetcher::new(
        url,
        config.subscription.token.as_deref(),
        config.fetch_timeout(),
        &config.subscription.user_agent,
    )?;
    Ok(Some(Arc::new(fetcher)))
}

// ── Signals ─────────────────────────────────────────────────────────

enum SignalEvent {
    Shutdown,
    Refresh,
}

#[cfg(unix)]
struct Signals {
    terminate: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn new() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            terminate: signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?,
            interrupt: signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?,
            hangup: signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?,
        })
    }

    async fn recv(&mut self) -> SignalEvent {
        tokio::select! {
            _ = self.terminate.recv() => SignalEvent::Shutdown,
            _ = self.interrupt.recv() => SignalEvent::Shutdown,
            _ = self.hangup.recv() => SignalEvent::Refresh,
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn new() -> Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> SignalEvent {
        match tokio::signal::ctrl_c().await {
            Ok(()) => SignalEvent::Shutdown,
            Err(e) => {
                tracing::warn!("failed to listen for Ctrl-C: {e}");
                std::future::pending().await
            }
        }
    }
}
