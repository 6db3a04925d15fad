//! Traffic counters from the engine's management API, with optional
//! reporting of deltas to the panel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::supervisor::{ProcessState, ProcessStatus, ProcessSupervisor};

/// Anything that can tell the collector whether the engine is up.
pub trait EngineProbe: Send + Sync {
    fn status(&self) -> ProcessStatus;
}

impl EngineProbe for ProcessSupervisor {
    fn status(&self) -> ProcessStatus {
        ProcessSupervisor::status(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsOptions {
    /// `host:port` of the management API.
    pub api: String,
    pub api_secret: Option<String>,
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub report_url: Option<String>,
    pub report_token: Option<String>,
    pub report_interval: Duration,
}

impl StatsOptions {
    pub fn new(api: impl Into<String>) -> Self {
        Self {
            api: api.into(),
            api_secret: None,
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(5),
            report_url: None,
            report_token: None,
            report_interval: Duration::from_secs(60),
        }
    }
}

/// Cumulative counters for one engine process. Monotonic within a
/// generation and reset when a new process starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub upload: u64,
    pub download: u64,
    pub uptime_secs: u64,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Engine not running; no request was made.
    Skipped,
    Updated(StatsSnapshot),
    /// Request failed; the previous snapshot is kept.
    Failed,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionsTotals {
    #[serde(default)]
    upload_total: u64,
    #[serde(default)]
    download_total: u64,
}

#[derive(Debug, Serialize)]
struct TrafficReport {
    upload: u64,
    download: u64,
}

#[derive(Debug, Default)]
struct Counters {
    snapshot: StatsSnapshot,
    pending_upload: u64,
    pending_download: u64,
}

pub struct StatsCollector {
    client: reqwest::Client,
    options: StatsOptions,
    probe: Arc<dyn EngineProbe>,
    counters: parking_lot::Mutex<Counters>,
}

impl StatsCollector {
    pub fn new(options: StatsOptions, probe: Arc<dyn EngineProbe>) -> Result<Self> {
        // The management API is local and the report must not loop through
        // the engine itself.
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(options.timeout)
            .build()
            .context("failed to build stats HTTP client")?;
        Ok(Self {
            client,
            options,
            probe,
            counters: parking_lot::Mutex::new(Counters::default()),
        })
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.counters.lock().snapshot
    }

    /// Query the engine once and fold the totals into the snapshot.
    pub async fn poll_once(&self) -> PollOutcome {
        let status = self.probe.status();
        if status.state != ProcessState::Running {
            return PollOutcome::Skipped;
        }

        let totals = match self.fetch_totals().await {
            Ok(totals) => totals,
            Err(e) => {
                tracing::debug!("traffic poll failed: {e:#}");
                return PollOutcome::Failed;
            }
        };

        let uptime_secs = status
            .started_at
            .map(|t| (Utc::now() - t).num_seconds().max(0) as u64)
            .unwrap_or_default();

        let mut counters = self.counters.lock();
        if counters.snapshot.generation != status.generation {
            counters.snapshot = StatsSnapshot {
                generation: status.generation,
                ..StatsSnapshot::default()
            };
        }
        let upload = totals.upload_total.max(counters.snapshot.upload);
        let download = totals.download_total.max(counters.snapshot.download);
        counters.pending_upload += upload - counters.snapshot.upload;
        counters.pending_download += download - counters.snapshot.download;
        counters.snapshot = StatsSnapshot {
            upload,
            download,
            uptime_secs,
            generation: status.generation,
        };
        PollOutcome::Updated(counters.snapshot)
    }

    /// Send the traffic accumulated since the last successful report.
    /// Returns `Ok(false)` when reporting is disabled or there is nothing
    /// to send; on failure the deltas stay pending.
    pub async fn report_once(&self) -> Result<bool> {
        let Some(url) = self.options.report_url.as_deref() else {
            return Ok(false);
        };
        let body = {
            let counters = self.counters.lock();
            TrafficReport {
                upload: counters.pending_upload,
                download: counters.pending_download,
            }
        };
        if body.upload == 0 && body.download == 0 {
            return Ok(false);
        }

        let mut request = self.client.post(url).json(&body);
        if let Some(token) = self.options.report_token.as_deref() {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .context("failed to send traffic report")?;
        if !response.status().is_success() {
            bail!("traffic report rejected (HTTP {})", response.status());
        }

        let mut counters = self.counters.lock();
        counters.pending_upload = counters.pending_upload.saturating_sub(body.upload);
        counters.pending_download = counters.pending_download.saturating_sub(body.download);
        tracing::debug!(upload = body.upload, download = body.download, "traffic reported");
        Ok(true)
    }

    /// Poll (and report, when configured) until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        let mut poll = tokio::time::interval(self.options.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut report = tokio::time::interval(self.options.report_interval);
        report.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First ticks fire immediately.
        poll.tick().await;
        report.tick().await;

        loop {
            tokio::select! {
                () = token.cancelled() => {
                    tracing::debug!("stats loop cancelled");
                    break;
                }
                _ = poll.tick() => {
                    if self.poll_once().await == PollOutcome::Failed {
                        tracing::warn!(api = %self.options.api, "engine management API unreachable");
                    }
                }
                _ = report.tick(), if self.options.report_url.is_some() => {
                    if let Err(e) = self.report_once().await {
                        tracing::warn!("traffic report failed, will retry: {e:#}");
                    }
                }
            }
        }
    }

    async fn fetch_totals(&self) -> Result<ConnectionsTotals> {
        let url = format!("http://{}/connections", self.options.api);
        let mut request = self.client.get(&url);
        if let Some(secret) = self.options.api_secret.as_deref() {
            request = request.bearer_auth(secret);
        }
        let response = request.send().await.with_context(|| format!("GET {url}"))?;
        if !response.status().is_success() {
            bail!("GET {url} returned HTTP {}", response.status());
        }
        response
            .json::<ConnectionsTotals>()
            .await
            .context("malformed traffic counters")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct FakeProbe(parking_lot::Mutex<ProcessStatus>);

    impl FakeProbe {
        fn new(state: ProcessState, generation: u64) -> Arc<Self> {
            Arc::new(Self(parking_lot::Mutex::new(ProcessStatus {
                state,
                pid: Some(42),
                started_at: Some(Utc::now()),
                last_exit: None,
                generation,
            })))
        }

        fn set(&self, state: ProcessState, generation: u64) {
            let mut status = self.0.lock();
            status.state = state;
            status.generation = generation;
        }
    }

    impl EngineProbe for FakeProbe {
        fn status(&self) -> ProcessStatus {
            self.0.lock().clone()
        }
    }

    fn api(server: &MockServer) -> String {
        server.uri().trim_start_matches("http://").to_string()
    }

    fn totals(up: u64, down: u64) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "uploadTotal": up,
            "downloadTotal": down,
            "connections": []
        }))
    }

    async fn mount_totals(server: &MockServer, up: u64, down: u64) {
        Mock::given(method("GET"))
            .and(path("/connections"))
            .respond_with(totals(up, down))
            .up_to_n_times(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn skips_polling_when_engine_not_running() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(totals(1, 1))
            .expect(0)
            .mount(&server)
            .await;

        let collector =
            StatsCollector::new(StatsOptions::new(api(&server)), FakeProbe::new(ProcessState::Crashed, 1))
                .unwrap();
        assert_eq!(collector.poll_once().await, PollOutcome::Skipped);
        assert_eq!(collector.snapshot(), StatsSnapshot::default());
    }

    #[tokio::test]
    async fn counters_are_monotonic_within_a_generation() {
        let server = MockServer::start().await;
        mount_totals(&server, 100, 200).await;
        mount_totals(&server, 50, 300).await;

        let collector =
            StatsCollector::new(StatsOptions::new(api(&server)), FakeProbe::new(ProcessState::Running, 1))
                .unwrap();
        collector.poll_once().await;
        let PollOutcome::Updated(snapshot) = collector.poll_once().await else {
            panic!("expected an update");
        };
        assert_eq!(snapshot.upload, 100);
        assert_eq!(snapshot.download, 300);
        assert_eq!(snapshot.generation, 1);
    }

    #[tokio::test]
    async fn new_generation_resets_counters() {
        let server = MockServer::start().await;
        mount_totals(&server, 500, 500).await;
        mount_totals(&server, 10, 20).await;

        let probe = FakeProbe::new(ProcessState::Running, 1);
        let collector = StatsCollector::new(StatsOptions::new(api(&server)), probe.clone()).unwrap();
        collector.poll_once().await;
        probe.set(ProcessState::Running, 2);
        collector.poll_once().await;

        let snapshot = collector.snapshot();
        assert_eq!((snapshot.upload, snapshot.download, snapshot.generation), (10, 20, 2));
    }

    #[tokio::test]
    async fn failures_keep_previous_snapshot() {
        let server = MockServer::start().await;
        mount_totals(&server, 7, 9).await;
        Mock::given(method("GET"))
            .and(path("/connections"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/connections"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let collector =
            StatsCollector::new(StatsOptions::new(api(&server)), FakeProbe::new(ProcessState::Running, 1))
                .unwrap();
        collector.poll_once().await;
        assert_eq!(collector.poll_once().await, PollOutcome::Failed);
        assert_eq!(collector.poll_once().await, PollOutcome::Failed);
        assert_eq!(collector.snapshot().upload, 7);
        assert_eq!(collector.snapshot().download, 9);
    }

    #[tokio::test]
    async fn secret_is_sent_as_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/connections"))
            .and(header("authorization", "Bearer s3cret"))
            .respond_with(totals(1, 2))
            .expect(1)
            .mount(&server)
            .await;

        let mut options = StatsOptions::new(api(&server));
        options.api_secret = Some("s3cret".into());
        let collector = StatsCollector::new(options, FakeProbe::new(ProcessState::Running, 1)).unwrap();
        assert!(matches!(collector.poll_once().await, PollOutcome::Updated(_)));
    }

    #[tokio::test]
    async fn report_carries_deltas_forward_on_failure() {
        let engine = MockServer::start().await;
        mount_totals(&engine, 100, 1000).await;
        mount_totals(&engine, 150, 1600).await;

        let panel = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/user/traffic"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&panel)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/user/traffic"))
            .and(header("authorization", "Bearer tok"))
            .and(body_json(serde_json::json!({"upload": 150, "download": 1600})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&panel)
            .await;

        let mut options = StatsOptions::new(api(&engine));
        options.report_url = Some(format!("{}/api/v1/user/traffic", panel.uri()));
        options.report_token = Some("tok".into());
        let collector = StatsCollector::new(options, FakeProbe::new(ProcessState::Running, 1)).unwrap();

        collector.poll_once().await;
        assert!(collector.report_once().await.is_err());
        collector.poll_once().await;
        assert!(collector.report_once().await.unwrap());
        // Nothing new since the last successful report.
        assert!(!collector.report_once().await.unwrap());
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let collector = Arc::new(
            StatsCollector::new(StatsOptions::new("127.0.0.1:9"), FakeProbe::new(ProcessState::Stopped, 0))
                .unwrap(),
        );
        let token = CancellationToken::new();
        let task = tokio::spawn({
            let collector = Arc::clone(&collector);
            let token = token.clone();
            async move { collector.run(token).await }
        });
        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }
}
