use serde::{Deserialize, Serialize};

/// Top-level `config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Default tracing filter; `RUST_LOG` wins when set.
    pub log_level: String,
    pub subscription: SubscriptionConfig,
    pub engine: EngineConfig,
    pub generator: GeneratorConfig,
    pub stats: StatsConfig,

    /// Directory the file was loaded from; anchors the default paths.
    #[serde(skip)]
    pub config_dir: std::path::PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            subscription: SubscriptionConfig::default(),
            engine: EngineConfig::default(),
            generator: GeneratorConfig::default(),
            stats: StatsConfig::default(),
            config_dir: std::path::PathBuf::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SubscriptionConfig {
    /// Panel subscription URL.
    pub url: Option<String>,
    /// Bearer token; derived from the URL when unset.
    pub token: Option<String>,
    /// Seconds between refreshes. `0` disables periodic refresh.
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            interval_secs: 3600,
            timeout_secs: 30,
            user_agent: concat!("boxkeeper/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Executable name searched on PATH, next to boxkeeper, and in `runtime_dir`.
    pub binary: String,
    /// Explicit executable path, bypasses the search.
    pub path: Option<String>,
    /// Generated config location. Defaults to `<runtime_dir>/singbox.json`.
    pub config_path: Option<String>,
    /// Defaults to the directory holding `config.toml`.
    pub runtime_dir: Option<String>,
    pub grace_period_ms: u64,
    pub settle_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: "sing-box".into(),
            path: None,
            config_path: None,
            runtime_dir: None,
            grace_period_ms: 5000,
            settle_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeneratorConfig {
    pub listen: String,
    pub listen_port: u16,
    pub tun: bool,
    /// sing-box's own log level.
    pub engine_log_level: String,
    pub remote_dns: String,
    pub local_dns: String,
    pub direct_suffixes: Vec<String>,
    /// Management API listener; empty disables it (and stats).
    pub clash_api: String,
    pub clash_api_secret: Option<String>,
    /// Route rules copied verbatim ahead of the built-in ones.
    pub extra_rules: Vec<serde_json::Value>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1".into(),
            listen_port: 7890,
            tun: false,
            engine_log_level: "info".into(),
            remote_dns: "https://1.1.1.1/dns-query".into(),
            local_dns: "https://223.5.5.5/dns-query".into(),
            direct_suffixes: vec!["lan".into(), "local".into(), "localhost".into()],
            clash_api: "127.0.0.1:9090".into(),
            clash_api_secret: None,
            extra_rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatsConfig {
    pub enabled: bool,
    pub poll_interval_secs: u64,
    /// Panel endpoint receiving `{"upload", "download"}` deltas.
    pub report_url: Option<String>,
    pub report_interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 5,
            report_url: None,
            report_interval_secs: 60,
        }
    }
}
