//! Application configuration: `config.toml` plus environment overrides.

pub mod schema;

pub use schema::{Config, EngineConfig, GeneratorConfig, StatsConfig, SubscriptionConfig};

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::vpn::{GeneratorOptions, StatsOptions, SupervisorOptions};

const APP_DIR: &str = "boxkeeper";
const CONFIG_FILE: &str = "config.toml";
const ENGINE_CONFIG_FILE: &str = "singbox.json";

pub const ENV_SUBSCRIPTION_URL: &str = "BOXKEEPER_SUBSCRIPTION_URL";
pub const ENV_SUBSCRIPTION_TOKEN: &str = "BOXKEEPER_SUBSCRIPTION_TOKEN";
pub const ENV_LOG_LEVEL: &str = "BOXKEEPER_LOG_LEVEL";

/// Upper bound for every `*_interval_secs` value (7 days).
pub const MAX_INTERVAL_SECS: u64 = 7 * 24 * 60 * 60;

/// `<user config dir>/boxkeeper`.
pub fn default_config_dir() -> Result<PathBuf> {
    let dirs = directories::BaseDirs::new().context("could not determine the user config directory")?;
    Ok(dirs.config_dir().join(APP_DIR))
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(default_config_dir()?.join(CONFIG_FILE))
}

/// Expand `~` and `$VAR` in a user-supplied path.
pub fn expand_path(raw: &str) -> PathBuf {
    match shellexpand::full(raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(raw).as_ref()),
    }
}

impl Config {
    /// Load `path`, writing the defaults there first if it does not exist.
    /// Environment overrides are applied and the result validated.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Self::from_toml(&content).with_context(|| format!("invalid config {}", path.display()))?
        } else {
            let config = Self::default();
            config.save(path)?;
            tracing::info!(path = %path.display(), "wrote default config");
            config
        };

        config.config_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| anyhow::anyhow!("{e}"))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let content = toml::to_string(self).context("failed to serialize config")?;
        std::fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))
    }

    /// Apply `BOXKEEPER_*` overrides; empty values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        if let Some(url) = get(ENV_SUBSCRIPTION_URL) {
            self.subscription.url = Some(url);
        }
        if let Some(token) = get(ENV_SUBSCRIPTION_TOKEN) {
            self.subscription.token = Some(token);
        }
        if let Some(level) = get(ENV_LOG_LEVEL) {
            self.log_level = level;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.binary.trim().is_empty() {
            bail!("engine.binary must not be empty");
        }
        if self.engine.grace_period_ms == 0 || self.engine.grace_period_ms > 60_000 {
            bail!("engine.grace_period_ms must be between 1 and 60000");
        }
        if self.engine.settle_delay_ms > 30_000 {
            bail!("engine.settle_delay_ms must be at most 30000");
        }
        if let Some(url) = self.subscription.url.as_deref() {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                bail!("subscription.url must be an http(s) URL");
            }
        }
        if !(1..=300).contains(&self.subscription.timeout_secs) {
            bail!("subscription.timeout_secs must be between 1 and 300");
        }
        if self.subscription.interval_secs > MAX_INTERVAL_SECS {
            bail!("subscription.interval_secs must be at most {MAX_INTERVAL_SECS} (0 disables)");
        }
        if self.generator.listen_port == 0 {
            bail!("generator.listen_port must not be 0");
        }
        self.generator
            .listen
            .parse::<IpAddr>()
            .with_context(|| format!("generator.listen '{}' is not an IP address", self.generator.listen))?;
        if let Some(index) = self.generator.extra_rules.iter().position(|r| !r.is_object()) {
            bail!("generator.extra_rules[{index}] must be a table");
        }
        if self.stats.enabled {
            if !(1..=MAX_INTERVAL_SECS).contains(&self.stats.poll_interval_secs) {
                bail!("stats.poll_interval_secs must be between 1 and {MAX_INTERVAL_SECS}");
            }
            if !(1..=MAX_INTERVAL_SECS).contains(&self.stats.report_interval_secs) {
                bail!("stats.report_interval_secs must be between 1 and {MAX_INTERVAL_SECS}");
            }
        }
        Ok(())
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.engine
            .runtime_dir
            .as_deref()
            .map(expand_path)
            .unwrap_or_else(|| self.config_dir.clone())
    }

    pub fn engine_config_path(&self) -> PathBuf {
        self.engine
            .config_path
            .as_deref()
            .map(expand_path)
            .unwrap_or_else(|| self.runtime_dir().join(ENGINE_CONFIG_FILE))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.subscription.interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.subscription.timeout_secs)
    }

    pub fn supervisor_options(&self) -> SupervisorOptions {
        let mut options = SupervisorOptions::new(self.engine_config_path(), self.runtime_dir());
        options.binary = self.engine.binary.clone();
        options.binary_path = self.engine.path.as_deref().map(expand_path);
        options.grace_period = Duration::from_millis(self.engine.grace_period_ms);
        options.settle_delay = Duration::from_millis(self.engine.settle_delay_ms);
        options
    }

    pub fn generator_options(&self) -> GeneratorOptions {
        let g = &self.generator;
        GeneratorOptions {
            listen: g.listen.clone(),
            listen_port: g.listen_port,
            tun: g.tun,
            log_level: g.engine_log_level.clone(),
            remote_dns: g.remote_dns.clone(),
            local_dns: g.local_dns.clone(),
            direct_suffixes: g.direct_suffixes.clone(),
            clash_api: Some(g.clash_api.trim().to_string()).filter(|s| !s.is_empty()),
            clash_api_secret: g.clash_api_secret.clone(),
            extra_rules: g.extra_rules.clone(),
        }
    }

    /// `None` when stats are disabled or the management API is off.
    pub fn stats_options(&self) -> Option<StatsOptions> {
        let api = self.generator.clash_api.trim();
        if !self.stats.enabled || api.is_empty() {
            return None;
        }
        let mut options = StatsOptions::new(api);
        options.api_secret = self.generator.clash_api_secret.clone();
        options.poll_interval = Duration::from_secs(self.stats.poll_interval_secs);
        options.report_url = self.stats.report_url.clone();
        options.report_token = self.subscription_token();
        options.report_interval = Duration::from_secs(self.stats.report_interval_secs);
        Some(options)
    }

    /// Explicit token, or the one embedded in the subscription URL.
    pub fn subscription_token(&self) -> Option<String> {
        let url = self.subscription.url.as_deref().unwrap_or_default();
        crate::vpn::subscription::resolve_token(url, self.subscription.token.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_writes_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/config.toml");

        let config = Config::load_or_init(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.subscription.interval_secs, 3600);
        assert_eq!(config.engine.binary, "sing-box");
        assert_eq!(config.engine_config_path(), tmp.path().join("nested/singbox.json"));

        let reloaded = Config::from_toml(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(reloaded.generator, config.generator);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let config = Config::from_toml(
            r#"
            log_level = "debug"

            [subscription]
            url = "https://panel.example.com/api/v1/client/subscribe?token=abc"
            interval_secs = 0

            [[generator.extra_rules]]
            domain_suffix = ["corp.example"]
            outbound = "direct"
            "#,
        )
        .unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.subscription.interval_secs, 0);
        assert_eq!(config.subscription.timeout_secs, 30);
        assert_eq!(config.generator.listen_port, 7890);
        assert_eq!(config.generator.extra_rules.len(), 1);
        assert_eq!(config.generator.extra_rules[0]["outbound"], "direct");
        assert_eq!(config.subscription_token().as_deref(), Some("abc"));
        assert!(config.refresh_interval().is_zero());
        config.validate().unwrap();
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Config::from_toml("[engine]\nbinray = \"sing-box\"\n").unwrap_err();
        assert!(err.to_string().contains("binray"));
    }

    #[test]
    fn env_overrides_win() {
        let mut config = Config::default();
        config.subscription.token = Some("from-file".into());
        config.apply_env_overrides(|key| match key {
            ENV_SUBSCRIPTION_URL => Some("https://p.example.com/sub/xyz".into()),
            ENV_SUBSCRIPTION_TOKEN => Some("from-env".into()),
            ENV_LOG_LEVEL => Some("  ".into()),
            _ => None,
        });
        assert_eq!(config.subscription.url.as_deref(), Some("https://p.example.com/sub/xyz"));
        assert_eq!(config.subscription_token().as_deref(), Some("from-env"));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = Config::default();
        config.engine.binary = " ".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.generator.listen = "localhost".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.subscription.url = Some("ftp://panel".into());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.generator.extra_rules = vec![serde_json::json!("direct")];
        assert!(config.validate().unwrap_err().to_string().contains("extra_rules[0]"));

        let mut config = Config::default();
        config.stats.enabled = false;
        config.stats.poll_interval_secs = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn intervals_are_bounded() {
        let mut config = Config::default();
        config.subscription.interval_secs = u64::MAX;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("subscription.interval_secs"), "{err}");

        config.subscription.interval_secs = MAX_INTERVAL_SECS;
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.stats.enabled = true;
        config.stats.poll_interval_secs = MAX_INTERVAL_SECS + 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.stats.enabled = true;
        config.stats.report_interval_secs = u64::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn component_options_follow_config() {
        let mut config = Config::default();
        config.config_dir = PathBuf::from("/etc/boxkeeper");
        config.engine.grace_period_ms = 250;
        config.generator.clash_api = String::new();

        let sup = config.supervisor_options();
        assert_eq!(sup.config_path, PathBuf::from("/etc/boxkeeper/singbox.json"));
        assert_eq!(sup.grace_period, Duration::from_millis(250));
        assert_eq!(config.generator_options().clash_api, None);
        assert!(config.stats_options().is_none());
    }

    #[test]
    fn tilde_paths_expand() {
        let expanded = expand_path("~/engine/sing-box");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.ends_with("engine/sing-box"));
    }
}
