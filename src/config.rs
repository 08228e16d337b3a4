use config::{self, Environment, File};
use log::{debug, error, info};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, RwLock};
use std::time::Duration;

use crate::collector::{Desc, Sample};
use crate::error::{ExporterError, Result};
use crate::helix::Credentials;

/// Prefix of environment variable overrides, e.g. `TWITCH_EXPORTER__TWITCH__CLIENT_ID`
pub const ENV_PREFIX: &str = "TWITCH_EXPORTER";

/// Platform credentials and the channels to watch
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct TwitchConfig {
    #[serde(alias = "client_id")]
    pub client_id: String,
    /// Enables app tokens and user token refresh
    #[serde(alias = "client_secret")]
    pub client_secret: Option<String>,
    /// User access token; without it the exporter runs with an app token
    #[serde(alias = "access_token")]
    pub access_token: Option<String>,
    #[serde(alias = "refresh_token")]
    pub refresh_token: Option<String>,
    pub channels: Vec<String>,
}

impl TwitchConfig {
    pub fn credentials(&self) -> Credentials {
        Credentials {
            client_id: self.client_id.clone(),
            client_secret: non_empty(&self.client_secret),
            access_token: non_empty(&self.access_token),
            refresh_token: non_empty(&self.refresh_token),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.is_empty()).cloned()
}

/// Webhook-based event subscriptions
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct EventSubConfig {
    pub enabled: bool,
    /// Public URL the provider delivers events to
    #[serde(alias = "webhook_url")]
    pub webhook_url: String,
    #[serde(alias = "webhook_secret")]
    pub webhook_secret: String,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct CollectorsConfig {
    /// Start from an empty set and opt collectors in through `toggles`
    #[serde(alias = "disable_defaults")]
    pub disable_defaults: bool,
    /// Explicit per-collector enablement
    pub toggles: BTreeMap<String, bool>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct CacheConfig {
    #[serde(alias = "ttl_seconds")]
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_cache_ttl(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

fn default_cache_ttl() -> u64 {
    30 * 60
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct ScrapeConfig {
    /// Collectors still running after this are abandoned; 0 waits forever
    #[serde(alias = "timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_scrape_timeout(),
        }
    }
}

impl ScrapeConfig {
    pub fn deadline(&self) -> Option<Duration> {
        (self.timeout_seconds > 0).then(|| Duration::from_secs(self.timeout_seconds))
    }
}

fn default_scrape_timeout() -> u64 {
    10
}

/// Logging level
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level
    #[default]
    Info,
    /// Debug level
    Debug,
    /// Trace level
    Trace,
}

/// Exporter configuration
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct ExporterConfig {
    pub twitch: TwitchConfig,
    pub eventsub: EventSubConfig,
    pub collectors: CollectorsConfig,
    pub cache: CacheConfig,
    pub scrape: ScrapeConfig,
    #[serde(alias = "log_level")]
    pub log_level: LogLevel,
}

impl ExporterConfig {
    /// Check the settings every start-up and reload depends on
    pub fn validate(&self) -> Result<()> {
        if self.twitch.client_id.is_empty() {
            return Err(ExporterError::Config("missing client id config".to_string()));
        }

        let credentials = self.twitch.credentials();
        if credentials.client_secret.is_none() && credentials.access_token.is_none() {
            return Err(ExporterError::Config(
                "missing client secret or access token config".to_string(),
            ));
        }

        if self.eventsub.enabled {
            if self.eventsub.webhook_url.is_empty() || self.eventsub.webhook_secret.is_empty() {
                return Err(ExporterError::Config(
                    "eventsub requires a webhook url and a webhook secret".to_string(),
                ));
            }
            // webhook subscriptions need an app token
            if credentials.client_secret.is_none() {
                return Err(ExporterError::Config(
                    "eventsub requires a client secret".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Values given on the command line, applied on top of the file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    /// Appended to the configured channels
    pub channels: Vec<String>,
    pub eventsub_enabled: bool,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub enable: Vec<String>,
    pub disable: Vec<String>,
    pub disable_defaults: bool,
    pub scrape_timeout_seconds: Option<u64>,
    pub log_level: Option<LogLevel>,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut ExporterConfig) {
        fn set(target: &mut String, value: &Option<String>) {
            if let Some(v) = value.as_ref().filter(|v| !v.is_empty()) {
                *target = v.clone();
            }
        }
        fn set_opt(target: &mut Option<String>, value: &Option<String>) {
            if let Some(v) = value.as_ref().filter(|v| !v.is_empty()) {
                *target = Some(v.clone());
            }
        }

        set(&mut config.twitch.client_id, &self.client_id);
        set_opt(&mut config.twitch.client_secret, &self.client_secret);
        set_opt(&mut config.twitch.access_token, &self.access_token);
        set_opt(&mut config.twitch.refresh_token, &self.refresh_token);

        for channel in &self.channels {
            if !channel.is_empty() && !config.twitch.channels.contains(channel) {
                config.twitch.channels.push(channel.clone());
            }
        }

        if self.eventsub_enabled {
            config.eventsub.enabled = true;
        }
        set(&mut config.eventsub.webhook_url, &self.webhook_url);
        set(&mut config.eventsub.webhook_secret, &self.webhook_secret);

        for name in &self.enable {
            config.collectors.toggles.insert(name.clone(), true);
        }
        for name in &self.disable {
            config.collectors.toggles.insert(name.clone(), false);
        }
        if self.disable_defaults {
            config.collectors.disable_defaults = true;
        }

        if let Some(timeout) = self.scrape_timeout_seconds {
            config.scrape.timeout_seconds = timeout;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
    }
}

/// Load exporter configuration from an optional file plus environment overrides
pub fn load_config(path: Option<&Path>) -> Result<ExporterConfig> {
    let mut builder = config::Config::builder();

    if let Some(path) = path {
        debug!("Loading configuration from {}", path.display());

        if !path.exists() {
            error!("Configuration file {} does not exist", path.display());
            return Err(ExporterError::Config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        let extension = match path.extension() {
            Some(ext) => ext.to_string_lossy().to_lowercase(),
            None => {
                error!("Configuration file has no extension");
                return Err(ExporterError::Config(format!(
                    "Configuration file has no extension: {}",
                    path.display()
                )));
            }
        };

        let format = match extension.as_str() {
            "toml" => config::FileFormat::Toml,
            "json" => config::FileFormat::Json,
            "yaml" | "yml" => config::FileFormat::Yaml,
            format => {
                error!("Unsupported configuration format: {}", format);
                return Err(ExporterError::Config(format!(
                    "Unsupported config format: {}",
                    format
                )));
            }
        };

        builder = builder.add_source(File::from(path).format(format));
    }

    let config = builder
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("twitch.channels")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| ExporterError::Config(e.to_string()))?;

    config
        .try_deserialize()
        .map_err(|e| ExporterError::Config(e.to_string()))
}

static RELOAD_SUCCESSFUL: LazyLock<Arc<Desc>> = LazyLock::new(|| {
    Desc::gauge(
        "exporter",
        "config_last_reload_successful",
        "Twitch exporter config loaded successfully.",
        &[],
    )
});

static RELOAD_TIMESTAMP: LazyLock<Arc<Desc>> = LazyLock::new(|| {
    Desc::gauge(
        "exporter",
        "config_last_reload_success_timestamp_seconds",
        "Timestamp of the last successful configuration reload.",
        &[],
    )
});

#[derive(Debug, Default)]
struct ReloadStatus {
    successful: bool,
    last_success: Option<f64>,
}

/// Reloadable configuration holder
///
/// A failed reload keeps serving the previous configuration.
#[derive(Debug)]
pub struct SafeConfig {
    path: Option<PathBuf>,
    overrides: ConfigOverrides,
    current: RwLock<Arc<ExporterConfig>>,
    status: Mutex<ReloadStatus>,
}

impl SafeConfig {
    /// Perform the initial load; any error here is fatal to the caller
    pub fn load(path: Option<PathBuf>, overrides: ConfigOverrides) -> Result<Self> {
        let config = Self::read(path.as_deref(), &overrides)?;
        let safe = Self {
            path,
            overrides,
            current: RwLock::new(Arc::new(config)),
            status: Mutex::new(ReloadStatus::default()),
        };
        safe.record(true);
        Ok(safe)
    }

    /// Wrap an already built configuration
    pub fn from_config(config: ExporterConfig) -> Self {
        let safe = Self {
            path: None,
            overrides: ConfigOverrides::default(),
            current: RwLock::new(Arc::new(config)),
            status: Mutex::new(ReloadStatus::default()),
        };
        safe.record(true);
        safe
    }

    fn read(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<ExporterConfig> {
        let mut config = load_config(path)?;
        overrides.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn record(&self, successful: bool) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        status.successful = successful;
        if successful {
            status.last_success = Some(chrono::Utc::now().timestamp_millis() as f64 / 1000.0);
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn current(&self) -> Arc<ExporterConfig> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Re-read the file and overrides, swapping the result in if it validates
    pub fn reload(&self) -> Result<Arc<ExporterConfig>> {
        let config = self.stage()?;
        Ok(self.commit(config))
    }

    /// Re-read the file and overrides without applying the result
    ///
    /// A read or validation failure is recorded as a failed reload. Callers
    /// with further steps that can fail finish them before [`commit`], and
    /// call [`record_failure`] if they do not succeed.
    ///
    /// [`commit`]: SafeConfig::commit
    /// [`record_failure`]: SafeConfig::record_failure
    pub fn stage(&self) -> Result<ExporterConfig> {
        Self::read(self.path.as_deref(), &self.overrides).map_err(|e| {
            self.record_failure();
            error!("Error reloading config: {}", e);
            e
        })
    }

    /// Swap in a staged configuration and mark the reload successful
    pub fn commit(&self, config: ExporterConfig) -> Arc<ExporterConfig> {
        let config = Arc::new(config);
        {
            let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
            *guard = Arc::clone(&config);
        }
        self.record(true);
        info!("Configuration reloaded");
        config
    }

    /// Mark the latest reload attempt as failed; the current config stays
    pub fn record_failure(&self) {
        self.record(false);
    }

    /// Reload status gauges
    pub fn samples(&self) -> Vec<Sample> {
        let status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        let mut samples = vec![Sample::new(
            &RELOAD_SUCCESSFUL,
            if status.successful { 1.0 } else { 0.0 },
            &[],
        )];
        if let Some(ts) = status.last_success {
            samples.push(Sample::new(&RELOAD_TIMESTAMP, ts, &[]));
        }
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(extension: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(&format!(".{}", extension))
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    const YAML: &str = r#"
twitch:
  client-id: abc
  client-secret: shh
  channels:
    - alice
    - bob
collectors:
  disable-defaults: true
  toggles:
    channel_up: true
scrape:
  timeout-seconds: 5
log-level: debug
"#;

    #[test]
    fn loads_yaml_with_defaults() {
        let file = write_config("yaml", YAML);
        let config = load_config(Some(file.path())).unwrap();

        assert_eq!(config.twitch.client_id, "abc");
        assert_eq!(config.twitch.channels, vec!["alice", "bob"]);
        assert!(config.collectors.disable_defaults);
        assert_eq!(config.collectors.toggles.get("channel_up"), Some(&true));
        assert_eq!(config.scrape.deadline(), Some(Duration::from_secs(5)));
        assert_eq!(config.cache.ttl(), Duration::from_secs(1800));
        assert_eq!(config.log_level, LogLevel::Debug);
        assert!(!config.eventsub.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_unknown_extension_and_missing_file() {
        let file = write_config("ini2", "x = 1");
        assert!(matches!(load_config(Some(file.path())), Err(ExporterError::Config(_))));
        assert!(matches!(
            load_config(Some(Path::new("/nonexistent/twitch.yaml"))),
            Err(ExporterError::Config(_))
        ));
    }

    #[test]
    fn overrides_win_and_channels_are_appended() {
        let file = write_config("yaml", YAML);
        let mut config = load_config(Some(file.path())).unwrap();
        ConfigOverrides {
            client_id: Some("flag-id".to_string()),
            channels: vec!["bob".to_string(), "carol".to_string(), String::new()],
            disable: vec!["channel_up".to_string()],
            log_level: Some(LogLevel::Warn),
            ..Default::default()
        }
        .apply(&mut config);

        assert_eq!(config.twitch.client_id, "flag-id");
        assert_eq!(config.twitch.channels, vec!["alice", "bob", "carol"]);
        assert_eq!(config.collectors.toggles.get("channel_up"), Some(&false));
        assert_eq!(config.log_level, LogLevel::Warn);
    }

    #[test]
    fn validation_errors() {
        let mut config = ExporterConfig::default();
        assert!(config.validate().unwrap_err().to_string().contains("client id"));

        config.twitch.client_id = "abc".to_string();
        config.twitch.client_secret = Some(String::new());
        assert!(config.validate().unwrap_err().to_string().contains("client secret or access token"));

        config.twitch.access_token = Some("user-token".to_string());
        config.validate().unwrap();

        config.eventsub.enabled = true;
        config.eventsub.webhook_url = "https://example.com/eventsub".to_string();
        assert!(config.validate().is_err());
        config.eventsub.webhook_secret = "s3cret".to_string();
        assert!(config.validate().unwrap_err().to_string().contains("client secret"));
        config.twitch.client_secret = Some("shh".to_string());
        config.validate().unwrap();
    }

    #[test]
    fn failed_reload_keeps_previous_config() {
        let file = write_config("yaml", YAML);
        let safe = SafeConfig::load(Some(file.path().to_path_buf()), ConfigOverrides::default()).unwrap();
        assert_eq!(safe.samples()[0].value, 1.0);

        std::fs::write(file.path(), "twitch:\n  channels: [alice]\n").unwrap();
        assert!(safe.reload().is_err());
        assert_eq!(safe.current().twitch.client_id, "abc");

        let samples = safe.samples();
        assert_eq!(samples[0].desc.fq_name, "twitch_exporter_config_last_reload_successful");
        assert_eq!(samples[0].value, 0.0);
        assert_eq!(
            samples[1].desc.fq_name,
            "twitch_exporter_config_last_reload_success_timestamp_seconds"
        );

        std::fs::write(file.path(), YAML.replace("alice", "dave")).unwrap();
        let reloaded = safe.reload().unwrap();
        assert_eq!(reloaded.twitch.channels, vec!["dave", "bob"]);
        assert_eq!(safe.samples()[0].value, 1.0);
    }

    #[test]
    fn staged_config_is_invisible_until_committed() {
        let file = write_config("yaml", YAML);
        let safe = SafeConfig::load(Some(file.path().to_path_buf()), ConfigOverrides::default()).unwrap();

        std::fs::write(file.path(), YAML.replace("alice", "dave")).unwrap();
        let staged = safe.stage().unwrap();
        assert_eq!(staged.twitch.channels, vec!["dave", "bob"]);
        assert_eq!(safe.current().twitch.channels, vec!["alice", "bob"]);

        safe.record_failure();
        assert_eq!(safe.samples()[0].value, 0.0);
        assert_eq!(safe.current().twitch.channels, vec!["alice", "bob"]);

        safe.commit(staged);
        assert_eq!(safe.current().twitch.channels, vec!["dave", "bob"]);
        assert_eq!(safe.samples()[0].value, 1.0);
    }
}
