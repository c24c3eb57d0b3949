//! Harvester configuration, the data-source registry and job reconciliation
//! against an external scheduler.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use tokio::fs;
use vhar_core::HarvestError;
use vhar_scheduler::{HttpMethod, JobNamespace};

mod reconcile;

pub use reconcile::{PruneReport, ReconcileReport, Reconciler};

pub const CRATE_NAME: &str = "vhar-sync";

/// Placeholders an endpoint template may carry.
pub const PLACEHOLDERS: [&str; 5] = ["lat", "lon", "date", "polygon", "apiKey"];

/// Parses `"500ms"`, `"2s"`, `"5m"`, `"1h"`. A bare number is seconds.
pub fn parse_duration(input: &str) -> vhar_core::Result<Duration> {
    let raw = input.trim();
    let split = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| HarvestError::invalid(format!("invalid duration `{input}`")))?;
    match unit.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value.saturating_mul(60))),
        "h" => Ok(Duration::from_secs(value.saturating_mul(3600))),
        other => Err(HarvestError::invalid(format!(
            "invalid duration unit `{other}` in `{input}`"
        ))),
    }
}

fn de_duration<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn de_opt_duration<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error> {
    Option::<String>::deserialize(deserializer)?
        .map(|raw| parse_duration(&raw).map_err(serde::de::Error::custom))
        .transpose()
}

/// Lower-cases and replaces spaces with hyphens. Idempotent.
pub fn normalize_job_name(name: &str) -> String {
    name.to_lowercase().replace(' ', "-")
}

/// Substitutes supported `{placeholder}`s that have a value; anything else is
/// left in place.
pub fn resolve_placeholders(template: &str, values: &[(&str, &str)]) -> String {
    values
        .iter()
        .filter(|(key, _)| PLACEHOLDERS.contains(key))
        .fold(template.to_string(), |acc, (key, value)| {
            acc.replace(&format!("{{{key}}}"), value)
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(alias = "backoffInterval", deserialize_with = "de_duration")]
    pub backoff_base: Duration,
    #[serde(default, deserialize_with = "de_opt_duration")]
    pub max_backoff: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            max_backoff: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_base: Duration) -> Self {
        Self {
            max_retries,
            backoff_base,
            max_backoff: None,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Sleep between attempt `attempt_index` and the next: `base * 2^i`.
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        let delay = self.backoff_base.saturating_mul(factor);
        match self.max_backoff {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceConfig {
    /// Registry key; filled from the map key at load time.
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    pub schedule: String,
    #[serde(default)]
    pub time_zone: String,
    #[serde(default)]
    pub http_method: HttpMethod,
    pub endpoint: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl DataSourceConfig {
    pub fn new(name: impl Into<String>, schedule: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            schedule: schedule.into(),
            time_zone: String::new(),
            http_method: HttpMethod::Get,
            endpoint: endpoint.into(),
            headers: BTreeMap::new(),
            body: None,
            retry_policy: None,
            api_key: None,
            description: None,
        }
    }

    pub fn effective_retry_policy(&self) -> RetryPolicy {
        self.retry_policy.unwrap_or_default()
    }

    pub fn validate(&self) -> vhar_core::Result<()> {
        if normalize_job_name(self.name.trim()).is_empty() {
            return Err(HarvestError::invalid("data source name must not be empty"));
        }
        let fields = self.schedule.split_whitespace().count();
        if fields != 5 {
            return Err(HarvestError::invalid(format!(
                "source `{}`: schedule `{}` has {fields} fields, expected 5",
                self.name, self.schedule
            )));
        }
        if self.endpoint.trim().is_empty() {
            return Err(HarvestError::invalid(format!("source `{}`: endpoint is empty", self.name)));
        }
        Ok(())
    }
}

/// Enabled and disabled sources keyed by unique name.
#[derive(Debug, Clone, Default)]
pub struct DataSourceRegistry {
    sources: BTreeMap<String, DataSourceConfig>,
}

impl DataSourceRegistry {
    pub fn new(sources: impl IntoIterator<Item = DataSourceConfig>) -> Self {
        Self {
            sources: sources.into_iter().map(|s| (s.name.clone(), s)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&DataSourceConfig> {
        self.sources.get(name)
    }

    pub fn all(&self) -> impl Iterator<Item = &DataSourceConfig> {
        self.sources.values()
    }

    pub fn enabled(&self) -> impl Iterator<Item = &DataSourceConfig> {
        self.sources.values().filter(|s| s.enabled)
    }

    pub fn disabled(&self) -> impl Iterator<Item = &DataSourceConfig> {
        self.sources.values().filter(|s| !s.enabled)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionSettings {
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default = "default_parallelism")]
    pub parallel_ingestions: usize,
}

fn default_parallelism() -> usize {
    1
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            retry_policy: None,
            parallel_ingestions: default_parallelism(),
        }
    }
}

/// The harvester's YAML config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvesterConfig {
    #[serde(default)]
    pub app: AppSettings,
    #[serde(default)]
    pub scheduler: JobNamespace,
    #[serde(default)]
    pub data_sources: BTreeMap<String, DataSourceConfig>,
    #[serde(default)]
    pub ingestion_settings: IngestionSettings,
}

impl HarvesterConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing harvester config")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn parallelism(&self) -> usize {
        self.ingestion_settings.parallel_ingestions.max(1)
    }

    /// Names every source, applies the inherited retry policy and resolves
    /// `{apiKey}` in endpoints.
    ///
    /// Fails when two source names normalize to the same job id, since they
    /// would otherwise share one scheduler job.
    pub fn registry(&self) -> Result<DataSourceRegistry> {
        let mut job_ids: BTreeMap<String, &str> = BTreeMap::new();
        for name in self.data_sources.keys() {
            if let Some(first) = job_ids.insert(normalize_job_name(name), name) {
                anyhow::bail!(
                    "data sources `{first}` and `{name}` both map to job `{}`",
                    normalize_job_name(name)
                );
            }
        }

        let fallback = self.ingestion_settings.retry_policy.unwrap_or_default();
        Ok(DataSourceRegistry::new(self.data_sources.iter().map(|(name, source)| {
            let mut source = source.clone();
            source.name = name.clone();
            source.retry_policy = Some(source.retry_policy.unwrap_or(fallback));
            if let Some(key) = source.api_key.as_deref() {
                source.endpoint = resolve_placeholders(&source.endpoint, &[("apiKey", key)]);
            }
            source
        })))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerBackend {
    Cloud,
    Local,
    Memory,
}

impl FromStr for SchedulerBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cloud" => Ok(Self::Cloud),
            "local" => Ok(Self::Local),
            "memory" => Ok(Self::Memory),
            other => anyhow::bail!("unknown SCHEDULER_BACKEND `{other}` (expected cloud, local or memory)"),
        }
    }
}

/// Process settings read from the environment.
#[derive(Debug, Clone)]
pub struct HarvesterEnv {
    pub config_path: PathBuf,
    pub database_url: Option<String>,
    pub scheduler_backend: SchedulerBackend,
    pub scheduler_api_base: Option<String>,
    pub scheduler_access_token: Option<String>,
    pub blob_dir: PathBuf,
    /// Public prefix for stored imagery urls; unset means `file://` paths.
    pub blob_public_base: Option<String>,
    pub listen_addr: Option<String>,
}

impl HarvesterEnv {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let scheduler_backend = match non_empty("SCHEDULER_BACKEND") {
            Some(raw) => raw.parse()?,
            None => SchedulerBackend::Local,
        };
        Ok(Self {
            config_path: non_empty("CONFIG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config.yaml")),
            database_url: non_empty("DATABASE_URL"),
            scheduler_backend,
            scheduler_api_base: non_empty("SCHEDULER_API_BASE"),
            scheduler_access_token: non_empty("SCHEDULER_ACCESS_TOKEN"),
            blob_dir: non_empty("BLOB_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./blobs")),
            blob_public_base: non_empty("BLOB_PUBLIC_BASE"),
            listen_addr: non_empty("LISTEN_ADDR"),
        })
    }

    pub fn listen_addr_or(&self, port: u16) -> String {
        self.listen_addr.clone().unwrap_or_else(|| format!("0.0.0.0:{port}"))
    }
}

/// Backoff sleeps go through this so tests can observe them without waiting.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Records requested durations and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slept(&self) -> Vec<Duration> {
        self.slept.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut slept) = self.slept.lock() {
            slept.push(duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
app:
  port: 9090
  logLevel: debug
scheduler:
  projectId: vineyards-prod
  locationId: us-west1
dataSources:
  Satellite Imagery:
    enabled: true
    schedule: "0 2 * * *"
    timeZone: America/Los_Angeles
    httpMethod: POST
    endpoint: "https://imagery.example/v1/scenes?polygon={polygon}&key={apiKey}"
    apiKey: s3cret
    body: '{"kind":"image"}'
    description: nightly scene pull
  soil:
    enabled: false
    schedule: "0 6 * * 1"
    endpoint: "https://soil.example/samples?lat={lat}&lon={lon}"
    retryPolicy:
      maxRetries: 5
      backoffBase: 500ms
ingestionSettings:
  retryPolicy:
    maxRetries: 2
    backoffInterval: 2s
  parallelIngestions: 4
"#;

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize_job_name("Satellite Imagery Feed");
        assert_eq!(once, "satellite-imagery-feed");
        assert_eq!(normalize_job_name(&once), once);
    }

    #[test]
    fn durations_accept_common_suffixes() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("7").unwrap(), Duration::from_secs(7));
        assert!(parse_duration("2 fortnights").is_err());
        assert!(parse_duration("s").is_err());
    }

    #[test]
    fn backoff_doubles_from_the_base() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        let delays: Vec<_> = (0..3).map(|i| policy.delay_for_attempt(i)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
        assert_eq!(policy.max_attempts(), 4);

        let capped = RetryPolicy {
            max_backoff: Some(Duration::from_millis(150)),
            ..policy
        };
        assert_eq!(capped.delay_for_attempt(2), Duration::from_millis(150));
    }

    #[test]
    fn placeholders_without_values_survive() {
        let out = resolve_placeholders(
            "https://x/{lat},{lon}/{date}?k={apiKey}&u={unknown}",
            &[("lat", "38.29"), ("lon", "-122.45"), ("unknown", "nope")],
        );
        assert_eq!(out, "https://x/38.29,-122.45/{date}?k={apiKey}&u={unknown}");
    }

    #[test]
    fn config_builds_a_named_registry_with_inherited_retry() {
        let config = HarvesterConfig::from_yaml_str(CONFIG).unwrap();
        assert_eq!(config.app.port, 9090);
        assert_eq!(config.parallelism(), 4);
        assert_eq!(config.scheduler.parent(), "projects/vineyards-prod/locations/us-west1");

        let registry = config.registry().unwrap();
        assert_eq!(registry.len(), 2);
        let enabled: Vec<_> = registry.enabled().map(|s| s.name.as_str()).collect();
        assert_eq!(enabled, vec!["Satellite Imagery"]);

        let imagery = registry.get("Satellite Imagery").unwrap();
        assert_eq!(imagery.http_method, HttpMethod::Post);
        assert_eq!(imagery.endpoint, "https://imagery.example/v1/scenes?polygon={polygon}&key=s3cret");
        assert_eq!(imagery.effective_retry_policy(), RetryPolicy::new(2, Duration::from_secs(2)));
        assert_eq!(imagery.description.as_deref(), Some("nightly scene pull"));

        let soil = registry.get("soil").unwrap();
        assert_eq!(soil.http_method, HttpMethod::Get);
        assert_eq!(soil.effective_retry_policy(), RetryPolicy::new(5, Duration::from_millis(500)));
    }

    #[test]
    fn retry_defaults_apply_without_any_policy() {
        let config = HarvesterConfig::from_yaml_str(
            "dataSources:\n  weather:\n    enabled: true\n    schedule: '0 * * * *'\n    endpoint: https://w.example\n",
        )
        .unwrap();
        let weather = config.registry().unwrap().get("weather").cloned().unwrap();
        assert_eq!(weather.effective_retry_policy(), RetryPolicy::new(3, Duration::from_secs(1)));
        assert_eq!(config.parallelism(), 1);
    }

    #[test]
    fn names_sharing_a_job_id_are_rejected() {
        let config = HarvesterConfig::from_yaml_str(
            "dataSources:\n  Canopy Sensors:\n    enabled: true\n    schedule: '0 * * * *'\n    endpoint: https://a.example\n  canopy sensors:\n    enabled: true\n    schedule: '30 * * * *'\n    endpoint: https://b.example\n",
        )
        .unwrap();
        let err = config.registry().unwrap_err().to_string();
        assert!(err.contains("canopy-sensors"), "{err}");
    }

    #[tokio::test]
    async fn config_loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, CONFIG).unwrap();
        let config = HarvesterConfig::load(&path).await.unwrap();
        assert_eq!(config.data_sources.len(), 2);
        assert!(HarvesterConfig::load(&dir.path().join("missing.yaml")).await.is_err());
    }

    #[test]
    fn shipped_example_config_is_valid() {
        let text = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/../../config.example.yaml"));
        let registry = HarvesterConfig::from_yaml_str(text).unwrap().registry().unwrap();
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.disabled().count(), 1);
        for source in registry.all() {
            source.validate().unwrap();
        }
    }

    #[test]
    fn validation_rejects_bad_schedules_and_endpoints() {
        assert!(DataSourceConfig::new("weather", "0 * * * *", "https://w.example").validate().is_ok());
        assert!(DataSourceConfig::new("weather", "0 0 * * * *", "https://w.example").validate().is_err());
        assert!(DataSourceConfig::new("weather", "0 * * * *", "  ").validate().is_err());
        assert!(DataSourceConfig::new("", "0 * * * *", "https://w.example").validate().is_err());
    }

    #[test]
    fn env_lookup_defaults_and_rejects_unknown_backends() {
        let env = HarvesterEnv::from_lookup(|_| None).unwrap();
        assert_eq!(env.scheduler_backend, SchedulerBackend::Local);
        assert_eq!(env.config_path, PathBuf::from("config.yaml"));
        assert_eq!(env.listen_addr_or(8081), "0.0.0.0:8081");
        assert_eq!(env.blob_public_base, None);

        let env = HarvesterEnv::from_lookup(|k| match k {
            "SCHEDULER_BACKEND" => Some("Cloud".into()),
            "LISTEN_ADDR" => Some("127.0.0.1:3000".into()),
            "BLOB_PUBLIC_BASE" => Some("https://cdn.example/imagery".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(env.scheduler_backend, SchedulerBackend::Cloud);
        assert_eq!(env.listen_addr_or(8081), "127.0.0.1:3000");
        assert_eq!(env.blob_public_base.as_deref(), Some("https://cdn.example/imagery"));

        assert!(HarvesterEnv::from_lookup(|k| (k == "SCHEDULER_BACKEND").then(|| "k8s".to_string())).is_err());
    }
}
