//! Configuration loading, validation, and hot-reload.
//!
//! The on-disk YAML file is one concrete "config provider" collaborator: it
//! supplies the initial backend descriptor set at startup and, via the file
//! watcher, feeds diffs into the registry's `apply_update` as the file
//! changes on disk. The registry itself is the only thing that owns the
//! live, versioned view afterward.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use std::time::Duration;

use crate::registry::{AtomicRegistry, BackendDescriptor, RetryPolicy, TransportSpec};

static DOTENV_ONCE: Once = Once::new();

/// Load `~/.env` into the process environment exactly once.
pub fn load_dotenv() {
    DOTENV_ONCE.call_once(|| {
        let env_path = dirs::home_dir()
            .map(|h| h.join(".env"))
            .filter(|p| p.is_file());
        if let Some(env_file) = env_path
            && let Ok(contents) = std::fs::read_to_string(&env_file)
        {
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    // SAFETY: called at most once (`Once`), before any
                    // concurrent task reads the environment.
                    unsafe { std::env::set_var(key.trim(), value.trim()) };
                }
            }
        }
    });
}

/// Directory under the user's home used for cache files and defaults.
pub fn only1mcp_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".only1mcp")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_virtual_nodes() -> usize {
    160
}

fn default_drain_timeout_secs() -> u64 {
    10
}

fn default_cancel_grace_ms() -> u64 {
    2_000
}

/// Top-level only1mcp configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Address the HTTP ingress listens on (`POST/GET /mcp`).
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default)]
    pub secrets: SecretsConfig,

    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    /// Custom cache file location. Default: ~/.only1mcp/cache.json
    #[serde(default)]
    pub cache_path: Option<PathBuf>,

    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            listen: default_listen(),
            secrets: SecretsConfig::default(),
            backends: HashMap::new(),
            health: HealthConfig::default(),
            router: RouterConfig::default(),
            admin: AdminConfig::default(),
            cache_path: None,
            drain_timeout_secs: default_drain_timeout_secs(),
            cancel_grace_ms: default_cancel_grace_ms(),
        }
    }
}

/// Secrets resolution configuration (§6's "Secret resolver" collaborator).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// Fail startup if a `secretref:` cannot be resolved, instead of leaving
    /// the literal reference in place.
    #[serde(default)]
    pub strict: bool,
}

/// Request routing policy configuration (C3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_policy")]
    pub policy: String,
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,
    #[serde(default = "default_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub failure_threshold: u32,
    #[serde(default)]
    pub success_threshold: u32,
    #[serde(default = "default_circuit_open_secs")]
    pub circuit_open_secs: u64,
}

fn default_policy() -> String {
    "consistent_hash".to_string()
}
fn default_retries() -> u32 {
    3
}
fn default_circuit_open_secs() -> u64 {
    30
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            policy: default_policy(),
            virtual_nodes: default_virtual_nodes(),
            max_retries: default_retries(),
            failure_threshold: 5,
            success_threshold: 2,
            circuit_open_secs: default_circuit_open_secs(),
        }
    }
}

/// Health monitor polling configuration (external collaborator, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(with = "humantime_duration", default = "default_health_interval")]
    pub interval: Duration,
    #[serde(with = "humantime_duration", default = "default_idle_timeout")]
    pub idle_timeout: Duration,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_restart_initial_backoff")]
    #[serde(with = "humantime_duration")]
    pub restart_initial_backoff: Duration,
    #[serde(default = "default_restart_max_backoff")]
    #[serde(with = "humantime_duration")]
    pub restart_max_backoff: Duration,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(with = "humantime_duration", default = "default_restart_window")]
    pub restart_window: Duration,
}

fn default_health_interval() -> Duration {
    Duration::from_secs(15)
}
fn default_idle_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_restart_initial_backoff() -> Duration {
    Duration::from_secs(1)
}
fn default_restart_max_backoff() -> Duration {
    Duration::from_secs(60)
}
fn default_max_restarts() -> u32 {
    10
}
fn default_restart_window() -> Duration {
    Duration::from_secs(600)
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: default_health_interval(),
            idle_timeout: default_idle_timeout(),
            failure_threshold: default_failure_threshold(),
            restart_initial_backoff: default_restart_initial_backoff(),
            restart_max_backoff: default_restart_max_backoff(),
            max_restarts: default_max_restarts(),
            restart_window: default_restart_window(),
        }
    }
}

/// Minimal admin HTTP surface configuration (off by default; see SPEC_FULL §11).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_admin_listen")]
    pub listen: String,
}

fn default_admin_listen() -> String {
    "127.0.0.1:9090".to_string()
}

/// Per-backend configuration as read from YAML; converted into a
/// [`BackendDescriptor`] by [`Config::to_descriptors`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum BackendConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        cwd: Option<String>,
        /// CPU-seconds cap applied to the child before exec (unix only).
        #[serde(default)]
        cpu_seconds: Option<u64>,
        /// Resident memory cap in bytes applied to the child before exec
        /// (unix only).
        #[serde(default)]
        memory_bytes: Option<u64>,
        #[serde(default)]
        priority: i32,
        #[serde(default = "default_weight")]
        weight: u32,
        #[serde(with = "humantime_duration", default = "default_timeout")]
        timeout: Duration,
        #[serde(default)]
        retry: RetryConfig,
        auth_ref: Option<String>,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        event_stream: bool,
        #[serde(default)]
        priority: i32,
        #[serde(default = "default_weight")]
        weight: u32,
        #[serde(with = "humantime_duration", default = "default_timeout")]
        timeout: Duration,
        #[serde(default)]
        retry: RetryConfig,
        auth_ref: Option<String>,
    },
    Sse {
        control_url: String,
        event_url: String,
        #[serde(default)]
        priority: i32,
        #[serde(default = "default_weight")]
        weight: u32,
        #[serde(with = "humantime_duration", default = "default_timeout")]
        timeout: Duration,
        #[serde(default)]
        retry: RetryConfig,
        auth_ref: Option<String>,
    },
}

fn default_weight() -> u32 {
    100
}
fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_retries")]
    pub max_retries: u32,
    #[serde(with = "humantime_duration", default = "default_initial_backoff")]
    pub initial_backoff: Duration,
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
    #[serde(with = "humantime_duration", default = "default_max_backoff")]
    pub max_backoff: Duration,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(100)
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_backoff() -> Duration {
    Duration::from_secs(5)
}
fn default_jitter() -> f64 {
    0.15
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_retries(),
            initial_backoff: default_initial_backoff(),
            multiplier: default_backoff_multiplier(),
            max_backoff: default_max_backoff(),
            jitter: default_jitter(),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(c: &RetryConfig) -> Self {
        RetryPolicy {
            max_retries: c.max_retries,
            initial_backoff: c.initial_backoff,
            multiplier: c.multiplier,
            max_backoff: c.max_backoff,
            jitter: c.jitter,
        }
    }
}

impl Config {
    /// Load, apply `${VAR}` environment interpolation, and parse.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let expanded = shellexpand::env(&raw)
            .with_context(|| "expanding environment variables in config")?;
        let config: Config = serde_yaml_ng::from_str(&expanded)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, backend) in &self.backends {
            match backend {
                BackendConfig::Stdio { command, .. } if command.trim().is_empty() => {
                    bail!("backend '{name}': stdio transport requires a non-empty command");
                }
                BackendConfig::Http { url, .. } | BackendConfig::Sse { control_url: url, .. }
                    if url.trim().is_empty() =>
                {
                    bail!("backend '{name}': transport requires a non-empty URL");
                }
                _ => {}
            }
        }
        if !matches!(
            self.router.policy.as_str(),
            "consistent_hash" | "least_connections" | "round_robin" | "random" | "weighted_random"
        ) {
            bail!("unknown router policy: {}", self.router.policy);
        }
        Ok(())
    }

    /// Convert the configured backend table into descriptors ready for
    /// `apply_update`, resolving `secretref:` auth material lazily (the
    /// reference itself, never the secret, lives on the descriptor).
    pub fn to_descriptors(&self) -> Vec<BackendDescriptor> {
        self.backends
            .iter()
            .map(|(name, cfg)| backend_config_to_descriptor(name, cfg))
            .collect()
    }
}

fn backend_config_to_descriptor(name: &str, cfg: &BackendConfig) -> BackendDescriptor {
    match cfg {
        BackendConfig::Stdio {
            command,
            args,
            env,
            cwd,
            cpu_seconds,
            memory_bytes,
            priority,
            weight,
            timeout,
            retry,
            auth_ref,
        } => BackendDescriptor {
            id: name.to_string(),
            display_name: name.to_string(),
            transport: TransportSpec::Stdio {
                command: command.clone(),
                args: args.clone(),
                env: env.clone(),
                cwd: cwd.clone(),
                resource_limits: crate::registry::ResourceLimits {
                    cpu_seconds: *cpu_seconds,
                    memory_bytes: *memory_bytes,
                },
            },
            tool_names: Vec::new(),
            priority: *priority,
            weight: *weight,
            timeout: *timeout,
            retry: RetryPolicy::from(retry),
            auth_ref: auth_ref.clone(),
        },
        BackendConfig::Http {
            url,
            headers,
            event_stream,
            priority,
            weight,
            timeout,
            retry,
            auth_ref,
        } => BackendDescriptor {
            id: name.to_string(),
            display_name: name.to_string(),
            transport: TransportSpec::Http {
                url: url.clone(),
                headers: headers.clone(),
                event_stream: *event_stream,
            },
            tool_names: Vec::new(),
            priority: *priority,
            weight: *weight,
            timeout: *timeout,
            retry: RetryPolicy::from(retry),
            auth_ref: auth_ref.clone(),
        },
        BackendConfig::Sse {
            control_url,
            event_url,
            priority,
            weight,
            timeout,
            retry,
            auth_ref,
        } => BackendDescriptor {
            id: name.to_string(),
            display_name: name.to_string(),
            transport: TransportSpec::LegacySse {
                control_url: control_url.clone(),
                event_url: event_url.clone(),
            },
            tool_names: Vec::new(),
            priority: *priority,
            weight: *weight,
            timeout: *timeout,
            retry: RetryPolicy::from(retry),
            auth_ref: auth_ref.clone(),
        },
    }
}

/// Diff between two backend-name sets, used to drive incremental
/// transport startup/teardown when the config file changes on disk.
#[derive(Debug, Default, PartialEq)]
pub struct ConfigDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl Config {
    pub fn diff_backends(&self, other: &Config) -> ConfigDiff {
        let mut diff = ConfigDiff::default();
        for name in self.backends.keys() {
            if !other.backends.contains_key(name) {
                diff.removed.push(name.clone());
            }
        }
        for (name, cfg) in &other.backends {
            match self.backends.get(name) {
                None => diff.added.push(name.clone()),
                Some(existing) if existing != cfg => diff.changed.push(name.clone()),
                _ => {}
            }
        }
        diff
    }
}

/// Watch the config file for changes, debounce rapid-fire events, and feed
/// the resulting diff into the registry's hot-swap entry point.
pub async fn watch_config(
    path: PathBuf,
    registry: Arc<AtomicRegistry>,
    shutdown: Arc<tokio::sync::Notify>,
) {
    use notify::{RecursiveMode, Watcher};
    use tokio::sync::mpsc;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            let _ = tx.send(event);
        }
    }) {
        Ok(w) => w,
        Err(e) => {
            tracing::error!(error = %e, "failed to start config watcher");
            return;
        }
    };

    if let Some(parent) = path.parent() {
        if let Err(e) = watcher.watch(parent, RecursiveMode::NonRecursive) {
            tracing::error!(error = %e, "failed to watch config directory");
            return;
        }
    }

    let mut last_config = match Config::load(&path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load initial config for watcher");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                tracing::info!("config watcher shutting down");
                return;
            }
            event = rx.recv() => {
                if event.is_none() {
                    return;
                }
                // Drain any further rapid-fire events within the debounce window.
                tokio::time::sleep(Duration::from_millis(500)).await;
                while rx.try_recv().is_ok() {}

                match Config::load(&path) {
                    Ok(new_config) => {
                        let diff = last_config.diff_backends(&new_config);
                        if diff.added.is_empty() && diff.removed.is_empty() && diff.changed.is_empty() {
                            continue;
                        }
                        tracing::info!(
                            added = diff.added.len(),
                            removed = diff.removed.len(),
                            changed = diff.changed.len(),
                            "config changed, applying hot-swap update"
                        );
                        let proposed = new_config.to_descriptors();
                        match registry.apply_update(proposed, Default::default()).await {
                            Ok(generation) => {
                                tracing::info!(generation, "registry updated from config reload");
                                last_config = new_config;
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "rejected config reload");
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to reload config, keeping previous generation");
                    }
                }
            }
        }
    }
}

/// `serde(with = ...)` module for `Duration` as humantime-style strings
/// (`"500ms"`, `"30s"`, `"5m"`).
mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        if d.as_millis() % 1000 != 0 {
            s.serialize_str(&format!("{}ms", d.as_millis()))
        } else {
            s.serialize_str(&format!("{}s", d.as_secs()))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    fn parse(raw: &str) -> Result<Duration, String> {
        let raw = raw.trim();
        let (num, suffix) = raw
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .map(|idx| raw.split_at(idx))
            .ok_or_else(|| format!("duration '{raw}' missing unit suffix"))?;
        let value: f64 = num
            .parse()
            .map_err(|_| format!("invalid duration number in '{raw}'"))?;
        let secs = match suffix {
            "ms" => value / 1000.0,
            "s" => value,
            "m" => value * 60.0,
            "h" => value * 3600.0,
            other => return Err(format!("unknown duration suffix '{other}' in '{raw}'")),
        };
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let f = write_temp(
            r#"
backends:
  echo:
    transport: stdio
    command: /bin/echo
"#,
        );
        let config = Config::load(f.path()).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.backends.len(), 1);
        assert_eq!(config.router.policy, "consistent_hash");
    }

    #[test]
    fn http_backend_parses() {
        let f = write_temp(
            r#"
backends:
  search:
    transport: http
    url: "http://localhost:9001/mcp"
    event_stream: true
"#,
        );
        let config = Config::load(f.path()).unwrap();
        match config.backends.get("search").unwrap() {
            BackendConfig::Http { url, event_stream, .. } => {
                assert_eq!(url, "http://localhost:9001/mcp");
                assert!(event_stream);
            }
            other => panic!("expected http backend, got {other:?}"),
        }
    }

    #[test]
    fn validation_rejects_empty_command() {
        let f = write_temp(
            r#"
backends:
  broken:
    transport: stdio
    command: ""
"#,
        );
        assert!(Config::load(f.path()).is_err());
    }

    #[test]
    fn validation_rejects_unknown_policy() {
        let f = write_temp(
            r#"
router:
  policy: quantum_random
backends: {}
"#,
        );
        assert!(Config::load(f.path()).is_err());
    }

    #[test]
    fn diff_backends_detects_added_removed_changed() {
        let mut before = Config::default();
        before.backends.insert(
            "a".into(),
            BackendConfig::Stdio {
                command: "echo".into(),
                args: vec![],
                env: HashMap::new(),
                cwd: None,
                cpu_seconds: None,
                memory_bytes: None,
                priority: 0,
                weight: 100,
                timeout: default_timeout(),
                retry: RetryConfig::default(),
                auth_ref: None,
            },
        );
        let mut after = before.clone();
        after.backends.get_mut("a").map(|b| {
            if let BackendConfig::Stdio { priority, .. } = b {
                *priority = 10;
            }
        });
        after.backends.insert(
            "b".into(),
            BackendConfig::Stdio {
                command: "cat".into(),
                args: vec![],
                env: HashMap::new(),
                cwd: None,
                cpu_seconds: None,
                memory_bytes: None,
                priority: 0,
                weight: 100,
                timeout: default_timeout(),
                retry: RetryConfig::default(),
                auth_ref: None,
            },
        );
        let diff = before.diff_backends(&after);
        assert_eq!(diff.added, vec!["b".to_string()]);
        assert_eq!(diff.changed, vec!["a".to_string()]);
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn retry_config_defaults_match_spec() {
        let retry = RetryConfig::default();
        assert_eq!(retry.initial_backoff, Duration::from_millis(100));
        assert_eq!(retry.multiplier, 2.0);
        assert_eq!(retry.max_backoff, Duration::from_secs(5));
        assert_eq!(retry.jitter, 0.15);
    }

    #[test]
    fn duration_suffixes_parse() {
        let f = write_temp(
            r#"
health:
  interval: 30s
  idle_timeout: 2m
backends: {}
"#,
        );
        let config = Config::load(f.path()).unwrap();
        assert_eq!(config.health.interval, Duration::from_secs(30));
        assert_eq!(config.health.idle_timeout, Duration::from_secs(120));
    }
}
