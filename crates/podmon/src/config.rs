//! Monitor configuration
//!
//! Values are layered: defaults, then the optional config file, then
//! `PODMON_*` environment variables, then command-line flags.

use anyhow::{bail, Context, Result};
use podmon_lib::{OverflowPolicy, ReconnectPolicy, Scope};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::cli::Cli;

/// What the alert queue does when it is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowMode {
    Block,
    #[default]
    BlockWithTimeout,
    DropNewest,
}

/// Monitor configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PodmonConfig {
    /// Namespaces to watch; empty means all namespaces
    #[serde(default)]
    pub namespaces: Vec<String>,

    /// Annotation key prefix that opts a pod into alerting
    #[serde(default)]
    pub annotation_prefix: String,

    /// Name of this instance in structured logs
    #[serde(default = "default_instance")]
    pub instance: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Alerts buffered between monitors and the notifier
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub overflow: OverflowMode,

    /// Wait for queue space under `block_with_timeout`, in seconds
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,

    #[serde(default = "default_initial_backoff_ms")]
    pub reconnect_initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub reconnect_max_backoff_ms: u64,

    /// Explicit kubeconfig; in-cluster or default config otherwise
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,
}

fn default_instance() -> String {
    std::env::var("POD_NAME").unwrap_or_else(|_| "podmon".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_queue_capacity() -> usize {
    podmon_lib::sink::DEFAULT_QUEUE_CAPACITY
}

fn default_send_timeout_secs() -> u64 {
    podmon_lib::sink::DEFAULT_SEND_TIMEOUT.as_secs()
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl PodmonConfig {
    /// Load configuration from the config file, environment and flags
    pub fn load(cli: &Cli) -> Result<Self> {
        Self::load_with_env(cli, None)
    }

    /// Load with `env` standing in for the process environment when given
    fn load_with_env(cli: &Cli, env: Option<config::Map<String, String>>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = &cli.config {
            builder = builder.add_source(config::File::from(path.clone()).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("PODMON")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("namespaces")
                    .source(env),
            )
            .build()
            .context("Failed to read podmon configuration")?;

        let mut config: PodmonConfig = config
            .try_deserialize()
            .context("Invalid podmon configuration")?;
        config.apply_cli(cli);
        config.validate()?;

        Ok(config)
    }

    /// Command-line flags win over file and environment values
    pub fn apply_cli(&mut self, cli: &Cli) {
        if cli.all_namespaces {
            self.namespaces.clear();
        } else if !cli.namespaces.is_empty() {
            self.namespaces = cli.namespaces.clone();
        }
        if let Some(prefix) = &cli.annotation_prefix {
            self.annotation_prefix = prefix.clone();
        }
        if let Some(path) = &cli.kubeconfig {
            self.kubeconfig = Some(path.clone());
        }
        if let Some(port) = cli.api_port {
            self.api_port = port;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.annotation_prefix.is_empty() {
            bail!("An annotation prefix is required (--annotation or PODMON_ANNOTATION_PREFIX)");
        }
        if self.queue_capacity == 0 {
            bail!("queue_capacity must be at least 1");
        }
        if self.overflow == OverflowMode::BlockWithTimeout && self.send_timeout_secs == 0 {
            bail!("send_timeout_secs must be positive with the block_with_timeout policy");
        }
        if self.reconnect_initial_backoff_ms > self.reconnect_max_backoff_ms {
            bail!(
                "reconnect_initial_backoff_ms ({}) exceeds reconnect_max_backoff_ms ({})",
                self.reconnect_initial_backoff_ms,
                self.reconnect_max_backoff_ms
            );
        }
        Ok(())
    }

    /// One scope per configured namespace, or all namespaces
    pub fn scopes(&self) -> Vec<Scope> {
        let mut scopes: Vec<Scope> = Vec::new();
        for ns in &self.namespaces {
            let scope = Scope::from_namespace(Some(ns));
            if !scopes.contains(&scope) {
                scopes.push(scope);
            }
        }

        if scopes.is_empty() || scopes.contains(&Scope::AllNamespaces) {
            return vec![Scope::AllNamespaces];
        }
        scopes
    }

    pub fn overflow_policy(&self) -> OverflowPolicy {
        match self.overflow {
            OverflowMode::Block => OverflowPolicy::Block,
            OverflowMode::BlockWithTimeout => {
                OverflowPolicy::BlockWithTimeout(Duration::from_secs(self.send_timeout_secs))
            }
            OverflowMode::DropNewest => OverflowPolicy::DropNewest,
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_backoff: Duration::from_millis(self.reconnect_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.reconnect_max_backoff_ms),
            ..ReconnectPolicy::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_json(json: &str) -> PodmonConfig {
        config::Config::builder()
            .add_source(config::File::from_str(json, config::FileFormat::Json))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = from_json(r#"{"annotation_prefix": "alert."}"#);

        assert_eq!(config.api_port, 8080);
        assert_eq!(config.queue_capacity, 256);
        assert_eq!(
            config.overflow_policy(),
            OverflowPolicy::BlockWithTimeout(Duration::from_secs(10))
        );
        assert_eq!(config.reconnect_policy().initial_backoff, Duration::from_millis(500));
        assert_eq!(config.reconnect_policy().max_backoff, Duration::from_secs(30));
        assert_eq!(config.scopes(), vec![Scope::AllNamespaces]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_prefix_rejected() {
        let config = from_json("{}");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_namespaces_become_scopes() {
        let config = from_json(
            r#"{"annotation_prefix": "a", "namespaces": ["payments", "payments", "search"]}"#,
        );
        assert_eq!(
            config.scopes(),
            vec![
                Scope::Namespace("payments".to_string()),
                Scope::Namespace("search".to_string()),
            ]
        );
    }

    #[test]
    fn test_empty_namespace_means_all() {
        let config = from_json(r#"{"annotation_prefix": "a", "namespaces": ["payments", ""]}"#);
        assert_eq!(config.scopes(), vec![Scope::AllNamespaces]);
    }

    #[test]
    fn test_overflow_modes() {
        let config = from_json(r#"{"annotation_prefix": "a", "overflow": "drop_newest"}"#);
        assert_eq!(config.overflow_policy(), OverflowPolicy::DropNewest);

        let config = from_json(r#"{"annotation_prefix": "a", "overflow": "block"}"#);
        assert_eq!(config.overflow_policy(), OverflowPolicy::Block);
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = from_json(
            r#"{"annotation_prefix": "file.", "namespaces": ["payments"], "api_port": 9000}"#,
        );
        let cli = Cli {
            annotation_prefix: Some("flag.".to_string()),
            all_namespaces: true,
            api_port: Some(9100),
            ..Default::default()
        };

        config.apply_cli(&cli);

        assert_eq!(config.annotation_prefix, "flag.");
        assert_eq!(config.scopes(), vec![Scope::AllNamespaces]);
        assert_eq!(config.api_port, 9100);
    }

    fn env(vars: &[(&str, &str)]) -> Option<config::Map<String, String>> {
        Some(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_environment_layering() {
        let config = PodmonConfig::load_with_env(
            &Cli::default(),
            env(&[
                ("PODMON_NAMESPACES", "payments,search"),
                ("PODMON_ANNOTATION_PREFIX", "alert."),
                ("PODMON_API_PORT", "9100"),
                ("PODMON_OVERFLOW", "drop_newest"),
                ("PODMON_RECONNECT_MAX_BACKOFF_MS", "5000"),
                ("OTHER_API_PORT", "1"),
            ]),
        )
        .unwrap();

        assert_eq!(
            config.scopes(),
            vec![
                Scope::Namespace("payments".to_string()),
                Scope::Namespace("search".to_string()),
            ]
        );
        assert_eq!(config.annotation_prefix, "alert.");
        assert_eq!(config.api_port, 9100);
        assert_eq!(config.overflow_policy(), OverflowPolicy::DropNewest);
        assert_eq!(config.reconnect_policy().max_backoff, Duration::from_secs(5));
    }

    #[test]
    fn test_flags_override_environment() {
        let cli = Cli {
            namespaces: vec!["batch".to_string()],
            annotation_prefix: Some("flag.".to_string()),
            ..Default::default()
        };
        let config = PodmonConfig::load_with_env(
            &cli,
            env(&[
                ("PODMON_NAMESPACES", "payments,search"),
                ("PODMON_ANNOTATION_PREFIX", "alert."),
            ]),
        )
        .unwrap();

        assert_eq!(config.scopes(), vec![Scope::Namespace("batch".to_string())]);
        assert_eq!(config.annotation_prefix, "flag.");
    }

    #[test]
    fn test_environment_without_prefix_fails_validation() {
        let result = PodmonConfig::load_with_env(
            &Cli::default(),
            env(&[("PODMON_NAMESPACES", "payments")]),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_backoff_bounds_validated() {
        let config = from_json(
            r#"{"annotation_prefix": "a", "reconnect_initial_backoff_ms": 5000, "reconnect_max_backoff_ms": 100}"#,
        );
        assert!(config.validate().is_err());
    }
}
