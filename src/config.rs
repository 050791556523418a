use crate::secret_string::SecretString;
use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::Deserialize;
use std::time::Duration;
use std::{env, fs, path::Path};
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub webserver: Webserver,
    #[serde(default)]
    pub webhook: Webhook,
    #[serde(default)]
    pub watcher: WatcherConfig,
}

#[derive(Debug, Deserialize)]
pub struct Webserver {
    pub port: u16,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    /// Expected value of the `Authorization` header sent by the registry
    pub auth_token: Option<SecretString>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherConfig {
    /// Restricts watching to one namespace; all namespaces when unset
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    #[serde(default = "default_update_timeout_seconds")]
    pub update_timeout_seconds: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            label_selector: None,
            update_timeout_seconds: default_update_timeout_seconds(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl WatcherConfig {
    pub fn update_timeout(&self) -> Duration {
        Duration::from_secs(self.update_timeout_seconds)
    }
}

fn default_update_timeout_seconds() -> u64 {
    10
}

fn default_queue_capacity() -> usize {
    16
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config: Config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;

    if config.watcher.queue_capacity == 0 {
        anyhow::bail!("watcher.queueCapacity must be greater than zero");
    }

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming the first missing variable.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.get_or_insert_with(|| var_name.to_string());
            String::new()
        })
    });

    match missing {
        Some(var_name) => Err(anyhow!("Missing environment variable: {}", var_name)),
        None => Ok(result.into_owned()),
    }
}
