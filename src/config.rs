use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::info;

/// Process settings, read from a JSON file. Every field has a default.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Per-upstream-query timeout in seconds.
    #[serde(default = "default_resolution_timeout")]
    pub resolution_timeout: f64,
    /// How many rewrites a single query may go through before failing.
    #[serde(default = "default_max_rewrite_depth")]
    pub max_rewrite_depth: usize,
    /// Resolver pool slots per configured upstream.
    #[serde(default = "default_workers_per_resolver")]
    pub workers_per_resolver: usize,
    /// Rules file; relative paths resolve against the settings file.
    #[serde(default = "default_rules")]
    pub rules: PathBuf,
    #[serde(default)]
    pub on_invalid_rule: InvalidRulePolicy,
    #[serde(default = "default_bind_udp")]
    pub bind_udp: String,
    /// Where queries no rule answered are forwarded.
    #[serde(default = "default_resolvers")]
    pub default_resolvers: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InvalidRulePolicy {
    /// Log the offending line and keep loading.
    #[default]
    Skip,
    /// Refuse the whole rules file.
    Abort,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            resolution_timeout: default_resolution_timeout(),
            max_rewrite_depth: default_max_rewrite_depth(),
            workers_per_resolver: default_workers_per_resolver(),
            rules: default_rules(),
            on_invalid_rule: InvalidRulePolicy::default(),
            bind_udp: default_bind_udp(),
            default_resolvers: default_resolvers(),
        }
    }
}

impl Settings {
    pub fn resolution_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.resolution_timeout)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_resolution_timeout()))
    }
}

pub fn load_settings(path: &Path) -> Result<Settings> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read settings file: {}", path.display()))?;
    let mut settings: Settings = serde_json::from_str(&raw)
        .with_context(|| format!("parse settings file: {}", path.display()))?;

    if settings.rules.is_relative() {
        if let Some(dir) = path.parent() {
            settings.rules = dir.join(&settings.rules);
        }
    }
    if !(settings.resolution_timeout > 0.0) {
        anyhow::bail!(
            "resolution_timeout must be positive, got {}",
            settings.resolution_timeout
        );
    }
    if settings.workers_per_resolver == 0 {
        anyhow::bail!("workers_per_resolver must be at least 1");
    }

    info!(
        target = "config",
        path = %path.display(),
        rules = %settings.rules.display(),
        "settings loaded"
    );
    Ok(settings)
}


fn default_resolution_timeout() -> f64 {
    1.0
}

fn default_max_rewrite_depth() -> usize {
    5
}

fn default_workers_per_resolver() -> usize {
    1
}

fn default_rules() -> PathBuf {
    PathBuf::from("rules.conf")
}

fn default_bind_udp() -> String {
    "0.0.0.0:5353".to_string()
}

fn default_resolvers() -> Vec<String> {
    vec!["8.8.8.8:53".to_string()]
}
