// Confirm tracker defaults and env/YAML overrides.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

/// Upper bound a batch publisher waits for its batch to drain.
pub(crate) const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);

/// Dispatch slower than this is logged; listeners run on the receive path and
/// stall every later confirm on the channel while they run.
pub(crate) const DEFAULT_SLOW_LISTENER_THRESHOLD: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmConfig {
    pub confirm_timeout: Duration,
    pub slow_listener_threshold: Duration,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ConfirmConfigOverride {
    confirm_timeout_ms: Option<u64>,
    slow_listener_ms: Option<u64>,
}

impl Default for ConfirmConfig {
    fn default() -> Self {
        Self {
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
            slow_listener_threshold: DEFAULT_SLOW_LISTENER_THRESHOLD,
        }
    }
}

impl ConfirmConfig {
    /// Defaults, then `FELIX_CONFIRM_*` env vars, then the YAML file named by
    /// `config_path` or `FELIX_CONFIRM_CONFIG`.
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("FELIX_CONFIRM_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("read confirm config: {path}"))?;
            let override_cfg: ConfirmConfigOverride =
                serde_yaml::from_str(&contents).context("parse confirm config yaml")?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = read_millis_env("FELIX_CONFIRM_TIMEOUT_MS") {
            config.confirm_timeout = value;
        }
        if let Some(value) = read_millis_env("FELIX_CONFIRM_SLOW_LISTENER_MS") {
            config.slow_listener_threshold = value;
        }
        config
    }
}

impl ConfirmConfigOverride {
    fn apply(&self, config: &mut ConfirmConfig) {
        if let Some(value) = self.confirm_timeout_ms
            && value > 0
        {
            config.confirm_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.slow_listener_ms
            && value > 0
        {
            config.slow_listener_threshold = Duration::from_millis(value);
        }
    }
}

fn read_millis_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .map(Duration::from_millis)
}
