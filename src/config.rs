//! Configuration management

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Ingestion queue capacity; unbounded when unset.
    ///
    /// An unbounded queue grows without limit if producers outpace the
    /// dispatch thread. A bounded one makes `submit` wait instead.
    pub queue_capacity: Option<usize>,
    /// How long the dispatch loop waits on an empty queue before
    /// re-checking for shutdown
    pub poll_interval_ms: u64,
    /// Emit a SYSTEM heartbeat event at this interval while running
    pub heartbeat_interval_ms: Option<u64>,
    /// Re-submit listener failures as ERROR events
    pub publish_failures: bool,
    /// Emit SYSTEM startup/shutdown events on start/stop
    pub lifecycle_events: bool,
    /// Name of the dispatch thread
    pub thread_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when RUST_LOG is not set
    pub filter: String,
    /// Emit JSON log lines
    pub json: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: None,
            poll_interval_ms: 50,
            heartbeat_interval_ms: None,
            publish_failures: false,
            lifecycle_events: false,
            thread_name: "event-engine".to_string(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl EngineConfig {
    /// Bounded-queue config with defaults elsewhere
    pub fn bounded(capacity: usize) -> Self {
        Self {
            queue_capacity: Some(capacity),
            ..Self::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        // A zero timeout would turn the idle loop into a spin
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

impl Config {
    /// Load configuration from file, with `EVENT_ENGINE__SECTION__KEY`
    /// environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("EVENT_ENGINE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        Ok(config)
    }

    /// Load from default locations
    pub fn load_default() -> anyhow::Result<Self> {
        let paths = [
            "config.toml",
            "event-engine.toml",
            "~/.config/event-engine/config.toml",
        ];

        for path in paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Ok(Self::load(expanded.as_ref())?);
            }
        }

        anyhow::bail!("No configuration file found")
    }
}
