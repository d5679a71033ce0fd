//! Runtime settings for executors and the orchestrator
//!
//! Settings are layered with the `config` crate: built-in defaults, then an
//! optional YAML/TOML/JSON file, then `DEPLOY_*` environment variables
//! (e.g. `DEPLOY_SEND_DELAY_MS=500`).

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Executor and orchestrator tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// Timeout passed to the remote capture command, seconds
    pub capture_timeout_secs: u64,
    /// How long to wait for the capture to report it is listening, milliseconds
    pub capture_ready_timeout_ms: u64,
    /// Pause between arming the capture and sending the probe, milliseconds
    pub send_delay_ms: u64,
    /// Upper bound on waiting for the capture to finish, milliseconds
    pub capture_deadline_ms: u64,
    /// First ephemeral source port used for probes
    pub ephemeral_port_base: u16,
    /// Number of ephemeral ports above the base
    pub ephemeral_port_span: u16,
    pub ssh_connect_timeout_secs: u64,
    pub ssh_session_timeout_secs: u64,
    /// Actions dispatched concurrently per task
    pub max_parallel_actions: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            capture_timeout_secs: 5,
            capture_ready_timeout_ms: 3_000,
            send_delay_ms: 1_000,
            capture_deadline_ms: 15_000,
            ephemeral_port_base: 45_000,
            ephemeral_port_span: 16_384,
            ssh_connect_timeout_secs: 10,
            ssh_session_timeout_secs: 30,
            max_parallel_actions: 4,
        }
    }
}

impl Settings {
    /// Load settings from an optional file plus `DEPLOY_*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings: Settings = builder
            .add_source(config::Environment::with_prefix("DEPLOY").try_parsing(true))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.max_parallel_actions == 0 {
            return Err(crate::error::DeployError::Validation(
                "max_parallel_actions must be at least 1".to_string(),
            ));
        }
        if self.ephemeral_port_span == 0
            || u32::from(self.ephemeral_port_base) + u32::from(self.ephemeral_port_span) > 65_536
        {
            return Err(crate::error::DeployError::Validation(format!(
                "ephemeral port range {}+{} is outside 0-65535",
                self.ephemeral_port_base, self.ephemeral_port_span
            )));
        }
        Ok(())
    }

    pub fn capture_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_ready_timeout_ms)
    }

    pub fn send_delay(&self) -> Duration {
        Duration::from_millis(self.send_delay_ms)
    }

    pub fn capture_deadline(&self) -> Duration {
        Duration::from_millis(self.capture_deadline_ms)
    }

    pub fn ssh_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_connect_timeout_secs)
    }

    pub fn ssh_session_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_session_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.capture_timeout_secs, 5);
        assert_eq!(settings.send_delay(), Duration::from_secs(1));
        assert_eq!(settings.ephemeral_port_base, 45_000);
        // 45000..=61383
        assert_eq!(
            settings.ephemeral_port_base as u32 + settings.ephemeral_port_span as u32 - 1,
            61_383
        );
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "send_delay_ms: 250\nmax_parallel_actions: 8").unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.send_delay_ms, 250);
        assert_eq!(settings.max_parallel_actions, 8);
        // Untouched fields keep their defaults
        assert_eq!(settings.capture_timeout_secs, 5);
    }

    #[test]
    fn test_validate_rejects_zero_parallelism() {
        let settings = Settings {
            max_parallel_actions: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_port_overflow() {
        let settings = Settings {
            ephemeral_port_base: 60_000,
            ephemeral_port_span: 10_000,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }
}
