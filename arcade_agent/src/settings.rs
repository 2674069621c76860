//! Configuration management with embedded defaults, an optional local file,
//! environment variable overrides and validation.

use anyhow::{anyhow, Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::estimator::approximate::NetworkConfig;
use crate::estimator::LearningConfig;
use crate::policy::ExplorationConfig;
use crate::replay::ReplayConfig;
use crate::reward::RewardConfig;

/// Local configuration file picked up from the working directory.
pub const LOCAL_CONFIG_FILE: &str = "arcade_agent.toml";

/// Game server connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub url: String,
    /// Fixed pause between connection attempts.
    pub reconnect_delay_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8765".to_string(),
            reconnect_delay_ms: 200,
            connect_timeout_ms: 5_000,
        }
    }
}

impl ConnectionConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Obstacle slots in the feature vector.
    pub max_obstacles: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self { max_obstacles: 5 }
    }
}

/// Checkpoint locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub table_path: PathBuf,
    pub model_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            table_path: PathBuf::from("q_table.json"),
            model_path: PathBuf::from("q_network.bin"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Main settings structure with all configuration sections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    pub connection: ConnectionConfig,
    pub learning: LearningConfig,
    pub exploration: ExplorationConfig,
    pub reward: RewardConfig,
    pub encoder: EncoderConfig,
    pub network: NetworkConfig,
    pub replay: ReplayConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
}

impl Settings {
    /// Load settings from the embedded defaults, `arcade_agent.toml` (or
    /// `path`), and `ARCADE__*` environment variables, in that order.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            // Start with default settings
            .add_source(File::from_str(
                include_str!("../config.toml"),
                FileFormat::Toml,
            ));

        builder = match path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name(LOCAL_CONFIG_FILE).required(false)),
        };

        let config = builder
            .add_source(
                Environment::with_prefix("ARCADE")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("network.hidden_layers")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?;

        let settings: Settings = config
            .try_deserialize()
            .context("Invalid configuration")?;
        settings.validate()?;

        Ok(settings)
    }

    /// Validate settings for consistency
    pub fn validate(&self) -> Result<()> {
        if self.connection.url.trim().is_empty() {
            return Err(anyhow!("Connection URL cannot be empty"));
        }

        let learning = &self.learning;
        if !(learning.alpha > 0.0 && learning.alpha <= 1.0) {
            return Err(anyhow!("alpha must be in (0, 1], got {}", learning.alpha));
        }
        if !(0.0..=1.0).contains(&learning.gamma) {
            return Err(anyhow!("gamma must be in [0, 1], got {}", learning.gamma));
        }
        if learning.epoch_size == 0 {
            return Err(anyhow!("Epoch size cannot be 0"));
        }

        let exploration = &self.exploration;
        if !(0.0 <= exploration.epsilon_min
            && exploration.epsilon_min <= exploration.epsilon_initial
            && exploration.epsilon_initial <= 1.0)
        {
            return Err(anyhow!(
                "Exploration bounds must satisfy 0 <= epsilon_min ({}) <= epsilon_initial ({}) <= 1",
                exploration.epsilon_min,
                exploration.epsilon_initial
            ));
        }
        if !(exploration.decay_rate > 0.0 && exploration.decay_rate <= 1.0) {
            return Err(anyhow!(
                "decay_rate must be in (0, 1], got {}",
                exploration.decay_rate
            ));
        }

        if !self.reward.is_ordered() {
            return Err(anyhow!(
                "Rewards must satisfy collision_penalty < idle_penalty < progress_reward, got {} / {} / {}",
                self.reward.collision_penalty,
                self.reward.idle_penalty,
                self.reward.progress_reward
            ));
        }

        if self.encoder.max_obstacles == 0 {
            return Err(anyhow!("max_obstacles cannot be 0"));
        }

        if self.network.hidden_layers.iter().any(|&width| width == 0) {
            return Err(anyhow!("Hidden layer widths cannot be 0"));
        }
        if !(self.network.learning_rate > 0.0) {
            return Err(anyhow!(
                "Network learning rate must be positive, got {}",
                self.network.learning_rate
            ));
        }

        if self.replay.batch_size == 0 {
            return Err(anyhow!("Replay batch size cannot be 0"));
        }
        if self.replay.capacity != 0 && self.replay.capacity < self.replay.batch_size {
            return Err(anyhow!(
                "Replay capacity {} is smaller than the batch size {}",
                self.replay.capacity,
                self.replay.batch_size
            ));
        }

        match self.logging.format.as_str() {
            "text" | "json" => {}
            other => return Err(anyhow!("Unknown logging format '{}'", other)),
        }

        Ok(())
    }

    /// Effective settings rendered as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render settings as TOML")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::EstimatorKind;
    use tempfile::tempdir;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_embedded_defaults_match_code_defaults() {
        let config = Config::builder()
            .add_source(File::from_str(include_str!("../config.toml"), FileFormat::Toml))
            .build()
            .unwrap();
        let embedded: Settings = config.try_deserialize().unwrap();
        let defaults = Settings::default();

        assert_eq!(embedded.connection.url, defaults.connection.url);
        assert_eq!(embedded.connection.reconnect_delay_ms, 200);
        assert_eq!(embedded.learning.estimator, EstimatorKind::Tabular);
        assert_eq!(embedded.learning.alpha, defaults.learning.alpha);
        assert_eq!(embedded.learning.gamma, defaults.learning.gamma);
        assert_eq!(embedded.learning.epoch_size, defaults.learning.epoch_size);
        assert_eq!(embedded.reward, defaults.reward);
        assert_eq!(embedded.exploration.epsilon_initial, 0.1);
        assert_eq!(
            embedded.exploration.epsilon_initial,
            defaults.exploration.epsilon_initial
        );
        assert_eq!(embedded.encoder.max_obstacles, defaults.encoder.max_obstacles);
        assert_eq!(embedded.network.hidden_layers, vec![64, 64]);
        assert_eq!(embedded.replay.batch_size, defaults.replay.batch_size);
        assert_eq!(embedded.persistence.table_path, PathBuf::from("q_table.json"));
        assert!(embedded.exploration.seed.is_none());
        assert_ok!(embedded.validate());
    }

    #[test]
    fn test_explicit_file_overrides_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[learning]\nestimator = \"approximate\"\nepoch_size = 10\n\n[exploration]\nseed = 42\n",
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.learning.estimator, EstimatorKind::Approximate);
        assert_eq!(settings.learning.epoch_size, 10);
        assert_eq!(settings.learning.alpha, 0.1);
        assert_eq!(settings.exploration.seed, Some(42));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(Settings::load(Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn test_validate_rejects_inconsistent_values() {
        let cases: [fn(&mut Settings); 12] = [
            |s| s.learning.alpha = 0.0,
            |s| s.learning.gamma = 1.5,
            |s| s.learning.epoch_size = 0,
            |s| s.exploration.epsilon_min = -0.1,
            |s| {
                s.exploration.epsilon_initial = 0.2;
                s.exploration.epsilon_min = 0.3;
            },
            |s| s.exploration.decay_rate = 0.0,
            |s| s.reward.idle_penalty = 20.0,
            |s| s.encoder.max_obstacles = 0,
            |s| s.replay.batch_size = 0,
            |s| s.replay.capacity = 4,
            |s| s.network.hidden_layers = vec![64, 0],
            |s| s.logging.format = "xml".to_string(),
        ];

        for (i, mutate) in cases.into_iter().enumerate() {
            let mut settings = Settings::default();
            mutate(&mut settings);
            assert_err!(settings.validate(), "case {} should be rejected", i);
        }
    }

    #[test]
    fn test_to_toml_round_trips() {
        let mut settings = Settings::default();
        settings.exploration.seed = Some(9);
        let rendered = settings.to_toml().unwrap();

        let parsed: Settings = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.exploration.seed, Some(9));
        assert_eq!(parsed.connection.url, settings.connection.url);
        assert_eq!(parsed.network.hidden_layers, settings.network.hidden_layers);
    }
}
