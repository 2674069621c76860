//! Scalar reward derived from a single observation.

use serde::{Deserialize, Serialize};

use crate::protocol::Observation;

/// Reward magnitudes. Must satisfy
/// `collision_penalty < idle_penalty < progress_reward`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RewardConfig {
    pub collision_penalty: f64,
    pub progress_reward: f64,
    pub idle_penalty: f64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            collision_penalty: -1000.0,
            progress_reward: 10.0,
            idle_penalty: -1.0,
        }
    }
}

impl RewardConfig {
    pub fn is_ordered(&self) -> bool {
        self.collision_penalty < self.idle_penalty && self.idle_penalty < self.progress_reward
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RewardFunction {
    config: RewardConfig,
}

impl RewardFunction {
    pub fn new(config: RewardConfig) -> Self {
        Self { config }
    }

    pub fn reward(&self, observation: &Observation) -> f64 {
        if observation.collision {
            self.config.collision_penalty
        } else if observation.score > 0 {
            self.config.progress_reward
        } else {
            self.config.idle_penalty
        }
    }
}
