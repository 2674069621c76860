//! Epsilon-greedy exploration with a multiplicative decay schedule.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::encoder::EncodedState;
use crate::estimator::ValueEstimator;
use crate::protocol::Action;

/// Hyper-parameters for the exploration schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplorationConfig {
    pub epsilon_initial: f64,
    pub epsilon_min: f64,
    /// Multiplier applied at every epoch boundary.
    pub decay_rate: f64,
    /// Fixed RNG seed; `None` seeds from the OS.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for ExplorationConfig {
    fn default() -> Self {
        Self {
            epsilon_initial: 0.1,
            epsilon_min: 0.01,
            decay_rate: 0.995,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Explore,
    Exploit,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Explore => f.write_str("explore"),
            Mode::Exploit => f.write_str("exploit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub action: Action,
    pub mode: Mode,
}

pub struct EpsilonGreedy {
    epsilon: f64,
    epsilon_min: f64,
    decay_rate: f64,
    rng: StdRng,
}

impl EpsilonGreedy {
    pub fn new(config: &ExplorationConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            epsilon: config.epsilon_initial.max(config.epsilon_min),
            epsilon_min: config.epsilon_min,
            decay_rate: config.decay_rate,
            rng,
        }
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Random action with probability epsilon, otherwise the estimator's
    /// greedy choice.
    pub fn select(&mut self, estimator: &dyn ValueEstimator, state: &EncodedState) -> Selection {
        if self.rng.gen::<f64>() < self.epsilon {
            let action = Action::ALL[self.rng.gen_range(0..Action::COUNT)];
            Selection {
                action,
                mode: Mode::Explore,
            }
        } else {
            Selection {
                action: estimator.best_action(state),
                mode: Mode::Exploit,
            }
        }
    }

    /// Shrink epsilon once; never below `epsilon_min`.
    pub fn decay(&mut self) -> f64 {
        self.epsilon = (self.epsilon * self.decay_rate).max(self.epsilon_min);
        self.epsilon
    }
}
