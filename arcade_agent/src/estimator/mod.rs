//! Action-value estimators: a sparse Q-table and a neural approximator
//! trained from replayed experience.

pub mod approximate;
pub mod network;
pub mod tabular;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

use crate::encoder::EncodedState;
use crate::persistence::PersistenceManager;
use crate::protocol::Action;
use crate::settings::Settings;

use self::approximate::ApproximateEstimator;
use self::tabular::TabularEstimator;

/// One estimate per action, indexed by [`Action::index`].
pub type ActionValues = [f64; Action::COUNT];

/// Which estimator backs the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorKind {
    Tabular,
    Approximate,
}

impl fmt::Display for EstimatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EstimatorKind::Tabular => f.write_str("tabular"),
            EstimatorKind::Approximate => f.write_str("approximate"),
        }
    }
}

/// Temporal-difference hyper-parameters shared by both estimators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    pub estimator: EstimatorKind,
    /// Step size of the tabular update.
    pub alpha: f64,
    /// Discount factor for the bootstrapped next-state value.
    pub gamma: f64,
    /// Messages per epoch (epsilon decay + checkpoint).
    pub epoch_size: u64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            estimator: EstimatorKind::Tabular,
            alpha: 0.1,
            gamma: 0.9,
            epoch_size: 100,
        }
    }
}

/// A single step of experience.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: EncodedState,
    pub action: Action,
    pub reward: f64,
    pub next_state: EncodedState,
    /// The next observation ended the run (collision).
    pub terminal: bool,
}

/// How often the estimator wants its parameters written out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointCadence {
    EveryStep,
    EveryEpoch,
}

/// What happened at an epoch boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EpochOutcome {
    /// The estimator has no epoch work.
    Idle,
    /// A replay minibatch was fitted.
    Refit { batch_size: usize, loss: f64 },
    /// Not enough experience yet for a minibatch.
    Skipped { available: usize, required: usize },
}

/// Common contract of the Q-value estimators.
pub trait ValueEstimator: Send {
    fn kind(&self) -> EstimatorKind;

    /// Current estimate for every action in `state`. Unseen states read as zero
    /// for the tabular variant.
    fn action_values(&self, state: &EncodedState) -> ActionValues;

    fn value(&self, state: &EncodedState, action: Action) -> f64 {
        self.action_values(state)[action.index()]
    }

    /// Greedy action; ties go to the first action in enumeration order.
    fn best_action(&self, state: &EncodedState) -> Action {
        greedy_action(&self.action_values(state))
    }

    /// Feed one transition to the estimator.
    fn learn(&mut self, transition: Transition) -> Result<()>;

    /// Work done once per epoch, after epsilon decay.
    fn end_epoch(&mut self) -> Result<EpochOutcome>;

    fn checkpoint_cadence(&self) -> CheckpointCadence;

    /// Write the current parameters through `store`, replacing any prior checkpoint.
    fn save(&self, store: &PersistenceManager) -> Result<()>;

    /// One-line description for logs and `inspect`.
    fn summary(&self) -> String;
}

/// Index of the largest value, first one wins on ties. NaN never wins.
pub fn greedy_action(values: &ActionValues) -> Action {
    let mut best = 0;
    for (i, value) in values.iter().enumerate().skip(1) {
        if *value > values[best] || values[best].is_nan() {
            best = i;
        }
    }
    Action::ALL[best]
}

/// Largest value in `values`, or zero if they are all NaN.
pub fn max_value(values: &ActionValues) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        0.0
    } else {
        max
    }
}

/// Build the configured estimator, restoring it from its checkpoint when one
/// can be read. Never fails on a missing or unreadable checkpoint.
pub fn load_estimator(
    settings: &Settings,
) -> Result<(Box<dyn ValueEstimator>, PersistenceManager)> {
    match settings.learning.estimator {
        EstimatorKind::Tabular => {
            let store = PersistenceManager::json(&settings.persistence.table_path);
            let estimator = TabularEstimator::load_or_new(settings.learning.clone(), &store);
            info!("Using tabular estimator: {}", estimator.summary());
            Ok((Box::new(estimator), store))
        }
        EstimatorKind::Approximate => {
            let store = PersistenceManager::bincode(&settings.persistence.model_path);
            let estimator = ApproximateEstimator::load_or_new(settings, &store)?;
            info!("Using approximate estimator: {}", estimator.summary());
            Ok((Box::new(estimator), store))
        }
    }
}
