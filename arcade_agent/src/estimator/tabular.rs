//! Sparse Q-table keyed by canonical state keys.

use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use super::{
    max_value, ActionValues, CheckpointCadence, EpochOutcome, EstimatorKind, LearningConfig,
    Transition, ValueEstimator,
};
use crate::encoder::{EncodedState, StateKey};
use crate::persistence::PersistenceManager;
use crate::protocol::Action;

/// On-disk layout: `{"<state key>": {"Up": 0.0, "Down": 0.0, ...}}`.
type TableCheckpoint = BTreeMap<String, BTreeMap<String, f64>>;

pub struct TabularEstimator {
    config: LearningConfig,
    q_table: HashMap<StateKey, ActionValues>,
}

impl TabularEstimator {
    pub fn new(config: LearningConfig) -> Self {
        Self {
            config,
            q_table: HashMap::new(),
        }
    }

    /// Restore from `store`, or start with an empty table.
    pub fn load_or_new(config: LearningConfig, store: &PersistenceManager) -> Self {
        let mut estimator = Self::new(config);
        if let Some(checkpoint) = store.load::<TableCheckpoint>() {
            estimator.restore(checkpoint);
            if estimator.is_empty() {
                warn!("Q-table checkpoint {:?} holds no states", store.path());
            } else {
                info!(
                    "Q-table restored from {:?}: {} states",
                    store.path(),
                    estimator.len()
                );
            }
        }
        estimator
    }

    pub fn len(&self) -> usize {
        self.q_table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.q_table.is_empty()
    }

    pub fn contains(&self, key: &StateKey) -> bool {
        self.q_table.contains_key(key)
    }

    /// Q-values of `key`; unseen keys read as all zero.
    pub fn row(&self, key: &StateKey) -> ActionValues {
        self.q_table.get(key).copied().unwrap_or([0.0; Action::COUNT])
    }

    fn row_mut(&mut self, key: &StateKey) -> &mut ActionValues {
        self.q_table
            .entry(key.clone())
            .or_insert([0.0; Action::COUNT])
    }

    /// One-step Q-learning update, returning the new `Q[prev][action]`.
    ///
    /// `Q(s,a) ← Q(s,a) + α [r + γ max_a' Q(s',a') − Q(s,a)]`
    pub fn update(&mut self, prev: &StateKey, action: Action, reward: f64, next: &StateKey) -> f64 {
        let max_next_q = max_value(self.row_mut(next));

        let alpha = self.config.alpha;
        let target = reward + self.config.gamma * max_next_q;
        let slot = &mut self.row_mut(prev)[action.index()];
        let current_q = *slot;
        let new_q = current_q + alpha * (target - current_q);
        *slot = new_q;

        debug!(
            "Q-update: action={}, reward={:.3}, current_q={:.3}, new_q={:.3}",
            action, reward, current_q, new_q
        );
        new_q
    }

    fn snapshot(&self) -> TableCheckpoint {
        self.q_table
            .iter()
            .map(|(key, values)| {
                let row = Action::ALL
                    .iter()
                    .map(|action| (action.name().to_string(), values[action.index()]))
                    .collect();
                (key.as_str().to_string(), row)
            })
            .collect()
    }

    fn restore(&mut self, checkpoint: TableCheckpoint) {
        for (key, row) in checkpoint {
            let mut values = [0.0; Action::COUNT];
            for (name, value) in row {
                match name.parse::<Action>() {
                    Ok(action) => values[action.index()] = value,
                    Err(_) => warn!("Skipping unknown action '{}' in Q-table checkpoint", name),
                }
            }
            self.q_table.insert(StateKey::from_raw(key), values);
        }
    }
}

impl ValueEstimator for TabularEstimator {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::Tabular
    }

    fn action_values(&self, state: &EncodedState) -> ActionValues {
        self.row(&state.key)
    }

    fn learn(&mut self, transition: Transition) -> Result<()> {
        self.update(
            &transition.state.key,
            transition.action,
            transition.reward,
            &transition.next_state.key,
        );
        Ok(())
    }

    fn end_epoch(&mut self) -> Result<EpochOutcome> {
        Ok(EpochOutcome::Idle)
    }

    fn checkpoint_cadence(&self) -> CheckpointCadence {
        CheckpointCadence::EveryStep
    }

    fn save(&self, store: &PersistenceManager) -> Result<()> {
        store.save(&self.snapshot())
    }

    fn summary(&self) -> String {
        format!(
            "Q-table with {} states (alpha={}, gamma={})",
            self.len(),
            self.config.alpha,
            self.config.gamma
        )
    }
}
