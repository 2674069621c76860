//! The learning agent: value estimator, exploration policy, state encoder,
//! reward function and epoch clock. It outlives individual connections and
//! is lent to one message loop at a time.

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::encoder::{EncodedState, StateEncoder};
use crate::estimator::{
    load_estimator, CheckpointCadence, EpochOutcome, Transition, ValueEstimator,
};
use crate::persistence::PersistenceManager;
use crate::policy::{EpsilonGreedy, Mode, Selection};
use crate::protocol::{Action, Observation};
use crate::reward::RewardFunction;
use crate::settings::Settings;

/// Counts processed observations and completed epochs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochClock {
    size: u64,
    index: u64,
    completed: u64,
}

impl EpochClock {
    pub fn new(size: u64) -> Self {
        Self {
            size: size.max(1),
            index: 0,
            completed: 0,
        }
    }

    /// Advance by one step. Returns `true` when this step closes an epoch.
    pub fn tick(&mut self) -> bool {
        self.index += 1;
        if self.index >= self.size {
            self.index = 0;
            self.completed += 1;
            true
        } else {
            false
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Steps taken in the current epoch.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }
}

/// Message and learning counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStats {
    pub messages: u64,
    pub observations: u64,
    /// Well-formed messages of a type the agent does not handle.
    pub ignored: u64,
    /// Malformed messages.
    pub dropped: u64,
    pub explore: u64,
    pub exploit: u64,
    pub updates: u64,
    pub cumulative_reward: f64,
}

impl SessionStats {
    pub fn decisions(&self) -> u64 {
        self.explore + self.exploit
    }

    pub fn record_selection(&mut self, mode: Mode) {
        match mode {
            Mode::Explore => self.explore += 1,
            Mode::Exploit => self.exploit += 1,
        }
    }

    pub fn record_update(&mut self, reward: f64) {
        self.updates += 1;
        self.cumulative_reward += reward;
    }

    pub fn absorb(&mut self, other: &SessionStats) {
        self.messages += other.messages;
        self.observations += other.observations;
        self.ignored += other.ignored;
        self.dropped += other.dropped;
        self.explore += other.explore;
        self.exploit += other.exploit;
        self.updates += other.updates;
        self.cumulative_reward += other.cumulative_reward;
    }
}

/// The encoded state and the action chosen for one observation.
#[derive(Debug, Clone)]
pub struct Decision {
    pub state: EncodedState,
    pub selection: Selection,
}

/// What happened at an epoch boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochReport {
    pub epoch: u64,
    pub epsilon: f64,
    pub outcome: EpochOutcome,
}

pub struct LearningAgent {
    estimator: Box<dyn ValueEstimator>,
    store: PersistenceManager,
    policy: EpsilonGreedy,
    encoder: StateEncoder,
    reward: RewardFunction,
    clock: EpochClock,
}

impl LearningAgent {
    pub fn new(
        estimator: Box<dyn ValueEstimator>,
        store: PersistenceManager,
        settings: &Settings,
    ) -> Self {
        Self {
            estimator,
            store,
            policy: EpsilonGreedy::new(&settings.exploration),
            encoder: StateEncoder::new(settings.encoder.max_obstacles),
            reward: RewardFunction::new(settings.reward),
            clock: EpochClock::new(settings.learning.epoch_size),
        }
    }

    /// Build the configured estimator, restoring its checkpoint if present.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let (estimator, store) = load_estimator(settings)?;
        Ok(Self::new(estimator, store, settings))
    }

    pub fn estimator(&self) -> &dyn ValueEstimator {
        self.estimator.as_ref()
    }

    pub fn store(&self) -> &PersistenceManager {
        &self.store
    }

    pub fn epsilon(&self) -> f64 {
        self.policy.epsilon()
    }

    pub fn clock(&self) -> &EpochClock {
        &self.clock
    }

    /// Encode `observation` and pick an action for it.
    pub fn decide(&mut self, observation: &Observation) -> Decision {
        let state = self.encoder.encode(observation);
        let selection = self.policy.select(self.estimator.as_ref(), &state);
        debug!(
            "Decision: action={}, mode={}, epsilon={:.4}",
            selection.action,
            selection.mode,
            self.policy.epsilon()
        );
        Decision { state, selection }
    }

    /// Credit the previous decision with the reward of `observation`, whose
    /// encoding is `current`. Returns the reward.
    pub fn learn(
        &mut self,
        previous: (EncodedState, Action),
        observation: &Observation,
        current: &EncodedState,
    ) -> f64 {
        let (state, action) = previous;
        let reward = self.reward.reward(observation);
        let transition = Transition {
            state,
            action,
            reward,
            next_state: current.clone(),
            terminal: observation.collision,
        };

        if let Err(e) = self.estimator.learn(transition) {
            warn!("Learning step failed: {:#}", e);
        }
        if self.estimator.checkpoint_cadence() == CheckpointCadence::EveryStep {
            self.checkpoint();
        }
        reward
    }

    /// Advance the epoch clock. On a boundary: decay epsilon, checkpoint, run
    /// the estimator's epoch work and checkpoint again if it changed anything.
    pub fn tick(&mut self) -> Option<EpochReport> {
        if !self.clock.tick() {
            return None;
        }

        let epsilon = self.policy.decay();
        self.checkpoint();

        let outcome = match self.estimator.end_epoch() {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Epoch work failed: {:#}", e);
                EpochOutcome::Idle
            }
        };
        if let EpochOutcome::Refit { .. } = outcome {
            self.checkpoint();
        }

        Some(EpochReport {
            epoch: self.clock.completed(),
            epsilon,
            outcome,
        })
    }

    /// Write the estimator through its store. Failures are logged and
    /// reported as `false`.
    pub fn checkpoint(&self) -> bool {
        match self.estimator.save(&self.store) {
            Ok(()) => true,
            Err(e) => {
                warn!("Checkpoint to {:?} failed: {:#}", self.store.path(), e);
                false
            }
        }
    }

    /// Final checkpoint before the process exits.
    pub fn shutdown(&self) {
        if self.checkpoint() {
            info!(
                "Final checkpoint written to {:?}: {}",
                self.store.path(),
                self.estimator.summary()
            );
        }
    }
}
