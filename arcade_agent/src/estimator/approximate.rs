//! Neural Q-function fitted on minibatches replayed from past experience.
//!
//! There is no separate target network: bootstrap values come from the
//! network being trained. Each refit is a single optimizer step over one
//! minibatch and runs inline in the decision loop.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use ndarray::{Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::network::QNetwork;
use super::{
    max_value, ActionValues, CheckpointCadence, EpochOutcome, EstimatorKind, Transition,
    ValueEstimator,
};
use crate::encoder::{EncodedState, StateEncoder};
use crate::error::ReplayError;
use crate::persistence::PersistenceManager;
use crate::protocol::Action;
use crate::replay::ReplayBuffer;
use crate::settings::Settings;

/// Architecture and optimizer settings of the Q-network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub hidden_layers: Vec<usize>,
    /// Adam step size.
    pub learning_rate: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            hidden_layers: vec![64, 64],
            learning_rate: 0.001,
        }
    }
}

/// Self-describing envelope around the serialized network.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModelCheckpoint {
    version: u32,
    input_size: usize,
    hidden_sizes: Vec<usize>,
    output_size: usize,
    actions: Vec<String>,
    saved_at: DateTime<Utc>,
    /// blake3 of `params`, hex encoded.
    digest: String,
    params: Vec<u8>,
}

impl ModelCheckpoint {
    const VERSION: u32 = 1;

    fn seal(network: &QNetwork) -> Result<Self> {
        let params = bincode::serialize(network).context("Failed to encode network weights")?;
        Ok(Self {
            version: Self::VERSION,
            input_size: network.input_size(),
            hidden_sizes: network.hidden_sizes(),
            output_size: network.output_size(),
            actions: Action::ALL.iter().map(|a| a.name().to_string()).collect(),
            saved_at: Utc::now(),
            digest: blake3::hash(&params).to_hex().to_string(),
            params,
        })
    }

    /// Decode the network if the envelope matches the expected architecture.
    fn open(self, input_size: usize, hidden_sizes: &[usize]) -> Result<QNetwork> {
        if self.version != Self::VERSION {
            return Err(anyhow!(
                "Unsupported model checkpoint version {} (expected {})",
                self.version,
                Self::VERSION
            ));
        }
        let expected_actions: Vec<&str> = Action::ALL.iter().map(|a| a.name()).collect();
        if self.actions != expected_actions {
            return Err(anyhow!(
                "Checkpoint action order {:?} differs from {:?}",
                self.actions,
                expected_actions
            ));
        }
        if self.input_size != input_size
            || self.hidden_sizes != hidden_sizes
            || self.output_size != Action::COUNT
        {
            return Err(anyhow!(
                "Checkpoint architecture {}-{:?}-{} differs from configured {}-{:?}-{}",
                self.input_size,
                self.hidden_sizes,
                self.output_size,
                input_size,
                hidden_sizes,
                Action::COUNT
            ));
        }
        let digest = blake3::hash(&self.params).to_hex().to_string();
        if digest != self.digest {
            return Err(anyhow!("Checkpoint digest mismatch, weights are corrupt"));
        }

        let network: QNetwork =
            bincode::deserialize(&self.params).context("Failed to decode network weights")?;
        if network.input_size() != input_size || network.output_size() != Action::COUNT {
            return Err(anyhow!("Decoded network does not match its envelope"));
        }
        Ok(network)
    }
}

pub struct ApproximateEstimator {
    network: QNetwork,
    replay: ReplayBuffer,
    gamma: f64,
    batch_size: usize,
}

impl ApproximateEstimator {
    pub fn new(settings: &Settings) -> Self {
        let input_size = StateEncoder::new(settings.encoder.max_obstacles).feature_len();
        let mut rng = match settings.exploration.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let network = QNetwork::new(
            input_size,
            &settings.network.hidden_layers,
            Action::COUNT,
            settings.network.learning_rate,
            &mut rng,
        );
        Self::with_network(network, settings)
    }

    fn with_network(network: QNetwork, settings: &Settings) -> Self {
        Self {
            network,
            replay: ReplayBuffer::new(settings.replay.capacity, settings.exploration.seed),
            gamma: settings.learning.gamma,
            batch_size: settings.replay.batch_size,
        }
    }

    /// Restore the network from `store` when its checkpoint matches the
    /// configured architecture; otherwise start from fresh weights.
    pub fn load_or_new(settings: &Settings, store: &PersistenceManager) -> Result<Self> {
        let input_size = StateEncoder::new(settings.encoder.max_obstacles).feature_len();
        let Some(checkpoint) = store.load::<ModelCheckpoint>() else {
            return Ok(Self::new(settings));
        };

        let saved_at = checkpoint.saved_at;
        match checkpoint.open(input_size, &settings.network.hidden_layers) {
            Ok(mut network) => {
                info!(
                    "Q-network restored from {:?} (saved {}, {} optimizer steps)",
                    store.path(),
                    saved_at,
                    network.steps()
                );
                let configured = settings.network.learning_rate;
                if network.learning_rate() != configured {
                    info!(
                        "Learning rate changed from {} to {}",
                        network.learning_rate(),
                        configured
                    );
                    network.set_learning_rate(configured);
                }
                Ok(Self::with_network(network, settings))
            }
            Err(e) => {
                warn!("Ignoring model checkpoint {:?}: {:#}", store.path(), e);
                Ok(Self::new(settings))
            }
        }
    }

    pub fn network(&self) -> &QNetwork {
        &self.network
    }

    pub fn replay_len(&self) -> usize {
        self.replay.len()
    }

    pub fn remember(&mut self, transition: Transition) {
        self.replay.remember(transition);
    }

    fn stack(&self, rows: impl Iterator<Item = Vec<f64>>, count: usize) -> Result<Array2<f64>> {
        let width = self.network.input_size();
        let flat: Vec<f64> = rows.flatten().collect();
        Array2::from_shape_vec((count, width), flat)
            .map_err(|e| anyhow!("Feature vectors do not match network input size {}: {}", width, e))
    }

    /// One fitting pass over `batch`. The target at the taken action is
    /// `r` for terminal transitions and `r + γ max_a Q(s', a)` otherwise;
    /// every other output keeps its current prediction so it receives no
    /// gradient. Returns the pre-step loss.
    pub fn update(&mut self, batch: &[Transition]) -> Result<f64> {
        let n = batch.len();
        let states = self.stack(batch.iter().map(|t| t.state.features.clone()), n)?;
        let next_states = self.stack(batch.iter().map(|t| t.next_state.features.clone()), n)?;

        let mut targets = self.network.predict_batch(&states);
        let next_q = self.network.predict_batch(&next_states);

        for (i, transition) in batch.iter().enumerate() {
            let target = if transition.terminal {
                transition.reward
            } else {
                let row: ActionValues = std::array::from_fn(|a| next_q[[i, a]]);
                transition.reward + self.gamma * max_value(&row)
            };
            targets[[i, transition.action.index()]] = target;
        }

        let loss = self.network.fit_batch(&states, &targets)?;
        debug!("Replay refit on {} transitions, loss={:.4}", n, loss);
        Ok(loss)
    }
}

impl ValueEstimator for ApproximateEstimator {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::Approximate
    }

    fn action_values(&self, state: &EncodedState) -> ActionValues {
        if state.features.len() != self.network.input_size() {
            warn!(
                "Feature vector of length {} does not fit network input {}",
                state.features.len(),
                self.network.input_size()
            );
            return [0.0; Action::COUNT];
        }
        let output = self.network.predict(ArrayView1::from(&state.features[..]));
        std::array::from_fn(|a| output[a])
    }

    fn learn(&mut self, transition: Transition) -> Result<()> {
        self.remember(transition);
        Ok(())
    }

    fn end_epoch(&mut self) -> Result<EpochOutcome> {
        match self.replay.sample(self.batch_size) {
            Ok(batch) => {
                let loss = self.update(&batch)?;
                Ok(EpochOutcome::Refit {
                    batch_size: batch.len(),
                    loss,
                })
            }
            Err(ReplayError::InsufficientData {
                requested,
                available,
            }) => Ok(EpochOutcome::Skipped {
                available,
                required: requested,
            }),
        }
    }

    fn checkpoint_cadence(&self) -> CheckpointCadence {
        CheckpointCadence::EveryEpoch
    }

    fn save(&self, store: &PersistenceManager) -> Result<()> {
        store.save(&ModelCheckpoint::seal(&self.network)?)
    }

    fn summary(&self) -> String {
        let mut dims = vec![self.network.input_size()];
        dims.extend(self.network.hidden_sizes());
        dims.push(self.network.output_size());
        let arch = dims
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join("-");
        format!(
            "Q-network {} ({} optimizer steps), replay {} transitions, batch {}",
            arch,
            self.network.steps(),
            self.replay.len(),
            self.batch_size
        )
    }
}
