//! Turns raw observations into table keys and fixed-length feature vectors.

use serde::Serialize;
use std::fmt;

use crate::protocol::{Observation, Position};

/// Number of leading scalar features before the obstacle pairs.
pub const BASE_FEATURES: usize = 5;

/// Canonical key of an observation in the Q-table.
///
/// Obstacles are sorted by `(left, top)` before serialization, so the
/// enumeration order the game happens to use never splits one state into
/// several table rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey(String);

impl StateKey {
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Input of the approximate estimator. Always `5 + 2 * max_obstacles` long.
pub type FeatureVector = Vec<f64>;

/// Both representations of one observation, computed once per message.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedState {
    pub key: StateKey,
    pub features: FeatureVector,
}

#[derive(Serialize)]
struct KeyRepr {
    mario_position: (f64, f64),
    zombies_positions: Vec<(f64, f64)>,
    score: i64,
    collision: bool,
}

/// Deterministic, stateless encoder.
#[derive(Debug, Clone, Copy)]
pub struct StateEncoder {
    max_obstacles: usize,
}

impl StateEncoder {
    pub fn new(max_obstacles: usize) -> Self {
        Self { max_obstacles }
    }

    /// Length of every vector produced by [`encode_features`](Self::encode_features).
    pub fn feature_len(&self) -> usize {
        BASE_FEATURES + 2 * self.max_obstacles
    }

    pub fn encode(&self, observation: &Observation) -> EncodedState {
        EncodedState {
            key: self.encode_key(observation),
            features: self.encode_features(observation),
        }
    }

    pub fn encode_key(&self, observation: &Observation) -> StateKey {
        let mut zombies: Vec<(f64, f64)> = observation
            .zombies
            .iter()
            .map(|z| (z.left, z.top))
            .collect();
        zombies.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));

        let repr = KeyRepr {
            mario_position: (observation.mario.left, observation.mario.top),
            zombies_positions: zombies,
            score: observation.score,
            collision: observation.collision,
        };

        // Serializing plain numbers, bools and tuples cannot fail; non-finite
        // floats degrade to `null`, which still yields a stable key.
        StateKey(serde_json::to_string(&repr).unwrap_or_default())
    }

    /// Obstacles past the first `max_obstacles` are dropped; missing ones
    /// are zero-padded.
    pub fn encode_features(&self, observation: &Observation) -> FeatureVector {
        let mut features = Vec::with_capacity(self.feature_len());
        features.push(observation.mario.left);
        features.push(observation.mario.top);
        features.push(observation.score as f64);
        features.push(if observation.collision { 1.0 } else { 0.0 });
        features.push(observation.zombies.len() as f64);

        for Position { left, top } in observation.zombies.iter().take(self.max_obstacles) {
            features.push(*left);
            features.push(*top);
        }
        features.resize(self.feature_len(), 0.0);
        features
    }
}
