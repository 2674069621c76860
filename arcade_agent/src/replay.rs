//! Experience replay buffer for the approximate estimator.

use rand::rngs::StdRng;
use rand::seq::index;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::error::ReplayError;
use crate::estimator::Transition;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Transitions per refit.
    pub batch_size: usize,
    /// Maximum stored transitions; `0` means unbounded.
    pub capacity: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            capacity: 50_000,
        }
    }
}

#[derive(Debug)]
pub struct ReplayBuffer {
    transitions: VecDeque<Transition>,
    capacity: Option<usize>,
    rng: StdRng,
}

impl ReplayBuffer {
    /// `capacity == 0` keeps every transition.
    pub fn new(capacity: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            transitions: VecDeque::new(),
            capacity: (capacity > 0).then_some(capacity),
            rng,
        }
    }

    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Append, evicting the oldest transition when full.
    pub fn remember(&mut self, transition: Transition) {
        if let Some(capacity) = self.capacity {
            while self.transitions.len() >= capacity {
                self.transitions.pop_front();
            }
        }
        self.transitions.push_back(transition);
    }

    /// `n` distinct transitions chosen uniformly at random.
    pub fn sample(&mut self, n: usize) -> Result<Vec<Transition>, ReplayError> {
        if n > self.transitions.len() {
            return Err(ReplayError::InsufficientData {
                requested: n,
                available: self.transitions.len(),
            });
        }
        Ok(index::sample(&mut self.rng, self.transitions.len(), n)
            .into_iter()
            .map(|i| self.transitions[i].clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{EncodedState, StateKey};
    use crate::protocol::Action;
    use std::collections::HashSet;

    fn transition(id: usize) -> Transition {
        let state = EncodedState {
            key: StateKey::from_raw(format!("s{}", id)),
            features: vec![id as f64],
        };
        Transition {
            state: state.clone(),
            action: Action::Up,
            reward: id as f64,
            next_state: state,
            terminal: false,
        }
    }

    #[test]
    fn test_sample_without_replacement() {
        let mut buffer = ReplayBuffer::new(0, Some(3));
        for i in 0..10 {
            buffer.remember(transition(i));
        }
        for _ in 0..20 {
            let batch = buffer.sample(10).unwrap();
            let ids: HashSet<u64> = batch.iter().map(|t| t.reward as u64).collect();
            assert_eq!(ids.len(), 10);
        }
        assert_eq!(buffer.sample(0).unwrap().len(), 0);
    }

    #[test]
    fn test_sample_more_than_available_fails() {
        let mut buffer = ReplayBuffer::new(0, Some(3));
        buffer.remember(transition(0));
        buffer.remember(transition(1));
        assert_eq!(
            buffer.sample(3).unwrap_err(),
            ReplayError::InsufficientData {
                requested: 3,
                available: 2
            }
        );
    }

    #[test]
    fn test_bounded_buffer_evicts_oldest_first() {
        let mut buffer = ReplayBuffer::new(3, Some(3));
        for i in 0..5 {
            buffer.remember(transition(i));
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.capacity(), Some(3));

        let rewards: HashSet<u64> = buffer
            .sample(3)
            .unwrap()
            .iter()
            .map(|t| t.reward as u64)
            .collect();
        assert_eq!(rewards, HashSet::from([2, 3, 4]));
    }

    #[test]
    fn test_unbounded_buffer_keeps_everything() {
        let mut buffer = ReplayBuffer::new(0, None);
        assert!(buffer.is_empty());
        for i in 0..1000 {
            buffer.remember(transition(i));
        }
        assert_eq!(buffer.len(), 1000);
        assert_eq!(buffer.capacity(), None);
    }
}
