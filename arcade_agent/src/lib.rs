//! Arcade Agent - Core Library
//!
//! A Q-learning agent that plays a WebSocket arcade game: it answers every
//! game-state message with a move, learns from the rewards that follow, and
//! checkpoints what it has learned so training continues across restarts.

pub mod agent;
pub mod channel;
pub mod cli;
pub mod encoder;
pub mod error;
pub mod estimator;
pub mod message_loop;
pub mod persistence;
pub mod policy;
pub mod protocol;
pub mod replay;
pub mod reward;
pub mod runner;
pub mod settings;
pub mod supervisor;
pub mod telemetry;

pub use agent::LearningAgent;
pub use supervisor::ConnectionSupervisor;
