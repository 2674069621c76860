//! Wire messages exchanged with the game process, and the action set.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Type tag of the only inbound message the agent reacts to.
pub const GAME_STATE_TYPE: &str = "game_state";

/// Discrete moves the agent can ask the game to perform.
///
/// The ordinal of each variant indexes the approximate estimator's output
/// layer and is baked into saved checkpoints. Never reorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Action {
    Up,
    Down,
    Left,
    Right,
    Stay,
}

impl Action {
    pub const COUNT: usize = 5;

    /// All actions in ordinal order.
    pub const ALL: [Action; Action::COUNT] = [
        Action::Up,
        Action::Down,
        Action::Left,
        Action::Right,
        Action::Stay,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Action::Up => "Up",
            Action::Down => "Down",
            Action::Left => "Left",
            Action::Right => "Right",
            Action::Stay => "Stay",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Action {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|action| action.name() == s)
            .ok_or_else(|| anyhow!("Unknown action name: {}", s))
    }
}

/// Screen position as reported by the game (CSS `left`/`top`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub left: f64,
    pub top: f64,
}

impl Position {
    pub fn new(left: f64, top: f64) -> Self {
        Self { left, top }
    }
}

/// One snapshot of the game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub mario: Position,
    #[serde(default)]
    pub zombies: Vec<Position>,
    pub score: i64,
    pub collision: bool,
}

/// Result of decoding one inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Observation(Observation),
    /// A well-formed message of some other type; ignored by the agent.
    Other(String),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Decode an inbound frame. Messages of other types are returned as
/// [`Inbound::Other`]; only a malformed envelope or a malformed
/// `game_state` body is an error.
pub fn parse_inbound(text: &str) -> Result<Inbound> {
    let envelope: Envelope = serde_json::from_str(text)
        .map_err(|e| anyhow!("Invalid message envelope: {}", e))?;

    if envelope.kind != GAME_STATE_TYPE {
        return Ok(Inbound::Other(envelope.kind));
    }

    let observation: Observation = serde_json::from_value(envelope.data)
        .map_err(|e| anyhow!("Invalid game_state body: {}", e))?;
    Ok(Inbound::Observation(observation))
}

/// Messages the agent sends back to the game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Outbound {
    #[serde(rename = "ai_move")]
    AiMove(Action),
}

impl Outbound {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
