//! Per-connection decision loop.
//!
//! Every observation is answered before any learning happens for it, and
//! the observation also completes the transition started by the previous
//! decision. The pending decision is local to one loop and never survives a
//! reconnect.

use std::fmt;
use tracing::{info, trace, warn};

use crate::agent::{LearningAgent, SessionStats};
use crate::channel::{Channel, ChannelEvent};
use crate::error::ChannelError;
use crate::encoder::EncodedState;
use crate::protocol::{parse_inbound, Action, Inbound, Observation, Outbound};

/// Why a message loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// The game closed the connection.
    Closed,
    /// The transport failed while receiving.
    Failed(String),
    /// A reply could not be sent.
    SendFailed(String),
}

impl fmt::Display for LoopExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopExit::Closed => f.write_str("connection closed"),
            LoopExit::Failed(reason) => write!(f, "receive failed: {}", reason),
            LoopExit::SendFailed(reason) => write!(f, "send failed: {}", reason),
        }
    }
}

pub struct MessageLoop<'a> {
    agent: &'a mut LearningAgent,
    channel: &'a mut dyn Channel,
    previous: Option<(EncodedState, Action)>,
    stats: &'a mut SessionStats,
}

impl<'a> MessageLoop<'a> {
    /// Counters go to `stats`, which outlives the loop so a cancelled
    /// session still reports what it did.
    pub fn new(
        agent: &'a mut LearningAgent,
        channel: &'a mut dyn Channel,
        stats: &'a mut SessionStats,
    ) -> Self {
        Self {
            agent,
            channel,
            previous: None,
            stats,
        }
    }

    pub fn stats(&self) -> &SessionStats {
        &*self.stats
    }

    /// Handle messages until the channel closes, fails, or rejects a reply.
    pub async fn run(&mut self) -> LoopExit {
        let exit = loop {
            let text = match self.channel.recv().await {
                ChannelEvent::Message(text) => text,
                ChannelEvent::Closed => break LoopExit::Closed,
                ChannelEvent::Failed(reason) => break LoopExit::Failed(reason),
            };
            self.stats.messages += 1;

            let observation = match parse_inbound(&text) {
                Ok(Inbound::Observation(observation)) => observation,
                Ok(Inbound::Other(kind)) => {
                    self.stats.ignored += 1;
                    trace!("Ignoring message of type '{}'", kind);
                    continue;
                }
                Err(e) => {
                    self.stats.dropped += 1;
                    warn!("Dropping malformed message: {:#}", e);
                    continue;
                }
            };

            if let Err(exit) = self.handle(observation).await {
                break exit;
            }
        };

        let stats = &*self.stats;
        info!(
            "Session ended ({}): messages={}, decisions={} (explore={}, exploit={}), updates={}, reward={:.1}, dropped={}",
            exit,
            stats.messages,
            stats.decisions(),
            stats.explore,
            stats.exploit,
            stats.updates,
            stats.cumulative_reward,
            stats.dropped
        );
        exit
    }

    async fn handle(&mut self, observation: Observation) -> Result<(), LoopExit> {
        self.stats.observations += 1;

        let decision = self.agent.decide(&observation);
        self.stats.record_selection(decision.selection.mode);

        let reply = Outbound::AiMove(decision.selection.action)
            .to_json()
            .map_err(|e| LoopExit::SendFailed(e.to_string()))?;
        self.channel.send(reply).await.map_err(|e| match e {
            ChannelError::Send(reason) => LoopExit::SendFailed(reason),
            other => LoopExit::SendFailed(other.to_string()),
        })?;

        if let Some(previous) = self.previous.take() {
            let reward = self.agent.learn(previous, &observation, &decision.state);
            self.stats.record_update(reward);
        }
        self.previous = Some((decision.state, decision.selection.action));

        if let Some(report) = self.agent.tick() {
            info!(
                "Epoch {} complete: epsilon={:.4}, outcome={:?}, session decisions={} (explore={}, exploit={}), reward={:.1}",
                report.epoch,
                report.epsilon,
                report.outcome,
                self.stats.decisions(),
                self.stats.explore,
                self.stats.exploit,
                self.stats.cumulative_reward
            );
        }
        Ok(())
    }
}
