//! Connection supervisor: keeps the agent attached to the game.
//!
//! The supervisor cycles `Disconnected -> Connecting -> Connected ->
//! Disconnected` forever, pausing for a fixed delay after every failed
//! attempt and every finished session. Only the shutdown future passed to
//! [`ConnectionSupervisor::run`] ends it.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

use crate::agent::{LearningAgent, SessionStats};
use crate::channel::Connector;
use crate::message_loop::MessageLoop;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorState::Disconnected => f.write_str("disconnected"),
            SupervisorState::Connecting => f.write_str("connecting"),
            SupervisorState::Connected => f.write_str("connected"),
        }
    }
}

/// Totals reported when the supervisor stops.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SupervisorReport {
    pub attempts: u64,
    pub sessions: u64,
    pub totals: SessionStats,
}

pub struct ConnectionSupervisor {
    connector: Arc<dyn Connector>,
    agent: LearningAgent,
    reconnect_delay: Duration,
    state: watch::Sender<SupervisorState>,
    report: SupervisorReport,
    /// Counters of the session in progress.
    session: SessionStats,
}

impl ConnectionSupervisor {
    pub fn new(
        connector: Arc<dyn Connector>,
        agent: LearningAgent,
        reconnect_delay: Duration,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::Disconnected);
        Self {
            connector,
            agent,
            reconnect_delay,
            state,
            report: SupervisorReport::default(),
            session: SessionStats::default(),
        }
    }

    /// Follow state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Supervise connections until `shutdown` resolves, then write a final
    /// checkpoint.
    pub async fn run<F>(&mut self, shutdown: F) -> SupervisorReport
    where
        F: Future<Output = ()>,
    {
        info!(
            "Supervising connection to {} (reconnect delay {:?})",
            self.connector.endpoint(),
            self.reconnect_delay
        );

        tokio::select! {
            _ = shutdown => info!("Shutdown requested"),
            _ = self.supervise() => {}
        }

        let interrupted = std::mem::take(&mut self.session);
        self.report.totals.absorb(&interrupted);
        self.set_state(SupervisorState::Disconnected);
        self.agent.shutdown();
        info!(
            "Supervisor stopped after {} attempts and {} sessions, {} decisions in total",
            self.report.attempts,
            self.report.sessions,
            self.report.totals.decisions()
        );
        self.report.clone()
    }

    async fn supervise(&mut self) {
        loop {
            self.report.attempts += 1;
            self.set_state(SupervisorState::Connecting);

            match self.connector.connect().await {
                Ok(mut channel) => {
                    self.report.sessions += 1;
                    self.set_state(SupervisorState::Connected);

                    let session_id = Uuid::new_v4();
                    let span = info_span!("session", id = %session_id, n = self.report.sessions);
                    info!(parent: &span, "Connected to {}", self.connector.endpoint());

                    let exit = MessageLoop::new(&mut self.agent, channel.as_mut(), &mut self.session)
                        .run()
                        .instrument(span.clone())
                        .await;
                    let finished = std::mem::take(&mut self.session);
                    self.report.totals.absorb(&finished);
                    info!(parent: &span, "Disconnected: {}", exit);
                }
                Err(e) => {
                    error!(
                        "Connection attempt {} failed: {}",
                        self.report.attempts, e
                    );
                }
            }

            self.set_state(SupervisorState::Disconnected);
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }

    fn set_state(&self, state: SupervisorState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Supervisor state {} -> {}", previous, state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{MemoryChannel, MemoryConnector, MemoryPeer};
    use crate::encoder::EncodedState;
    use crate::estimator::{
        ActionValues, CheckpointCadence, EpochOutcome, EstimatorKind, Transition, ValueEstimator,
    };
    use crate::persistence::PersistenceManager;
    use crate::protocol::Action;
    use crate::settings::Settings;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::tempdir;
    use tokio::sync::oneshot;

    /// Keeps every transition it is taught.
    struct RecordingEstimator {
        transitions: Arc<Mutex<Vec<Transition>>>,
    }

    impl ValueEstimator for RecordingEstimator {
        fn kind(&self) -> EstimatorKind {
            EstimatorKind::Tabular
        }

        fn action_values(&self, _state: &EncodedState) -> ActionValues {
            [0.0; Action::COUNT]
        }

        fn learn(&mut self, transition: Transition) -> anyhow::Result<()> {
            self.transitions.lock().unwrap().push(transition);
            Ok(())
        }

        fn end_epoch(&mut self) -> anyhow::Result<EpochOutcome> {
            Ok(EpochOutcome::Idle)
        }

        fn checkpoint_cadence(&self) -> CheckpointCadence {
            CheckpointCadence::EveryEpoch
        }

        fn save(&self, _store: &PersistenceManager) -> anyhow::Result<()> {
            Ok(())
        }

        fn summary(&self) -> String {
            "recording".to_string()
        }
    }

    fn agent(dir: &std::path::Path) -> LearningAgent {
        let mut settings = Settings::default();
        settings.exploration.seed = Some(8);
        settings.persistence.table_path = dir.join("q_table.json");
        LearningAgent::from_settings(&settings).unwrap()
    }

    fn game_state_at(x: f64) -> String {
        json!({
            "type": "game_state",
            "data": {"mario": {"left": x, "top": 0.0}, "zombies": [], "score": 0, "collision": false}
        })
        .to_string()
    }

    async fn play(peer: &mut MemoryPeer, xs: &[f64]) {
        for &x in xs {
            assert!(peer.send(game_state_at(x)));
            assert!(peer.recv().await.is_some());
        }
        peer.hang_up();
    }

    fn game_state() -> String {
        json!({
            "type": "game_state",
            "data": {"mario": {"left": 1.0, "top": 2.0}, "zombies": [], "score": 0, "collision": false}
        })
        .to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_failures_with_fixed_delay() {
        let dir = tempdir().unwrap();
        let delay = Duration::from_millis(200);
        let (channel, mut peer) = MemoryChannel::pair();
        let connector = Arc::new(MemoryConnector::failing_then(3, channel));

        let mut supervisor = ConnectionSupervisor::new(connector.clone(), agent(dir.path()), delay);
        let mut states = supervisor.subscribe();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let report = supervisor
                .run(async {
                    let _ = stop_rx.await;
                })
                .await;
            (supervisor, report)
        });

        states
            .wait_for(|state| *state == SupervisorState::Connected)
            .await
            .unwrap();
        assert!(peer.send(game_state()));
        assert!(peer.recv().await.is_some());
        stop_tx.send(()).unwrap();

        let (supervisor, report) = handle.await.unwrap();
        assert_eq!(report.attempts, 4);
        assert_eq!(report.sessions, 1);
        assert_eq!(supervisor.state(), SupervisorState::Disconnected);

        let attempts = connector.attempts().await;
        assert_eq!(attempts.len(), 4);
        for pair in attempts.windows(2) {
            assert!(pair[1] - pair[0] >= delay);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_gives_up_while_connections_fail() {
        let dir = tempdir().unwrap();
        let connector = Arc::new(MemoryConnector::new(Vec::<Result<MemoryChannel, String>>::new()));
        let mut supervisor = ConnectionSupervisor::new(
            connector.clone(),
            agent(dir.path()),
            Duration::from_millis(200),
        );

        let report = supervisor
            .run(tokio::time::sleep(Duration::from_millis(2_050)))
            .await;
        assert_eq!(report.sessions, 0);
        assert_eq!(report.attempts, 11);
        assert_eq!(connector.attempts().await.len(), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_end_leads_to_reconnect() {
        let dir = tempdir().unwrap();
        let (first, first_peer) = MemoryChannel::pair();
        let (second, mut second_peer) = MemoryChannel::pair();
        drop(first_peer);
        let connector = Arc::new(MemoryConnector::new(vec![Ok(first), Ok(second)]));

        let mut supervisor =
            ConnectionSupervisor::new(connector.clone(), agent(dir.path()), Duration::from_millis(200));
        let mut states = supervisor.subscribe();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            supervisor
                .run(async {
                    let _ = stop_rx.await;
                })
                .await
        });

        assert!(second_peer.send(game_state()));
        assert!(second_peer.recv().await.is_some());
        second_peer.hang_up();
        states
            .wait_for(|state| *state == SupervisorState::Disconnected)
            .await
            .unwrap();
        stop_tx.send(()).unwrap();

        let report = handle.await.unwrap();
        assert_eq!(report.sessions, 2);
        assert!(report.attempts >= 2);
        assert_eq!(report.totals.decisions(), 1);
        assert!(dir.path().join("q_table.json").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_decision_not_carried_across_reconnect() {
        let dir = tempdir().unwrap();
        let mut settings = Settings::default();
        settings.exploration.seed = Some(4);
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let estimator = Box::new(RecordingEstimator {
            transitions: transitions.clone(),
        });
        let store = PersistenceManager::json(dir.path().join("unused.json"));
        let agent = LearningAgent::new(estimator, store, &settings);

        let (first, mut first_peer) = MemoryChannel::pair();
        let (second, mut second_peer) = MemoryChannel::pair();
        let connector = Arc::new(MemoryConnector::new(vec![Ok(first), Ok(second)]));
        let mut supervisor =
            ConnectionSupervisor::new(connector.clone(), agent, Duration::from_millis(200));
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            supervisor
                .run(async {
                    let _ = stop_rx.await;
                })
                .await
        });

        play(&mut first_peer, &[1.0, 2.0]).await;
        play(&mut second_peer, &[10.0, 20.0, 30.0]).await;
        // the third attempt finds the script exhausted, so both sessions ended
        while connector.attempts().await.len() < 3 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        stop_tx.send(()).unwrap();

        let report = handle.await.unwrap();
        assert_eq!(report.sessions, 2);
        assert_eq!(report.totals.decisions(), 5);
        assert_eq!(report.totals.updates, (2 - 1) + (3 - 1));

        let transitions = transitions.lock().unwrap();
        let pairs: Vec<(f64, f64)> = transitions
            .iter()
            .map(|t| (t.state.features[0], t.next_state.features[0]))
            .collect();
        assert_eq!(pairs, vec![(1.0, 2.0), (10.0, 20.0), (20.0, 30.0)]);
    }
}
