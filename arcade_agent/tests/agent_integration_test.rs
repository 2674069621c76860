//! Integration tests for the arcade agent.
//!
//! These drive the full stack (supervisor, message loop, estimators and
//! checkpoints) against a local WebSocket game server and against
//! in-memory channels, and check that learning survives a restart.

use anyhow::Result;
use arcade_agent::{
    channel::{MemoryChannel, MemoryConnector, MemoryPeer},
    encoder::{EncodedState, StateKey},
    estimator::{approximate::ApproximateEstimator, EstimatorKind, ValueEstimator},
    persistence::PersistenceManager,
    protocol::Action,
    runner,
    settings::Settings,
    LearningAgent,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing_test::traced_test;

/// Helper to build settings whose checkpoints live in `dir`
fn test_settings(dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.exploration.seed = Some(17);
    settings.connection.reconnect_delay_ms = 20;
    settings.persistence.table_path = dir.join("q_table.json");
    settings.persistence.model_path = dir.join("q_network.bin");
    settings
}

fn game_state(step: usize) -> String {
    json!({
        "type": "game_state",
        "data": {
            "mario": {"left": (step % 4) as f64 * 10.0, "top": 100.0},
            "zombies": [{"left": 200.0 - (step % 3) as f64, "top": 100.0}],
            "score": (step % 2) as i64,
            "collision": step % 7 == 6
        }
    })
    .to_string()
}

fn assert_valid_move(reply: &str) {
    let value: Value = serde_json::from_str(reply).unwrap();
    assert_eq!(value["type"], "ai_move");
    let name = value["data"].as_str().unwrap();
    assert!(name.parse::<Action>().is_ok(), "unexpected move {}", name);
}

/// Play `steps` observations through `peer`, waiting for each reply.
async fn play(peer: &mut MemoryPeer, steps: usize) -> Vec<String> {
    let mut replies = Vec::with_capacity(steps);
    for step in 0..steps {
        assert!(peer.send(game_state(step)));
        replies.push(peer.recv().await.unwrap());
    }
    replies
}

#[tokio::test]
#[traced_test]
async fn test_plays_against_websocket_server() -> Result<()> {
    let dir = tempdir()?;
    let mut settings = test_settings(dir.path());

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    settings.connection.url = format!("ws://{}", listener.local_addr()?);

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        ws.send(Message::Text(json!({"type": "hello"}).to_string()))
            .await
            .unwrap();

        let mut replies = Vec::new();
        for step in 0..3 {
            ws.send(Message::Text(game_state(step))).await.unwrap();
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        replies.push(text);
                        break;
                    }
                    Some(Ok(_)) => continue,
                    other => panic!("agent went away: {:?}", other),
                }
            }
        }
        let _ = ws.close(None).await;
        replies
    });

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let agent_settings = settings.clone();
    let agent = tokio::spawn(async move {
        runner::run(&agent_settings, async {
            let _ = stop_rx.await;
        })
        .await
    });

    let replies = server.await?;
    assert_eq!(replies.len(), 3);
    replies.iter().for_each(|r| assert_valid_move(r));

    stop_tx.send(()).unwrap();
    let report = agent.await??;
    assert_eq!(report.sessions, 1);
    assert!(report.attempts >= 1);

    let table: BTreeMap<String, BTreeMap<String, f64>> =
        serde_json::from_slice(&std::fs::read(&settings.persistence.table_path)?)?;
    assert!(table.len() >= 2);
    for row in table.values() {
        assert_eq!(row.len(), Action::COUNT);
    }
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_tabular_learning_survives_restart() -> Result<()> {
    let dir = tempdir()?;
    let settings = test_settings(dir.path());

    let (channel, mut peer) = MemoryChannel::pair();
    let connector = Arc::new(MemoryConnector::new(vec![Ok(channel)]));
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let run_settings = settings.clone();
    let agent = tokio::spawn(async move {
        runner::run_with(&run_settings, connector, async {
            let _ = stop_rx.await;
        })
        .await
    });

    let replies = play(&mut peer, 30).await;
    replies.iter().for_each(|r| assert_valid_move(r));
    peer.hang_up();
    stop_tx.send(()).unwrap();

    let report = agent.await??;
    assert_eq!(report.totals.decisions(), 30);
    assert_eq!(report.totals.updates, 29);

    let saved: BTreeMap<String, BTreeMap<String, f64>> =
        serde_json::from_slice(&std::fs::read(&settings.persistence.table_path)?)?;
    assert!(!saved.is_empty());

    let restarted = LearningAgent::from_settings(&settings)?;
    for (key, row) in &saved {
        let state = EncodedState {
            key: StateKey::from_raw(key.clone()),
            features: Vec::new(),
        };
        let values = restarted.estimator().action_values(&state);
        for action in Action::ALL {
            assert_eq!(values[action.index()], row[action.name()]);
        }
    }
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_approximate_estimator_refits_and_checkpoints() -> Result<()> {
    let dir = tempdir()?;
    let mut settings = test_settings(dir.path());
    settings.learning.estimator = EstimatorKind::Approximate;
    settings.learning.epoch_size = 4;
    settings.replay.batch_size = 4;
    settings.encoder.max_obstacles = 2;
    settings.network.hidden_layers = vec![8];

    let (channel, mut peer) = MemoryChannel::pair();
    let connector = Arc::new(MemoryConnector::new(vec![Ok(channel)]));
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let run_settings = settings.clone();
    let agent = tokio::spawn(async move {
        runner::run_with(&run_settings, connector, async {
            let _ = stop_rx.await;
        })
        .await
    });

    play(&mut peer, 12).await;
    peer.hang_up();
    stop_tx.send(()).unwrap();
    agent.await??;

    // Epoch 1 holds 3 transitions (skipped); epochs 2 and 3 refit once each.
    let store = PersistenceManager::bincode(&settings.persistence.model_path);
    assert!(store.exists());
    let restored = ApproximateEstimator::load_or_new(&settings, &store)?;
    assert_eq!(restored.network().steps(), 2);
    assert_eq!(restored.network().hidden_sizes(), vec![8]);

    let summary = runner::inspect(&settings)?;
    assert!(summary.contains("(present)"));
    assert!(summary.contains("Q-network 9-8-5 (2 optimizer steps)"));
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_corrupt_checkpoint_starts_fresh() -> Result<()> {
    let dir = tempdir()?;
    let settings = test_settings(dir.path());
    std::fs::write(&settings.persistence.table_path, b"{ not json")?;

    let agent = LearningAgent::from_settings(&settings)?;
    assert!(agent.estimator().summary().contains("0 states"));
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_environment_overrides_file_settings() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("agent.toml");
    std::fs::write(&path, "[connection]\nurl = \"ws://from-file:1\"\n")?;

    std::env::set_var("ARCADE__LEARNING__EPOCH_SIZE", "7");
    let loaded = Settings::load(Some(&path));
    std::env::remove_var("ARCADE__LEARNING__EPOCH_SIZE");

    let settings = loaded?;
    assert_eq!(settings.connection.url, "ws://from-file:1");
    assert_eq!(settings.learning.epoch_size, 7);
    Ok(())
}
