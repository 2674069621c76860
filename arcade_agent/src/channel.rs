//! Bidirectional text channel to the game, and the connectors that open it.
//!
//! [`WebSocketConnector`] is the production transport. [`MemoryConnector`]
//! hands out in-process channels from a script of outcomes and records when
//! each attempt was made; it drives the agent without a game server.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use crate::error::ChannelError;

/// Result of waiting for the next inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Message(String),
    /// The peer closed the connection.
    Closed,
    /// Transport error; the channel is unusable.
    Failed(String),
}

#[async_trait]
pub trait Channel: Send {
    /// Next text message. Non-text frames are consumed silently.
    async fn recv(&mut self) -> ChannelEvent;

    async fn send(&mut self, text: String) -> Result<(), ChannelError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Address shown in logs.
    fn endpoint(&self) -> &str;

    async fn connect(&self) -> Result<Box<dyn Channel>, ChannelError>;
}

pub struct WebSocketConnector {
    url: String,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    fn endpoint(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> Result<Box<dyn Channel>, ChannelError> {
        // connect_async can hang on hosts that accept TCP but never upgrade
        let (stream, _) = match timeout(self.connect_timeout, connect_async(self.url.as_str())).await
        {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                return Err(ChannelError::Connect {
                    url: self.url.clone(),
                    message: e.to_string(),
                })
            }
            Err(_) => {
                return Err(ChannelError::ConnectTimeout {
                    url: self.url.clone(),
                    timeout: self.connect_timeout,
                })
            }
        };
        debug!("WebSocket handshake with {} complete", self.url);
        Ok(Box::new(WebSocketChannel { stream }))
    }
}

pub struct WebSocketChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Channel for WebSocketChannel {
    async fn recv(&mut self) -> ChannelEvent {
        while let Some(msg) = self.stream.next().await {
            match msg {
                Ok(Message::Text(text)) => return ChannelEvent::Message(text),
                Ok(Message::Close(frame)) => {
                    debug!("Close frame received: {:?}", frame);
                    return ChannelEvent::Closed;
                }
                Ok(Message::Binary(data)) => {
                    trace!("Ignoring {} byte binary frame", data.len());
                }
                // tungstenite queues the pong reply itself
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                Err(tungstenite::Error::ConnectionClosed)
                | Err(tungstenite::Error::AlreadyClosed) => return ChannelEvent::Closed,
                Err(e) => return ChannelEvent::Failed(e.to_string()),
            }
        }
        ChannelEvent::Closed
    }

    async fn send(&mut self, text: String) -> Result<(), ChannelError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| ChannelError::Send(e.to_string()))
    }
}

/// In-process channel; the other end is a [`MemoryPeer`].
pub struct MemoryChannel {
    inbound: mpsc::UnboundedReceiver<ChannelEvent>,
    outbound: mpsc::UnboundedSender<String>,
}

/// Game side of a [`MemoryChannel`]. Dropping it, or calling
/// [`hang_up`](MemoryPeer::hang_up), closes the channel once everything
/// already sent has been received.
pub struct MemoryPeer {
    inbound: Option<mpsc::UnboundedSender<ChannelEvent>>,
    outbound: mpsc::UnboundedReceiver<String>,
}

impl MemoryChannel {
    pub fn pair() -> (MemoryChannel, MemoryPeer) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        (
            MemoryChannel {
                inbound: inbound_rx,
                outbound: outbound_tx,
            },
            MemoryPeer {
                inbound: Some(inbound_tx),
                outbound: outbound_rx,
            },
        )
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn recv(&mut self) -> ChannelEvent {
        self.inbound.recv().await.unwrap_or(ChannelEvent::Closed)
    }

    async fn send(&mut self, text: String) -> Result<(), ChannelError> {
        self.outbound
            .send(text)
            .map_err(|_| ChannelError::Send("peer dropped".to_string()))
    }
}

impl MemoryPeer {
    /// Queue a text message for the agent. Returns `false` once the agent
    /// side is gone.
    pub fn send(&self, text: impl Into<String>) -> bool {
        self.push(ChannelEvent::Message(text.into()))
    }

    /// Make the agent's next receive report a transport failure.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.push(ChannelEvent::Failed(reason.into()))
    }

    /// Close the agent's inbound side while still collecting its replies.
    pub fn hang_up(&mut self) {
        self.inbound = None;
    }

    fn push(&self, event: ChannelEvent) -> bool {
        self.inbound
            .as_ref()
            .map_or(false, |inbound| inbound.send(event).is_ok())
    }

    /// Next message the agent sent, or `None` once its side is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    /// Everything the agent has sent so far, without waiting.
    pub fn drain(&mut self) -> Vec<String> {
        let mut sent = Vec::new();
        while let Ok(text) = self.outbound.try_recv() {
            sent.push(text);
        }
        sent
    }
}

/// Scripted [`Connector`]: each attempt pops the next outcome, and an
/// exhausted script refuses every further attempt.
pub struct MemoryConnector {
    script: Mutex<VecDeque<Result<MemoryChannel, String>>>,
    attempts: Mutex<Vec<Instant>>,
}

impl MemoryConnector {
    pub fn new(script: impl IntoIterator<Item = Result<MemoryChannel, String>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            attempts: Mutex::new(Vec::new()),
        }
    }

    /// `failures` refused attempts followed by one that succeeds.
    pub fn failing_then(failures: usize, channel: MemoryChannel) -> Self {
        let script = (0..failures)
            .map(|i| Err(format!("refused (scripted failure {})", i + 1)))
            .chain(std::iter::once(Ok(channel)));
        Self::new(script)
    }

    /// Instants at which `connect` was called.
    pub async fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().await.clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn endpoint(&self) -> &str {
        "memory"
    }

    async fn connect(&self) -> Result<Box<dyn Channel>, ChannelError> {
        self.attempts.lock().await.push(Instant::now());
        match self.script.lock().await.pop_front() {
            Some(Ok(channel)) => Ok(Box::new(channel)),
            Some(Err(message)) => Err(ChannelError::Connect {
                url: self.endpoint().to_string(),
                message,
            }),
            None => Err(ChannelError::Connect {
                url: self.endpoint().to_string(),
                message: "no more scripted connections".to_string(),
            }),
        }
    }
}
