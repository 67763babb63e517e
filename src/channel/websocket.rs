//! WebSocket transport using tokio-tungstenite
//!
//! One background task per session owns the socket. It reconnects with
//! exponential backoff and replays every active subscription after each
//! connect, so subscriptions survive drops without the caller re-subscribing.

use super::protocol::{decode_frame, ClientMessage, ServerMessage, PONG_FRAME};
use super::transport::{EventSink, Transport, TransportEvent, TransportSession};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::token::AccessToken;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const CLIENT_NAME: &str = "occupi-rtc";

/// Commands from the session handle to the connection task
#[derive(Debug)]
enum SessionCommand {
    Subscribe(String),
    Unsubscribe(String),
    Close,
}

/// Production transport for the realtime service
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    config: SyncConfig,
}

impl WebSocketTransport {
    pub fn new(config: SyncConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, token: &AccessToken, events: EventSink) -> Result<Arc<dyn TransportSession>> {
        url::Url::parse(&self.config.realtime_url)?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(connection_loop(
            self.config.clone(),
            token.value.clone(),
            rx,
            events,
        ));

        Ok(Arc::new(WebSocketSession { commands: tx }))
    }
}

/// Handle to a running connection task. Dropping it stops the task.
struct WebSocketSession {
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl TransportSession for WebSocketSession {
    fn subscribe(&self, topic: &str) -> Result<()> {
        self.commands
            .send(SessionCommand::Subscribe(topic.to_string()))
            .map_err(|_| SyncError::Transport("session task stopped".into()))
    }

    fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.commands
            .send(SessionCommand::Unsubscribe(topic.to_string()))
            .map_err(|_| SyncError::Transport("session task stopped".into()))
    }

    fn close(&self) {
        let _ = self.commands.send(SessionCommand::Close);
    }
}

/// Why a single connection ended
enum SessionEnd {
    /// Caller closed the session
    Closed,
    /// Socket dropped or was rejected; eligible for reconnect
    Dropped(String),
}

/// Topics the caller wants, replayed on every connect
#[derive(Default)]
struct SessionState {
    topics: BTreeSet<String>,
}

impl SessionState {
    /// Apply a command received while offline; returns false on close
    fn apply_offline(&mut self, command: Option<SessionCommand>) -> bool {
        match command {
            Some(SessionCommand::Subscribe(topic)) => {
                self.topics.insert(topic);
                true
            }
            Some(SessionCommand::Unsubscribe(topic)) => {
                self.topics.remove(&topic);
                true
            }
            Some(SessionCommand::Close) | None => false,
        }
    }
}

/// Main connection task
async fn connection_loop(
    config: SyncConfig,
    token: String,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: EventSink,
) {
    let mut state = SessionState::default();
    let mut attempt = 0u32;

    loop {
        let _ = events.send(TransportEvent::Connecting);

        match run_connection(&config, &token, &mut state, &mut commands, &events, &mut attempt).await {
            SessionEnd::Closed => {
                debug!("Realtime session closed");
                return;
            }
            SessionEnd::Dropped(reason) => {
                let _ = events.send(TransportEvent::Disconnected {
                    reason: reason.clone(),
                });

                if !config.auto_reconnect {
                    info!(%reason, "Realtime connection lost, reconnect disabled");
                    // Still honour subscription changes and close until the caller gives up
                    while state.apply_offline(commands.recv().await) {}
                    return;
                }

                let delay = config.backoff_for_attempt(attempt);
                info!(?delay, attempt = attempt + 1, %reason, "Reconnecting...");

                let sleep = tokio::time::sleep(delay);
                tokio::pin!(sleep);
                loop {
                    tokio::select! {
                        _ = &mut sleep => break,
                        command = commands.recv() => {
                            if !state.apply_offline(command) {
                                return;
                            }
                        }
                    }
                }
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

/// Run one socket from connect to close
async fn run_connection(
    config: &SyncConfig,
    token: &str,
    state: &mut SessionState,
    commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
    events: &EventSink,
    attempt: &mut u32,
) -> SessionEnd {
    debug!(url = %config.realtime_url, "Connecting");
    let (ws_stream, _response) = match connect_async(config.realtime_url.as_str()).await {
        Ok(pair) => pair,
        Err(e) => {
            let _ = events.send(TransportEvent::Error {
                message: e.to_string(),
            });
            return SessionEnd::Dropped(e.to_string());
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let mut next_id = 0u32;
    let mut pending_subscribes: HashMap<u32, String> = HashMap::new();
    let mut connected = false;
    let mut send_pongs = false;

    // Frames queued for the socket; drained after each select turn
    let mut outbound: Vec<String> = Vec::new();

    let mut queue = |outbound: &mut Vec<String>, msg: ClientMessage| -> Option<u32> {
        next_id += 1;
        match msg.encode(next_id) {
            Ok(frame) => {
                outbound.push(frame);
                Some(next_id)
            }
            Err(e) => {
                warn!(error = %e, "Failed to encode command");
                None
            }
        }
    };

    let connect_id = queue(
        &mut outbound,
        ClientMessage::Connect {
            token: token.to_string(),
            name: CLIENT_NAME.to_string(),
        },
    );

    loop {
        for frame in outbound.drain(..) {
            if let Err(e) = write.send(Message::Text(frame.into())).await {
                return SessionEnd::Dropped(e.to_string());
            }
        }

        // Before the handshake completes only the operation timeout applies
        let silence = if connected {
            config.ping_timeout
        } else {
            config.operation_timeout
        };

        tokio::select! {
            command = commands.recv(), if connected => {
                match command {
                    Some(SessionCommand::Subscribe(topic)) => {
                        if state.topics.insert(topic.clone()) {
                            if let Some(id) = queue(&mut outbound, ClientMessage::Subscribe { channel: topic.clone() }) {
                                pending_subscribes.insert(id, topic);
                            }
                        }
                    }
                    Some(SessionCommand::Unsubscribe(topic)) => {
                        if state.topics.remove(&topic) {
                            queue(&mut outbound, ClientMessage::Unsubscribe { channel: topic });
                        }
                    }
                    Some(SessionCommand::Close) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Closed;
                    }
                }
            }

            frame = timeout(silence, read.next()) => {
                let text = match frame {
                    Err(_) => return SessionEnd::Dropped(format!("no data from server for {:?}", silence)),
                    Ok(None) => return SessionEnd::Dropped("connection closed".into()),
                    Ok(Some(Err(e))) => return SessionEnd::Dropped(e.to_string()),
                    Ok(Some(Ok(Message::Text(text)))) => text,
                    Ok(Some(Ok(Message::Close(frame)))) => {
                        let reason = frame.map(|f| f.reason.as_str().to_string()).unwrap_or_default();
                        return SessionEnd::Dropped(format!("closed by server: {}", reason));
                    }
                    // Protocol pings are answered by tungstenite
                    Ok(Some(Ok(_))) => continue,
                };

                for decoded in decode_frame(text.as_str()) {
                    let message = match decoded {
                        Ok(message) => message,
                        Err(e) => {
                            warn!(error = %e, "Failed to parse frame");
                            continue;
                        }
                    };

                    match message {
                        ServerMessage::Ping => {
                            if send_pongs {
                                outbound.push(PONG_FRAME.to_string());
                            }
                        }
                        ServerMessage::Connected { id, result } if Some(id) == connect_id => {
                            connected = true;
                            *attempt = 0;
                            send_pongs = result.pong.unwrap_or(false);
                            info!(client = ?result.client, version = ?result.version, "Realtime connection established");
                            let _ = events.send(TransportEvent::Connected);

                            for topic in state.topics.clone() {
                                if let Some(id) = queue(&mut outbound, ClientMessage::Subscribe { channel: topic.clone() }) {
                                    pending_subscribes.insert(id, topic);
                                }
                            }
                        }
                        ServerMessage::Rejected { id, error } if Some(id) == connect_id => {
                            let _ = events.send(TransportEvent::Error {
                                message: format!("connect rejected ({}): {}", error.code, error.message),
                            });
                            return SessionEnd::Dropped(error.message);
                        }
                        ServerMessage::Ack { id } => {
                            if let Some(topic) = pending_subscribes.remove(&id) {
                                let _ = events.send(TransportEvent::Subscribed { topic });
                            }
                        }
                        ServerMessage::Rejected { id, error } => {
                            // Topic stays wanted so a reconnect retries it
                            if let Some(topic) = pending_subscribes.remove(&id) {
                                let _ = events.send(TransportEvent::SubscribeFailed {
                                    topic,
                                    message: error.message,
                                });
                            }
                        }
                        ServerMessage::Publication { channel, data } => {
                            let _ = events.send(TransportEvent::Publication { topic: channel, data });
                        }
                        ServerMessage::Disconnect { code, reason } => {
                            return SessionEnd::Dropped(format!("server disconnect ({}): {}", code, reason));
                        }
                        ServerMessage::Unsubscribed { channel } => {
                            warn!(%channel, "Server ended subscription");
                            let _ = events.send(TransportEvent::Unsubscribed {
                                topic: channel,
                                reason: "unsubscribed by server".to_string(),
                            });
                        }
                        ServerMessage::Connected { .. } | ServerMessage::Unknown => {}
                    }
                }
            }
        }
    }
}
