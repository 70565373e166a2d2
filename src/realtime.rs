//! Poll-scoped fanout of result snapshots. Each poll gets a broadcast
//! channel; websocket clients join and leave channels explicitly and a
//! dropped connection just drops its receivers. Delivery is best effort,
//! at most once per connected member; a receiver that lags past the channel
//! capacity loses the missed updates and keeps going.

use std::{collections::HashMap, sync::Arc, sync::Mutex};

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::state::AppState;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsUpdate {
    pub poll_id: String,
    pub results: Vec<OptionResult>,
    pub total_votes: i64,
    pub last_vote: LastVote,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptionResult {
    pub id: String,
    pub text: String,
    pub votes: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastVote {
    pub option_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    JoinPoll {
        #[serde(rename = "pollId")]
        poll_id: String,
    },
    LeavePoll {
        #[serde(rename = "pollId")]
        poll_id: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    JoinedPoll {
        #[serde(rename = "pollId")]
        poll_id: String,
        message: String,
    },
    LeftPoll {
        #[serde(rename = "pollId")]
        poll_id: String,
        message: String,
    },
    PollUpdate {
        #[serde(flatten)]
        update: ResultsUpdate,
    },
}

/// Registry of per-poll broadcast channels.
#[derive(Default)]
pub struct Hub {
    channels: Mutex<HashMap<String, broadcast::Sender<ResultsUpdate>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, poll_id: &str) -> broadcast::Receiver<ResultsUpdate> {
        let mut channels = self.channels.lock().expect("hub lock poisoned");
        channels
            .entry(poll_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Sends the snapshot to every current subscriber of the poll's channel
    /// and returns how many received it. Channels with no subscribers left
    /// are pruned here rather than on disconnect.
    pub fn publish(&self, poll_id: &str, update: ResultsUpdate) -> usize {
        let mut channels = self.channels.lock().expect("hub lock poisoned");
        match channels.get(poll_id) {
            Some(sender) => match sender.send(update) {
                Ok(delivered) => delivered,
                Err(_) => {
                    channels.remove(poll_id);
                    0
                }
            },
            None => 0,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().expect("hub lock poisoned").len()
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| client_session(socket, state))
}

async fn client_session(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();

    // updates flow through one mpsc so this task keeps sole ownership of
    // the sink; one forwarding task per joined poll feeds it
    let (update_tx, mut update_rx) = mpsc::channel::<ServerMessage>(CHANNEL_CAPACITY);
    let mut joined: HashMap<String, JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            Some(message) = update_rx.recv() => {
                if send_json(&mut sink, &message).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(raw))) => {
                        let parsed: ClientMessage = match serde_json::from_str(raw.as_str()) {
                            Ok(parsed) => parsed,
                            Err(e) => {
                                debug!("Ignoring malformed realtime message: {e}");
                                continue;
                            }
                        };

                        let reply = match parsed {
                            ClientMessage::JoinPoll { poll_id } => {
                                join_poll(&state, &update_tx, &mut joined, poll_id)
                            }
                            ClientMessage::LeavePoll { poll_id } => {
                                if let Some(task) = joined.remove(&poll_id) {
                                    task.abort();
                                }
                                ServerMessage::LeftPoll {
                                    message: format!("Left poll {poll_id}"),
                                    poll_id,
                                }
                            }
                        };

                        if send_json(&mut sink, &reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("Realtime connection error: {e}");
                        break;
                    }
                }
            }
        }
    }

    for (_, task) in joined {
        task.abort();
    }
}

fn join_poll(
    state: &Arc<AppState>,
    update_tx: &mpsc::Sender<ServerMessage>,
    joined: &mut HashMap<String, JoinHandle<()>>,
    poll_id: String,
) -> ServerMessage {
    if !joined.contains_key(&poll_id) {
        let mut updates = state.hub.subscribe(&poll_id);
        let feed = update_tx.clone();

        let task = tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(update) => {
                        if feed.send(ServerMessage::PollUpdate { update }).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!("Realtime subscriber lagged, dropped {missed} updates");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        joined.insert(poll_id.clone(), task);
    }

    ServerMessage::JoinedPoll {
        message: format!("Successfully joined poll {poll_id}"),
        poll_id,
    }
}

async fn send_json(
    sink: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    match serde_json::to_string(message) {
        Ok(text) => sink.send(Message::Text(text.into())).await,
        Err(e) => {
            debug!("Failed to encode realtime message: {e}");
            Ok(())
        }
    }
}
