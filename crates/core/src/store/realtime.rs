//! Row-change feed over the hosted realtime websocket (Phoenix channels).

use std::{str::FromStr, time::Duration};

use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};

use crate::config::StoreConfig;
use crate::feed::{
    ChangeEvent, ChangeFeed, EventKind, FeedError, FeedFuture, FeedMessage, FeedSubscription, Table,
};

const CHANNEL_TOPIC: &str = "realtime:trotro-routes";
const JOIN_REF: &str = "1";

#[derive(Debug, Serialize, Deserialize)]
struct PhoenixMessage {
    topic: String,
    event: String,
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
}

pub struct RealtimeFeed {
    socket_url: Url,
    access_token: Option<String>,
    heartbeat: Duration,
    schema: String,
}

impl RealtimeFeed {
    pub fn new(config: &StoreConfig, heartbeat: Duration) -> Result<Self, FeedError> {
        Ok(Self {
            socket_url: socket_url(&config.url, &config.anon_key)?,
            access_token: None,
            heartbeat,
            schema: "public".to_owned(),
        })
    }

    /// Join the channel as a signed-in user rather than anonymously.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    fn join_message(&self, tables: &[Table]) -> PhoenixMessage {
        let changes: Vec<Value> = tables
            .iter()
            .map(|table| json!({"event": "*", "schema": self.schema, "table": table.as_ref()}))
            .collect();

        let mut payload = json!({
            "config": {
                "broadcast": {"self": false},
                "presence": {"key": ""},
                "postgres_changes": changes,
            }
        });
        if let Some(token) = &self.access_token {
            payload["access_token"] = Value::String(token.clone());
        }

        PhoenixMessage {
            topic: CHANNEL_TOPIC.to_owned(),
            event: "phx_join".to_owned(),
            payload,
            reference: Some(JOIN_REF.to_owned()),
        }
    }
}

fn socket_url(project_url: &str, anon_key: &str) -> Result<Url, FeedError> {
    let mut url = Url::parse(project_url).map_err(|e| FeedError::Connect(e.to_string()))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => return Err(FeedError::Connect(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| FeedError::Connect(format!("cannot use {scheme} for {project_url}")))?;

    let path = format!("{}/realtime/v1/websocket", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut()
        .clear()
        .append_pair("apikey", anon_key)
        .append_pair("vsn", "1.0.0");
    Ok(url)
}

fn encode(message: &PhoenixMessage) -> Result<Message, FeedError> {
    let text = serde_json::to_string(message).map_err(|e| FeedError::Protocol(e.to_string()))?;
    Ok(Message::Text(text.into()))
}

/// Translate one inbound frame. `None` for frames the subscriber does not
/// care about (heartbeat replies, presence, system notices).
fn decode_frame(text: &str) -> Option<FeedMessage> {
    let message: PhoenixMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "unreadable realtime frame");
            return None;
        }
    };

    match message.event.as_str() {
        "phx_reply" if message.reference.as_deref() == Some(JOIN_REF) => {
            match message.payload["status"].as_str() {
                Some("ok") => Some(FeedMessage::Acknowledged),
                status => Some(FeedMessage::Closed(format!(
                    "join refused ({}): {}",
                    status.unwrap_or("unknown"),
                    message.payload["response"]
                ))),
            }
        }
        "postgres_changes" => decode_change(&message.payload["data"]).map(FeedMessage::Change),
        "phx_close" => Some(FeedMessage::Closed("channel closed".to_owned())),
        "phx_error" => Some(FeedMessage::Closed(format!(
            "channel error: {}",
            message.payload
        ))),
        event => {
            trace!(event, topic = %message.topic, "ignoring realtime frame");
            None
        }
    }
}

fn decode_change(data: &Value) -> Option<ChangeEvent> {
    let table = Table::from_str(data["table"].as_str()?).ok()?;
    let kind = EventKind::from_str(data["type"].as_str()?).ok()?;
    let record = match kind {
        EventKind::Delete => data["old_record"].clone(),
        EventKind::Insert | EventKind::Update => data["record"].clone(),
    };
    Some(ChangeEvent {
        table,
        kind,
        record,
    })
}

impl ChangeFeed for RealtimeFeed {
    fn subscribe<'a>(&'a self, tables: &'a [Table]) -> FeedFuture<'a, FeedSubscription> {
        Box::pin(async move {
            let (socket, _) = connect_async(self.socket_url.as_str())
                .await
                .map_err(|e| FeedError::Connect(e.to_string()))?;
            info!(host = ?self.socket_url.host_str(), "realtime socket open");

            let (mut sink, mut stream) = socket.split();
            sink.send(encode(&self.join_message(tables))?)
                .await
                .map_err(|e| FeedError::Connect(e.to_string()))?;

            let (tx, rx) = mpsc::channel(64);
            let heartbeat_every = self.heartbeat;

            tokio::spawn(async move {
                let mut heartbeat = tokio::time::interval(heartbeat_every);
                heartbeat.tick().await;
                let mut sequence: u64 = 1;

                let reason = loop {
                    tokio::select! {
                        _ = tx.closed() => {
                            debug!("realtime subscriber dropped, closing socket");
                            let _ = sink.send(Message::Close(None)).await;
                            return;
                        }
                        _ = heartbeat.tick() => {
                            sequence += 1;
                            let beat = PhoenixMessage {
                                topic: "phoenix".to_owned(),
                                event: "heartbeat".to_owned(),
                                payload: json!({}),
                                reference: Some(sequence.to_string()),
                            };
                            let sent = match encode(&beat) {
                                Ok(frame) => sink.send(frame).await.map_err(|e| e.to_string()),
                                Err(e) => Err(e.to_string()),
                            };
                            if let Err(e) = sent {
                                break format!("heartbeat failed: {e}");
                            }
                        }
                        frame = stream.next() => match frame {
                            Some(Ok(Message::Text(text))) => {
                                let Some(message) = decode_frame(text.as_str()) else {
                                    continue;
                                };
                                let closing = matches!(message, FeedMessage::Closed(_));
                                if tx.send(message).await.is_err() || closing {
                                    let _ = sink.send(Message::Close(None)).await;
                                    return;
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                break format!("socket closed: {frame:?}");
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => break format!("socket error: {e}"),
                            None => break "socket ended".to_owned(),
                        },
                    }
                };

                let _ = tx.send(FeedMessage::Closed(reason)).await;
            });

            Ok(FeedSubscription::new(rx))
        })
    }
}
