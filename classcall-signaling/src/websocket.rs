//! WebSocket signaling channel

use crate::channel::{ChannelConnector, ChannelEvent, Outbound, SignalingChannel, SignalingSender};
use async_trait::async_trait;
use classcall_core::{ClassCallError, Result, SessionId, SignalingMessage, UserId};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

/// Connects to the backend's per-call socket at `{ws_url}/ws/calls/{id}`
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    ws_url: Url,
    token: Option<String>,
}

impl WebSocketConnector {
    /// Connector for the given base URL (`ws://` or `wss://`)
    pub fn new(ws_url: &str, token: Option<String>) -> Result<Self> {
        let ws_url = Url::parse(ws_url).map_err(|e| ClassCallError::ChannelConnect {
            url: ws_url.to_string(),
            reason: e.to_string(),
        })?;
        match ws_url.scheme() {
            "ws" | "wss" => Ok(Self { ws_url, token }),
            other => Err(ClassCallError::ChannelConnect {
                url: ws_url.to_string(),
                reason: format!("unsupported scheme {other}"),
            }),
        }
    }

    /// Socket URL for a session, token included
    pub fn endpoint(&self, session_id: &SessionId) -> Url {
        let mut url = self.ws_url.clone();
        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{base}/ws/calls/{session_id}"));
        if let Some(token) = &self.token {
            url.query_pairs_mut().append_pair("token", token);
        }
        url
    }
}

/// URL without the query string, safe to log
fn redacted(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

#[async_trait]
impl ChannelConnector for WebSocketConnector {
    async fn connect(&self, session_id: &SessionId, user_id: &UserId) -> Result<SignalingChannel> {
        let url = self.endpoint(session_id);
        let display_url = redacted(&url);
        let (stream, _response) =
            connect_async(url.as_str())
                .await
                .map_err(|e| ClassCallError::ChannelConnect {
                    url: display_url.clone(),
                    reason: e.to_string(),
                })?;
        info!("✅ Signaling socket open for user {} at {}", user_id, display_url);

        let (mut write, mut read) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = events_tx.send(ChannelEvent::Open);

        let writer_events = events_tx.clone();
        tokio::spawn(async move {
            while let Some(command) = out_rx.recv().await {
                match command {
                    Outbound::Frame(message) => {
                        if let Err(e) = write.send(Message::Text(message.to_json())).await {
                            warn!("Failed to send {}: {}", message.action(), e);
                            let _ = writer_events.send(ChannelEvent::Error(e.to_string()));
                            // Nothing can be sent from here on
                            let _ = writer_events.send(ChannelEvent::Closed {
                                reason: format!("send failed: {e}"),
                            });
                            break;
                        }
                    }
                    Outbound::Close => {
                        debug!("Closing signaling socket");
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            let reason = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => match SignalingMessage::from_json(&text) {
                        Ok(message) => {
                            if events_tx.send(ChannelEvent::Message(message)).is_err() {
                                break "receiver dropped".to_string();
                            }
                        }
                        Err(e) => warn!("Dropping malformed signaling frame: {}", e),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "closed by server".to_string());
                    }
                    Some(Ok(_)) => {
                        // Binary, ping and pong frames carry no signaling
                    }
                    Some(Err(e)) => {
                        warn!("Signaling socket error: {}", e);
                        let _ = events_tx.send(ChannelEvent::Error(e.to_string()));
                        break e.to_string();
                    }
                    None => break "stream ended".to_string(),
                }
            };
            info!("⚠️ Signaling socket closed: {}", reason);
            let _ = events_tx.send(ChannelEvent::Closed { reason });
        });

        Ok(SignalingChannel::new(SignalingSender::new(out_tx), events_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_layout() {
        let connector =
            WebSocketConnector::new("wss://school.example/calls-ws", Some("abc".to_string()))
                .unwrap();
        let url = connector.endpoint(&SessionId::from(12));
        assert_eq!(
            url.as_str(),
            "wss://school.example/calls-ws/ws/calls/12?token=abc"
        );
        assert_eq!(redacted(&url), "wss://school.example/calls-ws/ws/calls/12");
    }

    #[test]
    fn test_rejects_http_scheme() {
        let err = WebSocketConnector::new("https://school.example", None).unwrap_err();
        assert_eq!(err.error_code(), "CHANNEL_CONNECT_FAILED");
    }
}
