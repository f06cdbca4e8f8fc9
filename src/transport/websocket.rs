//! WebSocket transport: a JSON request/response protocol to a remote
//! agent server that performs the tmux work on its own host.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{valid_session_id, Transport};

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport speaking `{action, session_id, ...}` JSON to an agent
/// server over a long-lived websocket. A shared-secret token may be
/// attached to every request.
pub struct WebSocketTransport {
    uri: String,
    host: String,
    auth_token: Option<String>,
    ws: Mutex<Option<WsStream>>,
}

impl WebSocketTransport {
    pub fn new(host: String, port: u16, auth_token: Option<String>) -> Self {
        Self {
            uri: format!("ws://{}:{}", host, port),
            host,
            auth_token,
            ws: Mutex::new(None),
        }
    }

    /// Send a request and await its response, reconnecting if the held
    /// connection has died. Any failure yields `None`.
    async fn request(&self, mut message: Value) -> Option<Value> {
        if let Some(token) = &self.auth_token {
            message["token"] = json!(token);
        }
        let payload = message.to_string();

        let mut guard = self.ws.lock().await;
        // One reconnect attempt: a stale pooled connection fails the
        // first send, a fresh one gets a second chance.
        for attempt in 0..2 {
            if guard.is_none() {
                match connect_async(self.uri.as_str()).await {
                    Ok((stream, _)) => {
                        info!(uri = %self.uri, "connected to agent server");
                        *guard = Some(stream);
                    }
                    Err(e) => {
                        warn!(uri = %self.uri, error = %e, "websocket connect failed");
                        return None;
                    }
                }
            }

            let ws = guard.as_mut().expect("connection just established");
            if let Err(e) = ws.send(Message::Text(payload.clone())).await {
                debug!(error = %e, attempt, "websocket send failed");
                *guard = None;
                continue;
            }

            match tokio::time::timeout(RESPONSE_TIMEOUT, ws.next()).await {
                Ok(Some(Ok(Message::Text(raw)))) => {
                    return serde_json::from_str(&raw).ok();
                }
                Ok(Some(Ok(_))) => {
                    debug!("unexpected non-text frame");
                    return None;
                }
                Ok(Some(Err(e))) => {
                    debug!(error = %e, attempt, "websocket receive failed");
                    *guard = None;
                }
                Ok(None) => {
                    debug!(attempt, "websocket closed by server");
                    *guard = None;
                }
                Err(_) => {
                    warn!(uri = %self.uri, "agent server response timed out");
                    return None;
                }
            }
        }
        None
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn create_session(&self, session_id: &str, command: &[String], workdir: &str) -> bool {
        if !valid_session_id(session_id) {
            warn!(session = %session_id, "invalid session id");
            return false;
        }
        let resp = self
            .request(json!({
                "action": "create_session",
                "session_id": session_id,
                "command": command,
                "workdir": workdir,
            }))
            .await;
        match resp {
            Some(resp) if resp["ok"].as_bool() == Some(true) => true,
            Some(resp) => {
                warn!(
                    session = %session_id,
                    error = %resp["error"].as_str().unwrap_or("unknown"),
                    "remote session creation refused"
                );
                false
            }
            None => false,
        }
    }

    async fn send_input(&self, session_id: &str, text: &str, send_enter: bool) -> bool {
        self.request(json!({
            "action": "send_input",
            "session_id": session_id,
            "text": text,
            "send_enter": send_enter,
        }))
        .await
        .and_then(|r| r["ok"].as_bool())
        .unwrap_or(false)
    }

    async fn send_key(&self, session_id: &str, key: &str) -> bool {
        self.request(json!({
            "action": "send_key",
            "session_id": session_id,
            "key": key,
        }))
        .await
        .and_then(|r| r["ok"].as_bool())
        .unwrap_or(false)
    }

    async fn capture_output(&self, session_id: &str, lines: u32) -> String {
        self.request(json!({
            "action": "capture_output",
            "session_id": session_id,
            "lines": lines,
        }))
        .await
        .and_then(|r| r["output"].as_str().map(str::to_string))
        .unwrap_or_default()
    }

    async fn session_exists(&self, session_id: &str) -> bool {
        self.request(json!({
            "action": "session_exists",
            "session_id": session_id,
        }))
        .await
        .and_then(|r| r["exists"].as_bool())
        .unwrap_or(false)
    }

    async fn kill_session(&self, session_id: &str) -> bool {
        self.request(json!({
            "action": "kill_session",
            "session_id": session_id,
        }))
        .await
        .and_then(|r| r["ok"].as_bool())
        .unwrap_or(false)
    }

    async fn test_connection(&self) -> (bool, String) {
        match self.request(json!({"action": "ping"})).await {
            Some(resp) if resp["pong"].as_bool() == Some(true) => {
                (true, format!("Agent server connected at {}", self.uri))
            }
            Some(_) => (false, format!("Unexpected response from {}", self.uri)),
            None => (
                false,
                format!("Cannot connect to agent server at {}", self.uri),
            ),
        }
    }

    async fn latency_ms(&self) -> f64 {
        let start = Instant::now();
        let _ = self.request(json!({"action": "ping"})).await;
        (start.elapsed().as_secs_f64() * 1000.0 * 10.0).round() / 10.0
    }

    fn attach_command(&self, _session_id: &str) -> String {
        format!(
            "echo 'Tunneled sessions cannot be attached directly. Use SSH to connect to {}'",
            self.host
        )
    }
}
