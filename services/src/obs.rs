//! OBS WebSocket control
//!
//! Talks to the obs-websocket v4 protocol: JSON requests tagged with a
//! `message-id`, answered by a response carrying the same id and a `status`
//! of `ok` or `error`. Unsolicited events (`update-type`) are skipped.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use volbot_core::{ControlApi, ControlConfig};

type ObsSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// OBS control errors
#[derive(Debug, Error)]
pub enum ObsError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("OBS requires authentication but no password is configured")]
    PasswordRequired,

    #[error("{request} failed: {message}")]
    Request { request: String, message: String },

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Connection closed")]
    Closed,
}

impl ObsError {
    /// Whether the socket is unusable after this error
    fn is_transport(&self) -> bool {
        !matches!(self, ObsError::Request { .. } | ObsError::PasswordRequired)
    }
}

impl From<ObsError> for volbot_core::Error {
    fn from(err: ObsError) -> Self {
        volbot_core::Error::Control(err.to_string())
    }
}

/// Response to an auth challenge:
/// `base64(sha256(base64(sha256(password + salt)) + challenge))`
pub fn auth_response(password: &str, salt: &str, challenge: &str) -> String {
    let secret = STANDARD.encode(Sha256::digest(format!("{}{}", password, salt)));
    STANDARD.encode(Sha256::digest(format!("{}{}", secret, challenge)))
}

/// OBS WebSocket client.
///
/// Connects on first use and reconnects after any transport failure.
/// Requests are serialized over a single socket.
pub struct ObsClient {
    config: ControlConfig,
    socket: Mutex<Option<ObsSocket>>,
    next_id: AtomicU64,
}

impl ObsClient {
    pub fn new(config: ControlConfig) -> Self {
        Self {
            config,
            socket: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Send a request and wait for its response
    pub async fn request(
        &self,
        request_type: &str,
        fields: Map<String, Value>,
    ) -> Result<Value, ObsError> {
        let mut slot = self.socket.lock().await;
        let timeout = self.config.request_timeout();

        let exchange = self.exchange(&mut slot, request_type, fields);
        let result = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ObsError::Timeout(timeout)),
        };

        if let Err(ref e) = result {
            if e.is_transport() && slot.take().is_some() {
                warn!("Dropping OBS connection after error: {}", e);
            }
        }
        result
    }

    /// Check if a socket is currently open
    pub async fn is_connected(&self) -> bool {
        self.socket.lock().await.is_some()
    }

    async fn exchange(
        &self,
        slot: &mut Option<ObsSocket>,
        request_type: &str,
        fields: Map<String, Value>,
    ) -> Result<Value, ObsError> {
        if slot.is_none() {
            *slot = Some(self.connect().await?);
        }
        let Some(socket) = slot.as_mut() else {
            return Err(ObsError::Closed);
        };

        let response = self.send_request(socket, request_type, fields).await?;
        check_status(request_type, response)
    }

    async fn connect(&self) -> Result<ObsSocket, ObsError> {
        let url = self.config.url();
        debug!("Connecting to OBS at {}", url);

        let (mut socket, _) = connect_async(url.as_str()).await?;
        self.authenticate(&mut socket).await?;

        info!("Connected to OBS at {}", url);
        Ok(socket)
    }

    async fn authenticate(&self, socket: &mut ObsSocket) -> Result<(), ObsError> {
        let status = self.send_request(socket, "GetAuthRequired", Map::new()).await?;
        let status = check_status("GetAuthRequired", status)?;
        if !status.get("authRequired").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(());
        }

        let password = self.config.password().ok_or(ObsError::PasswordRequired)?;
        let salt = status.get("salt").and_then(Value::as_str).unwrap_or_default();
        let challenge = status.get("challenge").and_then(Value::as_str).unwrap_or_default();

        let mut fields = Map::new();
        fields.insert("auth".to_string(), json!(auth_response(password, salt, challenge)));
        let response = self.send_request(socket, "Authenticate", fields).await?;
        check_status("Authenticate", response)?;

        debug!("Authenticated with OBS");
        Ok(())
    }

    async fn send_request(
        &self,
        socket: &mut ObsSocket,
        request_type: &str,
        mut fields: Map<String, Value>,
    ) -> Result<Value, ObsError> {
        let message_id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        fields.insert("request-type".to_string(), json!(request_type));
        fields.insert("message-id".to_string(), json!(message_id));

        trace!("OBS <- {} ({})", request_type, message_id);
        socket.send(WsMessage::Text(Value::Object(fields).to_string())).await?;

        while let Some(frame) = socket.next().await {
            let text = match frame? {
                WsMessage::Text(text) => text,
                WsMessage::Close(_) => return Err(ObsError::Closed),
                _ => continue,
            };

            let value: Value = serde_json::from_str(&text)?;
            if value.get("message-id").and_then(Value::as_str) == Some(message_id.as_str()) {
                return Ok(value);
            }
            trace!("Skipping OBS message: {}", text);
        }

        Err(ObsError::Closed)
    }
}

fn check_status(request_type: &str, response: Value) -> Result<Value, ObsError> {
    match response.get("status").and_then(Value::as_str) {
        Some("ok") => Ok(response),
        _ => Err(ObsError::Request {
            request: request_type.to_string(),
            message: response
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        }),
    }
}

#[async_trait]
impl ControlApi for ObsClient {
    async fn set_level(&self, resource: &str, level: f64) -> volbot_core::Result<()> {
        let mut fields = Map::new();
        fields.insert("source".to_string(), json!(resource));
        fields.insert("volume".to_string(), json!(level));

        self.request("SetVolume", fields).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    const PASSWORD: &str = "hunter2";
    const SALT: &str = "salt123";
    const CHALLENGE: &str = "challenge456";

    #[derive(Default)]
    struct ObsState {
        connections: usize,
        volumes: Vec<(String, f64)>,
    }

    /// Minimal obs-websocket server requiring authentication
    async fn mock_obs() -> (u16, Arc<std::sync::Mutex<ObsState>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(std::sync::Mutex::new(ObsState::default()));

        let server_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                server_state.lock().unwrap().connections += 1;
                tokio::spawn(serve(stream, server_state.clone()));
            }
        });

        (port, state)
    }

    async fn serve(stream: TcpStream, state: Arc<std::sync::Mutex<ObsState>>) {
        let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();
        let mut authenticated = false;

        while let Some(Ok(WsMessage::Text(text))) = socket.next().await {
            let request: Value = serde_json::from_str(&text).unwrap();
            let id = request["message-id"].clone();

            let response = match request["request-type"].as_str().unwrap() {
                "GetAuthRequired" => json!({
                    "message-id": id, "status": "ok",
                    "authRequired": true, "salt": SALT, "challenge": CHALLENGE,
                }),
                "Authenticate" => {
                    if request["auth"] == json!(auth_response(PASSWORD, SALT, CHALLENGE)) {
                        authenticated = true;
                        json!({"message-id": id, "status": "ok"})
                    } else {
                        json!({
                            "message-id": id, "status": "error",
                            "error": "Authentication Failed.",
                        })
                    }
                }
                "SetVolume" if !authenticated => {
                    json!({"message-id": id, "status": "error", "error": "Not Authenticated"})
                }
                "SetVolume" => {
                    let source = request["source"].as_str().unwrap().to_string();
                    match source.as_str() {
                        "Slow" => continue,
                        "Missing" => json!({
                            "message-id": id, "status": "error",
                            "error": "specified source doesn't exist",
                        }),
                        _ => {
                            let volume = request["volume"].as_f64().unwrap();
                            state.lock().unwrap().volumes.push((source.clone(), volume));
                            // An unrelated event arrives before the response
                            let event = json!({
                                "update-type": "SourceVolumeChanged",
                                "sourceName": "Music",
                            });
                            socket.send(WsMessage::Text(event.to_string())).await.unwrap();
                            json!({"message-id": id, "status": "ok"})
                        }
                    }
                }
                other => json!({
                    "message-id": id, "status": "error",
                    "error": format!("invalid request type {}", other),
                }),
            };

            if socket.send(WsMessage::Text(response.to_string())).await.is_err() {
                break;
            }
        }
    }

    fn client(port: u16, password: &str) -> ObsClient {
        ObsClient::new(ControlConfig {
            address: "127.0.0.1".to_string(),
            port,
            password: password.to_string(),
            source_name: "Music".to_string(),
            request_timeout_secs: 1,
        })
    }

    #[test]
    fn test_auth_response() {
        assert_eq!(
            auth_response(PASSWORD, SALT, CHALLENGE),
            "aI0prElVWyeMN25ZsAkh8ejfMb3X6Y7ijCfK2/uLqOk="
        );
    }

    #[tokio::test]
    async fn test_set_volume_authenticates_once() {
        let (port, state) = mock_obs().await;
        let client = client(port, PASSWORD);
        assert!(!client.is_connected().await);

        client.set_level("Music", 0.75).await.unwrap();
        client.set_level("Music", 0.2).await.unwrap();
        assert!(client.is_connected().await);

        let state = state.lock().unwrap();
        assert_eq!(state.connections, 1);
        assert_eq!(
            state.volumes,
            vec![("Music".to_string(), 0.75), ("Music".to_string(), 0.2)]
        );
    }

    #[tokio::test]
    async fn test_request_error_keeps_connection() {
        let (port, state) = mock_obs().await;
        let client = client(port, PASSWORD);

        let err = client.set_level("Missing", 0.5).await.unwrap_err();
        assert!(err.to_string().contains("specified source doesn't exist"));
        assert!(client.is_connected().await);

        client.set_level("Music", 0.5).await.unwrap();
        assert_eq!(state.lock().unwrap().connections, 1);
    }

    #[tokio::test]
    async fn test_wrong_password_rejected() {
        let (port, _state) = mock_obs().await;

        let err = client(port, "wrong").set_level("Music", 0.5).await.unwrap_err();
        assert!(err.to_string().contains("Authentication Failed."));

        let err = client(port, "").set_level("Music", 0.5).await.unwrap_err();
        assert!(err.to_string().contains("no password"));
    }

    #[tokio::test]
    async fn test_timeout_drops_connection() {
        let (port, state) = mock_obs().await;
        let client = client(port, PASSWORD);

        let err = client.request("SetVolume", {
            let mut fields = Map::new();
            fields.insert("source".to_string(), json!("Slow"));
            fields.insert("volume".to_string(), json!(0.1));
            fields
        });
        assert!(matches!(err.await, Err(ObsError::Timeout(_))));
        assert!(!client.is_connected().await);

        client.set_level("Music", 0.3).await.unwrap();
        assert_eq!(state.lock().unwrap().connections, 2);
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(client(port, PASSWORD).set_level("Music", 0.5).await.is_err());
    }
}
