use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use serde_json::{Value, json};
use thiserror::Error;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{info, warn};

use crate::config::Config;
use crate::render::MessageEvent;

const INITIAL_RETRY_SECONDS: u64 = 2;
const MAX_RETRY_SECONDS: u64 = 300;
const PAGE_LIMIT: u32 = 200;
const HISTORY_PAGE_LIMIT: u32 = 100;
/// Upper bound on any single HTTP call. A hung download would otherwise
/// stall the display worker and every queued message behind it.
const HTTP_TIMEOUT_SECONDS: u64 = 30;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Error, Debug)]
pub enum SlackError {
    #[error("failed to construct HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request to Slack API method {method} failed: {source}")]
    Http {
        method: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Slack API {method} failed with status {status}")]
    Status {
        method: String,
        status: reqwest::StatusCode,
    },

    #[error("Slack API {method} returned ok=false: {code}")]
    Api { method: String, code: String },

    #[error("Slack API {method} response missing `{field}`")]
    Shape {
        method: String,
        field: &'static str,
    },

    #[error("invalid socket payload JSON: {0}")]
    Payload(String),

    #[error("websocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("oauth.app_token is required for Slack Socket Mode (xapp- token)")]
    MissingAppToken,
}

/// Remote file metadata as reported by `files.info`.
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub url_private: String,
    pub name: String,
    pub mimetype: String,
    pub title: Option<String>,
    /// Remote creation time, seconds since epoch. Drives cache freshness.
    pub created: f64,
}

/// One page of `conversations.history`, newest messages first.
#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub messages: Vec<Value>,
    pub next_cursor: Option<String>,
}

/// The slice of the Slack Web API this crate consumes. Commands hold a
/// concrete [`SlackClient`]; everything downstream of the directory load and
/// the display worker goes through this trait so it can run against a mock.
#[async_trait]
pub trait SlackApi: Send + Sync {
    async fn list_channels(&self) -> Result<Vec<Value>, SlackError>;
    async fn list_users(&self) -> Result<Vec<Value>, SlackError>;
    async fn file_metadata(&self, file_id: &str) -> Result<FileMetadata, SlackError>;
    async fn download(&self, url: &str) -> Result<Vec<u8>, SlackError>;
    async fn mark_read(&self, channel_id: &str, ts: &str) -> Result<(), SlackError>;
    async fn history_page(
        &self,
        channel_id: &str,
        oldest: f64,
        cursor: Option<&str>,
    ) -> Result<HistoryPage, SlackError>;
}

/// Classified Socket Mode event.
#[derive(Debug)]
pub enum SocketEvent {
    MessageCreated {
        event: Box<MessageEvent>,
        /// Payload as received, kept for diagnostics at the per-item boundary.
        raw: Value,
    },
    /// An edit or deletion of an already-delivered message. Ignored.
    MessageMutated,
    FileShared,
    FileCreated,
    Other,
}

/// A message event whose JSON did not match the expected shape. Carries the
/// offending payload so the boundary that drops it can log the evidence.
#[derive(Error, Debug)]
#[error("event payload has unexpected shape: {source}")]
pub struct EventShapeError {
    #[source]
    pub source: serde_json::Error,
    pub payload: Value,
}

pub fn classify_event(event: &Value) -> Result<SocketEvent, EventShapeError> {
    match event.get("type").and_then(Value::as_str).unwrap_or("") {
        "message" => {
            let parsed: MessageEvent =
                serde_json::from_value(event.clone()).map_err(|source| EventShapeError {
                    source,
                    payload: event.clone(),
                })?;
            match parsed.subtype.as_deref() {
                Some("message_changed") | Some("message_deleted") => {
                    Ok(SocketEvent::MessageMutated)
                }
                _ => Ok(SocketEvent::MessageCreated {
                    event: Box::new(parsed),
                    raw: event.clone(),
                }),
            }
        }
        "file_shared" => Ok(SocketEvent::FileShared),
        "file_created" => Ok(SocketEvent::FileCreated),
        _ => Ok(SocketEvent::Other),
    }
}

/// Sink for classified socket events. Called on the socket task itself, so
/// implementations must never block on I/O or rendering work.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: SocketEvent);
}

enum SocketControl {
    Continue,
    Reconnect,
}

#[derive(Clone)]
pub struct SlackClient {
    config: Arc<Config>,
    http: reqwest::Client,
}

impl SlackClient {
    pub fn new(config: Arc<Config>) -> Result<Self, SlackError> {
        let http = reqwest::Client::builder()
            .user_agent("slack-console")
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECONDS))
            .build()
            .map_err(SlackError::Client)?;
        Ok(Self { config, http })
    }

    /// Connect to Socket Mode and feed classified events to `handler`,
    /// reconnecting with capped exponential backoff for the life of the task.
    pub async fn run_socket_mode(&self, handler: Arc<dyn EventHandler>) -> Result<(), SlackError> {
        let app_token = self.app_token()?;

        let mut retry_seconds = INITIAL_RETRY_SECONDS;
        loop {
            match self.open_socket_url(&app_token).await {
                Ok(url) => match connect_async(url).await {
                    Ok((mut stream, _)) => {
                        retry_seconds = INITIAL_RETRY_SECONDS;
                        info!("slack socket mode connected");
                        while let Some(frame) = stream.next().await {
                            match frame {
                                Ok(WsMessage::Text(text)) => {
                                    match self
                                        .handle_socket_text(&mut stream, &text, handler.as_ref())
                                        .await
                                    {
                                        Ok(SocketControl::Continue) => {}
                                        Ok(SocketControl::Reconnect) => {
                                            info!("slack requested reconnect");
                                            break;
                                        }
                                        Err(err) => {
                                            warn!("socket payload handling failed: {err}");
                                        }
                                    }
                                }
                                Ok(WsMessage::Ping(payload)) => {
                                    let _ = stream.send(WsMessage::Pong(payload)).await;
                                }
                                Ok(WsMessage::Close(_)) => break,
                                Ok(_) => {}
                                Err(err) => {
                                    warn!("socket frame error: {err}");
                                    break;
                                }
                            }
                        }
                    }
                    Err(err) => warn!("failed to connect Slack websocket: {err}"),
                },
                Err(err) => warn!("failed to open Slack socket mode URL: {err}"),
            }

            tokio::time::sleep(Duration::from_secs(retry_seconds)).await;
            retry_seconds = (retry_seconds * 2).min(MAX_RETRY_SECONDS);
        }
    }

    async fn handle_socket_text(
        &self,
        stream: &mut WsStream,
        text: &str,
        handler: &dyn EventHandler,
    ) -> Result<SocketControl, SlackError> {
        let payload: Value =
            serde_json::from_str(text).map_err(|err| SlackError::Payload(err.to_string()))?;

        // Every envelope must be acknowledged promptly or Slack resends it.
        if let Some(envelope_id) = payload.get("envelope_id").and_then(Value::as_str) {
            let ack = json!({ "envelope_id": envelope_id });
            stream.send(WsMessage::Text(ack.to_string().into())).await?;
        }

        match payload.get("type").and_then(Value::as_str) {
            Some("disconnect") => return Ok(SocketControl::Reconnect),
            Some("events_api") => {}
            _ => return Ok(SocketControl::Continue),
        }

        let Some(event) = payload.pointer("/payload/event") else {
            return Ok(SocketControl::Continue);
        };
        match classify_event(event) {
            Ok(socket_event) => handler.on_event(socket_event),
            Err(err) => warn!(payload = %err.payload, "dropping malformed event: {err}"),
        }
        Ok(SocketControl::Continue)
    }

    pub async fn post_message(
        &self,
        channel_id: &str,
        text: &str,
        thread_ts: Option<&str>,
    ) -> Result<String, SlackError> {
        let token = self.user_token();
        let mut payload = json!({
            "channel": channel_id,
            "text": text,
        });
        if let Some(thread_ts) = thread_ts {
            payload["thread_ts"] = json!(thread_ts);
        }
        let response = self.api_post("chat.postMessage", &token, payload).await?;
        response
            .get("ts")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or(SlackError::Shape {
                method: "chat.postMessage".to_string(),
                field: "ts",
            })
    }

    /// Two-phase external upload: reserve an upload URL, POST the payload,
    /// then complete the upload to share it into the channel.
    pub async fn upload_file(
        &self,
        channel_id: &str,
        filename: &str,
        data: &[u8],
        initial_comment: Option<&str>,
        thread_ts: Option<&str>,
    ) -> Result<String, SlackError> {
        let token = self.user_token();
        let reserve = self
            .api_post(
                "files.getUploadURLExternal",
                &token,
                json!({
                    "filename": filename,
                    "length": data.len()
                }),
            )
            .await?;

        let upload_url = reserve
            .get("upload_url")
            .and_then(Value::as_str)
            .ok_or(SlackError::Shape {
                method: "files.getUploadURLExternal".to_string(),
                field: "upload_url",
            })?;
        let file_id = reserve
            .get("file_id")
            .and_then(Value::as_str)
            .ok_or(SlackError::Shape {
                method: "files.getUploadURLExternal".to_string(),
                field: "file_id",
            })?
            .to_string();

        let response = self
            .http
            .post(upload_url)
            .header("Content-Type", "application/octet-stream")
            .body(data.to_vec())
            .send()
            .await
            .map_err(|source| SlackError::Http {
                method: "upload".to_string(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(SlackError::Status {
                method: "upload".to_string(),
                status: response.status(),
            });
        }

        let mut payload = json!({
            "files": [{ "id": file_id, "title": filename }],
            "channel_id": channel_id
        });
        if let Some(comment) = initial_comment
            && !comment.is_empty()
        {
            payload["initial_comment"] = json!(comment);
        }
        if let Some(thread_ts) = thread_ts {
            payload["thread_ts"] = json!(thread_ts);
        }
        self.api_post("files.completeUploadExternal", &token, payload)
            .await?;

        Ok(file_id)
    }

    async fn open_socket_url(&self, app_token: &str) -> Result<String, SlackError> {
        let value = self
            .api_post("apps.connections.open", app_token, json!({}))
            .await?;
        value
            .get("url")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or(SlackError::Shape {
                method: "apps.connections.open".to_string(),
                field: "url",
            })
    }

    /// Walk a cursor-paginated listing to completion, concatenating the
    /// `items_key` arrays of every page.
    async fn paginated_list(
        &self,
        method: &str,
        items_key: &'static str,
        base: Value,
    ) -> Result<Vec<Value>, SlackError> {
        let token = self.user_token();
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut payload = base.clone();
            if let Some(cursor) = &cursor {
                payload["cursor"] = json!(cursor);
            }
            let response = self.api_post(method, &token, payload).await?;
            let page = response
                .get(items_key)
                .and_then(Value::as_array)
                .ok_or(SlackError::Shape {
                    method: method.to_string(),
                    field: items_key,
                })?;
            items.extend(page.iter().cloned());

            match next_cursor(&response) {
                Some(next) => cursor = Some(next),
                None => return Ok(items),
            }
        }
    }

    async fn api_post(
        &self,
        method: &str,
        token: &str,
        payload: Value,
    ) -> Result<Value, SlackError> {
        let response = self
            .http
            .post(format!("https://slack.com/api/{method}"))
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await
            .map_err(|source| SlackError::Http {
                method: method.to_string(),
                source,
            })?;

        let status = response.status();
        let value: Value = response.json().await.map_err(|source| SlackError::Http {
            method: method.to_string(),
            source,
        })?;

        if !status.is_success() {
            return Err(SlackError::Status {
                method: method.to_string(),
                status,
            });
        }
        if !value.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            let code = value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error")
                .to_string();
            return Err(SlackError::Api {
                method: method.to_string(),
                code,
            });
        }

        Ok(value)
    }

    fn user_token(&self) -> String {
        self.config
            .oauth
            .user_token
            .expose_secret()
            .trim()
            .to_string()
    }

    fn app_token(&self) -> Result<String, SlackError> {
        self.config
            .oauth
            .app_token
            .as_ref()
            .map(|token| token.expose_secret().trim().to_string())
            .filter(|token| !token.is_empty())
            .ok_or(SlackError::MissingAppToken)
    }
}

#[async_trait]
impl SlackApi for SlackClient {
    async fn list_channels(&self) -> Result<Vec<Value>, SlackError> {
        self.paginated_list(
            "conversations.list",
            "channels",
            json!({
                "limit": PAGE_LIMIT,
                "types": "public_channel,private_channel,mpim,im",
                "exclude_archived": false
            }),
        )
        .await
    }

    async fn list_users(&self) -> Result<Vec<Value>, SlackError> {
        self.paginated_list("users.list", "members", json!({ "limit": PAGE_LIMIT }))
            .await
    }

    async fn file_metadata(&self, file_id: &str) -> Result<FileMetadata, SlackError> {
        let token = self.user_token();
        let response = self
            .api_post("files.info", &token, json!({ "file": file_id }))
            .await?;
        let file = response.get("file").ok_or(SlackError::Shape {
            method: "files.info".to_string(),
            field: "file",
        })?;

        let field = |name: &'static str| -> Result<String, SlackError> {
            file.get(name)
                .and_then(Value::as_str)
                .map(ToOwned::to_owned)
                .ok_or(SlackError::Shape {
                    method: "files.info".to_string(),
                    field: name,
                })
        };

        Ok(FileMetadata {
            url_private: field("url_private")?,
            name: field("name")?,
            mimetype: field("mimetype")?,
            title: file
                .get("title")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
            created: file
                .get("created")
                .and_then(Value::as_f64)
                .ok_or(SlackError::Shape {
                    method: "files.info".to_string(),
                    field: "created",
                })?,
        })
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, SlackError> {
        let token = self.user_token();
        let response = self
            .http
            .get(url)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|source| SlackError::Http {
                method: "download".to_string(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(SlackError::Status {
                method: "download".to_string(),
                status: response.status(),
            });
        }
        let bytes = response.bytes().await.map_err(|source| SlackError::Http {
            method: "download".to_string(),
            source,
        })?;
        Ok(bytes.to_vec())
    }

    async fn mark_read(&self, channel_id: &str, ts: &str) -> Result<(), SlackError> {
        let token = self.user_token();
        self.api_post(
            "conversations.mark",
            &token,
            json!({ "channel": channel_id, "ts": ts }),
        )
        .await?;
        Ok(())
    }

    async fn history_page(
        &self,
        channel_id: &str,
        oldest: f64,
        cursor: Option<&str>,
    ) -> Result<HistoryPage, SlackError> {
        let token = self.user_token();
        let mut payload = json!({
            "channel": channel_id,
            "limit": HISTORY_PAGE_LIMIT,
            "oldest": oldest,
        });
        if let Some(cursor) = cursor {
            payload["cursor"] = json!(cursor);
        }
        let response = self
            .api_post("conversations.history", &token, payload)
            .await?;
        let messages = response
            .get("messages")
            .and_then(Value::as_array)
            .cloned()
            .ok_or(SlackError::Shape {
                method: "conversations.history".to_string(),
                field: "messages",
            })?;
        Ok(HistoryPage {
            messages,
            next_cursor: next_cursor(&response),
        })
    }
}

/// A non-empty `response_metadata.next_cursor`, if the page carries one.
pub(crate) fn next_cursor(response: &Value) -> Option<String> {
    response
        .pointer("/response_metadata/next_cursor")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|cursor| !cursor.is_empty())
        .map(ToOwned::to_owned)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_message_classifies_as_created() {
        let event = json!({
            "type": "message",
            "channel": "C100",
            "user": "U100",
            "ts": "1700000000.000100",
            "text": "hello"
        });
        match classify_event(&event) {
            Ok(SocketEvent::MessageCreated { event, .. }) => {
                assert_eq!(event.channel.as_deref(), Some("C100"));
                assert_eq!(event.ts, "1700000000.000100");
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn mutation_subtypes_classify_as_mutated() {
        for subtype in ["message_changed", "message_deleted"] {
            let event = json!({
                "type": "message",
                "subtype": subtype,
                "channel": "C100",
                "ts": "1700000000.000100"
            });
            assert!(matches!(
                classify_event(&event),
                Ok(SocketEvent::MessageMutated)
            ));
        }
    }

    #[test]
    fn join_subtype_still_classifies_as_created() {
        let event = json!({
            "type": "message",
            "subtype": "channel_join",
            "channel": "C100",
            "user": "U100",
            "ts": "1700000000.000100"
        });
        assert!(matches!(
            classify_event(&event),
            Ok(SocketEvent::MessageCreated { .. })
        ));
    }

    #[test]
    fn file_and_unknown_events_classify_without_work() {
        let shared = json!({ "type": "file_shared", "file_id": "F1" });
        assert!(matches!(classify_event(&shared), Ok(SocketEvent::FileShared)));

        let created = json!({ "type": "file_created", "file_id": "F1" });
        assert!(matches!(
            classify_event(&created),
            Ok(SocketEvent::FileCreated)
        ));

        let typing = json!({ "type": "user_typing", "channel": "C100" });
        assert!(matches!(classify_event(&typing), Ok(SocketEvent::Other)));
    }

    #[test]
    fn malformed_message_carries_its_payload() {
        // `ts` is required on message events.
        let event = json!({ "type": "message", "channel": "C100" });
        let err = classify_event(&event).expect_err("missing ts must not classify");
        assert_eq!(err.payload, event);
    }

    #[test]
    fn next_cursor_requires_non_empty_value() {
        let page = json!({ "response_metadata": { "next_cursor": "dXNlcjpV" } });
        assert_eq!(next_cursor(&page), Some("dXNlcjpV".to_string()));

        let done = json!({ "response_metadata": { "next_cursor": "" } });
        assert_eq!(next_cursor(&done), None);

        let missing = json!({ "ok": true });
        assert_eq!(next_cursor(&missing), None);
    }
}
