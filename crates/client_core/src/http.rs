use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ConversationId, MessageId, Role, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        AttachmentPayload, ContactSummary, ConversationSummary, DeleteMessageQuery,
        EditMessageRequest, ForwardMessageRequest, MessagePayload, PresenceRecordPayload,
        SendMessageRequest, ServerEvent, SetFlagRequest, SetReactionRequest,
    },
};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::{
    backend::{AttachmentUpload, EventTransport, MessagingBackend},
    config::{normalize_server_url, websocket_url},
    error::BackendError,
};

const EVENT_BUFFER: usize = 256;

/// REST + WebSocket collaborator for a portal server. Every request carries
/// the caller's id as `user_id`; authentication happens upstream.
#[derive(Clone)]
pub struct HttpBackend {
    http: Client,
    server_url: String,
    user_id: UserId,
}

impl HttpBackend {
    pub fn new(server_url: &str, user_id: UserId, timeout: Duration) -> anyhow::Result<Self> {
        let server_url = normalize_server_url(server_url)?;
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            server_url,
            user_id,
        })
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.with_identity(self.http.get(format!("{}{path}", self.server_url)))
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.with_identity(self.http.post(format!("{}{path}", self.server_url)))
    }

    fn put(&self, path: &str) -> RequestBuilder {
        self.with_identity(self.http.put(format!("{}{path}", self.server_url)))
    }

    fn patch(&self, path: &str) -> RequestBuilder {
        self.with_identity(self.http.patch(format!("{}{path}", self.server_url)))
    }

    fn delete(&self, path: &str) -> RequestBuilder {
        self.with_identity(self.http.delete(format!("{}{path}", self.server_url)))
    }

    fn with_identity(&self, request: RequestBuilder) -> RequestBuilder {
        request.query(&[("user_id", self.user_id.0)])
    }
}

pub(crate) fn code_for_status(status: StatusCode) -> ErrorCode {
    match status {
        StatusCode::UNAUTHORIZED => ErrorCode::Unauthorized,
        StatusCode::FORBIDDEN => ErrorCode::Forbidden,
        StatusCode::NOT_FOUND => ErrorCode::NotFound,
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => ErrorCode::Conflict,
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ErrorCode::Validation,
        StatusCode::TOO_MANY_REQUESTS => ErrorCode::RateLimited,
        _ => ErrorCode::Internal,
    }
}

/// Turns a non-2xx response into `BackendError::Rejected`, preferring the
/// server's `ApiError` body over the bare status.
async fn check(response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if let Ok(api_error) = serde_json::from_str::<ApiError>(&body) {
        return Err(api_error.into());
    }
    let message = if body.trim().is_empty() {
        status.to_string()
    } else {
        body
    };
    Err(BackendError::rejected(code_for_status(status), message))
}

async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, BackendError> {
    let response = check(request.send().await?).await?;
    Ok(response.json().await?)
}

async fn send_empty(request: RequestBuilder) -> Result<(), BackendError> {
    check(request.send().await?).await?;
    Ok(())
}

#[async_trait]
impl MessagingBackend for HttpBackend {
    async fn list_recipients(
        &self,
        role_filter: Option<Role>,
    ) -> Result<Vec<ContactSummary>, BackendError> {
        let mut request = self.get("/recipients");
        if let Some(role) = role_filter {
            request = request.query(&[("role", role)]);
        }
        send_json(request).await
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, BackendError> {
        send_json(self.get("/conversations")).await
    }

    async fn load_thread(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<MessagePayload>, BackendError> {
        send_json(self.get(&format!("/conversations/{conversation_id}/messages"))).await
    }

    async fn send_message(
        &self,
        request: SendMessageRequest,
    ) -> Result<MessagePayload, BackendError> {
        send_json(self.post("/messages").json(&request)).await
    }

    async fn edit_message(
        &self,
        message_id: MessageId,
        body: &str,
        base_version: u64,
    ) -> Result<MessagePayload, BackendError> {
        let request = EditMessageRequest {
            body: body.to_string(),
            base_version,
        };
        send_json(self.patch(&format!("/messages/{message_id}")).json(&request)).await
    }

    async fn delete_message(
        &self,
        message_id: MessageId,
        base_version: u64,
    ) -> Result<(), BackendError> {
        send_empty(
            self.delete(&format!("/messages/{message_id}"))
                .query(&DeleteMessageQuery { base_version }),
        )
        .await
    }

    async fn set_reaction(
        &self,
        message_id: MessageId,
        value: Option<&str>,
    ) -> Result<MessagePayload, BackendError> {
        let request = SetReactionRequest {
            value: value.map(str::to_string),
        };
        send_json(
            self.put(&format!("/messages/{message_id}/reaction"))
                .json(&request),
        )
        .await
    }

    async fn set_pinned(
        &self,
        message_id: MessageId,
        pinned: bool,
    ) -> Result<MessagePayload, BackendError> {
        send_json(
            self.put(&format!("/messages/{message_id}/pin"))
                .json(&SetFlagRequest { value: pinned }),
        )
        .await
    }

    async fn set_saved(&self, message_id: MessageId, saved: bool) -> Result<(), BackendError> {
        send_empty(
            self.put(&format!("/messages/{message_id}/saved"))
                .json(&SetFlagRequest { value: saved }),
        )
        .await
    }

    async fn forward_message(
        &self,
        message_id: MessageId,
        recipient_id: UserId,
    ) -> Result<MessagePayload, BackendError> {
        send_json(
            self.post(&format!("/messages/{message_id}/forward"))
                .json(&ForwardMessageRequest { recipient_id }),
        )
        .await
    }

    async fn mark_read(&self, conversation_id: ConversationId) -> Result<(), BackendError> {
        send_empty(self.post(&format!("/conversations/{conversation_id}/read"))).await
    }

    async fn upload_attachment(
        &self,
        upload: AttachmentUpload,
    ) -> Result<AttachmentPayload, BackendError> {
        let mime_type = upload
            .mime_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let request = self
            .post("/attachments")
            .query(&[("filename", upload.filename.as_str()), ("mime_type", mime_type.as_str())])
            .body(upload.bytes);
        send_json(request).await
    }
}

#[async_trait]
impl EventTransport for HttpBackend {
    async fn fetch_presence_snapshot(&self) -> Result<Vec<PresenceRecordPayload>, BackendError> {
        send_json(self.get("/presence")).await
    }

    /// Opens the push socket and forwards decoded events until the server
    /// closes it. The receiver ending is the caller's disconnect signal.
    async fn subscribe(&self) -> Result<mpsc::Receiver<ServerEvent>, BackendError> {
        let base = websocket_url(&self.server_url, "/ws")
            .map_err(|err| BackendError::Connection(err.to_string()))?;
        let ws_url = format!("{base}?user_id={}", self.user_id.0);
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .map_err(|err| BackendError::Connection(format!("{ws_url}: {err}")))?;
        info!(user_id = self.user_id.0, "events: websocket connected");

        let (_, mut ws_reader) = ws_stream.split();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!("events: undecodable server event: {err}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("events: websocket receive failed: {err}");
                        break;
                    }
                }
            }
            debug!("events: websocket reader finished");
        });
        Ok(rx)
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
