use super::*;

use std::sync::{Arc, Mutex};

use axum::{
    body::Bytes,
    extract::{
        ws::{Message as WsMessage, WebSocketUpgrade},
        State,
    },
    http::{Method, Uri},
    response::Response as AxumResponse,
    routing::{get, patch, post},
    Json, Router,
};
use shared::domain::PresenceStatus;
use tokio::net::TcpListener;
use uuid::Uuid;

use crate::test_support::{contact, payload, ts};

#[derive(Clone, Default)]
struct Recorded {
    requests: Arc<Mutex<Vec<String>>>,
    bodies: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Recorded {
    fn record(&self, method: &Method, uri: &Uri) {
        self.requests
            .lock()
            .expect("requests")
            .push(format!("{method} {uri}"));
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("requests").clone()
    }
}

async fn recipients(
    State(state): State<Recorded>,
    method: Method,
    uri: Uri,
) -> Json<Vec<ContactSummary>> {
    state.record(&method, &uri);
    Json(vec![contact(2, "Ms. Achebe", Role::Teacher)])
}

async fn send(
    State(state): State<Recorded>,
    method: Method,
    uri: Uri,
    Json(request): Json<SendMessageRequest>,
) -> Json<MessagePayload> {
    state.record(&method, &uri);
    let mut message = payload(501, 800, 1, 2, &request.body, 10);
    message.version = 1;
    Json(message)
}

async fn edit_conflict(
    State(state): State<Recorded>,
    method: Method,
    uri: Uri,
) -> (axum::http::StatusCode, Json<ApiError>) {
    state.record(&method, &uri);
    (
        axum::http::StatusCode::CONFLICT,
        Json(ApiError::new(ErrorCode::Conflict, "message changed")),
    )
}

async fn delete_message(
    State(state): State<Recorded>,
    method: Method,
    uri: Uri,
) -> axum::http::StatusCode {
    state.record(&method, &uri);
    axum::http::StatusCode::NO_CONTENT
}

async fn broken_thread() -> (axum::http::StatusCode, &'static str) {
    (
        axum::http::StatusCode::SERVICE_UNAVAILABLE,
        "database unavailable",
    )
}

async fn upload(
    State(state): State<Recorded>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Json<AttachmentPayload> {
    state.record(&method, &uri);
    state.bodies.lock().expect("bodies").push(body.to_vec());
    Json(AttachmentPayload {
        url: "/files/77".into(),
        filename: "notes.pdf".into(),
    })
}

async fn presence() -> Json<Vec<PresenceRecordPayload>> {
    Json(vec![PresenceRecordPayload {
        user_id: UserId(2),
        visible_status: Some(PresenceStatus::Online),
        last_seen_at: None,
        hidden: None,
    }])
}

async fn events(ws: WebSocketUpgrade) -> AxumResponse {
    ws.on_upgrade(|mut socket| async move {
        let event = ServerEvent::MessageDeleted {
            conversation_id: ConversationId(800),
            message_id: MessageId(501),
            deleted_at: ts(50),
            version: 4,
        };
        let text = serde_json::to_string(&event).expect("encode event");
        let _ = socket.send(WsMessage::Text(text)).await;
        let _ = socket.send(WsMessage::Text("not an event".into())).await;
        let _ = socket.send(WsMessage::Close(None)).await;
    })
}

async fn spawn_portal_server() -> anyhow::Result<(String, Recorded)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = Recorded::default();
    let app = Router::new()
        .route("/recipients", get(recipients))
        .route("/messages", post(send))
        .route("/messages/:id", patch(edit_conflict).delete(delete_message))
        .route("/conversations/:id/messages", get(broken_thread))
        .route("/attachments", post(upload))
        .route("/presence", get(presence))
        .route("/ws", get(events))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), state))
}

fn backend(server_url: &str) -> HttpBackend {
    HttpBackend::new(server_url, UserId(1), Duration::from_secs(5)).expect("backend")
}

#[test]
fn status_codes_map_onto_error_codes() {
    assert_eq!(code_for_status(StatusCode::CONFLICT), ErrorCode::Conflict);
    assert_eq!(code_for_status(StatusCode::NOT_FOUND), ErrorCode::NotFound);
    assert_eq!(code_for_status(StatusCode::FORBIDDEN), ErrorCode::Forbidden);
    assert_eq!(code_for_status(StatusCode::UNAUTHORIZED), ErrorCode::Unauthorized);
    assert_eq!(
        code_for_status(StatusCode::UNPROCESSABLE_ENTITY),
        ErrorCode::Validation
    );
    assert_eq!(
        code_for_status(StatusCode::TOO_MANY_REQUESTS),
        ErrorCode::RateLimited
    );
    assert_eq!(code_for_status(StatusCode::BAD_GATEWAY), ErrorCode::Internal);
}

#[tokio::test]
async fn recipients_request_carries_identity_and_role() {
    let (server_url, recorded) = spawn_portal_server().await.expect("spawn server");
    let contacts = backend(&server_url)
        .list_recipients(Some(Role::Teacher))
        .await
        .expect("recipients");

    assert_eq!(contacts, vec![contact(2, "Ms. Achebe", Role::Teacher)]);
    assert_eq!(
        recorded.requests(),
        vec!["GET /recipients?user_id=1&role=teacher".to_string()]
    );
}

#[tokio::test]
async fn send_posts_json_and_decodes_the_stored_message() {
    let (server_url, _) = spawn_portal_server().await.expect("spawn server");
    let stored = backend(&server_url)
        .send_message(SendMessageRequest {
            target: shared::protocol::SendTarget::Recipient(UserId(2)),
            body: "see you at pickup".into(),
            attachments: Vec::new(),
            reply_to_id: None,
            client_nonce: Uuid::new_v4(),
        })
        .await
        .expect("send");

    assert_eq!(stored.message_id, MessageId(501));
    assert_eq!(stored.body, "see you at pickup");
    assert_eq!(stored.version, 1);
}

#[tokio::test]
async fn api_error_bodies_become_rejections() {
    let (server_url, _) = spawn_portal_server().await.expect("spawn server");
    let err = backend(&server_url)
        .edit_message(MessageId(501), "edited", 2)
        .await
        .expect_err("conflict");

    assert_eq!(
        err,
        BackendError::rejected(ErrorCode::Conflict, "message changed")
    );
    assert!(!err.is_transient());
}

#[tokio::test]
async fn plain_error_bodies_fall_back_to_status() {
    let (server_url, _) = spawn_portal_server().await.expect("spawn server");
    let err = backend(&server_url)
        .load_thread(ConversationId(800))
        .await
        .expect_err("server error");

    assert_eq!(
        err,
        BackendError::rejected(ErrorCode::Internal, "database unavailable")
    );
    assert!(err.is_transient());
}

#[tokio::test]
async fn delete_sends_base_version() {
    let (server_url, recorded) = spawn_portal_server().await.expect("spawn server");
    backend(&server_url)
        .delete_message(MessageId(501), 3)
        .await
        .expect("delete");

    assert_eq!(
        recorded.requests(),
        vec!["DELETE /messages/501?user_id=1&base_version=3".to_string()]
    );
}

#[tokio::test]
async fn upload_streams_raw_bytes() {
    let (server_url, recorded) = spawn_portal_server().await.expect("spawn server");
    let attachment = backend(&server_url)
        .upload_attachment(AttachmentUpload {
            filename: "notes.pdf".into(),
            mime_type: Some("application/pdf".into()),
            bytes: b"%PDF-1.7".to_vec(),
        })
        .await
        .expect("upload");

    assert_eq!(attachment.url, "/files/77");
    let requests = recorded.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].starts_with("POST /attachments?user_id=1&filename=notes.pdf"));
    assert_eq!(
        recorded.bodies.lock().expect("bodies").as_slice(),
        &[b"%PDF-1.7".to_vec()]
    );
}

#[tokio::test]
async fn unreachable_server_is_a_connection_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let err = backend(&format!("http://{addr}"))
        .list_conversations()
        .await
        .expect_err("nothing listening");
    assert!(matches!(err, BackendError::Connection(_)));
    assert!(err.is_transient());
}

#[tokio::test]
async fn presence_snapshot_is_fetched_over_http() {
    let (server_url, _) = spawn_portal_server().await.expect("spawn server");
    let records = backend(&server_url)
        .fetch_presence_snapshot()
        .await
        .expect("snapshot");

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].visible_status, Some(PresenceStatus::Online));
}

#[tokio::test]
async fn websocket_events_are_decoded_until_close() {
    let (server_url, _) = spawn_portal_server().await.expect("spawn server");
    let mut feed = backend(&server_url).subscribe().await.expect("subscribe");

    let first = feed.recv().await.expect("first event");
    match first {
        ServerEvent::MessageDeleted {
            message_id,
            version,
            ..
        } => {
            assert_eq!(message_id, MessageId(501));
            assert_eq!(version, 4);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(feed.recv().await.is_none());
}
