use super::*;
use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{TimeZone, Utc};
use shared::error::ErrorCode;
use tokio::{net::TcpListener, sync::Mutex};

#[derive(Clone, Default)]
struct ServerState {
    calls: Arc<Mutex<Vec<String>>>,
    auth: Arc<Mutex<Option<String>>>,
    uploads: Arc<Mutex<Vec<(String, Option<String>, Vec<u8>)>>>,
}

fn sample_record(id: i64) -> MessageRecord {
    MessageRecord {
        id: MessageId(id),
        from_id: UserId::new("bob"),
        to_id: Some(UserId::new("alice")),
        room_name: None,
        text: Some(format!("message {id}")),
        audio_url: None,
        created_at: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
        expires_at: None,
        read: false,
        client_ref: None,
    }
}

async fn history(
    State(state): State<ServerState>,
    Path(room): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Json<HistoryPage> {
    state
        .calls
        .lock()
        .await
        .push(format!("history {room} page={} limit={}", query.page, query.limit));
    Json(HistoryPage {
        messages: vec![sample_record(query.page as i64)],
        has_more: query.page < 2,
    })
}

async fn mark_read(State(state): State<ServerState>, Path(room): Path<String>) -> StatusCode {
    state.calls.lock().await.push(format!("read {room}"));
    StatusCode::NO_CONTENT
}

async fn edit(
    State(state): State<ServerState>,
    Path(id): Path<i64>,
    Json(body): Json<EditMessageRequest>,
) -> StatusCode {
    state.calls.lock().await.push(format!("edit {id} {}", body.text));
    StatusCode::OK
}

async fn remove(
    State(state): State<ServerState>,
    Path(id): Path<i64>,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let scope = query.get("type").cloned().unwrap_or_default();
    state.calls.lock().await.push(format!("delete {id} {scope}"));
    if id == 403 {
        return (
            StatusCode::FORBIDDEN,
            Json(ApiError::new(ErrorCode::Forbidden, "not your message")),
        )
            .into_response();
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn upload(State(state): State<ServerState>, mut multipart: Multipart) -> Json<MediaUploadResponse> {
    while let Some(field) = multipart.next_field().await.expect("field") {
        let name = field.file_name().unwrap_or_default().to_string();
        let mime = field.content_type().map(str::to_string);
        let data = field.bytes().await.expect("bytes").to_vec();
        state.uploads.lock().await.push((name, mime, data));
    }
    Json(MediaUploadResponse {
        url: "https://media.test/clip.webm".into(),
    })
}

async fn post_message(Json(body): Json<PostMessageRequest>) -> Json<MessageRecord> {
    let mut record = sample_record(77);
    record.from_id = UserId::new("alice");
    record.to_id = Some(body.to_id);
    record.text = body.text;
    record.client_ref = Some(body.client_ref);
    Json(record)
}

async fn unread_count(State(state): State<ServerState>, headers: HeaderMap) -> Json<UnreadCountResponse> {
    *state.auth.lock().await = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    Json(UnreadCountResponse { count: 4 })
}

async fn report(State(state): State<ServerState>, mut multipart: Multipart) -> Json<ReportReceipt> {
    while let Some(field) = multipart.next_field().await.expect("field") {
        let name = field.name().unwrap_or_default().to_string();
        let file = field.file_name().map(str::to_string);
        let data = field.bytes().await.expect("bytes").to_vec();
        state.uploads.lock().await.push((name, file, data));
    }
    Json(ReportReceipt { id: 12 })
}

async fn spawn_api_server() -> (String, ServerState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = ServerState::default();
    let app = Router::new()
        .route("/chat/history/:room", get(history))
        .route("/chat/history/:room/read", patch(mark_read))
        .route("/chat/messages/:id", patch(edit).delete(remove))
        .route("/chat/messages", post(post_message))
        .route("/chat/media", post(upload))
        .route("/chat/unread-count", get(unread_count))
        .route("/reports", post(report))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

fn client(url: &str, token: Option<&str>) -> HttpChatApi {
    HttpChatApi::new(url, token.map(str::to_string), Duration::from_secs(5)).expect("client")
}

#[tokio::test]
async fn history_request_carries_page_and_limit() {
    let (url, state) = spawn_api_server().await;
    let api = client(&url, None);
    let room = RoomName::between(&UserId::new("alice"), &UserId::new("bob"));

    let page = api
        .fetch_history(&room, HistoryQuery { page: 1, limit: 25 })
        .await
        .expect("history");
    assert_eq!(page.messages.len(), 1);
    assert!(page.has_more);

    api.mark_room_read(&room).await.expect("read");
    let calls = state.calls.lock().await.clone();
    assert_eq!(
        calls,
        vec![
            "history alice_bob page=1 limit=25".to_string(),
            "read alice_bob".to_string()
        ]
    );
}

#[tokio::test]
async fn edit_and_delete_hit_message_routes() {
    let (url, state) = spawn_api_server().await;
    let api = client(&url, None);

    api.edit_message(MessageId(5), "better").await.expect("edit");
    api.delete_message(MessageId(5), DeleteScope::Everyone)
        .await
        .expect("delete");

    let calls = state.calls.lock().await.clone();
    assert_eq!(calls, vec!["edit 5 better", "delete 5 everyone"]);
}

#[tokio::test]
async fn error_body_is_exposed_as_api_error() {
    let (url, _state) = spawn_api_server().await;
    let api = client(&url, None);

    let err = api
        .delete_message(MessageId(403), DeleteScope::Me)
        .await
        .expect_err("forbidden");
    let api_error = err.downcast_ref::<ApiError>().expect("api error");
    assert_eq!(api_error.code, ErrorCode::Forbidden);
    assert!(!api_error.code.is_transient());
}

#[tokio::test]
async fn media_upload_is_multipart_and_returns_url() {
    let (url, state) = spawn_api_server().await;
    let api = client(&url, None);

    let media_url = api
        .upload_media(MediaUpload {
            bytes: vec![1, 2, 3],
            mime_type: "audio/webm".into(),
            filename: "clip.webm".into(),
        })
        .await
        .expect("upload");
    assert_eq!(media_url, "https://media.test/clip.webm");

    let uploads = state.uploads.lock().await.clone();
    assert_eq!(
        uploads,
        vec![(
            "clip.webm".to_string(),
            Some("audio/webm".to_string()),
            vec![1, 2, 3]
        )]
    );
}

#[tokio::test]
async fn post_message_returns_durable_record() {
    let (url, _state) = spawn_api_server().await;
    let api = client(&url, None);

    let record = api
        .post_message(&PostMessageRequest {
            to_id: UserId::new("bob"),
            text: Some("queued".into()),
            audio_url: None,
            client_ref: "ref-1".into(),
            created_at: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
        })
        .await
        .expect("post");
    assert_eq!(record.id, MessageId(77));
    assert_eq!(record.client_ref.as_deref(), Some("ref-1"));
}

#[tokio::test]
async fn bearer_token_is_attached() {
    let (url, state) = spawn_api_server().await;
    let api = client(&url, Some("secret"));

    assert_eq!(api.unread_count().await.expect("count"), 4);
    assert_eq!(
        state.auth.lock().await.as_deref(),
        Some("Bearer secret")
    );
}

#[tokio::test]
async fn report_sink_posts_payload_then_images() {
    let (url, state) = spawn_api_server().await;
    let sink = HttpReportSink::new(client(&url, None));

    sink.submit_report(&ReportDraft {
        payload: r#"{"title":"leak"}"#.into(),
        images: vec![
            storage::ReportImage {
                filename: "a.jpg".into(),
                mime_type: Some("image/jpeg".into()),
                data: vec![1],
            },
            storage::ReportImage {
                filename: "b.png".into(),
                mime_type: None,
                data: vec![2],
            },
        ],
    })
    .await
    .expect("report");

    let parts = state.uploads.lock().await.clone();
    let names: Vec<_> = parts.iter().map(|(name, _, _)| name.as_str()).collect();
    assert_eq!(names, vec!["payload", "images", "images"]);
    assert_eq!(parts[1].1.as_deref(), Some("a.jpg"));
    assert_eq!(parts[2].2, vec![2]);
}
