use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{multipart, Client, RequestBuilder, Response};

use shared::{
    domain::{DeleteScope, MessageId, NotificationId, RoomName, UserId},
    error::ApiError,
    protocol::{
        EditMessageRequest, HistoryPage, HistoryQuery, MediaUploadResponse, MessageRecord,
        PostMessageRequest, ReportReceipt, UnreadCountResponse, UnreadSendersResponse,
    },
};

/// Binary payload for `POST /chat/media`.
#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub filename: String,
}

/// Report ready for submission: opaque JSON payload plus attached images.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportDraft {
    pub payload: String,
    pub images: Vec<storage::ReportImage>,
}

/// Authenticated chat endpoints of the server of record.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn fetch_history(&self, room: &RoomName, query: HistoryQuery) -> Result<HistoryPage>;
    async fn mark_room_read(&self, room: &RoomName) -> Result<()>;
    async fn edit_message(&self, id: MessageId, text: &str) -> Result<()>;
    async fn delete_message(&self, id: MessageId, scope: DeleteScope) -> Result<()>;
    /// Returns the durable URL of the stored media.
    async fn upload_media(&self, media: MediaUpload) -> Result<String>;
    async fn post_message(&self, request: &PostMessageRequest) -> Result<MessageRecord>;
    async fn unread_senders(&self) -> Result<Vec<UserId>>;
    async fn unread_count(&self) -> Result<u64>;
    async fn mark_notification_read(&self, id: NotificationId) -> Result<()>;
}

#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn submit_report(&self, report: &ReportDraft) -> Result<()>;
}

#[derive(Clone)]
pub struct HttpChatApi {
    http: Client,
    server_url: String,
    token: Option<String>,
}

impl HttpChatApi {
    pub fn new(server_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            server_url: server_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.authorized(self.http.get(format!("{}{path}", self.server_url)))
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.authorized(self.http.post(format!("{}{path}", self.server_url)))
    }

    fn patch(&self, path: &str) -> RequestBuilder {
        self.authorized(self.http.patch(format!("{}{path}", self.server_url)))
    }

    fn delete(&self, path: &str) -> RequestBuilder {
        self.authorized(self.http.delete(format!("{}{path}", self.server_url)))
    }
}

/// Turns a non-success response into an [`ApiError`] so callers can
/// `downcast_ref` on the error code.
async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let error = serde_json::from_str::<ApiError>(&body)
        .unwrap_or_else(|_| ApiError::from_status(status.as_u16(), body));
    Err(error.into())
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_history(&self, room: &RoomName, query: HistoryQuery) -> Result<HistoryPage> {
        let response = self
            .get(&format!("/chat/history/{room}"))
            .query(&query)
            .send()
            .await
            .with_context(|| format!("failed to fetch history for {room}"))?;
        let page = ensure_success(response).await?.json().await?;
        Ok(page)
    }

    async fn mark_room_read(&self, room: &RoomName) -> Result<()> {
        let response = self
            .patch(&format!("/chat/history/{room}/read"))
            .send()
            .await
            .with_context(|| format!("failed to mark {room} read"))?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn edit_message(&self, id: MessageId, text: &str) -> Result<()> {
        let response = self
            .patch(&format!("/chat/messages/{id}"))
            .json(&EditMessageRequest {
                text: text.to_string(),
            })
            .send()
            .await
            .with_context(|| format!("failed to edit message {id}"))?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn delete_message(&self, id: MessageId, scope: DeleteScope) -> Result<()> {
        let response = self
            .delete(&format!("/chat/messages/{id}"))
            .query(&[("type", scope.as_str())])
            .send()
            .await
            .with_context(|| format!("failed to delete message {id}"))?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn upload_media(&self, media: MediaUpload) -> Result<String> {
        let part = multipart::Part::bytes(media.bytes)
            .file_name(media.filename)
            .mime_str(&media.mime_type)
            .context("invalid media mime type")?;
        let form = multipart::Form::new().part("file", part);
        let response = self
            .post("/chat/media")
            .multipart(form)
            .send()
            .await
            .context("failed to upload media")?;
        let uploaded: MediaUploadResponse = ensure_success(response).await?.json().await?;
        Ok(uploaded.url)
    }

    async fn post_message(&self, request: &PostMessageRequest) -> Result<MessageRecord> {
        let response = self
            .post("/chat/messages")
            .json(request)
            .send()
            .await
            .context("failed to post chat message")?;
        let record = ensure_success(response).await?.json().await?;
        Ok(record)
    }

    async fn unread_senders(&self) -> Result<Vec<UserId>> {
        let response = self
            .get("/chat/unread-senders")
            .send()
            .await
            .context("failed to fetch unread senders")?;
        let body: UnreadSendersResponse = ensure_success(response).await?.json().await?;
        Ok(body.senders)
    }

    async fn unread_count(&self) -> Result<u64> {
        let response = self
            .get("/chat/unread-count")
            .send()
            .await
            .context("failed to fetch unread count")?;
        let body: UnreadCountResponse = ensure_success(response).await?.json().await?;
        Ok(body.count)
    }

    async fn mark_notification_read(&self, id: NotificationId) -> Result<()> {
        let response = self
            .patch(&format!("/notifications/{id}/read"))
            .send()
            .await
            .with_context(|| format!("failed to mark notification {id} read"))?;
        ensure_success(response).await?;
        Ok(())
    }
}

/// Posts reports as multipart: a `payload` JSON field plus one `images` part
/// per attachment, in order.
#[derive(Clone)]
pub struct HttpReportSink {
    api: HttpChatApi,
}

impl HttpReportSink {
    pub fn new(api: HttpChatApi) -> Self {
        Self { api }
    }
}

#[async_trait]
impl ReportSink for HttpReportSink {
    async fn submit_report(&self, report: &ReportDraft) -> Result<()> {
        let mut form = multipart::Form::new().text("payload", report.payload.clone());
        for image in &report.images {
            let mut part = multipart::Part::bytes(image.data.clone()).file_name(image.filename.clone());
            if let Some(mime) = &image.mime_type {
                part = part
                    .mime_str(mime)
                    .with_context(|| format!("invalid mime type for {}", image.filename))?;
            }
            form = form.part("images", part);
        }
        let response = self
            .api
            .post("/reports")
            .multipart(form)
            .send()
            .await
            .context("failed to submit report")?;
        let receipt: ReportReceipt = ensure_success(response).await?.json().await?;
        tracing::debug!(report_id = receipt.id, "outbox: report accepted");
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
