use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{broadcast, watch};

use shared::{
    domain::{DeleteScope, MessageId, NotificationId, RoomName, UserId},
    protocol::{ClientRequest, HistoryPage, HistoryQuery, MessageRecord, PostMessageRequest, ServerEvent},
};
use storage::Storage;

use crate::{
    api::{ChatApi, MediaUpload, ReportDraft, ReportSink},
    conversation::ConversationContext,
    error::TransportError,
    history::HistoryReconciler,
    live::SessionState,
    notify::Notifier,
    outbox::OutboxManager,
    transport::{ConnectionState, RealtimeTransport, TransportEvent},
};

pub fn at(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().expect("timestamp")
}

pub async fn memory_store() -> Storage {
    Storage::new("sqlite::memory:").await.expect("db")
}

pub fn record(id: i64, from: &str, to: Option<&str>, text: &str, ms: i64) -> MessageRecord {
    MessageRecord {
        id: MessageId(id),
        from_id: UserId::new(from),
        to_id: to.map(UserId::new),
        room_name: None,
        text: Some(text.to_string()),
        audio_url: None,
        created_at: at(ms),
        expires_at: None,
        read: false,
        client_ref: None,
    }
}

pub struct FakeTransport {
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<TransportEvent>,
    sent: Mutex<Vec<ClientRequest>>,
    joined: Mutex<Vec<UserId>>,
    left: Mutex<Vec<UserId>>,
    fail_sends: AtomicBool,
}

impl FakeTransport {
    fn with_state(state: ConnectionState) -> Arc<Self> {
        let (state, _) = watch::channel(state);
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            state,
            events,
            sent: Mutex::new(Vec::new()),
            joined: Mutex::new(Vec::new()),
            left: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
        })
    }

    pub fn connected() -> Arc<Self> {
        Self::with_state(ConnectionState::Connected)
    }

    pub fn disconnected() -> Arc<Self> {
        Self::with_state(ConnectionState::Disconnected)
    }

    pub fn set_connected(&self, connected: bool) {
        if connected {
            self.state.send_replace(ConnectionState::Connected);
            let _ = self.events.send(TransportEvent::Connected);
        } else {
            self.state.send_replace(ConnectionState::Disconnected);
            let _ = self.events.send(TransportEvent::Disconnected);
        }
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn push(&self, event: ServerEvent) {
        let _ = self.events.send(TransportEvent::Server(event));
    }

    pub fn sent(&self) -> Vec<ClientRequest> {
        self.sent.lock().expect("lock").clone()
    }

    pub fn joined(&self) -> Vec<UserId> {
        self.joined.lock().expect("lock").clone()
    }

    pub fn left(&self) -> Vec<UserId> {
        self.left.lock().expect("lock").clone()
    }
}

#[async_trait]
impl RealtimeTransport for FakeTransport {
    async fn send(&self, request: ClientRequest) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.sent.lock().expect("lock").push(request);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn join_room(&self, target: &UserId) -> Result<(), TransportError> {
        self.joined.lock().expect("lock").push(target.clone());
        Ok(())
    }

    fn leave_room(&self, target: &UserId) {
        self.left.lock().expect("lock").push(target.clone());
    }

    async fn close(&self) {
        self.state.send_replace(ConnectionState::Closed);
    }
}

/// In-memory server of record.
pub struct FakeChatApi {
    me: UserId,
    next_id: AtomicI64,
    pub history_pages: Mutex<Vec<HistoryPage>>,
    pub history_calls: Mutex<Vec<(RoomName, HistoryQuery)>>,
    pub history_fails: AtomicBool,
    pub read_rooms: Mutex<Vec<RoomName>>,
    pub edits: Mutex<Vec<(MessageId, String)>>,
    pub edit_fails: AtomicBool,
    pub deletes: Mutex<Vec<(MessageId, DeleteScope)>>,
    pub uploads: Mutex<Vec<MediaUpload>>,
    pub upload_fails: AtomicBool,
    pub post_attempts: Mutex<Vec<PostMessageRequest>>,
    pub posts: Mutex<Vec<PostMessageRequest>>,
    pub failing_texts: Mutex<HashSet<String>>,
    pub post_delay: Mutex<Option<Duration>>,
    pub unread_senders: Mutex<Vec<UserId>>,
    pub unread_count: AtomicU64,
    pub unread_fails: AtomicBool,
    pub notifications_read: Mutex<Vec<NotificationId>>,
}

impl FakeChatApi {
    pub fn new(me: &str) -> Arc<Self> {
        Arc::new(Self {
            me: UserId::new(me),
            next_id: AtomicI64::new(1_000),
            history_pages: Mutex::new(Vec::new()),
            history_calls: Mutex::new(Vec::new()),
            history_fails: AtomicBool::new(false),
            read_rooms: Mutex::new(Vec::new()),
            edits: Mutex::new(Vec::new()),
            edit_fails: AtomicBool::new(false),
            deletes: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            upload_fails: AtomicBool::new(false),
            post_attempts: Mutex::new(Vec::new()),
            posts: Mutex::new(Vec::new()),
            failing_texts: Mutex::new(HashSet::new()),
            post_delay: Mutex::new(None),
            unread_senders: Mutex::new(Vec::new()),
            unread_count: AtomicU64::new(0),
            unread_fails: AtomicBool::new(false),
            notifications_read: Mutex::new(Vec::new()),
        })
    }

    pub fn posted_texts(&self) -> Vec<String> {
        self.posts
            .lock()
            .expect("lock")
            .iter()
            .filter_map(|p| p.text.clone())
            .collect()
    }

    pub fn attempted_texts(&self) -> Vec<String> {
        self.post_attempts
            .lock()
            .expect("lock")
            .iter()
            .filter_map(|p| p.text.clone())
            .collect()
    }
}

#[async_trait]
impl ChatApi for FakeChatApi {
    async fn fetch_history(&self, room: &RoomName, query: HistoryQuery) -> Result<HistoryPage> {
        self.history_calls
            .lock()
            .expect("lock")
            .push((room.clone(), query));
        if self.history_fails.load(Ordering::SeqCst) {
            return Err(anyhow!("history unavailable"));
        }
        let pages = self.history_pages.lock().expect("lock");
        Ok(pages
            .get(query.page.saturating_sub(1) as usize)
            .cloned()
            .unwrap_or(HistoryPage {
                messages: Vec::new(),
                has_more: false,
            }))
    }

    async fn mark_room_read(&self, room: &RoomName) -> Result<()> {
        self.read_rooms.lock().expect("lock").push(room.clone());
        Ok(())
    }

    async fn edit_message(&self, id: MessageId, text: &str) -> Result<()> {
        if self.edit_fails.load(Ordering::SeqCst) {
            return Err(anyhow!("edit rejected"));
        }
        self.edits.lock().expect("lock").push((id, text.to_string()));
        Ok(())
    }

    async fn delete_message(&self, id: MessageId, scope: DeleteScope) -> Result<()> {
        self.deletes.lock().expect("lock").push((id, scope));
        Ok(())
    }

    async fn upload_media(&self, media: MediaUpload) -> Result<String> {
        if self.upload_fails.load(Ordering::SeqCst) {
            return Err(anyhow!("media store unavailable"));
        }
        let url = format!("https://media.test/{}", media.filename);
        self.uploads.lock().expect("lock").push(media);
        Ok(url)
    }

    async fn post_message(&self, request: &PostMessageRequest) -> Result<MessageRecord> {
        self.post_attempts
            .lock()
            .expect("lock")
            .push(request.clone());
        let delay = *self.post_delay.lock().expect("lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let fails = request
            .text
            .as_ref()
            .is_some_and(|text| self.failing_texts.lock().expect("lock").contains(text));
        if fails {
            return Err(anyhow!("server unavailable"));
        }
        self.posts.lock().expect("lock").push(request.clone());
        Ok(MessageRecord {
            id: MessageId(self.next_id.fetch_add(1, Ordering::SeqCst)),
            from_id: self.me.clone(),
            to_id: Some(request.to_id.clone()),
            room_name: Some(RoomName::between(&self.me, &request.to_id)),
            text: request.text.clone(),
            audio_url: request.audio_url.clone(),
            created_at: request.created_at,
            expires_at: None,
            read: false,
            client_ref: Some(request.client_ref.clone()),
        })
    }

    async fn unread_senders(&self) -> Result<Vec<UserId>> {
        if self.unread_fails.load(Ordering::SeqCst) {
            return Err(anyhow!("unread unavailable"));
        }
        Ok(self.unread_senders.lock().expect("lock").clone())
    }

    async fn unread_count(&self) -> Result<u64> {
        if self.unread_fails.load(Ordering::SeqCst) {
            return Err(anyhow!("unread unavailable"));
        }
        Ok(self.unread_count.load(Ordering::SeqCst))
    }

    async fn mark_notification_read(&self, id: NotificationId) -> Result<()> {
        self.notifications_read.lock().expect("lock").push(id);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sounds: AtomicUsize,
    pub toasts: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn sound_count(&self) -> usize {
        self.sounds.load(Ordering::SeqCst)
    }
}

impl Notifier for RecordingNotifier {
    fn play_sound(&self) {
        self.sounds.fetch_add(1, Ordering::SeqCst);
    }

    fn toast(&self, title: &str, body: &str) {
        self.toasts
            .lock()
            .expect("lock")
            .push((title.to_string(), body.to_string()));
    }
}

#[derive(Default)]
pub struct FakeReportSink {
    pub submitted: Mutex<Vec<ReportDraft>>,
    pub fails: AtomicBool,
}

#[async_trait]
impl ReportSink for FakeReportSink {
    async fn submit_report(&self, report: &ReportDraft) -> Result<()> {
        if self.fails.load(Ordering::SeqCst) {
            return Err(anyhow!("reports endpoint unavailable"));
        }
        self.submitted.lock().expect("lock").push(report.clone());
        Ok(())
    }
}

pub struct Harness {
    pub storage: Storage,
    pub api: Arc<FakeChatApi>,
    pub transport: Arc<FakeTransport>,
    pub reports: Arc<FakeReportSink>,
    pub notifier: Arc<RecordingNotifier>,
    pub state: Arc<SessionState>,
    pub outbox: Arc<OutboxManager>,
}

impl Harness {
    pub async fn new(me: &str, transport: Arc<FakeTransport>) -> Self {
        let storage = memory_store().await;
        let api = FakeChatApi::new(me);
        let reports = Arc::new(FakeReportSink::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let state = SessionState::new(UserId::new(me), notifier.clone());
        let outbox = Arc::new(OutboxManager::new(
            UserId::new(me),
            storage.clone(),
            api.clone(),
            transport.clone(),
            reports.clone(),
        ));
        Self {
            storage,
            api,
            transport,
            reports,
            notifier,
            state,
            outbox,
        }
    }

    pub fn context(&self) -> ConversationContext {
        ConversationContext {
            storage: self.storage.clone(),
            api: self.api.clone(),
            transport: self.transport.clone(),
            outbox: self.outbox.clone(),
            history: HistoryReconciler::new(self.storage.clone(), self.api.clone(), 50, 5),
            state: self.state.clone(),
            watch_min_interval: Duration::from_millis(5),
        }
    }
}
