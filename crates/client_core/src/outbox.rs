use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::{
    sync::{watch, Mutex as AsyncMutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared::{
    domain::{RoomName, UserId},
    protocol::{ClientRequest, MessageRecord, PostMessageRequest},
};
use storage::{NewChatMessage, NewPendingMessage, NewPendingReport, Storage, LOCAL_AUDIO_SCHEME};

use crate::{
    api::{ChatApi, MediaUpload, ReportDraft, ReportSink},
    error::ChatError,
    transport::RealtimeTransport,
};

const DEFAULT_AUDIO_MIME: &str = "audio/webm";

#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingPayload {
    Text(String),
    Audio(AudioClip),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the realtime connection; the echo carries the durable id.
    Sent { client_ref: String },
    Queued {
        local_id: i64,
        pending_id: i64,
        client_ref: String,
    },
    /// The local store refused the write; kept in memory for this session.
    HeldInMemory { client_ref: String },
}

impl SendOutcome {
    pub fn client_ref(&self) -> &str {
        match self {
            SendOutcome::Sent { client_ref }
            | SendOutcome::Queued { client_ref, .. }
            | SendOutcome::HeldInMemory { client_ref } => client_ref,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Submitted,
    Queued { pending_id: i64 },
    HeldInMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    pub messages_sent: usize,
    pub reports_sent: usize,
    /// An entry failed and the rest of its queue was left for the next trigger.
    pub stalled: bool,
}

/// Routes sends through the realtime connection when online and through the
/// persistent outbox otherwise, then drains the outbox when connectivity
/// returns.
pub struct OutboxManager {
    me: UserId,
    storage: Storage,
    api: Arc<dyn ChatApi>,
    transport: Arc<dyn RealtimeTransport>,
    reports: Arc<dyn ReportSink>,
    network_online: watch::Sender<bool>,
    drain_lock: AsyncMutex<()>,
    rerun: AtomicBool,
    memory_messages: Mutex<VecDeque<NewPendingMessage>>,
    memory_reports: Mutex<VecDeque<ReportDraft>>,
}

impl OutboxManager {
    pub fn new(
        me: UserId,
        storage: Storage,
        api: Arc<dyn ChatApi>,
        transport: Arc<dyn RealtimeTransport>,
        reports: Arc<dyn ReportSink>,
    ) -> Self {
        let (network_online, _) = watch::channel(true);
        Self {
            me,
            storage,
            api,
            transport,
            reports,
            network_online,
            drain_lock: AsyncMutex::new(()),
            rerun: AtomicBool::new(false),
            memory_messages: Mutex::new(VecDeque::new()),
            memory_reports: Mutex::new(VecDeque::new()),
        }
    }

    /// Host-reported connectivity (the platform's online/offline signal).
    pub fn set_network_online(&self, online: bool) {
        let previous = self.network_online.send_replace(online);
        if previous != online {
            info!(online, "outbox: network state changed");
        }
    }

    pub fn network_online(&self) -> bool {
        *self.network_online.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.network_online() && self.transport.is_connected()
    }

    pub async fn send(&self, to: &UserId, payload: OutgoingPayload) -> Result<SendOutcome, ChatError> {
        match &payload {
            OutgoingPayload::Text(text) if text.trim().is_empty() => {
                return Err(ChatError::EmptyMessage)
            }
            OutgoingPayload::Audio(clip) if clip.bytes.is_empty() => {
                return Err(ChatError::EmptyMessage)
            }
            _ => {}
        }

        let client_ref = Uuid::new_v4().to_string();
        let created_at = Utc::now();

        if self.is_online() {
            return self.send_live(to, payload, client_ref, created_at).await;
        }

        let (text, audio_blob, audio_mime, audio_url, expires_at) = match payload {
            OutgoingPayload::Text(text) => (Some(text), None, None, None, None),
            OutgoingPayload::Audio(clip) => (
                None,
                Some(clip.bytes),
                Some(clip.mime_type),
                Some(format!("{LOCAL_AUDIO_SCHEME}{client_ref}")),
                clip.expires_at,
            ),
        };
        let chat = self.local_row(to, text.clone(), audio_url, &client_ref, created_at, expires_at);
        let pending = NewPendingMessage {
            to_id: to.clone(),
            text,
            audio_blob,
            audio_mime,
            audio_url: None,
            client_ref,
            created_at,
        };
        Ok(self.enqueue(&chat, pending).await)
    }

    /// The outbox entry is written before the frame so that a frame lost with
    /// the connection is re-posted by the next drain. The echo removes it.
    async fn send_live(
        &self,
        to: &UserId,
        payload: OutgoingPayload,
        client_ref: String,
        created_at: DateTime<Utc>,
    ) -> Result<SendOutcome, ChatError> {
        let (text, audio_url, expires_at) = match payload {
            OutgoingPayload::Text(text) => (Some(text), None, None),
            OutgoingPayload::Audio(clip) => {
                let url = self
                    .api
                    .upload_media(MediaUpload {
                        filename: audio_filename(&client_ref, &clip.mime_type),
                        bytes: clip.bytes,
                        mime_type: clip.mime_type,
                    })
                    .await
                    .map_err(ChatError::MediaUpload)?;
                (None, Some(url), clip.expires_at)
            }
        };

        let chat = self.local_row(
            to,
            text.clone(),
            audio_url.clone(),
            &client_ref,
            created_at,
            expires_at,
        );
        let pending = NewPendingMessage {
            to_id: to.clone(),
            text: text.clone(),
            audio_blob: None,
            audio_mime: None,
            audio_url: audio_url.clone(),
            client_ref: client_ref.clone(),
            created_at,
        };
        let queued = self.enqueue(&chat, pending).await;

        let request = ClientRequest::PrivateMessage {
            target_user_id: to.clone(),
            text,
            audio_url,
            client_ref: client_ref.clone(),
            created_at,
        };
        match self.transport.send(request).await {
            Ok(()) => {
                debug!(to = %to, client_ref = %client_ref, "outbox: sent live");
                Ok(SendOutcome::Sent { client_ref })
            }
            Err(err) => {
                warn!(to = %to, error = %err, "outbox: live send failed, left queued");
                Ok(queued)
            }
        }
    }

    fn local_row(
        &self,
        to: &UserId,
        text: Option<String>,
        audio_url: Option<String>,
        client_ref: &str,
        created_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> NewChatMessage {
        NewChatMessage {
            id: None,
            client_ref: Some(client_ref.to_string()),
            room_name: RoomName::between(&self.me, to),
            from_id: self.me.clone(),
            to_id: to.clone(),
            text,
            audio_url,
            created_at,
            expires_at,
            read: Some(false),
        }
    }

    async fn enqueue(&self, chat: &NewChatMessage, pending: NewPendingMessage) -> SendOutcome {
        let client_ref = pending.client_ref.clone();
        match self.storage.enqueue_pending_message(chat, &pending).await {
            Ok((local_id, pending_id)) => {
                info!(to = %pending.to_id, pending_id, client_ref = %client_ref, "outbox: message queued");
                SendOutcome::Queued {
                    local_id,
                    pending_id,
                    client_ref,
                }
            }
            Err(err) => {
                warn!(to = %pending.to_id, error = %err, "outbox: store rejected entry, holding in memory");
                self.memory_messages
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push_back(pending);
                SendOutcome::HeldInMemory { client_ref }
            }
        }
    }

    pub async fn submit_report(&self, report: ReportDraft) -> ReportOutcome {
        if self.network_online() {
            match self.reports.submit_report(&report).await {
                Ok(()) => return ReportOutcome::Submitted,
                Err(err) => warn!(error = %err, "outbox: report submit failed, queueing"),
            }
        }

        let pending = NewPendingReport {
            payload: report.payload.clone(),
            images: report.images.clone(),
            created_at: Utc::now(),
        };
        match self.storage.enqueue_pending_report(&pending).await {
            Ok(pending_id) => {
                info!(pending_id, "outbox: report queued");
                ReportOutcome::Queued { pending_id }
            }
            Err(err) => {
                warn!(error = %err, "outbox: store rejected report, holding in memory");
                self.memory_reports
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push_back(report);
                ReportOutcome::HeldInMemory
            }
        }
    }

    /// Entries still waiting, persistent and in-memory.
    pub async fn pending_count(&self) -> Result<usize> {
        let stored = self.storage.pending_message_count().await?;
        let held = self
            .memory_messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        Ok(usize::try_from(stored).unwrap_or(0) + held)
    }

    pub async fn app_foregrounded(&self) -> DrainReport {
        self.drain().await
    }

    /// Single-flight: a call made while a drain is running makes that drain
    /// take another pass instead of starting a second one.
    pub async fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();
        self.rerun.store(true, Ordering::SeqCst);
        loop {
            let Ok(guard) = self.drain_lock.try_lock() else {
                debug!("outbox: drain already running, coalesced");
                return report;
            };
            while self.rerun.swap(false, Ordering::SeqCst) {
                self.drain_pass(&mut report).await;
            }
            drop(guard);
            if !self.rerun.load(Ordering::SeqCst) {
                return report;
            }
        }
    }

    async fn drain_pass(&self, report: &mut DrainReport) {
        if !self.network_online() {
            debug!("outbox: offline, drain skipped");
            return;
        }
        if self.drain_stored_messages(report).await {
            self.drain_memory_messages(report).await;
        }
        if self.drain_stored_reports(report).await {
            self.drain_memory_reports(report).await;
        }
        if report.messages_sent > 0 || report.reports_sent > 0 {
            info!(
                messages = report.messages_sent,
                reports = report.reports_sent,
                stalled = report.stalled,
                "outbox: drain pass finished"
            );
        }
    }

    /// Returns false when the queue stalled.
    async fn drain_stored_messages(&self, report: &mut DrainReport) -> bool {
        let pending = match self.storage.list_pending_messages().await {
            Ok(pending) => pending,
            Err(err) => {
                warn!(error = %err, "outbox: failed to read pending messages");
                report.stalled = true;
                return false;
            }
        };

        for entry in pending {
            let draft = entry.to_draft();
            match self.deliver(&draft).await {
                Ok(record) => {
                    if let Err(err) = self.storage.delete_pending_message(entry.id).await {
                        warn!(pending_id = entry.id, error = %err, "outbox: delivered but could not dequeue");
                        report.stalled = true;
                        return false;
                    }
                    self.confirm(&record, &draft).await;
                    report.messages_sent += 1;
                }
                Err(err) => {
                    warn!(
                        pending_id = entry.id,
                        attempts = entry.attempts + 1,
                        error = %err,
                        "outbox: delivery failed, keeping entry"
                    );
                    if let Err(record_err) = self
                        .storage
                        .record_pending_message_failure(entry.id, &format!("{err:#}"))
                        .await
                    {
                        warn!(pending_id = entry.id, error = %record_err, "outbox: failed to record attempt");
                    }
                    report.stalled = true;
                    return false;
                }
            }
        }
        true
    }

    async fn drain_memory_messages(&self, report: &mut DrainReport) {
        loop {
            let next = self
                .memory_messages
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            let Some(draft) = next else {
                return;
            };
            match self.deliver(&draft).await {
                Ok(record) => {
                    self.confirm(&record, &draft).await;
                    report.messages_sent += 1;
                }
                Err(err) => {
                    warn!(client_ref = %draft.client_ref, error = %err, "outbox: in-memory delivery failed");
                    self.memory_messages
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push_front(draft);
                    report.stalled = true;
                    return;
                }
            }
        }
    }

    async fn drain_stored_reports(&self, report: &mut DrainReport) -> bool {
        let pending = match self.storage.list_pending_reports().await {
            Ok(pending) => pending,
            Err(err) => {
                warn!(error = %err, "outbox: failed to read pending reports");
                report.stalled = true;
                return false;
            }
        };

        for entry in pending {
            let draft = ReportDraft {
                payload: entry.payload,
                images: entry.images,
            };
            if let Err(err) = self.reports.submit_report(&draft).await {
                warn!(report_id = entry.id, error = %err, "outbox: report delivery failed");
                if let Err(record_err) = self
                    .storage
                    .record_pending_report_failure(entry.id, &format!("{err:#}"))
                    .await
                {
                    warn!(report_id = entry.id, error = %record_err, "outbox: failed to record attempt");
                }
                report.stalled = true;
                return false;
            }
            if let Err(err) = self.storage.delete_pending_report(entry.id).await {
                warn!(report_id = entry.id, error = %err, "outbox: delivered report but could not dequeue");
                report.stalled = true;
                return false;
            }
            report.reports_sent += 1;
        }
        true
    }

    async fn drain_memory_reports(&self, report: &mut DrainReport) {
        loop {
            let next = self
                .memory_reports
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            let Some(draft) = next else {
                return;
            };
            if let Err(err) = self.reports.submit_report(&draft).await {
                warn!(error = %err, "outbox: in-memory report delivery failed");
                self.memory_reports
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push_front(draft);
                report.stalled = true;
                return;
            }
            report.reports_sent += 1;
        }
    }

    async fn deliver(&self, draft: &NewPendingMessage) -> Result<MessageRecord> {
        let audio_url = match (&draft.audio_url, &draft.audio_blob) {
            (Some(url), _) => Some(url.clone()),
            (None, Some(blob)) => {
                let mime_type = draft
                    .audio_mime
                    .clone()
                    .unwrap_or_else(|| DEFAULT_AUDIO_MIME.to_string());
                let url = self
                    .api
                    .upload_media(MediaUpload {
                        bytes: blob.clone(),
                        filename: audio_filename(&draft.client_ref, &mime_type),
                        mime_type,
                    })
                    .await
                    .context("failed to upload queued audio")?;
                Some(url)
            }
            (None, None) => None,
        };

        self.api
            .post_message(&PostMessageRequest {
                to_id: draft.to_id.clone(),
                text: draft.text.clone(),
                audio_url,
                client_ref: draft.client_ref.clone(),
                created_at: draft.created_at,
            })
            .await
    }

    /// Folds the durable record into the local row holding the same client ref.
    async fn confirm(&self, record: &MessageRecord, draft: &NewPendingMessage) {
        let mut message = NewChatMessage::from_record(record, &self.me, &draft.to_id);
        message.client_ref = Some(draft.client_ref.clone());
        if let Err(err) = self.storage.put_chat_message(&message).await {
            warn!(id = %record.id, error = %err, "outbox: failed to store confirmation");
        }
    }

    /// Drains whenever the combined online state goes from offline to online.
    pub fn spawn_trigger_loop(self: Arc<Self>) -> JoinHandle<()> {
        let mut network = self.network_online.subscribe();
        let mut transport = self.transport.state();
        tokio::spawn(async move {
            let mut was_online = self.is_online();
            if was_online {
                self.drain().await;
            }
            loop {
                tokio::select! {
                    changed = network.changed() => if changed.is_err() { break },
                    changed = transport.changed() => if changed.is_err() { break },
                }
                let online = self.is_online();
                if online && !was_online {
                    info!("outbox: connectivity regained, draining");
                    self.drain().await;
                }
                was_online = online;
            }
        })
    }
}

fn audio_filename(client_ref: &str, mime_type: &str) -> String {
    let extension = mime_type
        .split('/')
        .nth(1)
        .and_then(|sub| sub.split(';').next())
        .filter(|sub| !sub.is_empty())
        .unwrap_or("bin");
    format!("{client_ref}.{extension}")
}

#[cfg(test)]
#[path = "tests/outbox_tests.rs"]
mod tests;
