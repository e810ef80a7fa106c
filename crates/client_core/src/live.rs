use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use shared::{
    domain::{MessageId, RoomName, UserId},
    error::ApiError,
    protocol::{MessageRecord, NotificationRecord, ServerEvent},
};
use storage::{NewChatMessage, Storage};

use crate::{
    api::ChatApi,
    notify::{HandlerCell, Notifier},
    transport::TransportEvent,
};

const SESSION_EVENT_CAPACITY: usize = 256;
const NOTIFY_DEDUPE_WINDOW: Duration = Duration::from_secs(2);

/// Callbacks for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PresenceChanged {
        online: Vec<UserId>,
    },
    UnreadChanged {
        user_id: UserId,
        unread: bool,
    },
    UnreadCountChanged {
        count: u64,
    },
    ChatNotification {
        from_id: UserId,
        from_name: Option<String>,
        preview: Option<String>,
    },
    NotificationReceived {
        notification: NotificationRecord,
    },
    ConferenceInvite {
        from_id: UserId,
        from_name: Option<String>,
        conference_id: String,
        link: Option<String>,
    },
    Error {
        message: String,
    },
}

/// In-memory state for one realtime session: presence, unread map and the
/// set of rooms currently on screen.
pub struct SessionState {
    me: UserId,
    presence: RwLock<BTreeSet<UserId>>,
    unread: RwLock<HashMap<String, bool>>,
    open_rooms: Mutex<HashMap<RoomName, usize>>,
    last_notified: Mutex<HashMap<String, Instant>>,
    notifier: HandlerCell<dyn Notifier>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionState {
    pub fn new(me: UserId, notifier: Arc<dyn Notifier>) -> Arc<Self> {
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        Arc::new(Self {
            me,
            presence: RwLock::new(BTreeSet::new()),
            unread: RwLock::new(HashMap::new()),
            open_rooms: Mutex::new(HashMap::new()),
            last_notified: Mutex::new(HashMap::new()),
            notifier: HandlerCell::new(notifier),
            events,
        })
    }

    pub fn me(&self) -> &UserId {
        &self.me
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_notifier(&self, notifier: Arc<dyn Notifier>) {
        self.notifier.replace(notifier);
    }

    pub fn notifier(&self) -> Arc<dyn Notifier> {
        self.notifier.get()
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.presence
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn is_online(&self, user: &UserId) -> bool {
        self.presence
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|online| online.same_as(user))
    }

    fn update_presence(&self, apply: impl FnOnce(&mut BTreeSet<UserId>)) {
        let online = {
            let mut presence = self.presence.write().unwrap_or_else(PoisonError::into_inner);
            apply(&mut presence);
            presence.iter().cloned().collect()
        };
        self.emit(SessionEvent::PresenceChanged { online });
    }

    pub fn has_unread(&self, user: &UserId) -> bool {
        self.unread
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user.normalized())
            .copied()
            .unwrap_or(false)
    }

    pub fn unread_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .unread
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|(user, unread)| unread.then(|| user.clone()))
            .collect();
        users.sort();
        users
    }

    pub fn set_unread(&self, user: &UserId, unread: bool) {
        let changed = {
            let mut map = self.unread.write().unwrap_or_else(PoisonError::into_inner);
            map.insert(user.normalized(), unread) != Some(unread)
        };
        if changed {
            self.emit(SessionEvent::UnreadChanged {
                user_id: user.clone(),
                unread,
            });
        }
    }

    /// Replaces the unread map with the server's view.
    pub fn seed_unread(&self, senders: &[UserId]) {
        let previous: Vec<String> = self.unread_users();
        {
            let mut map = self.unread.write().unwrap_or_else(PoisonError::into_inner);
            map.clear();
            for sender in senders {
                map.insert(sender.normalized(), true);
            }
        }
        for stale in previous
            .iter()
            .filter(|user| !senders.iter().any(|s| &s.normalized() == *user))
        {
            self.emit(SessionEvent::UnreadChanged {
                user_id: UserId::new(stale.clone()),
                unread: false,
            });
        }
        for sender in senders
            .iter()
            .filter(|s| !previous.contains(&s.normalized()))
        {
            self.emit(SessionEvent::UnreadChanged {
                user_id: sender.clone(),
                unread: true,
            });
        }
    }

    /// Marks `room` as on screen until the returned guard is dropped.
    pub fn open_room(self: &Arc<Self>, room: RoomName) -> RoomGuard {
        *self
            .open_rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(room.clone())
            .or_insert(0) += 1;
        RoomGuard {
            state: Arc::clone(self),
            room,
        }
    }

    pub fn is_room_open(&self, room: &RoomName) -> bool {
        self.open_rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(room)
            .is_some_and(|count| *count > 0)
    }

    fn close_room(&self, room: &RoomName) {
        let mut rooms = self.open_rooms.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = rooms.get_mut(room) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                rooms.remove(room);
            }
        }
    }

    #[cfg(test)]
    fn notified_senders(&self) -> usize {
        self.last_notified
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Sound, toast and event for an inbound chat message, at most once per
    /// sender within a short window.
    fn notify_chat(&self, from: &UserId, from_name: Option<String>, preview: Option<String>) {
        let now = Instant::now();
        {
            let mut last = self
                .last_notified
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            last.retain(|_, at| now.duration_since(*at) < NOTIFY_DEDUPE_WINDOW);
            let key = from.normalized();
            if last.contains_key(&key) {
                debug!(from = %from, "realtime: duplicate chat notification suppressed");
                return;
            }
            last.insert(key, now);
        }

        let notifier = self.notifier();
        notifier.play_sound();
        let title = from_name.clone().unwrap_or_else(|| from.to_string());
        notifier.toast(&title, preview.as_deref().unwrap_or("New message"));
        self.emit(SessionEvent::ChatNotification {
            from_id: from.clone(),
            from_name,
            preview,
        });
    }
}

/// Keeps a room registered as open. Dropping it deregisters the room.
pub struct RoomGuard {
    state: Arc<SessionState>,
    room: RoomName,
}

impl RoomGuard {
    pub fn room(&self) -> &RoomName {
        &self.room
    }
}

impl Drop for RoomGuard {
    fn drop(&mut self) {
        self.state.close_room(&self.room);
    }
}

/// Applies inbound transport events to the local store and session state.
pub struct LiveEventHandler {
    storage: Storage,
    api: Arc<dyn ChatApi>,
    state: Arc<SessionState>,
}

impl LiveEventHandler {
    pub fn new(storage: Storage, api: Arc<dyn ChatApi>, state: Arc<SessionState>) -> Self {
        Self {
            storage,
            api,
            state,
        }
    }

    pub fn spawn(self: Arc<Self>, mut events: broadcast::Receiver<TransportEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => self.handle(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "realtime: live handler lagged behind transport");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("realtime: live handler stopped");
        })
    }

    /// Never fails: each event is handled and logged on its own.
    pub async fn handle(&self, event: TransportEvent) {
        let kind = event_kind(&event);
        if let Err(err) = self.apply(event).await {
            warn!(kind, error = %err, "realtime: event handler failed");
            self.state.emit(SessionEvent::Error {
                message: format!("{kind}: {err:#}"),
            });
        }
    }

    async fn apply(&self, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::Connected => self.seed_from_server().await,
            TransportEvent::Disconnected => {
                self.state.update_presence(|presence| presence.clear());
                Ok(())
            }
            TransportEvent::Server(event) => self.apply_server_event(event).await,
        }
    }

    async fn apply_server_event(&self, event: ServerEvent) -> Result<()> {
        match event {
            ServerEvent::PrivateMessage { message } => self.on_private_message(message).await,
            ServerEvent::MessageEdited {
                message_id,
                new_text,
            } => self.on_message_edited(message_id, &new_text).await,
            ServerEvent::MessageDeleted { message_id } => {
                let room = self
                    .storage
                    .delete_chat_message_by_id(message_id)
                    .await
                    .with_context(|| format!("failed to delete message {message_id}"))?;
                if room.is_none() {
                    debug!(%message_id, "realtime: delete for unknown message");
                }
                Ok(())
            }
            ServerEvent::MessagesRead { room, read_by } => {
                if read_by.same_as(self.state.me()) {
                    return Ok(());
                }
                let flipped = self
                    .storage
                    .mark_room_read_from(&room, self.state.me())
                    .await
                    .with_context(|| format!("failed to apply read receipt for {room}"))?;
                debug!(room = %room, flipped, "realtime: read receipt applied");
                Ok(())
            }
            ServerEvent::UserOnline { user_id } => {
                self.state.update_presence(|presence| {
                    presence.insert(user_id);
                });
                Ok(())
            }
            ServerEvent::UserOffline { user_id } => {
                self.state
                    .update_presence(|presence| presence.retain(|u| !u.same_as(&user_id)));
                Ok(())
            }
            ServerEvent::InitialPresenceList { user_ids } => {
                self.state.update_presence(|presence| {
                    *presence = user_ids.into_iter().collect();
                });
                Ok(())
            }
            ServerEvent::NewChatNotification {
                from_id,
                from_name,
                preview,
            } => {
                if from_id.same_as(self.state.me()) {
                    return Ok(());
                }
                let room = RoomName::between(self.state.me(), &from_id);
                if self.state.is_room_open(&room) {
                    return Ok(());
                }
                self.state.set_unread(&from_id, true);
                self.state.notify_chat(&from_id, from_name, preview);
                Ok(())
            }
            ServerEvent::NewNotification { notification } => {
                if let Err(err) = self.storage.put_notification(&notification).await {
                    warn!(id = %notification.id, error = %err, "realtime: failed to cache notification");
                }
                self.state
                    .notifier()
                    .toast(&notification.title, &notification.message);
                self.state
                    .emit(SessionEvent::NotificationReceived { notification });
                Ok(())
            }
            ServerEvent::ConferenceInvite {
                from_id,
                from_name,
                conference_id,
                link,
            } => {
                let notifier = self.state.notifier();
                notifier.play_sound();
                let title = from_name.clone().unwrap_or_else(|| from_id.to_string());
                notifier.toast(&title, "Conference invitation");
                self.state.emit(SessionEvent::ConferenceInvite {
                    from_id,
                    from_name,
                    conference_id,
                    link,
                });
                Ok(())
            }
            ServerEvent::Error(ApiError { code, message }) => {
                warn!(?code, %message, "realtime: server reported an error");
                self.state.emit(SessionEvent::Error { message });
                Ok(())
            }
        }
    }

    /// Runs on every (re)connect.
    pub async fn seed_from_server(&self) -> Result<()> {
        let senders = self.api.unread_senders().await;
        let count = self.api.unread_count().await;

        match &senders {
            Ok(senders) => self.state.seed_unread(senders),
            Err(err) => warn!(error = %err, "realtime: failed to seed unread senders"),
        }
        if let Ok(count) = &count {
            self.state
                .emit(SessionEvent::UnreadCountChanged { count: *count });
        }
        info!(
            unread_senders = senders.as_ref().map(Vec::len).unwrap_or(0),
            "realtime: session seeded"
        );
        senders?;
        count?;
        Ok(())
    }

    async fn on_private_message(&self, record: MessageRecord) -> Result<()> {
        let me = self.state.me().clone();
        let from_me = record.from_id.same_as(&me);

        let counterpart = if from_me {
            match self.echo_counterpart(&record).await? {
                Some(counterpart) => counterpart,
                None => {
                    warn!(id = %record.id, "realtime: self echo without recipient, skipped");
                    return Ok(());
                }
            }
        } else {
            record.from_id.clone()
        };

        let message = NewChatMessage::from_record(&record, &me, &counterpart);
        let room = message.room_name.clone();
        if let Err(err) = self.storage.put_chat_message(&message).await {
            warn!(room = %room, id = %record.id, error = %err, "realtime: failed to store live message");
        }

        if from_me {
            if let Some(client_ref) = &record.client_ref {
                self.storage
                    .delete_pending_message_by_client_ref(client_ref)
                    .await
                    .context("failed to dequeue echoed message")?;
            }
            return Ok(());
        }

        if self.state.is_room_open(&room) {
            self.storage
                .mark_room_read_from(&room, &record.from_id)
                .await
                .with_context(|| format!("failed to mark {room} read locally"))?;
            self.state.set_unread(&record.from_id, false);
            if let Err(err) = self.api.mark_room_read(&room).await {
                warn!(room = %room, error = %err, "realtime: immediate read failed");
            }
        } else {
            self.state.set_unread(&record.from_id, true);
            let preview = match (&record.text, &record.audio_url) {
                (Some(text), _) => Some(text.clone()),
                (None, Some(_)) => Some("Audio message".to_string()),
                (None, None) => None,
            };
            self.state.notify_chat(&record.from_id, None, preview);
        }
        Ok(())
    }

    async fn echo_counterpart(&self, record: &MessageRecord) -> Result<Option<UserId>> {
        if let Some(to_id) = &record.to_id {
            return Ok(Some(to_id.clone()));
        }
        let Some(client_ref) = &record.client_ref else {
            return Ok(None);
        };
        let local = self
            .storage
            .get_chat_message_by_client_ref(client_ref)
            .await
            .context("failed to look up echoed message")?;
        Ok(local.map(|row| row.to_id))
    }

    async fn on_message_edited(&self, id: MessageId, new_text: &str) -> Result<()> {
        let room = self
            .storage
            .update_message_text(id, new_text)
            .await
            .with_context(|| format!("failed to edit message {id}"))?;
        if room.is_none() {
            debug!(%id, "realtime: edit for unknown message");
        }
        Ok(())
    }
}

fn event_kind(event: &TransportEvent) -> &'static str {
    match event {
        TransportEvent::Connected => "connected",
        TransportEvent::Disconnected => "disconnected",
        TransportEvent::Server(event) => match event {
            ServerEvent::PrivateMessage { .. } => "private_message",
            ServerEvent::MessageEdited { .. } => "message_edited",
            ServerEvent::MessageDeleted { .. } => "message_deleted",
            ServerEvent::MessagesRead { .. } => "messages_read",
            ServerEvent::UserOnline { .. } => "user_online",
            ServerEvent::UserOffline { .. } => "user_offline",
            ServerEvent::InitialPresenceList { .. } => "initial_presence_list",
            ServerEvent::NewChatNotification { .. } => "new_chat_notification",
            ServerEvent::NewNotification { .. } => "new_notification",
            ServerEvent::ConferenceInvite { .. } => "conference_invite",
            ServerEvent::Error(_) => "error",
        },
    }
}

#[cfg(test)]
#[path = "tests/live_tests.rs"]
mod tests;
