use std::{collections::HashSet, sync::Arc, time::Duration};

use anyhow::Result;
use futures::{stream::BoxStream, StreamExt};
use tokio::{
    sync::broadcast::error::{RecvError, TryRecvError},
    task::JoinHandle,
};
use tracing::{debug, warn};

use shared::{
    domain::{DeleteScope, MessageId, RoomName, UserId},
    protocol::ClientRequest,
};
use storage::{ChatMessage, Storage, StoreChange};

use crate::{
    api::ChatApi,
    error::ChatError,
    history::HistoryReconciler,
    live::{RoomGuard, SessionState},
    outbox::{OutboxManager, OutgoingPayload, SendOutcome},
    transport::RealtimeTransport,
};

/// Everything a conversation view needs from its session.
#[derive(Clone)]
pub struct ConversationContext {
    pub storage: Storage,
    pub api: Arc<dyn ChatApi>,
    pub transport: Arc<dyn RealtimeTransport>,
    pub outbox: Arc<OutboxManager>,
    pub history: HistoryReconciler,
    pub state: Arc<SessionState>,
    pub watch_min_interval: Duration,
}

/// Read path and commands for one two-party room. Reads come only from the
/// local store.
pub struct ConversationViewModel {
    counterpart: UserId,
    room: RoomName,
    ctx: ConversationContext,
    reconcile: Option<JoinHandle<()>>,
    guard: Option<RoomGuard>,
}

impl ConversationViewModel {
    /// Joins the room and starts a history reconcile in the background.
    pub async fn open(ctx: ConversationContext, counterpart: UserId) -> Self {
        let me = ctx.state.me().clone();
        let room = RoomName::between(&me, &counterpart);
        let guard = ctx.state.open_room(room.clone());

        if let Err(err) = ctx.transport.join_room(&counterpart).await {
            warn!(room = %room, error = %err, "realtime: join_room failed");
        }
        let reconcile = ctx.history.spawn_reconcile(me, counterpart.clone());
        ctx.state.set_unread(&counterpart, false);

        Self {
            counterpart,
            room,
            ctx,
            reconcile: Some(reconcile),
            guard: Some(guard),
        }
    }

    pub fn room(&self) -> &RoomName {
        &self.room
    }

    pub fn counterpart(&self) -> &UserId {
        &self.counterpart
    }

    pub fn is_counterpart_online(&self) -> bool {
        self.ctx.state.is_online(&self.counterpart)
    }

    /// Waits for the reconcile started by [`ConversationViewModel::open`].
    pub async fn reconciled(&mut self) {
        if let Some(handle) = self.reconcile.take() {
            let _ = handle.await;
        }
    }

    pub async fn messages(&self) -> Result<Vec<ChatMessage>> {
        load_room(&self.ctx.storage, &self.room).await
    }

    /// Current messages, then a fresh list after every store change to the
    /// room. Bursts of changes within the minimum interval yield one list.
    pub fn watch(&self) -> BoxStream<'static, Vec<ChatMessage>> {
        let changes = self.ctx.storage.subscribe();
        let storage = self.ctx.storage.clone();
        let room = self.room.clone();
        let min_interval = self.ctx.watch_min_interval;

        futures::stream::unfold((changes, true), move |(mut changes, mut first)| {
            let storage = storage.clone();
            let room = room.clone();
            async move {
                loop {
                    if !first {
                        loop {
                            match changes.recv().await {
                                Ok(StoreChange::ChatMessages { room: changed }) if changed == room => {
                                    break
                                }
                                Ok(_) => {}
                                Err(RecvError::Lagged(_)) => break,
                                Err(RecvError::Closed) => return None,
                            }
                        }
                        if !min_interval.is_zero() {
                            tokio::time::sleep(min_interval).await;
                        }
                        loop {
                            match changes.try_recv() {
                                Ok(_) | Err(TryRecvError::Lagged(_)) => {}
                                Err(_) => break,
                            }
                        }
                    }
                    first = false;

                    match load_room(&storage, &room).await {
                        Ok(messages) => return Some((messages, (changes, false))),
                        Err(err) => warn!(room = %room, error = %err, "store: room query failed"),
                    }
                }
            }
        })
        .boxed()
    }

    pub async fn send(&self, payload: OutgoingPayload) -> Result<SendOutcome, ChatError> {
        self.ctx.outbox.send(&self.counterpart, payload).await
    }

    /// Local update first; server and broadcast failures keep the local state.
    pub async fn edit(&self, id: MessageId, new_text: &str) -> Result<(), ChatError> {
        if new_text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let updated = self
            .ctx
            .storage
            .update_message_text(id, new_text)
            .await
            .map_err(ChatError::Storage)?;
        if updated.is_none() {
            debug!(%id, "store: edited message not cached locally");
        }

        if let Err(err) = self.ctx.api.edit_message(id, new_text).await {
            warn!(%id, error = %err, "chat: edit not confirmed by server");
        }
        if let Err(err) = self
            .ctx
            .transport
            .send(ClientRequest::MessageEdited {
                message_id: id,
                new_text: new_text.to_string(),
            })
            .await
        {
            warn!(%id, error = %err, "realtime: edit broadcast failed");
        }
        Ok(())
    }

    /// Both scopes remove the local row and tell the server, so a later
    /// history fetch does not bring the message back. Only `Everyone` is
    /// broadcast to the counterpart.
    pub async fn delete(&self, id: MessageId, scope: DeleteScope) -> Result<(), ChatError> {
        self.ctx
            .storage
            .delete_chat_message_by_id(id)
            .await
            .map_err(ChatError::Storage)?;

        if let Err(err) = self.ctx.api.delete_message(id, scope).await {
            warn!(%id, scope = scope.as_str(), error = %err, "chat: delete not confirmed by server");
        }
        if scope == DeleteScope::Everyone {
            if let Err(err) = self
                .ctx
                .transport
                .send(ClientRequest::MessageDeleted { message_id: id })
                .await
            {
                warn!(%id, error = %err, "realtime: delete broadcast failed");
            }
        }
        Ok(())
    }

    /// Marks the counterpart's messages read. Returns how many flipped locally.
    pub async fn mark_read(&self) -> Result<u64, ChatError> {
        let flipped = self
            .ctx
            .storage
            .mark_room_read_from(&self.room, &self.counterpart)
            .await
            .map_err(ChatError::Storage)?;
        self.ctx.state.set_unread(&self.counterpart, false);
        if let Err(err) = self.ctx.api.mark_room_read(&self.room).await {
            warn!(room = %self.room, error = %err, "chat: mark read not confirmed by server");
        }
        Ok(flipped)
    }
}

impl Drop for ConversationViewModel {
    /// The transport stops re-joining the room once its last view is gone.
    fn drop(&mut self) {
        drop(self.guard.take());
        if !self.ctx.state.is_room_open(&self.room) {
            self.ctx.transport.leave_room(&self.counterpart);
        }
    }
}

/// Room rows in display order with duplicate identities collapsed.
async fn load_room(storage: &Storage, room: &RoomName) -> Result<Vec<ChatMessage>> {
    let mut rows = storage.list_room_messages(room).await?;
    rows.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then(a.local_id.cmp(&b.local_id))
    });

    let mut seen_ids = HashSet::new();
    let mut seen_refs = HashSet::new();
    rows.retain(|row| {
        let fresh_id = row.id.map_or(true, |id| seen_ids.insert(id));
        let fresh_ref = row
            .client_ref
            .as_ref()
            .map_or(true, |client_ref| seen_refs.insert(client_ref.clone()));
        fresh_id && fresh_ref
    });
    Ok(rows)
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
