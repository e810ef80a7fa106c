use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use shared::{
    domain::{RoomName, UserId},
    protocol::HistoryQuery,
};
use storage::{NewChatMessage, Storage};

use crate::api::ChatApi;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileReport {
    pub pages: u32,
    pub messages: usize,
    pub marked_read: u64,
}

/// Merges the server's paginated history for a room into the local store.
#[derive(Clone)]
pub struct HistoryReconciler {
    storage: Storage,
    api: Arc<dyn ChatApi>,
    page_size: u32,
    max_pages: u32,
}

impl HistoryReconciler {
    pub fn new(storage: Storage, api: Arc<dyn ChatApi>, page_size: u32, max_pages: u32) -> Self {
        Self {
            storage,
            api,
            page_size: page_size.max(1),
            max_pages: max_pages.max(1),
        }
    }

    /// Safe to repeat: every row is an idempotent upsert. A fetch failure
    /// leaves the store at its last known state.
    pub async fn reconcile(&self, me: &UserId, counterpart: &UserId) -> Result<ReconcileReport> {
        let room = RoomName::between(me, counterpart);
        let mut report = ReconcileReport::default();

        for page in 1..=self.max_pages {
            let fetched = self
                .api
                .fetch_history(
                    &room,
                    HistoryQuery {
                        page,
                        limit: self.page_size,
                    },
                )
                .await
                .with_context(|| format!("history page {page} for {room}"))?;

            let rows: Vec<NewChatMessage> = fetched
                .messages
                .iter()
                .map(|record| NewChatMessage::from_record(record, me, counterpart))
                .collect();
            self.storage
                .put_chat_messages(&rows)
                .await
                .with_context(|| format!("failed to store history page {page} for {room}"))?;

            report.pages = page;
            report.messages += rows.len();
            debug!(room = %room, page, count = rows.len(), "history: page merged");

            if !fetched.has_more || fetched.messages.is_empty() {
                break;
            }
        }

        report.marked_read = self
            .storage
            .mark_room_read_from(&room, counterpart)
            .await
            .context("failed to mark reconciled room read locally")?;
        if let Err(err) = self.api.mark_room_read(&room).await {
            warn!(room = %room, error = %err, "history: mark read failed");
        }

        info!(
            room = %room,
            pages = report.pages,
            messages = report.messages,
            "history: room reconciled"
        );
        Ok(report)
    }

    /// Fire-and-forget reconcile. The task is not cancelled when the view
    /// that started it goes away.
    pub fn spawn_reconcile(&self, me: UserId, counterpart: UserId) -> JoinHandle<()> {
        let reconciler = self.clone();
        tokio::spawn(async move {
            if let Err(err) = reconciler.reconcile(&me, &counterpart).await {
                warn!(counterpart = %counterpart, error = %err, "history: reconcile failed");
            }
        })
    }
}

#[cfg(test)]
#[path = "tests/history_tests.rs"]
mod tests;
