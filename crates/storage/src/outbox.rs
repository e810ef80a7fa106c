use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use shared::domain::UserId;

use crate::{
    chat::upsert_chat_message, from_millis, to_millis, NewChatMessage, Storage, StoreChange,
};

/// Outbox entry for a chat message composed while offline.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub id: i64,
    pub to_id: UserId,
    pub text: Option<String>,
    pub audio_blob: Option<Vec<u8>>,
    pub audio_mime: Option<String>,
    pub audio_url: Option<String>,
    pub client_ref: String,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl PendingMessage {
    /// The composed message without outbox bookkeeping.
    pub fn to_draft(&self) -> NewPendingMessage {
        NewPendingMessage {
            to_id: self.to_id.clone(),
            text: self.text.clone(),
            audio_blob: self.audio_blob.clone(),
            audio_mime: self.audio_mime.clone(),
            audio_url: self.audio_url.clone(),
            client_ref: self.client_ref.clone(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPendingMessage {
    pub to_id: UserId,
    pub text: Option<String>,
    pub audio_blob: Option<Vec<u8>>,
    pub audio_mime: Option<String>,
    /// Set when the clip was uploaded before queueing; `audio_blob` is then empty.
    pub audio_url: Option<String>,
    pub client_ref: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportImage {
    pub filename: String,
    pub mime_type: Option<String>,
    pub data: Vec<u8>,
}

/// Outbox entry for a report. The payload is opaque to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingReport {
    pub id: i64,
    pub payload: String,
    pub images: Vec<ReportImage>,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPendingReport {
    pub payload: String,
    pub images: Vec<ReportImage>,
    pub created_at: DateTime<Utc>,
}

impl Storage {
    /// Writes the local-only chat row and its outbox entry in one transaction.
    /// Returns `(chat local_id, pending id)`.
    pub async fn enqueue_pending_message(
        &self,
        chat: &NewChatMessage,
        pending: &NewPendingMessage,
    ) -> Result<(i64, i64)> {
        let mut tx = self.begin_write().await?;
        let local_id = upsert_chat_message(&mut *tx, chat).await?;
        let row = sqlx::query(
            "INSERT INTO pending_messages (to_id, text, audio_blob, audio_mime, audio_url, client_ref, created_at_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(pending.to_id.as_str())
        .bind(pending.text.as_deref())
        .bind(pending.audio_blob.as_deref())
        .bind(pending.audio_mime.as_deref())
        .bind(pending.audio_url.as_deref())
        .bind(&pending.client_ref)
        .bind(to_millis(pending.created_at))
        .fetch_one(&mut *tx)
        .await
        .context("failed to insert pending message")?;
        let pending_id = row.get::<i64, _>(0);
        tx.commit().await.context("failed to commit outbox entry")?;

        self.publish(StoreChange::ChatMessages {
            room: chat.room_name.clone(),
        });
        self.publish(StoreChange::PendingMessages);
        Ok((local_id, pending_id))
    }

    /// Outbox entries in FIFO order.
    pub async fn list_pending_messages(&self) -> Result<Vec<PendingMessage>> {
        let rows = sqlx::query(
            "SELECT id, to_id, text, audio_blob, audio_mime, audio_url, client_ref, created_at_ms, attempts, last_error
             FROM pending_messages
             ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_pending_message).collect()
    }

    pub async fn pending_message_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn delete_pending_message(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM pending_messages WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        let deleted = result.rows_affected() > 0;
        if deleted {
            self.publish(StoreChange::PendingMessages);
        }
        Ok(deleted)
    }

    /// Drops the outbox entry once the server has acknowledged the message it
    /// carries.
    pub async fn delete_pending_message_by_client_ref(&self, client_ref: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM pending_messages WHERE client_ref = ?")
            .bind(client_ref)
            .execute(&self.pool)
            .await?;
        let deleted = result.rows_affected() > 0;
        if deleted {
            self.publish(StoreChange::PendingMessages);
        }
        Ok(deleted)
    }

    pub async fn record_pending_message_failure(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE pending_messages SET attempts = attempts + 1, last_error = ? WHERE id = ?",
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn enqueue_pending_report(&self, report: &NewPendingReport) -> Result<i64> {
        let mut tx = self.begin_write().await?;
        let row = sqlx::query(
            "INSERT INTO pending_reports (payload, created_at_ms) VALUES (?, ?) RETURNING id",
        )
        .bind(&report.payload)
        .bind(to_millis(report.created_at))
        .fetch_one(&mut *tx)
        .await
        .context("failed to insert pending report")?;
        let report_id = row.get::<i64, _>(0);

        for (position, image) in report.images.iter().enumerate() {
            sqlx::query(
                "INSERT INTO pending_report_images (report_id, position, filename, mime_type, data)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(report_id)
            .bind(position as i64)
            .bind(&image.filename)
            .bind(image.mime_type.as_deref())
            .bind(image.data.as_slice())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to store image {position} of report {report_id}"))?;
        }
        tx.commit().await.context("failed to commit pending report")?;

        self.publish(StoreChange::PendingReports);
        Ok(report_id)
    }

    pub async fn list_pending_reports(&self) -> Result<Vec<PendingReport>> {
        let rows = sqlx::query(
            "SELECT id, payload, created_at_ms, attempts, last_error
             FROM pending_reports
             ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut reports = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let images = sqlx::query(
                "SELECT filename, mime_type, data FROM pending_report_images
                 WHERE report_id = ?
                 ORDER BY position ASC",
            )
            .bind(id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|r| -> Result<ReportImage> {
                Ok(ReportImage {
                    filename: r.try_get("filename")?,
                    mime_type: r.try_get("mime_type")?,
                    data: r.try_get("data")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

            reports.push(PendingReport {
                id,
                payload: row.try_get("payload")?,
                images,
                created_at: from_millis(row.try_get("created_at_ms")?)?,
                attempts: row.try_get::<i64, _>("attempts")?.try_into().unwrap_or(u32::MAX),
                last_error: row.try_get("last_error")?,
            });
        }
        Ok(reports)
    }

    pub async fn pending_report_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_reports")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn delete_pending_report(&self, id: i64) -> Result<bool> {
        let mut tx = self.begin_write().await?;
        sqlx::query("DELETE FROM pending_report_images WHERE report_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM pending_reports WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let deleted = result.rows_affected() > 0;
        if deleted {
            self.publish(StoreChange::PendingReports);
        }
        Ok(deleted)
    }

    pub async fn record_pending_report_failure(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE pending_reports SET attempts = attempts + 1, last_error = ? WHERE id = ?",
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_pending_message(row: &SqliteRow) -> Result<PendingMessage> {
    Ok(PendingMessage {
        id: row.try_get("id")?,
        to_id: UserId(row.try_get("to_id")?),
        text: row.try_get("text")?,
        audio_blob: row.try_get("audio_blob")?,
        audio_mime: row.try_get("audio_mime")?,
        audio_url: row.try_get("audio_url")?,
        client_ref: row.try_get("client_ref")?,
        created_at: from_millis(row.try_get("created_at_ms")?)?,
        attempts: row.try_get::<i64, _>("attempts")?.try_into().unwrap_or(u32::MAX),
        last_error: row.try_get("last_error")?,
    })
}
