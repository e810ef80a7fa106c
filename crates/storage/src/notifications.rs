use anyhow::Result;
use sqlx::{sqlite::SqliteRow, Row};

use shared::{domain::NotificationId, protocol::NotificationRecord};

use crate::{from_millis, to_millis, Storage, StoreChange};

impl Storage {
    /// Upserts by id. The read flag only moves from unread to read, so a
    /// stale push never undoes a local optimistic mark.
    pub async fn put_notification(&self, notification: &NotificationRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO notifications (id, title, message, kind, read, created_at_ms, link)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                message = excluded.message,
                kind = excluded.kind,
                read = MAX(notifications.read, excluded.read),
                created_at_ms = excluded.created_at_ms,
                link = COALESCE(excluded.link, notifications.link)",
        )
        .bind(notification.id.0)
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(&notification.kind)
        .bind(notification.read)
        .bind(to_millis(notification.created_at))
        .bind(notification.link.as_deref())
        .execute(&self.pool)
        .await?;
        self.publish(StoreChange::Notifications);
        Ok(())
    }

    /// Newest first.
    pub async fn list_notifications(&self) -> Result<Vec<NotificationRecord>> {
        let rows = sqlx::query(
            "SELECT id, title, message, kind, read, created_at_ms, link
             FROM notifications
             ORDER BY created_at_ms DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_notification).collect()
    }

    pub async fn mark_notification_read(&self, id: NotificationId) -> Result<bool> {
        let result = sqlx::query("UPDATE notifications SET read = 1 WHERE id = ? AND read = 0")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        let changed = result.rows_affected() > 0;
        if changed {
            self.publish(StoreChange::Notifications);
        }
        Ok(changed)
    }

    pub async fn unread_notification_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notifications WHERE read = 0")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn row_to_notification(row: &SqliteRow) -> Result<NotificationRecord> {
    Ok(NotificationRecord {
        id: NotificationId(row.try_get("id")?),
        title: row.try_get("title")?,
        message: row.try_get("message")?,
        kind: row.try_get("kind")?,
        read: row.try_get("read")?,
        created_at: from_millis(row.try_get("created_at_ms")?)?,
        link: row.try_get("link")?,
    })
}
