use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

use shared::{
    domain::{MessageId, RoomName, UserId},
    protocol::MessageRecord,
};

use crate::{from_millis, to_millis, Storage, StoreChange};

/// Prefix of the placeholder audio URL carried by a local-only audio message
/// until its blob has been uploaded.
pub const LOCAL_AUDIO_SCHEME: &str = "outbox://";

const CHAT_COLUMNS: &str = "local_id, server_id, client_ref, room_name, from_id, to_id, text, \
     audio_url, created_at_ms, expires_at_ms, read";

/// A cached chat message. `id` is `None` while the message only exists locally.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub local_id: i64,
    pub id: Option<MessageId>,
    pub client_ref: Option<String>,
    pub room_name: RoomName,
    pub from_id: UserId,
    pub to_id: UserId,
    pub text: Option<String>,
    pub audio_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub read: bool,
}

impl ChatMessage {
    pub fn is_durable(&self) -> bool {
        self.id.is_some()
    }

    pub fn has_local_audio(&self) -> bool {
        self.audio_url
            .as_deref()
            .is_some_and(|url| url.starts_with(LOCAL_AUDIO_SCHEME))
    }
}

/// Upsert input. `None` fields leave the stored value untouched on merge.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChatMessage {
    pub id: Option<MessageId>,
    pub client_ref: Option<String>,
    pub room_name: RoomName,
    pub from_id: UserId,
    pub to_id: UserId,
    pub text: Option<String>,
    pub audio_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub read: Option<bool>,
}

impl NewChatMessage {
    /// Maps a server record onto the local shape. The recipient is inferred as
    /// whichever participant did not send the message.
    pub fn from_record(record: &MessageRecord, me: &UserId, counterpart: &UserId) -> Self {
        let to_id = record.to_id.clone().unwrap_or_else(|| {
            if record.from_id.same_as(me) {
                counterpart.clone()
            } else {
                me.clone()
            }
        });
        let room_name = record
            .room_name
            .clone()
            .unwrap_or_else(|| RoomName::between(&record.from_id, &to_id));
        Self {
            id: Some(record.id),
            client_ref: record.client_ref.clone(),
            room_name,
            from_id: record.from_id.clone(),
            to_id,
            text: record.text.clone(),
            audio_url: record.audio_url.clone(),
            created_at: record.created_at,
            expires_at: record.expires_at,
            read: Some(record.read),
        }
    }
}

impl Storage {
    /// Insert-or-merge keyed by server id, then by client reference. Applying
    /// the same logical message any number of times leaves one row.
    pub async fn put_chat_message(&self, message: &NewChatMessage) -> Result<i64> {
        let mut tx = self.begin_write().await?;
        let local_id = upsert_chat_message(&mut *tx, message).await?;
        tx.commit().await.context("failed to commit chat message")?;
        self.publish(StoreChange::ChatMessages {
            room: message.room_name.clone(),
        });
        Ok(local_id)
    }

    /// Upserts a batch atomically, e.g. one history page.
    pub async fn put_chat_messages(&self, messages: &[NewChatMessage]) -> Result<Vec<i64>> {
        let mut tx = self.begin_write().await?;
        let mut local_ids = Vec::with_capacity(messages.len());
        for message in messages {
            local_ids.push(upsert_chat_message(&mut *tx, message).await?);
        }
        tx.commit().await.context("failed to commit chat message batch")?;

        let mut rooms: Vec<&RoomName> = messages.iter().map(|m| &m.room_name).collect();
        rooms.sort();
        rooms.dedup();
        for room in rooms {
            self.publish(StoreChange::ChatMessages { room: room.clone() });
        }
        Ok(local_ids)
    }

    pub async fn get_chat_message(&self, local_id: i64) -> Result<Option<ChatMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {CHAT_COLUMNS} FROM chat_messages WHERE local_id = ?"
        ))
        .bind(local_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_chat_message).transpose()
    }

    pub async fn get_chat_message_by_id(&self, id: MessageId) -> Result<Option<ChatMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {CHAT_COLUMNS} FROM chat_messages WHERE server_id = ?"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_chat_message).transpose()
    }

    pub async fn get_chat_message_by_client_ref(
        &self,
        client_ref: &str,
    ) -> Result<Option<ChatMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {CHAT_COLUMNS} FROM chat_messages WHERE client_ref = ?"
        ))
        .bind(client_ref)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_chat_message).transpose()
    }

    /// Messages of one room ordered by creation time, insertion order on ties.
    pub async fn list_room_messages(&self, room: &RoomName) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHAT_COLUMNS} FROM chat_messages
             WHERE room_name = ?
             ORDER BY created_at_ms ASC, local_id ASC"
        ))
        .bind(room.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_chat_message).collect()
    }

    /// Replaces the text of a durable message. Returns the room it lives in,
    /// or `None` when the id is not held locally.
    pub async fn update_message_text(
        &self,
        id: MessageId,
        text: &str,
    ) -> Result<Option<RoomName>> {
        let row = sqlx::query(
            "UPDATE chat_messages SET text = ? WHERE server_id = ? RETURNING room_name",
        )
        .bind(text)
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        let room = row
            .map(|r| r.try_get::<String, _>(0).map(RoomName))
            .transpose()?;
        if let Some(room) = &room {
            self.publish(StoreChange::ChatMessages { room: room.clone() });
        }
        Ok(room)
    }

    pub async fn delete_chat_message_by_id(&self, id: MessageId) -> Result<Option<RoomName>> {
        let row = sqlx::query("DELETE FROM chat_messages WHERE server_id = ? RETURNING room_name")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        let room = row
            .map(|r| r.try_get::<String, _>(0).map(RoomName))
            .transpose()?;
        if let Some(room) = &room {
            self.publish(StoreChange::ChatMessages { room: room.clone() });
        }
        Ok(room)
    }

    pub async fn delete_chat_message(&self, local_id: i64) -> Result<Option<RoomName>> {
        let row = sqlx::query("DELETE FROM chat_messages WHERE local_id = ? RETURNING room_name")
            .bind(local_id)
            .fetch_optional(&self.pool)
            .await?;
        let room = row
            .map(|r| r.try_get::<String, _>(0).map(RoomName))
            .transpose()?;
        if let Some(room) = &room {
            self.publish(StoreChange::ChatMessages { room: room.clone() });
        }
        Ok(room)
    }

    /// Flags every unread message sent by `sender` in `room` as read.
    pub async fn mark_room_read_from(&self, room: &RoomName, sender: &UserId) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE chat_messages SET read = 1
             WHERE room_name = ? AND lower(trim(from_id)) = ? AND read = 0",
        )
        .bind(room.as_str())
        .bind(sender.normalized())
        .execute(&self.pool)
        .await?;
        let flipped = result.rows_affected();
        if flipped > 0 {
            self.publish(StoreChange::ChatMessages { room: room.clone() });
        }
        Ok(flipped)
    }

    /// Distinct senders with unread messages addressed to `me`.
    pub async fn unread_senders(&self, me: &UserId) -> Result<Vec<UserId>> {
        let rows = sqlx::query(
            "SELECT DISTINCT from_id FROM chat_messages
             WHERE lower(trim(to_id)) = ? AND read = 0
             ORDER BY from_id",
        )
        .bind(me.normalized())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| -> Result<UserId> { Ok(UserId(r.try_get::<String, _>(0)?)) })
            .collect()
    }
}

async fn find_by_server_id(conn: &mut SqliteConnection, id: MessageId) -> Result<Option<i64>> {
    let row = sqlx::query("SELECT local_id FROM chat_messages WHERE server_id = ?")
        .bind(id.0)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(|r| r.get::<i64, _>(0)))
}

async fn find_by_client_ref(conn: &mut SqliteConnection, client_ref: &str) -> Result<Option<i64>> {
    let row = sqlx::query("SELECT local_id FROM chat_messages WHERE client_ref = ?")
        .bind(client_ref)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(|r| r.get::<i64, _>(0)))
}

pub(crate) async fn upsert_chat_message(
    conn: &mut SqliteConnection,
    message: &NewChatMessage,
) -> Result<i64> {
    let by_server = match message.id {
        Some(id) => find_by_server_id(conn, id).await?,
        None => None,
    };
    let by_ref = match message.client_ref.as_deref() {
        Some(client_ref) => find_by_client_ref(conn, client_ref).await?,
        None => None,
    };

    let target = match (by_server, by_ref) {
        (Some(durable), Some(local)) if durable != local => {
            // The echo landed before the confirmation: fold the local-only row
            // into the durable one.
            sqlx::query("DELETE FROM chat_messages WHERE local_id = ?")
                .bind(local)
                .execute(&mut *conn)
                .await?;
            Some(durable)
        }
        (Some(durable), _) => Some(durable),
        (None, local) => local,
    };

    match target {
        Some(local_id) => {
            sqlx::query(
                "UPDATE chat_messages SET
                    server_id     = COALESCE(?, server_id),
                    client_ref    = COALESCE(?, client_ref),
                    room_name     = ?,
                    from_id       = ?,
                    to_id         = ?,
                    text          = COALESCE(?, text),
                    audio_url     = COALESCE(?, audio_url),
                    created_at_ms = ?,
                    expires_at_ms = COALESCE(?, expires_at_ms),
                    read          = COALESCE(?, read)
                 WHERE local_id = ?",
            )
            .bind(message.id.map(|id| id.0))
            .bind(message.client_ref.as_deref())
            .bind(message.room_name.as_str())
            .bind(message.from_id.as_str())
            .bind(message.to_id.as_str())
            .bind(message.text.as_deref())
            .bind(message.audio_url.as_deref())
            .bind(to_millis(message.created_at))
            .bind(message.expires_at.map(to_millis))
            .bind(message.read)
            .bind(local_id)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("failed to merge chat message {local_id}"))?;
            Ok(local_id)
        }
        None => {
            let row = sqlx::query(
                "INSERT INTO chat_messages
                    (server_id, client_ref, room_name, from_id, to_id, text, audio_url,
                     created_at_ms, expires_at_ms, read)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 RETURNING local_id",
            )
            .bind(message.id.map(|id| id.0))
            .bind(message.client_ref.as_deref())
            .bind(message.room_name.as_str())
            .bind(message.from_id.as_str())
            .bind(message.to_id.as_str())
            .bind(message.text.as_deref())
            .bind(message.audio_url.as_deref())
            .bind(to_millis(message.created_at))
            .bind(message.expires_at.map(to_millis))
            .bind(message.read.unwrap_or(false))
            .fetch_one(&mut *conn)
            .await
            .context("failed to insert chat message")?;
            Ok(row.get::<i64, _>(0))
        }
    }
}

fn row_to_chat_message(row: &SqliteRow) -> Result<ChatMessage> {
    Ok(ChatMessage {
        local_id: row.try_get("local_id")?,
        id: row.try_get::<Option<i64>, _>("server_id")?.map(MessageId),
        client_ref: row.try_get("client_ref")?,
        room_name: RoomName(row.try_get("room_name")?),
        from_id: UserId(row.try_get("from_id")?),
        to_id: UserId(row.try_get("to_id")?),
        text: row.try_get("text")?,
        audio_url: row.try_get("audio_url")?,
        created_at: from_millis(row.try_get("created_at_ms")?)?,
        expires_at: row
            .try_get::<Option<i64>, _>("expires_at_ms")?
            .map(from_millis)
            .transpose()?,
        read: row.try_get("read")?,
    })
}
