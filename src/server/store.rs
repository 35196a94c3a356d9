use std::sync::Arc;

use sqlx::Row;

use crate::common::protocol::ChatMessage;
use crate::server::database::Database;

/// Which status flag a bulk acknowledgement targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusField {
    Delivered,
    Read,
}

impl StatusField {
    fn column(self) -> &'static str {
        match self {
            StatusField::Delivered => "delivered",
            StatusField::Read => "read",
        }
    }
}

/// Fields of a message about to be persisted; id and created_at are assigned
/// by the store.
#[derive(Debug, Clone)]
pub struct NewChatMessage {
    pub ticket_id: String,
    pub sender_id: String,
    pub receiver_id: Option<String>,
    pub content: Option<String>,
    pub image_url: Option<String>,
    pub image_public_id: Option<String>,
}

const SELECT_MESSAGE: &str = r#"
    SELECT m.id, m.ticket_id, m.sender_id, m.receiver_id, m.content,
           m.image_url, m.image_public_id, m.delivered, m.read, m.created_at,
           su.username AS sender_name, ru.username AS receiver_name
    FROM messages m
    LEFT JOIN users su ON su.id = m.sender_id
    LEFT JOIN users ru ON ru.id = m.receiver_id
"#;

#[derive(Debug, Clone)]
pub struct MessageStore {
    db: Arc<Database>,
}

impl MessageStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Full ordered history for one conversation, oldest first. The id
    /// tiebreak keeps messages created within the same second stable.
    pub async fn history(&self, ticket_id: &str) -> anyhow::Result<Vec<ChatMessage>> {
        let sql = format!("{} WHERE m.ticket_id = ? ORDER BY m.created_at ASC, m.id ASC", SELECT_MESSAGE);
        let rows = sqlx::query(&sql)
            .bind(ticket_id)
            .fetch_all(&self.db.pool)
            .await?;
        Ok(rows.iter().map(row_to_message).collect())
    }

    /// Persist a new message and return the created row with display fields
    /// resolved.
    pub async fn create(&self, new: NewChatMessage) -> anyhow::Result<ChatMessage> {
        let created_at = chrono::Utc::now().timestamp();
        let res = sqlx::query(
            "INSERT INTO messages (ticket_id, sender_id, receiver_id, content, image_url, image_public_id, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&new.ticket_id)
        .bind(&new.sender_id)
        .bind(&new.receiver_id)
        .bind(&new.content)
        .bind(&new.image_url)
        .bind(&new.image_public_id)
        .bind(created_at)
        .execute(&self.db.pool)
        .await?;

        let id = res.last_insert_rowid();
        let sql = format!("{} WHERE m.id = ?", SELECT_MESSAGE);
        let row = sqlx::query(&sql).bind(id).fetch_one(&self.db.pool).await?;
        Ok(row_to_message(&row))
    }

    /// Flip one status flag for the given ids, restricted to rows where the
    /// flag is still unset, and return the ids actually changed. Flags only
    /// ever move false -> true.
    pub async fn mark_status(&self, ids: &[i64], field: StatusField) -> anyhow::Result<Vec<i64>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let col = field.column();

        let sql = format!("SELECT id FROM messages WHERE {} = 0 AND id IN ({})", col, placeholders);
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(*id);
        }
        let pending: Vec<i64> = query
            .fetch_all(&self.db.pool)
            .await?
            .iter()
            .map(|r| r.get::<i64, _>("id"))
            .collect();

        if pending.is_empty() {
            return Ok(pending);
        }

        let placeholders = vec!["?"; pending.len()].join(", ");
        let sql = format!("UPDATE messages SET {} = 1 WHERE id IN ({})", col, placeholders);
        let mut query = sqlx::query(&sql);
        for id in &pending {
            query = query.bind(*id);
        }
        query.execute(&self.db.pool).await?;
        Ok(pending)
    }

    pub async fn message_count(&self) -> anyhow::Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.db.pool)
            .await?;
        Ok(count)
    }

    /// Upsert a display-name row. The account system owns users; this exists
    /// for the probe binary and tests to seed resolvable ids.
    pub async fn ensure_user(&self, id: &str, username: &str, is_support: bool) -> anyhow::Result<()> {
        sqlx::query("INSERT OR REPLACE INTO users (id, username, is_support) VALUES (?, ?, ?)")
            .bind(id)
            .bind(username)
            .bind(is_support as i64)
            .execute(&self.db.pool)
            .await?;
        Ok(())
    }
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> ChatMessage {
    ChatMessage {
        id: row.get::<i64, _>("id"),
        ticket_id: row.get::<String, _>("ticket_id"),
        sender_id: row.get::<String, _>("sender_id"),
        receiver_id: row.get::<Option<String>, _>("receiver_id"),
        content: row.get::<Option<String>, _>("content"),
        image_url: row.get::<Option<String>, _>("image_url"),
        image_public_id: row.get::<Option<String>, _>("image_public_id"),
        delivered: row.get::<i64, _>("delivered") != 0,
        read: row.get::<i64, _>("read") != 0,
        created_at: row.get::<i64, _>("created_at"),
        sender_name: row.get::<Option<String>, _>("sender_name"),
        receiver_name: row.get::<Option<String>, _>("receiver_name"),
    }
}
