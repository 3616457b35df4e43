use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use shared::{
    domain::{
        direct_local_key, ConversationId, ConversationKind, MessageId, MessageKind, ReadReceipt,
        UserId,
    },
    protocol::AppendOutcome,
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, QueryBuilder, Row, Sqlite,
};
use tracing::debug;

const PREVIEW_CHARS: usize = 120;

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredParticipant {
    pub user_id: UserId,
    pub username: String,
}

#[derive(Debug, Clone)]
pub struct StoredConversation {
    pub conversation_id: ConversationId,
    pub local_key: String,
    pub kind: ConversationKind,
    pub name: Option<String>,
    pub participants: Vec<StoredParticipant>,
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub content: String,
    pub kind: MessageKind,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub sent_at: DateTime<Utc>,
}

/// A read that was accepted for a message visible to the reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedRead {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub conversation_id: ConversationId,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, username: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username) VALUES (?)
             ON CONFLICT(username) DO UPDATE SET username=excluded.username
             RETURNING id",
        )
        .bind(username)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn username_for_user(&self, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT username FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    /// Returns the direct conversation between two users, creating it on
    /// first use. The local key is the same one clients derive themselves.
    pub async fn get_or_create_direct_conversation(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<StoredConversation> {
        if a == b {
            return Err(anyhow!("cannot open a direct conversation with yourself"));
        }
        let local_key = direct_local_key(a, b);
        let conversation_id = self
            .insert_conversation(&local_key, ConversationKind::Direct, None, a)
            .await?;
        self.add_participant(conversation_id, a).await?;
        self.add_participant(conversation_id, b).await?;
        self.conversation(conversation_id)
            .await?
            .ok_or_else(|| anyhow!("conversation {conversation_id} vanished after insert"))
    }

    pub async fn create_group_conversation(
        &self,
        local_key: &str,
        name: &str,
        creator: UserId,
        members: &[UserId],
    ) -> Result<StoredConversation> {
        if local_key.starts_with("direct-") {
            return Err(anyhow!("group local key '{local_key}' uses the direct prefix"));
        }
        let conversation_id = self
            .insert_conversation(local_key, ConversationKind::Group, Some(name), creator)
            .await?;
        self.add_participant(conversation_id, creator).await?;
        for member in members {
            self.add_participant(conversation_id, *member).await?;
        }
        self.conversation(conversation_id)
            .await?
            .ok_or_else(|| anyhow!("conversation {conversation_id} vanished after insert"))
    }

    async fn insert_conversation(
        &self,
        local_key: &str,
        kind: ConversationKind,
        name: Option<&str>,
        created_by: UserId,
    ) -> Result<ConversationId> {
        sqlx::query(
            "INSERT INTO conversations (local_key, kind, name, created_by, created_at_ms)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(local_key) DO NOTHING",
        )
        .bind(local_key)
        .bind(kind.as_str())
        .bind(name)
        .bind(created_by.0)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT id, kind FROM conversations WHERE local_key = ?")
            .bind(local_key)
            .fetch_one(&self.pool)
            .await?;
        let existing_kind: String = row.get(1);
        if existing_kind != kind.as_str() {
            return Err(anyhow!(
                "local key '{local_key}' already belongs to a {existing_kind} conversation"
            ));
        }
        Ok(ConversationId(row.get::<i64, _>(0)))
    }

    pub async fn add_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO conversation_participants (conversation_id, user_id) VALUES (?, ?)
             ON CONFLICT(conversation_id, user_id) DO NOTHING",
        )
        .bind(conversation_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to add user {user_id} to conversation {conversation_id}"))?;
        Ok(())
    }

    pub async fn conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<StoredConversation>> {
        let row = sqlx::query(
            "SELECT id, local_key, kind, name, last_message_at_ms FROM conversations WHERE id = ?",
        )
        .bind(conversation_id.0)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut conversation = conversation_from_row(&row)?;
        conversation.participants = self.participants(conversation_id).await?;
        Ok(Some(conversation))
    }

    pub async fn list_conversations_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<StoredConversation>> {
        let rows = sqlx::query(
            "SELECT c.id, c.local_key, c.kind, c.name, c.last_message_at_ms
             FROM conversations c
             INNER JOIN conversation_participants p ON p.conversation_id = c.id
             WHERE p.user_id = ?
             ORDER BY COALESCE(c.last_message_at_ms, c.created_at_ms) DESC, c.id DESC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut conversations = Vec::with_capacity(rows.len());
        for row in rows {
            let mut conversation = conversation_from_row(&row)?;
            conversation.participants = self.participants(conversation.conversation_id).await?;
            conversations.push(conversation);
        }
        Ok(conversations)
    }

    pub async fn participants(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<StoredParticipant>> {
        let rows = sqlx::query(
            "SELECT u.id, u.username
             FROM conversation_participants p
             INNER JOIN users u ON u.id = p.user_id
             WHERE p.conversation_id = ?
             ORDER BY u.id",
        )
        .bind(conversation_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredParticipant {
                user_id: UserId(r.get::<i64, _>(0)),
                username: r.get::<String, _>(1),
            })
            .collect())
    }

    pub async fn is_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM conversation_participants WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(conversation_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Stores a message once. A second append with the same id is reported
    /// as `AlreadyExists` and leaves the stored row untouched.
    pub async fn append_message(&self, message: &NewMessage) -> Result<AppendOutcome> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO messages (id, conversation_id, sender_user_id, content, kind, sent_at_ms)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(message.id.as_str())
        .bind(message.conversation_id.0)
        .bind(message.sender_id.0)
        .bind(&message.content)
        .bind(message.kind.as_str())
        .bind(message.sent_at.timestamp_millis())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            debug!(message_id = %message.id, "append ignored duplicate message id");
            return Ok(AppendOutcome::AlreadyExists);
        }

        let preview: String = message.content.chars().take(PREVIEW_CHARS).collect();
        sqlx::query(
            "UPDATE conversations SET last_message_preview = ?, last_message_at_ms = ? WHERE id = ?",
        )
        .bind(preview)
        .bind(message.sent_at.timestamp_millis())
        .bind(message.conversation_id.0)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(AppendOutcome::Inserted)
    }

    pub async fn message(&self, message_id: &MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(
            "SELECT m.id, m.conversation_id, m.sender_user_id, u.username, m.content, m.kind, m.sent_at_ms
             FROM messages m
             INNER JOIN users u ON u.id = m.sender_user_id
             WHERE m.id = ? AND m.deleted_at_ms IS NULL",
        )
        .bind(message_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    /// Newest `limit` messages strictly older than `before`, returned oldest
    /// first. Soft-deleted messages are skipped.
    pub async fn list_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredMessage>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT m.id, m.conversation_id, m.sender_user_id, u.username, m.content, m.kind, m.sent_at_ms
             FROM messages m
             INNER JOIN users u ON u.id = m.sender_user_id
             WHERE m.deleted_at_ms IS NULL AND m.conversation_id = ",
        );
        qb.push_bind(conversation_id.0);
        if let Some(before) = before {
            qb.push(" AND m.sent_at_ms < ");
            qb.push_bind(before.timestamp_millis());
        }
        qb.push(" ORDER BY m.sent_at_ms DESC, m.id DESC LIMIT ");
        qb.push_bind(i64::from(limit));

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// Marks a message deleted. Only the sender's own, not yet deleted
    /// message is affected; returns whether a row changed.
    pub async fn soft_delete_message(&self, message_id: &MessageId, sender: UserId) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE messages SET deleted_at_ms = ?
             WHERE id = ? AND sender_user_id = ? AND deleted_at_ms IS NULL",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(message_id.as_str())
        .bind(sender.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    /// Records that `reader` has read the given messages.
    ///
    /// Ids the reader cannot see, the reader's own messages, and deleted
    /// messages are ignored. Repeated reads are accepted again but never
    /// create a second receipt.
    pub async fn record_reads(
        &self,
        message_ids: &[MessageId],
        reader: UserId,
        conversation_id: Option<ConversationId>,
    ) -> Result<Vec<AcceptedRead>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT m.id, m.sender_user_id, m.conversation_id
             FROM messages m
             INNER JOIN conversation_participants p ON p.conversation_id = m.conversation_id
             WHERE m.deleted_at_ms IS NULL AND p.user_id = ",
        );
        qb.push_bind(reader.0);
        qb.push(" AND m.sender_user_id != ");
        qb.push_bind(reader.0);
        if let Some(conversation_id) = conversation_id {
            qb.push(" AND m.conversation_id = ");
            qb.push_bind(conversation_id.0);
        }
        qb.push(" AND m.id IN (");
        let mut ids = qb.separated(", ");
        for id in message_ids {
            ids.push_bind(id.as_str().to_string());
        }
        ids.push_unseparated(")");

        let rows = qb.build().fetch_all(&self.pool).await?;
        let accepted: Vec<AcceptedRead> = rows
            .into_iter()
            .map(|r| AcceptedRead {
                message_id: MessageId(r.get::<String, _>(0)),
                sender_id: UserId(r.get::<i64, _>(1)),
                conversation_id: ConversationId(r.get::<i64, _>(2)),
            })
            .collect();

        let read_at = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        for read in &accepted {
            sqlx::query(
                "INSERT INTO read_receipts (message_id, user_id, read_at_ms) VALUES (?, ?, ?)
                 ON CONFLICT(message_id, user_id) DO NOTHING",
            )
            .bind(read.message_id.as_str())
            .bind(reader.0)
            .bind(read_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(accepted)
    }

    /// Receipts for the listed messages, limited to the ones `author` sent.
    pub async fn receipts_for(
        &self,
        message_ids: &[MessageId],
        author: UserId,
    ) -> Result<HashMap<MessageId, Vec<ReadReceipt>>> {
        let mut receipts: HashMap<MessageId, Vec<ReadReceipt>> = HashMap::new();
        if message_ids.is_empty() {
            return Ok(receipts);
        }

        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT r.message_id, r.user_id, u.username, r.read_at_ms
             FROM read_receipts r
             INNER JOIN messages m ON m.id = r.message_id
             INNER JOIN users u ON u.id = r.user_id
             WHERE m.sender_user_id = ",
        );
        qb.push_bind(author.0);
        qb.push(" AND r.message_id IN (");
        let mut ids = qb.separated(", ");
        for id in message_ids {
            ids.push_bind(id.as_str().to_string());
        }
        ids.push_unseparated(")");
        qb.push(" ORDER BY r.read_at_ms, r.user_id");

        for row in qb.build().fetch_all(&self.pool).await? {
            let message_id = MessageId(row.get::<String, _>(0));
            receipts
                .entry(message_id.clone())
                .or_default()
                .push(ReadReceipt {
                    message_id,
                    reader_id: UserId(row.get::<i64, _>(1)),
                    reader_name: row.get::<String, _>(2),
                    read_at: millis_to_datetime(row.get::<i64, _>(3)),
                });
        }
        Ok(receipts)
    }
}

fn conversation_from_row(row: &SqliteRow) -> Result<StoredConversation> {
    let kind: String = row.get(2);
    Ok(StoredConversation {
        conversation_id: ConversationId(row.get::<i64, _>(0)),
        local_key: row.get::<String, _>(1),
        kind: kind.parse().map_err(|e: String| anyhow!(e))?,
        name: row.get::<Option<String>, _>(3),
        participants: Vec::new(),
        last_message_at: row.get::<Option<i64>, _>(4).map(millis_to_datetime),
    })
}

fn message_from_row(row: &SqliteRow) -> Result<StoredMessage> {
    let kind: String = row.get(5);
    Ok(StoredMessage {
        id: MessageId(row.get::<String, _>(0)),
        conversation_id: ConversationId(row.get::<i64, _>(1)),
        sender_id: UserId(row.get::<i64, _>(2)),
        sender_name: row.get::<String, _>(3),
        content: row.get::<String, _>(4),
        kind: kind.parse().map_err(|e: String| anyhow!(e))?,
        sent_at: millis_to_datetime(row.get::<i64, _>(6)),
    })
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
