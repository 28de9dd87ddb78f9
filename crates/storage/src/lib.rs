use anyhow::{bail, ensure, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use messaging_core::{ChangeEventStream, ChangeFeed, MessageStore};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use tokio::sync::{broadcast, Mutex};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use shared::{
    domain::{ActorId, ActorKey, ActorKind, MessageId, TenantId},
    protocol::{ChangeEvent, Message, MessageDraft},
};

/// SQLite message table shared by every tenant of one deployment.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn insert_message(&self, draft: &MessageDraft) -> Result<Message> {
        let content = draft.content.trim();
        ensure!(!content.is_empty(), "refusing to store an empty message");

        let created_at = Utc::now();
        let rec = sqlx::query(
            "INSERT INTO messages (tenant_id, sender_id, sender_kind, receiver_id, receiver_kind, content, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(draft.tenant_id.0)
        .bind(draft.sender.actor_id.0)
        .bind(actor_kind_label(draft.sender.kind))
        .bind(draft.receiver.actor_id.0)
        .bind(actor_kind_label(draft.receiver.kind))
        .bind(content)
        .bind(created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(Message {
            message_id: MessageId(rec.get::<i64, _>(0)),
            tenant_id: draft.tenant_id,
            sender: draft.sender,
            receiver: draft.receiver,
            content: content.to_string(),
            created_at,
            is_read: false,
            read_at: None,
        })
    }

    pub async fn conversation_messages(
        &self,
        tenant_id: TenantId,
        a: ActorKey,
        b: ActorKey,
        limit: Option<u32>,
    ) -> Result<Vec<Message>> {
        let mut rows = if let Some(limit) = limit {
            sqlx::query(
                "SELECT id, tenant_id, sender_id, sender_kind, receiver_id, receiver_kind, content, created_at, is_read, read_at
                 FROM messages
                 WHERE tenant_id = ?
                   AND ((sender_id = ? AND sender_kind = ? AND receiver_id = ? AND receiver_kind = ?)
                     OR (sender_id = ? AND sender_kind = ? AND receiver_id = ? AND receiver_kind = ?))
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?",
            )
            .bind(tenant_id.0)
            .bind(a.actor_id.0)
            .bind(actor_kind_label(a.kind))
            .bind(b.actor_id.0)
            .bind(actor_kind_label(b.kind))
            .bind(b.actor_id.0)
            .bind(actor_kind_label(b.kind))
            .bind(a.actor_id.0)
            .bind(actor_kind_label(a.kind))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT id, tenant_id, sender_id, sender_kind, receiver_id, receiver_kind, content, created_at, is_read, read_at
                 FROM messages
                 WHERE tenant_id = ?
                   AND ((sender_id = ? AND sender_kind = ? AND receiver_id = ? AND receiver_kind = ?)
                     OR (sender_id = ? AND sender_kind = ? AND receiver_id = ? AND receiver_kind = ?))
                 ORDER BY created_at DESC, id DESC",
            )
            .bind(tenant_id.0)
            .bind(a.actor_id.0)
            .bind(actor_kind_label(a.kind))
            .bind(b.actor_id.0)
            .bind(actor_kind_label(b.kind))
            .bind(b.actor_id.0)
            .bind(actor_kind_label(b.kind))
            .bind(a.actor_id.0)
            .bind(actor_kind_label(a.kind))
            .fetch_all(&self.pool)
            .await?
        };

        rows.reverse();
        rows.iter().map(message_from_row).collect()
    }

    pub async fn last_conversation_message(
        &self,
        tenant_id: TenantId,
        a: ActorKey,
        b: ActorKey,
    ) -> Result<Option<Message>> {
        let row = sqlx::query(
            "SELECT id, tenant_id, sender_id, sender_kind, receiver_id, receiver_kind, content, created_at, is_read, read_at
             FROM messages
             WHERE tenant_id = ?
               AND ((sender_id = ? AND sender_kind = ? AND receiver_id = ? AND receiver_kind = ?)
                 OR (sender_id = ? AND sender_kind = ? AND receiver_id = ? AND receiver_kind = ?))
             ORDER BY created_at DESC, id DESC
             LIMIT 1",
        )
        .bind(tenant_id.0)
        .bind(a.actor_id.0)
        .bind(actor_kind_label(a.kind))
        .bind(b.actor_id.0)
        .bind(actor_kind_label(b.kind))
        .bind(b.actor_id.0)
        .bind(actor_kind_label(b.kind))
        .bind(a.actor_id.0)
        .bind(actor_kind_label(a.kind))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(message_from_row).transpose()
    }

    pub async fn count_unread(
        &self,
        tenant_id: TenantId,
        me: ActorKey,
        counterpart: ActorKey,
    ) -> Result<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*)
             FROM messages
             WHERE tenant_id = ?
               AND receiver_id = ? AND receiver_kind = ?
               AND sender_id = ? AND sender_kind = ?
               AND is_read = 0",
        )
        .bind(tenant_id.0)
        .bind(me.actor_id.0)
        .bind(actor_kind_label(me.kind))
        .bind(counterpart.actor_id.0)
        .bind(actor_kind_label(counterpart.kind))
        .fetch_one(&self.pool)
        .await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    /// Flips the listed rows to read inside one transaction; rows already
    /// read keep their original `read_at`.
    pub async fn mark_messages_read(
        &self,
        tenant_id: TenantId,
        message_ids: &[MessageId],
    ) -> Result<u64> {
        if message_ids.is_empty() {
            return Ok(0);
        }

        let read_at = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut updated = 0;
        for message_id in message_ids {
            updated += sqlx::query(
                "UPDATE messages
                 SET is_read = 1, read_at = ?
                 WHERE id = ? AND tenant_id = ? AND is_read = 0",
            )
            .bind(read_at)
            .bind(message_id.0)
            .bind(tenant_id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }
        tx.commit().await?;
        Ok(updated)
    }
}

fn actor_kind_label(kind: ActorKind) -> &'static str {
    match kind {
        ActorKind::Staff => "staff",
        ActorKind::Student => "student",
        ActorKind::Company => "company",
    }
}

fn parse_actor_kind(label: &str) -> Result<ActorKind> {
    match label {
        "staff" => Ok(ActorKind::Staff),
        "student" => Ok(ActorKind::Student),
        "company" => Ok(ActorKind::Company),
        other => bail!("unknown actor kind '{other}' in messages table"),
    }
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    Ok(Message {
        message_id: MessageId(row.get::<i64, _>(0)),
        tenant_id: TenantId(row.get::<i64, _>(1)),
        sender: ActorKey::new(
            ActorId(row.get::<i64, _>(2)),
            parse_actor_kind(&row.get::<String, _>(3))?,
        ),
        receiver: ActorKey::new(
            ActorId(row.get::<i64, _>(4)),
            parse_actor_kind(&row.get::<String, _>(5))?,
        ),
        content: row.get::<String, _>(6),
        created_at: row.get::<DateTime<Utc>, _>(7),
        is_read: row.get::<bool, _>(8),
        read_at: row.get::<Option<DateTime<Utc>>, _>(9),
    })
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
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
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

const FEED_CHANNEL_CAPACITY: usize = 256;

/// `Storage` plus an in-process change feed, one broadcast hub per tenant.
/// A subscriber that falls behind has its stream end rather than skip rows
/// silently.
#[derive(Clone)]
pub struct LocalBackend {
    storage: Storage,
    feeds: Arc<Mutex<HashMap<TenantId, broadcast::Sender<ChangeEvent>>>>,
}

impl LocalBackend {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            feeds: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn feed_sender(&self, tenant_id: TenantId) -> broadcast::Sender<ChangeEvent> {
        let mut feeds = self.feeds.lock().await;
        feeds
            .entry(tenant_id)
            .or_insert_with(|| broadcast::channel(FEED_CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl MessageStore for LocalBackend {
    async fn insert_message(&self, draft: MessageDraft) -> Result<Message> {
        let message = self.storage.insert_message(&draft).await?;
        let feed = self.feed_sender(message.tenant_id).await;
        let _ = feed.send(ChangeEvent::MessageInserted {
            message: message.clone(),
        });
        Ok(message)
    }

    async fn conversation_messages(
        &self,
        tenant_id: TenantId,
        a: ActorKey,
        b: ActorKey,
        limit: Option<u32>,
    ) -> Result<Vec<Message>> {
        self.storage
            .conversation_messages(tenant_id, a, b, limit)
            .await
    }

    async fn last_conversation_message(
        &self,
        tenant_id: TenantId,
        a: ActorKey,
        b: ActorKey,
    ) -> Result<Option<Message>> {
        self.storage
            .last_conversation_message(tenant_id, a, b)
            .await
    }

    async fn count_unread(
        &self,
        tenant_id: TenantId,
        me: ActorKey,
        counterpart: ActorKey,
    ) -> Result<u32> {
        self.storage.count_unread(tenant_id, me, counterpart).await
    }

    async fn mark_read(&self, tenant_id: TenantId, message_ids: &[MessageId]) -> Result<()> {
        self.storage
            .mark_messages_read(tenant_id, message_ids)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for LocalBackend {
    async fn subscribe(&self, tenant_id: TenantId) -> Result<ChangeEventStream> {
        let receiver = self.feed_sender(tenant_id).await.subscribe();
        let events = BroadcastStream::new(receiver)
            .take_while(|event| event.is_ok())
            .filter_map(|event| event.ok());
        Ok(Box::pin(events))
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
