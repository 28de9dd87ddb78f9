use std::{future::Future, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::{ActorKey, MessageId, TenantId},
    error::MessagingError,
    protocol::{Message, MessageDraft},
};
use tokio::time::timeout;

/// Row-oriented access to the persisted message table; implementations
/// never retry, callers own retry policy.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// The store assigns `message_id` and `created_at`.
    async fn insert_message(&self, draft: MessageDraft) -> Result<Message>;

    /// Messages between `a` and `b` in either direction, ascending by
    /// `(created_at, id)`; a limit selects the newest rows, still ascending.
    async fn conversation_messages(
        &self,
        tenant_id: TenantId,
        a: ActorKey,
        b: ActorKey,
        limit: Option<u32>,
    ) -> Result<Vec<Message>>;

    async fn last_conversation_message(
        &self,
        tenant_id: TenantId,
        a: ActorKey,
        b: ActorKey,
    ) -> Result<Option<Message>>;

    async fn count_unread(
        &self,
        tenant_id: TenantId,
        me: ActorKey,
        counterpart: ActorKey,
    ) -> Result<u32>;

    /// Idempotent; re-marking an already read message is a no-op.
    async fn mark_read(&self, tenant_id: TenantId, message_ids: &[MessageId]) -> Result<()>;
}

/// Bounds every store call by the configured timeout and maps raw adapter
/// errors into `MessagingError`.
pub struct StoreClient {
    store: Arc<dyn MessageStore>,
    op_timeout: Duration,
}

impl StoreClient {
    pub fn new(store: Arc<dyn MessageStore>, op_timeout: Duration) -> Self {
        Self { store, op_timeout }
    }

    pub async fn insert(&self, draft: MessageDraft) -> Result<Message, MessagingError> {
        self.bounded("insert", self.store.insert_message(draft))
            .await
    }

    pub async fn conversation(
        &self,
        tenant_id: TenantId,
        a: ActorKey,
        b: ActorKey,
        limit: Option<u32>,
    ) -> Result<Vec<Message>, MessagingError> {
        self.bounded(
            "conversation query",
            self.store.conversation_messages(tenant_id, a, b, limit),
        )
        .await
    }

    pub async fn last_message(
        &self,
        tenant_id: TenantId,
        a: ActorKey,
        b: ActorKey,
    ) -> Result<Option<Message>, MessagingError> {
        self.bounded(
            "last-message query",
            self.store.last_conversation_message(tenant_id, a, b),
        )
        .await
    }

    pub async fn count_unread(
        &self,
        tenant_id: TenantId,
        me: ActorKey,
        counterpart: ActorKey,
    ) -> Result<u32, MessagingError> {
        self.bounded(
            "unread count",
            self.store.count_unread(tenant_id, me, counterpart),
        )
        .await
    }

    pub async fn mark_read(
        &self,
        tenant_id: TenantId,
        message_ids: &[MessageId],
    ) -> Result<(), MessagingError> {
        self.bounded("mark-read", self.store.mark_read(tenant_id, message_ids))
            .await
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T, MessagingError>
    where
        F: Future<Output = Result<T>>,
    {
        match timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(MessagingError::persistence(op, err)),
            Err(_) => Err(MessagingError::persistence(
                op,
                format!("timed out after {:?}", self.op_timeout),
            )),
        }
    }
}
