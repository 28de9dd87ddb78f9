use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ActorKey, MessageId, TenantId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub tenant_id: TenantId,
    pub sender: ActorKey,
    pub receiver: ActorKey,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

impl Message {
    /// `(created_at, id)`; the server-assigned id breaks timestamp ties.
    pub fn sort_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.created_at, self.message_id)
    }

    pub fn counterpart_of(&self, me: ActorKey) -> ActorKey {
        if self.sender == me {
            self.receiver
        } else {
            self.sender
        }
    }

    pub fn involves(&self, actor: ActorKey) -> bool {
        self.sender == actor || self.receiver == actor
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDraft {
    pub tenant_id: TenantId,
    pub sender: ActorKey,
    pub receiver: ActorKey,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterpartProfile {
    pub actor: ActorKey,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub counterpart: ActorKey,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<MessageId>,
    pub unread_count: u32,
}

impl Contact {
    /// Sort key of the newest row this entry reflects, `None` before any
    /// activity.
    pub fn last_sort_key(&self) -> Option<(DateTime<Utc>, MessageId)> {
        Some((self.last_message_at?, self.last_message_id?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ChangeEvent {
    MessageInserted { message: Message },
}
