use chrono::{DateTime, Utc};
use shared::{
    domain::{ActorKey, MessageId},
    protocol::Message,
};

/// History of the one open conversation, ordered by `(created_at, id)`.
#[derive(Debug)]
pub struct ConversationLog {
    counterpart: ActorKey,
    messages: Vec<Message>,
}

impl ConversationLog {
    pub fn new(counterpart: ActorKey) -> Self {
        Self {
            counterpart,
            messages: Vec::new(),
        }
    }

    pub fn counterpart(&self) -> ActorKey {
        self.counterpart
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn contains(&self, message_id: MessageId) -> bool {
        self.messages.iter().any(|m| m.message_id == message_id)
    }

    /// Insert-or-ignore by id: a send's confirmed write and the feed's echo
    /// of the same insert collapse into one entry.
    pub fn merge(&mut self, message: Message) -> bool {
        if self.contains(message.message_id) {
            return false;
        }
        let key = message.sort_key();
        let at = self.messages.partition_point(|m| m.sort_key() <= key);
        self.messages.insert(at, message);
        true
    }

    /// Snapshot replace that re-merges entries the snapshot does not know
    /// about yet.
    pub fn adopt(&mut self, snapshot: Vec<Message>) {
        let carried = std::mem::replace(&mut self.messages, snapshot);
        self.messages.sort_by_key(Message::sort_key);
        for message in carried {
            self.merge(message);
        }
    }

    pub fn unread_inbound(&self, me: ActorKey) -> Vec<MessageId> {
        self.messages
            .iter()
            .filter(|m| m.receiver == me && !m.is_read)
            .map(|m| m.message_id)
            .collect()
    }

    /// The flag only ever goes false to true; entries already read keep
    /// their original `read_at`.
    pub fn confirm_read(&mut self, message_ids: &[MessageId], read_at: DateTime<Utc>) {
        for message in &mut self.messages {
            if !message.is_read && message_ids.contains(&message.message_id) {
                message.is_read = true;
                message.read_at = Some(read_at);
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
