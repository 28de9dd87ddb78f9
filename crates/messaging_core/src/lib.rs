use std::{sync::Arc, time::Duration};

use chrono::Utc;
use shared::{
    domain::{Actor, ActorKey, MessageId},
    error::MessagingError,
    protocol::{ChangeEvent, Contact, CounterpartProfile, Message, MessageDraft},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod conversation;
pub mod directory;
pub mod dispatcher;
pub mod store;

pub use conversation::ConversationLog;
pub use directory::{ContactSource, StaticContactSource};
pub use dispatcher::{ChangeEventStream, ChangeFeed, LinkState, MissingChangeFeed};
pub use store::{MessageStore, StoreClient};

use directory::Directory;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub store_timeout: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub degraded_after: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(10),
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
            degraded_after: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub enum MessagingEvent {
    ContactsLoaded { contacts: Vec<Contact> },
    ContactUpdated { contact: Contact },
    MessageMerged { message: Message },
    ConversationReloaded {
        counterpart: ActorKey,
        messages: Vec<Message>,
    },
    LinkStateChanged { state: LinkState },
    Degraded { failed_attempts: u32, reason: String },
    Error(String),
}

/// One instance serves one signed-in actor; a tenant or identity switch
/// builds a new client.
pub struct MessagingClient {
    pub(crate) actor: Actor,
    pub(crate) store: StoreClient,
    pub(crate) roster: Arc<dyn ContactSource>,
    pub(crate) feed: Arc<dyn ChangeFeed>,
    pub(crate) settings: ClientSettings,
    pub(crate) inner: Mutex<SessionState>,
    pub(crate) events: broadcast::Sender<MessagingEvent>,
}

pub(crate) struct SessionState {
    pub(crate) directory: Directory,
    pub(crate) open: Option<ConversationLog>,
    pub(crate) load_seq: u64,
    pub(crate) link: LinkState,
    pub(crate) link_task: Option<JoinHandle<()>>,
}

impl MessagingClient {
    pub fn new(
        actor: Actor,
        store: Arc<dyn MessageStore>,
        roster: Arc<dyn ContactSource>,
        feed: Arc<dyn ChangeFeed>,
    ) -> Arc<Self> {
        Self::with_settings(actor, store, roster, feed, ClientSettings::default())
    }

    pub fn with_settings(
        actor: Actor,
        store: Arc<dyn MessageStore>,
        roster: Arc<dyn ContactSource>,
        feed: Arc<dyn ChangeFeed>,
        settings: ClientSettings,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            actor,
            store: StoreClient::new(store, settings.store_timeout),
            roster,
            feed,
            settings,
            inner: Mutex::new(SessionState {
                directory: Directory::default(),
                open: None,
                load_seq: 0,
                link: LinkState::Disconnected,
                link_task: None,
            }),
            events,
        })
    }

    pub fn actor(&self) -> Actor {
        self.actor
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MessagingEvent> {
        self.events.subscribe()
    }

    pub async fn open_directory(&self) -> Result<Vec<Contact>, MessagingError> {
        {
            let state = self.inner.lock().await;
            if state.directory.is_loaded() {
                return Ok(state.directory.contacts());
            }
        }
        self.reload_directory().await
    }

    /// Full rebuild; on any failure the previous contacts stay in place.
    pub async fn reload_directory(&self) -> Result<Vec<Contact>, MessagingError> {
        let me = self.actor.key();
        let profiles = self
            .roster
            .counterparts_for(&self.actor)
            .await
            .map_err(|err| MessagingError::fetch("directory", err))?;
        let contacts =
            directory::build_contacts(&self.store, self.actor.tenant_id, me, profiles)
                .await
                .map_err(|err| MessagingError::fetch("directory", err))?;
        info!(
            tenant_id = self.actor.tenant_id.0,
            contact_count = contacts.len(),
            "directory loaded"
        );

        {
            let mut state = self.inner.lock().await;
            state.directory.adopt(contacts.clone());
        }
        let _ = self.events.send(MessagingEvent::ContactsLoaded {
            contacts: contacts.clone(),
        });
        Ok(contacts)
    }

    /// Loads the conversation with `counterpart`, makes it the open one and
    /// marks its inbound backlog read. Rapid switches are last-request-wins.
    pub async fn open_conversation(
        &self,
        counterpart: ActorKey,
    ) -> Result<Vec<Message>, MessagingError> {
        let me = self.actor.key();
        let token = {
            let mut state = self.inner.lock().await;
            state.load_seq += 1;
            state.load_seq
        };

        let snapshot = self
            .store
            .conversation(self.actor.tenant_id, me, counterpart, None)
            .await
            .map_err(|err| MessagingError::fetch("conversation", err))?;

        let (messages, unread) = {
            let mut state = self.inner.lock().await;
            if state.load_seq != token {
                debug!(
                    counterpart_id = counterpart.actor_id.0,
                    "conversation load superseded, discarding result"
                );
                return Err(MessagingError::fetch(
                    "conversation",
                    "superseded by a newer load",
                ));
            }
            let mut log = match state.open.take() {
                Some(existing) if existing.counterpart() == counterpart => existing,
                _ => ConversationLog::new(counterpart),
            };
            log.adopt(snapshot);
            let unread = log.unread_inbound(me);
            let messages = log.messages().to_vec();
            state.open = Some(log);
            (messages, unread)
        };

        if let Err(err) = self.confirm_read(counterpart, &unread).await {
            warn!(
                counterpart_id = counterpart.actor_id.0,
                error = %err,
                "failed to mark conversation read"
            );
            let _ = self.events.send(MessagingEvent::Error(format!(
                "failed to mark conversation read: {err}"
            )));
            return Ok(messages);
        }

        let state = self.inner.lock().await;
        match state.open.as_ref() {
            Some(log) if log.counterpart() == counterpart => Ok(log.messages().to_vec()),
            _ => Ok(messages),
        }
    }

    /// A failed insert mutates nothing and is never retried here.
    pub async fn send(
        &self,
        receiver: ActorKey,
        content: &str,
    ) -> Result<Message, MessagingError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(MessagingError::EmptyContent);
        }

        let draft = MessageDraft {
            tenant_id: self.actor.tenant_id,
            sender: self.actor.key(),
            receiver,
            content: content.to_string(),
        };
        let message = self.store.insert(draft).await?;
        info!(
            message_id = message.message_id.0,
            receiver_id = receiver.actor_id.0,
            "message sent"
        );

        let (merged, contact_update) = {
            let mut state = self.inner.lock().await;
            let merged = match state
                .open
                .as_mut()
                .filter(|log| log.counterpart() == receiver)
            {
                Some(log) => log.merge(message.clone()),
                None => false,
            };
            let contact_update = state.directory.apply_activity(&message, receiver);
            (merged, contact_update)
        };
        if merged {
            let _ = self.events.send(MessagingEvent::MessageMerged {
                message: message.clone(),
            });
        }
        if let Some(contact) = contact_update {
            let _ = self.events.send(MessagingEvent::ContactUpdated { contact });
        }
        Ok(message)
    }

    /// Idempotent while a link task is alive.
    pub async fn subscribe(self: &Arc<Self>) {
        let mut state = self.inner.lock().await;
        if state
            .link_task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
        {
            return;
        }
        state.link = LinkState::Disconnected;
        let client = Arc::clone(self);
        state.link_task = Some(tokio::spawn(dispatcher::run_link(client)));
    }

    /// The link state pins to `Closed` until a new `subscribe`.
    pub async fn unsubscribe(&self) {
        let (task, was_closed) = {
            let mut state = self.inner.lock().await;
            let was_closed = state.link == LinkState::Closed;
            state.link = LinkState::Closed;
            (state.link_task.take(), was_closed)
        };
        if let Some(task) = task {
            task.abort();
        }
        if !was_closed {
            let _ = self.events.send(MessagingEvent::LinkStateChanged {
                state: LinkState::Closed,
            });
        }
    }

    pub async fn directory_snapshot(&self) -> Vec<Contact> {
        self.inner.lock().await.directory.contacts()
    }

    pub async fn conversation_snapshot(&self) -> Option<(ActorKey, Vec<Message>)> {
        let state = self.inner.lock().await;
        state
            .open
            .as_ref()
            .map(|log| (log.counterpart(), log.messages().to_vec()))
    }

    pub async fn link_state(&self) -> LinkState {
        self.inner.lock().await.link
    }

    /// The store write happens first; only a confirmed write flips local
    /// flags or touches the counter.
    async fn confirm_read(
        &self,
        counterpart: ActorKey,
        message_ids: &[MessageId],
    ) -> Result<(), MessagingError> {
        if !message_ids.is_empty() {
            self.store
                .mark_read(self.actor.tenant_id, message_ids)
                .await?;
        }
        let contact_update = {
            let mut state = self.inner.lock().await;
            let still_open = state
                .open
                .as_ref()
                .map(|log| log.counterpart() == counterpart)
                .unwrap_or(false);
            if still_open {
                if let Some(log) = state.open.as_mut() {
                    log.confirm_read(message_ids, Utc::now());
                }
                state.directory.clear_unread(counterpart)
            } else {
                // The view moved on while the write was in flight; rows
                // counted since the batch was captured stay unread.
                state
                    .directory
                    .decrement_unread(counterpart, message_ids.len() as u32)
            }
        };
        if let Some(contact) = contact_update {
            let _ = self.events.send(MessagingEvent::ContactUpdated { contact });
        }
        Ok(())
    }

    /// Read-on-arrival for a row merged into the open log. The row was never
    /// counted, so the directory counter is left alone.
    async fn confirm_arrival_read(
        &self,
        counterpart: ActorKey,
        message_id: MessageId,
    ) -> Result<(), MessagingError> {
        self.store
            .mark_read(self.actor.tenant_id, &[message_id])
            .await?;
        let mut state = self.inner.lock().await;
        if let Some(log) = state
            .open
            .as_mut()
            .filter(|log| log.counterpart() == counterpart)
        {
            log.confirm_read(&[message_id], Utc::now());
        }
        Ok(())
    }

    pub(crate) async fn set_link_state(&self, next: LinkState) {
        {
            let mut state = self.inner.lock().await;
            if state.link == LinkState::Closed || state.link == next {
                return;
            }
            state.link = next;
        }
        let _ = self
            .events
            .send(MessagingEvent::LinkStateChanged { state: next });
    }

    pub(crate) async fn note_connect_failure(&self, failed_attempts: u32, reason: &str) {
        if failed_attempts == self.settings.degraded_after {
            warn!(
                failed_attempts,
                "realtime reconnect repeatedly failing, directory and log may be stale"
            );
            let _ = self.events.send(MessagingEvent::Degraded {
                failed_attempts,
                reason: reason.to_string(),
            });
        }
    }

    /// Post-connect repair, run before any merge of the new subscription's
    /// events.
    pub(crate) async fn resync_after_connect(&self) -> Result<(), MessagingError> {
        let me = self.actor.key();
        let (open_counterpart, token, roster) = {
            let mut state = self.inner.lock().await;
            let open = state.open.as_ref().map(|log| log.counterpart());
            if open.is_some() {
                state.load_seq += 1;
            }
            let roster = if state.directory.is_loaded() {
                state.directory.contacts()
            } else {
                Vec::new()
            };
            (open, state.load_seq, roster)
        };

        if let Some(counterpart) = open_counterpart {
            let snapshot = self
                .store
                .conversation(self.actor.tenant_id, me, counterpart, None)
                .await
                .map_err(|err| MessagingError::fetch("conversation", err))?;
            let (reloaded, unread) = {
                let mut state = self.inner.lock().await;
                if state.load_seq != token {
                    (None, Vec::new())
                } else {
                    match state
                        .open
                        .as_mut()
                        .filter(|log| log.counterpart() == counterpart)
                    {
                        Some(log) => {
                            log.adopt(snapshot);
                            (Some(log.messages().to_vec()), log.unread_inbound(me))
                        }
                        None => (None, Vec::new()),
                    }
                }
            };
            if let Some(messages) = reloaded {
                debug!(
                    counterpart_id = counterpart.actor_id.0,
                    message_count = messages.len(),
                    "open conversation reloaded after reconnect"
                );
                let _ = self.events.send(MessagingEvent::ConversationReloaded {
                    counterpart,
                    messages,
                });
                // The reloaded backlog is on screen, read like any arrival.
                self.confirm_read(counterpart, &unread).await?;
            }
        }

        if !roster.is_empty() {
            let profiles: Vec<CounterpartProfile> = roster
                .iter()
                .map(|contact| CounterpartProfile {
                    actor: contact.counterpart,
                    display_name: contact.display_name.clone(),
                    avatar_ref: contact.avatar_ref.clone(),
                })
                .collect();
            let contacts =
                directory::build_contacts(&self.store, self.actor.tenant_id, me, profiles)
                    .await
                    .map_err(|err| MessagingError::fetch("directory", err))?;
            {
                let mut state = self.inner.lock().await;
                state.directory.adopt(contacts.clone());
            }
            let _ = self
                .events
                .send(MessagingEvent::ContactsLoaded { contacts });
        }
        Ok(())
    }

    pub(crate) async fn route_change_event(&self, event: ChangeEvent) {
        match event {
            ChangeEvent::MessageInserted { message } => self.route_message(message).await,
        }
    }

    async fn route_message(&self, message: Message) {
        let me = self.actor.key();
        if !message.involves(me) {
            return;
        }
        let counterpart = message.counterpart_of(me);
        let inbound = message.receiver == me;

        let mut mark_read_id = None;
        let (merged, contact_update) = {
            let mut state = self.inner.lock().await;
            let open_matches = state
                .open
                .as_ref()
                .map(|log| log.counterpart() == counterpart)
                .unwrap_or(false);
            if open_matches {
                let merged = match state.open.as_mut() {
                    Some(log) => log.merge(message.clone()),
                    None => false,
                };
                if merged && inbound && !message.is_read {
                    mark_read_id = Some(message.message_id);
                }
                let contact_update = if merged {
                    state.directory.apply_activity(&message, counterpart)
                } else {
                    None
                };
                (merged, contact_update)
            } else if inbound {
                let contact_update = state.directory.apply_inbound(&message, counterpart);
                if contact_update.is_none() && !state.directory.knows(counterpart) {
                    warn!(
                        sender_id = message.sender.actor_id.0,
                        "inbound message from counterpart missing in directory"
                    );
                }
                (false, contact_update)
            } else {
                // Echo of an own send from another session of this actor.
                (false, state.directory.apply_activity(&message, counterpart))
            }
        };

        if merged {
            let _ = self.events.send(MessagingEvent::MessageMerged {
                message: message.clone(),
            });
        }
        if let Some(contact) = contact_update {
            let _ = self.events.send(MessagingEvent::ContactUpdated { contact });
        }
        if let Some(message_id) = mark_read_id {
            if let Err(err) = self.confirm_arrival_read(counterpart, message_id).await {
                warn!(
                    message_id = message_id.0,
                    error = %err,
                    "failed to mark arriving message read"
                );
                let _ = self.events.send(MessagingEvent::Error(format!(
                    "failed to mark arriving message read: {err}"
                )));
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
