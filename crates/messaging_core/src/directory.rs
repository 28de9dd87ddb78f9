use std::cmp::Ordering;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::try_join_all;
use shared::{
    domain::{Actor, ActorKey, TenantId},
    error::MessagingError,
    protocol::{Contact, CounterpartProfile, Message},
};

use crate::store::StoreClient;

const PREVIEW_MAX_CHARS: usize = 120;

/// Roster provider: the individuals the CRUD side assigns to the actor,
/// plus the tenant's administration pseudo-contact.
#[async_trait]
pub trait ContactSource: Send + Sync {
    async fn counterparts_for(&self, actor: &Actor) -> Result<Vec<CounterpartProfile>>;
}

pub struct StaticContactSource {
    profiles: Vec<CounterpartProfile>,
}

impl StaticContactSource {
    pub fn new(profiles: Vec<CounterpartProfile>) -> Self {
        Self { profiles }
    }
}

#[async_trait]
impl ContactSource for StaticContactSource {
    async fn counterparts_for(&self, _actor: &Actor) -> Result<Vec<CounterpartProfile>> {
        Ok(self.profiles.clone())
    }
}

pub(crate) fn preview_of(content: &str) -> String {
    content.chars().take(PREVIEW_MAX_CHARS).collect()
}

pub(crate) async fn build_contacts(
    store: &StoreClient,
    tenant_id: TenantId,
    me: ActorKey,
    profiles: Vec<CounterpartProfile>,
) -> Result<Vec<Contact>, MessagingError> {
    let enrichments = profiles
        .into_iter()
        .map(|profile| enrich_contact(store, tenant_id, me, profile));
    let mut contacts = try_join_all(enrichments).await?;
    sort_contacts(&mut contacts);
    Ok(contacts)
}

async fn enrich_contact(
    store: &StoreClient,
    tenant_id: TenantId,
    me: ActorKey,
    profile: CounterpartProfile,
) -> Result<Contact, MessagingError> {
    let (last, unread_count) = tokio::try_join!(
        store.last_message(tenant_id, me, profile.actor),
        store.count_unread(tenant_id, me, profile.actor),
    )?;
    Ok(Contact {
        counterpart: profile.actor,
        display_name: profile.display_name,
        avatar_ref: profile.avatar_ref,
        last_message_preview: last.as_ref().map(|m| preview_of(&m.content)),
        last_message_id: last.as_ref().map(|m| m.message_id),
        last_message_at: last.map(|m| m.created_at),
        unread_count,
    })
}

// No-history entries keep their roster order; the sort is stable.
pub(crate) fn sort_contacts(contacts: &mut [Contact]) {
    contacts.sort_by(|a, b| match (&a.last_message_at, &b.last_message_at) {
        (Some(a_at), Some(b_at)) => b_at.cmp(a_at),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}

#[derive(Default)]
pub(crate) struct Directory {
    contacts: Vec<Contact>,
    loaded: bool,
}

impl Directory {
    pub(crate) fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub(crate) fn contacts(&self) -> Vec<Contact> {
        self.contacts.clone()
    }

    pub(crate) fn adopt(&mut self, contacts: Vec<Contact>) {
        self.contacts = contacts;
        self.loaded = true;
    }

    pub(crate) fn apply_inbound(&mut self, message: &Message, from: ActorKey) -> Option<Contact> {
        let contact = self.contact_mut(from)?;
        // Rows at or below the newest seen (created_at, id) were already
        // counted, by a recount or an earlier event.
        if contact.last_sort_key() >= Some(message.sort_key()) {
            return None;
        }
        contact.unread_count += 1;
        contact.last_message_preview = Some(preview_of(&message.content));
        contact.last_message_at = Some(message.created_at);
        contact.last_message_id = Some(message.message_id);
        let updated = contact.clone();
        sort_contacts(&mut self.contacts);
        Some(updated)
    }

    /// Preview and recency only; own sends and rows for the conversation on
    /// screen never touch the unread counter.
    pub(crate) fn apply_activity(
        &mut self,
        message: &Message,
        counterpart: ActorKey,
    ) -> Option<Contact> {
        let contact = self.contact_mut(counterpart)?;
        if contact.last_sort_key() >= Some(message.sort_key()) {
            return None;
        }
        contact.last_message_preview = Some(preview_of(&message.content));
        contact.last_message_at = Some(message.created_at);
        contact.last_message_id = Some(message.message_id);
        let updated = contact.clone();
        sort_contacts(&mut self.contacts);
        Some(updated)
    }

    pub(crate) fn knows(&self, counterpart: ActorKey) -> bool {
        self.contacts.iter().any(|c| c.counterpart == counterpart)
    }

    pub(crate) fn clear_unread(&mut self, counterpart: ActorKey) -> Option<Contact> {
        let contact = self.contact_mut(counterpart)?;
        if contact.unread_count == 0 {
            return None;
        }
        contact.unread_count = 0;
        Some(contact.clone())
    }

    /// Drops a confirmed batch from the counter, leaving rows counted after
    /// the batch was captured in place.
    pub(crate) fn decrement_unread(
        &mut self,
        counterpart: ActorKey,
        confirmed: u32,
    ) -> Option<Contact> {
        if confirmed == 0 {
            return None;
        }
        let contact = self.contact_mut(counterpart)?;
        if contact.unread_count == 0 {
            return None;
        }
        contact.unread_count = contact.unread_count.saturating_sub(confirmed);
        Some(contact.clone())
    }

    fn contact_mut(&mut self, counterpart: ActorKey) -> Option<&mut Contact> {
        self.contacts
            .iter_mut()
            .find(|c| c.counterpart == counterpart)
    }
}
