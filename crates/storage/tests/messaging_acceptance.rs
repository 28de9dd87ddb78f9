use std::{sync::Arc, time::Duration};

use messaging_core::{LinkState, MessagingClient, MessagingEvent, StaticContactSource};
use shared::{
    domain::{Actor, ActorId, ActorKey, ActorKind, TenantId},
    protocol::{CounterpartProfile, Message},
};
use storage::{LocalBackend, Storage};
use tokio::{
    sync::broadcast,
    time::{sleep, timeout, Instant},
};

const WAIT: Duration = Duration::from_secs(2);
const STEP: Duration = Duration::from_millis(10);

fn profile(actor: ActorKey, name: &str) -> CounterpartProfile {
    CounterpartProfile {
        actor,
        display_name: name.to_string(),
        avatar_ref: None,
    }
}

async fn wait_for_link(client: &MessagingClient, wanted: LinkState) {
    let deadline = Instant::now() + WAIT;
    while client.link_state().await != wanted {
        assert!(Instant::now() < deadline, "link never became {wanted:?}");
        sleep(STEP).await;
    }
}

/// Waits until the open conversation holds `expected_len` rows and every
/// inbound one is marked read, then returns the settled rows.
async fn settled_log(client: &MessagingClient, me: ActorKey, expected_len: usize) -> Vec<Message> {
    let deadline = Instant::now() + WAIT;
    loop {
        if let Some((_, messages)) = client.conversation_snapshot().await {
            if messages.len() == expected_len
                && messages
                    .iter()
                    .filter(|m| m.receiver == me)
                    .all(|m| m.is_read)
            {
                return messages;
            }
        }
        assert!(Instant::now() < deadline, "conversation never settled");
        sleep(STEP).await;
    }
}

async fn next_merge(rx: &mut broadcast::Receiver<MessagingEvent>) -> Message {
    loop {
        let event = timeout(WAIT, rx.recv())
            .await
            .expect("waiting for a merge event")
            .expect("event channel open");
        if let MessagingEvent::MessageMerged { message } = event {
            return message;
        }
    }
}

#[tokio::test]
async fn live_delivery_reaches_both_sides_exactly_once_acceptance() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let backend = Arc::new(LocalBackend::new(storage.clone()));

    let coach = Actor::new(ActorId(1), ActorKind::Staff, TenantId(1));
    let member = Actor::new(ActorId(2), ActorKind::Student, TenantId(1));

    let coach_client = MessagingClient::new(
        coach,
        backend.clone(),
        Arc::new(StaticContactSource::new(vec![profile(
            member.key(),
            "Jamie Fox",
        )])),
        backend.clone(),
    );
    let member_client = MessagingClient::new(
        member,
        backend.clone(),
        Arc::new(StaticContactSource::new(vec![profile(
            coach.key(),
            "Coach Dana",
        )])),
        backend.clone(),
    );

    coach_client.open_directory().await.expect("coach directory");
    member_client
        .open_directory()
        .await
        .expect("member directory");

    let mut coach_rx = coach_client.subscribe_events();
    let mut member_rx = member_client.subscribe_events();
    coach_client.subscribe().await;
    member_client.subscribe().await;
    wait_for_link(&coach_client, LinkState::Active).await;
    wait_for_link(&member_client, LinkState::Active).await;

    let coach_view = coach_client
        .open_conversation(member.key())
        .await
        .expect("coach open");
    assert!(coach_view.is_empty());
    let member_view = member_client
        .open_conversation(coach.key())
        .await
        .expect("member open");
    assert!(member_view.is_empty());

    let question = member_client
        .send(coach.key(), "is the 6am class still on?")
        .await
        .expect("member send");
    let own_merge = next_merge(&mut member_rx).await;
    assert_eq!(own_merge.message_id, question.message_id);

    let merged_at_coach = next_merge(&mut coach_rx).await;
    assert_eq!(merged_at_coach.message_id, question.message_id);
    assert_eq!(merged_at_coach.content, "is the 6am class still on?");

    let reply = coach_client
        .send(member.key(), "yes, doors open at 5:45")
        .await
        .expect("coach reply");
    let own_reply_merge = next_merge(&mut coach_rx).await;
    assert_eq!(own_reply_merge.message_id, reply.message_id);

    let merged_at_member = next_merge(&mut member_rx).await;
    assert_eq!(merged_at_member.message_id, reply.message_id);

    // The feed echo of each send must be absorbed: two rows per side, the
    // inbound one read on arrival.
    let coach_log = settled_log(&coach_client, coach.key(), 2).await;
    assert_eq!(coach_log[0].message_id, question.message_id);
    assert_eq!(coach_log[1].message_id, reply.message_id);

    let member_log = settled_log(&member_client, member.key(), 2).await;
    assert_eq!(member_log[0].message_id, question.message_id);
    assert_eq!(member_log[1].message_id, reply.message_id);

    let coach_unread = storage
        .count_unread(TenantId(1), coach.key(), member.key())
        .await
        .expect("coach count");
    let member_unread = storage
        .count_unread(TenantId(1), member.key(), coach.key())
        .await
        .expect("member count");
    assert_eq!(coach_unread, 0);
    assert_eq!(member_unread, 0);

    let directory = coach_client.directory_snapshot().await;
    assert_eq!(directory.len(), 1);
    assert_eq!(directory[0].unread_count, 0);
    assert_eq!(
        directory[0].last_message_preview.as_deref(),
        Some("yes, doors open at 5:45")
    );
}

#[tokio::test]
async fn offline_backlog_is_recovered_on_next_boot_acceptance() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let backend = Arc::new(LocalBackend::new(storage.clone()));

    let coach = Actor::new(ActorId(1), ActorKind::Staff, TenantId(1));
    let member = Actor::new(ActorId(2), ActorKind::Student, TenantId(1));

    // The member writes while the coach has no session at all.
    let member_client = MessagingClient::new(
        member,
        backend.clone(),
        Arc::new(StaticContactSource::new(vec![profile(
            coach.key(),
            "Coach Dana",
        )])),
        backend.clone(),
    );
    member_client
        .send(coach.key(), "monday 7am works")
        .await
        .expect("first send");
    member_client
        .send(coach.key(), "also, can we add a friday slot?")
        .await
        .expect("second send");
    member_client
        .send(coach.key(), "bring the resistance bands")
        .await
        .expect("third send");

    // First boot of the coach session: the backlog exists only in the store.
    let coach_client = MessagingClient::new(
        coach,
        backend.clone(),
        Arc::new(StaticContactSource::new(vec![profile(
            member.key(),
            "Jamie Fox",
        )])),
        backend.clone(),
    );
    let contacts = coach_client.open_directory().await.expect("directory");
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].unread_count, 3);
    assert_eq!(
        contacts[0].last_message_preview.as_deref(),
        Some("bring the resistance bands")
    );

    coach_client.subscribe().await;
    wait_for_link(&coach_client, LinkState::Active).await;

    let messages = coach_client
        .open_conversation(member.key())
        .await
        .expect("open conversation");
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].content, "monday 7am works");
    assert_eq!(messages[2].content, "bring the resistance bands");
    assert!(messages.iter().all(|m| m.is_read && m.read_at.is_some()));

    let unread = storage
        .count_unread(TenantId(1), coach.key(), member.key())
        .await
        .expect("count");
    assert_eq!(unread, 0);

    let directory = coach_client.directory_snapshot().await;
    assert_eq!(directory[0].unread_count, 0);
}
