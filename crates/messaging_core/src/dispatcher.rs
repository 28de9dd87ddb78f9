use std::{pin::Pin, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use shared::{domain::TenantId, protocol::ChangeEvent};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::MessagingClient;

/// Ends when the underlying connection is lost; reconnecting is the
/// dispatcher's job, not the feed's.
pub type ChangeEventStream = Pin<Box<dyn Stream<Item = ChangeEvent> + Send>>;

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, tenant_id: TenantId) -> Result<ChangeEventStream>;
}

/// Feed for store-only operation; every subscribe attempt fails.
pub struct MissingChangeFeed;

#[async_trait]
impl ChangeFeed for MissingChangeFeed {
    async fn subscribe(&self, tenant_id: TenantId) -> Result<ChangeEventStream> {
        Err(anyhow!(
            "realtime feed unavailable for tenant {}",
            tenant_id.0
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Active,
    Closed,
}

/// Connect, repair whatever a gap may have cost, then route events until
/// the stream ends; teardown aborts the task from outside.
pub(crate) async fn run_link(client: Arc<MessagingClient>) {
    let tenant_id = client.actor.tenant_id;
    let mut backoff = client.settings.reconnect_initial;
    let mut failed_attempts: u32 = 0;
    loop {
        client.set_link_state(LinkState::Connecting).await;
        match client.feed.subscribe(tenant_id).await {
            Ok(mut events) => match client.resync_after_connect().await {
                Ok(()) => {
                    failed_attempts = 0;
                    backoff = client.settings.reconnect_initial;
                    client.set_link_state(LinkState::Active).await;
                    info!(tenant_id = tenant_id.0, "change feed active");
                    while let Some(event) = events.next().await {
                        client.route_change_event(event).await;
                    }
                    info!(tenant_id = tenant_id.0, "change feed ended, reconnecting");
                    client.set_link_state(LinkState::Disconnected).await;
                }
                Err(err) => {
                    // The link must not go Active before the reload; this
                    // counts as a failed attempt.
                    warn!(tenant_id = tenant_id.0, error = %err, "post-connect reload failed");
                    failed_attempts += 1;
                    client
                        .note_connect_failure(failed_attempts, &err.to_string())
                        .await;
                    client.set_link_state(LinkState::Disconnected).await;
                }
            },
            Err(err) => {
                warn!(tenant_id = tenant_id.0, error = %err, "change feed subscribe failed");
                failed_attempts += 1;
                client
                    .note_connect_failure(failed_attempts, &err.to_string())
                    .await;
                client.set_link_state(LinkState::Disconnected).await;
            }
        }
        sleep(backoff).await;
        backoff = backoff.saturating_mul(2).min(client.settings.reconnect_max);
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
