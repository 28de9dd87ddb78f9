use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use messaging_core::{MessagingClient, MessagingEvent, StaticContactSource};
use shared::{
    domain::{Actor, ActorId, ActorKey, ActorKind, TenantId},
    protocol::{CounterpartProfile, Message},
};
use storage::{LocalBackend, Storage};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

mod config;

use config::{load_settings, normalize_database_url};

#[derive(Parser, Debug)]
struct Cli {
    /// Overrides the configured database url.
    #[arg(long)]
    database_url: Option<String>,
    /// Overrides the configured tenant.
    #[arg(long)]
    tenant: Option<i64>,
    /// Acting identity, for example staff:1 or student:42.
    #[arg(long, default_value = "staff:1")]
    actor: String,
    /// Roster presented to the client: comma separated keys with optional
    /// display names, for example "student:2=Jamie Fox,company:1=Front Desk".
    #[arg(long, default_value = "")]
    contacts: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the contact directory as JSON.
    Contacts,
    /// Print a conversation and mark its inbound backlog read.
    Open { counterpart: String },
    /// Send one message.
    Send { counterpart: String, content: String },
    /// Stay subscribed and print live events until ctrl-c.
    Watch {
        /// Conversation to keep open while watching.
        #[arg(long)]
        open: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let cli = Cli::parse();
    let settings = load_settings();
    let database_url =
        normalize_database_url(cli.database_url.as_deref().unwrap_or(&settings.database_url));
    let tenant_id = TenantId(cli.tenant.unwrap_or(settings.tenant_id));

    let me = parse_actor_key(&cli.actor)?;
    let actor = Actor::new(me.actor_id, me.kind, tenant_id);
    let profiles = parse_contacts(&cli.contacts)?;

    let storage = Storage::new(&database_url).await?;
    storage.health_check().await?;
    let backend = Arc::new(LocalBackend::new(storage));
    let client = MessagingClient::new(
        actor,
        backend.clone(),
        Arc::new(StaticContactSource::new(profiles)),
        backend,
    );

    match cli.command {
        Command::Contacts => {
            let contacts = client.open_directory().await?;
            println!("{}", serde_json::to_string_pretty(&contacts)?);
        }
        Command::Open { counterpart } => {
            let counterpart = parse_actor_key(&counterpart)?;
            client.open_directory().await?;
            let messages = client.open_conversation(counterpart).await?;
            if messages.is_empty() {
                println!("(no messages yet)");
            }
            for message in &messages {
                print_message(me, message);
            }
        }
        Command::Send {
            counterpart,
            content,
        } => {
            let counterpart = parse_actor_key(&counterpart)?;
            let message = client.send(counterpart, &content).await?;
            println!("sent message_id={}", message.message_id.0);
        }
        Command::Watch { open } => watch(client, open).await?,
    }

    Ok(())
}

async fn watch(client: Arc<MessagingClient>, open: Option<String>) -> Result<()> {
    let mut events = client.subscribe_events();
    client.open_directory().await?;
    client.subscribe().await;

    let me = client.actor().key();
    if let Some(raw) = open {
        let counterpart = parse_actor_key(&raw)?;
        for message in &client.open_conversation(counterpart).await? {
            print_message(me, message);
        }
    }
    info!("watching, ctrl-c to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => print_event(me, event),
                Err(RecvError::Lagged(skipped)) => println!("(skipped {skipped} events)"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.unsubscribe().await;
    Ok(())
}

fn print_event(me: ActorKey, event: MessagingEvent) {
    match event {
        MessagingEvent::ContactsLoaded { contacts } => {
            println!("directory loaded: {} contacts", contacts.len());
        }
        MessagingEvent::ContactUpdated { contact } => {
            println!(
                "contact {}: unread={} last={}",
                contact.display_name,
                contact.unread_count,
                contact.last_message_preview.as_deref().unwrap_or("-")
            );
        }
        MessagingEvent::MessageMerged { message } => print_message(me, &message),
        MessagingEvent::ConversationReloaded { messages, .. } => {
            println!("conversation reloaded: {} messages", messages.len());
        }
        MessagingEvent::LinkStateChanged { state } => println!("link: {state:?}"),
        MessagingEvent::Degraded {
            failed_attempts,
            reason,
        } => {
            println!("degraded after {failed_attempts} failed attempts: {reason}");
        }
        MessagingEvent::Error(err) => println!("error: {err}"),
    }
}

fn print_message(me: ActorKey, message: &Message) {
    let who = if message.sender == me {
        "me".to_string()
    } else {
        actor_label(message.sender)
    };
    let unread = if message.is_read { "" } else { " (unread)" };
    println!(
        "[{}] {who}: {}{unread}",
        message.created_at.format("%Y-%m-%d %H:%M"),
        message.content
    );
}

fn actor_label(key: ActorKey) -> String {
    let kind = match key.kind {
        ActorKind::Staff => "staff",
        ActorKind::Student => "student",
        ActorKind::Company => "company",
    };
    format!("{kind}:{}", key.actor_id.0)
}

fn parse_actor_key(raw: &str) -> Result<ActorKey> {
    let Some((kind, id)) = raw.split_once(':') else {
        bail!("expected kind:id, got '{raw}'");
    };
    let kind = match kind.trim() {
        "staff" => ActorKind::Staff,
        "student" => ActorKind::Student,
        "company" => ActorKind::Company,
        other => bail!("unknown actor kind '{other}' (expected staff, student or company)"),
    };
    let id = id
        .trim()
        .parse::<i64>()
        .with_context(|| format!("invalid actor id in '{raw}'"))?;
    Ok(ActorKey::new(ActorId(id), kind))
}

fn parse_contacts(raw: &str) -> Result<Vec<CounterpartProfile>> {
    let mut profiles = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (key, name) = match entry.split_once('=') {
            Some((key, name)) => (key.trim(), name.trim().to_string()),
            None => (entry, entry.to_string()),
        };
        profiles.push(CounterpartProfile {
            actor: parse_actor_key(key)?,
            display_name: name,
            avatar_ref: None,
        });
    }
    Ok(profiles)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_actor_keys() {
        let key = parse_actor_key("student:42").expect("key");
        assert_eq!(key, ActorKey::new(ActorId(42), ActorKind::Student));
        assert!(parse_actor_key("coach:1").is_err());
        assert!(parse_actor_key("staff").is_err());
    }

    #[test]
    fn parses_contact_lists_with_and_without_names() {
        let profiles =
            parse_contacts("student:2=Jamie Fox, company:1=Front Desk, staff:9").expect("roster");
        assert_eq!(profiles.len(), 3);
        assert_eq!(profiles[0].display_name, "Jamie Fox");
        assert_eq!(
            profiles[1].actor,
            ActorKey::new(ActorId(1), ActorKind::Company)
        );
        assert_eq!(profiles[2].display_name, "staff:9");
    }

    #[test]
    fn empty_contact_list_is_allowed() {
        assert!(parse_contacts("").expect("roster").is_empty());
    }
}
