use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use client_core::{load_settings, ClientEvent, MutationOutcome, PortalClient};
use shared::domain::{Role, UserId};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "portal", about = "Drives the messaging core against a portal server")]
struct Args {
    /// Overrides `server_url` from portal.toml / the environment.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    user_id: Option<i64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Conversations, most recent first, with unread counts.
    Contacts,
    /// Users you may start a conversation with.
    Recipients {
        #[arg(long, value_parser = parse_role)]
        role: Option<Role>,
    },
    Send {
        #[arg(long)]
        to: i64,
        body: String,
    },
    /// Prints presence and message events until interrupted.
    Watch,
}

fn parse_role(raw: &str) -> Result<Role, String> {
    match raw.to_ascii_lowercase().as_str() {
        "admin" => Ok(Role::Admin),
        "head" => Ok(Role::Head),
        "teacher" => Ok(Role::Teacher),
        "student" => Ok(Role::Student),
        other => Err(format!("unknown role '{other}'")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    let mut settings = load_settings()?;
    if let Some(server_url) = args.server_url {
        settings.server_url = client_core::config::normalize_server_url(&server_url)?;
    }
    let user_id = args
        .user_id
        .or(settings.user_id)
        .map(UserId)
        .ok_or_else(|| anyhow!("no user id; pass --user-id or set APP__USER_ID"))?;

    let client = PortalClient::connect(user_id, &settings)?;
    info!(server_url = %settings.server_url, user_id = user_id.0, "portal: connected");

    match args.command {
        Command::Contacts => {
            client.refresh_conversations().await?;
            for contact in client.contacts().await {
                println!(
                    "{:>6}  {:<24} unread={:<3} last={}",
                    contact.id,
                    contact.display_name,
                    contact.unread_count,
                    contact.last_activity_at.to_rfc3339()
                );
            }
            println!("total unread: {}", client.total_unread().await);
        }
        Command::Recipients { role } => {
            for recipient in client.recipients(role).await? {
                println!(
                    "{:>6}  {:<24} {:?}",
                    recipient.user_id, recipient.display_name, recipient.role
                );
            }
        }
        Command::Send { to, body } => {
            client.refresh_conversations().await?;
            client.on_select_conversation(UserId(to)).await?;
            match client.on_send(&body, Vec::new()).await? {
                MutationOutcome::Confirmed { message_id, .. } => {
                    println!("sent message {message_id}");
                }
                other => println!("send not confirmed: {other:?}"),
            }
        }
        Command::Watch => {
            let mut events = client.subscribe_events();
            client.refresh_conversations().await?;
            client.start_event_feed().await;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(event) => print_event(&event),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            println!("(skipped {skipped} events)");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            client.stop_event_feed().await;
        }
    }

    Ok(())
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::ThreadChanged(key) => println!("thread changed: {key}"),
        ClientEvent::ContactsChanged => println!("contacts changed"),
        ClientEvent::PresenceChanged => println!("presence changed"),
        ClientEvent::FeedDisconnected(reason) => println!("feed disconnected: {reason}"),
        ClientEvent::ServerError(message) => println!("server error: {message}"),
        other => println!("{other:?}"),
    }
}
