use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    HttpGateway, Identity, SyncConfig, SyncEngine, SyncEvent, WsHubConnector,
};
use conversation_transport::MissingChannelConnector;
use shared::domain::{ConversationKey, MessageId, UserId};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::warn;

/// Line-oriented chat client. Each input line is sent to the open
/// conversation; `/retry <id>`, `/resume` and `/quit` are commands.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: String,
    #[arg(long)]
    username: String,
    /// Opens the direct conversation with this user.
    #[arg(long)]
    peer_user_id: Option<i64>,
    /// TOML file with sync tuning.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            SyncConfig::from_toml_str(&raw)?
        }
        None => SyncConfig::default(),
    };

    let (gateway, login) = HttpGateway::login(&args.server_url, &args.username).await?;
    println!("logged in as {} (user_id={})", login.username, login.user_id);
    let hub = WsHubConnector::new(&args.server_url, &login.token)?;
    let engine = Arc::new(SyncEngine::new(
        Identity {
            user_id: login.user_id,
            username: login.username.clone(),
        },
        config,
        Arc::new(gateway),
        Arc::new(MissingChannelConnector),
        Arc::new(hub),
    ));
    engine.start();

    match engine.refresh_conversations().await {
        Ok(conversations) => {
            for c in &conversations {
                println!("conversation {} ({})", c.conversation_id, c.local_key);
            }
        }
        Err(error) => warn!(%error, "could not list conversations"),
    }

    let open = args
        .peer_user_id
        .map(|peer| ConversationKey::direct(login.user_id, UserId(peer)));
    if let Some(key) = &open {
        engine.open_conversation(key).await?;
        for message in engine.get(key) {
            println!("{}: {}", message.sender_name, message.content);
        }
    }

    let printer = tokio::spawn(print_events(Arc::clone(&engine), open.clone()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) => break,
            ("/resume", _) => engine.resume_hub(),
            ("/retry", id) => match engine.retry(&MessageId::from(id.trim())) {
                Ok(pending) => report(pending),
                Err(error) => println!("! {error}"),
            },
            _ => match &open {
                Some(key) => report(engine.send(key, line)),
                None => println!("! no conversation open, pass --peer-user-id"),
            },
        }
    }

    printer.abort();
    engine.shutdown().await;
    Ok(())
}

fn report(pending: client_core::PendingSend) {
    let id = pending.id().clone();
    tokio::spawn(async move {
        if let Err(error) = pending.outcome().await {
            println!("! {id} failed: {error} (use /retry {id})");
        }
    });
}

async fn print_events(engine: Arc<SyncEngine>, open: Option<ConversationKey>) {
    let me = engine.identity().user_id;
    let mut events = engine.subscribe_events();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "event printer fell behind");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        match event {
            SyncEvent::MessageUpdated {
                conversation,
                message,
            } => {
                let status = engine.display_status(&message);
                println!(
                    "[{conversation}] {}: {} ({status:?})",
                    message.sender_name, message.content
                );
                let foreground = open.as_ref().is_some_and(|key| {
                    engine.subscription_mode(key) == client_core::SubscriptionMode::Foreground
                        && key == &conversation
                });
                if foreground && message.sender_id != me {
                    if let Err(error) = engine.mark_read(&[message.id.clone()], &conversation).await {
                        warn!(%error, "mark read failed");
                    }
                }
            }
            SyncEvent::UnreadChanged {
                conversation,
                unread,
            } => println!("[{conversation}] {unread} unread"),
            SyncEvent::TypingChanged {
                conversation,
                typing,
            } => {
                let names: Vec<&str> = typing.iter().map(|t| t.user_name.as_str()).collect();
                if !names.is_empty() {
                    println!("[{conversation}] {} typing...", names.join(", "));
                }
            }
            SyncEvent::HubStatusChanged(status) => println!("hub: {status:?}"),
        }
    }
}
