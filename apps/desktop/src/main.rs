use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use client_core::{
    group_by_day, load_settings, load_settings_from, time_label, AuthSession, BearerToken,
    ChatError, ClientEvent, ConversationController, HttpChatApi, Message, SessionContext,
    SessionStore,
};
use futures::StreamExt;
use shared::domain::{PeerRef, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::WatchStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Terminal chat with a single peer.
#[derive(Parser, Debug)]
struct Args {
    /// Settings file; `client.toml` in the working directory when omitted.
    #[arg(long)]
    settings: Option<PathBuf>,
    #[arg(long)]
    server_url: Option<String>,
    /// Bearer token issued by the backend.
    #[arg(long)]
    token: String,
    #[arg(long)]
    peer_id: String,
    #[arg(long)]
    peer_username: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    let mut settings = match &args.settings {
        Some(path) => load_settings_from(path)?,
        None => load_settings(),
    };
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url.trim_end_matches('/').to_string();
    }

    let token = BearerToken::from_jwt(args.token);
    let me = HttpChatApi::new(settings.clone(), Arc::new(token.clone()))
        .current_user()
        .await
        .context("failed to resolve the signed-in user")?;
    info!(user_id = %me.id, username = %me.username, "desktop: signed in");

    let store = SessionStore::new();
    store
        .sign_in(AuthSession {
            user: me.clone(),
            token,
        })
        .await;

    let context = SessionContext::from_settings(&settings, Arc::new(store))?;
    let controller = ConversationController::new(context);
    let mut events = controller.subscribe_events();
    let peer = PeerRef::new(args.peer_id, args.peer_username);
    let session = controller
        .select_peer(&me.id, peer.clone())
        .await
        .with_context(|| format!("failed to open conversation with {}", peer.username))?;

    let renderer = tokio::spawn({
        let me = me.id.clone();
        let peer_name = peer.username.clone();
        let mut view = WatchStream::new(session.subscribe());
        async move {
            while let Some(messages) = view.next().await {
                render(&messages, &me, &peer_name);
            }
        }
    });
    let notices = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let ClientEvent::Notice { error, .. } = event {
                eprintln!("! {error}");
            }
        }
    });

    println!("Chatting with {}. /reconnect to reopen the channel, /quit to leave.", peer.username);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        match line.trim() {
            "/quit" => break,
            "/reconnect" => {
                if let Err(err) = session.reconnect().await {
                    eprintln!("! {err}");
                }
            }
            text => match session.send(text).await {
                Ok(_) | Err(ChatError::EmptyMessage) => {}
                Err(ChatError::ChannelNotReady) => {
                    eprintln!("! not connected; type /reconnect to try again");
                }
                Err(err) if err.is_recoverable() => {}
                Err(err) => {
                    warn!("desktop: giving up: {err}");
                    break;
                }
            },
        }
    }

    controller.close().await;
    renderer.abort();
    notices.abort();
    Ok(())
}

fn render(messages: &[Message], me: &UserId, peer_name: &str) {
    println!();
    for group in group_by_day(messages, Utc::now()) {
        println!("── {} ──", group.label);
        for message in group.messages {
            let author = if message.is_from(me) { "me" } else { peer_name };
            let status = if message.provisional {
                "sending"
            } else {
                message.status.as_str()
            };
            println!(
                "[{}] {author}: {} ({status})",
                time_label(message.timestamp),
                message.text
            );
        }
    }
}
