use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{load_settings, load_settings_from, ClientEvent, CollabClient, DraftMessage};
use shared::domain::{SurfaceId, UserId};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Settings file; falls back to the default location and environment overrides.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    token: String,
    /// Surface to open, e.g. `room:1`, `topic:4`, `conversation:9`.
    #[arg(long)]
    surface: SurfaceId,
    /// Optional message to send once the surface is loaded.
    #[arg(long)]
    send: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let settings = match &args.config {
        Some(path) => load_settings_from(path),
        None => load_settings(),
    }
    .context("failed to load client settings")?;
    info!(server_url = %settings.server_url, "collab_cli: starting");

    let client = CollabClient::with_http(UserId(args.user_id), settings, &args.token)?;
    let mut events = client.subscribe_events();

    client.connect(&args.token).await?;
    let merge = client.open_surface(args.surface).await?;
    client.view_surface(Some(args.surface)).await;
    info!(surface = %args.surface, loaded = merge.inserted, "collab_cli: surface open");
    print_snapshot(&client, args.surface).await?;

    if let Some(body) = args.send {
        let key = client.submit(args.surface, DraftMessage::text(body)).await?;
        client.settle(&key).await;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(ClientEvent::SurfaceChanged(surface)) if surface == args.surface => {
                    print_snapshot(&client, surface).await?;
                }
                Ok(ClientEvent::SurfaceChanged(_)) => {}
                Ok(ClientEvent::LifecycleChanged { key, status, .. }) => {
                    println!("[{key}] {}", serde_json::to_string(&status)?);
                }
                Ok(ClientEvent::ConnectionChanged(state)) => {
                    println!("connection: {}", serde_json::to_string(&state)?);
                }
                Ok(ClientEvent::Error(message)) => eprintln!("server error: {message}"),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "collab_cli: event stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.disconnect().await;
    Ok(())
}

async fn print_snapshot(client: &CollabClient, surface: SurfaceId) -> Result<()> {
    let Some(snapshot) = client.snapshot(surface).await else {
        return Ok(());
    };
    println!("--- {surface} ({} unread) ---", snapshot.unread);
    for record in &snapshot.messages {
        let id = record
            .id
            .map(|id| id.0.to_string())
            .unwrap_or_else(|| "pending".to_string());
        let body = if record.is_deleted() {
            "<deleted>"
        } else {
            record.body.as_deref().unwrap_or("")
        };
        let edited = if record.is_edited() { " (edited)" } else { "" };
        println!("{id:>8} user {}: {body}{edited}", record.sender_id.0);
    }
    if !snapshot.typing.is_empty() {
        let typing: Vec<String> = snapshot.typing.iter().map(|user| user.0.to_string()).collect();
        println!("typing: {}", typing.join(", "));
    }
    Ok(())
}
