use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use chat_core::{
    loopback::{LoopbackProvider, LoopbackSigner},
    ChatClientRegistry, ChatMessage, ConnectionEventKind, Identity,
};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;

mod config;

use config::load_settings;

const ECHO_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens a table chat against the in-process loopback provider, sends a few
/// lines and prints what comes back.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "table_chat.toml")]
    config: PathBuf,
    /// Overrides the wallet address from the config.
    #[arg(long)]
    address: Option<String>,
    /// Overrides the table name from the config.
    #[arg(long)]
    table: Option<String>,
    /// Message to send; repeat for several.
    #[arg(long = "message")]
    messages: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let mut settings = load_settings(&args.config)?;
    if let Some(address) = args.address {
        settings.address = address;
    }
    if let Some(table) = args.table {
        settings.table = table;
    }
    let messages = if args.messages.is_empty() {
        vec!["gl hf".to_string()]
    } else {
        args.messages
    };

    let provider = Arc::new(LoopbackProvider::new().with_stream_mirroring());
    let registry = ChatClientRegistry::new(provider, settings.chat.clone());
    let client = registry
        .get_instance(Identity::new(settings.address.as_str(), Arc::new(LoopbackSigner)))
        .await;

    let group = client
        .create_group(settings.table.as_str(), "loopback table")
        .await?;
    println!("Created table '{}' as group_id={group}", settings.table);

    let (connected_tx, mut connected_rx) = mpsc::unbounded_channel();
    let connected = client.subscribe_connection(ConnectionEventKind::Connected, move |_| {
        connected_tx
            .send(())
            .map_err(|_| anyhow!("connection waiter went away"))
    });

    let (message_tx, mut message_rx) = mpsc::unbounded_channel::<ChatMessage>();
    let subscription = client.subscribe_messages(group.clone(), move |message| {
        message_tx
            .send(message.clone())
            .map_err(|_| anyhow!("message printer went away"))
    });

    tokio::time::timeout(ECHO_TIMEOUT, connected_rx.recv())
        .await
        .context("timed out waiting for the provider to connect")?
        .context("connection listener closed")?;
    connected.unsubscribe();

    for line in &messages {
        if !client.send_message(&group, line).await {
            bail!("failed to send '{line}' to {group}");
        }
    }

    for _ in &messages {
        let message = tokio::time::timeout(ECHO_TIMEOUT, message_rx.recv())
            .await
            .context("timed out waiting for a message to come back")?
            .context("message listener closed")?;
        println!(
            "[{}] {}: {}",
            message.timestamp.format("%H:%M:%S%.3f"),
            message.sender,
            message.content
        );
    }

    let history = client.get_history(&group).await?;
    info!(group_id = %group, entries = history.len(), "table_chat: history fetched");
    println!("History holds {} message(s)", history.len());

    subscription.unsubscribe();
    registry.dispose().await;
    Ok(())
}
