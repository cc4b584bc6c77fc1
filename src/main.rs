#![deny(dead_code)]
use anyhow::{anyhow, Result};
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use std::env;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};

mod utils;

use chatwire::{
    config::{self, ClientConfig},
    connection::{ConnectParams, ConnectionEvent, ReconnectEvent},
    models::{CanonicalMessage, Sender, SenderType},
    ChatClient, ClientEvent, SendOutcome,
};

/// Command line arguments for chatwire
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "chatwire: a resilient command-line chat client over WebSocket.",
    long_about = "chatwire connects to a chat server over WebSocket, keeps the connection alive \
    with heartbeats, reconnects with backoff when it drops and queues outgoing messages \
    while offline.\n\n\
    Type a line to send it. Commands: /status, /reconnect, /flush, /queue, /quit."
)]
struct Args {
    /// Server endpoint, e.g. ws://localhost:8080/chat (or CHATWIRE_ENDPOINT)
    #[arg(long, value_name = "URL")]
    endpoint: Option<String>,

    /// Conversation to send into (or CHATWIRE_CONVERSATION)
    #[arg(long, value_name = "ID")]
    conversation: Option<String>,

    /// Sender id used for outgoing messages
    #[arg(long, value_name = "ID", default_value = "cli-user")]
    user: String,

    /// Configuration file to use instead of the per-user one
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Directory for the persisted offline queue
    #[arg(long, value_name = "PATH")]
    queue_dir: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Extra connection parameter appended to the endpoint query, as key=value
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
    params: Vec<(String, String)>,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

/// Endpoint from the flag, the environment, or an interactive prompt.
fn resolve_endpoint(flag: Option<String>) -> Result<String> {
    if let Some(endpoint) = flag.or_else(|| env::var("CHATWIRE_ENDPOINT").ok()) {
        return Ok(endpoint);
    }
    eprintln!("Enter server endpoint (e.g., ws://localhost:8080/chat):");
    let endpoint = utils::read_line()?;
    if endpoint.is_empty() {
        return Err(anyhow!("No endpoint given"));
    }
    Ok(endpoint)
}

/// Load the config file, writing the defaults out on first run so they can be edited.
fn load_client_config(args: &Args) -> Result<ClientConfig> {
    if let Some(path) = &args.config {
        config::set_config_path_override(path.clone());
    }
    let mut client_config = match config::load_config()? {
        Some(loaded) => loaded,
        None => {
            let defaults = ClientConfig::default();
            if let Err(e) = config::save_config(&defaults) {
                warn!("Could not write default configuration: {}", e);
            }
            defaults
        }
    };

    if let Some(dir) = &args.queue_dir {
        client_config.queue.storage_dir = Some(dir.clone());
    }
    Ok(client_config)
}

fn print_message(message: &CanonicalMessage) {
    let who = message.sender.name.as_deref().unwrap_or(&message.sender.id);
    println!(
        "[{}] {} ({}): {}",
        message.timestamp,
        who,
        message.sender.sender_type.as_str(),
        message.content_text()
    );
}

/// Print inbound messages and lifecycle notices as they happen.
fn spawn_printers(client: &ChatClient) {
    let mut messages = client.events().subscribe();
    tokio::spawn(async move {
        while let Some(event) = messages.recv().await {
            match event {
                ClientEvent::Message(message) => print_message(&message),
                ClientEvent::QueueFlushed(summary) if summary.delivered > 0 => {
                    println!("* delivered {} queued message(s)", summary.delivered)
                }
                ClientEvent::ConnectionDead { failed_count } => {
                    println!("* server stopped answering ({} missed heartbeats)", failed_count)
                }
                ClientEvent::ReconnectExhausted { attempts } => {
                    println!("* gave up reconnecting after {} attempts; use /reconnect", attempts)
                }
                _ => {}
            }
        }
    });

    let mut lifecycle = client.connection().events().subscribe();
    tokio::spawn(async move {
        while let Some(event) = lifecycle.recv().await {
            match event {
                ConnectionEvent::StatusChange { status, .. } => println!("* {}", status),
                ConnectionEvent::Close { code, reason, .. } if !reason.is_empty() => {
                    println!("* closed ({}: {})", code, reason)
                }
                _ => {}
            }
        }
    });

    let mut recovery = client.reconnector().events().subscribe();
    tokio::spawn(async move {
        while let Some(event) = recovery.recv().await {
            if let ReconnectEvent::Scheduled { attempt, delay } = event {
                println!("* reconnecting in {:.1}s (attempt {})", delay.as_secs_f64(), attempt);
            }
        }
    });
}

async fn handle_command(client: &ChatClient, command: &str) -> bool {
    match command {
        "/quit" => return false,
        "/status" => println!(
            "* {} | queued: {} | reconnect attempts: {}",
            client.status(),
            client.queue().len(),
            client.reconnector().attempts()
        ),
        "/reconnect" => {
            client.reconnector().reset();
            if let Err(e) = client.reconnector().reconnect_now().await {
                println!("* reconnect failed: {}", e);
            }
        }
        "/flush" => match client.flush_queue().await {
            Some(summary) => println!(
                "* delivered {}, failed {}, {} left",
                summary.delivered, summary.failed, summary.remaining
            ),
            None => println!("* nothing to flush"),
        },
        "/queue" => {
            for entry in client.queue().messages() {
                println!(
                    "* {} [{}] retries: {}",
                    entry.id,
                    entry.conversation_id.as_deref().unwrap_or("-"),
                    entry.retry_count
                );
            }
            println!("* {} queued", client.queue().len());
        }
        other => println!("* unknown command {}", other),
    }
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    utils::setup_logging(args.log_file.as_deref(), LevelFilter::Info)?;
    info!("System information: {} {}", env::consts::OS, env::consts::ARCH);

    let client_config = load_client_config(&args)?;
    let endpoint = resolve_endpoint(args.endpoint.clone())?;
    let conversation = args
        .conversation
        .clone()
        .or_else(|| env::var("CHATWIRE_CONVERSATION").ok())
        .unwrap_or_else(|| chatwire::wire::DEFAULT_CONVERSATION_ID.to_string());
    let params: ConnectParams = args.params.iter().cloned().collect();

    let client = ChatClient::websocket(client_config)?;
    spawn_printers(&client);

    println!("Connecting to {}... please wait...", endpoint);
    match client.connect(&endpoint, &params).await {
        Ok(handle) => info!("Connected as {}", handle.id),
        Err(chatwire::ClientError::Connection(e)) if e.is_recoverable() => {
            warn!("Initial connection failed: {}", e);
            println!("* could not connect yet ({}); messages will be queued", e);
        }
        Err(e) => {
            error!("Connection to {} failed: {}", endpoint, e);
            eprintln!("Failed to connect to {}\nDetails: {}", endpoint, e);
            return Err(e.into());
        }
    }

    let sender = Sender::new(args.user.clone(), SenderType::User);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('/') {
            if !handle_command(&client, line).await {
                break;
            }
            continue;
        }

        let message = CanonicalMessage::text(conversation.as_str(), sender.clone(), line);
        match client.send(&message) {
            Ok(SendOutcome::Sent) => {}
            Ok(SendOutcome::Queued(id)) => println!("* offline, queued {}", id),
            Err(e) => eprintln!("* could not send: {}", e),
        }
    }

    info!("Shutting down");
    client.close();
    Ok(())
}
