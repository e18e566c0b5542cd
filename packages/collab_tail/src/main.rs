use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use collab_link::{
    LinkError, LinkFileConfig, Position, RealtimeClient, RelayHost, StaticToken, TransportKind,
    load_config, relay_channel,
};

#[derive(Parser)]
#[command(name = "collab-tail")]
#[command(about = "Follow a conversation or collaborative session from the terminal")]
struct Cli {
    #[command(subcommand)]
    target: TargetCommand,

    /// Custom data directory (defaults to ~/.collab_link)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// WebSocket base URL, overrides `[link] base_url`
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Access token sent in the authenticate frame
    #[arg(long, global = true, env = "COLLAB_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Transport strategy, overrides `[link] transport`
    #[arg(long, global = true, value_enum)]
    transport: Option<TransportArg>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum TargetCommand {
    /// Follow an agent conversation
    Conversation { id: String },
    /// Follow a collaborative session
    Session { id: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum TransportArg {
    Websocket,
    Relay,
}

impl From<TransportArg> for TransportKind {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Websocket => TransportKind::WebSocket,
            TransportArg::Relay => TransportKind::Relay,
        }
    }
}

/// One line typed on stdin.
#[derive(Debug, PartialEq)]
enum Input {
    User(String),
    Chat(String),
    Reply { parent_id: String, content: String },
    Cursor(Position),
    Quit,
    Empty,
}

impl Input {
    fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Self::Empty);
        }
        let Some(command) = line.strip_prefix('/') else {
            return Ok(Self::User(line.to_string()));
        };

        let (name, rest) = command
            .split_once(char::is_whitespace)
            .map(|(name, rest)| (name, rest.trim()))
            .unwrap_or((command, ""));
        match name {
            "quit" => Ok(Self::Quit),
            "chat" if !rest.is_empty() => Ok(Self::Chat(rest.to_string())),
            "chat" => Err("usage: /chat <text>".into()),
            "reply" => match rest.split_once(char::is_whitespace) {
                Some((parent_id, content)) if !content.trim().is_empty() => Ok(Self::Reply {
                    parent_id: parent_id.to_string(),
                    content: content.trim().to_string(),
                }),
                _ => Err("usage: /reply <parent_id> <text>".into()),
            },
            "cursor" => {
                let mut coords = rest.split_whitespace().map(str::parse::<f64>);
                match (coords.next(), coords.next(), coords.next()) {
                    (Some(Ok(x)), Some(Ok(y)), None) => Ok(Self::Cursor(Position { x, y })),
                    _ => Err("usage: /cursor <x> <y>".into()),
                }
            }
            other => Err(format!("unknown command /{other}")),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let data_dir = cli
        .data_dir
        .clone()
        .or_else(|| dirs::home_dir().map(|home| home.join(".collab_link")));
    let mut fc: LinkFileConfig = load_config(data_dir.as_deref())
        .extract()
        .context("Failed to load configuration")?;
    if let Some(base_url) = cli.base_url {
        fc.link.base_url = base_url;
    }
    if let Some(transport) = cli.transport {
        fc.link.transport = transport.into();
    }

    // Relay mode hosts the privileged side in-process.
    let (port, host) = match fc.link.transport {
        TransportKind::Relay => {
            let (port, endpoint) = relay_channel();
            (Some(port), Some(RelayHost::spawn(endpoint)))
        }
        TransportKind::WebSocket => (None, None),
    };

    let client = RealtimeClient::from_config(&fc, Arc::new(StaticToken::from(cli.token)), port)
        .context("Failed to build client")?;
    info!(
        base_url = %client.base_url(),
        transport = ?fc.link.transport,
        "Starting collab-tail"
    );

    let _printer = client.add_message_listener(|message| match serde_json::to_string(message) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(error = %e, "Failed to print message"),
    });
    let _states = client.add_state_change_listener(|state| info!(state = %state, "Connection state"));

    let connected = match &cli.target {
        TargetCommand::Conversation { id } => client.connect_to_conversation(id).await,
        TargetCommand::Session { id } => client.connect_to_session(id).await,
    };
    match connected {
        Ok(()) => {}
        Err(e @ (LinkError::InvalidTarget(_) | LinkError::InvalidUrl(_))) => return Err(e.into()),
        Err(e) => warn!(error = %e, "Initial connect failed, retrying in the background"),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => line.context("Failed to read stdin")?,
        };
        let Some(line) = line else {
            break;
        };

        let input = match Input::parse(&line) {
            Ok(Input::Quit) => break,
            Ok(Input::Empty) => continue,
            Ok(input) => input,
            Err(usage) => {
                eprintln!("{usage}");
                continue;
            }
        };
        if let Err(e) = dispatch(&client, input).await {
            warn!(error = %e, "Send failed");
        }
    }

    client.disconnect().await?;
    drop(client);
    if let Some(host) = host {
        // The host exits once the client's relay port is gone.
        if tokio::time::timeout(Duration::from_secs(2), host).await.is_err() {
            warn!("Relay host did not stop in time");
        }
    }
    Ok(())
}

async fn dispatch(client: &RealtimeClient, input: Input) -> Result<(), LinkError> {
    match input {
        Input::User(content) => client.send_user_message(&content).await,
        Input::Chat(content) => client.send_chat_message(&content, None).await,
        Input::Reply { parent_id, content } => {
            client.send_chat_message(&content, Some(&parent_id)).await
        }
        Input::Cursor(position) => client.send_cursor_position(position).await,
        Input::Quit | Input::Empty => Ok(()),
    }
}

fn init_logging(debug: bool) {
    let default_directive = if debug {
        "collab_tail=debug,collab_link=debug,info"
    } else {
        "collab_tail=info,collab_link=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}
