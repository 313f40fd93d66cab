use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::prelude::*;

mod cli;
mod config;
mod metrics;
mod server;

use crate::config::{AuthConfig, BazaarConfig, ClientSettings, FileConfig, ServerConfig};

#[derive(Parser)]
#[command(name = "bazaar")]
#[command(about = "Real-time chat for the Bazaar services marketplace")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.bazaar)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the chat server in the foreground
    Server(ServerArgs),

    /// Open a conversation and chat interactively
    Chat(cli::chat::ChatArgs),

    /// List your conversations
    Conversations(cli::conversations::ConversationsArgs),

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Parser)]
struct ServerArgs {
    /// Port for the web server (0 = auto-select)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = BazaarConfig::new(cli.data_dir.clone())?;
    let file_config = config.load()?;

    match cli.command {
        Commands::Server(args) => run_server(args, &file_config).await,
        Commands::Chat(args) => {
            cli::chat::chat_command(ClientSettings::from_file(&file_config.client), args).await
        }
        Commands::Conversations(args) => {
            cli::conversations::conversations_command(
                ClientSettings::from_file(&file_config.client),
                args,
            )
            .await
        }
        Commands::Config => {
            let rendered = toml::to_string_pretty(&file_config)
                .context("Failed to render configuration")?;
            println!("# {}", config.config_toml_path().display());
            print!("{rendered}");
            Ok(())
        }
    }
}

/// Logs go to stderr so the interactive client keeps stdout for chat.
fn init_tracing(debug: bool) {
    let default_directive = if debug {
        "bazaar=debug,bazaar_chat=debug,tower_http=debug,info"
    } else {
        "bazaar=info,bazaar_chat=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

async fn run_server(args: ServerArgs, file_config: &FileConfig) -> Result<()> {
    let mut server_file = file_config.server.clone();
    if let Some(host) = args.host {
        server_file.host = host;
    }
    if let Some(port) = args.port {
        server_file.port = port;
    }
    let server_config = ServerConfig::from_file(&server_file);
    let auth_config = AuthConfig::from_file(&file_config.auth);

    info!("Starting Bazaar chat server");
    if auth_config.is_open() {
        info!("No [auth] tokens configured: any bearer token is accepted as the user id");
    }

    let addr = server_config.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    let state = server::AppState::new(server_config, auth_config);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, stopping...");
        }
        signal.cancel();
    });

    server::serve(listener, state, shutdown).await?;
    info!("Shutdown complete");
    Ok(())
}
