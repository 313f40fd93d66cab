//! Command-line chat client.

pub mod chat;
pub mod conversations;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use bazaar_chat::{
    ConnectionManager, ConnectionState, HttpChatApi, Message, MessageType, StaticTokenStore,
    WsConnector,
};
use tokio::task::JoinHandle;

use crate::config::ClientSettings;

/// Connection options shared by the client subcommands.
#[derive(clap::Args, Debug, Clone)]
pub struct ClientArgs {
    /// Server base URL (overrides `[client] server_url`)
    #[arg(long)]
    pub server: Option<String>,

    /// Bearer token (overrides `[client] token`)
    #[arg(long)]
    pub token: Option<String>,
}

pub(crate) struct Client {
    pub api: HttpChatApi,
    pub connection: ConnectionManager,
}

impl Client {
    pub fn new(settings: &ClientSettings, args: &ClientArgs) -> Result<Self> {
        let server_url = args
            .server
            .clone()
            .unwrap_or_else(|| settings.server_url.clone());
        let Some(token) = args.token.clone().or_else(|| settings.token.clone()) else {
            bail!("No token configured: pass --token or set [client] token / BAZAAR_CLIENT__TOKEN");
        };
        let tokens = Arc::new(StaticTokenStore::new(token));
        Ok(Self {
            api: HttpChatApi::new(server_url.clone(), tokens.clone()),
            connection: ConnectionManager::new(
                Arc::new(WsConnector::from_base_url(&server_url)),
                tokens,
                settings.chat.clone(),
            ),
        })
    }

    pub async fn connect(&self) -> Result<()> {
        self.connection
            .connect()
            .await
            .context("Failed to connect to chat server")
    }
}

/// Report connection state changes on stderr until the state channel closes.
pub(crate) fn spawn_state_reporter(connection: &ConnectionManager) -> JoinHandle<()> {
    let mut state = connection.watch_state();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = *state.borrow_and_update();
            match current {
                ConnectionState::Reconnecting { attempt: 0 } => {
                    eprintln!("-- connection lost, reconnecting");
                }
                ConnectionState::Reconnecting { attempt } => {
                    eprintln!("-- reconnect attempt {attempt}");
                }
                ConnectionState::Connected => eprintln!("-- connected"),
                ConnectionState::Disconnected => eprintln!("-- disconnected"),
                ConnectionState::Connecting => {}
            }
        }
    })
}

pub(crate) fn format_message(message: &Message, me: Option<&str>) -> String {
    let who = if me == Some(message.sender_id.as_str()) {
        "you"
    } else {
        message.sender_id.as_str()
    };
    let time = message.created_at.format("%H:%M");
    match (&message.kind, &message.media_url) {
        (MessageType::Text, _) | (_, None) => format!("[{time}] {who}: {}", message.content),
        (_, Some(url)) => format!("[{time}] {who}: {} <{url}>", message.preview()),
    }
}
