use anyhow::{Context, Result};
use bazaar_chat::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [server]
//                    port = 7420
//
//   env var:         BAZAAR_SERVER__PORT=7420   (double underscore = nesting)
//
//   (single underscore stays within field names: BAZAAR_CLIENT__SERVER_URL)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub client: ClientFileConfig,
    #[serde(default)]
    pub auth: AuthFileConfig,
}

/// Server tuning knobs (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
    #[serde(default = "default_send_channel_capacity")]
    pub send_channel_capacity: usize,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            max_message_len: default_max_message_len(),
            send_channel_capacity: default_send_channel_capacity(),
        }
    }
}

/// Chat client knobs (lives under `[client]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientFileConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_max_reconnect_delay_secs")]
    pub max_reconnect_delay_secs: u64,
    #[serde(default = "default_typing_timeout_ms")]
    pub typing_timeout_ms: u64,
    #[serde(default = "default_peer_typing_timeout_ms")]
    pub peer_typing_timeout_ms: u64,
}

impl Default for ClientFileConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            token: None,
            handshake_timeout_secs: default_handshake_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_delay_secs: default_max_reconnect_delay_secs(),
            typing_timeout_ms: default_typing_timeout_ms(),
            peer_typing_timeout_ms: default_peer_typing_timeout_ms(),
        }
    }
}

/// Credentials the server accepts (lives under `[auth]` in config.toml).
///
/// `tokens` maps bearer token → user id. When empty, the server runs in
/// open mode and a token is taken as the user id itself.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthFileConfig {
    #[serde(default)]
    pub tokens: BTreeMap<String, String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7420
}
fn default_handshake_timeout_secs() -> u64 {
    10
}
fn default_max_message_len() -> usize {
    4000
}
fn default_send_channel_capacity() -> usize {
    100
}
fn default_server_url() -> String {
    format!("http://{}:{}", default_host(), default_port())
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_reconnect_attempts() -> u32 {
    5
}
fn default_reconnect_delay_ms() -> u64 {
    1000
}
fn default_max_reconnect_delay_secs() -> u64 {
    30
}
fn default_typing_timeout_ms() -> u64 {
    3000
}
fn default_peer_typing_timeout_ms() -> u64 {
    10_000
}

/// Build a figment that layers: defaults → config.toml → BAZAAR_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `BAZAAR_SERVER__PORT=8080`  →  `server.port = 8080`
///   `BAZAAR_CLIENT__TOKEN=abc`  →  `client.token = "abc"`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("BAZAAR_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

/// Server configuration (runtime view).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Connections must present `hello` within this window
    pub handshake_timeout: Duration,
    /// Longest accepted message content, in characters
    pub max_message_len: usize,
    /// Per-connection outbound frame buffer
    pub send_channel_capacity: usize,
}

impl ServerConfig {
    pub fn from_file(fc: &ServerFileConfig) -> Self {
        Self {
            host: fc.host.clone(),
            port: fc.port,
            handshake_timeout: Duration::from_secs(fc.handshake_timeout_secs),
            max_message_len: fc.max_message_len,
            send_channel_capacity: fc.send_channel_capacity.max(1),
        }
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}

/// Client configuration (runtime view).
#[derive(Clone, Debug)]
pub struct ClientSettings {
    pub server_url: String,
    pub token: Option<String>,
    pub chat: ClientConfig,
}

impl ClientSettings {
    pub fn from_file(fc: &ClientFileConfig) -> Self {
        Self {
            server_url: fc.server_url.trim_end_matches('/').to_string(),
            token: fc.token.clone().filter(|t| !t.is_empty()),
            chat: ClientConfig {
                handshake_timeout: Duration::from_secs(fc.handshake_timeout_secs),
                request_timeout: Duration::from_secs(fc.request_timeout_secs),
                reconnect_attempts: fc.reconnect_attempts,
                reconnect_delay: Duration::from_millis(fc.reconnect_delay_ms),
                max_reconnect_delay: Duration::from_secs(fc.max_reconnect_delay_secs),
                typing_timeout: Duration::from_millis(fc.typing_timeout_ms),
                peer_typing_timeout: Duration::from_millis(fc.peer_typing_timeout_ms),
            },
        }
    }
}

/// Authentication configuration (runtime view).
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    tokens: BTreeMap<String, String>,
}

impl AuthConfig {
    pub fn from_file(fc: &AuthFileConfig) -> Self {
        Self {
            tokens: fc.tokens.clone(),
        }
    }

    /// Open mode: any non-empty token is accepted as the user id
    pub fn is_open(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Map a bearer token to its user id.
    pub fn resolve(&self, token: &str) -> Option<String> {
        let token = token.trim();
        if token.is_empty() {
            return None;
        }
        if self.is_open() {
            return Some(token.to_string());
        }
        self.tokens.get(token).cloned()
    }
}

// =============================================================================
// Directory layout config (not tunable via figment; derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct BazaarConfig {
    pub data_dir: PathBuf,
}

impl BazaarConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".bazaar"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    /// Resolve the layered configuration for this data directory.
    pub fn load(&self) -> Result<FileConfig> {
        load_config(&self.data_dir)
            .extract()
            .with_context(|| format!("Invalid configuration in {:?}", self.config_toml_path()))
    }
}
