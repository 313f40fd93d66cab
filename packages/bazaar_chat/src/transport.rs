//! Transport seam: a live link is a pair of text-frame channels.
//!
//! The connection manager only ever sees [`Link`]s, so tests can swap the
//! websocket for an in-process fake server.

use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use crate::error::{ChatError, Result};

/// Frames buffered per direction before senders wait.
pub const LINK_CAPACITY: usize = 100;

/// One established transport. Dropping `outbound` closes the link; `inbound`
/// yielding `None` means the transport was lost.
pub struct Link {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

/// Opens new links to the chat server.
pub trait Connector: Send + Sync + 'static {
    fn open(&self) -> BoxFuture<'static, Result<Link>>;
}

/// Derive the websocket endpoint from the server's HTTP base URL.
pub fn websocket_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    if base.ends_with("/ws") {
        base
    } else {
        format!("{base}/ws")
    }
}

/// Websocket connector over `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Build from the server's HTTP base URL (`http://host:port`).
    pub fn from_base_url(base_url: &str) -> Self {
        Self::new(websocket_url(base_url))
    }
}

impl Connector for WsConnector {
    fn open(&self) -> BoxFuture<'static, Result<Link>> {
        let url = self.url.clone();
        async move {
            let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| ChatError::Transport(e.to_string()))?;
            debug!(url = %url, "websocket established");

            let (mut sink, mut source) = stream.split();
            let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(LINK_CAPACITY);
            let (inbound_tx, inbound_rx) = mpsc::channel::<String>(LINK_CAPACITY);

            // Writer: drain outbound channel → socket. Ends when the manager
            // drops its sender.
            tokio::spawn(async move {
                while let Some(text) = outbound_rx.recv().await {
                    if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                        warn!(error = %e, "websocket write failed");
                        break;
                    }
                }
                let _ = sink.close().await;
            });

            // Reader: socket → inbound channel. Dropping `inbound_tx` signals
            // transport loss to the manager.
            tokio::spawn(async move {
                while let Some(frame) = source.next().await {
                    match frame {
                        Ok(WsMessage::Text(text)) => {
                            if inbound_tx.send(text.to_string()).await.is_err() {
                                break;
                            }
                        }
                        Ok(WsMessage::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            debug!(error = %e, "websocket read ended");
                            break;
                        }
                    }
                }
            });

            Ok(Link {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })
        }
        .boxed()
    }
}
