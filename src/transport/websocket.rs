//! # WebSocket Transport
//!
//! `tokio-tungstenite` implementation of [`TransportConnector`]. Each open
//! connection is split into a writer task fed by the link's outbound channel
//! and a reader task that forwards text frames as [`TransportEvent`]s.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{TransportConnector, TransportEvent, TransportLink};
use crate::error::{BmsLinkError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Path of the device's socket endpoint
pub const WS_PATH: &str = "/ws";

/// Build the endpoint URL for a device host
///
/// # Examples
///
/// ```
/// use bms_link::transport::websocket::endpoint_url;
///
/// assert_eq!(endpoint_url("192.168.4.1"), "ws://192.168.4.1/ws");
/// assert_eq!(endpoint_url("bms.local:8080"), "ws://bms.local:8080/ws");
/// ```
///
/// The device serves plain `ws://` only.
pub fn endpoint_url(host: &str) -> String {
    format!("ws://{}{}", host.trim_end_matches('/'), WS_PATH)
}

/// Opens WebSocket connections to the device
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    channel_capacity: usize,
}

impl WebSocketConnector {
    /// Connector whose per-link channels hold up to `channel_capacity` frames
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            channel_capacity: channel_capacity.max(1),
        }
    }

    async fn write_loop(
        mut write: SplitSink<WsStream, Message>,
        mut outbound: mpsc::Receiver<String>,
        events: mpsc::Sender<TransportEvent>,
    ) {
        while let Some(text) = outbound.recv().await {
            if let Err(e) = write.send(Message::Text(text.into())).await {
                warn!("WebSocket send failed: {}", e);
                let _ = events.send(TransportEvent::Error(e.to_string())).await;
                break;
            }
        }
        // Link dropped or writer failed
        let _ = write.close().await;
        debug!("WebSocket writer finished");
    }

    async fn read_loop(mut read: SplitStream<WsStream>, events: mpsc::Sender<TransportEvent>) {
        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    if events.send(TransportEvent::Message(text.to_string())).await.is_err() {
                        // Link dropped by the session
                        return;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(Message::Binary(data)) => {
                    debug!("Ignoring {} byte binary frame", data.len());
                }
                // Ping/Pong are answered by tungstenite
                Ok(_) => {}
                Err(e) => {
                    warn!("WebSocket receive error: {}", e);
                    let _ = events.send(TransportEvent::Error(e.to_string())).await;
                    break;
                }
            }
        }
        let _ = events.send(TransportEvent::Closed).await;
        debug!("WebSocket reader finished");
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl TransportConnector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<TransportLink> {
        info!("Opening WebSocket connection to {}", url);

        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| BmsLinkError::Transport(format!("Failed to connect to {}: {}", url, e)))?;

        let (write, read) = stream.split();
        let (out_tx, out_rx) = mpsc::channel(self.channel_capacity);
        let (ev_tx, ev_rx) = mpsc::channel(self.channel_capacity);

        tokio::spawn(Self::write_loop(write, out_rx, ev_tx.clone()));
        tokio::spawn(Self::read_loop(read, ev_tx));

        Ok(TransportLink {
            outbound: out_tx,
            inbound: ev_rx,
        })
    }
}
