//! # Transport Module
//!
//! Abstraction over the persistent text-message connection to the device,
//! so the connection manager can be driven by a real WebSocket or by an
//! in-memory peer in tests.
//!
//! A successful [`TransportConnector::connect`] is the transport-open event.
//! After that, everything the transport has to say arrives as a
//! [`TransportEvent`] on the link's inbound channel, in order.

pub mod websocket;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Event delivered by an open transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One complete text frame
    Message(String),
    /// Transport-level error; a `Closed` normally follows
    Error(String),
    /// Connection closed, for any reason
    Closed,
}

/// Both directions of one open connection
///
/// Dropping the link closes the connection.
#[derive(Debug)]
pub struct TransportLink {
    /// Text frames to transmit
    pub outbound: mpsc::Sender<String>,
    /// Events from the peer
    pub inbound: mpsc::Receiver<TransportEvent>,
}

/// Factory that opens new connections to the device
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Open a connection to `url`
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::BmsLinkError::Transport`] if the connection
    /// cannot be established.
    async fn connect(&self, url: &str) -> Result<TransportLink>;
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use crate::error::BmsLinkError;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Test-side end of one mock connection
    pub struct MockPeer {
        /// Frames the client transmitted
        pub sent: mpsc::Receiver<String>,
        /// Inject events as if from the device
        pub events: mpsc::Sender<TransportEvent>,
    }

    /// How the mock answers one connect attempt
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ConnectBehavior {
        /// Open and hand the peer to the test
        Accept,
        /// Open and close straight away
        AcceptThenClose,
        /// Fail to open
        Refuse,
    }

    /// Mock connector recording every attempt
    pub struct MockConnector {
        script: Mutex<VecDeque<ConnectBehavior>>,
        fallback: ConnectBehavior,
        attempts: mpsc::UnboundedSender<(Instant, String)>,
        peers: mpsc::UnboundedSender<MockPeer>,
    }

    /// Receivers the test uses to observe a [`MockConnector`]
    pub struct MockConnectorProbe {
        pub attempts: mpsc::UnboundedReceiver<(Instant, String)>,
        pub peers: mpsc::UnboundedReceiver<MockPeer>,
    }

    impl MockConnector {
        /// Connector that plays `script` in order, then `fallback` forever
        pub fn new(
            script: Vec<ConnectBehavior>,
            fallback: ConnectBehavior,
        ) -> (Self, MockConnectorProbe) {
            let (attempts_tx, attempts_rx) = mpsc::unbounded_channel();
            let (peers_tx, peers_rx) = mpsc::unbounded_channel();
            (
                Self {
                    script: Mutex::new(script.into()),
                    fallback,
                    attempts: attempts_tx,
                    peers: peers_tx,
                },
                MockConnectorProbe {
                    attempts: attempts_rx,
                    peers: peers_rx,
                },
            )
        }
    }

    #[async_trait]
    impl TransportConnector for MockConnector {
        async fn connect(&self, url: &str) -> Result<TransportLink> {
            let _ = self.attempts.send((Instant::now(), url.to_string()));

            let behavior = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(self.fallback);

            if behavior == ConnectBehavior::Refuse {
                return Err(BmsLinkError::Transport("Mock refused connection".to_string()));
            }

            let (out_tx, out_rx) = mpsc::channel(64);
            let (ev_tx, ev_rx) = mpsc::channel(64);

            if behavior == ConnectBehavior::AcceptThenClose {
                ev_tx.send(TransportEvent::Closed).await.unwrap();
            }

            let _ = self.peers.send(MockPeer {
                sent: out_rx,
                events: ev_tx,
            });

            Ok(TransportLink {
                outbound: out_tx,
                inbound: ev_rx,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mocks::*;
    use super::*;

    #[tokio::test]
    async fn test_mock_connector_follows_script() {
        let (connector, mut probe) = MockConnector::new(
            vec![ConnectBehavior::Refuse, ConnectBehavior::Accept],
            ConnectBehavior::AcceptThenClose,
        );

        assert!(connector.connect("ws://a/ws").await.is_err());

        let mut link = connector.connect("ws://a/ws").await.unwrap();
        let mut peer = probe.peers.recv().await.unwrap();
        link.outbound.send("hello".to_string()).await.unwrap();
        assert_eq!(peer.sent.recv().await.unwrap(), "hello");
        peer.events.send(TransportEvent::Message("hi".to_string())).await.unwrap();
        assert_eq!(link.inbound.recv().await.unwrap(), TransportEvent::Message("hi".to_string()));

        let mut link = connector.connect("ws://a/ws").await.unwrap();
        assert_eq!(link.inbound.recv().await.unwrap(), TransportEvent::Closed);

        let (_, url) = probe.attempts.recv().await.unwrap();
        assert_eq!(url, "ws://a/ws");
    }
}
