//! # Connection Manager
//!
//! Lifecycle of the single device connection:
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──open──▶ Connected
//!      ▲                          │                    │
//!      └────── reconnect delay ◀──┴── failure/close ◀──┘
//! ```
//!
//! The cycle has no terminal state; only a shutdown request (or every handle
//! being dropped) ends it. Reconnects use a fixed delay, not backoff.
//!
//! While connected a heartbeat `ping` is sent every heartbeat interval. The
//! heartbeat timer lives inside the connected phase and is dropped in the
//! same step as the transition out of it, so it can never fire on a closed
//! transport.
//!
//! Sends are at-most-once: a command requested while not connected is
//! reported and dropped, never buffered for the next connection.

use serde::Serialize;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::dispatcher::Dispatcher;
use super::{Diagnostic, DropReason, Request, SessionObserver, SessionSettings, SessionSnapshot};
use crate::protocol::command::{Command, CommandEnvelope, OutboundCommand};
use crate::timestamp::TimestampProvider;
use crate::transport::{TransportConnector, TransportEvent, TransportLink};

/// Lifecycle state of the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Status notification published to collaborators
///
/// Mirrors [`ConnectionState`] plus a transient `Error` signal; an error
/// does not change the state by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl From<ConnectionState> for ConnectionStatus {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Disconnected => ConnectionStatus::Disconnected,
            ConnectionState::Connecting => ConnectionStatus::Connecting,
            ConnectionState::Connected => ConnectionStatus::Connected,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Whether the session loop keeps going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

/// Result of one connect attempt
enum Opening {
    Opened(TransportLink),
    Failed,
    Shutdown,
}

/// Owns the transport, heartbeat and reconnect timer
pub struct ConnectionManager {
    settings: SessionSettings,
    connector: Arc<dyn TransportConnector>,
    observer: Arc<dyn SessionObserver>,
    clock: Arc<dyn TimestampProvider>,
    dispatcher: Dispatcher,
    requests: mpsc::Receiver<Request>,
    status: watch::Sender<ConnectionStatus>,
    state: ConnectionState,
}

impl ConnectionManager {
    pub(crate) fn new(
        settings: SessionSettings,
        connector: Arc<dyn TransportConnector>,
        observer: Arc<dyn SessionObserver>,
        clock: Arc<dyn TimestampProvider>,
        dispatcher: Dispatcher,
        requests: mpsc::Receiver<Request>,
        status: watch::Sender<ConnectionStatus>,
    ) -> Self {
        Self {
            settings,
            connector,
            observer,
            clock,
            dispatcher,
            requests,
            status,
            state: ConnectionState::Disconnected,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn into_dispatcher(self) -> Dispatcher {
        self.dispatcher
    }

    /// Connect, serve, and reconnect until shut down
    pub async fn run(&mut self) {
        info!("Session starting against {}", self.settings.url);

        loop {
            match self.open().await {
                Opening::Opened(link) => {
                    if self.serve(link).await == Flow::Shutdown {
                        break;
                    }
                }
                Opening::Failed => self.transition(ConnectionState::Disconnected),
                Opening::Shutdown => {
                    self.transition(ConnectionState::Disconnected);
                    break;
                }
            }

            if self.wait_reconnect().await == Flow::Shutdown {
                break;
            }
        }

        info!("Session stopped");
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!("Connection {:?} -> {:?}", self.state, next);
        }
        self.state = next;
        self.status.send_replace(next.into());
    }

    fn signal_error(&self) {
        self.status.send_replace(ConnectionStatus::Error);
    }

    async fn open(&mut self) -> Opening {
        self.transition(ConnectionState::Connecting);

        let connector = Arc::clone(&self.connector);
        let url = self.settings.url.clone();
        let attempt = connector.connect(&url);
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                result = &mut attempt => {
                    return match result {
                        Ok(link) => Opening::Opened(link),
                        Err(e) => {
                            warn!("Connection attempt failed: {}", e);
                            self.signal_error();
                            Opening::Failed
                        }
                    };
                }
                request = self.requests.recv() => {
                    if self.handle_request(request, None).await == Flow::Shutdown {
                        return Opening::Shutdown;
                    }
                }
            }
        }
    }

    async fn serve(&mut self, mut link: TransportLink) -> Flow {
        self.transition(ConnectionState::Connected);
        info!("Connected to {}", self.settings.url);

        let observer = Arc::clone(&self.observer);
        let open_commands = panic::catch_unwind(AssertUnwindSafe(|| observer.on_open()))
            .unwrap_or_else(|_| {
                warn!("Open callback panicked");
                Vec::new()
            });
        for command in open_commands {
            self.transmit(&link.outbound, command).await;
        }

        let period = self.settings.heartbeat_interval;
        let mut heartbeat = time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("Heartbeat started ({:?})", period);

        let flow = loop {
            // Inbound first so device data is applied before queued requests
            tokio::select! {
                biased;

                event = link.inbound.recv() => match event {
                    Some(TransportEvent::Message(text)) => {
                        self.dispatcher.dispatch(&text);
                    }
                    Some(TransportEvent::Error(e)) => {
                        warn!("Transport error: {}", e);
                        self.signal_error();
                    }
                    Some(TransportEvent::Closed) | None => break Flow::Continue,
                },
                _ = heartbeat.tick() => {
                    debug!("Heartbeat");
                    self.transmit(&link.outbound, OutboundCommand::new(Command::Ping)).await;
                }
                request = self.requests.recv() => {
                    if self.handle_request(request, Some(&link.outbound)).await == Flow::Shutdown {
                        break Flow::Shutdown;
                    }
                }
            }
        };

        drop(heartbeat);
        debug!("Heartbeat stopped");
        drop(link);
        self.transition(ConnectionState::Disconnected);
        if flow == Flow::Continue {
            info!("Connection closed");
        }
        flow
    }

    async fn wait_reconnect(&mut self) -> Flow {
        info!("Reconnecting in {:?}", self.settings.reconnect_delay);
        let delay = time::sleep(self.settings.reconnect_delay);
        tokio::pin!(delay);

        loop {
            tokio::select! {
                _ = &mut delay => return Flow::Continue,
                request = self.requests.recv() => {
                    if self.handle_request(request, None).await == Flow::Shutdown {
                        return Flow::Shutdown;
                    }
                }
            }
        }
    }

    /// Handle one handle request; `outbound` is present only while connected
    async fn handle_request(
        &mut self,
        request: Option<Request>,
        outbound: Option<&mpsc::Sender<String>>,
    ) -> Flow {
        match request {
            Some(Request::Send { command, gated }) => {
                if gated
                    && self.settings.enforce_capabilities
                    && !self.dispatcher.engine().eligibility().permits(command.command)
                {
                    self.drop_command(command.command, DropReason::NotPermitted);
                    return Flow::Continue;
                }
                match outbound {
                    Some(outbound) => self.transmit(outbound, command).await,
                    None => self.drop_command(command.command, DropReason::NotConnected),
                }
                Flow::Continue
            }
            Some(Request::Snapshot(reply)) => {
                let _ = reply.send(self.snapshot());
                Flow::Continue
            }
            Some(Request::History(reply)) => {
                let _ = reply.send(self.dispatcher.engine().history().entries().to_vec());
                Flow::Continue
            }
            Some(Request::Shutdown) | None => {
                info!("Shutdown requested");
                Flow::Shutdown
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        let engine = self.dispatcher.engine();
        SessionSnapshot {
            connection: self.state,
            device: engine.device().clone(),
            features: engine.features().cloned(),
            eligibility: engine.eligibility(),
            metrics: engine.metrics(),
            pending: self.dispatcher.pending().to_vec(),
            history_len: engine.history().len(),
        }
    }

    fn drop_command(&self, command: Command, reason: DropReason) {
        warn!("Command '{}' dropped: {:?}", command, reason);
        self.dispatcher
            .emit(Diagnostic::CommandDropped { command, reason });
    }

    /// Stamp, serialize and hand one command to the transport
    async fn transmit(&mut self, outbound: &mpsc::Sender<String>, command: OutboundCommand) {
        let id = command.command;
        let envelope = CommandEnvelope::new(id, self.clock.timestamp(), command.payload);

        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode '{}': {}", id, e);
                return;
            }
        };

        if outbound.send(text).await.is_err() {
            self.drop_command(id, DropReason::TransportClosed);
            return;
        }

        debug!("Sent '{}'", id);
        self.dispatcher.note_sent(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::{FixedClock, Observed, RecordingObserver};
    use crate::session::{NullObserver, Session, SessionHandle, SessionReport};
    use crate::transport::mocks::{ConnectBehavior, MockConnector, MockConnectorProbe, MockPeer};
    use serde_json::Value;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    fn start(
        script: Vec<ConnectBehavior>,
        fallback: ConnectBehavior,
        observer: Arc<dyn SessionObserver>,
    ) -> (SessionHandle, MockConnectorProbe, JoinHandle<SessionReport>) {
        let (connector, probe) = MockConnector::new(script, fallback);
        let (session, handle) = Session::new(
            SessionSettings::default(),
            Arc::new(connector),
            observer,
            Arc::new(FixedClock("2026/10/18 12:00:00")),
        );
        (handle, probe, tokio::spawn(session.run()))
    }

    fn command_of(frame: &str) -> String {
        let value: Value = serde_json::from_str(frame).unwrap();
        value["command"].as_str().unwrap().to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_every_fixed_delay() {
        let (handle, mut probe, task) =
            start(vec![], ConnectBehavior::AcceptThenClose, Arc::new(NullObserver));

        let mut attempts = Vec::new();
        for _ in 0..6 {
            let (at, url) = probe.attempts.recv().await.unwrap();
            assert_eq!(url, "ws://192.168.4.1/ws");
            attempts.push(at);
        }

        for pair in attempts.windows(2) {
            assert_eq!(
                pair[1] - pair[0],
                Duration::from_millis(3000),
                "Reconnect interval must stay at exactly 3000 ms"
            );
        }

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_connections_keep_retrying() {
        let (handle, mut probe, task) = start(vec![], ConnectBehavior::Refuse, Arc::new(NullObserver));

        let (first, _) = probe.attempts.recv().await.unwrap();
        let (second, _) = probe.attempts.recv().await.unwrap();
        let (third, _) = probe.attempts.recv().await.unwrap();
        assert_eq!(second - first, Duration::from_millis(3000));
        assert_eq!(third - second, Duration::from_millis(3000));

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_only_while_connected() {
        let (handle, mut probe, task) =
            start(vec![ConnectBehavior::Accept], ConnectBehavior::Refuse, Arc::new(NullObserver));

        let (opened_at, _) = probe.attempts.recv().await.unwrap();
        let mut peer = probe.peers.recv().await.unwrap();

        let first = peer.sent.recv().await.unwrap();
        assert_eq!(command_of(&first), "ping");
        assert_eq!(Instant::now() - opened_at, Duration::from_millis(30_000));

        let second = peer.sent.recv().await.unwrap();
        assert_eq!(command_of(&second), "ping");
        assert_eq!(Instant::now() - opened_at, Duration::from_millis(60_000));

        peer.events.send(TransportEvent::Closed).await.unwrap();

        // The link is dropped together with the heartbeat: nothing more arrives
        assert!(peer.sent.recv().await.is_none(), "No heartbeat may fire after close");

        let mut status = handle.status();
        status
            .wait_for(|s| *s != ConnectionStatus::Connected)
            .await
            .unwrap();

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_callback_commands_are_sent() {
        let observer = Arc::new(RecordingObserver::with_open_commands(vec![
            OutboundCommand::new(Command::GetFsInfo),
        ]));
        let (handle, mut probe, task) =
            start(vec![ConnectBehavior::Accept], ConnectBehavior::Refuse, observer);

        let mut peer = probe.peers.recv().await.unwrap();
        let frame = peer.sent.recv().await.unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["command"], "get_fs_info");
        assert_eq!(value["timestamp"], "2026/10/18 12:00:00");

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_disconnected_is_dropped_not_queued() {
        let observer = Arc::new(RecordingObserver::default());
        let (handle, mut probe, task) = start(
            vec![ConnectBehavior::Refuse, ConnectBehavior::Accept],
            ConnectBehavior::Refuse,
            observer.clone(),
        );

        probe.attempts.recv().await.unwrap();
        handle.send(Command::ReadStatic).await.unwrap();

        let mut peer = probe.peers.recv().await.unwrap();
        let mut status = handle.status();
        status
            .wait_for(|s| *s == ConnectionStatus::Connected)
            .await
            .unwrap();

        handle.send(Command::ReadDynamic).await.unwrap();
        let frame = peer.sent.recv().await.unwrap();
        assert_eq!(command_of(&frame), "read_dynamic", "Earlier command must not be replayed");

        assert!(observer.diagnostics().contains(&Diagnostic::CommandDropped {
            command: Command::ReadStatic,
            reason: DropReason::NotConnected,
        }));

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_after_transport_gone_is_reported() {
        let observer = Arc::new(RecordingObserver::default());
        let (handle, mut probe, task) =
            start(vec![ConnectBehavior::Accept], ConnectBehavior::Refuse, observer.clone());

        let MockPeer { sent, events } = probe.peers.recv().await.unwrap();
        let mut status = handle.status();
        status.wait_for(|s| *s == ConnectionStatus::Connected).await.unwrap();

        // Writer side gone while inbound is still open
        drop(sent);
        handle.send(Command::ReadStatic).await.unwrap();

        let snapshot = handle.snapshot().await.unwrap();
        assert!(snapshot.pending.is_empty(), "Unsent command must not stay pending");
        assert!(observer.diagnostics().contains(&Diagnostic::CommandDropped {
            command: Command::ReadStatic,
            reason: DropReason::TransportClosed,
        }));

        drop(events);
        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_gated_request_respects_features() {
        let observer = Arc::new(RecordingObserver::default());
        let (handle, mut probe, task) =
            start(vec![ConnectBehavior::Accept], ConnectBehavior::Refuse, observer.clone());

        let mut peer = probe.peers.recv().await.unwrap();

        // No feature set yet: led_on is gated, read_static is not
        handle.request(Command::LedOn).await.unwrap();
        handle.request(Command::ReadStatic).await.unwrap();
        assert_eq!(command_of(&peer.sent.recv().await.unwrap()), "read_static");

        peer.events
            .send(TransportEvent::Message(
                r#"{"type":"static_data","data":{"model":"BL1850B"},"features":{"led_test":true}}"#
                    .to_string(),
            ))
            .await
            .unwrap();

        handle.request(Command::LedOn).await.unwrap();
        assert_eq!(command_of(&peer.sent.recv().await.unwrap()), "led_on");

        assert!(observer.diagnostics().contains(&Diagnostic::CommandDropped {
            command: Command::LedOn,
            reason: DropReason::NotPermitted,
        }));

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_flow_into_state_and_history() {
        let observer = Arc::new(RecordingObserver::default());
        let (handle, mut probe, task) =
            start(vec![ConnectBehavior::Accept], ConnectBehavior::Refuse, observer.clone());

        let peer = probe.peers.recv().await.unwrap();
        for text in [
            r#"{"type":"static_data","data":{"model":"BL1860B","charge_cycles":50,"lock_status":0}}"#,
            r#"{"type":"pong"}"#,
            r#"{"type":"dynamic_data","data":{"cell_voltages":[4.1,4.08,4.12,4.09,4.10]}}"#,
        ] {
            peer.events
                .send(TransportEvent::Message(text.to_string()))
                .await
                .unwrap();
        }

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.connection, ConnectionState::Connected);
        assert_eq!(snapshot.device.model.as_deref(), Some("BL1860B"));
        assert_eq!(snapshot.metrics.health_score, 98);
        assert_eq!(snapshot.history_len, 1);

        let history = handle.history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].timestamp(), "2026/10/18 12:00:00");

        handle.shutdown().await.unwrap();
        let report = task.await.unwrap();
        assert_eq!(report.history.len(), 1);
        assert_eq!(report.device.charge_cycles, Some(50));
        assert_eq!(
            observer.count(|e| matches!(e, Observed::StateChanged { .. })),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_signals_without_disconnect() {
        let (handle, mut probe, task) =
            start(vec![ConnectBehavior::Accept], ConnectBehavior::Refuse, Arc::new(NullObserver));

        let peer = probe.peers.recv().await.unwrap();
        let mut status = handle.status();
        status.wait_for(|s| *s == ConnectionStatus::Connected).await.unwrap();

        peer.events
            .send(TransportEvent::Error("frame too large".to_string()))
            .await
            .unwrap();
        status.wait_for(|s| *s == ConnectionStatus::Error).await.unwrap();

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.connection, ConnectionState::Connected);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert_eq!(handle.current_status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_reconnect() {
        let (handle, mut probe, task) = start(vec![], ConnectBehavior::Refuse, Arc::new(NullObserver));

        let (first, _) = probe.attempts.recv().await.unwrap();
        handle.shutdown().await.unwrap();
        task.await.unwrap();

        assert_eq!(Instant::now() - first, Duration::ZERO, "Shutdown must not wait out the delay");
        assert!(probe.attempts.try_recv().is_err(), "No attempt after shutdown");
    }
}
