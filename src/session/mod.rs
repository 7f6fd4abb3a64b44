//! # Session Module
//!
//! One live diagnostic session with one device.
//!
//! A [`Session`] owns the connection manager, the protocol dispatcher and the
//! state engine. It runs as a single task: transport events, timer ticks and
//! requests from [`SessionHandle`]s are processed one at a time, so every
//! merge and history append completes before the next message is looked at.
//!
//! Collaborators plug in at construction time through a [`SessionObserver`];
//! connection status is published on a `watch` channel (most recent wins,
//! late subscribers see only the current value).
//!
//! ```no_run
//! use std::sync::Arc;
//! use bms_link::protocol::command::Command;
//! use bms_link::session::{NullObserver, Session, SessionSettings};
//! use bms_link::timestamp::LocalClock;
//! use bms_link::transport::websocket::WebSocketConnector;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (session, handle) = Session::new(
//!         SessionSettings::default(),
//!         Arc::new(WebSocketConnector::default()),
//!         Arc::new(NullObserver),
//!         Arc::new(LocalClock),
//!     );
//!     let task = tokio::spawn(session.run());
//!
//!     handle.send(Command::ReadStatic).await?;
//!     handle.shutdown().await?;
//!     let report = task.await?;
//!     println!("{} history entries", report.history.len());
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod dispatcher;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

use crate::capability::{CommandEligibility, FeatureSet};
use crate::config::Config;
use crate::error::{BmsLinkError, Result};
use crate::protocol::command::{Command, OutboundCommand};
use crate::protocol::message::FsInfo;
use crate::state::derive::DerivedMetrics;
use crate::state::device::DeviceState;
use crate::state::engine::TelemetryKind;
use crate::state::history::{SessionHistory, SessionHistoryEntry};
use crate::timestamp::TimestampProvider;
use crate::transport::websocket::endpoint_url;
use crate::transport::TransportConnector;

pub use connection::{ConnectionState, ConnectionStatus};
use connection::ConnectionManager;
use dispatcher::Dispatcher;

/// Fixed delay before each reconnect attempt
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(3000);

/// Heartbeat period while connected
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(30_000);

/// Runtime settings for a session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Socket endpoint, e.g. `ws://192.168.4.1/ws`
    pub url: String,
    pub reconnect_delay: Duration,
    pub heartbeat_interval: Duration,
    /// Capacity of the handle request queue
    pub request_capacity: usize,
    /// Drop gated requests the device's feature set does not permit
    pub enforce_capabilities: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            url: endpoint_url("192.168.4.1"),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            request_capacity: 64,
            enforce_capabilities: true,
        }
    }
}

impl SessionSettings {
    /// Settings taken from a loaded configuration
    pub fn from_config(config: &Config) -> Self {
        Self {
            url: endpoint_url(&config.connection.host),
            reconnect_delay: Duration::from_millis(config.connection.reconnect_delay_ms),
            heartbeat_interval: Duration::from_millis(config.connection.heartbeat_interval_ms),
            request_capacity: config.connection.channel_capacity,
            enforce_capabilities: config.session.enforce_capabilities,
        }
    }
}

/// Why an outbound command was not transmitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No open transport
    NotConnected,
    /// Current feature set does not allow it
    NotPermitted,
    /// Transport went away before the frame was handed over
    TransportClosed,
}

/// Human-facing notices produced by the session
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// Device reported success; `key` is a translatable message key
    Success { key: Option<String> },
    /// Device reported failure; `key` is a translatable message key
    DeviceError { key: Option<String> },
    /// Pass-through `info` text
    Info(String),
    /// Pass-through `debug` text
    Debug(String),
    /// Inbound frame could not be decoded and was dropped
    DecodeFailure(String),
    /// One-line summary of a received telemetry batch
    Telemetry { kind: TelemetryKind, summary: String },
    /// Outbound command was dropped
    CommandDropped { command: Command, reason: DropReason },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::Success { key } => write!(f, "OK: {}", key.as_deref().unwrap_or("success")),
            Diagnostic::DeviceError { key } => {
                write!(f, "Error: {}", key.as_deref().unwrap_or("unknown error"))
            }
            Diagnostic::Info(text) => write!(f, "Info: {}", text),
            Diagnostic::Debug(text) => write!(f, "Debug: {}", text),
            Diagnostic::DecodeFailure(reason) => write!(f, "Dropped malformed message: {}", reason),
            Diagnostic::Telemetry { kind, summary } => write!(f, "Received {} [{}]", kind, summary),
            Diagnostic::CommandDropped { command, reason } => match reason {
                DropReason::NotConnected => write!(f, "Not connected, '{}' ignored", command),
                DropReason::NotPermitted => {
                    write!(f, "'{}' is not supported by this battery", command)
                }
                DropReason::TransportClosed => write!(f, "Connection lost, '{}' not sent", command),
            },
        }
    }
}

/// Collaborator callbacks, registered when the session is built
///
/// Every method has an empty default. Each call is isolated: a panic inside
/// one callback is logged and does not stop the others or the session.
pub trait SessionObserver: Send + Sync {
    /// Transport opened; returned commands are sent immediately
    fn on_open(&self) -> Vec<OutboundCommand> {
        Vec::new()
    }

    /// Device state changed after a telemetry batch
    fn on_device_state_changed(
        &self,
        _state: &DeviceState,
        _features: Option<&FeatureSet>,
        _kind: TelemetryKind,
    ) {
    }

    /// A diagnostic line is available
    fn on_diagnostic(&self, _diagnostic: &Diagnostic) {}

    /// All pending command indicators were cleared
    fn on_loading_reset(&self) {}

    /// Device storage usage arrived, unmodified
    fn on_storage_info(&self, _info: FsInfo) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl SessionObserver for NullObserver {}

/// Point-in-time view of the session
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub connection: ConnectionState,
    pub device: DeviceState,
    pub features: Option<FeatureSet>,
    pub eligibility: CommandEligibility,
    pub metrics: DerivedMetrics,
    pub pending: Vec<Command>,
    pub history_len: usize,
}

/// What a finished session leaves behind
#[derive(Debug)]
pub struct SessionReport {
    pub device: DeviceState,
    pub history: SessionHistory,
}

/// Requests from handles to the session task
#[derive(Debug)]
pub(crate) enum Request {
    Send { command: OutboundCommand, gated: bool },
    Snapshot(oneshot::Sender<SessionSnapshot>),
    History(oneshot::Sender<Vec<SessionHistoryEntry>>),
    Shutdown,
}

/// Cloneable handle for talking to a running session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    requests: mpsc::Sender<Request>,
    status: watch::Receiver<ConnectionStatus>,
}

impl SessionHandle {
    async fn submit(&self, request: Request) -> Result<()> {
        self.requests
            .send(request)
            .await
            .map_err(|_| BmsLinkError::SessionClosed)
    }

    /// Send a command if connected, regardless of the feature set
    ///
    /// At most once: if the session is not connected when the request is
    /// processed the command is dropped, never queued for a later connection.
    pub async fn send(&self, command: impl Into<OutboundCommand>) -> Result<()> {
        self.submit(Request::Send {
            command: command.into(),
            gated: false,
        })
        .await
    }

    /// Like [`SessionHandle::send`], but also subject to the capability gate
    pub async fn request(&self, command: impl Into<OutboundCommand>) -> Result<()> {
        self.submit(Request::Send {
            command: command.into(),
            gated: true,
        })
        .await
    }

    /// Current state, metrics and eligibility
    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.submit(Request::Snapshot(tx)).await?;
        rx.await.map_err(|_| BmsLinkError::SessionClosed)
    }

    /// Ordered copy of the session history
    pub async fn history(&self) -> Result<Vec<SessionHistoryEntry>> {
        let (tx, rx) = oneshot::channel();
        self.submit(Request::History(tx)).await?;
        rx.await.map_err(|_| BmsLinkError::SessionClosed)
    }

    /// Tear the session down; cancels any pending reconnect
    pub async fn shutdown(&self) -> Result<()> {
        self.submit(Request::Shutdown).await
    }

    /// Subscribe to connection status changes
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Most recent connection status
    pub fn current_status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }
}

/// A diagnostic session with one device
pub struct Session {
    manager: ConnectionManager,
}

impl Session {
    /// Build a session and the handle used to drive it
    ///
    /// Nothing connects until [`Session::run`] is awaited.
    pub fn new(
        settings: SessionSettings,
        connector: Arc<dyn TransportConnector>,
        observer: Arc<dyn SessionObserver>,
        clock: Arc<dyn TimestampProvider>,
    ) -> (Self, SessionHandle) {
        let (req_tx, req_rx) = mpsc::channel(settings.request_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);

        let dispatcher = Dispatcher::new(Arc::clone(&observer), Arc::clone(&clock));
        let manager = ConnectionManager::new(
            settings, connector, observer, clock, dispatcher, req_rx, status_tx,
        );

        (
            Self { manager },
            SessionHandle {
                requests: req_tx,
                status: status_rx,
            },
        )
    }

    /// Run until shut down (or every handle is dropped)
    ///
    /// Transport failures never end the session; they only trigger a
    /// reconnect.
    pub async fn run(mut self) -> SessionReport {
        self.manager.run().await;
        let engine = self.manager.into_dispatcher().into_engine();
        SessionReport {
            device: engine.device().clone(),
            history: engine.into_history(),
        }
    }
}
