//! # Protocol Dispatcher
//!
//! Decodes each inbound frame, classifies it and routes it:
//!
//! | Type | Effect |
//! |------|--------|
//! | `presence`, `pong` | none (liveness only, logged at trace) |
//! | `success`, `error` | reset pending indicators, report the message key |
//! | `info`, `debug` | pass the text through as a diagnostic |
//! | `fs_info` | hand storage usage to the observer unmodified |
//! | `static_data`, `dynamic_data` | reset pending, merge, replace features, append history (dynamic only) |
//!
//! Responses are not correlated with requests: any `success`, `error` or
//! telemetry batch clears every pending indicator.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

use super::{Diagnostic, SessionObserver};
use crate::protocol::command::Command;
use crate::protocol::message::{InboundMessage, TelemetryBatch};
use crate::state::device::DeviceState;
use crate::state::engine::{StateEngine, TelemetryKind};
use crate::timestamp::TimestampProvider;

/// Commands awaiting any response
#[derive(Debug, Default, Clone)]
pub struct PendingCommands {
    commands: Vec<Command>,
}

impl PendingCommands {
    /// Mark `command` as pending if it shows a loading indicator
    pub fn mark(&mut self, command: Command) {
        if command.shows_loading() && !self.commands.contains(&command) {
            self.commands.push(command);
        }
    }

    /// Clear everything; returns what was pending
    pub fn reset_all(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }

    pub fn is_pending(&self, command: Command) -> bool {
        self.commands.contains(&command)
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn to_vec(&self) -> Vec<Command> {
        self.commands.clone()
    }
}

/// How one inbound frame was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// `presence` / `pong`
    Ignored,
    /// `success` / `error`
    Feedback,
    /// `info` / `debug`
    Diagnostic,
    /// `fs_info`
    Storage,
    /// Telemetry merged into the device state
    StateUpdated(TelemetryKind),
    /// Not decodable; dropped
    Rejected,
}

/// Run one observer stage behind its own failure boundary
fn isolate(stage: &'static str, f: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("Observer stage '{}' panicked; continuing", stage);
    }
}

/// Routes decoded messages into the state engine and out to the observer
pub struct Dispatcher {
    engine: StateEngine,
    pending: PendingCommands,
    observer: Arc<dyn SessionObserver>,
    clock: Arc<dyn TimestampProvider>,
}

impl Dispatcher {
    pub fn new(observer: Arc<dyn SessionObserver>, clock: Arc<dyn TimestampProvider>) -> Self {
        Self {
            engine: StateEngine::new(),
            pending: PendingCommands::default(),
            observer,
            clock,
        }
    }

    /// Process one inbound text frame
    ///
    /// Never fails: malformed input is reported as a diagnostic and leaves
    /// the device state untouched.
    pub fn dispatch(&mut self, text: &str) -> DispatchOutcome {
        let message = match InboundMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping inbound message: {}", e);
                self.reset_pending();
                self.emit(Diagnostic::DecodeFailure(e.to_string()));
                return DispatchOutcome::Rejected;
            }
        };

        match message {
            InboundMessage::Presence { present } => {
                trace!("presence: {:?}", present);
                DispatchOutcome::Ignored
            }
            InboundMessage::Pong => {
                trace!("pong");
                DispatchOutcome::Ignored
            }
            InboundMessage::Success { message } => {
                info!("Device success: {}", message.as_deref().unwrap_or("-"));
                self.reset_pending();
                self.emit(Diagnostic::Success { key: message });
                DispatchOutcome::Feedback
            }
            InboundMessage::Error { message } => {
                warn!("Device error: {}", message.as_deref().unwrap_or("-"));
                self.reset_pending();
                self.emit(Diagnostic::DeviceError { key: message });
                DispatchOutcome::Feedback
            }
            InboundMessage::Info { message } => {
                self.emit(Diagnostic::Info(message.unwrap_or_default()));
                DispatchOutcome::Diagnostic
            }
            InboundMessage::Debug { message } => {
                self.emit(Diagnostic::Debug(message.unwrap_or_default()));
                DispatchOutcome::Diagnostic
            }
            InboundMessage::FsInfo(fs) => {
                debug!("Storage: {} / {} bytes", fs.used, fs.total);
                let observer = Arc::clone(&self.observer);
                isolate("storage", || observer.on_storage_info(fs));
                DispatchOutcome::Storage
            }
            InboundMessage::StaticData(batch) => self.apply(TelemetryKind::Static, batch),
            InboundMessage::DynamicData(batch) => self.apply(TelemetryKind::Dynamic, batch),
        }
    }

    fn apply(&mut self, kind: TelemetryKind, batch: TelemetryBatch) -> DispatchOutcome {
        self.reset_pending();

        let summary = match kind {
            TelemetryKind::Static => static_summary(&batch.data),
            TelemetryKind::Dynamic => dynamic_summary(&batch.data),
        };

        self.engine
            .apply_telemetry(kind, &batch.data, batch.features, self.clock.as_ref());
        debug!("Merged {} ({} history entries)", kind, self.engine.history().len());

        let observer = Arc::clone(&self.observer);
        let engine = &self.engine;
        isolate("state", || {
            observer.on_device_state_changed(engine.device(), engine.features(), kind)
        });
        self.emit(Diagnostic::Telemetry { kind, summary });

        DispatchOutcome::StateUpdated(kind)
    }

    /// Record that `command` was transmitted
    pub fn note_sent(&mut self, command: Command) {
        self.pending.mark(command);
    }

    /// Report a diagnostic to the observer
    pub fn emit(&self, diagnostic: Diagnostic) {
        let observer = Arc::clone(&self.observer);
        isolate("diagnostic", || observer.on_diagnostic(&diagnostic));
    }

    fn reset_pending(&mut self) {
        let cleared = self.pending.reset_all();
        if !cleared.is_empty() {
            debug!("Cleared pending: {:?}", cleared);
        }
        let observer = Arc::clone(&self.observer);
        isolate("loading", || observer.on_loading_reset());
    }

    pub fn engine(&self) -> &StateEngine {
        &self.engine
    }

    pub fn pending(&self) -> &PendingCommands {
        &self.pending
    }

    pub fn into_engine(self) -> StateEngine {
        self.engine
    }
}

fn text_or_unknown(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("unknown")
}

fn num_or_dash<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "--".to_string())
}

fn static_summary(data: &DeviceState) -> String {
    format!(
        "model: {}, serial: {}, rom_id: {}, capacity: {}, prod_date: {}, cycles: {}, lock_status: {}",
        text_or_unknown(&data.model),
        text_or_unknown(&data.serial),
        text_or_unknown(&data.rom_id),
        text_or_unknown(&data.capacity),
        text_or_unknown(&data.prod_date),
        data.charge_cycles.unwrap_or(0),
        num_or_dash(data.lock_status),
    )
}

fn dynamic_summary(data: &DeviceState) -> String {
    let v1 = data
        .cell_voltages
        .as_ref()
        .and_then(|cells| cells.first())
        .map(|v| format!("{:.2}V", v))
        .unwrap_or_else(|| "--".to_string());
    let temp = |t: Option<f64>| {
        t.map(|t| format!("{:.1}°C", t))
            .unwrap_or_else(|| "--".to_string())
    };
    let errors = [data.err_cnt_04, data.err_cnt_05, data.err_cnt_06, data.err_cnt_07]
        .iter()
        .map(|e| e.map(|e| e.to_string()).unwrap_or_else(|| "-".to_string()))
        .collect::<Vec<_>>()
        .join(",");

    format!(
        "V1={}, T1={}, T2={}, T3={}, OD={}, OL={}, Err=[{}], Fuse={}",
        v1,
        temp(data.temp1),
        temp(data.temp2),
        temp(data.temp3),
        num_or_dash(data.over_discharge),
        num_or_dash(data.over_load),
        errors,
        if data.fuse_blown == Some(true) { "YES" } else { "NO" },
    )
}
