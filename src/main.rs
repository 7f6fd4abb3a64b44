//! # BMS Link
//!
//! Interactive diagnostic session with a battery-management unit.
//!
//! Connects to the device's WebSocket endpoint, keeps the session alive
//! across dropouts, and forwards commands typed on stdin.
//!
//! # Control Flow
//!
//! 1. **Initialization**
//!    - Load configuration (defaults when the file is missing)
//!    - Set up logging with tracing subscriber
//!    - Start the session task
//!
//! 2. **Main Loop**
//!    - Read one command per stdin line
//!    - Print diagnostics and connection changes as they arrive
//!    - Handle Ctrl+C or `quit` for graceful shutdown
//!
//! 3. **Graceful Shutdown**
//!    - Stop the session and cancel any pending reconnect
//!    - Export the session history when `history.export_path` is set
//!
//! # Examples
//!
//! ```bash
//! bms-link --host 192.168.4.1
//! ```
//!
//! ```text
//! INFO bms_link: BMS Link v0.1.0 starting...
//! INFO bms_link::session::connection: Connected to ws://192.168.4.1/ws
//! > read_static
//! Received static_data [model: BL1860B, serial: ..., cycles: 50, lock_status: 0]
//! ```

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use bms_link::capability::FeatureSet;
use bms_link::config::Config;
use bms_link::error::BmsLinkError;
use bms_link::protocol::command::{Command, OutboundCommand};
use bms_link::protocol::message::FsInfo;
use bms_link::session::{
    Diagnostic, Session, SessionHandle, SessionObserver, SessionSettings, SessionSnapshot,
};
use bms_link::state::derive::{
    cell_fill_percent, classify_cell, CellLevel, CellReport, CELL_PRESENT_THRESHOLD_V,
};
use bms_link::state::device::DeviceState;
use bms_link::state::engine::TelemetryKind;
use bms_link::telemetry::export::export_to_file;
use bms_link::timestamp::LocalClock;
use bms_link::transport::websocket::WebSocketConnector;

/// Default configuration file location
const DEFAULT_CONFIG_PATH: &str = "config/bms-link.toml";

/// Log file name prefix inside `logging.log_dir`
const LOG_FILE_PREFIX: &str = "bms-link.log";

#[derive(Debug, Parser)]
#[command(name = "bms-link", version, about = "Live diagnostic session with a BMS over WebSocket")]
struct Args {
    /// Configuration file; missing files fall back to the defaults
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Device host, overriding `connection.host`
    #[arg(long)]
    host: Option<String>,
}

/// One parsed line of console input
#[derive(Debug, Clone, PartialEq)]
enum ConsoleInput {
    Send(OutboundCommand),
    Status,
    Quit,
    Blank,
}

/// Parse a console line into an action
fn parse_line(line: &str) -> std::result::Result<ConsoleInput, BmsLinkError> {
    let mut words = line.split_whitespace();
    let Some(first) = words.next() else {
        return Ok(ConsoleInput::Blank);
    };

    match (first, words.next()) {
        ("quit" | "exit", None) => Ok(ConsoleInput::Quit),
        ("status", None) => Ok(ConsoleInput::Status),
        ("set_logging", Some("on")) => Ok(ConsoleInput::Send(OutboundCommand::set_logging(true))),
        ("set_logging", Some("off")) => Ok(ConsoleInput::Send(OutboundCommand::set_logging(false))),
        ("set_logging", _) => Err(BmsLinkError::UnknownCommand(
            "set_logging expects 'on' or 'off'".to_string(),
        )),
        (name, None) => {
            let command: Command = name.parse()?;
            if command == Command::Ping {
                // Heartbeat is owned by the session
                return Err(BmsLinkError::UnknownCommand(name.to_string()));
            }
            Ok(ConsoleInput::Send(command.into()))
        }
        (_, Some(_)) => Err(BmsLinkError::UnknownCommand(line.trim().to_string())),
    }
}

/// Prints session events to the console
struct ConsoleObserver {
    open_commands: Vec<OutboundCommand>,
}

impl SessionObserver for ConsoleObserver {
    fn on_open(&self) -> Vec<OutboundCommand> {
        self.open_commands.clone()
    }

    fn on_device_state_changed(
        &self,
        state: &DeviceState,
        _features: Option<&FeatureSet>,
        kind: TelemetryKind,
    ) {
        if kind == TelemetryKind::Dynamic {
            if let Some(pack) = state.pack_voltage {
                println!("Pack voltage: {:.2}V", pack);
            }
        }
    }

    fn on_diagnostic(&self, diagnostic: &Diagnostic) {
        println!("{}", diagnostic);
    }

    fn on_storage_info(&self, info: FsInfo) {
        println!("Device storage: {} / {} bytes used", info.used, info.total);
    }
}

/// One status line for cell `index` (zero-based)
fn cell_line(index: usize, voltage: f64) -> String {
    if voltage <= CELL_PRESENT_THRESHOLD_V {
        return format!("  Cell {}:     empty", index + 1);
    }
    let level = match classify_cell(voltage) {
        CellLevel::Normal => "",
        CellLevel::Low => " (low)",
        CellLevel::Critical => " (critical)",
    };
    format!(
        "  Cell {}:     {:.3}V {:>3.0}%{}",
        index + 1,
        voltage,
        cell_fill_percent(voltage),
        level
    )
}

fn print_status(snapshot: &SessionSnapshot) {
    let metrics = &snapshot.metrics;
    println!("Connection:   {:?}", snapshot.connection);
    println!(
        "Battery:      {} ({})",
        snapshot.device.model.as_deref().unwrap_or("unknown"),
        snapshot.device.serial.as_deref().unwrap_or("no serial")
    );
    println!("Health:       {}% ({:?})", metrics.health_score, metrics.health_band);
    println!("Lock:         {:?}", metrics.lock);
    match &metrics.cells {
        CellReport::NoData => println!("Cells:        no data"),
        CellReport::Unpopulated => println!("Cells:        not populated"),
        CellReport::Summary(cells) => println!(
            "Cells:        {} populated, {:.2}V total, {:.3}V spread{}",
            cells.populated,
            cells.total,
            cells.spread,
            if cells.imbalanced { " (imbalanced)" } else { "" }
        ),
    }
    if let Some(voltages) = &snapshot.device.cell_voltages {
        for (index, &voltage) in voltages.iter().enumerate() {
            println!("{}", cell_line(index, voltage));
        }
    }
    let allowed: Vec<&str> = snapshot
        .eligibility
        .permitted()
        .iter()
        .filter(|c| **c != Command::Ping)
        .map(|c| c.as_str())
        .collect();
    println!("Commands:     {}", allowed.join(", "));
    if !snapshot.pending.is_empty() {
        let pending: Vec<&str> = snapshot.pending.iter().map(|c| c.as_str()).collect();
        println!("Pending:      {}", pending.join(", "));
    }
    println!("History:      {} entries", snapshot.history_len);
}

/// Install console logging, plus a daily file when `logging.log_dir` is set
///
/// `RUST_LOG` takes precedence over the configured level. The returned guard
/// must live as long as file logging is wanted.
fn init_logging(config: &Config) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let (file_layer, guard) = match config.log_dir() {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    guard
}

async fn handle_line(handle: &SessionHandle, line: &str) -> Result<bool> {
    match parse_line(line) {
        Ok(ConsoleInput::Quit) => return Ok(false),
        Ok(ConsoleInput::Status) => print_status(&handle.snapshot().await?),
        Ok(ConsoleInput::Send(command)) => handle.request(command).await?,
        Ok(ConsoleInput::Blank) => {}
        Err(e) => println!("{}", e),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load_or_default(&args.config)?;
    if let Some(host) = args.host {
        config.connection.host = host;
        config.validate()?;
    }

    let _log_guard = init_logging(&config);
    info!("BMS Link v{} starting...", env!("CARGO_PKG_VERSION"));

    let observer = Arc::new(ConsoleObserver {
        open_commands: config.open_commands(),
    });
    let (session, handle) = Session::new(
        SessionSettings::from_config(&config),
        Arc::new(WebSocketConnector::new(config.connection.channel_capacity)),
        observer,
        Arc::new(LocalClock),
    );
    let session_task = tokio::spawn(session.run());

    let mut status = handle.status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            println!("[{}]", current);
        }
    });

    info!("Type a command (read_static, read_dynamic, status, quit, ...)");
    info!("Press Ctrl+C to exit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if !handle_line(&handle, &line).await? {
                        break;
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },

            // Handle Ctrl+C for graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    handle.shutdown().await?;
    let report = session_task.await?;
    info!("Session ended with {} history entries", report.history.len());

    if let Some(path) = config.export_path() {
        export_to_file(&path, report.history.entries())?;
    }

    Ok(())
}
