//! # History Export
//!
//! Replays session history into flat [`ExportRecord`]s and writes them as
//! JSON Lines, one record per line.
//!
//! Metrics are recomputed from each entry's raw state at export time, so an
//! export always reflects the current derivation formulas.

use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

use crate::error::Result;
use crate::state::history::SessionHistoryEntry;

/// Number of cell columns in an export record
pub const EXPORT_CELL_COUNT: usize = 5;

/// One exported history row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportRecord {
    pub timestamp: String,
    pub model: Option<String>,
    pub serial: Option<String>,
    pub rom_id: Option<String>,
    pub capacity: Option<String>,
    pub prod_date: Option<String>,
    pub pack_voltage: Option<f64>,
    /// First five cells; missing readings are 0
    pub cells: [f64; EXPORT_CELL_COUNT],
    /// Device-reported spread, else the derived one
    pub cell_diff: Option<f64>,
    pub temp1: Option<f64>,
    pub temp2: Option<f64>,
    pub temp3: Option<f64>,
    pub status_hex: Option<String>,
    pub lock_status: Option<i64>,
    pub charge_cycles: Option<u32>,
    pub over_discharge: Option<u32>,
    pub over_load: Option<u32>,
    pub err_cnt_04: Option<u32>,
    pub err_cnt_05: Option<u32>,
    pub err_cnt_06: Option<u32>,
    pub err_cnt_07: Option<u32>,
    pub fuse_blown: Option<bool>,
    pub health_score: u8,
}

impl ExportRecord {
    /// Flatten one history entry, recomputing its metrics
    pub fn from_entry(entry: &SessionHistoryEntry) -> Self {
        let state = entry.state();
        let metrics = entry.metrics();

        let mut cells = [0.0; EXPORT_CELL_COUNT];
        if let Some(voltages) = &state.cell_voltages {
            for (slot, v) in cells.iter_mut().zip(voltages) {
                *slot = *v;
            }
        }

        let cell_diff = state
            .cell_diff
            .or_else(|| metrics.cells.summary().map(|s| s.spread));

        Self {
            timestamp: entry.timestamp().to_string(),
            model: state.model.clone(),
            serial: state.serial.clone(),
            rom_id: state.rom_id.clone(),
            capacity: state.capacity.clone(),
            prod_date: state.prod_date.clone(),
            pack_voltage: state.pack_voltage,
            cells,
            cell_diff,
            temp1: state.temp1,
            temp2: state.temp2,
            temp3: state.temp3,
            status_hex: state.status_hex.clone(),
            lock_status: state.lock_status,
            charge_cycles: state.charge_cycles,
            over_discharge: state.over_discharge,
            over_load: state.over_load,
            err_cnt_04: state.err_cnt_04,
            err_cnt_05: state.err_cnt_05,
            err_cnt_06: state.err_cnt_06,
            err_cnt_07: state.err_cnt_07,
            fuse_blown: state.fuse_blown,
            health_score: metrics.health_score,
        }
    }
}

/// Replay a history in order
pub fn export_history(entries: &[SessionHistoryEntry]) -> Vec<ExportRecord> {
    entries.iter().map(ExportRecord::from_entry).collect()
}

/// Write records as JSON Lines, returning how many were written
pub fn write_jsonl<W: Write>(records: &[ExportRecord], mut writer: W) -> Result<usize> {
    for record in records {
        serde_json::to_writer(&mut writer, record)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(records.len())
}

/// Export a history to a JSONL file, replacing any existing file
pub fn export_to_file<P: AsRef<Path>>(path: P, entries: &[SessionHistoryEntry]) -> Result<usize> {
    let path = path.as_ref();
    let file = File::create(path)?;
    let written = write_jsonl(&export_history(entries), BufWriter::new(file))?;
    info!("Exported {} history records to {}", written, path.display());
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::device::DeviceState;
    use crate::state::history::SessionHistory;
    use serde_json::Value;

    fn sample_history() -> SessionHistory {
        let mut history = SessionHistory::new();
        let first = DeviceState {
            model: Some("BL1860B".to_string()),
            charge_cycles: Some(50),
            cell_voltages: Some(vec![4.10, 4.08, 4.12]),
            ..Default::default()
        };
        history.append("2026/10/18 09:00:00".to_string(), &first);

        let second = DeviceState {
            err_cnt_05: Some(1),
            cell_diff: Some(0.02),
            fuse_blown: Some(true),
            ..first.clone()
        };
        history.append("2026/10/18 09:00:05".to_string(), &second);
        history
    }

    #[test]
    fn test_record_fields() {
        let history = sample_history();
        let records = export_history(history.entries());
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.timestamp, "2026/10/18 09:00:00");
        assert_eq!(first.model.as_deref(), Some("BL1860B"));
        assert_eq!(first.cells, [4.10, 4.08, 4.12, 0.0, 0.0], "Missing cells export as 0");
        assert!((first.cell_diff.unwrap() - 0.04).abs() < 1e-9, "Spread derived when not reported");
        assert_eq!(first.health_score, 98);
        assert_eq!(first.fuse_blown, None);

        let second = &records[1];
        assert_eq!(second.cell_diff, Some(0.02), "Reported spread wins");
        assert_eq!(second.health_score, 78);
        assert_eq!(second.fuse_blown, Some(true));
    }

    #[test]
    fn test_no_cells_exports_zeros() {
        let mut history = SessionHistory::new();
        history.append("t".to_string(), &DeviceState::default());
        let record = ExportRecord::from_entry(&history.entries()[0]);
        assert_eq!(record.cells, [0.0; EXPORT_CELL_COUNT]);
        assert_eq!(record.cell_diff, None);
        assert_eq!(record.health_score, 100);
    }

    #[test]
    fn test_write_jsonl_one_line_per_record() {
        let history = sample_history();
        let mut out = Vec::new();
        let written = write_jsonl(&export_history(history.entries()), &mut out).unwrap();
        assert_eq!(written, 2);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let row: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(row["timestamp"], "2026/10/18 09:00:05");
        assert_eq!(row["err_cnt_05"], 1);
        assert_eq!(row["health_score"], 78);
        assert!(row["temp1"].is_null());
    }

    #[test]
    fn test_export_is_repeatable() {
        let history = sample_history();
        assert_eq!(
            export_history(history.entries()),
            export_history(history.entries()),
            "Replays must reproduce identical records"
        );
    }

    #[test]
    fn test_export_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");

        let written = export_to_file(&path, sample_history().entries()).unwrap();
        assert_eq!(written, 2);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.ends_with('\n'));
    }

    #[test]
    fn test_export_to_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("history.jsonl");
        assert!(export_to_file(&path, sample_history().entries()).is_err());
    }
}
