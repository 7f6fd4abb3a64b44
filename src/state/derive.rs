//! # Derived Metrics
//!
//! Health score, lock classification and cell-balance figures computed from a
//! [`DeviceState`]. Everything here is a pure function of its input: metrics
//! are recomputed on every change and on every history replay, never stored.
//!
//! ## Health score
//!
//! ```text
//! score = 100
//!       - 0.05 * charge_cycles
//!       - 0.1  * over_discharge
//!       - 0.1  * over_load
//!       - 20   * (err_cnt_04 + err_cnt_05 + err_cnt_06 + err_cnt_07)
//! ```
//!
//! floored at 0 and rounded half-up to a whole percentage. The arithmetic is
//! done in hundredths of a percent so that rounding is exact.

use serde::Serialize;

use super::device::DeviceState;

/// Cell readings at or below this are treated as unpopulated (volts)
pub const CELL_PRESENT_THRESHOLD_V: f64 = 0.1;

/// Spread above which the pack is flagged as imbalanced (volts)
pub const CELL_IMBALANCE_WARN_V: f64 = 0.050;

/// Below this a cell is critically low (volts)
pub const CELL_CRITICAL_V: f64 = 2.5;

/// Below this a cell is low (volts)
pub const CELL_LOW_V: f64 = 3.0;

/// Voltage span mapped onto a 0-100% cell fill (volts)
const CELL_FILL_SPAN_V: f64 = 1.7;

// Health penalties in hundredths of a percent
const FULL_HEALTH: i64 = 100_00;
const PENALTY_PER_CYCLE: i64 = 5;
const PENALTY_PER_OVER_DISCHARGE: i64 = 10;
const PENALTY_PER_OVER_LOAD: i64 = 10;
const PENALTY_PER_ERROR: i64 = 20_00;

const GOOD_HEALTH_ABOVE: i64 = 85_00;
const FAIR_HEALTH_ABOVE: i64 = 60_00;

/// Unrounded health in hundredths of a percent, floored at 0
fn health_hundredths(state: &DeviceState) -> i64 {
    let cycles = i64::from(state.charge_cycles.unwrap_or(0));
    let over_discharge = i64::from(state.over_discharge.unwrap_or(0));
    let over_load = i64::from(state.over_load.unwrap_or(0));
    let errors: i64 = state.error_counters().iter().map(|&e| i64::from(e)).sum();

    let score = FULL_HEALTH
        - cycles * PENALTY_PER_CYCLE
        - over_discharge * PENALTY_PER_OVER_DISCHARGE
        - over_load * PENALTY_PER_OVER_LOAD
        - errors * PENALTY_PER_ERROR;

    score.max(0)
}

/// Health score (state of health) as a whole percentage, 0-100
///
/// Absent counters count as zero.
///
/// # Examples
///
/// ```
/// use bms_link::state::device::DeviceState;
/// use bms_link::state::derive::derive_health_score;
///
/// let state = DeviceState { charge_cycles: Some(50), ..Default::default() };
/// assert_eq!(derive_health_score(&state), 98); // 97.5 rounds up
/// ```
pub fn derive_health_score(state: &DeviceState) -> u8 {
    let rounded = (health_hundredths(state) + 50) / 100;
    // health_hundredths is within 0..=10000
    rounded.clamp(0, 100) as u8
}

/// Unrounded health score as a percentage
pub fn derive_health_exact(state: &DeviceState) -> f64 {
    health_hundredths(state) as f64 / 100.0
}

/// Coarse health grade used for alert coloring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthBand {
    /// Above 85%
    Good,
    /// Above 60%
    Fair,
    /// 60% or less
    Poor,
}

/// Grade the unrounded health score
pub fn derive_health_band(state: &DeviceState) -> HealthBand {
    let score = health_hundredths(state);
    if score > GOOD_HEALTH_ABOVE {
        HealthBand::Good
    } else if score > FAIR_HEALTH_ABOVE {
        HealthBand::Fair
    } else {
        HealthBand::Poor
    }
}

/// Lock classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Nominal,
    /// Alert-colored
    Locked,
}

/// Classify a raw lock-status code
pub fn classify_lock(code: i64) -> LockState {
    if code > 0 {
        LockState::Locked
    } else {
        LockState::Nominal
    }
}

/// Classify the state's lock status; an absent code is nominal
pub fn derive_lock_classification(state: &DeviceState) -> LockState {
    classify_lock(state.lock_status.unwrap_or(0))
}

/// Pack-level cell figures
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CellSummary {
    /// Sum of populated readings (volts)
    pub total: f64,
    pub max: f64,
    pub min: f64,
    /// `max - min` (volts)
    pub spread: f64,
    /// Number of readings above the presence threshold
    pub populated: usize,
    /// Spread exceeds [`CELL_IMBALANCE_WARN_V`]
    pub imbalanced: bool,
}

/// Outcome of cell-balance analysis
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CellReport {
    /// No readings at all: dynamic data has not been received, suppress the
    /// advanced display
    NoData,
    /// Every reading is at or below the presence threshold: treat the
    /// advanced section as absent
    Unpopulated,
    Summary(CellSummary),
}

impl CellReport {
    /// Whether the advanced (dynamic) data section should be shown
    pub fn has_advanced_data(&self) -> bool {
        matches!(self, CellReport::Summary(_))
    }

    pub fn summary(&self) -> Option<&CellSummary> {
        match self {
            CellReport::Summary(s) => Some(s),
            _ => None,
        }
    }
}

/// Analyze per-cell voltages
///
/// Unpopulated readings (≤ 0.1 V) are left out of the total and spread.
/// The device's own cell view sums every slot; this one does not.
pub fn derive_cell_imbalance(voltages: &[f64]) -> CellReport {
    if voltages.is_empty() {
        return CellReport::NoData;
    }

    let populated: Vec<f64> = voltages
        .iter()
        .copied()
        .filter(|&v| v > CELL_PRESENT_THRESHOLD_V)
        .collect();

    if populated.is_empty() {
        return CellReport::Unpopulated;
    }

    let total: f64 = populated.iter().sum();
    let max = populated.iter().copied().fold(f64::MIN, f64::max);
    let min = populated.iter().copied().fold(f64::MAX, f64::min);
    let spread = max - min;

    CellReport::Summary(CellSummary {
        total,
        max,
        min,
        spread,
        populated: populated.len(),
        imbalanced: spread > CELL_IMBALANCE_WARN_V,
    })
}

/// Charge level of a single cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CellLevel {
    Normal,
    Low,
    Critical,
}

/// Grade one cell reading
pub fn classify_cell(voltage: f64) -> CellLevel {
    if voltage < CELL_CRITICAL_V {
        CellLevel::Critical
    } else if voltage < CELL_LOW_V {
        CellLevel::Low
    } else {
        CellLevel::Normal
    }
}

/// Fill percentage for a cell graphic, 2.5 V = 0%, 4.2 V = 100%
pub fn cell_fill_percent(voltage: f64) -> f64 {
    ((voltage - CELL_CRITICAL_V) / CELL_FILL_SPAN_V * 100.0).clamp(0.0, 100.0)
}

/// Every derived metric for one state snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DerivedMetrics {
    pub health_score: u8,
    pub health_band: HealthBand,
    pub lock: LockState,
    pub cells: CellReport,
}

impl DerivedMetrics {
    /// Compute all metrics from `state`
    pub fn compute(state: &DeviceState) -> Self {
        let voltages = state.cell_voltages.as_deref().unwrap_or(&[]);
        Self {
            health_score: derive_health_score(state),
            health_band: derive_health_band(state),
            lock: derive_lock_classification(state),
            cells: derive_cell_imbalance(voltages),
        }
    }
}
