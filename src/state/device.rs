//! # Device State
//!
//! Canonical record of everything known about the connected battery, built by
//! shallow-merging partial telemetry batches in arrival order.
//!
//! Fields are split by provenance:
//!
//! | Group | Fields | Arrives via |
//! |-------|--------|-------------|
//! | Static | model, serial, rom_id, fw_ver, prod_date, capacity, battery_type, charge_cycles, lock_status, status_code, status_hex | `static_data` |
//! | Dynamic | cell_voltages, pack_voltage, cell_diff, temp1-3, over_discharge, over_load, err_cnt_04-07, fuse_blown | `dynamic_data` |
//!
//! The device currently sends its full cached record in both batches, but
//! nothing here relies on that. A field that never arrived stays `None`;
//! defaulting is left to whoever presents the state.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Canonical merged device record
///
/// The same type is used for partial updates: a `DeviceState` decoded from a
/// telemetry batch only has the fields that batch carried.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rom_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fw_ver: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prod_date: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charge_cycles: Option<u32>,

    /// 0 = unlocked, any positive code = locked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_status: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_hex: Option<String>,

    /// Per-cell voltages in series order (volts)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell_voltages: Option<Vec<f64>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pack_voltage: Option<f64>,

    /// Cell spread as reported by the device (volts)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell_diff: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp1: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp2: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp3: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub over_discharge: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub over_load: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_cnt_04: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_cnt_05: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_cnt_06: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_cnt_07: Option<u32>,

    /// Accepts `true`/`false` or `1`/`0` on the wire
    #[serde(
        default,
        deserialize_with = "deserialize_flag",
        skip_serializing_if = "Option::is_none"
    )]
    pub fuse_blown: Option<bool>,

    /// Fields this client does not model, merged with the same rule
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// Overwrite each listed field of `$target` that is present in `$source`
macro_rules! overlay_fields {
    ($target:expr, $source:expr; $($field:ident),+ $(,)?) => {
        $(
            if $source.$field.is_some() {
                $target.$field = $source.$field.clone();
            }
        )+
    };
}

impl DeviceState {
    /// Merge `partial` over `current`, returning an independent value
    ///
    /// Fields present in `partial` win; absent fields keep `current`'s value.
    ///
    /// # Examples
    ///
    /// ```
    /// use bms_link::state::device::DeviceState;
    ///
    /// let current = DeviceState { model: Some("BL1860B".into()), ..Default::default() };
    /// let partial = DeviceState { charge_cycles: Some(12), ..Default::default() };
    /// let merged = DeviceState::merge(&current, &partial);
    ///
    /// assert_eq!(merged.model.as_deref(), Some("BL1860B"));
    /// assert_eq!(merged.charge_cycles, Some(12));
    /// ```
    pub fn merge(current: &DeviceState, partial: &DeviceState) -> DeviceState {
        let mut next = current.clone();
        next.apply(partial);
        next
    }

    /// In-place form of [`DeviceState::merge`]
    pub fn apply(&mut self, partial: &DeviceState) {
        overlay_fields!(self, partial;
            model, serial, rom_id, fw_ver, prod_date, capacity, battery_type,
            charge_cycles, lock_status, status_code, status_hex,
            cell_voltages, pack_voltage, cell_diff, temp1, temp2, temp3,
            over_discharge, over_load,
            err_cnt_04, err_cnt_05, err_cnt_06, err_cnt_07,
            fuse_blown,
        );

        for (key, value) in &partial.other {
            self.other.insert(key.clone(), value.clone());
        }
    }

    /// The four categorized error counters, absent counted as zero
    pub fn error_counters(&self) -> [u32; 4] {
        [
            self.err_cnt_04.unwrap_or(0),
            self.err_cnt_05.unwrap_or(0),
            self.err_cnt_06.unwrap_or(0),
            self.err_cnt_07.unwrap_or(0),
        ]
    }

    /// Whether no field has ever been set
    pub fn is_empty(&self) -> bool {
        *self == DeviceState::default()
    }
}

fn deserialize_flag<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    Ok(Option::<Flag>::deserialize(deserializer)?.map(|flag| match flag {
        Flag::Bool(b) => b,
        Flag::Int(i) => i == 1,
    }))
}
