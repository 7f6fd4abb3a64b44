//! # State Merge Engine
//!
//! Sole owner of the live [`DeviceState`], the current [`FeatureSet`] and the
//! [`SessionHistory`]. Mutated only from the dispatcher, one telemetry batch
//! at a time.

use serde::Serialize;
use std::fmt;
use tracing::debug;

use super::derive::DerivedMetrics;
use super::device::DeviceState;
use super::history::SessionHistory;
use crate::capability::{CommandEligibility, FeatureSet};
use crate::timestamp::TimestampProvider;

/// Which telemetry batch a partial update came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryKind {
    /// `static_data`
    Static,
    /// `dynamic_data`
    Dynamic,
}

impl TelemetryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryKind::Static => "static_data",
            TelemetryKind::Dynamic => "dynamic_data",
        }
    }
}

impl fmt::Display for TelemetryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical device state plus its history
#[derive(Debug, Default)]
pub struct StateEngine {
    device: DeviceState,
    features: Option<FeatureSet>,
    history: SessionHistory,
}

impl StateEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one telemetry batch
    ///
    /// 1. shallow-merge `data` into the device state
    /// 2. replace the feature set wholesale when `features` is present
    /// 3. for dynamic batches, append a snapshot of the merged state
    pub fn apply_telemetry(
        &mut self,
        kind: TelemetryKind,
        data: &DeviceState,
        features: Option<FeatureSet>,
        clock: &dyn TimestampProvider,
    ) {
        self.device.apply(data);

        if let Some(features) = features {
            debug!("Feature set replaced: {:?}", features);
            self.features = Some(features);
        }

        if kind == TelemetryKind::Dynamic {
            self.history.append(clock.timestamp(), &self.device);
            debug!("History entry #{} appended", self.history.len());
        }
    }

    pub fn device(&self) -> &DeviceState {
        &self.device
    }

    pub fn features(&self) -> Option<&FeatureSet> {
        self.features.as_ref()
    }

    pub fn history(&self) -> &SessionHistory {
        &self.history
    }

    /// Metrics for the live state
    pub fn metrics(&self) -> DerivedMetrics {
        DerivedMetrics::compute(&self.device)
    }

    /// Commands permitted by the current feature set
    pub fn eligibility(&self) -> CommandEligibility {
        CommandEligibility::from_features(self.features.as_ref())
    }

    /// Consume the engine, keeping only the history
    pub fn into_history(self) -> SessionHistory {
        self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::command::Command;
    use crate::timestamp::MockTimestampProvider;

    fn clock_expecting(calls: usize) -> MockTimestampProvider {
        let mut clock = MockTimestampProvider::new();
        clock
            .expect_timestamp()
            .times(calls)
            .returning(|| "2026/01/01 00:00:00".to_string());
        clock
    }

    #[test]
    fn test_static_batch_does_not_touch_history() {
        let mut engine = StateEngine::new();
        let data = DeviceState {
            model: Some("BL1860B".to_string()),
            ..Default::default()
        };

        engine.apply_telemetry(TelemetryKind::Static, &data, None, &clock_expecting(0));

        assert_eq!(engine.device().model.as_deref(), Some("BL1860B"));
        assert!(engine.history().is_empty());
    }

    #[test]
    fn test_dynamic_batch_appends_once() {
        let mut engine = StateEngine::new();
        let data = DeviceState {
            cell_voltages: Some(vec![4.0; 5]),
            ..Default::default()
        };

        engine.apply_telemetry(TelemetryKind::Dynamic, &data, None, &clock_expecting(1));

        assert_eq!(engine.history().len(), 1);
        assert_eq!(engine.history().entries()[0].timestamp(), "2026/01/01 00:00:00");
        assert_eq!(engine.history().entries()[0].state(), engine.device());
    }

    #[test]
    fn test_features_replaced_wholesale() {
        let mut engine = StateEngine::new();
        let clock = clock_expecting(0);
        let first: FeatureSet =
            serde_json::from_str(r#"{"read_dynamic":true,"led_test":true,"clear_errors":true}"#)
                .unwrap();
        let second: FeatureSet = serde_json::from_str(r#"{"read_dynamic":true}"#).unwrap();

        engine.apply_telemetry(TelemetryKind::Static, &DeviceState::default(), Some(first), &clock);
        assert!(engine.eligibility().permits(Command::LedOn));

        engine.apply_telemetry(TelemetryKind::Static, &DeviceState::default(), Some(second), &clock);
        assert!(!engine.eligibility().permits(Command::LedOn), "Features must not be merged");
        assert!(engine.eligibility().permits(Command::ReadDynamic));
    }

    #[test]
    fn test_missing_features_keep_previous() {
        let mut engine = StateEngine::new();
        let clock = clock_expecting(1);
        let features: FeatureSet = serde_json::from_str(r#"{"clear_errors":true}"#).unwrap();

        engine.apply_telemetry(TelemetryKind::Static, &DeviceState::default(), Some(features), &clock);
        engine.apply_telemetry(TelemetryKind::Dynamic, &DeviceState::default(), None, &clock);

        assert!(engine.eligibility().permits(Command::ClearErrors));
    }
}
