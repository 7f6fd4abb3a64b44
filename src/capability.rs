//! # Capability Gate
//!
//! Maps the device-declared [`FeatureSet`] to the commands that may currently
//! be issued. Pure and stateless; recomputed whenever the feature set is
//! replaced.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::protocol::command::Command;

/// Device-declared feature flags, replaced wholesale on every telemetry batch
/// that carries them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    #[serde(default)]
    pub read_dynamic: bool,

    #[serde(default)]
    pub led_test: bool,

    #[serde(default)]
    pub clear_errors: bool,

    /// Flags this client does not interpret
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// Which commands are currently enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CommandEligibility {
    pub read_dynamic: bool,
    pub led_test: bool,
    pub clear_errors: bool,
}

impl CommandEligibility {
    /// Compute eligibility; before any feature set has arrived only the
    /// ungated commands are allowed
    pub fn from_features(features: Option<&FeatureSet>) -> Self {
        match features {
            Some(f) => Self {
                read_dynamic: f.read_dynamic,
                led_test: f.led_test,
                clear_errors: f.clear_errors,
            },
            None => Self::default(),
        }
    }

    /// Whether `command` may be issued
    pub fn permits(&self, command: Command) -> bool {
        match command {
            Command::ReadDynamic => self.read_dynamic,
            Command::LedOn | Command::LedOff => self.led_test,
            Command::ClearErrors => self.clear_errors,
            Command::ReadStatic
            | Command::GetFsInfo
            | Command::Ping
            | Command::Presence
            | Command::SetLogging => true,
        }
    }

    /// All commands currently permitted
    pub fn permitted(&self) -> Vec<Command> {
        Command::ALL
            .iter()
            .copied()
            .filter(|c| self.permits(*c))
            .collect()
    }
}
