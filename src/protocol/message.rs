//! # Inbound Messages
//!
//! Closed set of messages the device sends, discriminated by `type`.
//! Anything that is not valid JSON, or whose `type` is not listed here, is a
//! decode failure.

use serde::Deserialize;

use crate::capability::FeatureSet;
use crate::error::{BmsLinkError, Result};
use crate::state::device::DeviceState;
use crate::state::engine::TelemetryKind;

/// Storage usage reported by `fs_info` (bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct FsInfo {
    pub used: u64,
    pub total: u64,
}

/// Partial device update carried by `static_data` / `dynamic_data`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TelemetryBatch {
    #[serde(default)]
    pub data: DeviceState,

    #[serde(default)]
    pub features: Option<FeatureSet>,
}

/// Decoded inbound message
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Battery attach/detach notice
    Presence {
        #[serde(default)]
        present: Option<bool>,
    },
    /// Heartbeat reply
    Pong,
    /// Command completed; `message` is a translatable key or free text
    Success {
        #[serde(default)]
        message: Option<String>,
    },
    /// Command failed on the device
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    Info {
        #[serde(default)]
        message: Option<String>,
    },
    Debug {
        #[serde(default)]
        message: Option<String>,
    },
    FsInfo(FsInfo),
    StaticData(TelemetryBatch),
    DynamicData(TelemetryBatch),
}

impl InboundMessage {
    /// Decode one text frame
    ///
    /// # Errors
    ///
    /// Returns [`BmsLinkError::Decode`] if the text is not JSON, lacks a
    /// `type`, names an unknown type, or has malformed fields.
    ///
    /// # Examples
    ///
    /// ```
    /// use bms_link::protocol::message::InboundMessage;
    ///
    /// let msg = InboundMessage::decode(r#"{"type":"pong"}"#)?;
    /// assert_eq!(msg, InboundMessage::Pong);
    /// assert!(InboundMessage::decode(r#"{"type":"reboot"}"#).is_err());
    /// # Ok::<(), bms_link::error::BmsLinkError>(())
    /// ```
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| BmsLinkError::Decode(e.to_string()))
    }

    /// Wire name of this message's type
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Presence { .. } => "presence",
            InboundMessage::Pong => "pong",
            InboundMessage::Success { .. } => "success",
            InboundMessage::Error { .. } => "error",
            InboundMessage::Info { .. } => "info",
            InboundMessage::Debug { .. } => "debug",
            InboundMessage::FsInfo(_) => "fs_info",
            InboundMessage::StaticData(_) => TelemetryKind::Static.as_str(),
            InboundMessage::DynamicData(_) => TelemetryKind::Dynamic.as_str(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_liveness_messages() {
        assert_eq!(InboundMessage::decode(r#"{"type":"pong"}"#).unwrap(), InboundMessage::Pong);
        assert_eq!(
            InboundMessage::decode(r#"{"type":"presence","present":true}"#).unwrap(),
            InboundMessage::Presence { present: Some(true) }
        );
    }

    #[test]
    fn test_decode_feedback_messages() {
        let msg = InboundMessage::decode(r#"{"type":"error","message":"err_timeout"}"#).unwrap();
        assert_eq!(msg, InboundMessage::Error { message: Some("err_timeout".to_string()) });

        let msg = InboundMessage::decode(r#"{"type":"success"}"#).unwrap();
        assert_eq!(msg, InboundMessage::Success { message: None });
        assert_eq!(msg.kind(), "success");
    }

    #[test]
    fn test_decode_fs_info() {
        let msg = InboundMessage::decode(r#"{"type":"fs_info","used":2048,"total":1441792}"#).unwrap();
        assert_eq!(msg, InboundMessage::FsInfo(FsInfo { used: 2048, total: 1_441_792 }));
    }

    #[test]
    fn test_decode_static_data_with_features() {
        let text = r#"{
            "type": "static_data",
            "data": {"model": "BL1860B", "charge_cycles": 50, "lock_status": 0},
            "features": {"read_dynamic": true, "led_test": false, "clear_errors": true}
        }"#;

        match InboundMessage::decode(text).unwrap() {
            InboundMessage::StaticData(batch) => {
                assert_eq!(batch.data.model.as_deref(), Some("BL1860B"));
                assert_eq!(batch.data.charge_cycles, Some(50));
                let features = batch.features.expect("features present");
                assert!(features.read_dynamic);
                assert!(!features.led_test);
            }
            other => panic!("Expected static_data, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_dynamic_data_without_features() {
        let text = r#"{"type":"dynamic_data","data":{"cell_voltages":[4.1,4.08],"temp1":22.5}}"#;
        match InboundMessage::decode(text).unwrap() {
            InboundMessage::DynamicData(batch) => {
                assert_eq!(batch.data.cell_voltages, Some(vec![4.1, 4.08]));
                assert!(batch.features.is_none());
            }
            other => panic!("Expected dynamic_data, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let err = InboundMessage::decode(r#"{"type":"firmware_update","data":{}}"#).unwrap_err();
        assert!(matches!(err, BmsLinkError::Decode(_)));
    }

    #[test]
    fn test_decode_rejects_malformed_input() {
        assert!(InboundMessage::decode("not json").is_err());
        assert!(InboundMessage::decode(r#"{"message":"no type"}"#).is_err());
        assert!(InboundMessage::decode(r#"{"type":"fs_info","used":"lots"}"#).is_err());
    }
}
