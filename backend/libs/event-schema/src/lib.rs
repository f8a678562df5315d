//! Event schema for marketing-funnel events flowing through the pipeline
//!
//! Events arrive from the ingestion layer already validated, are routed onto a
//! JetStream subject derived from their version, source and funnel stage, and
//! are persisted verbatim by the consumer. The wire format is camelCase JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// Fallible payload decoding
pub mod decode;

pub use decode::{decode_event, DecodeError};

/// Schema version assumed when a payload omits `version`
pub const DEFAULT_VERSION: &str = "v1";

/// Label used for metrics when the source of a payload could not be read
pub const UNKNOWN_SOURCE: &str = "unknown";

fn default_version() -> String {
    DEFAULT_VERSION.to_string()
}

/// A single funnel event. Immutable once constructed at the ingestion boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Globally unique identity (UUID), the idempotency key
    pub event_id: String,
    /// When the event occurred at the source
    pub timestamp: DateTime<Utc>,
    /// Schema version tag
    #[serde(default = "default_version")]
    pub version: String,
    pub source: Source,
    pub funnel_stage: FunnelStage,
    /// Free-form category (e.g. "purchase", "video.view")
    pub event_type: String,
    /// Source-specific payload, stored verbatim
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(
        event_id: impl Into<String>,
        source: Source,
        funnel_stage: FunnelStage,
        event_type: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            timestamp: Utc::now(),
            version: default_version(),
            source,
            funnel_stage,
            event_type: event_type.into(),
            data,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Routing subject: `{prefix}.{version}.{source}.{funnelStage}`
    pub fn subject(&self, prefix: &str) -> String {
        format!(
            "{}.{}.{}.{}",
            prefix, self.version, self.source, self.funnel_stage
        )
    }
}

/// Upstream platform an event originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Facebook,
    Tiktok,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Facebook => "facebook",
            Source::Tiktok => "tiktok",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "facebook" => Ok(Source::Facebook),
            "tiktok" => Ok(Source::Tiktok),
            other => Err(format!("unknown event source: {}", other)),
        }
    }
}

/// Position of an event in the conversion funnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunnelStage {
    Top,
    Bottom,
}

impl FunnelStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FunnelStage::Top => "top",
            FunnelStage::Bottom => "bottom",
        }
    }
}

impl fmt::Display for FunnelStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FunnelStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "top" => Ok(FunnelStage::Top),
            "bottom" => Ok(FunnelStage::Bottom),
            other => Err(format!("unknown funnel stage: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subject_routing() {
        let event = Event::new(
            "a1",
            Source::Facebook,
            FunnelStage::Bottom,
            "purchase",
            json!({}),
        );
        assert_eq!(event.subject("events"), "events.v1.facebook.bottom");

        let event = Event::new("b2", Source::Tiktok, FunnelStage::Top, "video.view", json!({}))
            .with_version("v2");
        assert_eq!(event.subject("funnel"), "funnel.v2.tiktok.top");
    }

    #[test]
    fn test_event_serializes_camel_case() {
        let event = Event::new(
            "a1",
            Source::Tiktok,
            FunnelStage::Top,
            "video.view",
            json!({"user": {"userId": "u1"}}),
        );
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["eventId"], "a1");
        assert_eq!(value["funnelStage"], "top");
        assert_eq!(value["eventType"], "video.view");
        assert_eq!(value["source"], "tiktok");
        assert_eq!(value["data"]["user"]["userId"], "u1");
    }

    #[test]
    fn test_version_defaults_when_absent() {
        let json = r#"{
            "eventId": "c3",
            "timestamp": "2024-01-15T10:30:00Z",
            "source": "facebook",
            "funnelStage": "top",
            "eventType": "ad.view",
            "data": {}
        }"#;

        let event: Event = serde_json::from_str(json).unwrap();
        assert_eq!(event.version, DEFAULT_VERSION);
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!("facebook".parse::<Source>().unwrap(), Source::Facebook);
        assert_eq!("tiktok".parse::<Source>().unwrap(), Source::Tiktok);
        assert!("instagram".parse::<Source>().is_err());

        assert_eq!("top".parse::<FunnelStage>().unwrap(), FunnelStage::Top);
        assert_eq!("bottom".parse::<FunnelStage>().unwrap(), FunnelStage::Bottom);
        assert!("middle".parse::<FunnelStage>().is_err());
    }
}
