//! Decoding raw broker payloads into [`Event`]s.
//!
//! Identity is checked before shape: a payload without a usable `eventId` is
//! rejected as [`DecodeError::MissingIdentity`] even if other fields are also
//! wrong, so the two rejection reasons stay distinguishable in metrics.

use crate::{Event, Source, UNKNOWN_SOURCE};
use thiserror::Error;

/// Why a payload could not become an [`Event`]
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Payload is not JSON, or does not have the shape of an event
    #[error("Malformed event payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Payload has no `eventId` (absent, null, empty or not a string)
    #[error("Event payload has no eventId")]
    MissingIdentity {
        /// Source, if it could still be read from the payload
        event_source: Option<Source>,
    },
}

impl DecodeError {
    /// Source label for metrics (`unknown` when it could not be read)
    pub fn source_label(&self) -> &'static str {
        match self {
            DecodeError::MissingIdentity {
                event_source: Some(source),
            } => source.as_str(),
            _ => UNKNOWN_SOURCE,
        }
    }
}

/// Decode a broker payload into an [`Event`].
pub fn decode_event(payload: &[u8]) -> Result<Event, DecodeError> {
    let value: serde_json::Value = serde_json::from_slice(payload)?;

    let has_identity = value
        .get("eventId")
        .and_then(|id| id.as_str())
        .map(|id| !id.trim().is_empty())
        .unwrap_or(false);

    if !has_identity {
        let source = value
            .get("source")
            .and_then(|s| s.as_str())
            .and_then(|s| s.parse().ok());
        return Err(DecodeError::MissingIdentity {
            event_source: source,
        });
    }

    Ok(serde_json::from_value(value)?)
}
