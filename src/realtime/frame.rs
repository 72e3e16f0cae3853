//! Push frame decoding
//!
//! ```text
//! {"Data":{"EventId":21,"Data":"{\"Payload\":[32,55,...]}"}}
//! ```
//! Status updates carry a JSON document encoded as a string, so the payload
//! needs a second parse.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::models::PhaseEvent;

/// EventId of the vendor's status update ("VarcoStatusUpdate")
pub const STATUS_UPDATE_EVENT: i64 = 21;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid frame JSON: {0}")]
    Outer(serde_json::Error),

    #[error("status update has no inner Data")]
    MissingInner,

    #[error("invalid inner JSON: {0}")]
    Inner(serde_json::Error),

    #[error("status update has an empty Payload")]
    EmptyPayload,

    #[error("payload element {0} is not an integer")]
    NotAnInteger(usize),
}

#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(rename = "Data")]
    data: FrameData,
}

#[derive(Debug, Deserialize)]
struct FrameData {
    #[serde(rename = "EventId")]
    event_id: Option<i64>,
    #[serde(rename = "Data")]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct StatusUpdate {
    #[serde(rename = "Payload")]
    payload: Vec<Value>,
}

/// Decode one text frame.
///
/// `Ok(None)` means a well-formed frame that is not a status update.
pub fn decode_frame(text: &str) -> Result<Option<PhaseEvent>, FrameError> {
    let frame: Frame = serde_json::from_str(text).map_err(FrameError::Outer)?;
    if frame.data.event_id != Some(STATUS_UPDATE_EVENT) {
        return Ok(None);
    }

    let update: StatusUpdate = match frame.data.data {
        Some(Value::String(inner)) => serde_json::from_str(&inner).map_err(FrameError::Inner)?,
        Some(inner @ Value::Object(_)) => serde_json::from_value(inner).map_err(FrameError::Inner)?,
        _ => return Err(FrameError::MissingInner),
    };

    let phase = update.payload.first().ok_or(FrameError::EmptyPayload)?;
    let phase = as_int(phase).ok_or(FrameError::NotAnInteger(0))?;
    let percent = match update.payload.get(1) {
        Some(value) => Some(as_int(value).ok_or(FrameError::NotAnInteger(1))?),
        None => None,
    };

    Ok(Some(PhaseEvent { phase, percent }))
}

fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
