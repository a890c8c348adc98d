//! Detection stream payload parsing.
//!
//! The detector publishes `{ "result": { "predictions": [{ "class": ... }] }, "pothole": bool }`
//! where either field may be missing. Each message becomes zero, one or two
//! typed events.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_json::Value;

/// A typed event delivered to the reconciliation engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectionEvent {
    /// Class labels of one inference pass, in prediction order. May be empty.
    Classification(Vec<String>),
    /// Whether the pothole model saw a pothole.
    Pothole(bool),
}

/// Raw message from the detection stream.
///
/// `result` stays untyped so that a malformed prediction list costs only the
/// classification event, never the pothole signal next to it.
#[derive(Debug, Deserialize)]
pub struct StreamPayload {
    #[serde(default)]
    pub result: Option<Value>,

    #[serde(default)]
    pub pothole: Option<bool>,
}

/// Parse one stream message into events, classification first.
///
/// Fails only if the payload is not a JSON object or `pothole` is not a
/// boolean. A message with neither field yields no events.
pub fn parse_stream_payload(payload: &[u8]) -> Result<Vec<DetectionEvent>> {
    let message: StreamPayload =
        serde_json::from_slice(payload).map_err(|e| anyhow!("parse error: {}", e))?;

    let mut events = Vec::with_capacity(2);
    if let Some(result) = message.result {
        events.push(DetectionEvent::Classification(prediction_labels(&result)));
    }
    if let Some(present) = message.pothole {
        events.push(DetectionEvent::Pothole(present));
    }
    Ok(events)
}

/// Class labels in prediction order. A missing or non-list `predictions`
/// is an empty batch; entries without a string `class` are skipped.
fn prediction_labels(result: &Value) -> Vec<String> {
    let Some(predictions) = result.get("predictions").and_then(Value::as_array) else {
        return Vec::new();
    };
    let labels: Vec<String> = predictions
        .iter()
        .filter_map(|prediction| prediction.get("class").and_then(Value::as_str))
        .map(str::to_string)
        .collect();
    if labels.len() < predictions.len() {
        log::debug!(
            "skipped {} predictions without a class label",
            predictions.len() - labels.len()
        );
    }
    labels
}
