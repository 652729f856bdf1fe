//! Wire format between the phone and the bridge
//!
//! Client frames carry one JSON object per sensor sample. The optional server
//! reply is a small acknowledgment object; there is no error channel.

use crate::mapping::{Direction, SensorSample};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Longest payload prefix that ends up in log lines
const PREVIEW_CHARS: usize = 120;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed JSON: {0}")]
    Malformed(serde_json::Error),

    #[error("Unexpected value shape: {0}")]
    Shape(String),

    #[error("Binary frame is not valid UTF-8")]
    NotUtf8,
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Decodes one text frame into a sample
///
/// Syntax errors and truncated input are `Malformed`. A well-formed document
/// that is not an object, or has a string for `y` or `null` for `gas`, is a
/// `Shape` error.
pub fn decode_sample(raw: &str) -> Result<SensorSample, DecodeError> {
    let value: Value = serde_json::from_str(raw).map_err(DecodeError::Malformed)?;
    if !value.is_object() {
        return Err(DecodeError::Shape(format!(
            "expected an object, got {}",
            kind(&value)
        )));
    }
    serde_json::from_value(value).map_err(|e| DecodeError::Shape(e.to_string()))
}

/// Decodes a binary frame, which must still hold UTF-8 JSON
pub fn decode_bytes(raw: &[u8]) -> Result<SensorSample, DecodeError> {
    let text = std::str::from_utf8(raw).map_err(|_| DecodeError::NotUtf8)?;
    decode_sample(text)
}

/// Shortens a payload for logging without splitting a character
pub fn preview(raw: &str) -> &str {
    match raw.char_indices().nth(PREVIEW_CHARS) {
        Some((end, _)) => &raw[..end],
        None => raw,
    }
}

/// Acknowledgment sent after an applied sample when enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ack {
    pub status: &'static str,
    pub direction: Direction,
    pub gas: bool,
    pub brake: bool,
    pub steering_axis: Option<i32>,
}

impl Ack {
    pub fn ok(direction: Direction, gas: bool, brake: bool, steering_axis: Option<i32>) -> Self {
        Self {
            status: "ok",
            direction,
            gas,
            brake,
            steering_axis,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
