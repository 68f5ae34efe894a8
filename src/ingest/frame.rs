use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::Deserialize;
use serde_json::Value;

use crate::db::SensorReading;
use crate::error::{LoggerError, Result};

/// The fields of an rtl_433 JSON event that get stored. Everything else on
/// the line (`time`, `model`, ...) is ignored.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DecodedFrame {
    pub id: i64,
    #[serde(rename = "temperature_C")]
    pub temperature_c: f64,
    pub io: String,
}

impl DecodedFrame {
    /// Only a JSON object with named fields counts as a frame; serde would
    /// otherwise accept an array in field order.
    pub fn parse(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line.trim())?;
        if !value.is_object() {
            return Err(LoggerError::MalformedRecord(serde_json::Error::custom(
                "decoder record is not a JSON object",
            )));
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn into_reading(self, captured_at: DateTime<Utc>) -> SensorReading {
        SensorReading::new(captured_at, self.id, self.temperature_c, self.io)
    }
}
