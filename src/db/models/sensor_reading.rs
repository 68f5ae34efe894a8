//! Sensor reading data model.
//!
//! One row of `sensor_data`: a decoded measurement plus the ingestion time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single measurement accepted from the decoder.
///
/// `record_id` is `None` until the store assigns one on append.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorReading {
    pub record_id: Option<u64>,
    pub captured_at: DateTime<Utc>,
    pub sensor_id: i64,
    pub temperature_c: f64,
    pub io_field: String,
}

impl SensorReading {
    pub fn new(
        captured_at: DateTime<Utc>,
        sensor_id: i64,
        temperature_c: f64,
        io_field: impl Into<String>,
    ) -> Self {
        Self {
            record_id: None,
            captured_at,
            sensor_id,
            temperature_c,
            io_field: io_field.into(),
        }
    }
}
