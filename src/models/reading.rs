//! Sensor reading data model.
//!
//! A `Reading` serializes directly to the wire schema shared by the edge buffer and
//! the remote endpoint: `{timestamp, device, data}` where `data` depends on the stream.

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MalformedRecord;

/// Pressure cells reported by one insole.
pub const FOOT_VALUE_COUNT: usize = 18;

/// Inertial channels: acc x/y/z, gyro x/y/z, roll/pitch/yaw.
pub const INERTIAL_VALUE_COUNT: usize = 9;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamKind {
    #[serde(rename = "foot")]
    Foot,
    #[serde(rename = "accel", alias = "inertial")]
    Inertial,
}

impl StreamKind {
    /// Fixed order used wherever streams are laid out side by side.
    pub const ALL: [StreamKind; 2] = [StreamKind::Foot, StreamKind::Inertial];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Foot => "foot",
            StreamKind::Inertial => "accel",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "foot" => Some(StreamKind::Foot),
            "accel" | "inertial" | "accelerometer" => Some(StreamKind::Inertial),
            _ => None,
        }
    }

    /// Event name the remote side expects for this stream.
    pub fn event_name(&self) -> &'static str {
        match self {
            StreamKind::Foot => "foot_pressure_data",
            StreamKind::Inertial => "accelerometer_data",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum FootSide {
    Left,
    Right,
}

impl FootSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            FootSide::Left => "LEFT",
            FootSide::Right => "RIGHT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "LEFT" => Some(FootSide::Left),
            "RIGHT" => Some(FootSide::Right),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FootData {
    pub foot: FootSide,
    #[serde(default)]
    pub max: f64,
    #[serde(default)]
    pub avg: f64,
    #[serde(default)]
    pub active_count: u32,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Axis3 {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Orientation {
    #[serde(default)]
    pub roll: f64,
    #[serde(default)]
    pub pitch: f64,
    #[serde(default)]
    pub yaw: f64,
}

/// Missing channels decode as 0.0.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct InertialData {
    #[serde(default)]
    pub acc: Axis3,
    #[serde(default)]
    pub gyro: Axis3,
    #[serde(default)]
    pub angle: Orientation,
}

impl InertialData {
    pub fn channels(&self) -> [f64; INERTIAL_VALUE_COUNT] {
        [
            self.acc.x,
            self.acc.y,
            self.acc.z,
            self.gyro.x,
            self.gyro.y,
            self.gyro.z,
            self.angle.roll,
            self.angle.pitch,
            self.angle.yaw,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReadingData {
    Foot(FootData),
    Inertial(InertialData),
}

/// One sensor sample as captured on the edge device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: String,
    pub device: String,
    pub data: ReadingData,
}

impl Reading {
    pub fn foot(timestamp: impl Into<String>, device: impl Into<String>, data: FootData) -> Self {
        Self {
            timestamp: timestamp.into(),
            device: device.into(),
            data: ReadingData::Foot(data),
        }
    }

    pub fn inertial(
        timestamp: impl Into<String>,
        device: impl Into<String>,
        data: InertialData,
    ) -> Self {
        Self {
            timestamp: timestamp.into(),
            device: device.into(),
            data: ReadingData::Inertial(data),
        }
    }

    pub fn kind(&self) -> StreamKind {
        match self.data {
            ReadingData::Foot(_) => StreamKind::Foot,
            ReadingData::Inertial(_) => StreamKind::Inertial,
        }
    }

    pub fn timestamp_ms(&self) -> Result<i64, MalformedRecord> {
        parse_timestamp_ms(&self.timestamp)
            .ok_or_else(|| MalformedRecord::Timestamp(self.timestamp.clone()))
    }

    /// Validate a loosely shaped JSON record for the given stream.
    ///
    /// A missing timestamp is kept as an empty string so downstream consumers fall
    /// back to receive time; a missing device becomes `"unknown"`.
    pub fn from_wire(stream: StreamKind, value: &Value) -> Result<Self, MalformedRecord> {
        let object = value
            .as_object()
            .ok_or(MalformedRecord::NotAnObject { stream })?;

        let timestamp = match object.get("timestamp") {
            Some(Value::String(raw)) => raw.clone(),
            None | Some(Value::Null) => String::new(),
            Some(other) => {
                return Err(MalformedRecord::Shape {
                    stream,
                    reason: format!("timestamp must be a string, got {other}"),
                })
            }
        };
        let device = object
            .get("device")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        let data = object.get("data").cloned().unwrap_or(Value::Null);
        let data = match stream {
            StreamKind::Foot => {
                let foot: FootData =
                    serde_json::from_value(data).map_err(|err| MalformedRecord::Shape {
                        stream,
                        reason: err.to_string(),
                    })?;
                if foot.values.len() != FOOT_VALUE_COUNT {
                    return Err(MalformedRecord::Shape {
                        stream,
                        reason: format!(
                            "expected {FOOT_VALUE_COUNT} pressure values, got {}",
                            foot.values.len()
                        ),
                    });
                }
                ReadingData::Foot(foot)
            }
            StreamKind::Inertial => {
                if !data.is_object() {
                    return Err(MalformedRecord::Shape {
                        stream,
                        reason: "data must be an object".into(),
                    });
                }
                let inertial: InertialData =
                    serde_json::from_value(data).map_err(|err| MalformedRecord::Shape {
                        stream,
                        reason: err.to_string(),
                    })?;
                ReadingData::Inertial(inertial)
            }
        };

        Ok(Self {
            timestamp,
            device,
            data,
        })
    }
}

/// A reading as held by the edge buffer. `sent` only ever moves from false to true.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedRecord {
    pub id: i64,
    pub reading: Reading,
    pub sent: bool,
}

/// Epoch milliseconds for an ISO-8601 timestamp. Offset-less values are read as UTC.
pub fn parse_timestamp_ms(value: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.timestamp_millis());
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc().timestamp_millis())
}
