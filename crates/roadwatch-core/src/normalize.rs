use crate::{RawFlags, Reading};
use chrono::DateTime;
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

// Alias tables are matched case-insensitively; earlier entries win.
pub const LATITUDE_KEYS: &[&str] = &["latitude", "lat"];
pub const LONGITUDE_KEYS: &[&str] = &["longitude", "lng", "lon", "long"];
pub const VIBRATION_KEYS: &[&str] = &[
    "vibration",
    "zcorrected",
    "z_corrected",
    "accelz",
    "accel_z",
    "z",
];
pub const SPEED_KMH_KEYS: &[&str] = &["speed", "speedkmh", "speed_kmh"];
pub const SPEED_MPS_KEYS: &[&str] = &["speedmps", "speed_mps"];
pub const TIMESTAMP_KEYS: &[&str] = &[
    "timestampms",
    "timestamp_ms",
    "timestamp",
    "ts",
    "time",
    "createdat",
    "created_at",
];
pub const POTHOLE_FLAG_KEYS: &[&str] = &[
    "potholeflag",
    "pothole_flag",
    "pothole",
    "ispothole",
    "is_pothole",
];
pub const PATCHY_FLAG_KEYS: &[&str] = &[
    "patchyflag",
    "patchy_flag",
    "patchy",
    "ispatchy",
    "is_patchy",
];

/// Epoch values below this are seconds, not milliseconds.
const EPOCH_MS_CUTOFF: f64 = 1e12;
const MPS_TO_KMH: f64 = 3.6;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("gps not locked or zero coordinates")]
    GpsNotLocked,
}

impl NormalizeError {
    pub fn reason_code(&self) -> String {
        match self {
            NormalizeError::InvalidPayload(detail) => format!("invalid_payload:{detail}"),
            NormalizeError::GpsNotLocked => "gps_not_locked_or_zero_coords".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum NumericField {
    Absent,
    Invalid,
    Finite(f64),
}

/// Case-folded view over a payload object.
struct FieldIndex<'a> {
    by_lower: HashMap<String, &'a Value>,
}

impl<'a> FieldIndex<'a> {
    fn new(map: &'a Map<String, Value>) -> Self {
        let mut by_lower = HashMap::with_capacity(map.len());
        for (key, value) in map {
            by_lower.entry(key.to_lowercase()).or_insert(value);
        }
        Self { by_lower }
    }

    fn first(&self, keys: &[&str]) -> Option<&'a Value> {
        keys.iter()
            .filter_map(|key| self.by_lower.get(*key).copied())
            .find(|value| !value.is_null())
    }

    fn has_any(&self, keys: &[&str]) -> bool {
        self.first(keys).is_some()
    }

    fn numeric(&self, keys: &[&str]) -> NumericField {
        match self.first(keys) {
            None => NumericField::Absent,
            Some(value) => match parse_number(value) {
                Some(number) if number.is_finite() => NumericField::Finite(number),
                _ => NumericField::Invalid,
            },
        }
    }
}

pub fn has_coordinate_fields(map: &Map<String, Value>) -> bool {
    let index = FieldIndex::new(map);
    index.has_any(LATITUDE_KEYS) && index.has_any(LONGITUDE_KEYS)
}

pub fn has_flag_fields(map: &Map<String, Value>) -> bool {
    let index = FieldIndex::new(map);
    index.first(POTHOLE_FLAG_KEYS).is_some_and(is_flag_value)
        || index.first(PATCHY_FLAG_KEYS).is_some_and(is_flag_value)
}

/// Builds a canonical [`Reading`] from a raw payload. `storage_key` is the key the
/// record is stored under and backs up a missing timestamp.
pub fn normalize_reading(
    payload: &Value,
    storage_key: Option<&str>,
) -> Result<Reading, NormalizeError> {
    let Some(map) = payload.as_object() else {
        return Err(NormalizeError::InvalidPayload("not_an_object".to_string()));
    };
    let index = FieldIndex::new(map);

    let (latitude, longitude) = match (index.numeric(LATITUDE_KEYS), index.numeric(LONGITUDE_KEYS)) {
        (NumericField::Absent, NumericField::Absent) => return Err(NormalizeError::GpsNotLocked),
        (NumericField::Absent, _) => {
            return Err(NormalizeError::InvalidPayload("missing_latitude".to_string()))
        }
        (_, NumericField::Absent) => {
            return Err(NormalizeError::InvalidPayload("missing_longitude".to_string()))
        }
        (NumericField::Invalid, _) => {
            return Err(NormalizeError::InvalidPayload("invalid_latitude".to_string()))
        }
        (_, NumericField::Invalid) => {
            return Err(NormalizeError::InvalidPayload("invalid_longitude".to_string()))
        }
        (NumericField::Finite(lat), NumericField::Finite(lng)) => (lat, lng),
    };

    if latitude == 0.0 && longitude == 0.0 {
        return Err(NormalizeError::GpsNotLocked);
    }
    if !(-90.0..=90.0).contains(&latitude) {
        return Err(NormalizeError::InvalidPayload(
            "latitude_out_of_range".to_string(),
        ));
    }
    if !(-180.0..=180.0).contains(&longitude) {
        return Err(NormalizeError::InvalidPayload(
            "longitude_out_of_range".to_string(),
        ));
    }

    let vibration = match index.numeric(VIBRATION_KEYS) {
        NumericField::Finite(value) => value,
        NumericField::Absent | NumericField::Invalid => f64::NAN,
    };

    let speed = match index.numeric(SPEED_KMH_KEYS) {
        NumericField::Finite(value) => value,
        NumericField::Invalid => f64::NAN,
        NumericField::Absent => match index.numeric(SPEED_MPS_KEYS) {
            NumericField::Finite(value) => value * MPS_TO_KMH,
            NumericField::Absent | NumericField::Invalid => f64::NAN,
        },
    };

    let pothole_flag = index.first(POTHOLE_FLAG_KEYS).filter(|value| is_flag_value(value));
    let patchy_flag = index.first(PATCHY_FLAG_KEYS).filter(|value| is_flag_value(value));
    let raw_flags = if pothole_flag.is_some() || patchy_flag.is_some() {
        Some(RawFlags {
            pothole: pothole_flag.map(parse_flag).unwrap_or(false),
            patchy: patchy_flag.map(parse_flag).unwrap_or(false),
        })
    } else {
        None
    };

    Ok(Reading {
        latitude,
        longitude,
        vibration,
        speed,
        timestamp_ms: timestamp_from_index(&index).or_else(|| storage_key.and_then(key_timestamp)),
        raw_flags,
    })
}

/// Event time of a record in epoch milliseconds, used for ordering even when
/// the rest of the payload is unusable.
pub fn derive_timestamp_ms(payload: &Value, storage_key: Option<&str>) -> Option<i64> {
    payload
        .as_object()
        .and_then(|map| timestamp_from_index(&FieldIndex::new(map)))
        .or_else(|| storage_key.and_then(key_timestamp))
}

fn timestamp_from_index(index: &FieldIndex<'_>) -> Option<i64> {
    let value = index.first(TIMESTAMP_KEYS)?;
    match value {
        Value::Number(number) => number.as_f64().and_then(epoch_to_ms),
        Value::String(text) => {
            let trimmed = text.trim();
            if let Ok(number) = trimmed.parse::<f64>() {
                return epoch_to_ms(number);
            }
            DateTime::parse_from_rfc3339(trimmed)
                .ok()
                .map(|timestamp| timestamp.timestamp_millis())
        }
        _ => None,
    }
}

fn key_timestamp(key: &str) -> Option<i64> {
    key.trim().parse::<f64>().ok().and_then(epoch_to_ms)
}

fn epoch_to_ms(value: f64) -> Option<i64> {
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    let millis = if value < EPOCH_MS_CUTOFF {
        value * 1000.0
    } else {
        value
    };
    if millis > i64::MAX as f64 {
        return None;
    }
    Some(millis.round() as i64)
}

/// Permissive numeric parse. Non-finite results are returned as-is so the
/// caller can tell "invalid" from "absent". Booleans are only meaningful as
/// flags and never parse as a measurement.
fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn is_flag_value(value: &Value) -> bool {
    matches!(value, Value::Bool(_) | Value::Number(_) | Value::String(_))
}

fn parse_flag(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => matches!(
            text.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        _ => false,
    }
}
