use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

pub mod detector;
pub mod normalize;
pub mod tree;

/// Key of the migration sidecar inside a source event record.
pub const MIGRATION_KEY: &str = "migration";

/// Prefix of denial reasons caused by infrastructure rather than the payload.
pub const STORAGE_FAILURE_PREFIX: &str = "storage_failure:";

const GRID_SCALE: f64 = 10_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "Low",
            Severity::Medium => "Medium",
            Severity::High => "High",
        }
    }

    pub fn rank(&self) -> i64 {
        match self {
            Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High => 3,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            other => Err(format!("Unknown severity: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyKind {
    Pothole,
    Patchy,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::Pothole => "pothole",
            AnomalyKind::Patchy => "patchy",
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnomalyKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "pothole" => Ok(AnomalyKind::Pothole),
            "patchy" => Ok(AnomalyKind::Patchy),
            other => Err(format!("Unknown anomaly kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFlags {
    pub pothole: bool,
    pub patchy: bool,
}

impl RawFlags {
    pub fn any(&self) -> bool {
        self.pothole || self.patchy
    }
}

/// Canonical sensor reading produced by [`normalize::normalize_reading`].
///
/// `vibration` and `speed` stay `NaN` when the payload carried nothing usable,
/// so an absent value is never mistaken for a measured zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub latitude: f64,
    pub longitude: f64,
    pub vibration: f64,
    pub speed: f64,
    pub timestamp_ms: Option<i64>,
    pub raw_flags: Option<RawFlags>,
}

impl Reading {
    pub fn has_gps_lock(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && !(self.latitude == 0.0 && self.longitude == 0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyEvent {
    #[serde(rename = "type")]
    pub kind: AnomalyKind,
    pub latitude: f64,
    pub longitude: f64,
    pub severity: Severity,
    pub timestamp_ms: Option<i64>,
}

impl AnomalyEvent {
    pub fn grid_id(&self) -> Option<String> {
        grid_id(self.latitude, self.longitude)
    }
}

/// Buckets a coordinate pair into its 4-decimal grid cell, e.g. `"12.9713_77.5946"`.
pub fn grid_id(latitude: f64, longitude: f64) -> Option<String> {
    if !latitude.is_finite() || !longitude.is_finite() {
        return None;
    }
    Some(format!(
        "{:.4}_{:.4}",
        round_to_grid(latitude),
        round_to_grid(longitude)
    ))
}

fn round_to_grid(value: f64) -> f64 {
    // adding 0.0 folds -0.0 into 0.0 so the key never renders as "-0.0000"
    (value * GRID_SCALE).round() / GRID_SCALE + 0.0
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationStatus {
    #[default]
    Pending,
    Assigned,
    InProgress,
    PendingVerification,
    Fixed,
}

impl LocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationStatus::Pending => "pending",
            LocationStatus::Assigned => "assigned",
            LocationStatus::InProgress => "in_progress",
            LocationStatus::PendingVerification => "pending_verification",
            LocationStatus::Fixed => "fixed",
        }
    }
}

impl fmt::Display for LocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LocationStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "pending" => Ok(LocationStatus::Pending),
            "assigned" => Ok(LocationStatus::Assigned),
            "in_progress" | "in-progress" => Ok(LocationStatus::InProgress),
            "pending_verification" | "pending-verification" => {
                Ok(LocationStatus::PendingVerification)
            }
            "fixed" => Ok(LocationStatus::Fixed),
            other => Err(format!("Unknown location status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    #[default]
    Pending,
    Migrated,
    Denied,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Pending => "pending",
            MigrationStatus::Migrated => "migrated",
            MigrationStatus::Denied => "denied",
        }
    }
}

impl FromStr for MigrationStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "pending" | "" => Ok(MigrationStatus::Pending),
            "migrated" => Ok(MigrationStatus::Migrated),
            "denied" => Ok(MigrationStatus::Denied),
            other => Err(format!("Unknown migration status: {other}")),
        }
    }
}

/// Reconciliation metadata merged into a source event record under [`MIGRATION_KEY`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSidecar {
    pub status: MigrationStatus,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_fingerprint: Option<String>,
}

impl MigrationSidecar {
    pub fn migrated(
        processed_at: DateTime<Utc>,
        events: &[AnomalyEvent],
        source_fingerprint: String,
    ) -> Self {
        let derived_type = if events.is_empty() {
            None
        } else {
            Some(
                events
                    .iter()
                    .map(|event| event.kind.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
            )
        };
        Self {
            status: MigrationStatus::Migrated,
            processed_at: Some(processed_at),
            error: None,
            derived_type,
            derived_severity: events.iter().map(|event| event.severity).max(),
            source_fingerprint: Some(source_fingerprint),
        }
    }

    pub fn denied(
        processed_at: DateTime<Utc>,
        reason: impl Into<String>,
        source_fingerprint: String,
    ) -> Self {
        Self {
            status: MigrationStatus::Denied,
            processed_at: Some(processed_at),
            error: Some(reason.into()),
            derived_type: None,
            derived_severity: None,
            source_fingerprint: Some(source_fingerprint),
        }
    }

    /// A denial caused by a storage failure says nothing about the payload,
    /// so the record stays retryable.
    pub fn is_retryable_denial(&self) -> bool {
        self.status == MigrationStatus::Denied
            && self
                .error
                .as_deref()
                .is_some_and(|reason| reason.starts_with(STORAGE_FAILURE_PREFIX))
    }

    /// Reads the sidecar of a record. A sidecar written by another tool with
    /// unexpected field types still yields its status.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let raw = payload.get(MIGRATION_KEY)?;
        if let Ok(sidecar) = serde_json::from_value::<MigrationSidecar>(raw.clone()) {
            return Some(sidecar);
        }
        let status = raw
            .get("status")
            .and_then(Value::as_str)
            .and_then(|value| value.parse::<MigrationStatus>().ok())?;
        Some(Self {
            status,
            processed_at: None,
            derived_type: None,
            derived_severity: None,
            error: raw.get("error").and_then(Value::as_str).map(str::to_string),
            source_fingerprint: raw
                .get("sourceFingerprint")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

/// Hash of the device-owned part of a record; the sidecar is excluded so
/// writing it never changes the fingerprint.
pub fn payload_fingerprint(payload: &Value) -> String {
    let canonical = match payload {
        Value::Object(map) => {
            let mut stripped = map.clone();
            stripped.remove(MIGRATION_KEY);
            Value::Object(stripped)
        }
        other => other.clone(),
    };
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    sha256_hex(&bytes)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn severity_ordering_is_total() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        let merged = [Severity::Low, Severity::High, Severity::Medium]
            .into_iter()
            .max()
            .expect("non-empty");
        assert_eq!(merged, Severity::High);
        assert_eq!("medium".parse::<Severity>(), Ok(Severity::Medium));
    }

    #[test]
    fn grid_id_rounds_to_four_decimals() {
        assert_eq!(
            grid_id(12.97134, 77.59463).as_deref(),
            Some("12.9713_77.5946")
        );
        assert_eq!(
            grid_id(12.97129, 77.59458).as_deref(),
            Some("12.9713_77.5946")
        );
        assert_eq!(grid_id(-0.00001, 0.00001).as_deref(), Some("0.0000_0.0000"));
        assert_eq!(grid_id(f64::NAN, 1.0), None);
    }

    #[test]
    fn fingerprint_ignores_sidecar() {
        let payload = json!({"lat": 12.9, "lng": 77.5, "potholeFlag": true});
        let mut annotated = payload.clone();
        annotated[MIGRATION_KEY] = json!({"status": "denied"});
        assert_eq!(payload_fingerprint(&payload), payload_fingerprint(&annotated));

        let flipped = json!({"lat": 12.9, "lng": 77.5, "potholeFlag": false});
        assert_ne!(payload_fingerprint(&payload), payload_fingerprint(&flipped));
    }

    #[test]
    fn sidecar_roundtrip_uses_camel_case() {
        let at = Utc
            .with_ymd_and_hms(2026, 3, 1, 8, 0, 0)
            .single()
            .expect("valid timestamp");
        let event = AnomalyEvent {
            kind: AnomalyKind::Pothole,
            latitude: 12.9,
            longitude: 77.5,
            severity: Severity::High,
            timestamp_ms: None,
        };
        let sidecar = MigrationSidecar::migrated(at, &[event], "abc".to_string());
        let value = serde_json::to_value(&sidecar).expect("serialize");
        assert_eq!(value["status"], "migrated");
        assert_eq!(value["derivedType"], "pothole");
        assert_eq!(value["derivedSeverity"], "High");
        assert!(value.get("error").is_none());

        let payload = json!({ "migration": value });
        assert_eq!(MigrationSidecar::from_payload(&payload), Some(sidecar));
    }

    #[test]
    fn foreign_sidecar_still_yields_status() {
        let payload = json!({"migration": {"status": "migrated", "processedAt": 1_700_000_000_000i64}});
        let sidecar = MigrationSidecar::from_payload(&payload).expect("status readable");
        assert_eq!(sidecar.status, MigrationStatus::Migrated);
        assert_eq!(sidecar.processed_at, None);
    }
}
