//! Single-record pipeline shared by the batch reconciler and the live watcher:
//! normalize, detect, aggregate, then record the outcome on the source.

use crate::tracker::MigrationTracker;
use roadwatch_core::detector::{AnomalyDetector, DetectorSet, DetectorVariant};
use roadwatch_core::normalize::{derive_timestamp_ms, normalize_reading, NormalizeError};
use roadwatch_core::tree::LeafRecord;
use roadwatch_core::{payload_fingerprint, AnomalyEvent, STORAGE_FAILURE_PREFIX};
use roadwatch_events::EventStoreError;
use roadwatch_storage::{AggregateStore, SourceApply, SourceVersion, StorageError};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("gps not locked or zero coordinates")]
    GpsNotLocked,
    #[error("no anomaly detected")]
    NoAnomalyDetected,
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("event store failure: {0}")]
    EventStore(#[from] EventStoreError),
}

impl PipelineError {
    /// Stable code written into the sidecar `error` field.
    pub fn reason_code(&self) -> String {
        match self {
            PipelineError::InvalidPayload(detail) => format!("invalid_payload:{detail}"),
            PipelineError::GpsNotLocked => "gps_not_locked_or_zero_coords".to_string(),
            PipelineError::NoAnomalyDetected => "no_anomaly_detected".to_string(),
            PipelineError::Storage(err) => format!("{STORAGE_FAILURE_PREFIX}{err}"),
            PipelineError::EventStore(err) => format!("{STORAGE_FAILURE_PREFIX}{err}"),
        }
    }

    /// Classification failures deny the record; infrastructure failures are errors.
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            PipelineError::InvalidPayload(_)
                | PipelineError::GpsNotLocked
                | PipelineError::NoAnomalyDetected
        )
    }
}

impl From<NormalizeError> for PipelineError {
    fn from(err: NormalizeError) -> Self {
        match err {
            NormalizeError::InvalidPayload(detail) => PipelineError::InvalidPayload(detail),
            NormalizeError::GpsNotLocked => PipelineError::GpsNotLocked,
        }
    }
}

/// Stores a record's outcome touches.
#[derive(Clone)]
pub struct PipelineContext {
    pub aggregates: Arc<AggregateStore>,
    pub tracker: MigrationTracker,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub variant: DetectorVariant,
    pub events: Vec<AnomalyEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    Migrated,
    Denied,
    Error,
    Skipped,
}

impl ItemOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemOutcome::Migrated => "migrated",
            ItemOutcome::Denied => "denied",
            ItemOutcome::Error => "error",
            ItemOutcome::Skipped => "skipped",
        }
    }
}

/// Audit entry for one processed record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemReport {
    pub path: String,
    pub key: String,
    pub timestamp_ms: Option<i64>,
    pub outcome: ItemOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<AnomalyEvent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub grid_ids: Vec<String>,
}

impl ItemReport {
    fn new(leaf: &LeafRecord) -> Self {
        Self {
            path: leaf.path.clone(),
            key: leaf.key.clone(),
            timestamp_ms: derive_timestamp_ms(&leaf.payload, Some(&leaf.key)),
            outcome: ItemOutcome::Skipped,
            reason: None,
            events: Vec::new(),
            grid_ids: Vec::new(),
        }
    }
}

/// Normalizes a record and feeds it to the detectors. A reading that
/// produces no event is reported as [`PipelineError::NoAnomalyDetected`].
pub fn classify_record(
    leaf: &LeafRecord,
    detectors: &mut DetectorSet,
) -> Result<Classification, PipelineError> {
    let reading = normalize_reading(&leaf.payload, Some(&leaf.key))?;
    let variant = DetectorVariant::for_reading(&reading);
    let events = detectors.observe(&reading);
    if events.is_empty() {
        return Err(PipelineError::NoAnomalyDetected);
    }
    Ok(Classification {
        variant,
        events,
    })
}

/// Aggregates the events of one record and marks it migrated. When the
/// aggregation fails nothing is kept and the record is marked denied with the
/// storage error. A record version aggregated earlier, whose sidecar write
/// failed, is only marked.
pub fn commit_record(
    ctx: &PipelineContext,
    leaf: &LeafRecord,
    events: &[AnomalyEvent],
) -> Result<SourceApply, PipelineError> {
    let fingerprint = payload_fingerprint(&leaf.payload);
    let source = SourceVersion {
        path: &leaf.path,
        fingerprint: &fingerprint,
    };
    match ctx.aggregates.apply_source_events(source, events) {
        Ok(applied) => {
            if !applied.applied {
                info!(event = "source_already_aggregated", path = %leaf.path);
            }
            ctx.tracker.mark_migrated(&leaf.path, &leaf.payload, events)?;
            Ok(applied)
        }
        Err(err) => {
            let err = PipelineError::Storage(err);
            if let Err(mark_err) =
                ctx.tracker
                    .mark_denied(&leaf.path, &leaf.payload, &err.reason_code())
            {
                warn!(
                    event = "sidecar_write_failed",
                    path = %leaf.path,
                    error = %mark_err
                );
            }
            Err(err)
        }
    }
}

/// Runs one record end to end. With `dry_run` the outcome is computed the same
/// way but neither store is written.
pub fn process_record(
    ctx: &PipelineContext,
    leaf: &LeafRecord,
    detectors: &mut DetectorSet,
    dry_run: bool,
) -> ItemReport {
    let mut report = ItemReport::new(leaf);

    let classification = match classify_record(leaf, detectors) {
        Ok(classification) => classification,
        Err(err) => {
            let reason = err.reason_code();
            report.reason = Some(reason.clone());
            report.outcome = ItemOutcome::Denied;
            if dry_run {
                return report;
            }
            if let Err(mark_err) = ctx.tracker.mark_denied(&leaf.path, &leaf.payload, &reason) {
                warn!(
                    event = "sidecar_write_failed",
                    path = %leaf.path,
                    error = %mark_err
                );
                report.outcome = ItemOutcome::Error;
                report.reason = Some(PipelineError::from(mark_err).reason_code());
                return report;
            }
            info!(event = "candidate_denied", path = %leaf.path, reason = %reason);
            return report;
        }
    };

    report.grid_ids = classification
        .events
        .iter()
        .filter_map(AnomalyEvent::grid_id)
        .collect();
    report.events = classification.events;
    report.outcome = ItemOutcome::Migrated;
    if dry_run {
        return report;
    }

    match commit_record(ctx, leaf, &report.events) {
        Ok(applied) => {
            debug!(
                event = "candidate_migrated",
                path = %leaf.path,
                variant = ?classification.variant,
                cells = applied.outcomes.len()
            );
        }
        Err(err) => {
            warn!(event = "candidate_failed", path = %leaf.path, error = %err);
            report.outcome = ItemOutcome::Error;
            report.reason = Some(err.reason_code());
        }
    }
    report
}
