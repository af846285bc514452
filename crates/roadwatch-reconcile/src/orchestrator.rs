use crate::config::{clamp_limit, ReconcileConfig};
use crate::pipeline::{process_record, ItemOutcome, ItemReport, PipelineContext};
use crate::tracker::{is_eligible, MigrationTracker};
use chrono::{DateTime, Utc};
use roadwatch_core::detector::{DetectorSet, DetectorThresholds};
use roadwatch_core::normalize::derive_timestamp_ms;
use roadwatch_core::tree::{flatten, normalize_path, LeafRecord};
use roadwatch_events::{EventStore, EventStoreError};
use roadwatch_storage::AggregateStore;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to read root {path}: {source}")]
    ReadRoot {
        path: String,
        #[source]
        source: EventStoreError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunOptions {
    pub limit: usize,
    pub dry_run: bool,
    pub reprocess: bool,
}

impl From<&ReconcileConfig> for RunOptions {
    fn from(config: &ReconcileConfig) -> Self {
        Self {
            limit: config.limit,
            dry_run: config.dry_run,
            reprocess: config.reprocess,
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from(&ReconcileConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub root_path: String,
    pub dry_run: bool,
    pub reprocess: bool,
    pub limit: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Readings found below the root.
    pub scanned: u64,
    /// Eligible readings before the batch limit was applied.
    pub candidates: u64,
    /// Readings run through the pipeline in this pass.
    pub processed: u64,
    pub migrated: u64,
    pub denied: u64,
    pub errors: u64,
    /// Readings already in a terminal migration state.
    pub skipped: u64,
    /// Eligible readings left for a later pass by the batch limit.
    pub deferred: u64,
    pub by_type: BTreeMap<String, u64>,
    pub by_severity: BTreeMap<String, u64>,
    pub items: Vec<ItemReport>,
}

impl RunSummary {
    fn new(root_path: &str, options: RunOptions) -> Self {
        let now = Utc::now();
        Self {
            root_path: root_path.to_string(),
            dry_run: options.dry_run,
            reprocess: options.reprocess,
            limit: options.limit,
            started_at: now,
            finished_at: now,
            scanned: 0,
            candidates: 0,
            processed: 0,
            migrated: 0,
            denied: 0,
            errors: 0,
            skipped: 0,
            deferred: 0,
            by_type: BTreeMap::new(),
            by_severity: BTreeMap::new(),
            items: Vec::new(),
        }
    }

    fn record(&mut self, item: ItemReport) {
        self.processed += 1;
        match item.outcome {
            ItemOutcome::Migrated => {
                self.migrated += 1;
                for event in &item.events {
                    *self.by_type.entry(event.kind.as_str().to_string()).or_default() += 1;
                    *self
                        .by_severity
                        .entry(event.severity.as_str().to_string())
                        .or_default() += 1;
                }
            }
            ItemOutcome::Denied => self.denied += 1,
            ItemOutcome::Error => self.errors += 1,
            ItemOutcome::Skipped => self.skipped += 1,
        }
        self.items.push(item);
    }
}

/// Batch reconciliation of the event store into the aggregation table.
pub struct Reconciler {
    events: Arc<dyn EventStore>,
    ctx: PipelineContext,
    root_path: String,
    thresholds: DetectorThresholds,
}

impl Reconciler {
    pub fn new(
        events: Arc<dyn EventStore>,
        aggregates: Arc<AggregateStore>,
        config: &ReconcileConfig,
    ) -> Self {
        let tracker = MigrationTracker::new(events.clone());
        Self {
            events,
            ctx: PipelineContext {
                aggregates,
                tracker,
            },
            root_path: normalize_path(&config.root_path),
            thresholds: config.thresholds,
        }
    }

    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    /// One pass over the root. Only failing to read the root aborts the run;
    /// every per-record failure is reported in the summary.
    pub fn run(&self, options: RunOptions) -> Result<RunSummary, ReconcileError> {
        let options = RunOptions {
            limit: clamp_limit(options.limit),
            ..options
        };
        let mut summary = RunSummary::new(&self.root_path, options);
        info!(
            event = "reconcile_start",
            root = %self.root_path,
            limit = options.limit,
            dry_run = options.dry_run,
            reprocess = options.reprocess
        );

        let tree = self
            .events
            .read_subtree(&self.root_path)
            .map_err(|source| {
                error!(event = "reconcile_root_failed", root = %self.root_path, error = %source);
                ReconcileError::ReadRoot {
                    path: self.root_path.clone(),
                    source,
                }
            })?;
        let leaves = tree
            .map(|tree| flatten(&self.root_path, &tree))
            .unwrap_or_default();
        summary.scanned = leaves.len() as u64;

        let batch = select_batch(leaves, options, &mut summary);

        let mut detectors = DetectorSet::new(self.thresholds);
        for leaf in &batch {
            let item = process_record(&self.ctx, leaf, &mut detectors, options.dry_run);
            summary.record(item);
        }

        summary.finished_at = Utc::now();
        info!(
            event = "reconcile_finished",
            root = %self.root_path,
            scanned = summary.scanned,
            candidates = summary.candidates,
            migrated = summary.migrated,
            denied = summary.denied,
            errors = summary.errors,
            skipped = summary.skipped,
            dry_run = options.dry_run
        );
        Ok(summary)
    }
}

/// Eligible records in replay order, trimmed to the most recent `limit`.
fn select_batch(
    leaves: Vec<LeafRecord>,
    options: RunOptions,
    summary: &mut RunSummary,
) -> Vec<LeafRecord> {
    let mut candidates: Vec<(Option<i64>, LeafRecord)> = Vec::with_capacity(leaves.len());
    for leaf in leaves {
        if is_eligible(&leaf.payload, options.reprocess) {
            let timestamp = derive_timestamp_ms(&leaf.payload, Some(&leaf.key));
            candidates.push((timestamp, leaf));
        } else {
            summary.skipped += 1;
        }
    }
    summary.candidates = candidates.len() as u64;

    // stable, so readings sharing a timestamp keep their tree order
    candidates.sort_by_key(|(timestamp, _)| *timestamp);
    let start = candidates.len().saturating_sub(options.limit);
    summary.deferred = start as u64;
    candidates
        .into_iter()
        .skip(start)
        .map(|(_, leaf)| leaf)
        .collect()
}
