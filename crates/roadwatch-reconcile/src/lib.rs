//! Reconciliation of raw device readings into grid aggregates, as a batch
//! pass ([`Reconciler`]) and as a live change watcher ([`LiveWatcher`]).

pub mod config;
pub mod orchestrator;
pub mod pipeline;
pub mod tracker;
pub mod watcher;

pub use config::{ReconcileConfig, StartupToggles, DEFAULT_BATCH_LIMIT, MAX_BATCH_LIMIT};
pub use orchestrator::{ReconcileError, Reconciler, RunOptions, RunSummary};
pub use pipeline::{
    classify_record, commit_record, process_record, Classification, ItemOutcome, ItemReport,
    PipelineContext, PipelineError,
};
pub use tracker::{is_eligible, MigrationTracker};
pub use watcher::{LiveWatcher, WatcherHandle, WatcherOptions, WatcherStats};
