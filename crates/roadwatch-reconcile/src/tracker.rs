use chrono::Utc;
use roadwatch_core::{
    payload_fingerprint, AnomalyEvent, MigrationSidecar, MigrationStatus, MIGRATION_KEY,
};
use roadwatch_events::{EventStore, EventStoreError};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Whether a source record still needs processing.
///
/// `migrated` is terminal. `denied` is terminal until the device rewrites the
/// record, detected by comparing the payload against the fingerprint stored
/// at denial time, unless the denial came from a storage failure. `reprocess`
/// overrides both.
pub fn is_eligible(payload: &Value, reprocess: bool) -> bool {
    if reprocess {
        return true;
    }
    let Some(sidecar) = MigrationSidecar::from_payload(payload) else {
        return true;
    };
    match sidecar.status {
        MigrationStatus::Pending => true,
        MigrationStatus::Migrated => false,
        MigrationStatus::Denied if sidecar.is_retryable_denial() => true,
        MigrationStatus::Denied => sidecar
            .source_fingerprint
            .as_deref()
            .is_some_and(|stored| stored != payload_fingerprint(payload)),
    }
}

/// Writes migration sidecars back into the event store.
#[derive(Clone)]
pub struct MigrationTracker {
    store: Arc<dyn EventStore>,
}

impl MigrationTracker {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    pub fn is_eligible(&self, payload: &Value, reprocess: bool) -> bool {
        is_eligible(payload, reprocess)
    }

    pub fn mark_migrated(
        &self,
        path: &str,
        payload: &Value,
        events: &[AnomalyEvent],
    ) -> Result<MigrationSidecar, EventStoreError> {
        let sidecar = MigrationSidecar::migrated(Utc::now(), events, payload_fingerprint(payload));
        self.write(path, &sidecar)?;
        Ok(sidecar)
    }

    pub fn mark_denied(
        &self,
        path: &str,
        payload: &Value,
        reason: &str,
    ) -> Result<MigrationSidecar, EventStoreError> {
        let sidecar = MigrationSidecar::denied(Utc::now(), reason, payload_fingerprint(payload));
        self.write(path, &sidecar)?;
        Ok(sidecar)
    }

    fn write(&self, path: &str, sidecar: &MigrationSidecar) -> Result<(), EventStoreError> {
        let value = serde_json::to_value(sidecar).map_err(|source| EventStoreError::Json {
            path: path.to_string(),
            source,
        })?;
        let mut patch = Map::new();
        patch.insert(MIGRATION_KEY.to_string(), value);
        self.store.merge_update(path, &patch)
    }
}
