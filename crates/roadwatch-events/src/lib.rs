//! Seam to the external hierarchical event store the devices write into.
//!
//! The store is a tree of JSON objects addressed by `/`-separated paths. The
//! reconciler needs three things from it: read a subtree once, merge fields
//! into one leaf, and subscribe to child additions and changes below a node.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::any::Any;
use thiserror::Error;
use tokio::sync::mpsc;

mod fs;
mod memory;

pub use fs::FsEventStore;
pub use memory::MemoryEventStore;

#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("watch error: {0}")]
    Notify(#[from] notify::Error),
    #[error("no record stored at {0}")]
    Missing(String),
    #[error("node at {0} is not an object")]
    NotALeaf(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("event store lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    ChildAdded,
    ChildChanged,
}

/// A direct child of a subscribed node was added or changed somewhere below.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChildChange {
    pub kind: ChangeKind,
    /// Normalized path of the subscribed node.
    pub parent: String,
    pub key: String,
}

impl ChildChange {
    pub fn path(&self) -> String {
        roadwatch_core::tree::join_path(&self.parent, &self.key)
    }
}

/// Live feed of [`ChildChange`]s. Existing children are replayed as
/// `ChildAdded` first. Dropping the subscription detaches it.
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<ChildChange>,
    _guard: Option<Box<dyn Any + Send>>,
}

impl Subscription {
    pub(crate) fn new(
        receiver: mpsc::UnboundedReceiver<ChildChange>,
        guard: Option<Box<dyn Any + Send>>,
    ) -> Self {
        Self {
            receiver,
            _guard: guard,
        }
    }

    pub async fn next(&mut self) -> Option<ChildChange> {
        self.receiver.recv().await
    }

    pub fn try_next(&mut self) -> Option<ChildChange> {
        self.receiver.try_recv().ok()
    }
}

pub trait EventStore: Send + Sync + 'static {
    /// Reads the whole subtree at `path`; `Ok(None)` when nothing is stored there.
    fn read_subtree(&self, path: &str) -> Result<Option<Value>, EventStoreError>;

    /// Merges `patch` key by key into the object at `path`. Keys not named in
    /// the patch are left untouched.
    fn merge_update(&self, path: &str, patch: &Map<String, Value>) -> Result<(), EventStoreError>;

    fn subscribe(&self, path: &str) -> Result<Subscription, EventStoreError>;
}
