use crate::{ChangeKind, ChildChange, EventStore, EventStoreError, Subscription};
use roadwatch_core::tree::normalize_path;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use tokio::sync::mpsc;

struct Listener {
    segments: Vec<String>,
    path: String,
    sender: mpsc::UnboundedSender<ChildChange>,
}

/// In-process event store. Change notifications follow the hierarchical
/// model: a write anywhere below a child of a subscribed node is reported as
/// a change of that child.
#[derive(Default)]
pub struct MemoryEventStore {
    root: RwLock<Value>,
    listeners: Mutex<Vec<Listener>>,
    writes: AtomicU64,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tree(tree: Value) -> Self {
        Self {
            root: RwLock::new(tree),
            listeners: Mutex::new(Vec::new()),
            writes: AtomicU64::new(0),
        }
    }

    /// Device-side write: replaces whatever is stored at `path`.
    pub fn put(&self, path: &str, value: Value) -> Result<(), EventStoreError> {
        self.write(path, true, |slot| {
            *slot = value;
            Ok(())
        })
    }

    /// Number of writes applied since construction.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Result<Value, EventStoreError> {
        let root = self.root.read().map_err(|_| EventStoreError::Poisoned)?;
        Ok(root.clone())
    }

    fn write<F>(&self, path: &str, create: bool, apply: F) -> Result<(), EventStoreError>
    where
        F: FnOnce(&mut Value) -> Result<(), EventStoreError>,
    {
        let segments = split_path(path);
        // listeners stay locked for the whole write so a concurrent subscribe
        // sees either the state before or after it, never half of it
        let mut listeners = self.listeners.lock().map_err(|_| EventStoreError::Poisoned)?;
        listeners.retain(|listener| !listener.sender.is_closed());
        let mut root = self.root.write().map_err(|_| EventStoreError::Poisoned)?;

        if !create && node(&root, &segments).is_none() {
            return Err(EventStoreError::Missing(normalize_path(path)));
        }

        let related: Vec<(usize, Option<Value>)> = listeners
            .iter()
            .enumerate()
            .filter(|(_, listener)| {
                is_prefix(&listener.segments, &segments) || is_prefix(&segments, &listener.segments)
            })
            .map(|(index, listener)| (index, node(&root, &listener.segments).cloned()))
            .collect();

        apply(node_mut(&mut root, &segments))?;
        self.writes.fetch_add(1, Ordering::SeqCst);

        for (index, before) in related {
            let listener = &listeners[index];
            let after = node(&root, &listener.segments);
            for change in diff_children(&listener.path, before.as_ref(), after) {
                let _ = listener.sender.send(change);
            }
        }
        Ok(())
    }
}

impl EventStore for MemoryEventStore {
    fn read_subtree(&self, path: &str) -> Result<Option<Value>, EventStoreError> {
        let root = self.root.read().map_err(|_| EventStoreError::Poisoned)?;
        Ok(node(&root, &split_path(path)).cloned())
    }

    fn merge_update(&self, path: &str, patch: &Map<String, Value>) -> Result<(), EventStoreError> {
        self.write(path, false, |slot| match slot {
            Value::Object(map) => {
                for (key, value) in patch {
                    map.insert(key.clone(), value.clone());
                }
                Ok(())
            }
            _ => Err(EventStoreError::NotALeaf(normalize_path(path))),
        })
    }

    fn subscribe(&self, path: &str) -> Result<Subscription, EventStoreError> {
        let segments = split_path(path);
        let normalized = normalize_path(path);
        let (sender, receiver) = mpsc::unbounded_channel();

        let mut listeners = self.listeners.lock().map_err(|_| EventStoreError::Poisoned)?;
        let root = self.root.read().map_err(|_| EventStoreError::Poisoned)?;
        for change in diff_children(&normalized, None, node(&root, &segments)) {
            let _ = sender.send(change);
        }
        listeners.push(Listener {
            segments,
            path: normalized,
            sender,
        });

        Ok(Subscription::new(receiver, None))
    }
}

fn split_path(path: &str) -> Vec<String> {
    normalize_path(path)
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

fn is_prefix(prefix: &[String], full: &[String]) -> bool {
    prefix.len() <= full.len() && prefix == &full[..prefix.len()]
}

fn node<'a>(root: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

fn node_mut<'a>(root: &'a mut Value, segments: &[String]) -> &'a mut Value {
    let mut current = root;
    for segment in segments {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => map.entry(segment.clone()).or_insert(Value::Null),
            other => other,
        };
    }
    current
}

fn diff_children(parent: &str, before: Option<&Value>, after: Option<&Value>) -> Vec<ChildChange> {
    let empty = Map::new();
    let before = before.and_then(Value::as_object).unwrap_or(&empty);
    let after = after.and_then(Value::as_object).unwrap_or(&empty);

    let mut changes = Vec::new();
    for (key, value) in after {
        let kind = match before.get(key) {
            None => ChangeKind::ChildAdded,
            Some(previous) if previous != value => ChangeKind::ChildChanged,
            Some(_) => continue,
        };
        changes.push(ChildChange {
            kind,
            parent: parent.to_string(),
            key: key.clone(),
        });
    }
    changes
}
