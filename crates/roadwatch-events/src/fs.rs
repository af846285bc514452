use crate::{ChangeKind, ChildChange, EventStore, EventStoreError, Subscription};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use roadwatch_core::tree::normalize_path;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::warn;
use walkdir::WalkDir;

const LEAF_EXTENSION: &str = ".json";

/// Event store laid out on disk: directories are containers and each
/// `<key>.json` file is one record. When both `a/` and `a.json` exist the
/// file wins.
#[derive(Debug, Clone)]
pub struct FsEventStore {
    root: PathBuf,
}

impl FsEventStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, EventStoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| io_error(&root, source))?;
        Ok(Self { root })
    }

    /// Device-side write of a single record.
    pub fn put(&self, path: &str, value: &Value) -> Result<(), EventStoreError> {
        let file = self.leaf_file(path)?;
        write_atomic(&file, value)
    }

    fn node_dir(&self, path: &str) -> Result<PathBuf, EventStoreError> {
        let normalized = normalize_path(path);
        let mut dir = self.root.clone();
        for segment in normalized.split('/').filter(|segment| !segment.is_empty()) {
            if segment == ".." || segment.starts_with('.') || segment.contains('\\') {
                return Err(EventStoreError::InvalidPath(path.to_string()));
            }
            dir.push(segment);
        }
        Ok(dir)
    }

    fn leaf_file(&self, path: &str) -> Result<PathBuf, EventStoreError> {
        let dir = self.node_dir(path)?;
        if dir == self.root {
            return Err(EventStoreError::InvalidPath(path.to_string()));
        }
        leaf_file_for(&dir).ok_or_else(|| EventStoreError::InvalidPath(path.to_string()))
    }
}

impl EventStore for FsEventStore {
    fn read_subtree(&self, path: &str) -> Result<Option<Value>, EventStoreError> {
        let dir = self.node_dir(path)?;
        if dir != self.root {
            if let Some(file) = leaf_file_for(&dir).filter(|file| file.is_file()) {
                return read_json(&file).map(Some);
            }
        }
        if dir.is_dir() {
            return read_tree(&dir).map(Some);
        }
        Ok(None)
    }

    fn merge_update(&self, path: &str, patch: &Map<String, Value>) -> Result<(), EventStoreError> {
        let file = self.leaf_file(path)?;
        if !file.is_file() {
            return Err(EventStoreError::Missing(normalize_path(path)));
        }
        let mut record = read_json(&file)?;
        let Value::Object(map) = &mut record else {
            return Err(EventStoreError::NotALeaf(normalize_path(path)));
        };
        for (key, value) in patch {
            map.insert(key.clone(), value.clone());
        }
        write_atomic(&file, &record)
    }

    fn subscribe(&self, path: &str) -> Result<Subscription, EventStoreError> {
        let dir = self.node_dir(path)?;
        fs::create_dir_all(&dir).map_err(|source| io_error(&dir, source))?;
        let base = dir.canonicalize().map_err(|source| io_error(&dir, source))?;
        let parent = normalize_path(path);
        let (sender, receiver) = mpsc::unbounded_channel();

        let event_sender = sender.clone();
        let event_base = base.clone();
        let event_parent = parent.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for change in changes_for_event(&event_base, &event_parent, &event) {
                    let _ = event_sender.send(change);
                }
            }
            Err(err) => warn!(event = "watch_error", path = %event_base.display(), error = %err),
        })?;
        watcher.watch(&base, RecursiveMode::Recursive)?;

        // scan after the watch is live so nothing written in between is lost
        for key in child_keys(&base)? {
            let _ = sender.send(ChildChange {
                kind: ChangeKind::ChildAdded,
                parent: parent.clone(),
                key,
            });
        }

        Ok(Subscription::new(receiver, Some(Box::new(watcher))))
    }
}

fn io_error(path: &Path, source: std::io::Error) -> EventStoreError {
    EventStoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

fn leaf_file_for(dir: &Path) -> Option<PathBuf> {
    let name = dir.file_name()?.to_str()?;
    Some(dir.with_file_name(format!("{name}{LEAF_EXTENSION}")))
}

fn leaf_key(name: &str) -> Option<&str> {
    name.strip_suffix(LEAF_EXTENSION).filter(|key| !key.is_empty())
}

fn read_json(file: &Path) -> Result<Value, EventStoreError> {
    let raw = fs::read(file).map_err(|source| io_error(file, source))?;
    serde_json::from_slice(&raw).map_err(|source| EventStoreError::Json {
        path: file.display().to_string(),
        source,
    })
}

fn write_atomic(file: &Path, value: &Value) -> Result<(), EventStoreError> {
    let parent = file
        .parent()
        .ok_or_else(|| EventStoreError::InvalidPath(file.display().to_string()))?;
    fs::create_dir_all(parent).map_err(|source| io_error(parent, source))?;
    let name = file
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| EventStoreError::InvalidPath(file.display().to_string()))?;
    let tmp = parent.join(format!(".{name}.tmp"));
    let body = serde_json::to_vec_pretty(value).map_err(|source| EventStoreError::Json {
        path: file.display().to_string(),
        source,
    })?;
    fs::write(&tmp, body).map_err(|source| io_error(&tmp, source))?;
    fs::rename(&tmp, file).map_err(|source| io_error(file, source))
}

fn read_tree(dir: &Path) -> Result<Value, EventStoreError> {
    let mut root = Map::new();
    let walker = WalkDir::new(dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            if is_hidden(&name) {
                return false;
            }
            // a record file shadows a directory of the same name
            !(entry.file_type().is_dir()
                && leaf_file_for(entry.path()).is_some_and(|file| file.is_file()))
        });

    for entry in walker {
        let entry = entry.map_err(|err| {
            let path = err
                .path()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| dir.display().to_string());
            EventStoreError::Io {
                path,
                source: err.into(),
            }
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(dir) else {
            continue;
        };
        let mut segments: Vec<String> = relative
            .iter()
            .map(|part| part.to_string_lossy().into_owned())
            .collect();
        let Some(last) = segments.pop() else {
            continue;
        };
        let Some(key) = leaf_key(&last) else {
            continue;
        };
        let value = read_json(entry.path())?;
        insert_at(&mut root, &segments, key, value);
    }
    Ok(Value::Object(root))
}

fn insert_at(root: &mut Map<String, Value>, containers: &[String], key: &str, value: Value) {
    let mut current = root;
    for segment in containers {
        let slot = current
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        current = match slot {
            Value::Object(map) => map,
            _ => return,
        };
    }
    current.insert(key.to_string(), value);
}

fn child_keys(dir: &Path) -> Result<BTreeSet<String>, EventStoreError> {
    let mut keys = BTreeSet::new();
    let entries = fs::read_dir(dir).map_err(|source| io_error(dir, source))?;
    for entry in entries {
        let entry = entry.map_err(|source| io_error(dir, source))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_hidden(&name) {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            keys.insert(name);
        } else if let Some(key) = leaf_key(&name) {
            keys.insert(key.to_string());
        }
    }
    Ok(keys)
}

/// Maps a raw filesystem event to the direct children of `base` it touched.
fn changes_for_event(base: &Path, parent: &str, event: &Event) -> Vec<ChildChange> {
    let created = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To))
    );
    if !created && !matches!(event.kind, EventKind::Modify(_)) {
        return Vec::new();
    }

    let mut seen = BTreeSet::new();
    let mut changes = Vec::new();
    for path in &event.paths {
        let Ok(relative) = path.strip_prefix(base) else {
            continue;
        };
        let parts: Vec<String> = relative
            .iter()
            .map(|part| part.to_string_lossy().into_owned())
            .collect();
        if parts.is_empty() || parts.iter().any(|part| is_hidden(part)) {
            continue;
        }
        let first = &parts[0];
        let key = if parts.len() == 1 && !path.is_dir() {
            match leaf_key(first) {
                Some(key) => key.to_string(),
                None => continue,
            }
        } else {
            leaf_key(first).unwrap_or(first).to_string()
        };
        if !seen.insert(key.clone()) {
            continue;
        }
        let kind = if created && parts.len() == 1 {
            ChangeKind::ChildAdded
        } else {
            ChangeKind::ChildChanged
        };
        changes.push(ChildChange {
            kind,
            parent: parent.to_string(),
            key,
        });
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::CreateKind;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn reads_nested_layout_and_prefers_record_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsEventStore::open(dir.path()).expect("open");
        store
            .put("readings/alice/r1", &json!({"lat": 1.0, "lng": 2.0}))
            .expect("put");
        store
            .put("readings/bob/2026-03-01/r2", &json!({"patchyFlag": true}))
            .expect("put");
        fs::write(dir.path().join("readings/.scratch.json"), b"{}").expect("hidden");
        fs::create_dir_all(dir.path().join("readings/alice/r1")).expect("shadowed dir");
        fs::write(dir.path().join("readings/alice/r1/x.json"), b"{\"lat\": 9}").expect("shadowed");

        let tree = store
            .read_subtree("readings")
            .expect("read")
            .expect("present");
        assert_eq!(
            tree,
            json!({
                "alice": {"r1": {"lat": 1.0, "lng": 2.0}},
                "bob": {"2026-03-01": {"r2": {"patchyFlag": true}}}
            })
        );

        let leaf = store
            .read_subtree("readings/alice/r1")
            .expect("read")
            .expect("leaf");
        assert_eq!(leaf["lat"], 1.0);
        assert_eq!(store.read_subtree("readings/nobody").expect("read"), None);
    }

    #[test]
    fn merge_update_rewrites_only_named_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsEventStore::open(dir.path()).expect("open");
        store
            .put("readings/r1", &json!({"lat": 1.0, "lng": 2.0, "speed": 12}))
            .expect("put");

        let mut patch = Map::new();
        patch.insert("migration".to_string(), json!({"status": "denied"}));
        store.merge_update("readings/r1", &patch).expect("merge");

        let record = store
            .read_subtree("readings/r1")
            .expect("read")
            .expect("present");
        assert_eq!(record["speed"], 12);
        assert_eq!(record["migration"]["status"], "denied");

        let err = store.merge_update("readings/r9", &patch).expect_err("missing");
        assert!(matches!(err, EventStoreError::Missing(_)));
        let err = store.read_subtree("readings/../etc").expect_err("escape");
        assert!(matches!(err, EventStoreError::InvalidPath(_)));
    }

    #[test]
    fn events_map_to_direct_children() {
        let base = Path::new("/data/readings");
        let nested = Event::new(EventKind::Create(CreateKind::File))
            .add_path(base.join("alice/2026/r1.json"));
        let changes = changes_for_event(base, "readings", &nested);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].key, "alice");
        assert_eq!(changes[0].kind, ChangeKind::ChildChanged);

        let flat = Event::new(EventKind::Create(CreateKind::File)).add_path(base.join("r1.json"));
        let changes = changes_for_event(base, "readings", &flat);
        assert_eq!(changes[0].key, "r1");
        assert_eq!(changes[0].kind, ChangeKind::ChildAdded);
        assert_eq!(changes[0].path(), "readings/r1");

        let temp = Event::new(EventKind::Create(CreateKind::File))
            .add_path(base.join(".r1.json.tmp"));
        assert!(changes_for_event(base, "readings", &temp).is_empty());
    }

    #[tokio::test]
    async fn subscription_replays_then_follows_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsEventStore::open(dir.path()).expect("open");
        store
            .put("readings/alice/r1", &json!({"lat": 1.0, "lng": 2.0}))
            .expect("put");

        let mut subscription = store.subscribe("readings").expect("subscribe");
        let first = tokio::time::timeout(Duration::from_secs(5), subscription.next())
            .await
            .expect("replay in time")
            .expect("change");
        assert_eq!(first.kind, ChangeKind::ChildAdded);
        assert_eq!(first.key, "alice");

        store
            .put("readings/bob/r1", &json!({"lat": 3.0, "lng": 4.0}))
            .expect("put");
        let seen_bob = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(change) = subscription.next().await {
                if change.key == "bob" {
                    return true;
                }
            }
            false
        })
        .await
        .expect("event in time");
        assert!(seen_bob);
    }
}
