use crate::normalize::{has_coordinate_fields, has_flag_fields};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// An object carrying flag or coordinate fields.
    Reading,
    /// An object holding further objects: a user, a bucket, a collection.
    Container,
    Unrecognized,
}

pub fn classify_node(node: &Value) -> NodeKind {
    let Value::Object(map) = node else {
        return NodeKind::Unrecognized;
    };
    if has_flag_fields(map) || has_coordinate_fields(map) {
        NodeKind::Reading
    } else if map.values().any(Value::is_object) {
        NodeKind::Container
    } else {
        NodeKind::Unrecognized
    }
}

/// A reading found somewhere below the scanned root.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafRecord {
    /// Full store path, used to address the record for sidecar writes.
    pub path: String,
    /// Key the reading is stored under.
    pub key: String,
    pub payload: Value,
}

impl LeafRecord {
    pub fn parent(&self) -> &str {
        parent_path(&self.path)
    }
}

/// Collects every reading below `root`, however deeply it is nested. A node
/// classified as a reading is never descended into.
pub fn flatten(root_path: &str, root: &Value) -> Vec<LeafRecord> {
    let root_path = normalize_path(root_path);
    let mut leaves = Vec::new();
    walk(&root_path, root, &mut leaves);
    leaves
}

fn walk(path: &str, node: &Value, leaves: &mut Vec<LeafRecord>) {
    match classify_node(node) {
        NodeKind::Reading => leaves.push(LeafRecord {
            path: path.to_string(),
            key: path_key(path).unwrap_or_default().to_string(),
            payload: node.clone(),
        }),
        NodeKind::Container => {
            if let Value::Object(children) = node {
                for (key, child) in children {
                    walk(&join_path(path, key), child, leaves);
                }
            }
        }
        NodeKind::Unrecognized => {}
    }
}

pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn join_path(parent: &str, child: &str) -> String {
    let parent = normalize_path(parent);
    let child = normalize_path(child);
    match (parent.is_empty(), child.is_empty()) {
        (true, _) => child,
        (false, true) => parent,
        (false, false) => format!("{parent}/{child}"),
    }
}

pub fn path_key(path: &str) -> Option<&str> {
    path.rsplit('/').find(|segment| !segment.trim().is_empty())
}

pub fn parent_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keys(leaves: &[LeafRecord]) -> Vec<&str> {
        leaves.iter().map(|leaf| leaf.path.as_str()).collect()
    }

    #[test]
    fn classification_is_tagged() {
        assert_eq!(classify_node(&json!({"lat": 1, "lng": 2})), NodeKind::Reading);
        assert_eq!(classify_node(&json!({"potholeFlag": true})), NodeKind::Reading);
        assert_eq!(classify_node(&json!({"u1": {"lat": 1}})), NodeKind::Container);
        assert_eq!(classify_node(&json!({"note": "hi"})), NodeKind::Unrecognized);
        assert_eq!(classify_node(&json!(42)), NodeKind::Unrecognized);
        assert_eq!(classify_node(&json!([{"lat": 1, "lng": 2}])), NodeKind::Unrecognized);
    }

    #[test]
    fn flattens_a_flat_collection() {
        let tree = json!({
            "1700000000000": {"lat": 1.0, "lng": 2.0},
            "1700000001000": {"lat": 1.5, "lng": 2.5}
        });
        let leaves = flatten("/readings/", &tree);
        assert_eq!(
            keys(&leaves),
            vec!["readings/1700000000000", "readings/1700000001000"]
        );
        assert_eq!(leaves[0].key, "1700000000000");
        assert_eq!(leaves[0].parent(), "readings");
    }

    #[test]
    fn flattens_per_user_and_bucketed_layouts() {
        let tree = json!({
            "alice": {
                "r1": {"latitude": 1.0, "longitude": 2.0}
            },
            "bob": {
                "2026-03-01": {
                    "morning": {
                        "r2": {"patchyFlag": true, "lat": 3.0, "lng": 4.0}
                    }
                }
            },
            "meta": {"version": 3}
        });
        let leaves = flatten("readings", &tree);
        assert_eq!(
            keys(&leaves),
            vec!["readings/alice/r1", "readings/bob/2026-03-01/morning/r2"]
        );
        assert_eq!(leaves[1].key, "r2");
    }

    #[test]
    fn reading_fields_are_not_treated_as_structure() {
        let tree = json!({
            "r1": {
                "lat": 1.0,
                "lng": 2.0,
                "migration": {"status": "migrated"},
                "extra": {"lat": 9.0, "lng": 9.0}
            }
        });
        let leaves = flatten("readings", &tree);
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].payload["migration"]["status"], "migrated");
    }

    #[test]
    fn path_helpers_normalize_separators() {
        assert_eq!(normalize_path("//a/ b//c/"), "a/b/c");
        assert_eq!(join_path("a/b", "c"), "a/b/c");
        assert_eq!(join_path("", "c"), "c");
        assert_eq!(path_key("a/b/c"), Some("c"));
        assert_eq!(parent_path("a/b/c"), "a/b");
        assert_eq!(parent_path("a"), "");
    }
}
