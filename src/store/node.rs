//! Persistent state tree used by the [`Store`](super::Store).
//!
//! JSON objects become `Map` nodes and arrays become `List` nodes whose
//! children are individually reference-counted, so a write only clones the
//! containers on the path from the root to the written key. Everything else is
//! shared with the previous tree. Numeric segments index into lists.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::errors::StoreError;

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// A scalar or null.
    Leaf(Value),
    List(Vec<Arc<Node>>),
    Map(BTreeMap<String, Arc<Node>>),
}

impl Node {
    /// Convert a JSON value into a tree, splitting objects into `Map` nodes.
    pub fn from_json(value: Value) -> Arc<Node> {
        match value {
            Value::Object(object) => Arc::new(Node::Map(
                object
                    .into_iter()
                    .map(|(key, value)| (key, Node::from_json(value)))
                    .collect(),
            )),
            Value::Array(items) => Arc::new(Node::List(
                items.into_iter().map(Node::from_json).collect(),
            )),
            other => Arc::new(Node::Leaf(other)),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Node::Leaf(value) => value.clone(),
            Node::List(items) => Value::Array(items.iter().map(|child| child.to_json()).collect()),
            Node::Map(map) => Value::Object(
                map.iter()
                    .map(|(key, child)| (key.clone(), child.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn child(&self, key: &str) -> Option<&Arc<Node>> {
        match self {
            Node::Map(map) => map.get(key),
            Node::List(items) => key.parse::<usize>().ok().and_then(|index| items.get(index)),
            Node::Leaf(_) => None,
        }
    }

    pub fn as_leaf(&self) -> Option<&Value> {
        match self {
            Node::Leaf(value) => Some(value),
            Node::List(_) | Node::Map(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_leaf().and_then(Value::as_str)
    }
}

/// Split a dot-path into its segments.
pub fn segments(path: &str) -> Vec<&str> {
    path.split('.').collect()
}

/// Resolve `path` against `root`. Any missing segment yields `None`.
pub fn resolve(root: &Arc<Node>, path: &str) -> Option<Arc<Node>> {
    let mut current = root;
    for segment in segments(path) {
        current = current.child(segment)?;
    }
    Some(current.clone())
}

/// Return a new tree with `value` placed at `segments`.
///
/// Containers along the path are shallow-cloned. Missing or scalar
/// intermediates are replaced by fresh maps. A list is only written through an
/// existing index; anything else is an error and leaves the tree untouched.
pub fn with_path(
    node: Option<&Arc<Node>>,
    segments: &[&str],
    value: Arc<Node>,
) -> Result<Arc<Node>, StoreError> {
    let Some((head, rest)) = segments.split_first() else {
        return Ok(value);
    };
    match node.map(Arc::as_ref) {
        Some(Node::List(items)) => {
            let index = head
                .parse::<usize>()
                .ok()
                .filter(|index| *index < items.len())
                .ok_or_else(|| StoreError::BadIndex {
                    segment: (*head).to_string(),
                    len: items.len(),
                })?;
            let mut items = items.clone();
            let child = with_path(Some(&items[index]), rest, value)?;
            items[index] = child;
            Ok(Arc::new(Node::List(items)))
        }
        other => {
            let mut map = match other {
                Some(Node::Map(map)) => map.clone(),
                _ => BTreeMap::new(),
            };
            let child = with_path(map.get(*head), rest, value)?;
            map.insert((*head).to_string(), child);
            Ok(Arc::new(Node::Map(map)))
        }
    }
}

/// Two resolved values are the same when both are absent, share an
/// allocation, or are structurally equal.
pub fn same(a: &Option<Arc<Node>>, b: &Option<Arc<Node>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b) || a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_round_trips_through_tree() {
        let value = json!({"a": {"b": [1, 2], "c": null}, "d": "x"});
        assert_eq!(Node::from_json(value.clone()).to_json(), value);
    }

    #[test]
    fn with_path_shares_untouched_siblings() {
        let root = Node::from_json(json!({"a": {"b": 1, "c": 2}, "d": {"e": 3}}));
        let updated = with_path(Some(&root), &["a", "b"], Node::from_json(json!(10))).unwrap();

        assert!(Arc::ptr_eq(
            &resolve(&root, "d").unwrap(),
            &resolve(&updated, "d").unwrap()
        ));
        assert!(Arc::ptr_eq(
            &resolve(&root, "a.c").unwrap(),
            &resolve(&updated, "a.c").unwrap()
        ));
        assert!(!Arc::ptr_eq(
            &resolve(&root, "a").unwrap(),
            &resolve(&updated, "a").unwrap()
        ));
        assert_eq!(resolve(&updated, "a.b").unwrap().to_json(), json!(10));
        // The original tree is untouched.
        assert_eq!(resolve(&root, "a.b").unwrap().to_json(), json!(1));
    }

    #[test]
    fn with_path_creates_missing_intermediates() {
        let root = Node::from_json(json!({"a": 1}));
        let updated =
            with_path(Some(&root), &["a", "b", "c"], Node::from_json(json!(true))).unwrap();
        assert_eq!(updated.to_json(), json!({"a": {"b": {"c": true}}}));
    }

    #[test]
    fn numeric_segments_index_into_lists() {
        let root = Node::from_json(json!({"rows": [{"id": 1}, {"id": 2}]}));
        assert_eq!(resolve(&root, "rows.1.id").unwrap().to_json(), json!(2));
        assert!(resolve(&root, "rows.2").is_none());
        assert!(resolve(&root, "rows.first").is_none());
    }

    #[test]
    fn list_write_copies_only_the_written_element() {
        let root = Node::from_json(json!({"rows": [{"id": 1}, {"id": 2}]}));
        let updated = with_path(Some(&root), &["rows", "1", "id"], Node::from_json(json!(20))).unwrap();

        assert_eq!(updated.to_json(), json!({"rows": [{"id": 1}, {"id": 20}]}));
        assert!(Arc::ptr_eq(
            &resolve(&root, "rows.0").unwrap(),
            &resolve(&updated, "rows.0").unwrap()
        ));
        assert_eq!(resolve(&root, "rows.1.id").unwrap().to_json(), json!(2));
    }

    #[test]
    fn list_write_outside_bounds_is_rejected() {
        let root = Node::from_json(json!({"rows": ["a", "b"]}));
        let value = Node::from_json(json!("c"));
        assert_eq!(
            with_path(Some(&root), &["rows", "2"], value.clone()),
            Err(StoreError::BadIndex {
                segment: "2".into(),
                len: 2
            })
        );
        assert!(matches!(
            with_path(Some(&root), &["rows", "last"], value),
            Err(StoreError::BadIndex { .. })
        ));
    }

    #[test]
    fn resolve_missing_segment_is_none() {
        let root = Node::from_json(json!({"a": {"b": 1}}));
        assert!(resolve(&root, "a.x").is_none());
        assert!(resolve(&root, "a.b.c").is_none());
    }

    #[test]
    fn same_compares_structurally() {
        let a = Some(Node::from_json(json!({"x": 1})));
        let b = Some(Node::from_json(json!({"x": 1})));
        let c = Some(Node::from_json(json!({"x": 2})));
        assert!(same(&a, &b));
        assert!(!same(&a, &c));
        assert!(!same(&a, &None));
        assert!(same(&None, &None));
    }
}
