use crate::key::Key;
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// One controllable or observable point in the automation system.
///
/// `path` is whatever the backend sent along; the authoritative path is
/// derived from the ancestor names (see `sync::tree::StateTree::path`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateNode {
    #[serde(deserialize_with = "node_id")]
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub value: Value,
    #[serde(
        default,
        rename = "parentId",
        alias = "parent_id",
        alias = "parent",
        deserialize_with = "parent_id"
    )]
    pub parent_id: Option<i64>,
}

impl StateNode {
    /// A node known only by id, e.g. from a `state_children` payload listing ids.
    pub fn bare(id: i64) -> Self {
        Self {
            id,
            name: String::new(),
            path: None,
            value: Value::Null,
            parent_id: None,
        }
    }

    /// Reads a node from a payload entry that is either a full object or a bare id.
    pub fn from_entry(entry: &Value) -> Option<StateNode> {
        match entry {
            Value::Object(_) => serde_json::from_value(entry.clone()).ok(),
            other => serde_json::from_value::<Key>(other.clone())
                .ok()
                .and_then(|key| key.as_id())
                .map(StateNode::bare),
        }
    }

    /// Reads every node from an array payload, skipping entries that are not nodes.
    pub fn list_from(payload: &Value) -> Vec<StateNode> {
        match payload {
            Value::Array(entries) => entries.iter().filter_map(StateNode::from_entry).collect(),
            _ => Vec::new(),
        }
    }
}

fn node_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    Key::deserialize(deserializer)?
        .as_id()
        .ok_or_else(|| de::Error::custom("state id must be an integer"))
}

fn parent_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    Ok(Option::<Key>::deserialize(deserializer)?.and_then(|key| key.as_id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserializes_backend_state() {
        let node: StateNode = serde_json::from_value(json!({
            "id": 8,
            "name": "light",
            "path": "/living/light",
            "parent": 3,
            "value": 1,
            "type": "bool"
        }))
        .unwrap();
        assert_eq!(node.id, 8);
        assert_eq!(node.name, "light");
        assert_eq!(node.parent_id, Some(3));
        assert_eq!(node.value, json!(1));
    }

    #[test]
    fn test_parent_aliases_and_root_parent() {
        let node: StateNode =
            serde_json::from_value(json!({"id": "5", "name": "a", "parent_id": "2"})).unwrap();
        assert_eq!(node.id, 5);
        assert_eq!(node.parent_id, Some(2));

        let node: StateNode =
            serde_json::from_value(json!({"id": 1, "name": "root", "parentId": null})).unwrap();
        assert_eq!(node.parent_id, None);
        assert_eq!(node.value, Value::Null);
    }

    #[test]
    fn test_list_accepts_ids_and_objects() {
        let nodes = StateNode::list_from(&json!([10, {"id": 8, "name": "b"}, "12", "junk", null]));
        let ids: Vec<i64> = nodes.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![10, 8, 12]);
        assert!(StateNode::list_from(&json!({"id": 1})).is_empty());
    }

    #[test]
    fn test_serializes_parent_as_camel_case() {
        let mut node = StateNode::bare(4);
        node.parent_id = Some(1);
        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value["parentId"], json!(1));
        assert!(value.get("path").is_none());
    }
}
