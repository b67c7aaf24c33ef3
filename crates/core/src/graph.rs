//! In-memory model of a ComfyUI API-format workflow.
//!
//! A workflow is a JSON object whose keys are node IDs and whose values
//! are node definitions:
//!
//! ```json
//! {
//!   "3": {
//!     "class_type": "KSampler",
//!     "inputs": { "seed": 42, "cfg": 7.5, "model": ["4", 0] },
//!     "_meta": { "title": "KSampler" }
//!   }
//! }
//! ```
//!
//! The graph is deserialized once per job, mutated in place by the
//! injector, then serialized once for submission.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::types::NodeId;

/// A workflow node graph keyed by node ID.
///
/// Nodes are kept in a sorted map so iteration order is deterministic
/// (lexicographic by ID, so `"10"` sorts before `"9"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowGraph {
    nodes: BTreeMap<NodeId, WorkflowNode>,
}

/// A single node definition.
///
/// `class_type` is fixed at load time; only `inputs` may be rewritten.
/// Node-level keys this model does not know about are carried through
/// untouched so the submitted JSON matches the template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    class_type: String,
    #[serde(default)]
    inputs: Map<String, Value>,
    #[serde(
        rename = "_meta",
        alias = "meta",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    meta: Option<NodeMeta>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Editor metadata attached to a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMeta {
    /// Human-readable title shown in the ComfyUI editor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl WorkflowGraph {
    /// Parse and validate a workflow JSON value.
    ///
    /// The value must be a non-empty object, every node must carry a
    /// string `class_type`, and `inputs` (when present) must be an object.
    pub fn from_json(json: &Value) -> Result<Self, CoreError> {
        let obj = json
            .as_object()
            .ok_or_else(|| CoreError::Validation("Workflow JSON must be an object".to_string()))?;

        if obj.is_empty() {
            return Err(CoreError::Validation(
                "Workflow JSON must contain at least one node".to_string(),
            ));
        }

        for (node_id, node_value) in obj {
            if !node_value.is_object() {
                return Err(CoreError::Validation(format!(
                    "Node '{node_id}' must be an object"
                )));
            }
            if node_value.get("class_type").and_then(Value::as_str).is_none() {
                return Err(CoreError::Validation(format!(
                    "Node '{node_id}' is missing required 'class_type' field"
                )));
            }
            if let Some(inputs) = node_value.get("inputs") {
                if !inputs.is_object() {
                    return Err(CoreError::Validation(format!(
                        "Node '{node_id}' has non-object 'inputs'"
                    )));
                }
            }
        }

        serde_json::from_value(json.clone())
            .map_err(|e| CoreError::Validation(format!("Malformed workflow JSON: {e}")))
    }

    /// Serialize the graph into the JSON shape expected by `POST /prompt`.
    pub fn to_json(&self) -> Result<Value, CoreError> {
        serde_json::to_value(self)
            .map_err(|e| CoreError::Internal(format!("Failed to serialize workflow: {e}")))
    }

    /// Number of nodes in the graph.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up a node by ID.
    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.get(id)
    }

    /// Iterate nodes in ID order.
    pub fn nodes(&self) -> impl Iterator<Item = (&NodeId, &WorkflowNode)> {
        self.nodes.iter()
    }

    /// Iterate nodes mutably in ID order.
    pub fn nodes_mut(&mut self) -> impl Iterator<Item = (&NodeId, &mut WorkflowNode)> {
        self.nodes.iter_mut()
    }
}

impl FromStr for WorkflowGraph {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let json: Value = serde_json::from_str(s)
            .map_err(|e| CoreError::Validation(format!("Workflow is not valid JSON: {e}")))?;
        Self::from_json(&json)
    }
}

impl WorkflowNode {
    /// Build a node from a class type and its inputs.
    pub fn new(class_type: impl Into<String>, inputs: Map<String, Value>) -> Self {
        Self {
            class_type: class_type.into(),
            inputs,
            meta: None,
            extra: Map::new(),
        }
    }

    /// Attach an editor title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.meta.get_or_insert_with(NodeMeta::default).title = Some(title.into());
        self
    }

    /// Backend node type discriminator, e.g. `"KSampler"`.
    pub fn class_type(&self) -> &str {
        &self.class_type
    }

    /// Editor title from `_meta.title`, if any.
    pub fn title(&self) -> Option<&str> {
        self.meta.as_ref().and_then(|m| m.title.as_deref())
    }

    pub fn inputs(&self) -> &Map<String, Value> {
        &self.inputs
    }

    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }

    pub fn has_input(&self, name: &str) -> bool {
        self.inputs.contains_key(name)
    }

    /// Overwrite (or create) an input, returning the previous value.
    pub fn set_input(&mut self, name: &str, value: Value) -> Option<Value> {
        self.inputs.insert(name.to_string(), value)
    }

    /// Visit every string literal reachable from this node's inputs.
    pub fn visit_input_strings_mut(&mut self, visit: &mut impl FnMut(&mut String)) {
        for value in self.inputs.values_mut() {
            visit_strings_mut(value, visit);
        }
    }
}

/// Recursively visit every string inside a JSON value, descending into
/// nested objects and arrays. Numbers, booleans and nulls are skipped.
pub fn visit_strings_mut(value: &mut Value, visit: &mut impl FnMut(&mut String)) {
    match value {
        Value::String(s) => visit(s),
        Value::Array(items) => {
            for item in items {
                visit_strings_mut(item, visit);
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                visit_strings_mut(item, visit);
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_workflow_json() -> Value {
        json!({
            "3": {
                "class_type": "KSampler",
                "inputs": {
                    "seed": 42,
                    "cfg": 7.5,
                    "steps": 20,
                    "model": ["4", 0]
                },
                "_meta": { "title": "KSampler" }
            },
            "6": {
                "class_type": "CLIPTextEncode",
                "inputs": { "text": "{{prompt}}", "clip": ["4", 1] }
            },
            "9": {
                "class_type": "SaveImage",
                "inputs": { "images": ["8", 0], "filename_prefix": "ComfyUI" }
            }
        })
    }

    #[test]
    fn parse_sample_workflow() {
        let graph = WorkflowGraph::from_json(&sample_workflow_json()).unwrap();
        assert_eq!(graph.len(), 3);
        let sampler = graph.node("3").unwrap();
        assert_eq!(sampler.class_type(), "KSampler");
        assert_eq!(sampler.title(), Some("KSampler"));
        assert_eq!(sampler.input("steps"), Some(&json!(20)));
    }

    #[test]
    fn serialization_preserves_template_shape() {
        let json = sample_workflow_json();
        let graph = WorkflowGraph::from_json(&json).unwrap();
        assert_eq!(graph.to_json().unwrap(), json);
    }

    #[test]
    fn unknown_node_keys_survive_serialization() {
        let json = json!({
            "1": { "class_type": "SaveImage", "inputs": {}, "is_changed": ["abc"] }
        });
        let graph = WorkflowGraph::from_json(&json).unwrap();
        assert_eq!(graph.to_json().unwrap()["1"]["is_changed"], json!(["abc"]));
    }

    #[test]
    fn meta_alias_is_accepted() {
        let json = json!({
            "1": { "class_type": "PrimitiveInt", "inputs": { "value": 1 }, "meta": { "title": "Frames" } }
        });
        let graph = WorkflowGraph::from_json(&json).unwrap();
        assert_eq!(graph.node("1").unwrap().title(), Some("Frames"));
    }

    #[test]
    fn parse_non_object_returns_error() {
        let err = WorkflowGraph::from_json(&json!("nope")).unwrap_err().to_string();
        assert!(err.contains("must be an object"));
    }

    #[test]
    fn parse_empty_object_returns_error() {
        let err = WorkflowGraph::from_json(&json!({})).unwrap_err().to_string();
        assert!(err.contains("at least one node"));
    }

    #[test]
    fn parse_node_missing_class_type_returns_error() {
        let err = WorkflowGraph::from_json(&json!({ "1": { "inputs": {} } }))
            .unwrap_err()
            .to_string();
        assert!(err.contains("class_type"));
    }

    #[test]
    fn parse_node_with_array_inputs_returns_error() {
        let json = json!({ "1": { "class_type": "SaveImage", "inputs": [1, 2] } });
        assert!(WorkflowGraph::from_json(&json).is_err());
    }

    #[test]
    fn missing_inputs_default_to_empty() {
        let graph = WorkflowGraph::from_json(&json!({ "1": { "class_type": "SaveImage" } })).unwrap();
        assert!(graph.node("1").unwrap().inputs().is_empty());
    }

    #[test]
    fn from_str_rejects_invalid_json() {
        assert!("{not json".parse::<WorkflowGraph>().is_err());
        let graph: WorkflowGraph = r#"{"1":{"class_type":"SaveImage","inputs":{}}}"#
            .parse()
            .unwrap();
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn nodes_iterate_in_id_order() {
        let graph = WorkflowGraph::from_json(&sample_workflow_json()).unwrap();
        let ids: Vec<_> = graph.nodes().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["3", "6", "9"]);
    }

    #[test]
    fn visitor_reaches_nested_strings_only() {
        let mut value = json!({
            "a": "one",
            "b": ["two", 3, { "c": "four", "d": true }],
            "e": null
        });
        let mut seen = Vec::new();
        visit_strings_mut(&mut value, &mut |s| {
            seen.push(s.clone());
            s.push('!');
        });
        seen.sort();
        assert_eq!(seen, vec!["four", "one", "two"]);
        assert_eq!(value["b"][2]["c"], "four!");
        assert_eq!(value["b"][1], 3);
    }

    #[test]
    fn set_input_returns_previous_value() {
        let mut node = WorkflowNode::new("KSampler", Map::new()).with_title("Sampler");
        assert_eq!(node.set_input("steps", json!(10)), None);
        assert_eq!(node.set_input("steps", json!(30)), Some(json!(10)));
        assert_eq!(node.title(), Some("Sampler"));
    }
}
