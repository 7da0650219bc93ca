//! Execution context: the nested key-value tree carrying inputs and node
//! outputs across an execution.
//!
//! The tree has well-known top-level branches: `input` (immutable per
//! execution), `nodes.<id>.output`, `session`, `trigger`, `meta`, and
//! `loop` (bound by loop drivers). Only the engine coordinating an
//! execution mutates the tree; node executors receive immutable snapshots.

use std::collections::HashMap;

use serde_json::{Map, Value, json};

use crate::errors::WorkflowError;
use crate::model::Node;
use crate::template::Template;

#[derive(Clone, Debug)]
pub struct ExecutionContext {
    root: Value,
}

impl ExecutionContext {
    pub fn new(input: Value) -> Self {
        Self {
            root: json!({
                "input": input,
                "nodes": {},
                "session": {},
                "trigger": {},
                "meta": {},
            }),
        }
    }

    /// Immutable view for template resolution. Cloning the tree keeps the
    /// snapshot consistent while the engine keeps merging outputs.
    pub fn snapshot(&self) -> Value {
        self.root.clone()
    }

    pub fn input(&self) -> &Value {
        &self.root["input"]
    }

    /// Merge a completed node's output under `nodes.<id>.output`.
    pub fn set_node_output(&mut self, node_id: &str, output: Value) {
        let nodes = self.root["nodes"]
            .as_object_mut()
            .expect("nodes branch is always an object");
        nodes.insert(node_id.to_string(), json!({ "output": output }));
    }

    pub fn node_output(&self, node_id: &str) -> Option<&Value> {
        self.root["nodes"].get(node_id).and_then(|n| n.get("output"))
    }

    pub fn set_meta(&mut self, key: &str, value: Value) {
        if let Some(meta) = self.root["meta"].as_object_mut() {
            meta.insert(key.to_string(), value);
        }
    }

    pub fn set_session(&mut self, key: &str, value: Value) {
        if let Some(session) = self.root["session"].as_object_mut() {
            session.insert(key.to_string(), value);
        }
    }

    /// Bind the per-iteration loop scope (`loop.item`, `loop.index`).
    pub fn set_loop_scope(&mut self, scope: Value) {
        if let Some(root) = self.root.as_object_mut() {
            root.insert("loop".to_string(), scope);
        }
    }

    pub fn clear_loop_scope(&mut self) {
        if let Some(root) = self.root.as_object_mut() {
            root.remove("loop");
        }
    }
}

/// Resolve a node's input bindings against a snapshot. The snapshot must
/// already contain every declared dependency's output; the engine checks
/// that before dispatch, so an unresolved strict reference here is a real
/// binding error.
pub fn resolve_bindings(
    bindings: &HashMap<String, Template>,
    snapshot: &Value,
) -> Result<Value, WorkflowError> {
    let mut input = Map::new();
    for (key, template) in bindings {
        let value = template
            .resolve(snapshot)
            .map_err(|e| WorkflowError::Template(e.to_string()))?;
        input.insert(key.clone(), value);
    }
    Ok(Value::Object(input))
}

/// Verify the snapshot-consistency precondition: every dependency of
/// `node` has its output present in the snapshot.
pub fn dependencies_present(node: &Node, context: &ExecutionContext) -> bool {
    node.dependencies
        .iter()
        .all(|dep| context.node_output(dep).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeKind;

    #[test]
    fn snapshot_is_isolated_from_later_merges() {
        let mut ctx = ExecutionContext::new(json!({"val": 0}));
        let before = ctx.snapshot();
        ctx.set_node_output("a", json!({"out": 1}));
        assert!(before["nodes"].get("a").is_none());
        assert_eq!(ctx.node_output("a"), Some(&json!({"out": 1})));
    }

    #[test]
    fn bindings_resolve_against_node_outputs() {
        let mut ctx = ExecutionContext::new(json!({"val": 2}));
        ctx.set_node_output("a", json!({"out": 3}));

        let mut bindings = HashMap::new();
        bindings.insert("in".to_string(), Template::parse("${nodes.a.output.out}").unwrap());
        bindings.insert("seed".to_string(), Template::parse("${input.val}").unwrap());

        let input = resolve_bindings(&bindings, &ctx.snapshot()).unwrap();
        assert_eq!(input["in"], json!(3));
        assert_eq!(input["seed"], json!(2));
    }

    #[test]
    fn dependency_presence_check() {
        let mut ctx = ExecutionContext::new(json!({}));
        let mut node = Node::new("b", NodeKind::Tool);
        node.dependencies = vec!["a".to_string()];
        assert!(!dependencies_present(&node, &ctx));
        ctx.set_node_output("a", json!({}));
        assert!(dependencies_present(&node, &ctx));
    }

    #[test]
    fn loop_scope_binds_and_clears() {
        let mut ctx = ExecutionContext::new(json!({}));
        ctx.set_loop_scope(json!({"item": "x", "index": 0}));
        let snap = ctx.snapshot();
        assert_eq!(snap["loop"]["item"], json!("x"));
        ctx.clear_loop_scope();
        assert!(ctx.snapshot().get("loop").is_none());
    }
}
