//! Workflow parser and structural validator.
//!
//! Accepts declarative definitions in YAML or JSON, normalizes the
//! edge/dependency representation, and enforces every structural invariant
//! before a workflow is allowed near the engine. Each rule is its own
//! function so failures point at exactly one invariant.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{ValidationError, WorkflowError};
use crate::model::{
    ControlKind, Edge, EdgeKind, LoopKind, Node, NodeKind, StateKind, Workflow, WorkflowKind,
};
use crate::template::{Condition, Template};

/// Wrapper so definitions may nest under a top-level `workflow:` key.
#[derive(Deserialize)]
struct WorkflowDocument {
    workflow: Workflow,
}

#[derive(Debug, Default)]
pub struct WorkflowParser;

impl WorkflowParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse a YAML or JSON definition string.
    pub fn parse_str(&self, content: &str) -> Result<Workflow, WorkflowError> {
        let workflow = serde_yaml::from_str::<WorkflowDocument>(content)
            .map(|doc| doc.workflow)
            .or_else(|_| serde_yaml::from_str::<Workflow>(content))
            .or_else(|_| {
                serde_json::from_str::<WorkflowDocument>(content).map(|doc| doc.workflow)
            })
            .or_else(|_| serde_json::from_str::<Workflow>(content))
            .map_err(|e| {
                WorkflowError::Validation(vec![ValidationError::Schema(e.to_string())])
            })?;
        self.finish(workflow)
    }

    /// Parse an already-deserialized JSON value.
    pub fn parse_value(&self, value: Value) -> Result<Workflow, WorkflowError> {
        let workflow = serde_json::from_value::<WorkflowDocument>(value.clone())
            .map(|doc| doc.workflow)
            .or_else(|_| serde_json::from_value::<Workflow>(value))
            .map_err(|e| {
                WorkflowError::Validation(vec![ValidationError::Schema(e.to_string())])
            })?;
        self.finish(workflow)
    }

    /// Validate a workflow built in code.
    pub fn parse_workflow(&self, workflow: Workflow) -> Result<Workflow, WorkflowError> {
        self.finish(workflow)
    }

    fn finish(&self, mut workflow: Workflow) -> Result<Workflow, WorkflowError> {
        if workflow.id.is_empty() {
            workflow.id = Uuid::new_v4().to_string();
        }
        normalize_edges(&mut workflow);
        let errors = validate(&workflow);
        if errors.is_empty() {
            Ok(workflow)
        } else {
            Err(WorkflowError::Validation(errors))
        }
    }
}

/// Fill in whichever of edges/dependencies was omitted. Control edges and
/// dependencies describe the same precedence relation; both views are kept
/// consistent so the engine and optimizer can use either. Control-node
/// configs imply precedence too: switch case targets and parallel branch
/// heads follow their control node, aggregation sources precede the
/// aggregation.
fn normalize_edges(workflow: &mut Workflow) {
    let mut implied: Vec<(String, String)> = Vec::new();
    for node in &workflow.nodes {
        match (node.kind, node.control) {
            (NodeKind::Control, Some(ControlKind::Switch)) => {
                for target in node
                    .config
                    .get("cases")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(|case| case.get("target").and_then(Value::as_str))
                {
                    implied.push((node.id.clone(), target.to_string()));
                }
                if let Some(default) = node.config_str("default") {
                    implied.push((node.id.clone(), default.to_string()));
                }
            }
            (NodeKind::Control, Some(ControlKind::Parallel)) => {
                for branch in node
                    .config
                    .get("branches")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(Value::as_str)
                {
                    implied.push((node.id.clone(), branch.to_string()));
                }
            }
            (NodeKind::Aggregation, _) => {
                for source in node
                    .config
                    .get("sources")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(Value::as_str)
                {
                    implied.push((source.to_string(), node.id.clone()));
                }
            }
            _ => {}
        }
    }
    for (from, to) in implied {
        if let Some(node) = workflow.nodes.iter_mut().find(|n| n.id == to)
            && !node.dependencies.contains(&from)
            && from != to
        {
            node.dependencies.push(from);
        }
    }

    let mut known: HashSet<(String, String)> = workflow
        .edges
        .iter()
        .map(|e| (e.from.clone(), e.to.clone()))
        .collect();
    for node in &workflow.nodes {
        for dep in &node.dependencies {
            if known.insert((dep.clone(), node.id.clone())) {
                workflow.edges.push(Edge::control(dep.clone(), node.id.clone()));
            }
        }
    }
    let mut incoming: HashMap<String, Vec<String>> = HashMap::new();
    for edge in &workflow.edges {
        if edge.kind != EdgeKind::Data {
            incoming
                .entry(edge.to.clone())
                .or_default()
                .push(edge.from.clone());
        }
    }
    for node in &mut workflow.nodes {
        if let Some(sources) = incoming.get(&node.id) {
            for source in sources {
                if !node.dependencies.contains(source) {
                    node.dependencies.push(source.clone());
                }
            }
        }
    }
}

/// Run every structural check; returns all problems found, not just the
/// first.
pub fn validate(workflow: &Workflow) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    validate_unique_node_ids(workflow, &mut errors);
    validate_references(workflow, &mut errors);
    validate_no_self_loops(workflow, &mut errors);
    if workflow.kind != WorkflowKind::StateMachine {
        validate_acyclic(workflow, &mut errors);
    }
    validate_node_configs(workflow, &mut errors);
    validate_templates(workflow, &mut errors);
    validate_error_handlers(workflow, &mut errors);
    if workflow.has_states() {
        validate_state_machine(workflow, &mut errors);
    } else if !workflow.states.is_empty() {
        errors.push(ValidationError::Schema(
            "dag workflow must not declare states".into(),
        ));
    }
    if workflow.has_graph() && workflow.nodes.is_empty() {
        errors.push(ValidationError::Schema("workflow has no nodes".into()));
    }
    errors
}

fn validate_unique_node_ids(workflow: &Workflow, errors: &mut Vec<ValidationError>) {
    let mut seen = HashSet::new();
    for node in &workflow.nodes {
        if node.id.is_empty() {
            errors.push(ValidationError::Schema("node with empty id".into()));
        } else if !seen.insert(node.id.as_str()) {
            errors.push(ValidationError::DuplicateId {
                id: node.id.clone(),
            });
        }
    }
}

fn validate_references(workflow: &Workflow, errors: &mut Vec<ValidationError>) {
    let ids: HashSet<&str> = workflow.nodes.iter().map(|n| n.id.as_str()).collect();
    for node in &workflow.nodes {
        for dep in &node.dependencies {
            if !ids.contains(dep.as_str()) {
                errors.push(ValidationError::UnknownReference {
                    source_node: node.id.clone(),
                    reference: dep.clone(),
                });
            }
        }
    }
    for edge in &workflow.edges {
        for endpoint in [&edge.from, &edge.to] {
            if !ids.contains(endpoint.as_str()) {
                errors.push(ValidationError::UnknownReference {
                    source_node: format!("edge {} -> {}", edge.from, edge.to),
                    reference: endpoint.clone(),
                });
            }
        }
    }
}

fn validate_no_self_loops(workflow: &Workflow, errors: &mut Vec<ValidationError>) {
    for node in &workflow.nodes {
        if node.dependencies.iter().any(|dep| dep == &node.id) {
            errors.push(ValidationError::Node {
                node_id: node.id.clone(),
                message: "node depends on itself".into(),
            });
        }
    }
    for edge in &workflow.edges {
        if edge.from == edge.to {
            errors.push(ValidationError::Node {
                node_id: edge.from.clone(),
                message: "self-loop edge".into(),
            });
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Grey,
    Black,
}

/// DFS with grey/black coloring; a grey-to-grey edge closes a cycle and
/// the grey stack suffix names its members.
fn validate_acyclic(workflow: &Workflow, errors: &mut Vec<ValidationError>) {
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
    for node in &workflow.nodes {
        successors.entry(node.id.as_str()).or_default();
        for dep in &node.dependencies {
            successors
                .entry(dep.as_str())
                .or_default()
                .push(node.id.as_str());
        }
    }

    let mut colors: HashMap<&str, Color> = workflow
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), Color::White))
        .collect();

    for start in workflow.nodes.iter().map(|n| n.id.as_str()) {
        if colors.get(start) != Some(&Color::White) {
            continue;
        }
        let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
        colors.insert(start, Color::Grey);
        while let Some((node, next_child)) = stack.last().copied() {
            let children = successors.get(node).map(Vec::as_slice).unwrap_or(&[]);
            if next_child < children.len() {
                if let Some(frame) = stack.last_mut() {
                    frame.1 += 1;
                }
                let child = children[next_child];
                match colors.get(child) {
                    Some(Color::White) => {
                        colors.insert(child, Color::Grey);
                        stack.push((child, 0));
                    }
                    Some(Color::Grey) => {
                        let cycle_start = stack
                            .iter()
                            .position(|(id, _)| *id == child)
                            .unwrap_or(0);
                        let mut cycle_nodes: Vec<String> = stack[cycle_start..]
                            .iter()
                            .map(|(id, _)| id.to_string())
                            .collect();
                        cycle_nodes.push(child.to_string());
                        errors.push(ValidationError::Cycle { cycle_nodes });
                        return;
                    }
                    _ => {}
                }
            } else {
                colors.insert(node, Color::Black);
                stack.pop();
            }
        }
    }
}

fn validate_node_configs(workflow: &Workflow, errors: &mut Vec<ValidationError>) {
    let ids: HashSet<&str> = workflow.nodes.iter().map(|n| n.id.as_str()).collect();
    for node in &workflow.nodes {
        match node.kind {
            NodeKind::Agent => {
                if node.config_str("agent_id").is_none() {
                    errors.push(ValidationError::Node {
                        node_id: node.id.clone(),
                        message: "agent node missing config.agent_id".into(),
                    });
                }
            }
            NodeKind::Tool => {
                if node.config_str("tool_id").is_none() {
                    errors.push(ValidationError::Node {
                        node_id: node.id.clone(),
                        message: "tool node missing config.tool_id".into(),
                    });
                }
            }
            NodeKind::Control => validate_control_node(workflow, node, &ids, errors),
            NodeKind::Aggregation => {
                let sources = node
                    .config
                    .get("sources")
                    .and_then(Value::as_array)
                    .map(|a| a.len())
                    .unwrap_or(0);
                if sources == 0 {
                    errors.push(ValidationError::Node {
                        node_id: node.id.clone(),
                        message: "aggregation node missing config.sources".into(),
                    });
                }
                for source in node
                    .config
                    .get("sources")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(Value::as_str)
                {
                    if !ids.contains(source) {
                        errors.push(ValidationError::UnknownReference {
                            source_node: node.id.clone(),
                            reference: source.to_string(),
                        });
                    }
                }
            }
            NodeKind::SubWorkflow => {
                if node.config_str("workflow").is_none() && node.config_str("workflow_id").is_none()
                {
                    errors.push(ValidationError::Node {
                        node_id: node.id.clone(),
                        message: "sub_workflow node missing config.workflow".into(),
                    });
                }
            }
        }
        if let Some(retry) = &node.retry_policy {
            if retry.max_attempts == 0 {
                errors.push(ValidationError::Node {
                    node_id: node.id.clone(),
                    message: "retry_policy.max_attempts must be at least 1".into(),
                });
            }
            if retry.max_delay_ms < retry.base_delay_ms {
                errors.push(ValidationError::Node {
                    node_id: node.id.clone(),
                    message: "retry_policy.max_delay_ms below base_delay_ms".into(),
                });
            }
        }
    }
}

fn validate_control_node(
    workflow: &Workflow,
    node: &Node,
    ids: &HashSet<&str>,
    errors: &mut Vec<ValidationError>,
) {
    let Some(control) = node.control else {
        errors.push(ValidationError::Node {
            node_id: node.id.clone(),
            message: "control node missing subtype".into(),
        });
        return;
    };
    match control {
        ControlKind::Switch => {
            let cases = node.config.get("cases").and_then(Value::as_array);
            if cases.map(|c| c.is_empty()).unwrap_or(true) {
                errors.push(ValidationError::Node {
                    node_id: node.id.clone(),
                    message: "switch node missing config.cases".into(),
                });
            }
            for case in cases.into_iter().flatten() {
                match case.get("target").and_then(Value::as_str) {
                    Some(target) if !ids.contains(target) => {
                        errors.push(ValidationError::UnknownReference {
                            source_node: node.id.clone(),
                            reference: target.to_string(),
                        });
                    }
                    None => errors.push(ValidationError::Node {
                        node_id: node.id.clone(),
                        message: "switch case missing target".into(),
                    }),
                    _ => {}
                }
            }
            if let Some(default) = node.config_str("default")
                && !ids.contains(default)
            {
                errors.push(ValidationError::UnknownReference {
                    source_node: node.id.clone(),
                    reference: default.to_string(),
                });
            }
            if node.config_str("expression").is_none() {
                errors.push(ValidationError::Node {
                    node_id: node.id.clone(),
                    message: "switch node missing config.expression".into(),
                });
            }
        }
        ControlKind::Parallel => {
            for branch in node
                .config
                .get("branches")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
            {
                if !ids.contains(branch) {
                    errors.push(ValidationError::UnknownReference {
                        source_node: node.id.clone(),
                        reference: branch.to_string(),
                    });
                }
            }
        }
        ControlKind::Loop => {
            let kind = node
                .config
                .get("loop_kind")
                .cloned()
                .and_then(|v| serde_json::from_value::<LoopKind>(v).ok());
            if kind.is_none() {
                errors.push(ValidationError::Node {
                    node_id: node.id.clone(),
                    message: "loop node requires explicit loop_kind (while | for_each | count)"
                        .into(),
                });
            }
            match kind {
                Some(LoopKind::While) if node.config_str("condition").is_none() => {
                    errors.push(ValidationError::Node {
                        node_id: node.id.clone(),
                        message: "while loop missing config.condition".into(),
                    });
                }
                Some(LoopKind::ForEach) if node.config_str("items").is_none() => {
                    errors.push(ValidationError::Node {
                        node_id: node.id.clone(),
                        message: "for_each loop missing config.items".into(),
                    });
                }
                Some(LoopKind::Count)
                    if node.config.get("iterations").and_then(Value::as_u64).is_none() =>
                {
                    errors.push(ValidationError::Node {
                        node_id: node.id.clone(),
                        message: "count loop missing config.iterations".into(),
                    });
                }
                _ => {}
            }
            let body: Vec<&str> = node
                .config
                .get("body")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .collect();
            if body.is_empty() {
                errors.push(ValidationError::Node {
                    node_id: node.id.clone(),
                    message: "loop node missing config.body".into(),
                });
            }
            for member in body {
                if !ids.contains(member) {
                    errors.push(ValidationError::UnknownReference {
                        source_node: node.id.clone(),
                        reference: member.to_string(),
                    });
                } else if member == node.id {
                    errors.push(ValidationError::Node {
                        node_id: node.id.clone(),
                        message: "loop body contains the loop node itself".into(),
                    });
                } else if workflow
                    .node(member)
                    .map(|n| n.kind == NodeKind::Control)
                    .unwrap_or(false)
                {
                    errors.push(ValidationError::Node {
                        node_id: node.id.clone(),
                        message: format!("loop body member '{member}' is a control node"),
                    });
                }
            }
        }
        ControlKind::Join => {
            if let Some(mode) = node.config.get("mode")
                && serde_json::from_value::<crate::model::JoinMode>(mode.clone()).is_err()
            {
                errors.push(ValidationError::Node {
                    node_id: node.id.clone(),
                    message: "join mode must be wait_all or wait_any".into(),
                });
            }
        }
    }
}

fn validate_templates(workflow: &Workflow, errors: &mut Vec<ValidationError>) {
    for node in &workflow.nodes {
        for (key, binding) in &node.input_bindings {
            if let Err(e) = Template::parse(binding) {
                errors.push(ValidationError::Node {
                    node_id: node.id.clone(),
                    message: format!("input binding '{key}': {e}"),
                });
            }
        }
        if node.control == Some(ControlKind::Switch)
            && let Some(expr) = node.config_str("expression")
            && let Err(e) = Condition::parse(expr)
        {
            errors.push(ValidationError::Node {
                node_id: node.id.clone(),
                message: format!("switch expression: {e}"),
            });
        }
        if node.control == Some(ControlKind::Loop)
            && let Some(cond) = node.config_str("condition")
            && let Err(e) = Condition::parse(cond)
        {
            errors.push(ValidationError::Node {
                node_id: node.id.clone(),
                message: format!("loop condition: {e}"),
            });
        }
    }
    for edge in &workflow.edges {
        if let Some(condition) = &edge.condition
            && let Err(e) = Condition::parse(condition)
        {
            errors.push(ValidationError::Schema(format!(
                "edge {} -> {}: {e}",
                edge.from, edge.to
            )));
        }
    }
}

fn validate_error_handlers(workflow: &Workflow, errors: &mut Vec<ValidationError>) {
    for rule in &workflow.error_handlers {
        if let Err(e) = regex::Regex::new(&rule.node_pattern) {
            errors.push(ValidationError::Schema(format!(
                "error handler pattern '{}': {e}",
                rule.node_pattern
            )));
        }
    }
}

fn validate_state_machine(workflow: &Workflow, errors: &mut Vec<ValidationError>) {
    if workflow.states.is_empty() {
        errors.push(ValidationError::Schema(
            "state machine workflow has no states".into(),
        ));
        return;
    }
    let mut seen = HashSet::new();
    for state in &workflow.states {
        if !seen.insert(state.name.as_str()) {
            errors.push(ValidationError::DuplicateId {
                id: state.name.clone(),
            });
        }
    }

    let declared_initial: Vec<&str> = workflow
        .states
        .iter()
        .filter(|s| s.kind == StateKind::Initial)
        .map(|s| s.name.as_str())
        .collect();
    let initial = workflow
        .initial_state
        .as_deref()
        .or(declared_initial.first().copied());
    match initial {
        None => errors.push(ValidationError::Schema(
            "state machine missing initial state".into(),
        )),
        Some(name) if !seen.contains(name) => errors.push(ValidationError::State {
            state: name.to_string(),
            message: "initial state not declared".into(),
        }),
        _ => {}
    }
    if declared_initial.len() > 1 {
        errors.push(ValidationError::Schema(format!(
            "multiple initial states declared: {}",
            declared_initial.join(", ")
        )));
    }

    for state in &workflow.states {
        for transition in &state.transitions {
            if !seen.contains(transition.target.as_str()) {
                errors.push(ValidationError::State {
                    state: state.name.clone(),
                    message: format!("transition target '{}' not declared", transition.target),
                });
            }
            if let Some(guard) = &transition.guard
                && let Err(e) = Condition::parse(guard)
            {
                errors.push(ValidationError::State {
                    state: state.name.clone(),
                    message: format!("guard on '{}': {e}", transition.event),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool_node(id: &str, deps: &[&str]) -> Node {
        let mut node = Node::new(id, NodeKind::Tool);
        node.config.insert("tool_id".into(), json!("noop"));
        node.dependencies = deps.iter().map(|s| s.to_string()).collect();
        node
    }

    fn dag(nodes: Vec<Node>) -> Workflow {
        Workflow {
            id: String::new(),
            name: "test".into(),
            version: "1.0.0".into(),
            kind: WorkflowKind::Dag,
            nodes,
            edges: Vec::new(),
            error_handlers: Vec::new(),
            initial_state: None,
            states: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn accepts_linear_chain_and_infers_edges() {
        let workflow = WorkflowParser::new()
            .parse_workflow(dag(vec![
                tool_node("a", &[]),
                tool_node("b", &["a"]),
                tool_node("c", &["b"]),
            ]))
            .unwrap();
        assert_eq!(workflow.edges.len(), 2);
        assert!(!workflow.id.is_empty());
    }

    #[test]
    fn rejects_cycle_with_member_list() {
        let result = WorkflowParser::new().parse_workflow(dag(vec![
            tool_node("a", &["c"]),
            tool_node("b", &["a"]),
            tool_node("c", &["b"]),
        ]));
        let Err(WorkflowError::Validation(errors)) = result else {
            panic!("expected validation failure");
        };
        assert!(errors.iter().any(|e| matches!(
            e,
            ValidationError::Cycle { cycle_nodes } if cycle_nodes.len() >= 3
        )));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let result = WorkflowParser::new()
            .parse_workflow(dag(vec![tool_node("a", &[]), tool_node("a", &[])]));
        let Err(WorkflowError::Validation(errors)) = result else {
            panic!("expected validation failure");
        };
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::DuplicateId { id } if id == "a")));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let result = WorkflowParser::new().parse_workflow(dag(vec![tool_node("a", &["ghost"])]));
        let Err(WorkflowError::Validation(errors)) = result else {
            panic!("expected validation failure");
        };
        assert!(errors.iter().any(|e| matches!(
            e,
            ValidationError::UnknownReference { reference, .. } if reference == "ghost"
        )));
    }

    #[test]
    fn rejects_self_loop() {
        let result = WorkflowParser::new().parse_workflow(dag(vec![tool_node("a", &["a"])]));
        assert!(result.is_err());
    }

    #[test]
    fn rejects_loop_without_subtype() {
        let mut looper = Node::new("l", NodeKind::Control);
        looper.control = Some(ControlKind::Loop);
        looper.config.insert("body".into(), json!(["a"]));
        let result = WorkflowParser::new().parse_workflow(dag(vec![tool_node("a", &[]), looper]));
        let Err(WorkflowError::Validation(errors)) = result else {
            panic!("expected validation failure");
        };
        assert!(errors.iter().any(|e| e.to_string().contains("loop_kind")));
    }

    #[test]
    fn parses_yaml_document() {
        let yaml = r#"
workflow:
  name: pipeline
  type: dag
  nodes:
    - id: fetch
      type: tool
      config:
        tool_id: http
    - id: summarize
      type: agent
      config:
        agent_id: summarizer
      dependencies: [fetch]
      inputs:
        text: "${nodes.fetch.output.body}"
"#;
        let workflow = WorkflowParser::new().parse_str(yaml).unwrap();
        assert_eq!(workflow.nodes.len(), 2);
        assert_eq!(
            workflow.node("summarize").unwrap().dependencies,
            vec!["fetch"]
        );
    }

    #[test]
    fn parses_state_machine_and_checks_targets() {
        let yaml = r#"
name: order
type: state_machine
initial_state: created
states:
  - name: created
    type: initial
    transitions:
      - event: pay
        target: paid
  - name: paid
    type: final
"#;
        let workflow = WorkflowParser::new().parse_str(yaml).unwrap();
        assert_eq!(workflow.states.len(), 2);

        let bad = yaml.replace("target: paid", "target: shipped");
        assert!(WorkflowParser::new().parse_str(&bad).is_err());
    }

    #[test]
    fn rejects_invalid_template_binding() {
        let mut node = tool_node("a", &[]);
        node.input_bindings.insert("x".into(), "${unclosed".into());
        let result = WorkflowParser::new().parse_workflow(dag(vec![node]));
        assert!(result.is_err());
    }

    #[test]
    fn serialize_parse_round_trip() {
        let workflow = WorkflowParser::new()
            .parse_workflow(dag(vec![tool_node("a", &[]), tool_node("b", &["a"])]))
            .unwrap();
        let yaml = serde_yaml::to_string(&workflow).unwrap();
        let reparsed = WorkflowParser::new().parse_str(&yaml).unwrap();
        assert_eq!(workflow, reparsed);
    }
}
