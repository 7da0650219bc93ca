//! Graph optimizer: precomputed adjacency and layering for a validated
//! workflow.
//!
//! The engine does not need layers for correctness (readiness is a dynamic
//! predicate over node statuses) but uses them to batch submissions and to
//! order loop-body execution.

use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::Value;

use crate::model::{ControlKind, EdgeKind, NodeKind, Workflow};

/// Indexed adjacency + scheduling hints for one workflow.
#[derive(Clone, Debug, Default)]
pub struct ExecutionGraph {
    /// Dependency set per node (who must finish before me).
    pub predecessors: HashMap<String, HashSet<String>>,
    /// Notify-on-complete set per node (who may become ready after me).
    pub successors: HashMap<String, HashSet<String>>,
    /// Topological layers; layer 0 is the initial ready set.
    pub layers: Vec<Vec<String>>,
    /// Nodes with identical predecessor sets within one layer; safe to
    /// submit as one batch.
    pub parallel_groups: Vec<Vec<String>>,
    /// Loop-body membership: body node id -> owning loop node id. Body
    /// nodes are driven by the loop, never by the global ready-set.
    pub loop_owner: HashMap<String, String>,
    /// Per-loop body order (intra-region topological order).
    pub loop_bodies: HashMap<String, Vec<String>>,
}

impl ExecutionGraph {
    pub fn build(workflow: &Workflow) -> Self {
        let mut predecessors: HashMap<String, HashSet<String>> = HashMap::new();
        let mut successors: HashMap<String, HashSet<String>> = HashMap::new();
        for node in &workflow.nodes {
            predecessors
                .entry(node.id.clone())
                .or_default()
                .extend(node.dependencies.iter().cloned());
            successors.entry(node.id.clone()).or_default();
            for dep in &node.dependencies {
                successors
                    .entry(dep.clone())
                    .or_default()
                    .insert(node.id.clone());
            }
        }
        // Data edges contribute data flow only, not precedence; control and
        // conditional edges are already folded into dependencies by the
        // parser.
        for edge in &workflow.edges {
            if edge.kind == EdgeKind::Data {
                continue;
            }
            predecessors
                .entry(edge.to.clone())
                .or_default()
                .insert(edge.from.clone());
            successors
                .entry(edge.from.clone())
                .or_default()
                .insert(edge.to.clone());
        }

        let mut loop_owner = HashMap::new();
        let mut loop_bodies = HashMap::new();
        for node in &workflow.nodes {
            if node.kind == NodeKind::Control && node.control == Some(ControlKind::Loop) {
                let body: HashSet<String> = node
                    .config
                    .get("body")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect();
                for member in &body {
                    loop_owner.insert(member.clone(), node.id.clone());
                }
                let order = region_order(&body, &predecessors);
                loop_bodies.insert(node.id.clone(), order);
            }
        }

        let layers = layer(workflow, &predecessors);
        let parallel_groups = group_parallel(&layers, &predecessors);

        Self {
            predecessors,
            successors,
            layers,
            parallel_groups,
            loop_owner,
            loop_bodies,
        }
    }

    /// Nodes with no dependencies that are not owned by a loop.
    pub fn initial_ready(&self) -> Vec<String> {
        self.layers
            .first()
            .map(|layer| {
                layer
                    .iter()
                    .filter(|id| !self.loop_owner.contains_key(*id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn predecessors_of(&self, node_id: &str) -> impl Iterator<Item = &String> {
        self.predecessors.get(node_id).into_iter().flatten()
    }

    pub fn successors_of(&self, node_id: &str) -> impl Iterator<Item = &String> {
        self.successors.get(node_id).into_iter().flatten()
    }

    /// All nodes reachable from `start` through successor edges.
    pub fn descendants(&self, start: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(start);
        while let Some(node) = queue.pop_front() {
            for succ in self.successors_of(node) {
                if seen.insert(succ.clone()) {
                    queue.push_back(succ);
                }
            }
        }
        seen
    }
}

/// Layered Kahn ordering. Validation has already rejected cycles, so every
/// node lands in some layer.
fn layer(workflow: &Workflow, predecessors: &HashMap<String, HashSet<String>>) -> Vec<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = workflow
        .nodes
        .iter()
        .map(|n| {
            (
                n.id.as_str(),
                predecessors.get(&n.id).map(HashSet::len).unwrap_or(0),
            )
        })
        .collect();
    let mut remaining: HashSet<&str> = workflow.nodes.iter().map(|n| n.id.as_str()).collect();
    let mut layers = Vec::new();

    while !remaining.is_empty() {
        let mut current: Vec<String> = remaining
            .iter()
            .filter(|id| in_degree.get(*id).copied().unwrap_or(0) == 0)
            .map(|id| id.to_string())
            .collect();
        if current.is_empty() {
            break;
        }
        current.sort();
        for id in &current {
            remaining.remove(id.as_str());
        }
        for (node, preds) in predecessors {
            if remaining.contains(node.as_str())
                && current.iter().any(|done| preds.contains(done))
            {
                let count = in_degree.entry(node.as_str()).or_insert(0);
                *count = count.saturating_sub(
                    current.iter().filter(|done| preds.contains(*done)).count(),
                );
            }
        }
        layers.push(current);
    }
    layers
}

fn group_parallel(
    layers: &[Vec<String>],
    predecessors: &HashMap<String, HashSet<String>>,
) -> Vec<Vec<String>> {
    let mut groups = Vec::new();
    for layer in layers {
        let mut by_preds: HashMap<Vec<String>, Vec<String>> = HashMap::new();
        for node in layer {
            let mut preds: Vec<String> = predecessors
                .get(node)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default();
            preds.sort();
            by_preds.entry(preds).or_default().push(node.clone());
        }
        for (_, mut group) in by_preds {
            if group.len() > 1 {
                group.sort();
                groups.push(group);
            }
        }
    }
    groups
}

/// Topological order restricted to a loop-body region. Edges to nodes
/// outside the region are ignored.
fn region_order(
    region: &HashSet<String>,
    predecessors: &HashMap<String, HashSet<String>>,
) -> Vec<String> {
    let mut in_degree: HashMap<&str, usize> = region
        .iter()
        .map(|id| {
            let count = predecessors
                .get(id)
                .map(|preds| preds.iter().filter(|p| region.contains(*p)).count())
                .unwrap_or(0);
            (id.as_str(), count)
        })
        .collect();
    let mut order = Vec::new();
    let mut queue: VecDeque<&str> = {
        let mut roots: Vec<&str> = in_degree
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        roots.sort();
        roots.into_iter().collect()
    };
    while let Some(node) = queue.pop_front() {
        order.push(node.to_string());
        let mut unlocked: Vec<&str> = Vec::new();
        for member in region {
            if predecessors
                .get(member)
                .map(|preds| preds.contains(node))
                .unwrap_or(false)
            {
                let count = in_degree.get_mut(member.as_str()).expect("region member");
                if *count > 0 {
                    *count -= 1;
                    if *count == 0 {
                        unlocked.push(member.as_str());
                    }
                }
            }
        }
        unlocked.sort();
        queue.extend(unlocked);
    }
    order
}
