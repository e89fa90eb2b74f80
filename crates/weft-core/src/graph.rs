//! The workflow graph model: nodes, edges, kind parsing, validation, and
//! the scope index the engine traverses.
//!
//! Control-flow operators own nested subgraphs delimited by edge labels:
//! a loop's body hangs off its `body` edge and the flow continues at its
//! `done` edge; try/catch branches hang off `try` / `catch` edges; retry
//! and circuit-breaker wrap the single node their sole outgoing edge points
//! at. The [`ScopeIndex`] precomputes those subgraphs so the traversal
//! never walks into an operator's internals from the outside.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use weft_db::models::TriggerType;

/// Edge labels with structural meaning.
pub const EDGE_TRUE: &str = "true";
pub const EDGE_FALSE: &str = "false";
pub const EDGE_BODY: &str = "body";
pub const EDGE_DONE: &str = "done";
pub const EDGE_TRY: &str = "try";
pub const EDGE_CATCH: &str = "catch";

/// A node in a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDef {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub config: Value,
    /// Layout metadata; ignored by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Value>,
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDef {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// A workflow graph definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub nodes: Vec<NodeDef>,
    #[serde(default)]
    pub edges: Vec<EdgeDef>,
}

/// Parsed node kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    TriggerManual,
    TriggerWebhook,
    TriggerSchedule,
    ActionHttp,
    ActionTransform,
    ActionFormula,
    ActionCode,
    ActionLog,
    Condition,
    Loop,
    Parallel,
    Fork,
    Join,
    TryCatch,
    Retry,
    CircuitBreaker,
    Delay,
    SubWorkflow,
    HumanTask,
}

impl NodeKind {
    /// Parse the `namespace:name` kind string.
    pub fn parse(kind: &str) -> Option<Self> {
        Some(match kind {
            "trigger:manual" => Self::TriggerManual,
            "trigger:webhook" => Self::TriggerWebhook,
            "trigger:schedule" => Self::TriggerSchedule,
            "action:http" => Self::ActionHttp,
            "action:transform" => Self::ActionTransform,
            "action:formula" => Self::ActionFormula,
            "action:code" => Self::ActionCode,
            "action:log" => Self::ActionLog,
            "control:condition" => Self::Condition,
            "control:loop" => Self::Loop,
            "control:parallel" => Self::Parallel,
            "control:fork" => Self::Fork,
            "control:join" => Self::Join,
            "control:trycatch" => Self::TryCatch,
            "control:retry" => Self::Retry,
            "control:circuit_breaker" => Self::CircuitBreaker,
            "control:delay" => Self::Delay,
            "control:subworkflow" => Self::SubWorkflow,
            "human:task" => Self::HumanTask,
            _ => return None,
        })
    }

    pub fn is_trigger(self) -> bool {
        matches!(
            self,
            Self::TriggerManual | Self::TriggerWebhook | Self::TriggerSchedule
        )
    }

    /// Whether a trigger node of this kind fires for the given trigger type.
    /// Timer and sub-workflow starts enter through the manual trigger node.
    pub fn matches_trigger(self, trigger: TriggerType) -> bool {
        match self {
            Self::TriggerManual => matches!(
                trigger,
                TriggerType::Manual | TriggerType::Timer | TriggerType::Subworkflow
            ),
            Self::TriggerWebhook => trigger == TriggerType::Webhook,
            Self::TriggerSchedule => trigger == TriggerType::Schedule,
            _ => false,
        }
    }
}

/// Result of validating a definition: hard errors and advisory warnings.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl WorkflowDefinition {
    /// Parse a stored JSON definition.
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    pub fn node(&self, id: &str) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn kind_of(&self, id: &str) -> Option<NodeKind> {
        self.node(id).and_then(|n| NodeKind::parse(&n.kind))
    }

    pub fn edges_from<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a EdgeDef> {
        self.edges.iter().filter(move |e| e.source == id)
    }

    pub fn edges_to<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a EdgeDef> {
        self.edges.iter().filter(move |e| e.target == id)
    }

    pub fn labeled_edge<'a>(&'a self, id: &'a str, label: &str) -> Option<&'a EdgeDef> {
        self.edges_from(id)
            .find(|e| e.label.as_deref() == Some(label))
    }

    /// Trigger nodes with zero inbound edges.
    pub fn trigger_nodes(&self) -> Vec<&NodeDef> {
        self.nodes
            .iter()
            .filter(|n| {
                NodeKind::parse(&n.kind).map(NodeKind::is_trigger).unwrap_or(false)
                    && self.edges_to(&n.id).next().is_none()
            })
            .collect()
    }

    /// Validate the graph invariants.
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        if self.nodes.is_empty() {
            report.errors.push("graph has no nodes".to_owned());
            return report;
        }

        // Unique ids, known kinds.
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                report
                    .errors
                    .push(format!("duplicate node id {:?}", node.id));
            }
            if NodeKind::parse(&node.kind).is_none() {
                report
                    .errors
                    .push(format!("node {:?} has unknown kind {:?}", node.id, node.kind));
            }
        }

        // Edge endpoints must exist.
        for edge in &self.edges {
            if self.node(&edge.source).is_none() {
                report.errors.push(format!(
                    "edge references missing source node {:?}",
                    edge.source
                ));
            }
            if self.node(&edge.target).is_none() {
                report.errors.push(format!(
                    "edge references missing target node {:?}",
                    edge.target
                ));
            }
        }
        if !report.errors.is_empty() {
            return report;
        }

        // At least one trigger node with zero inbound edges.
        let triggers = self.trigger_nodes();
        if triggers.is_empty() {
            report
                .errors
                .push("graph has no trigger node with zero inbound edges".to_owned());
        }

        // Per-kind edge requirements.
        for node in &self.nodes {
            let Some(kind) = NodeKind::parse(&node.kind) else {
                continue;
            };
            match kind {
                NodeKind::Condition => {
                    if self.labeled_edge(&node.id, EDGE_TRUE).is_none()
                        || self.labeled_edge(&node.id, EDGE_FALSE).is_none()
                    {
                        report.errors.push(format!(
                            "condition node {:?} needs outgoing edges labeled \"true\" and \"false\"",
                            node.id
                        ));
                    }
                }
                NodeKind::Loop => {
                    if self.labeled_edge(&node.id, EDGE_BODY).is_none() {
                        report.errors.push(format!(
                            "loop node {:?} needs an outgoing edge labeled \"body\"",
                            node.id
                        ));
                    }
                }
                NodeKind::TryCatch => {
                    if self.labeled_edge(&node.id, EDGE_TRY).is_none() {
                        report.errors.push(format!(
                            "trycatch node {:?} needs an outgoing edge labeled \"try\"",
                            node.id
                        ));
                    }
                }
                NodeKind::Retry | NodeKind::CircuitBreaker => {
                    if self.edges_from(&node.id).count() != 1 {
                        report.errors.push(format!(
                            "node {:?} ({}) must wrap exactly one child via a single outgoing edge",
                            node.id, node.kind
                        ));
                    }
                }
                NodeKind::Parallel => {
                    let branches = node.config.get("branches").and_then(Value::as_array);
                    match branches {
                        None => report.errors.push(format!(
                            "parallel node {:?} needs a config.branches array",
                            node.id
                        )),
                        Some(branches) => {
                            for branch in branches {
                                for id in branch
                                    .get("nodes")
                                    .and_then(Value::as_array)
                                    .into_iter()
                                    .flatten()
                                    .filter_map(Value::as_str)
                                {
                                    if self.node(id).is_none() {
                                        report.errors.push(format!(
                                            "parallel node {:?} references missing branch node {id:?}",
                                            node.id
                                        ));
                                    }
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        // Reachability: warn about nodes no trigger can reach.
        let mut reachable = HashSet::new();
        let mut queue: VecDeque<&str> = triggers.iter().map(|n| n.id.as_str()).collect();
        while let Some(id) = queue.pop_front() {
            if !reachable.insert(id.to_owned()) {
                continue;
            }
            for edge in self.edges_from(id) {
                queue.push_back(&edge.target);
            }
            // Parallel branch nodes are reachable through the operator's
            // config rather than edges.
            if self.kind_of(id) == Some(NodeKind::Parallel) {
                if let Some(node) = self.node(id) {
                    for branch_node in parallel_branch_node_ids(node) {
                        queue.push_back(self.node(&branch_node).map(|n| n.id.as_str()).unwrap_or(""));
                    }
                }
            }
        }
        for node in &self.nodes {
            let is_trigger = NodeKind::parse(&node.kind)
                .map(NodeKind::is_trigger)
                .unwrap_or(false);
            if !is_trigger && !reachable.contains(&node.id) {
                report.warnings.push(format!(
                    "node {:?} is not reachable from any trigger",
                    node.id
                ));
            }
        }

        // Unguarded cycles are an error.
        self.check_cycles(&mut report);

        report
    }

    /// DFS cycle detection. A cycle is permitted only when it passes through
    /// a loop or retry operator.
    fn check_cycles(&self, report: &mut ValidationReport) {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut color: HashMap<&str, Color> = self
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), Color::White))
            .collect();
        let mut stack: Vec<&str> = Vec::new();

        fn visit<'a>(
            def: &'a WorkflowDefinition,
            id: &'a str,
            color: &mut HashMap<&'a str, Color>,
            stack: &mut Vec<&'a str>,
            report: &mut ValidationReport,
        ) {
            color.insert(id, Color::Gray);
            stack.push(id);
            for edge in def.edges_from(id) {
                let target = edge.target.as_str();
                match color.get(target).copied().unwrap_or(Color::White) {
                    Color::White => visit(def, target, color, stack, report),
                    Color::Gray => {
                        // Found a cycle: the stack suffix from target to id.
                        let start = stack.iter().position(|n| *n == target).unwrap_or(0);
                        let cycle = &stack[start..];
                        let guarded = cycle.iter().any(|n| {
                            matches!(
                                def.kind_of(n),
                                Some(NodeKind::Loop) | Some(NodeKind::Retry)
                            )
                        });
                        if !guarded {
                            report.errors.push(format!(
                                "unguarded cycle through nodes {:?}",
                                cycle.join(" -> ")
                            ));
                        }
                    }
                    Color::Black => {}
                }
            }
            stack.pop();
            color.insert(id, Color::Black);
        }

        let ids: Vec<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        for id in ids {
            if color.get(id) == Some(&Color::White) {
                visit(self, id, &mut color, &mut stack, report);
            }
        }
    }
}

/// Node ids listed in a parallel operator's branch config.
pub fn parallel_branch_node_ids(node: &NodeDef) -> Vec<String> {
    node.config
        .get("branches")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .flat_map(|branch| {
            branch
                .get("nodes")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect::<Vec<_>>()
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Scope index
// ---------------------------------------------------------------------------

/// A traversal scope: the member nodes the frontier may visit and the
/// entry nodes that seed it.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub members: HashSet<String>,
    pub entries: Vec<String>,
}

/// Precomputed operator subgraphs for a definition.
#[derive(Debug, Clone, Default)]
pub struct ScopeIndex {
    /// The top-level scope (all nodes not owned by an operator).
    pub top: Scope,
    /// Loop node id -> body scope.
    pub loop_bodies: HashMap<String, Scope>,
    /// TryCatch node id -> try scope.
    pub try_branches: HashMap<String, Scope>,
    /// TryCatch node id -> catch scope (absent when there is no catch edge).
    pub catch_branches: HashMap<String, Scope>,
    /// Retry / circuit-breaker node id -> wrapped child node id.
    pub wrapped_children: HashMap<String, String>,
    /// Every operator-owned node -> its directly owning operator.
    pub wrapper_of: HashMap<String, String>,
}

impl ScopeIndex {
    /// Build the index. Assumes the definition passed validation.
    pub fn build(def: &WorkflowDefinition) -> Self {
        let mut index = ScopeIndex::default();

        for node in &def.nodes {
            match NodeKind::parse(&node.kind) {
                Some(NodeKind::Loop) => {
                    let Some(body_edge) = def.labeled_edge(&node.id, EDGE_BODY) else {
                        continue;
                    };
                    let done_target = def
                        .labeled_edge(&node.id, EDGE_DONE)
                        .map(|e| e.target.clone());
                    let scope = collect_scope(
                        def,
                        std::slice::from_ref(&body_edge.target),
                        &node.id,
                        done_target.as_deref(),
                    );
                    claim_owned(&mut index.wrapper_of, &scope, &node.id);
                    index.loop_bodies.insert(node.id.clone(), scope);
                }
                Some(NodeKind::TryCatch) => {
                    let try_roots: Vec<String> = def
                        .edges_from(&node.id)
                        .filter(|e| e.label.as_deref() == Some(EDGE_TRY))
                        .map(|e| e.target.clone())
                        .collect();
                    let catch_roots: Vec<String> = def
                        .edges_from(&node.id)
                        .filter(|e| e.label.as_deref() == Some(EDGE_CATCH))
                        .map(|e| e.target.clone())
                        .collect();
                    let done_target = def
                        .labeled_edge(&node.id, EDGE_DONE)
                        .map(|e| e.target.clone());

                    if !try_roots.is_empty() {
                        let scope = collect_scope(def, &try_roots, &node.id, done_target.as_deref());
                        claim_owned(&mut index.wrapper_of, &scope, &node.id);
                        index.try_branches.insert(node.id.clone(), scope);
                    }
                    if !catch_roots.is_empty() {
                        let scope =
                            collect_scope(def, &catch_roots, &node.id, done_target.as_deref());
                        claim_owned(&mut index.wrapper_of, &scope, &node.id);
                        index.catch_branches.insert(node.id.clone(), scope);
                    }
                }
                Some(NodeKind::Retry) | Some(NodeKind::CircuitBreaker) => {
                    if let Some(edge) = def.edges_from(&node.id).next() {
                        index
                            .wrapped_children
                            .insert(node.id.clone(), edge.target.clone());
                        index.wrapper_of.insert(edge.target.clone(), node.id.clone());
                    }
                }
                Some(NodeKind::Parallel) => {
                    for branch_node in parallel_branch_node_ids(node) {
                        index.wrapper_of.insert(branch_node, node.id.clone());
                    }
                }
                _ => {}
            }
        }

        // Top scope: everything not owned by an operator; entries are the
        // trigger nodes.
        let owned: HashSet<&String> = index.wrapper_of.keys().collect();
        let members: HashSet<String> = def
            .nodes
            .iter()
            .filter(|n| !owned.contains(&n.id))
            .map(|n| n.id.clone())
            .collect();
        let entries = def
            .trigger_nodes()
            .into_iter()
            .filter(|n| members.contains(&n.id))
            .map(|n| n.id.clone())
            .collect();
        index.top = Scope { members, entries };

        index
    }

    /// Whether a node belongs to some operator's nested subgraph.
    pub fn is_owned(&self, id: &str) -> bool {
        self.wrapper_of.contains_key(id)
    }

    /// Map an edge source to the node the given scope observes: an owned
    /// source resolves to its (transitive) wrapping operator; a source the
    /// scope cannot see resolves to `None`.
    pub fn effective_source<'a>(&'a self, scope: &Scope, mut source: &'a str) -> Option<&'a str> {
        let mut hops = 0;
        while !scope.members.contains(source) {
            source = self.wrapper_of.get(source)?;
            hops += 1;
            if hops > self.wrapper_of.len() {
                return None;
            }
        }
        Some(source)
    }
}

/// Mark every member of a scope as owned by `op`, unless a deeper operator
/// already claimed it.
fn claim_owned(wrapper_of: &mut HashMap<String, String>, scope: &Scope, op: &str) {
    for member in &scope.members {
        wrapper_of
            .entry(member.clone())
            .or_insert_with(|| op.to_owned());
    }
}

/// Collect an operator subgraph by BFS from its roots.
///
/// The walk does not expand through nested operators' internal edges (their
/// bodies belong to them), and stops at the operator itself and its `done`
/// continuation target.
fn collect_scope(
    def: &WorkflowDefinition,
    roots: &[String],
    op_id: &str,
    done_target: Option<&str>,
) -> Scope {
    let mut members = HashSet::new();
    let mut queue: VecDeque<String> = roots.iter().cloned().collect();

    while let Some(id) = queue.pop_front() {
        if id == op_id || Some(id.as_str()) == done_target {
            continue;
        }
        if !members.insert(id.clone()) {
            continue;
        }
        for target in expansion_targets(def, &id) {
            queue.push_back(target);
        }
    }

    Scope {
        members,
        entries: roots.to_vec(),
    }
}

/// The targets control flow follows out of a node: plain edges for plain
/// nodes, continuation-only edges for operators (their internal subgraphs
/// are traversed by the operators themselves).
pub(crate) fn expansion_targets(def: &WorkflowDefinition, id: &str) -> Vec<String> {
    match def.kind_of(id) {
        Some(NodeKind::Loop) | Some(NodeKind::TryCatch) => def
            .edges_from(id)
            .filter(|e| e.label.as_deref() == Some(EDGE_DONE))
            .map(|e| e.target.clone())
            .collect(),
        Some(NodeKind::Retry) | Some(NodeKind::CircuitBreaker) => {
            // Continuation flows out of the wrapped child.
            match def.edges_from(id).next() {
                Some(edge) => expansion_targets(def, &edge.target),
                None => Vec::new(),
            }
        }
        _ => def.edges_from(id).map(|e| e.target.clone()).collect(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
