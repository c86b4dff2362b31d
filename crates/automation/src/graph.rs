//! Index-based action DAG.
//!
//! Actions and edges are loaded once per execution and turned into an arena of
//! nodes plus per-node outgoing slots keyed by [`EdgeType`]; traversal is then
//! pure index lookups.

use std::collections::{HashMap, VecDeque};

use thiserror::Error;

use stockflow_core::{ActionId, RuleId};

use crate::rule::{ActionEdge, EdgeType, RuleAction};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("rule {rule_id} has no start edge")]
    MissingStart { rule_id: RuleId },

    #[error("rule {rule_id} has {count} start edges; exactly one is required")]
    MultipleStarts { rule_id: RuleId, count: usize },

    #[error("start edge into {target} must not have a source action")]
    StartWithSource { target: ActionId },

    #[error("{edge_type} edge into {target} has no source action")]
    MissingSource { target: ActionId, edge_type: EdgeType },

    #[error("edge references unknown action {0}")]
    UnknownAction(ActionId),

    #[error("action or edge belongs to rule {found}, expected {expected}")]
    ForeignRule { expected: RuleId, found: RuleId },

    #[error("action {source_action} has more than one {edge_type} edge")]
    DuplicateEdge {
        source_action: ActionId,
        edge_type: EdgeType,
    },

    #[error("action graph contains a cycle through {0}")]
    Cycle(ActionId),

    #[error("action {0} has no incoming edge")]
    Unreachable(ActionId),
}

/// Which checks to run; drafts may still lack a start edge or wiring.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Completeness {
    Draft,
    Complete,
}

#[derive(Debug, Clone)]
pub struct ActionGraph {
    rule_id: RuleId,
    nodes: Vec<RuleAction>,
    index: HashMap<ActionId, usize>,
    outgoing: Vec<HashMap<EdgeType, usize>>,
    start: usize,
}

impl ActionGraph {
    /// Build and fully validate a rule's graph.
    pub fn build(rule_id: RuleId, actions: Vec<RuleAction>, edges: &[ActionEdge]) -> Result<Self, GraphError> {
        let (index, outgoing, start) = check(rule_id, &actions, edges, Completeness::Complete)?;
        let start = start.ok_or(GraphError::MissingStart { rule_id })?;
        Ok(Self {
            rule_id,
            nodes: actions,
            index,
            outgoing,
            start,
        })
    }

    /// Structural checks that must hold at every authoring step: edge
    /// endpoints exist, at most one start, no duplicate edges, no cycles.
    pub fn validate_draft(rule_id: RuleId, actions: &[RuleAction], edges: &[ActionEdge]) -> Result<(), GraphError> {
        check(rule_id, actions, edges, Completeness::Draft).map(|_| ())
    }

    pub fn rule_id(&self) -> RuleId {
        self.rule_id
    }

    pub fn start(&self) -> &RuleAction {
        &self.nodes[self.start]
    }

    pub fn action(&self, id: ActionId) -> Option<&RuleAction> {
        self.index.get(&id).map(|&i| &self.nodes[i])
    }

    /// Target of `from`'s outgoing edge of type `edge`, if one is wired.
    pub fn next(&self, from: ActionId, edge: EdgeType) -> Option<&RuleAction> {
        let i = *self.index.get(&from)?;
        self.outgoing[i].get(&edge).map(|&t| &self.nodes[t])
    }

    pub fn actions(&self) -> &[RuleAction] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

type Checked = (HashMap<ActionId, usize>, Vec<HashMap<EdgeType, usize>>, Option<usize>);

fn check(
    rule_id: RuleId,
    actions: &[RuleAction],
    edges: &[ActionEdge],
    mode: Completeness,
) -> Result<Checked, GraphError> {
    let mut index = HashMap::with_capacity(actions.len());
    for (i, action) in actions.iter().enumerate() {
        if action.rule_id != rule_id {
            return Err(GraphError::ForeignRule {
                expected: rule_id,
                found: action.rule_id,
            });
        }
        index.insert(action.id, i);
    }

    let lookup = |id: ActionId| index.get(&id).copied().ok_or(GraphError::UnknownAction(id));

    let mut outgoing: Vec<HashMap<EdgeType, usize>> = vec![HashMap::new(); actions.len()];
    let mut incoming = vec![0usize; actions.len()];
    let mut starts = Vec::new();

    for edge in edges {
        if edge.rule_id != rule_id {
            return Err(GraphError::ForeignRule {
                expected: rule_id,
                found: edge.rule_id,
            });
        }
        let target = lookup(edge.target_action_id)?;
        match (edge.edge_type, edge.source_action_id) {
            (EdgeType::Start, None) => starts.push(target),
            (EdgeType::Start, Some(_)) => {
                return Err(GraphError::StartWithSource {
                    target: edge.target_action_id,
                });
            }
            (edge_type, None) => {
                return Err(GraphError::MissingSource {
                    target: edge.target_action_id,
                    edge_type,
                });
            }
            (edge_type, Some(source_id)) => {
                let source = lookup(source_id)?;
                if outgoing[source].insert(edge_type, target).is_some() {
                    return Err(GraphError::DuplicateEdge {
                        source_action: source_id,
                        edge_type,
                    });
                }
                incoming[target] += 1;
            }
        }
    }

    if starts.len() > 1 {
        return Err(GraphError::MultipleStarts {
            rule_id,
            count: starts.len(),
        });
    }
    let start = starts.first().copied();

    detect_cycle(actions, &outgoing, &incoming)?;

    if mode == Completeness::Complete {
        let start = start.ok_or(GraphError::MissingStart { rule_id })?;
        if let Some((i, _)) = incoming
            .iter()
            .enumerate()
            .find(|&(i, &count)| i != start && count == 0)
        {
            return Err(GraphError::Unreachable(actions[i].id));
        }
    }

    Ok((index, outgoing, start))
}

// Kahn's algorithm: any node never drained sits on a cycle.
fn detect_cycle(
    actions: &[RuleAction],
    outgoing: &[HashMap<EdgeType, usize>],
    incoming: &[usize],
) -> Result<(), GraphError> {
    let mut remaining = incoming.to_vec();
    let mut queue: VecDeque<usize> = (0..actions.len()).filter(|&i| remaining[i] == 0).collect();
    let mut drained = 0;
    while let Some(i) = queue.pop_front() {
        drained += 1;
        for &t in outgoing[i].values() {
            remaining[t] -= 1;
            if remaining[t] == 0 {
                queue.push_back(t);
            }
        }
    }
    if drained == actions.len() {
        return Ok(());
    }
    let stuck = remaining.iter().position(|&r| r > 0).unwrap_or(0);
    Err(GraphError::Cycle(actions[stuck].id))
}
