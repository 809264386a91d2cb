use std::collections::HashMap;

use crate::error::AgentError;
use crate::task::TaskStatus;

/// Maximum parent chain length, root inclusive.
pub const MAX_GRAPH_DEPTH: usize = 10;

#[derive(Debug, Clone)]
struct GraphNode {
    parent: Option<String>,
    children: Vec<String>,
    status: TaskStatus,
    progress: f64,
}

/// Tree superstructure over tasks that were decomposed hierarchically.
///
/// The graph mirrors status and progress of its member tasks; callers feed
/// transitions in through [`TaskGraph::update`] and parent nodes are rolled
/// up automatically. Holds no locks; owners wrap it as needed.
#[derive(Default)]
pub struct TaskGraph {
    nodes: HashMap<String, GraphNode>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_root(&mut self, id: &str) {
        self.nodes.insert(
            id.to_string(),
            GraphNode {
                parent: None,
                children: Vec::new(),
                status: TaskStatus::Pending,
                progress: 0.0,
            },
        );
    }

    /// Attach `child_id` under `parent_id`. Fails `NotFound` for an unknown
    /// parent and `Fatal` when the chain would exceed [`MAX_GRAPH_DEPTH`].
    pub fn insert_child(&mut self, parent_id: &str, child_id: &str) -> Result<(), AgentError> {
        if !self.nodes.contains_key(parent_id) {
            return Err(AgentError::not_found(format!(
                "parent task not in graph: {}",
                parent_id
            )));
        }
        if self.depth(parent_id) + 1 > MAX_GRAPH_DEPTH {
            return Err(AgentError::fatal(format!(
                "task graph depth limit {} exceeded under {}",
                MAX_GRAPH_DEPTH, parent_id
            )));
        }
        self.nodes.insert(
            child_id.to_string(),
            GraphNode {
                parent: Some(parent_id.to_string()),
                children: Vec::new(),
                status: TaskStatus::Pending,
                progress: 0.0,
            },
        );
        if let Some(parent) = self.nodes.get_mut(parent_id) {
            parent.children.push(child_id.to_string());
        }
        Ok(())
    }

    /// Chain length from the node up to its root, node inclusive.
    pub fn depth(&self, id: &str) -> usize {
        let mut depth = 0;
        let mut cursor = Some(id.to_string());
        while let Some(current) = cursor {
            match self.nodes.get(&current) {
                Some(node) => {
                    depth += 1;
                    cursor = node.parent.clone();
                }
                None => break,
            }
        }
        depth
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.nodes.get(id).map(|n| n.status)
    }

    pub fn progress(&self, id: &str) -> Option<f64> {
        self.nodes.get(id).map(|n| n.progress)
    }

    pub fn children(&self, id: &str) -> Vec<String> {
        self.nodes
            .get(id)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    /// Record a member task's transition and roll ancestors up: progress of
    /// a parent is the mean of its immediate children, status follows the
    /// aggregation rules.
    pub fn update(&mut self, id: &str, status: TaskStatus, progress: f64) {
        let parent = match self.nodes.get_mut(id) {
            Some(node) => {
                node.status = status;
                node.progress = progress;
                node.parent.clone()
            }
            None => return,
        };

        let mut cursor = parent;
        while let Some(current) = cursor {
            let children = self.children(&current);
            let states: Vec<(TaskStatus, f64)> = children
                .iter()
                .filter_map(|c| self.nodes.get(c).map(|n| (n.status, n.progress)))
                .collect();
            if states.is_empty() {
                break;
            }

            let mean = states.iter().map(|(_, p)| p).sum::<f64>() / states.len() as f64;
            let rolled = aggregate_status(states.iter().map(|(s, _)| *s));

            let node = match self.nodes.get_mut(&current) {
                Some(n) => n,
                None => break,
            };
            node.progress = mean;
            if let Some(status) = rolled {
                node.status = status;
            }
            cursor = node.parent.clone();
        }
    }
}

/// Parent status from child statuses: any running wins, then all done,
/// then any failed with none running. Mixed non-terminal states leave the
/// parent unchanged (None).
fn aggregate_status(children: impl Iterator<Item = TaskStatus>) -> Option<TaskStatus> {
    let mut any_running = false;
    let mut any_failed = false;
    let mut all_done = true;
    let mut count = 0;
    for status in children {
        count += 1;
        match status {
            TaskStatus::Running => any_running = true,
            TaskStatus::Failed => any_failed = true,
            _ => {}
        }
        if status != TaskStatus::Done {
            all_done = false;
        }
    }
    if count == 0 {
        return None;
    }
    if any_running {
        return Some(TaskStatus::Running);
    }
    if all_done {
        return Some(TaskStatus::Done);
    }
    if any_failed {
        return Some(TaskStatus::Failed);
    }
    None
}
