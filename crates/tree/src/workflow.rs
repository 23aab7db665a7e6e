use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowStatus {
    Waiting,
    #[default]
    Running,
    Succeeded,
    PartialSucceeded,
    Failed,
    Stopped,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeStatus {
    NotStart,
    Waiting,
    #[default]
    Running,
    Succeeded,
    Failed,
    Exception,
    Retry,
    Stopped,
    Paused,
}

/// One executed workflow node, iteration or loop as reported by the run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeTrace {
    /// Execution id; differs between runs of the same node.
    pub id: String,
    pub node_id: String,
    pub node_type: String,
    pub title: String,
    pub status: NodeStatus,
    pub iteration_id: Option<String>,
    pub loop_id: Option<String>,
    pub parallel_id: Option<String>,
    pub error: Option<String>,
}

impl NodeTrace {
    fn inside_iteration(&self) -> bool {
        self.iteration_id.as_deref().is_some_and(|id| !id.is_empty())
    }

    fn same_execution(&self, other: &NodeTrace) -> bool {
        match &self.parallel_id {
            None => self.id == other.id,
            Some(parallel_id) => {
                self.id == other.id && other.parallel_id.as_ref() == Some(parallel_id)
            }
        }
    }
}

/// Status and node trace of the workflow run behind an answer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowProcess {
    pub status: WorkflowStatus,
    pub tracing: Vec<NodeTrace>,
}

impl WorkflowProcess {
    pub fn running() -> Self {
        Self::default()
    }

    /// Nodes inside an iteration are reported by the iteration itself and skipped here.
    pub fn node_started(&mut self, mut trace: NodeTrace) {
        trace.status = NodeStatus::Running;
        match self
            .tracing
            .iter_mut()
            .find(|entry| entry.node_id == trace.node_id)
        {
            Some(entry) => *entry = trace,
            None if trace.inside_iteration() => {}
            None => self.tracing.push(trace),
        }
    }

    pub fn node_finished(&mut self, trace: NodeTrace) {
        if trace.inside_iteration() {
            return;
        }
        if let Some(entry) = self
            .tracing
            .iter_mut()
            .find(|entry| entry.same_execution(&trace))
        {
            *entry = trace;
        }
    }

    /// Iterations and loops always open a new trace entry.
    pub fn container_started(&mut self, mut trace: NodeTrace) {
        trace.status = NodeStatus::Running;
        self.tracing.push(trace);
    }

    pub fn container_finished(&mut self, mut trace: NodeTrace) {
        if let Some(entry) = self
            .tracing
            .iter_mut()
            .find(|entry| entry.node_id == trace.node_id && entry.parallel_id == trace.parallel_id)
        {
            trace.status = NodeStatus::Succeeded;
            *entry = trace;
        }
    }

    pub fn pause_node(&mut self, node_id: &str) {
        if let Some(entry) = self
            .tracing
            .iter_mut()
            .find(|entry| entry.node_id == node_id)
        {
            entry.status = NodeStatus::Paused;
        }
    }
}

/// Knowledge retrieval source cited by an answer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Citation {
    pub position: u32,
    pub dataset_id: String,
    pub dataset_name: String,
    pub document_id: String,
    pub document_name: String,
    pub segment_id: String,
    pub content: String,
}

/// Curated reply attached to an answer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Annotation {
    pub id: String,
    #[serde(alias = "author_name")]
    pub author_name: String,
    /// Reply text logged when the annotation was added from this answer.
    pub logged_content: Option<String>,
}
