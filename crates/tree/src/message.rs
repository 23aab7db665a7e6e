use serde::{Deserialize, Serialize};

use super::ids::{MessageId, WorkflowRunId};
use super::workflow::{Annotation, Citation, WorkflowProcess, WorkflowStatus};

/// Node kind inside a conversation tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Question,
    Answer,
    OpeningStatement,
}

/// Lifecycle status for one message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MessageStatus {
    /// Inserted locally, nothing received from the server yet.
    Pending,
    Streaming,
    /// Workflow run stopped to wait for human input.
    Paused,
    #[default]
    Done,
    Cancelled,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMethod {
    LocalFile,
    RemoteUrl,
}

/// File reference attached to a question or carried in a file-typed input.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileRef {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    #[serde(alias = "transfer_method")]
    pub transfer_method: Option<TransferMethod>,
    #[serde(alias = "upload_file_id")]
    pub uploaded_id: Option<String>,
    pub url: Option<String>,
    pub progress: u8,
}

impl FileRef {
    pub fn uploaded(id: impl Into<String>, name: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            uploaded_id: Some(id.clone()),
            id,
            name: name.into(),
            transfer_method: Some(TransferMethod::LocalFile),
            progress: 100,
            ..Self::default()
        }
    }

    /// A file is still uploading while it has a transfer method but no server-side id.
    pub fn is_uploading(&self) -> bool {
        self.transfer_method.is_some() && self.uploaded_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanInputField {
    #[serde(alias = "output_variable_name")]
    pub variable: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanInputAction {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub button_style: Option<String>,
}

/// Form a paused workflow node is waiting on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanInputForm {
    pub node_id: String,
    #[serde(default)]
    pub form_id: String,
    #[serde(default)]
    pub form_token: String,
    #[serde(default)]
    pub node_title: String,
    #[serde(default)]
    pub expiration_time: Option<u64>,
    #[serde(default)]
    pub inputs: Vec<HumanInputField>,
    #[serde(default)]
    pub actions: Vec<HumanInputAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilledHumanInputForm {
    pub node_id: String,
    #[serde(default)]
    pub node_title: String,
    #[serde(default)]
    pub rendered_content: String,
    #[serde(default)]
    pub action_id: Option<String>,
}

/// Place of a node among the alternate variants that share its parent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SiblingPosition {
    pub count: usize,
    pub index: usize,
    pub next_sibling_id: Option<MessageId>,
    pub prev_sibling_id: Option<MessageId>,
}

impl SiblingPosition {
    pub fn single() -> Self {
        Self {
            count: 1,
            ..Self::default()
        }
    }

    pub(crate) fn within(siblings: &[MessageId], index: usize) -> Self {
        Self {
            count: siblings.len(),
            index,
            next_sibling_id: siblings.get(index + 1).cloned(),
            prev_sibling_id: index
                .checked_sub(1)
                .and_then(|prev| siblings.get(prev))
                .cloned(),
        }
    }
}

/// Streamed content update for an answer node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentUpdate {
    Append(String),
    Replace(String),
}

/// Node content; tree structure lives in the arena.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub files: Vec<FileRef>,
    pub parent_id: Option<MessageId>,
    pub workflow_run_id: Option<WorkflowRunId>,
    pub pending_forms: Vec<HumanInputForm>,
    pub filled_forms: Vec<FilledHumanInputForm>,
    pub workflow_process: Option<WorkflowProcess>,
    pub citations: Vec<Citation>,
    pub annotation: Option<Annotation>,
    pub sibling_position: SiblingPosition,
    pub status: MessageStatus,
}

impl Message {
    pub fn new(id: MessageId, role: Role, content: impl Into<String>) -> Self {
        Self {
            id,
            role,
            content: content.into(),
            files: Vec::new(),
            parent_id: None,
            workflow_run_id: None,
            pending_forms: Vec::new(),
            filled_forms: Vec::new(),
            workflow_process: None,
            citations: Vec::new(),
            annotation: None,
            sibling_position: SiblingPosition::single(),
            status: MessageStatus::Done,
        }
    }

    pub fn question(id: MessageId, content: impl Into<String>) -> Self {
        Self::new(id, Role::Question, content)
    }

    pub fn answer(id: MessageId, content: impl Into<String>) -> Self {
        Self::new(id, Role::Answer, content)
    }

    pub fn opening_statement(id: MessageId, content: impl Into<String>) -> Self {
        Self::new(id, Role::OpeningStatement, content)
    }

    pub fn with_files(mut self, files: Vec<FileRef>) -> Self {
        self.files = files;
        self
    }

    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_answer(&self) -> bool {
        matches!(self.role, Role::Answer)
    }

    pub fn is_opening_statement(&self) -> bool {
        matches!(self.role, Role::OpeningStatement)
    }

    /// A workflow run that stopped to wait for at least one human input form.
    pub fn is_paused_workflow(&self) -> bool {
        self.workflow_run_id.is_some() && !self.pending_forms.is_empty()
    }

    /// Answers that can anchor a follow-up question: fully generated, server-acknowledged,
    /// and not an error placeholder.
    pub fn is_valid_generated_answer(&self) -> bool {
        self.is_answer()
            && !self.id.is_answer_placeholder()
            && matches!(
                self.status,
                MessageStatus::Done | MessageStatus::Cancelled | MessageStatus::Paused
            )
    }

    pub fn apply_content(&mut self, update: ContentUpdate) {
        match update {
            ContentUpdate::Append(delta) => self.content.push_str(&delta),
            ContentUpdate::Replace(full) => self.content = full,
        }
    }

    /// Opens the workflow process, or marks an already traced one running again after a
    /// resume.
    pub fn start_workflow(&mut self, workflow_run_id: WorkflowRunId) {
        match self.workflow_process.as_mut() {
            Some(process) if !process.tracing.is_empty() => {
                process.status = WorkflowStatus::Running;
            }
            _ => {
                self.workflow_run_id = Some(workflow_run_id);
                self.workflow_process = Some(WorkflowProcess::running());
            }
        }
    }

    pub fn set_workflow_status(&mut self, status: WorkflowStatus) {
        if let Some(process) = self.workflow_process.as_mut() {
            process.status = status;
        }
    }

    /// An annotation reply replaces everything else the message end carries.
    pub fn record_message_end(
        &mut self,
        annotation: Option<Annotation>,
        citations: Vec<Citation>,
        files: Vec<FileRef>,
    ) {
        if let Some(annotation) = annotation {
            self.annotation = Some(annotation);
            return;
        }
        self.citations = citations;
        for file in files {
            if !self.files.iter().any(|known| known.id == file.id) {
                self.files.push(file);
            }
        }
    }

    /// Inserts or replaces a pending form keyed by its workflow node id. The node's trace
    /// entry, if any, is marked paused.
    pub fn upsert_pending_form(&mut self, form: HumanInputForm) {
        if let Some(process) = self.workflow_process.as_mut() {
            process.pause_node(&form.node_id);
        }
        match self
            .pending_forms
            .iter_mut()
            .find(|pending| pending.node_id == form.node_id)
        {
            Some(existing) => *existing = form,
            None => self.pending_forms.push(form),
        }
    }

    pub fn mark_form_filled(&mut self, filled: FilledHumanInputForm) {
        self.pending_forms
            .retain(|pending| pending.node_id != filled.node_id);
        self.filled_forms.push(filled);
    }
}
