use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::TreeResult;
use super::ids::{MessageId, WorkflowRunId};
use super::message::{FileRef, HumanInputForm, Message, MessageStatus, Role};
use super::tree::ConversationTree;
use super::workflow::{Annotation, Citation, WorkflowProcess};

/// Nested tree node as persisted by the server or cached by a previous session.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedNode {
    pub id: MessageId,
    pub content: String,
    pub is_answer: bool,
    pub is_opening_statement: bool,
    #[serde(alias = "message_files")]
    pub message_files: Vec<FileRef>,
    #[serde(alias = "workflow_run_id")]
    pub workflow_run_id: Option<WorkflowRunId>,
    #[serde(alias = "humanInputFormDataList")]
    pub pending_human_input_forms: Vec<HumanInputForm>,
    pub workflow_process: Option<WorkflowProcess>,
    #[serde(alias = "citation")]
    pub citations: Vec<Citation>,
    pub annotation: Option<Annotation>,
    pub children: Vec<PersistedNode>,
}

impl PersistedNode {
    fn role(&self) -> Role {
        if self.is_opening_statement {
            Role::OpeningStatement
        } else if self.is_answer {
            Role::Answer
        } else {
            Role::Question
        }
    }

    fn to_message(&self, parent_id: Option<MessageId>) -> Message {
        let mut message = Message::new(self.id.clone(), self.role(), self.content.clone())
            .with_files(self.message_files.clone());
        message.parent_id = parent_id;
        message.workflow_run_id = self.workflow_run_id.clone();
        message.pending_forms = self.pending_human_input_forms.clone();
        message.workflow_process = self.workflow_process.clone();
        message.citations = self.citations.clone();
        message.annotation = self.annotation.clone();
        if message.is_paused_workflow() {
            message.status = MessageStatus::Paused;
        }
        message
    }
}

/// One question/answer exchange as returned by the conversation history endpoint.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct HistoryMessage {
    pub id: MessageId,
    pub query: String,
    pub answer: String,
    pub parent_message_id: Option<MessageId>,
    pub message_files: Vec<FileRef>,
    pub workflow_run_id: Option<WorkflowRunId>,
    #[serde(alias = "human_input_form_data_list")]
    pub human_input_forms: Vec<HumanInputForm>,
    pub retriever_resources: Vec<Citation>,
    pub status: Option<String>,
    pub error: Option<String>,
}

impl HistoryMessage {
    // Conversations created before branching existed chain every exchange linearly and
    // carry the nil UUID as parent.
    fn is_legacy(&self) -> bool {
        self.parent_message_id
            .as_ref()
            .and_then(|parent| Uuid::parse_str(parent.as_str()).ok())
            .is_some_and(|parent| parent.is_nil())
    }

    fn answer_status(&self) -> MessageStatus {
        if self.status.as_deref() == Some("error") {
            return MessageStatus::Error(self.error.clone().unwrap_or_default());
        }
        if self.workflow_run_id.is_some() && !self.human_input_forms.is_empty() {
            return MessageStatus::Paused;
        }
        MessageStatus::Done
    }
}

impl ConversationTree {
    /// Rebuilds the arena from the nested persisted form, keeping child order.
    pub fn hydrate(nodes: &[PersistedNode]) -> TreeResult<Self> {
        let mut tree = Self::new();
        let mut stack: Vec<(&PersistedNode, Option<MessageId>)> =
            nodes.iter().rev().map(|node| (node, None)).collect();

        while let Some((node, parent_id)) = stack.pop() {
            let id = tree.insert(node.to_message(parent_id))?;
            stack.extend(
                node.children
                    .iter()
                    .rev()
                    .map(|child| (child, Some(id.clone()))),
            );
        }

        tracing::debug!(
            node_count = tree.len(),
            root_count = tree.roots().len(),
            "hydrated conversation tree"
        );
        Ok(tree)
    }

    /// Builds the tree from the flat, chronologically ordered history list.
    ///
    /// Each record becomes a question node (`question-<id>`) with a single answer child
    /// (`<id>`). A record whose parent is unknown starts a new root; legacy records are
    /// chained onto the previous legacy answer.
    pub fn from_history(messages: &[HistoryMessage]) -> TreeResult<Self> {
        let mut tree = Self::new();
        let mut last_legacy_answer: Option<MessageId> = None;

        for item in messages {
            let is_legacy = item.is_legacy();
            let parent_id = match &item.parent_message_id {
                _ if is_legacy => last_legacy_answer.clone(),
                Some(parent) if tree.contains(parent) => Some(parent.clone()),
                Some(parent) if !parent.is_empty() => {
                    tracing::warn!(
                        message_id = %item.id,
                        parent_id = %parent,
                        "history record references an unknown parent; treating it as a root"
                    );
                    None
                }
                _ => None,
            };

            let mut question =
                Message::question(MessageId::question_for_answer(&item.id), item.query.clone())
                    .with_files(item.message_files.clone());
            question.parent_id = parent_id;
            let question_id = tree.insert(question)?;

            let mut answer = Message::answer(item.id.clone(), item.answer.clone())
                .with_status(item.answer_status());
            answer.parent_id = Some(question_id);
            answer.workflow_run_id = item.workflow_run_id.clone();
            answer.pending_forms = item.human_input_forms.clone();
            answer.citations = item.retriever_resources.clone();
            let answer_id = tree.insert(answer)?;

            if is_legacy {
                last_legacy_answer = Some(answer_id);
            }
        }

        Ok(tree)
    }
}
