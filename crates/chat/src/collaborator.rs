use std::fmt;
use std::sync::Arc;

use arbor_tree::{ConversationId, FileRef, MessageId, TransferMethod, WorkflowRunId};
pub use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::ChatResult;
use super::events::ChatStreamHandle;
use super::inputs::InputValues;
use super::settings::AppSourceType;
use super::stream::StreamTarget;

/// Runs once a new conversation has been created by its first completed exchange.
pub type ConversationCompleteHook = Arc<dyn Fn(&ConversationId) + Send + Sync>;

/// Streaming transport the orchestrator drives. Implementations own the wire protocol;
/// the orchestrator owns the tree.
pub trait StreamingCollaborator: Send + Sync {
    fn send(&self, request: ChatRequest) -> ChatResult<ChatStreamHandle>;

    /// Notifies the transport that the user moved to another branch. Returns a stream only
    /// when `request.resume` asked to re-subscribe to a paused workflow.
    fn switch_sibling(&self, request: SwitchSiblingRequest)
    -> ChatResult<Option<ChatStreamHandle>>;

    /// Fire-and-forget request to stop server-side generation.
    fn stop(&self, request: StopRequest);
}

pub trait SuggestedQuestionsFetcher: Send + Sync {
    fn fetch<'a>(
        &'a self,
        response_message_id: &'a MessageId,
        app_source: AppSourceType,
        app_id: &'a str,
    ) -> BoxFuture<'a, ChatResult<Vec<String>>>;
}

pub trait HumanInputFormService: Send + Sync {
    fn submit<'a>(
        &'a self,
        app_source: AppSourceType,
        form_token: &'a str,
        submission: HumanInputSubmission,
    ) -> BoxFuture<'a, ChatResult<()>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanInputSubmission {
    pub inputs: InputValues,
    pub action: String,
}

#[derive(Clone)]
pub struct SuggestedQuestionsHook {
    pub fetcher: Arc<dyn SuggestedQuestionsFetcher>,
    pub app_source: AppSourceType,
    pub app_id: String,
}

impl fmt::Debug for SuggestedQuestionsHook {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SuggestedQuestionsHook")
            .field("app_source", &self.app_source)
            .field("app_id", &self.app_id)
            .finish_non_exhaustive()
    }
}

/// Callbacks travelling with a send or sibling switch.
///
/// The orchestrator runs them itself when a stream delivered through the event channel
/// completes; transports only inspect them.
#[derive(Clone, Default)]
pub struct SendCallbacks {
    pub on_get_suggested_questions: Option<SuggestedQuestionsHook>,
    /// Present only when the conversation had no id when the action started.
    pub on_conversation_complete: Option<ConversationCompleteHook>,
}

impl fmt::Debug for SendCallbacks {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SendCallbacks")
            .field(
                "on_get_suggested_questions",
                &self.on_get_suggested_questions,
            )
            .field(
                "on_conversation_complete",
                &self.on_conversation_complete.as_ref().map(|_| "Fn"),
            )
            .finish()
    }
}

/// File entry as the message endpoint expects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadFile {
    #[serde(rename = "type")]
    pub kind: String,
    pub transfer_method: Option<TransferMethod>,
    pub url: String,
    pub upload_file_id: Option<String>,
}

impl From<&FileRef> for PayloadFile {
    fn from(file: &FileRef) -> Self {
        let kind = file
            .mime_type
            .split('/')
            .next()
            .filter(|kind| !kind.is_empty())
            .unwrap_or("document");
        let kind = match kind {
            "image" | "audio" | "video" => kind,
            _ => "document",
        };
        // Local uploads are referenced by id only.
        let url = match file.transfer_method {
            Some(TransferMethod::LocalFile) => String::new(),
            _ => file.url.clone().unwrap_or_default(),
        };
        Self {
            kind: kind.to_string(),
            transfer_method: file.transfer_method,
            url,
            upload_file_id: file.uploaded_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub query: String,
    pub inputs: InputValues,
    #[serde(with = "conversation_id_or_empty")]
    pub conversation_id: Option<ConversationId>,
    pub parent_message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<PayloadFile>>,
    pub response_mode: String,
}

impl ChatPayload {
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub target: StreamTarget,
    pub endpoint: String,
    pub payload: ChatPayload,
    pub callbacks: SendCallbacks,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeTarget {
    pub message_id: MessageId,
    pub workflow_run_id: WorkflowRunId,
}

#[derive(Debug, Clone)]
pub struct SwitchSiblingRequest {
    pub target: StreamTarget,
    pub sibling_id: MessageId,
    pub callbacks: SendCallbacks,
    pub resume: Option<ResumeTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopRequest {
    pub task_id: String,
    pub app_source: AppSourceType,
    pub app_id: String,
    pub session_token: String,
}

mod conversation_id_or_empty {
    use arbor_tree::ConversationId;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<ConversationId>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value.as_ref().map(ConversationId::as_str).unwrap_or(""))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<ConversationId>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        Ok((!raw.trim().is_empty()).then(|| ConversationId::new(raw)))
    }
}
