use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arbor_tree::{
    Annotation, ContentUpdate, ConversationId, ConversationThread, ConversationTree, FileRef,
    Message, MessageId, MessageStatus, ResumptionGuard, Role, TreeError, TreeResult,
    WorkflowProcess, WorkflowStatus, fill_placeholders, find_paused_workflow_node,
    last_valid_answer, visible_messages, with_opening_statement,
};
use arc_swap::ArcSwap;
use serde_json::Value;
use snafu::{OptionExt, ResultExt};

use super::collaborator::{
    ChatPayload, ChatRequest, ConversationCompleteHook, HumanInputFormService,
    HumanInputSubmission, PayloadFile, ResumeTarget, SendCallbacks, StopRequest,
    StreamingCollaborator, SuggestedQuestionsFetcher, SuggestedQuestionsHook,
    SwitchSiblingRequest,
};
use super::error::{ChatError, ChatResult, FormServiceMissingSnafu, TreeSnafu};
use super::events::{
    CancelToken, ChatEventPayload, ChatEventStream, ChatStreamEvent, ChatWorker, MessageEnd,
};
use super::gating::is_compose_disabled;
use super::inputs::{InputField, InputValues, normalize_inputs};
use super::settings::ChatSettings;
use super::stream::{
    ExchangeOutcome, ExchangePhase, StreamSessionId, StreamState, StreamTarget, StreamTransition,
};

pub const RESPONSE_MODE_STREAMING: &str = "streaming";

pub type RespondingObserver = Arc<dyn Fn(bool) + Send + Sync>;

/// Told once per newly created conversation, e.g. to refresh a conversation list.
pub type ConversationFinalized = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub is_regenerate: bool,
    /// Answer the regenerated question hangs under; only used when `is_regenerate`.
    pub parent_answer: Option<MessageId>,
}

/// Replacement text and files when a question is edited before regenerating.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditedQuestion {
    pub content: String,
    pub files: Vec<FileRef>,
}

pub enum SendOutcome {
    /// The request went out; the caller spawns `worker` and pumps events.
    Issued {
        target: StreamTarget,
        worker: ChatWorker,
    },
    /// A response is already streaming.
    Busy,
    /// The compose control is disabled.
    Gated,
}

impl fmt::Debug for SendOutcome {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Issued { target, .. } => formatter
                .debug_struct("Issued")
                .field("target", target)
                .finish_non_exhaustive(),
            Self::Busy => formatter.write_str("Busy"),
            Self::Gated => formatter.write_str("Gated"),
        }
    }
}

pub enum SwitchOutcome {
    Switched,
    /// The sibling was a paused workflow and the transport re-subscribed to it.
    Resumed {
        target: StreamTarget,
        worker: ChatWorker,
    },
}

impl fmt::Debug for SwitchOutcome {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Switched => formatter.write_str("Switched"),
            Self::Resumed { target, .. } => formatter
                .debug_struct("Resumed")
                .field("target", target)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Clone)]
struct StopContext {
    request: Option<StopRequest>,
    cancel: Option<CancelToken>,
    collaborator: Option<Arc<dyn StreamingCollaborator>>,
    stop_requested: Arc<AtomicBool>,
}

impl Default for StopContext {
    fn default() -> Self {
        Self {
            request: None,
            cancel: None,
            collaborator: None,
            stop_requested: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Imperative stop entry point usable without borrowing the orchestrator.
///
/// Single-slot: the orchestrator overwrites the slot whenever the stop context changes,
/// so a handle obtained once always acts on the latest exchange.
#[derive(Clone)]
pub struct StopHandle {
    slot: Arc<ArcSwap<StopContext>>,
}

impl StopHandle {
    fn new() -> Self {
        Self {
            slot: Arc::new(ArcSwap::from_pointee(StopContext::default())),
        }
    }

    fn replace(&self, context: StopContext) {
        self.slot.store(Arc::new(context));
    }

    /// Cancels the active event stream and asks the server to stop. Returns `true` when a
    /// live stream was cancelled.
    pub fn stop(&self) -> bool {
        let context = self.slot.load_full();
        context.stop_requested.store(true, Ordering::SeqCst);
        let cancelled = context.cancel.as_ref().is_some_and(CancelToken::cancel);
        if let (Some(collaborator), Some(request)) = (&context.collaborator, &context.request) {
            tracing::info!(task_id = %request.task_id, "stop requested through handle");
            collaborator.stop(request.clone());
        }
        cancelled
    }

    pub fn task_id(&self) -> Option<String> {
        self.slot
            .load()
            .request
            .as_ref()
            .map(|request| request.task_id.clone())
    }

    pub fn has_active_stream(&self) -> bool {
        self.slot
            .load()
            .cancel
            .as_ref()
            .is_some_and(|cancel| !cancel.is_cancelled())
    }
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("StopHandle")
            .field("task_id", &self.task_id())
            .field("has_active_stream", &self.has_active_stream())
            .finish()
    }
}

struct ActiveExchange {
    target: StreamTarget,
    /// Placeholder question still waiting for the server-assigned id.
    question_id: Option<MessageId>,
    answer_id: MessageId,
    callbacks: SendCallbacks,
    stream: ChatEventStream,
}

/// Mediates user actions against one conversation tree and applies streamed events.
pub struct ChatOrchestrator {
    collaborator: Arc<dyn StreamingCollaborator>,
    suggestions: Option<Arc<dyn SuggestedQuestionsFetcher>>,
    forms: Option<Arc<dyn HumanInputFormService>>,
    on_conversation_finalized: Option<ConversationFinalized>,
    responding_observer: Option<RespondingObserver>,
    settings: Arc<ChatSettings>,
    thread: ConversationThread,
    conversation_id: Option<ConversationId>,
    input_schema: Vec<InputField>,
    all_inputs_hidden: bool,
    persisted_inputs: InputValues,
    draft_inputs: InputValues,
    guard: ResumptionGuard,
    stream_state: StreamState,
    next_session: u64,
    active: Option<ActiveExchange>,
    task_id: Option<String>,
    stop_requested: Arc<AtomicBool>,
    is_responding: bool,
    suggested_questions: Vec<String>,
    pending_suggestions: Option<(MessageId, SuggestedQuestionsHook)>,
    stop_handle: StopHandle,
}

impl ChatOrchestrator {
    pub fn new(collaborator: Arc<dyn StreamingCollaborator>, settings: Arc<ChatSettings>) -> Self {
        let orchestrator = Self {
            collaborator,
            suggestions: None,
            forms: None,
            on_conversation_finalized: None,
            responding_observer: None,
            thread: ConversationThread::new(settings.unresolved_branch),
            settings,
            conversation_id: None,
            input_schema: Vec::new(),
            all_inputs_hidden: false,
            persisted_inputs: InputValues::new(),
            draft_inputs: InputValues::new(),
            guard: ResumptionGuard::new(),
            stream_state: StreamState::Idle,
            next_session: 0,
            active: None,
            task_id: None,
            stop_requested: Arc::new(AtomicBool::new(false)),
            is_responding: false,
            suggested_questions: Vec::new(),
            pending_suggestions: None,
            stop_handle: StopHandle::new(),
        };
        orchestrator.refresh_stop_handle();
        orchestrator
    }

    pub fn with_suggested_questions(mut self, fetcher: Arc<dyn SuggestedQuestionsFetcher>) -> Self {
        self.suggestions = Some(fetcher);
        self.refresh_stop_handle();
        self
    }

    pub fn with_form_service(mut self, forms: Arc<dyn HumanInputFormService>) -> Self {
        self.forms = Some(forms);
        self.refresh_stop_handle();
        self
    }

    pub fn with_conversation_finalized(mut self, notifier: ConversationFinalized) -> Self {
        self.on_conversation_finalized = Some(notifier);
        self.refresh_stop_handle();
        self
    }

    pub fn with_responding_observer(mut self, observer: RespondingObserver) -> Self {
        self.responding_observer = Some(observer);
        self.refresh_stop_handle();
        self
    }

    pub fn with_input_form(mut self, schema: Vec<InputField>, all_inputs_hidden: bool) -> Self {
        self.set_input_form(schema, all_inputs_hidden);
        self
    }

    /// Swaps settings in place; the branch policy and stop context follow.
    pub fn reconfigure(&mut self, settings: Arc<ChatSettings>) {
        self.thread.set_policy(settings.unresolved_branch);
        self.settings = settings;
        self.refresh_stop_handle();
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    pub fn thread(&self) -> &ConversationThread {
        &self.thread
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.conversation_id.as_ref()
    }

    pub fn is_new_conversation(&self) -> bool {
        self.conversation_id.is_none()
    }

    pub fn is_responding(&self) -> bool {
        self.is_responding
    }

    pub fn is_paused(&self) -> bool {
        self.stream_state.is_paused()
    }

    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    pub fn stream_state(&self) -> &StreamState {
        &self.stream_state
    }

    pub fn suggested_questions(&self) -> &[String] {
        &self.suggested_questions
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop_handle.clone()
    }

    pub fn set_input_form(&mut self, schema: Vec<InputField>, all_inputs_hidden: bool) {
        self.input_schema = schema;
        self.all_inputs_hidden = all_inputs_hidden;
    }

    pub fn set_draft_input(&mut self, variable: impl Into<String>, value: Value) {
        self.draft_inputs.insert(variable.into(), value);
    }

    pub fn draft_inputs(&self) -> &InputValues {
        &self.draft_inputs
    }

    /// Inputs the next request carries: persisted for existing conversations, normalized
    /// drafts otherwise.
    pub fn resolved_inputs(&self) -> InputValues {
        if self.is_new_conversation() {
            normalize_inputs(&self.input_schema, &self.draft_inputs)
        } else {
            self.persisted_inputs.clone()
        }
    }

    fn current_inputs(&self) -> &InputValues {
        if self.is_new_conversation() {
            &self.draft_inputs
        } else {
            &self.persisted_inputs
        }
    }

    pub fn is_compose_disabled(&self) -> bool {
        let leaf_forms = self
            .thread
            .leaf()
            .map(|leaf| leaf.pending_forms)
            .unwrap_or_default();
        is_compose_disabled(
            &self.input_schema,
            self.current_inputs(),
            &leaf_forms,
            self.all_inputs_hidden,
        )
    }

    /// Messages to render: the active path with the opening statement applied and
    /// suppressed when a new conversation shows nothing else.
    pub fn chat_list(&self) -> Vec<Message> {
        let mut path = self.thread.project();
        if self.settings.has_opening_statement() {
            path = with_opening_statement(path, self.render_opening_statement());
        }
        visible_messages(&path, self.is_new_conversation()).to_vec()
    }

    /// Opening statement with `{{variable}}` placeholders filled from the current inputs.
    pub fn render_opening_statement(&self) -> String {
        self.render_template(&self.settings.opening_statement)
    }

    pub fn opening_suggested_questions(&self) -> Vec<String> {
        self.settings
            .suggested_questions
            .iter()
            .map(|question| self.render_template(question))
            .collect()
    }

    fn render_template(&self, template: &str) -> String {
        let inputs = self.current_inputs();
        fill_placeholders(template, |key| {
            inputs.get(key).map(|value| match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
        })
    }

    pub fn do_send(
        &mut self,
        message: impl Into<String>,
        files: Vec<FileRef>,
        options: SendOptions,
    ) -> ChatResult<SendOutcome> {
        if self.is_compose_disabled() {
            tracing::info!("send ignored because compose is disabled");
            return Ok(SendOutcome::Gated);
        }
        if self.is_responding || self.active.is_some() {
            tracing::info!("send ignored while a response is streaming");
            return Ok(SendOutcome::Busy);
        }

        let parent_message_id = self.resolve_parent(&options);
        let query = message.into();
        let payload_files = (self.settings.file_upload_enabled && !files.is_empty())
            .then(|| files.iter().map(PayloadFile::from).collect());

        let question_id = contract(
            "send-append-question",
            self.thread
                .append_question(parent_message_id.as_ref(), query.clone(), files),
        )?;
        let answer_id = contract(
            "send-append-answer",
            self.thread.append_answer(&question_id, ""),
        )?;

        let target = self.next_target();
        self.transition(StreamTransition::Open {
            target,
            phase: ExchangePhase::Generating,
        });
        let callbacks = self.callbacks();
        let request = ChatRequest {
            target,
            endpoint: self.settings.endpoint(),
            payload: ChatPayload {
                query,
                inputs: self.resolved_inputs(),
                conversation_id: self.conversation_id.clone(),
                parent_message_id: parent_message_id.clone(),
                files: payload_files,
                response_mode: RESPONSE_MODE_STREAMING.to_string(),
            },
            callbacks: callbacks.clone(),
        };

        tracing::info!(
            target = ?target,
            parent_message_id = ?parent_message_id,
            is_regenerate = options.is_regenerate,
            "issuing chat request"
        );

        let handle = match self.collaborator.send(request) {
            Ok(handle) => handle,
            Err(error) => {
                tracing::error!(target = ?target, error = %error, "chat request failed to start");
                let message = error.to_string();
                let status = MessageStatus::Error(message.clone());
                self.mutate(&answer_id, "send-failed", move |answer| {
                    answer.status = status;
                });
                self.transition(StreamTransition::Settle {
                    target,
                    outcome: ExchangeOutcome::Failed(message),
                });
                self.refresh_stop_handle();
                return Err(error);
            }
        };

        self.stop_requested.store(false, Ordering::SeqCst);
        self.suggested_questions.clear();
        self.pending_suggestions = None;
        self.active = Some(ActiveExchange {
            target,
            question_id: Some(question_id),
            answer_id,
            callbacks,
            stream: handle.stream,
        });
        self.set_responding(true);
        self.refresh_stop_handle();

        Ok(SendOutcome::Issued {
            target,
            worker: handle.worker,
        })
    }

    fn resolve_parent(&self, options: &SendOptions) -> Option<MessageId> {
        if options.is_regenerate {
            return options
                .parent_answer
                .as_ref()
                .and_then(|id| self.thread.get(id))
                .filter(|answer| answer.is_valid_generated_answer())
                .map(|answer| answer.id.clone());
        }
        last_valid_answer(&self.thread.project()).map(|answer| answer.id.clone())
    }

    /// Re-asks a question. `target` may be the question itself (when editing it) or one of
    /// its answers.
    pub fn do_regenerate(
        &mut self,
        target: &MessageId,
        edited: Option<EditedQuestion>,
    ) -> ChatResult<SendOutcome> {
        let message = self.thread.get(target).ok_or_else(|| ChatError::Tree {
            stage: "regenerate",
            source: TreeError::NotFound {
                stage: "regenerate",
                id: target.clone(),
            },
        })?;
        let question = match message.role {
            Role::Question => message,
            Role::Answer | Role::OpeningStatement => message
                .parent_id
                .as_ref()
                .and_then(|parent| self.thread.get(parent))
                .filter(|parent| parent.role == Role::Question)
                .ok_or_else(|| ChatError::Tree {
                    stage: "regenerate",
                    source: TreeError::RoleMismatch {
                        stage: "regenerate",
                        id: target.clone(),
                        expected: Role::Question,
                        actual: message.role,
                    },
                })?,
        };

        let parent_answer = question.parent_id.clone();
        let EditedQuestion { content, files } = edited.unwrap_or_else(|| EditedQuestion {
            content: question.content.clone(),
            files: question.files.clone(),
        });

        self.do_send(
            content,
            files,
            SendOptions {
                is_regenerate: true,
                parent_answer,
            },
        )
    }

    pub fn do_switch_sibling(&mut self, sibling_id: &MessageId) -> ChatResult<SwitchOutcome> {
        self.thread
            .activate_path(sibling_id)
            .context(TreeSnafu {
                stage: "switch-sibling",
            })?;

        let resume = self
            .thread
            .get(sibling_id)
            .filter(|message| message.is_paused_workflow() && self.active.is_none())
            .and_then(|message| {
                message
                    .workflow_run_id
                    .clone()
                    .map(|workflow_run_id| ResumeTarget {
                        message_id: message.id.clone(),
                        workflow_run_id,
                    })
            });

        let target = self.next_target();
        let callbacks = self.callbacks();
        let request = SwitchSiblingRequest {
            target,
            sibling_id: sibling_id.clone(),
            callbacks: callbacks.clone(),
            resume: resume.clone(),
        };
        tracing::debug!(%sibling_id, resume = resume.is_some(), "switching sibling");

        let handle = self.collaborator.switch_sibling(request)?;
        let (Some(handle), Some(resume)) = (handle, resume) else {
            return Ok(SwitchOutcome::Switched);
        };

        tracing::info!(
            message_id = %resume.message_id,
            workflow_run_id = %resume.workflow_run_id,
            "re-subscribed to paused workflow"
        );
        self.transition(StreamTransition::Open {
            target,
            phase: ExchangePhase::AwaitingInput,
        });
        self.active = Some(ActiveExchange {
            target,
            question_id: None,
            answer_id: resume.message_id,
            callbacks,
            stream: handle.stream,
        });
        self.refresh_stop_handle();

        Ok(SwitchOutcome::Resumed {
            target,
            worker: handle.worker,
        })
    }

    /// Stops the current response. Content already streamed is kept.
    pub fn do_stop(&mut self) {
        let stop_request = self.stop_request();
        self.abandon_exchange();

        if let Some(request) = stop_request {
            tracing::info!(task_id = %request.task_id, "stopping server-side generation");
            self.collaborator.stop(request);
        }
        self.refresh_stop_handle();
    }

    fn abandon_exchange(&mut self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.set_responding(false);
        self.pending_suggestions = None;

        if let Some(mut exchange) = self.active.take() {
            exchange.stream.cancel();
            self.transition(StreamTransition::Settle {
                target: exchange.target,
                outcome: ExchangeOutcome::Cancelled,
            });
            self.mutate(&exchange.answer_id, "abandon-exchange", |answer| {
                if matches!(answer.status, MessageStatus::Pending | MessageStatus::Streaming) {
                    answer.status = MessageStatus::Cancelled;
                }
            });
        }
    }

    /// Starts a fresh conversation: stops, then drops the tree and every branch choice.
    pub fn restart(&mut self) {
        self.do_stop();
        self.conversation_id = None;
        self.task_id = None;
        self.persisted_inputs.clear();
        self.thread.reset();
        self.guard.hydrated();
        self.suggested_questions.clear();
        self.transition(StreamTransition::Reset);
        self.refresh_stop_handle();
    }

    /// Loads a stored conversation, then resumes its first paused workflow, if any.
    pub fn hydrate(
        &mut self,
        tree: ConversationTree,
        conversation_id: Option<ConversationId>,
        inputs: InputValues,
    ) -> ChatResult<Option<SwitchOutcome>> {
        if self.active.is_some() {
            self.do_stop();
        }
        self.thread = ConversationThread::from_tree(tree, self.settings.unresolved_branch);
        self.conversation_id = conversation_id.filter(|id| !id.is_empty());
        self.persisted_inputs = inputs;
        self.task_id = None;
        self.stop_requested.store(false, Ordering::SeqCst);
        self.suggested_questions.clear();
        self.pending_suggestions = None;
        self.transition(StreamTransition::Reset);
        self.guard.hydrated();
        self.refresh_stop_handle();

        tracing::info!(
            conversation_id = ?self.conversation_id,
            node_count = self.thread.tree().len(),
            epoch = self.guard.epoch(),
            "hydrated conversation"
        );
        self.resume_paused_workflow()
    }

    /// Runs the resumption scan at most once per hydration.
    pub fn resume_paused_workflow(&mut self) -> ChatResult<Option<SwitchOutcome>> {
        if !self.guard.begin() {
            return Ok(None);
        }
        let Some(paused_id) = find_paused_workflow_node(self.thread.tree()) else {
            return Ok(None);
        };
        tracing::info!(message_id = %paused_id, "found paused workflow node");
        self.do_switch_sibling(&paused_id).map(Some)
    }

    pub async fn submit_human_input_form(
        &self,
        form_token: &str,
        submission: HumanInputSubmission,
    ) -> ChatResult<()> {
        let forms = self.forms.as_ref().context(FormServiceMissingSnafu {
            stage: "submit-human-input-form",
        })?;
        forms
            .submit(self.settings.app_source, form_token, submission)
            .await
    }

    /// Writes an edited annotation back onto an exchange. The answer's logged annotation
    /// reply is dropped; the annotation id stays.
    pub fn annotation_edited(
        &mut self,
        answer_id: &MessageId,
        query: impl Into<String>,
        answer: impl Into<String>,
    ) -> ChatResult<()> {
        let stage = "annotation-edited";
        let question_id = self.question_of(answer_id, stage)?;
        let (query, reply) = (query.into(), answer.into());
        self.thread
            .update(&question_id, move |question| question.content = query)
            .context(TreeSnafu { stage })?;
        self.thread
            .update(answer_id, move |message| {
                message.content = reply;
                if let Some(annotation) = message.annotation.as_mut() {
                    annotation.logged_content = None;
                }
            })
            .context(TreeSnafu { stage })
    }

    /// Attaches a new annotation to an exchange. The answer text is kept and the curated
    /// reply is logged on the annotation.
    pub fn annotation_added(
        &mut self,
        answer_id: &MessageId,
        annotation_id: impl Into<String>,
        author_name: impl Into<String>,
        query: impl Into<String>,
        answer: impl Into<String>,
    ) -> ChatResult<()> {
        let stage = "annotation-added";
        let question_id = self.question_of(answer_id, stage)?;
        let query = query.into();
        let annotation = Annotation {
            id: annotation_id.into(),
            author_name: author_name.into(),
            logged_content: Some(answer.into()),
        };
        self.thread
            .update(&question_id, move |question| question.content = query)
            .context(TreeSnafu { stage })?;
        self.thread
            .update(answer_id, move |message| message.annotation = Some(annotation))
            .context(TreeSnafu { stage })
    }

    pub fn annotation_removed(&mut self, answer_id: &MessageId) -> ChatResult<()> {
        self.thread
            .update(answer_id, |message| message.annotation = None)
            .context(TreeSnafu {
                stage: "annotation-removed",
            })
    }

    fn question_of(&self, answer_id: &MessageId, stage: &'static str) -> ChatResult<MessageId> {
        let answer = self.thread.get(answer_id).ok_or_else(|| ChatError::Tree {
            stage,
            source: TreeError::NotFound {
                stage,
                id: answer_id.clone(),
            },
        })?;
        if answer.role != Role::Answer {
            return Err(ChatError::Tree {
                stage,
                source: TreeError::RoleMismatch {
                    stage,
                    id: answer_id.clone(),
                    expected: Role::Answer,
                    actual: answer.role,
                },
            });
        }
        // Answers are only ever inserted under a question.
        answer.parent_id.clone().ok_or_else(|| ChatError::Tree {
            stage,
            source: TreeError::NotFound {
                stage,
                id: answer_id.clone(),
            },
        })
    }

    /// Applies one streamed event. Returns `false` when the event was stale and dropped.
    pub fn apply_stream_event(&mut self, event: ChatStreamEvent) -> bool {
        if !self.stream_state.accepts_stream_event(event.target) {
            tracing::debug!(target = ?event.target, "dropping stale stream event");
            return false;
        }
        let Some(answer_id) = self
            .active
            .as_ref()
            .filter(|exchange| exchange.target == event.target)
            .map(|exchange| exchange.answer_id.clone())
        else {
            return false;
        };

        let target = event.target;
        match event.payload {
            ChatEventPayload::Chunk {
                text,
                message_id,
                conversation_id,
                task_id,
            } => {
                let answer_id = match message_id.filter(|id| !id.is_empty()) {
                    Some(server_id) => self.adopt_server_id(server_id),
                    None => answer_id,
                };
                self.mutate(&answer_id, "apply-chunk", move |answer| {
                    answer.apply_content(ContentUpdate::Append(text));
                    if answer.status == MessageStatus::Pending {
                        answer.status = MessageStatus::Streaming;
                    }
                });
                if self.conversation_id.is_none()
                    && let Some(conversation_id) = conversation_id.filter(|id| !id.is_empty())
                {
                    self.conversation_id = Some(conversation_id);
                }
                self.capture_task_id(task_id);
            }
            ChatEventPayload::Replace(content) => {
                self.mutate(&answer_id, "apply-replace", move |answer| {
                    answer.apply_content(ContentUpdate::Replace(content));
                });
            }
            ChatEventPayload::MessageEnd(MessageEnd {
                annotation,
                citations,
                files,
            }) => {
                self.mutate(&answer_id, "apply-message-end", move |answer| {
                    answer.record_message_end(annotation, citations, files);
                });
            }
            ChatEventPayload::WorkflowStarted {
                workflow_run_id,
                task_id,
            } => {
                self.transition(StreamTransition::Enter {
                    target,
                    phase: ExchangePhase::Generating,
                });
                self.stop_requested.store(false, Ordering::SeqCst);
                self.mutate(&answer_id, "apply-workflow-started", move |answer| {
                    answer.start_workflow(workflow_run_id);
                    answer.status = MessageStatus::Streaming;
                });
                self.set_responding(true);
                self.capture_task_id(task_id);
            }
            ChatEventPayload::WorkflowFinished { status } => {
                self.mutate(&answer_id, "apply-workflow-finished", move |answer| {
                    answer.set_workflow_status(status);
                });
            }
            ChatEventPayload::NodeStarted(trace) => {
                self.trace(&answer_id, "apply-node-started", |process| {
                    process.node_started(trace)
                });
            }
            ChatEventPayload::NodeFinished(trace) => {
                self.trace(&answer_id, "apply-node-finished", |process| {
                    process.node_finished(trace)
                });
            }
            ChatEventPayload::IterationStarted(trace) | ChatEventPayload::LoopStarted(trace) => {
                self.trace(&answer_id, "apply-container-started", |process| {
                    process.container_started(trace)
                });
            }
            ChatEventPayload::IterationFinished(trace) | ChatEventPayload::LoopFinished(trace) => {
                self.trace(&answer_id, "apply-container-finished", |process| {
                    process.container_finished(trace)
                });
            }
            ChatEventPayload::HumanInputRequired(form) => {
                self.mutate(&answer_id, "apply-human-input-required", move |answer| {
                    answer.upsert_pending_form(form);
                });
            }
            ChatEventPayload::HumanInputFilled(filled) => {
                self.mutate(&answer_id, "apply-human-input-filled", move |answer| {
                    answer.mark_form_filled(filled);
                });
            }
            ChatEventPayload::FormTimeout {
                node_id,
                expiration_time,
            } => {
                self.mutate(&answer_id, "apply-form-timeout", move |answer| {
                    if let Some(form) = answer
                        .pending_forms
                        .iter_mut()
                        .find(|form| form.node_id == node_id)
                    {
                        form.expiration_time = Some(expiration_time);
                    }
                });
            }
            ChatEventPayload::WorkflowPaused { workflow_run_id } => {
                self.transition(StreamTransition::Enter {
                    target,
                    phase: ExchangePhase::AwaitingInput,
                });
                self.mutate(&answer_id, "apply-workflow-paused", move |answer| {
                    answer.workflow_run_id = Some(workflow_run_id);
                    answer.set_workflow_status(WorkflowStatus::Paused);
                    answer.status = MessageStatus::Paused;
                });
            }
            ChatEventPayload::Done => self.finish_exchange(target),
            ChatEventPayload::Error(message) => self.fail_exchange(target, message),
        }
        // Every event may change the task id, the pause phase or the live exchange.
        self.refresh_stop_handle();
        true
    }

    /// Receives and applies events until the active stream ends, then loads suggested
    /// questions if the completed exchange asked for them.
    pub async fn pump(&mut self) {
        loop {
            let next = match self.active.as_mut() {
                Some(exchange) => exchange.stream.recv().await,
                None => break,
            };
            match next {
                Some(event) => {
                    self.apply_stream_event(event);
                }
                None => {
                    self.close_exchange();
                    break;
                }
            }
        }
        self.load_suggested_questions().await;
    }

    pub async fn load_suggested_questions(&mut self) {
        let Some((message_id, hook)) = self.pending_suggestions.take() else {
            return;
        };
        if self.stop_requested.load(Ordering::SeqCst) {
            return;
        }
        match hook
            .fetcher
            .fetch(&message_id, hook.app_source, &hook.app_id)
            .await
        {
            Ok(questions) => self.suggested_questions = questions,
            Err(error) => {
                tracing::warn!(%message_id, error = %error, "failed to load suggested questions");
                self.suggested_questions.clear();
            }
        }
    }

    /// Swaps placeholder ids for the server-assigned answer id and returns the live id.
    fn adopt_server_id(&mut self, server_id: MessageId) -> MessageId {
        let Some(exchange) = self.active.as_mut() else {
            return server_id;
        };
        if exchange.answer_id == server_id || !exchange.answer_id.is_answer_placeholder() {
            return exchange.answer_id.clone();
        }

        let renamed = contract(
            "rename-answer",
            self.thread.rename(&exchange.answer_id, server_id.clone()),
        );
        if renamed.is_err() {
            return exchange.answer_id.clone();
        }
        exchange.answer_id = server_id.clone();

        if let Some(question_id) = exchange.question_id.take() {
            let _ = contract(
                "rename-question",
                self.thread
                    .rename(&question_id, MessageId::question_for_answer(&server_id)),
            );
        }
        tracing::debug!(message_id = %server_id, "adopted server message id");
        server_id
    }

    fn finish_exchange(&mut self, target: StreamTarget) {
        let Some(exchange) = self.active.take() else {
            return;
        };
        let outcome = if self.stream_state.is_paused() {
            ExchangeOutcome::Suspended
        } else {
            ExchangeOutcome::Completed
        };
        self.transition(StreamTransition::Settle { target, outcome });
        self.mutate(&exchange.answer_id, "finish-exchange", |answer| {
            if answer.is_paused_workflow() {
                answer.status = MessageStatus::Paused;
            } else if matches!(answer.status, MessageStatus::Pending | MessageStatus::Streaming) {
                answer.status = MessageStatus::Done;
            }
        });
        self.set_responding(false);

        if let Some(hook) = &exchange.callbacks.on_conversation_complete {
            match &self.conversation_id {
                Some(conversation_id) => hook(conversation_id),
                None => tracing::warn!(
                    target = ?target,
                    "new conversation completed without a conversation id"
                ),
            }
        }

        if self.settings.suggested_questions_after_answer
            && !self.stop_requested.load(Ordering::SeqCst)
            && let Some(hook) = exchange.callbacks.on_get_suggested_questions.clone()
        {
            self.pending_suggestions = Some((exchange.answer_id.clone(), hook));
        }
        self.refresh_stop_handle();
    }

    fn fail_exchange(&mut self, target: StreamTarget, message: String) {
        let Some(exchange) = self.active.take() else {
            return;
        };
        tracing::warn!(target = ?target, error = %message, "stream reported an error");
        let status = MessageStatus::Error(message.clone());
        self.mutate(&exchange.answer_id, "fail-exchange", move |answer| {
            answer.status = status;
        });
        self.transition(StreamTransition::Settle {
            target,
            outcome: ExchangeOutcome::Failed(message),
        });
        self.set_responding(false);
        self.refresh_stop_handle();
    }

    // The channel closed without a terminal event: a stop through the handle, a paused
    // workflow the transport stopped following, or a transport that died.
    fn close_exchange(&mut self) {
        let Some(exchange) = self.active.as_ref() else {
            return;
        };
        let target = exchange.target;
        if self.stop_requested.load(Ordering::SeqCst) {
            // The handle already asked the server to stop.
            self.abandon_exchange();
            self.refresh_stop_handle();
        } else if self.stream_state.is_paused() {
            self.active = None;
            self.transition(StreamTransition::Settle {
                target,
                outcome: ExchangeOutcome::Suspended,
            });
            self.set_responding(false);
            self.refresh_stop_handle();
        } else {
            self.fail_exchange(target, "stream closed before completion".to_string());
        }
    }

    fn mutate(&mut self, id: &MessageId, stage: &'static str, mutate: impl FnOnce(&mut Message)) {
        let _ = contract(stage, self.thread.update(id, mutate));
    }

    /// Runs `edit` on the answer's workflow process; answers without one are left alone.
    fn trace(
        &mut self,
        id: &MessageId,
        stage: &'static str,
        edit: impl FnOnce(&mut WorkflowProcess),
    ) {
        self.mutate(id, stage, |answer| {
            if let Some(process) = answer.workflow_process.as_mut() {
                edit(process);
            }
        });
    }

    fn capture_task_id(&mut self, task_id: Option<String>) {
        if let Some(task_id) = task_id.filter(|task_id| !task_id.is_empty()) {
            self.task_id = Some(task_id);
        }
    }

    fn callbacks(&self) -> SendCallbacks {
        SendCallbacks {
            on_get_suggested_questions: self.suggestions.clone().map(|fetcher| {
                SuggestedQuestionsHook {
                    fetcher,
                    app_source: self.settings.app_source,
                    app_id: self.settings.app_id.clone(),
                }
            }),
            on_conversation_complete: self
                .is_new_conversation()
                .then(|| self.conversation_complete_hook()),
        }
    }

    fn conversation_complete_hook(&self) -> ConversationCompleteHook {
        let notifier = self.on_conversation_finalized.clone();
        Arc::new(move |conversation_id: &ConversationId| {
            tracing::info!(%conversation_id, "new conversation finalized");
            if let Some(notifier) = &notifier {
                notifier();
            }
        })
    }

    fn stop_request(&self) -> Option<StopRequest> {
        if self.stream_state.is_paused() {
            return None;
        }
        let task_id = self.task_id.clone()?;
        Some(StopRequest {
            task_id,
            app_source: self.settings.app_source,
            app_id: self.settings.app_id.clone(),
            session_token: self.settings.session_token.clone(),
        })
    }

    fn refresh_stop_handle(&self) {
        self.stop_handle.replace(StopContext {
            request: self.stop_request(),
            cancel: self
                .active
                .as_ref()
                .map(|exchange| exchange.stream.cancel_token()),
            collaborator: Some(self.collaborator.clone()),
            stop_requested: self.stop_requested.clone(),
        });
    }

    fn set_responding(&mut self, responding: bool) {
        if self.is_responding == responding {
            return;
        }
        self.is_responding = responding;
        if let Some(observer) = &self.responding_observer {
            observer(responding);
        }
    }

    fn next_target(&mut self) -> StreamTarget {
        self.next_session += 1;
        StreamTarget::new(self.guard.epoch(), StreamSessionId::new(self.next_session))
    }

    fn transition(&mut self, transition: StreamTransition) {
        match self.stream_state.apply(transition) {
            Ok(next) => self.stream_state = next,
            Err(rejection) => tracing::warn!(?rejection, "stream transition rejected"),
        }
    }
}

/// Tree operations the orchestrator drives itself must never fail; a failure is a bug.
fn contract<T>(stage: &'static str, result: TreeResult<T>) -> ChatResult<T> {
    result.map_err(|source| {
        tracing::error!(stage, error = %source, "conversation tree contract violated");
        debug_assert!(false, "conversation tree contract violated on `{stage}`: {source}");
        ChatError::Tree { stage, source }
    })
}
