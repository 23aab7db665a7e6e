pub mod collaborator;
pub mod error;
pub mod events;
pub mod gating;
pub mod history;
pub mod inputs;
pub mod orchestrator;
pub mod settings;
pub mod stream;

pub use collaborator::{
    BoxFuture, ChatPayload, ChatRequest, ConversationCompleteHook, HumanInputFormService,
    HumanInputSubmission, PayloadFile, ResumeTarget, SendCallbacks, StopRequest,
    StreamingCollaborator, SuggestedQuestionsFetcher, SuggestedQuestionsHook,
    SwitchSiblingRequest,
};
pub use error::{ChatError, ChatResult, SettingsError};
pub use events::{
    CancelToken, ChatEventPayload, ChatEventStream, ChatStreamEvent, ChatStreamHandle,
    ChatWorker, MessageEnd, make_event_stream,
};
pub use gating::is_compose_disabled;
pub use history::{HistoryFormat, decode_tree, read_tree};
pub use inputs::{InputField, InputKind, InputValues, normalize_inputs};
pub use orchestrator::{
    ChatOrchestrator, ConversationFinalized, EditedQuestion, RespondingObserver, SendOptions,
    SendOutcome, StopHandle, SwitchOutcome,
};
pub use settings::{AppSourceType, ChatSettings, SettingsStore};
pub use stream::{
    ExchangeOutcome, ExchangePhase, StreamSessionId, StreamState, StreamTarget, StreamTransition,
};
