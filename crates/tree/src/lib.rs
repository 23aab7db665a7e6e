pub mod error;
pub mod hydrate;
pub mod ids;
pub mod message;
pub mod projector;
pub mod scanner;
pub mod thread;
pub mod tree;
pub mod workflow;

pub use error::{TreeError, TreeResult};
pub use hydrate::{HistoryMessage, PersistedNode};
pub use ids::{
    ANSWER_PLACEHOLDER_PREFIX, ConversationId, MessageId, OPENING_STATEMENT_ID, QUESTION_PREFIX,
    WorkflowRunId,
};
pub use message::{
    ContentUpdate, FileRef, FilledHumanInputForm, HumanInputAction, HumanInputField,
    HumanInputForm, Message, MessageStatus, Role, SiblingPosition, TransferMethod,
};
pub use projector::{
    UnresolvedBranch, fill_placeholders, last_valid_answer, project, suppress_opening_statement,
    visible_messages, with_opening_statement,
};
pub use scanner::{ResumptionGuard, find_paused_workflow_node};
pub use thread::ConversationThread;
pub use tree::{ActiveBranches, ConversationTree};
pub use workflow::{Annotation, Citation, NodeStatus, NodeTrace, WorkflowProcess, WorkflowStatus};
