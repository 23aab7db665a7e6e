use std::sync::{Arc, Mutex};

use arbor_tree::{
    Annotation, Citation, ConversationId, FileRef, FilledHumanInputForm, HumanInputForm,
    MessageId, NodeTrace, WorkflowRunId, WorkflowStatus,
};
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

use super::stream::StreamTarget;

/// Metadata closing an answer's message stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageEnd {
    pub annotation: Option<Annotation>,
    pub citations: Vec<Citation>,
    pub files: Vec<FileRef>,
}

/// Transport-agnostic stream payload mapped into conversation language.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEventPayload {
    Chunk {
        text: String,
        message_id: Option<MessageId>,
        conversation_id: Option<ConversationId>,
        task_id: Option<String>,
    },
    /// Replaces the whole answer content, e.g. after moderation.
    Replace(String),
    MessageEnd(MessageEnd),
    WorkflowStarted {
        workflow_run_id: WorkflowRunId,
        task_id: Option<String>,
    },
    WorkflowFinished {
        status: WorkflowStatus,
    },
    NodeStarted(NodeTrace),
    NodeFinished(NodeTrace),
    IterationStarted(NodeTrace),
    IterationFinished(NodeTrace),
    LoopStarted(NodeTrace),
    LoopFinished(NodeTrace),
    HumanInputRequired(HumanInputForm),
    HumanInputFilled(FilledHumanInputForm),
    FormTimeout {
        node_id: String,
        expiration_time: u64,
    },
    WorkflowPaused {
        workflow_run_id: WorkflowRunId,
    },
    Done,
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatStreamEvent {
    pub target: StreamTarget,
    pub payload: ChatEventPayload,
}

impl ChatStreamEvent {
    pub fn new(target: StreamTarget, payload: ChatEventPayload) -> Self {
        Self { target, payload }
    }
}

/// Shared one-shot cancellation signal for a stream worker.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl CancelToken {
    fn new(sender: oneshot::Sender<()>) -> Self {
        Self {
            sender: Arc::new(Mutex::new(Some(sender))),
        }
    }

    /// Fires the signal. Returns `false` when it already fired or the worker is gone.
    pub fn cancel(&self) -> bool {
        let Ok(mut slot) = self.sender.lock() else {
            return false;
        };
        slot.take()
            .map(|sender| sender.send(()).is_ok())
            .unwrap_or(false)
    }

    pub fn is_cancelled(&self) -> bool {
        self.sender
            .lock()
            .map(|slot| slot.is_none())
            .unwrap_or(true)
    }
}

pub struct ChatEventStream {
    target: StreamTarget,
    events: mpsc::UnboundedReceiver<ChatStreamEvent>,
    cancel: CancelToken,
}

impl ChatEventStream {
    fn new(
        target: StreamTarget,
        events: mpsc::UnboundedReceiver<ChatStreamEvent>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            target,
            events,
            cancel,
        }
    }

    pub async fn recv(&mut self) -> Option<ChatStreamEvent> {
        self.events.recv().await
    }

    pub fn cancel(&mut self) -> bool {
        self.cancel.cancel()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

impl Drop for ChatEventStream {
    fn drop(&mut self) {
        if self.cancel.cancel() {
            tracing::debug!(target = ?self.target, "event stream dropped, worker cancelled");
        }
    }
}

pub type ChatWorker = BoxFuture<'static, ()>;

/// Returned by the collaborator: the caller owns the receiving side and spawns `worker`.
pub struct ChatStreamHandle {
    pub stream: ChatEventStream,
    pub worker: ChatWorker,
}

/// Builds the channel pair a transport needs to stream events for `target`.
pub fn make_event_stream(
    target: StreamTarget,
) -> (
    mpsc::UnboundedSender<ChatStreamEvent>,
    ChatEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        ChatEventStream::new(target, event_rx, CancelToken::new(cancel_tx)),
        cancel_rx,
    )
}
