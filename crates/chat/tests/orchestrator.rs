use std::sync::{Arc, Mutex};

use arbor_chat::{
    AppSourceType, BoxFuture, ChatError, ChatEventPayload, ChatOrchestrator, ChatRequest,
    ChatResult, ChatSettings, ChatStreamEvent, ChatStreamHandle, HistoryFormat,
    HumanInputFormService, HumanInputSubmission, InputField, InputKind, InputValues, SendOptions,
    SendOutcome, StopRequest, StreamTarget, StreamingCollaborator, SuggestedQuestionsFetcher,
    SwitchOutcome, SwitchSiblingRequest, decode_tree, make_event_stream,
};
use arbor_tree::{ConversationId, FileRef, MessageId, MessageStatus, Role};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};

/// Collaborator that records every call. Events queued with `script` are replayed by the
/// next stream's worker, which then closes the stream; unscripted streams stay open until
/// `close_streams`.
#[derive(Default)]
struct Recorder {
    requests: Mutex<Vec<ChatRequest>>,
    switches: Mutex<Vec<SwitchSiblingRequest>>,
    stops: Mutex<Vec<StopRequest>>,
    script: Mutex<Vec<ChatEventPayload>>,
    open_senders: Mutex<Vec<mpsc::UnboundedSender<ChatStreamEvent>>>,
    cancel_receivers: Mutex<Vec<oneshot::Receiver<()>>>,
}

impl Recorder {
    fn script(&self, payloads: Vec<ChatEventPayload>) {
        *self.script.lock().unwrap() = payloads;
    }

    fn close_streams(&self) {
        self.open_senders.lock().unwrap().clear();
    }

    fn last_request(&self) -> ChatRequest {
        self.requests.lock().unwrap().last().cloned().unwrap()
    }

    fn handle(&self, target: StreamTarget) -> ChatStreamHandle {
        let (event_tx, stream, cancel_rx) = make_event_stream(target);
        self.cancel_receivers.lock().unwrap().push(cancel_rx);
        let script = std::mem::take(&mut *self.script.lock().unwrap());
        if script.is_empty() {
            self.open_senders.lock().unwrap().push(event_tx);
            return ChatStreamHandle {
                stream,
                worker: Box::pin(async {}),
            };
        }
        ChatStreamHandle {
            stream,
            worker: Box::pin(async move {
                for payload in script {
                    if event_tx.send(ChatStreamEvent::new(target, payload)).is_err() {
                        break;
                    }
                }
            }),
        }
    }
}

impl StreamingCollaborator for Recorder {
    fn send(&self, request: ChatRequest) -> ChatResult<ChatStreamHandle> {
        let handle = self.handle(request.target);
        self.requests.lock().unwrap().push(request);
        Ok(handle)
    }

    fn switch_sibling(
        &self,
        request: SwitchSiblingRequest,
    ) -> ChatResult<Option<ChatStreamHandle>> {
        let handle = request.resume.as_ref().map(|_| self.handle(request.target));
        self.switches.lock().unwrap().push(request);
        Ok(handle)
    }

    fn stop(&self, request: StopRequest) {
        self.stops.lock().unwrap().push(request);
    }
}

#[derive(Default)]
struct Suggestions {
    calls: Mutex<Vec<(MessageId, AppSourceType, String)>>,
}

impl SuggestedQuestionsFetcher for Suggestions {
    fn fetch<'a>(
        &'a self,
        response_message_id: &'a MessageId,
        app_source: AppSourceType,
        app_id: &'a str,
    ) -> BoxFuture<'a, ChatResult<Vec<String>>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push((
                response_message_id.clone(),
                app_source,
                app_id.to_string(),
            ));
            Ok(vec!["What next?".to_string(), "Why?".to_string()])
        })
    }
}

struct Offline;

impl StreamingCollaborator for Offline {
    fn send(&self, _request: ChatRequest) -> ChatResult<ChatStreamHandle> {
        Err(ChatError::Transport {
            stage: "connect",
            message: "network unreachable".to_string(),
        })
    }

    fn switch_sibling(
        &self,
        _request: SwitchSiblingRequest,
    ) -> ChatResult<Option<ChatStreamHandle>> {
        Ok(None)
    }

    fn stop(&self, _request: StopRequest) {}
}

struct BrokenSuggestions;

impl SuggestedQuestionsFetcher for BrokenSuggestions {
    fn fetch<'a>(
        &'a self,
        response_message_id: &'a MessageId,
        _app_source: AppSourceType,
        _app_id: &'a str,
    ) -> BoxFuture<'a, ChatResult<Vec<String>>> {
        Box::pin(async move {
            Err(ChatError::SuggestedQuestions {
                stage: "fetch-suggested-questions",
                message_id: response_message_id.to_string(),
                message: "upstream returned 500".to_string(),
            })
        })
    }
}

#[derive(Default)]
struct Forms {
    submitted: Mutex<Vec<(String, HumanInputSubmission)>>,
}

impl HumanInputFormService for Forms {
    fn submit<'a>(
        &'a self,
        _app_source: AppSourceType,
        form_token: &'a str,
        submission: HumanInputSubmission,
    ) -> BoxFuture<'a, ChatResult<()>> {
        Box::pin(async move {
            self.submitted
                .lock()
                .unwrap()
                .push((form_token.to_string(), submission));
            Ok(())
        })
    }
}

fn settings() -> ChatSettings {
    ChatSettings {
        app_id: "app-1".to_string(),
        ..ChatSettings::default()
    }
}

fn setup_with(settings: ChatSettings) -> (Arc<Recorder>, ChatOrchestrator) {
    let recorder = Arc::new(Recorder::default());
    let orchestrator = ChatOrchestrator::new(recorder.clone(), Arc::new(settings));
    (recorder, orchestrator)
}

fn setup() -> (Arc<Recorder>, ChatOrchestrator) {
    setup_with(settings())
}

fn values(raw: Value) -> InputValues {
    match raw {
        Value::Object(map) => map,
        _ => panic!("expected an object"),
    }
}

fn chunk(text: &str, message_id: &str) -> ChatEventPayload {
    ChatEventPayload::Chunk {
        text: text.to_string(),
        message_id: Some(MessageId::new(message_id)),
        conversation_id: Some(ConversationId::new("c1")),
        task_id: Some("task-1".to_string()),
    }
}

fn send(orchestrator: &mut ChatOrchestrator, query: &str) -> StreamTarget {
    match orchestrator
        .do_send(query, Vec::new(), SendOptions::default())
        .unwrap()
    {
        SendOutcome::Issued { target, .. } => target,
        other => panic!("expected an issued request, got {other:?}"),
    }
}

/// Sends `query` and completes it synchronously with a single chunk from `answer_id`.
fn exchange(orchestrator: &mut ChatOrchestrator, query: &str, answer_id: &str) {
    let target = send(orchestrator, query);
    assert!(orchestrator.apply_stream_event(ChatStreamEvent::new(target, chunk("ok", answer_id))));
    assert!(orchestrator.apply_stream_event(ChatStreamEvent::new(target, ChatEventPayload::Done)));
}

fn paused_history() -> &'static str {
    r#"[{
        "id": "1",
        "isAnswer": true,
        "content": "Waiting for approval",
        "workflowRunId": "w1",
        "pendingHumanInputForms": [{"node_id": "n1", "form_token": "token-1"}]
    }]"#
}

#[test]
fn first_send_has_no_parent_and_follow_ups_chain() {
    let (recorder, mut orchestrator) = setup();

    exchange(&mut orchestrator, "first", "a1");
    assert_eq!(recorder.last_request().payload.parent_message_id, None);

    exchange(&mut orchestrator, "second", "a2");
    assert_eq!(
        recorder.last_request().payload.parent_message_id,
        Some(MessageId::new("a1"))
    );
}

#[test]
fn send_while_streaming_is_busy() {
    let (recorder, mut orchestrator) = setup();
    send(&mut orchestrator, "first");

    let outcome = orchestrator
        .do_send("second", Vec::new(), SendOptions::default())
        .unwrap();
    assert!(matches!(outcome, SendOutcome::Busy));
    assert_eq!(recorder.requests.lock().unwrap().len(), 1);
}

#[test]
fn required_input_gates_send_until_filled() {
    let (recorder, mut orchestrator) = setup();
    orchestrator.set_input_form(
        vec![InputField::new("req", InputKind::TextInput).required()],
        false,
    );

    let outcome = orchestrator
        .do_send("Hello", Vec::new(), SendOptions::default())
        .unwrap();
    assert!(matches!(outcome, SendOutcome::Gated));
    assert!(recorder.requests.lock().unwrap().is_empty());

    orchestrator.set_draft_input("req", json!("filled"));
    send(&mut orchestrator, "Hello");

    let request = recorder.last_request();
    assert_eq!(request.payload.query, "Hello");
    assert_eq!(request.payload.parent_message_id, None);
    assert_eq!(request.payload.inputs, values(json!({"req": "filled"})));
    assert!(request.callbacks.on_conversation_complete.is_some());
}

#[test]
fn hidden_inputs_never_gate() {
    let (_, mut orchestrator) = setup();
    orchestrator.set_input_form(
        vec![InputField::new("req", InputKind::TextInput).required()],
        true,
    );
    assert!(!orchestrator.is_compose_disabled());
}

#[test]
fn regenerating_the_first_answer_starts_a_root_variant() {
    let (recorder, mut orchestrator) = setup();
    exchange(&mut orchestrator, "Q1", "a1");

    orchestrator
        .do_regenerate(&MessageId::new("a1"), None)
        .unwrap();

    let request = recorder.last_request();
    assert_eq!(request.payload.query, "Q1");
    assert_eq!(request.payload.parent_message_id, None);
    assert_eq!(orchestrator.thread().tree().roots().len(), 2);

    let path = orchestrator.thread().project();
    assert_eq!(path[0].sibling_position.count, 2);
    assert_eq!(path[0].sibling_position.index, 1);
}

#[test]
fn regenerating_a_follow_up_keeps_its_parent_answer() {
    let (recorder, mut orchestrator) = setup();
    exchange(&mut orchestrator, "Q0", "a0");
    exchange(&mut orchestrator, "Q1", "a1");

    orchestrator
        .do_regenerate(&MessageId::new("a1"), None)
        .unwrap();

    assert_eq!(
        recorder.last_request().payload.parent_message_id,
        Some(MessageId::new("a0"))
    );
}

#[test]
fn regenerating_under_an_errored_answer_drops_the_parent() {
    let (recorder, mut orchestrator) = setup();
    let raw = r#"{"data": [
        {"id": "a0", "query": "Q0", "answer": "", "status": "error", "error": "boom"},
        {"id": "a1", "query": "Q1", "answer": "fine", "parent_message_id": "a0"}
    ]}"#;
    let tree = decode_tree(raw, HistoryFormat::Flat).unwrap();
    orchestrator
        .hydrate(tree, Some(ConversationId::new("c1")), InputValues::new())
        .unwrap();

    orchestrator
        .do_regenerate(&MessageId::new("question-a1"), None)
        .unwrap();

    assert_eq!(recorder.last_request().payload.parent_message_id, None);
}

#[test]
fn edited_question_replaces_content_and_files() {
    let (recorder, mut orchestrator) = setup();
    exchange(&mut orchestrator, "typo", "a1");

    orchestrator
        .do_regenerate(
            &MessageId::new("question-a1"),
            Some(arbor_chat::EditedQuestion {
                content: "fixed".to_string(),
                files: vec![FileRef::uploaded("f1", "notes.txt")],
            }),
        )
        .unwrap();

    let request = recorder.last_request();
    assert_eq!(request.payload.query, "fixed");
    assert_eq!(request.payload.files.map(|files| files.len()), Some(1));
}

#[test]
fn regenerate_of_unknown_message_fails() {
    let (_, mut orchestrator) = setup();
    let error = orchestrator
        .do_regenerate(&MessageId::new("missing"), None)
        .unwrap_err();
    assert!(matches!(error, ChatError::Tree { .. }));
}

#[test]
fn completion_callback_only_for_new_conversations() {
    let (recorder, mut orchestrator) = setup();
    let finalized = Arc::new(Mutex::new(0_usize));
    let sink = finalized.clone();
    orchestrator = orchestrator.with_conversation_finalized(Arc::new(move || {
        *sink.lock().unwrap() += 1;
    }));

    exchange(&mut orchestrator, "first", "a1");
    assert!(recorder.requests.lock().unwrap()[0]
        .callbacks
        .on_conversation_complete
        .is_some());
    assert_eq!(*finalized.lock().unwrap(), 1);
    assert_eq!(orchestrator.conversation_id(), Some(&ConversationId::new("c1")));

    exchange(&mut orchestrator, "second", "a2");
    assert!(recorder.last_request().callbacks.on_conversation_complete.is_none());
    assert_eq!(*finalized.lock().unwrap(), 1);
}

#[test]
fn switch_callbacks_follow_conversation_existence() {
    let raw = r#"[{"id": "a1", "query": "Q", "answer": "A"}]"#;

    let (recorder, mut orchestrator) = setup();
    orchestrator
        .hydrate(
            decode_tree(raw, HistoryFormat::Flat).unwrap(),
            None,
            InputValues::new(),
        )
        .unwrap();
    let outcome = orchestrator.do_switch_sibling(&MessageId::new("a1")).unwrap();
    assert!(matches!(outcome, SwitchOutcome::Switched));
    assert!(recorder.switches.lock().unwrap()[0]
        .callbacks
        .on_conversation_complete
        .is_some());

    let (recorder, mut orchestrator) = setup();
    orchestrator
        .hydrate(
            decode_tree(raw, HistoryFormat::Flat).unwrap(),
            Some(ConversationId::new("c9")),
            InputValues::new(),
        )
        .unwrap();
    orchestrator.do_switch_sibling(&MessageId::new("a1")).unwrap();
    let switches = recorder.switches.lock().unwrap();
    assert!(switches[0].callbacks.on_conversation_complete.is_none());
    assert!(switches[0].resume.is_none());
}

#[test]
fn switching_sibling_moves_the_active_path() {
    let (_, mut orchestrator) = setup();
    exchange(&mut orchestrator, "Q1", "a1");
    orchestrator
        .do_regenerate(&MessageId::new("a1"), None)
        .unwrap();
    let target = orchestrator.stream_state().live_target().unwrap();
    orchestrator.apply_stream_event(ChatStreamEvent::new(target, chunk("again", "a2")));
    orchestrator.apply_stream_event(ChatStreamEvent::new(target, ChatEventPayload::Done));
    assert_eq!(orchestrator.thread().leaf().unwrap().id, MessageId::new("a2"));

    orchestrator
        .do_switch_sibling(&MessageId::new("question-a1"))
        .unwrap();
    assert_eq!(orchestrator.thread().leaf().unwrap().id, MessageId::new("a1"));
}

#[test]
fn hydrating_a_paused_workflow_resumes_it_once() {
    let (recorder, mut orchestrator) = setup();
    let tree = decode_tree(paused_history(), HistoryFormat::Nested).unwrap();

    let outcome = orchestrator
        .hydrate(tree, Some(ConversationId::new("c1")), InputValues::new())
        .unwrap();

    assert!(matches!(outcome, Some(SwitchOutcome::Resumed { .. })));
    {
        let switches = recorder.switches.lock().unwrap();
        assert_eq!(switches.len(), 1);
        assert_eq!(switches[0].sibling_id, MessageId::new("1"));
        let resume = switches[0].resume.as_ref().unwrap();
        assert_eq!(resume.workflow_run_id.as_str(), "w1");
    }
    assert!(orchestrator.is_paused());
    assert!(orchestrator.is_compose_disabled());

    assert!(orchestrator.resume_paused_workflow().unwrap().is_none());
    assert_eq!(recorder.switches.lock().unwrap().len(), 1);
}

#[test]
fn hydrating_a_deep_paused_branch_activates_its_whole_path() {
    let (recorder, mut orchestrator) = setup();
    // A -> B -> Q2 -> C and A -> D; C and D are both paused, D is the latest variant.
    let payload = r#"[{"id": "A", "content": "plan a trip", "children": [
        {"id": "B", "isAnswer": true, "children": [
            {"id": "Q2", "content": "book it", "children": [
                {"id": "C", "isAnswer": true, "workflowRunId": "w-c",
                 "pendingHumanInputForms": [{"node_id": "n1", "form_token": "token-c"}]}
            ]}
        ]},
        {"id": "D", "isAnswer": true, "workflowRunId": "w-d",
         "pendingHumanInputForms": [{"node_id": "n1", "form_token": "token-d"}]}
    ]}]"#;
    let tree = decode_tree(payload, HistoryFormat::Nested).unwrap();

    let outcome = orchestrator
        .hydrate(tree, Some(ConversationId::new("c1")), InputValues::new())
        .unwrap();
    assert!(matches!(outcome, Some(SwitchOutcome::Resumed { .. })));

    let ids: Vec<String> = orchestrator
        .thread()
        .project()
        .iter()
        .map(|message| message.id.to_string())
        .collect();
    assert_eq!(ids, vec!["A", "B", "Q2", "C"]);

    let switches = recorder.switches.lock().unwrap();
    assert_eq!(switches.len(), 1);
    assert_eq!(switches[0].sibling_id, MessageId::new("C"));
    assert_eq!(
        switches[0].resume.as_ref().unwrap().workflow_run_id.as_str(),
        "w-c"
    );
}

#[test]
fn stop_handle_follows_a_workflow_resumed_with_the_same_task() {
    let (recorder, mut orchestrator) = setup();
    let handle = orchestrator.stop_handle();
    let target = send(&mut orchestrator, "Hello");
    for payload in [
        chunk("", "a1"),
        ChatEventPayload::WorkflowPaused {
            workflow_run_id: "w1".into(),
        },
    ] {
        orchestrator.apply_stream_event(ChatStreamEvent::new(target, payload));
    }
    assert!(orchestrator.is_paused());
    assert_eq!(handle.task_id(), None);

    orchestrator.apply_stream_event(ChatStreamEvent::new(
        target,
        ChatEventPayload::WorkflowStarted {
            workflow_run_id: "w1".into(),
            task_id: Some("task-1".to_string()),
        },
    ));
    handle.stop();

    let stops = recorder.stops.lock().unwrap();
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].task_id, "task-1");
    assert_eq!(handle.task_id().as_deref(), Some("task-1"));
}

#[test]
fn stop_while_paused_does_not_reach_the_server() {
    let (recorder, mut orchestrator) = setup();
    let tree = decode_tree(paused_history(), HistoryFormat::Nested).unwrap();
    orchestrator
        .hydrate(tree, Some(ConversationId::new("c1")), InputValues::new())
        .unwrap();

    orchestrator.do_stop();
    assert!(recorder.stops.lock().unwrap().is_empty());
    assert!(!orchestrator.is_responding());
}

#[tokio::test]
async fn resumed_workflow_streams_after_form_submission() {
    let (recorder, orchestrator) = setup();
    let forms = Arc::new(Forms::default());
    let mut orchestrator = orchestrator.with_form_service(forms.clone());
    recorder.script(vec![
        ChatEventPayload::WorkflowStarted {
            workflow_run_id: "w1".into(),
            task_id: Some("task-9".to_string()),
        },
        ChatEventPayload::Replace("Approved and done".to_string()),
        ChatEventPayload::Done,
    ]);
    let tree = decode_tree(paused_history(), HistoryFormat::Nested).unwrap();
    let outcome = orchestrator
        .hydrate(tree, Some(ConversationId::new("c1")), InputValues::new())
        .unwrap();

    orchestrator
        .submit_human_input_form(
            "token-1",
            HumanInputSubmission {
                inputs: values(json!({"approved": true})),
                action: "approve".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(forms.submitted.lock().unwrap()[0].0, "token-1");

    let Some(SwitchOutcome::Resumed { worker, .. }) = outcome else {
        panic!("expected the paused workflow to resume");
    };
    tokio::spawn(worker);
    orchestrator.pump().await;

    let answer = orchestrator.thread().get(&MessageId::new("1")).unwrap();
    assert_eq!(answer.content, "Approved and done");
    assert!(!orchestrator.is_paused());
    assert!(!orchestrator.is_responding());
    assert_eq!(orchestrator.task_id(), Some("task-9"));
}

struct ExpiredForms;

impl HumanInputFormService for ExpiredForms {
    fn submit<'a>(
        &'a self,
        _app_source: AppSourceType,
        form_token: &'a str,
        _submission: HumanInputSubmission,
    ) -> BoxFuture<'a, ChatResult<()>> {
        Box::pin(async move {
            Err(ChatError::FormSubmission {
                stage: "submit-form",
                message: format!("form {form_token} expired"),
            })
        })
    }
}

#[tokio::test]
async fn form_service_errors_reach_the_caller() {
    let (_, orchestrator) = setup();
    let orchestrator = orchestrator.with_form_service(Arc::new(ExpiredForms));
    let error = orchestrator
        .submit_human_input_form(
            "token-1",
            HumanInputSubmission {
                inputs: InputValues::new(),
                action: "approve".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(
        error.to_string(),
        "human input form submission failed: form token-1 expired"
    );
}

#[tokio::test]
async fn form_submission_without_service_fails() {
    let (_, orchestrator) = setup();
    let error = orchestrator
        .submit_human_input_form(
            "token",
            HumanInputSubmission {
                inputs: InputValues::new(),
                action: "approve".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(error, ChatError::FormServiceMissing { .. }));
}

#[tokio::test]
async fn pump_applies_worker_events_and_loads_suggestions() {
    let (recorder, orchestrator) = setup_with(ChatSettings {
        suggested_questions_after_answer: true,
        ..settings()
    });
    let fetcher = Arc::new(Suggestions::default());
    let mut orchestrator = orchestrator.with_suggested_questions(fetcher.clone());
    recorder.script(vec![chunk("Hel", "m1"), chunk("lo", "m1"), ChatEventPayload::Done]);

    let SendOutcome::Issued { worker, .. } = orchestrator
        .do_send("Hi", Vec::new(), SendOptions::default())
        .unwrap()
    else {
        panic!("expected an issued request");
    };
    tokio::spawn(worker);
    orchestrator.pump().await;

    let answer = orchestrator.thread().get(&MessageId::new("m1")).unwrap();
    assert_eq!(answer.content, "Hello");
    assert_eq!(answer.status, MessageStatus::Done);
    assert!(orchestrator.thread().get(&MessageId::new("question-m1")).is_some());
    assert_eq!(orchestrator.suggested_questions(), ["What next?", "Why?"]);
    assert_eq!(
        *fetcher.calls.lock().unwrap(),
        vec![(MessageId::new("m1"), AppSourceType::WebApp, "app-1".to_string())]
    );
}

#[tokio::test]
async fn suggestions_are_skipped_when_disabled() {
    let (recorder, orchestrator) = setup();
    let fetcher = Arc::new(Suggestions::default());
    let mut orchestrator = orchestrator.with_suggested_questions(fetcher.clone());
    recorder.script(vec![chunk("Hi", "m1"), ChatEventPayload::Done]);

    let SendOutcome::Issued { worker, .. } = orchestrator
        .do_send("Hi", Vec::new(), SendOptions::default())
        .unwrap()
    else {
        panic!("expected an issued request");
    };
    tokio::spawn(worker);
    orchestrator.pump().await;

    assert!(orchestrator.suggested_questions().is_empty());
    assert!(fetcher.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn failed_suggestion_fetch_leaves_no_questions() {
    let (recorder, orchestrator) = setup_with(ChatSettings {
        suggested_questions_after_answer: true,
        ..settings()
    });
    let mut orchestrator = orchestrator.with_suggested_questions(Arc::new(BrokenSuggestions));
    recorder.script(vec![chunk("Hi", "m1"), ChatEventPayload::Done]);

    let SendOutcome::Issued { worker, .. } = orchestrator
        .do_send("Hi", Vec::new(), SendOptions::default())
        .unwrap()
    else {
        panic!("expected an issued request");
    };
    tokio::spawn(worker);
    orchestrator.pump().await;

    assert!(orchestrator.suggested_questions().is_empty());
    assert_eq!(
        orchestrator.thread().get(&MessageId::new("m1")).unwrap().status,
        MessageStatus::Done
    );
}

#[test]
fn transport_failure_marks_the_placeholder_answer() {
    let mut orchestrator = ChatOrchestrator::new(Arc::new(Offline), Arc::new(settings()));

    let error = orchestrator
        .do_send("Hi", Vec::new(), SendOptions::default())
        .unwrap_err();
    assert!(matches!(error, ChatError::Transport { .. }));
    assert!(!orchestrator.is_responding());

    let leaf = orchestrator.thread().leaf().unwrap();
    assert_eq!(leaf.role, Role::Answer);
    assert!(matches!(leaf.status, MessageStatus::Error(_)));
    assert!(!orchestrator.stream_state().is_live());
}

#[tokio::test]
async fn stream_closing_early_marks_the_answer_failed() {
    let (recorder, mut orchestrator) = setup();
    recorder.script(vec![chunk("partial", "m1")]);

    let SendOutcome::Issued { worker, .. } = orchestrator
        .do_send("Hi", Vec::new(), SendOptions::default())
        .unwrap()
    else {
        panic!("expected an issued request");
    };
    tokio::spawn(worker);
    orchestrator.pump().await;

    let answer = orchestrator.thread().get(&MessageId::new("m1")).unwrap();
    assert_eq!(answer.content, "partial");
    assert!(matches!(answer.status, MessageStatus::Error(_)));
    assert!(!orchestrator.is_responding());
}

#[tokio::test]
async fn stop_handle_cancels_and_stops_once() {
    let (recorder, mut orchestrator) = setup();
    let target = send(&mut orchestrator, "Hi");
    orchestrator.apply_stream_event(ChatStreamEvent::new(target, chunk("partial", "m1")));

    let handle = orchestrator.stop_handle();
    assert!(handle.has_active_stream());
    assert_eq!(handle.task_id().as_deref(), Some("task-1"));
    handle.stop();
    assert_eq!(recorder.stops.lock().unwrap().len(), 1);

    recorder.close_streams();
    orchestrator.pump().await;

    let answer = orchestrator.thread().get(&MessageId::new("m1")).unwrap();
    assert_eq!(answer.content, "partial");
    assert_eq!(answer.status, MessageStatus::Cancelled);
    assert!(!orchestrator.is_responding());
    assert_eq!(recorder.stops.lock().unwrap().len(), 1);
    assert!(!handle.has_active_stream());
}

#[test]
fn error_event_marks_answer_and_frees_compose() {
    let (_, mut orchestrator) = setup();
    let target = send(&mut orchestrator, "Hi");
    orchestrator.apply_stream_event(ChatStreamEvent::new(
        target,
        ChatEventPayload::Error("quota exceeded".to_string()),
    ));

    assert!(!orchestrator.is_responding());
    let leaf = orchestrator.thread().leaf().unwrap();
    assert_eq!(leaf.role, Role::Answer);
    assert_eq!(leaf.status, MessageStatus::Error("quota exceeded".to_string()));

    send(&mut orchestrator, "again");
}

#[test]
fn responding_observer_sees_each_change() {
    let (_, orchestrator) = setup();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let mut orchestrator =
        orchestrator.with_responding_observer(Arc::new(move |responding| {
            sink.lock().unwrap().push(responding);
        }));

    exchange(&mut orchestrator, "Hi", "m1");
    assert_eq!(*seen.lock().unwrap(), vec![true, false]);
}

#[test]
fn installed_apps_use_their_own_endpoint() {
    let (recorder, mut orchestrator) = setup_with(ChatSettings {
        app_source: AppSourceType::InstalledApp,
        ..settings()
    });
    send(&mut orchestrator, "Hi");
    assert_eq!(
        recorder.last_request().endpoint,
        "installed-apps/app-1/chat-messages"
    );

    let (recorder, mut orchestrator) = setup();
    send(&mut orchestrator, "Hi");
    assert_eq!(recorder.last_request().endpoint, "chat-messages");
}

#[test]
fn files_travel_only_when_uploads_are_enabled() {
    let file = FileRef::uploaded("f1", "photo.png");

    let (recorder, mut orchestrator) = setup();
    orchestrator
        .do_send("with file", vec![file.clone()], SendOptions::default())
        .unwrap();
    assert_eq!(
        recorder.last_request().payload.files.map(|files| files.len()),
        Some(1)
    );

    let (recorder, mut orchestrator) = setup();
    send(&mut orchestrator, "no files");
    assert!(recorder.last_request().payload.files.is_none());

    let (recorder, mut orchestrator) = setup_with(ChatSettings {
        file_upload_enabled: false,
        ..settings()
    });
    orchestrator
        .do_send("with file", vec![file], SendOptions::default())
        .unwrap();
    assert!(recorder.last_request().payload.files.is_none());
}

#[test]
fn new_conversations_send_normalized_drafts() {
    let (recorder, mut orchestrator) = setup();
    orchestrator.set_input_form(vec![InputField::new("agree", InputKind::Checkbox)], false);
    orchestrator.set_draft_input("agree", json!("yes"));

    send(&mut orchestrator, "Hi");
    assert_eq!(
        recorder.last_request().payload.inputs,
        values(json!({"agree": true}))
    );
    assert_eq!(recorder.last_request().payload.conversation_id, None);
}

#[test]
fn existing_conversations_send_persisted_inputs() {
    let (recorder, mut orchestrator) = setup();
    let tree = decode_tree(r#"[{"id": "a1", "query": "Q", "answer": "A"}]"#, HistoryFormat::Flat)
        .unwrap();
    orchestrator
        .hydrate(
            tree,
            Some(ConversationId::new("c1")),
            values(json!({"topic": "rust"})),
        )
        .unwrap();
    orchestrator.set_draft_input("topic", json!("ignored"));

    send(&mut orchestrator, "more");
    let request = recorder.last_request();
    assert_eq!(request.payload.inputs, values(json!({"topic": "rust"})));
    assert_eq!(
        request.payload.conversation_id,
        Some(ConversationId::new("c1"))
    );
    assert_eq!(
        request.payload.parent_message_id,
        Some(MessageId::new("a1"))
    );
}

#[test]
fn opening_statement_is_suppressed_until_the_conversation_starts() {
    let (_, mut orchestrator) = setup_with(ChatSettings {
        opening_statement: "Hello {{name}}".to_string(),
        suggested_questions: vec!["Ask {{name}} anything".to_string()],
        ..settings()
    });
    orchestrator.set_draft_input("name", json!("Ada"));

    assert!(orchestrator.chat_list().is_empty());
    assert_eq!(
        orchestrator.opening_suggested_questions(),
        vec!["Ask Ada anything".to_string()]
    );

    send(&mut orchestrator, "Hi");
    let list = orchestrator.chat_list();
    assert_eq!(list.len(), 3);
    assert!(list[0].is_opening_statement());
    assert_eq!(list[0].content, "Hello Ada");
}

#[test]
fn restart_forgets_the_conversation() {
    let (_, mut orchestrator) = setup();
    exchange(&mut orchestrator, "Hi", "m1");
    assert!(!orchestrator.is_new_conversation());

    orchestrator.restart();
    assert!(orchestrator.is_new_conversation());
    assert!(orchestrator.thread().tree().is_empty());
    assert!(orchestrator.task_id().is_none());
}
