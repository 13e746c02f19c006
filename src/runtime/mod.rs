//! Runtime actor and schema facade.
//!
//! The actor owns the map of running tasks and enforces one in-flight task
//! per chat: a prompt or approval for a busy chat is refused with an error
//! event instead of racing the running turn.

use crate::orchestrator::{Orchestrator, TurnState};
use crate::textutil::single_line_preview;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

mod schema;
mod tasks;

pub use schema::*;
use tasks::{
    spawn_prompt_task, spawn_resolve_task, ActiveTask, ResolveRequest, TaskDone, TaskResult,
    TaskUpdate,
};

/// Handle for sending commands to a spawned runtime actor.
#[derive(Clone)]
pub struct StewardRuntimeHandle {
    pub commands: mpsc::Sender<RuntimeCommand>,
}

impl StewardRuntimeHandle {
    pub async fn send(&self, command: RuntimeCommand) -> Result<(), String> {
        self.commands
            .send(command)
            .await
            .map_err(|_| "runtime command channel closed".to_string())
    }
}

/// Event stream receiver returned by [`spawn_runtime`].
pub type RuntimeEventStream = mpsc::UnboundedReceiver<RuntimeEventEnvelope>;

/// Spawn a runtime actor around a shared orchestrator.
pub fn spawn_runtime(orchestrator: Arc<Orchestrator>) -> (StewardRuntimeHandle, RuntimeEventStream) {
    let (command_tx, mut command_rx) = mpsc::channel::<RuntimeCommand>(64);
    let (event_tx, event_rx) = mpsc::unbounded_channel::<RuntimeEventEnvelope>();

    tokio::spawn(async move {
        let (update_tx, mut update_rx) = mpsc::unbounded_channel::<TaskUpdate>();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<TaskDone>();
        let mut actor = RuntimeActor {
            orchestrator,
            active: HashMap::new(),
            next_task_id: 1,
            event_tx,
            seq: 0,
            update_tx,
            done_tx,
        };
        actor.emit(RuntimeEvent::Lifecycle(LifecycleEvent::RuntimeStarted));

        loop {
            // Updates drain before completions so a task's last events
            // precede its Completed event.
            tokio::select! {
                biased;
                Some(command) = command_rx.recv() => {
                    if actor.handle_command(command).await {
                        actor.emit(RuntimeEvent::Lifecycle(LifecycleEvent::RuntimeStopped));
                        break;
                    }
                }
                Some(update) = update_rx.recv() => actor.handle_update(update),
                Some(done) = done_rx.recv() => actor.handle_done(done),
                else => break,
            }
        }
    });

    (
        StewardRuntimeHandle {
            commands: command_tx,
        },
        event_rx,
    )
}

struct RuntimeActor {
    orchestrator: Arc<Orchestrator>,
    /// Running task per chat id.
    active: HashMap<String, ActiveTask>,
    next_task_id: u64,
    event_tx: mpsc::UnboundedSender<RuntimeEventEnvelope>,
    seq: u64,
    update_tx: mpsc::UnboundedSender<TaskUpdate>,
    done_tx: mpsc::UnboundedSender<TaskDone>,
}

impl RuntimeActor {
    fn emit(&mut self, event: RuntimeEvent) {
        let _ = self.event_tx.send(RuntimeEventEnvelope::new(self.seq, event));
        self.seq = self.seq.saturating_add(1);
    }

    fn emit_error(&mut self, task: Option<TaskRef>, message: impl Into<String>) {
        self.emit(RuntimeEvent::Error(ErrorEvent {
            task,
            message: message.into(),
        }));
    }

    /// Register a new task for `chat_id`, or report that the chat is busy.
    fn begin_task(
        &mut self,
        chat_id: &str,
        kind: &str,
        details: String,
    ) -> Option<(TaskRef, watch::Receiver<bool>)> {
        if let Some(active) = self.active.get(chat_id) {
            let message = format!(
                "chat `{chat_id}` already has a running task (#{})",
                active.task_id
            );
            self.emit_error(None, message);
            return None;
        }
        let task = TaskRef::new(self.next_task_id, chat_id);
        self.next_task_id = self.next_task_id.saturating_add(1);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.active.insert(
            chat_id.to_string(),
            ActiveTask {
                task_id: task.task_id,
                cancel_tx,
            },
        );
        self.emit(RuntimeEvent::Task(TaskEvent::Queued {
            task: task.clone(),
            kind: kind.to_string(),
            details,
        }));
        self.emit(RuntimeEvent::Task(TaskEvent::Started { task: task.clone() }));
        Some((task, cancel_rx))
    }

    /// Returns true when the actor should stop.
    async fn handle_command(&mut self, command: RuntimeCommand) -> bool {
        match command {
            RuntimeCommand::SubmitPrompt { chat_id, prompt } => {
                let details = single_line_preview(&prompt, 80);
                let Some((task, cancel_rx)) = self.begin_task(&chat_id, "prompt", details) else {
                    return false;
                };
                spawn_prompt_task(
                    Arc::clone(&self.orchestrator),
                    task,
                    prompt,
                    cancel_rx,
                    self.update_tx.clone(),
                    self.done_tx.clone(),
                );
            }
            RuntimeCommand::Resolve {
                chat_id,
                message_created,
                approved,
                rejected,
                follow_up,
            } => {
                let details =
                    format!("message {message_created}: approve {approved:?}, reject {rejected:?}");
                let Some((task, cancel_rx)) = self.begin_task(&chat_id, "resolve", details) else {
                    return false;
                };
                spawn_resolve_task(
                    Arc::clone(&self.orchestrator),
                    task,
                    ResolveRequest {
                        message_created,
                        approved,
                        rejected,
                        follow_up,
                    },
                    cancel_rx,
                    self.update_tx.clone(),
                    self.done_tx.clone(),
                );
            }
            RuntimeCommand::CancelTask { task_id } => {
                let found = self
                    .active
                    .iter()
                    .find(|(_, active)| active.task_id == task_id)
                    .map(|(chat_id, active)| {
                        let _ = active.cancel_tx.send(true);
                        chat_id.clone()
                    });
                match found {
                    Some(chat_id) => self.emit(RuntimeEvent::Task(TaskEvent::Cancelling {
                        task: TaskRef::new(task_id, chat_id),
                    })),
                    None => self.emit_error(None, format!("no running task with id #{task_id}")),
                }
            }
            RuntimeCommand::SetMode { chat_id, mode } => {
                let result = self.orchestrator.store().set_mode(&chat_id, mode).await;
                match result {
                    Ok(()) => self.emit(RuntimeEvent::Mode(ModeEvent::Changed { chat_id, mode })),
                    Err(err) => self.emit_error(None, format!("failed to set mode: {err}")),
                }
            }
            RuntimeCommand::Shutdown => {
                for active in self.active.values() {
                    let _ = active.cancel_tx.send(true);
                }
                return true;
            }
        }
        false
    }

    fn handle_update(&mut self, update: TaskUpdate) {
        match update {
            TaskUpdate::Chat(event) => self.emit(RuntimeEvent::Chat(event)),
            TaskUpdate::Resolved {
                task,
                message_created,
                resolution,
            } => self.emit(RuntimeEvent::Approval(ApprovalEvent::Resolved {
                task,
                message_created,
                resolution,
            })),
        }
    }

    fn handle_done(&mut self, done: TaskDone) {
        if self
            .active
            .get(&done.task.chat_id)
            .is_some_and(|active| active.task_id == done.task.task_id)
        {
            self.active.remove(&done.task.chat_id);
        }

        let (state, message_created) = match done.result {
            Ok(TaskResult::Turn(outcome))
            | Ok(TaskResult::Resolved {
                follow_up: Some(outcome),
                ..
            }) => (outcome.state, outcome.created),
            Ok(TaskResult::Resolved {
                resolution,
                follow_up: None,
            }) => {
                let state = if resolution.all_terminal {
                    TurnState::Done
                } else {
                    TurnState::AwaitingApproval
                };
                (state, None)
            }
            Err(err) => {
                self.emit(RuntimeEvent::Task(TaskEvent::Failed {
                    task: done.task,
                    message: err.to_string(),
                }));
                return;
            }
        };
        self.emit(RuntimeEvent::Task(TaskEvent::Completed {
            task: done.task,
            state,
            message_created,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatStore;
    use crate::handlers::{Environment, HandlerRegistry};
    use crate::model::StreamEvent;
    use crate::operation::{Catalog, ChatMode, OperationStatus};
    use crate::orchestrator::{ChatEvent, TurnSettings};
    use crate::testsupport::{text_turn, tool_turn, ScriptStep, ScriptedModelClient, TestTempDir};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Fixture {
        _dir: TestTempDir,
        orchestrator: Arc<Orchestrator>,
        chat_id: String,
    }

    async fn fixture(name: &str, mode: ChatMode, scripts: Vec<Vec<ScriptStep>>) -> Fixture {
        let dir = TestTempDir::new(name);
        let store = ChatStore::open(dir.path().join("chats"), mode).unwrap();
        let chat_id = store.create_chat(None).await.unwrap();
        dir.write_text("workspace/notes.md", "old");
        let orchestrator = Orchestrator::new(
            Arc::new(ScriptedModelClient::new(scripts)),
            Catalog::builtin(),
            Arc::new(HandlerRegistry::builtin()),
            store,
            Environment::in_memory(dir.path().join("workspace")),
            TurnSettings {
                system_prompt: String::new(),
                max_followup_turns: 1,
                turn_timeout: Duration::from_secs(30),
                max_message_chars: 2_000,
            },
        );
        Fixture {
            _dir: dir,
            orchestrator: Arc::new(orchestrator),
            chat_id,
        }
    }

    async fn recv_event(rx: &mut RuntimeEventStream) -> RuntimeEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event timeout")
            .expect("event channel closed")
            .event
    }

    /// Read events until a task completes or fails, returning everything seen.
    async fn until_task_end(rx: &mut RuntimeEventStream) -> Vec<RuntimeEvent> {
        let mut seen = Vec::new();
        loop {
            let event = recv_event(rx).await;
            let end = matches!(
                event,
                RuntimeEvent::Task(TaskEvent::Completed { .. } | TaskEvent::Failed { .. })
            );
            seen.push(event);
            if end {
                return seen;
            }
        }
    }

    fn completed_state(events: &[RuntimeEvent]) -> Option<(TurnState, Option<u64>)> {
        events.iter().find_map(|e| match e {
            RuntimeEvent::Task(TaskEvent::Completed {
                state,
                message_created,
                ..
            }) => Some((*state, *message_created)),
            _ => None,
        })
    }

    #[tokio::test]
    async fn submit_prompt_forwards_chat_events_and_completes() {
        let fx = fixture("rt-submit", ChatMode::Read, vec![text_turn("ok")]).await;
        let (handle, mut events) = spawn_runtime(Arc::clone(&fx.orchestrator));
        assert_eq!(
            recv_event(&mut events).await,
            RuntimeEvent::Lifecycle(LifecycleEvent::RuntimeStarted)
        );

        handle
            .send(RuntimeCommand::SubmitPrompt {
                chat_id: fx.chat_id.clone(),
                prompt: "ping".into(),
            })
            .await
            .unwrap();
        let seen = until_task_end(&mut events).await;

        assert!(matches!(seen[0], RuntimeEvent::Task(TaskEvent::Queued { .. })));
        assert!(matches!(seen[1], RuntimeEvent::Task(TaskEvent::Started { .. })));
        assert!(seen.iter().any(|e| matches!(
            e,
            RuntimeEvent::Chat(ChatStreamEvent { envelope, .. })
                if matches!(envelope.event, ChatEvent::Complete { .. })
        )));
        assert_eq!(completed_state(&seen).map(|(s, _)| s), Some(TurnState::Done));
    }

    #[tokio::test]
    async fn second_task_on_busy_chat_is_refused() {
        let fx = fixture(
            "rt-busy",
            ChatMode::Read,
            vec![vec![
                ScriptStep::Delay(Duration::from_millis(300)),
                ScriptStep::Event(StreamEvent::Complete),
            ]],
        )
        .await;
        let (handle, mut events) = spawn_runtime(Arc::clone(&fx.orchestrator));
        let _ = recv_event(&mut events).await;

        for prompt in ["first", "second"] {
            handle
                .send(RuntimeCommand::SubmitPrompt {
                    chat_id: fx.chat_id.clone(),
                    prompt: prompt.into(),
                })
                .await
                .unwrap();
        }
        handle
            .send(RuntimeCommand::Resolve {
                chat_id: fx.chat_id.clone(),
                message_created: 1,
                approved: vec![0],
                rejected: Vec::new(),
                follow_up: false,
            })
            .await
            .unwrap();

        let seen = until_task_end(&mut events).await;
        let busy_errors = seen
            .iter()
            .filter(|e| matches!(e, RuntimeEvent::Error(err) if err.message.contains("already has a running task")))
            .count();
        assert_eq!(busy_errors, 2);
        assert_eq!(fx.orchestrator.store().messages(&fx.chat_id).unwrap()[0].content, "first");
    }

    #[tokio::test]
    async fn resolve_executes_approved_operation_and_follows_up() {
        let fx = fixture(
            "rt-resolve",
            ChatMode::None,
            vec![
                tool_turn(
                    "call_1",
                    "file_write",
                    json!({"path": "notes.md", "content": "new"}),
                ),
                text_turn("all set"),
            ],
        )
        .await;
        let (handle, mut events) = spawn_runtime(Arc::clone(&fx.orchestrator));
        let _ = recv_event(&mut events).await;

        handle
            .send(RuntimeCommand::SubmitPrompt {
                chat_id: fx.chat_id.clone(),
                prompt: "update notes".into(),
            })
            .await
            .unwrap();
        let (state, created) = completed_state(&until_task_end(&mut events).await).unwrap();
        assert_eq!(state, TurnState::AwaitingApproval);

        handle
            .send(RuntimeCommand::Resolve {
                chat_id: fx.chat_id.clone(),
                message_created: created.unwrap(),
                approved: vec![0],
                rejected: Vec::new(),
                follow_up: true,
            })
            .await
            .unwrap();
        let seen = until_task_end(&mut events).await;
        let resolution = seen
            .iter()
            .find_map(|e| match e {
                RuntimeEvent::Approval(ApprovalEvent::Resolved { resolution, .. }) => {
                    Some(resolution.clone())
                }
                _ => None,
            })
            .expect("resolution event");
        assert_eq!(resolution.executed, vec![0]);
        assert_eq!(completed_state(&seen).map(|(s, _)| s), Some(TurnState::Done));

        let messages = fx.orchestrator.store().messages(&fx.chat_id).unwrap();
        assert_eq!(messages[1].operations()[0].status, OperationStatus::Done);
        assert_eq!(messages.last().unwrap().content, "all set");
    }

    #[tokio::test]
    async fn unknown_message_reports_failure() {
        let fx = fixture("rt-missing", ChatMode::None, Vec::new()).await;
        let (handle, mut events) = spawn_runtime(Arc::clone(&fx.orchestrator));
        let _ = recv_event(&mut events).await;

        handle
            .send(RuntimeCommand::Resolve {
                chat_id: fx.chat_id.clone(),
                message_created: 999,
                approved: vec![0],
                rejected: Vec::new(),
                follow_up: true,
            })
            .await
            .unwrap();
        let seen = until_task_end(&mut events).await;
        assert!(matches!(
            seen.last(),
            Some(RuntimeEvent::Task(TaskEvent::Failed { message, .. })) if message.contains("999")
        ));
    }

    #[tokio::test]
    async fn cancel_task_stops_running_turn() {
        let fx = fixture(
            "rt-cancel",
            ChatMode::Read,
            vec![vec![
                ScriptStep::Delay(Duration::from_secs(5)),
                ScriptStep::Event(StreamEvent::Complete),
            ]],
        )
        .await;
        let (handle, mut events) = spawn_runtime(Arc::clone(&fx.orchestrator));
        let _ = recv_event(&mut events).await;

        handle
            .send(RuntimeCommand::SubmitPrompt {
                chat_id: fx.chat_id.clone(),
                prompt: "slow".into(),
            })
            .await
            .unwrap();
        handle
            .send(RuntimeCommand::CancelTask { task_id: 1 })
            .await
            .unwrap();

        let seen = until_task_end(&mut events).await;
        assert!(seen
            .iter()
            .any(|e| matches!(e, RuntimeEvent::Task(TaskEvent::Cancelling { task }) if task.task_id == 1)));
        assert_eq!(
            completed_state(&seen).map(|(s, _)| s),
            Some(TurnState::Cancelled)
        );
    }

    #[tokio::test]
    async fn set_mode_persists_and_shutdown_stops() {
        let fx = fixture("rt-mode", ChatMode::Read, Vec::new()).await;
        let (handle, mut events) = spawn_runtime(Arc::clone(&fx.orchestrator));
        let _ = recv_event(&mut events).await;

        handle
            .send(RuntimeCommand::SetMode {
                chat_id: fx.chat_id.clone(),
                mode: ChatMode::Delete,
            })
            .await
            .unwrap();
        assert_eq!(
            recv_event(&mut events).await,
            RuntimeEvent::Mode(ModeEvent::Changed {
                chat_id: fx.chat_id.clone(),
                mode: ChatMode::Delete
            })
        );
        assert_eq!(
            fx.orchestrator.store().load(&fx.chat_id).unwrap().mode,
            ChatMode::Delete
        );

        handle.send(RuntimeCommand::Shutdown).await.unwrap();
        assert_eq!(
            recv_event(&mut events).await,
            RuntimeEvent::Lifecycle(LifecycleEvent::RuntimeStopped)
        );
    }
}
