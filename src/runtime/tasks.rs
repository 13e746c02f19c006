//! Runtime task lifecycle helpers.
//!
//! Turn and approval tasks run on their own tokio tasks; their chat events
//! and completion notices flow back to the actor over channels.

use super::{ChatStreamEvent, TaskRef};
use crate::error::StoreError;
use crate::operation::{ApprovalResolver, Resolution};
use crate::orchestrator::{ChatEventEnvelope, EventSink, Orchestrator, TurnInput, TurnOutcome};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Runtime-owned metadata for a chat's running task.
pub(super) struct ActiveTask {
    pub(super) task_id: u64,
    pub(super) cancel_tx: watch::Sender<bool>,
}

/// Progress sent from a task back to the actor.
pub(super) enum TaskUpdate {
    Chat(ChatStreamEvent),
    Resolved {
        task: TaskRef,
        message_created: u64,
        resolution: Resolution,
    },
}

/// Completion notification sent from a task back to the actor.
pub(super) struct TaskDone {
    pub(super) task: TaskRef,
    pub(super) result: Result<TaskResult, StoreError>,
}

pub(super) enum TaskResult {
    Turn(TurnOutcome),
    /// Approvals applied; `follow_up` is set when a turn ran afterwards.
    Resolved {
        resolution: Resolution,
        follow_up: Option<TurnOutcome>,
    },
}

pub(super) struct ResolveRequest {
    pub(super) message_created: u64,
    pub(super) approved: Vec<usize>,
    pub(super) rejected: Vec<usize>,
    pub(super) follow_up: bool,
}

/// Spawn one orchestrator run for `prompt`.
pub(super) fn spawn_prompt_task(
    orchestrator: Arc<Orchestrator>,
    task: TaskRef,
    prompt: String,
    cancel_rx: watch::Receiver<bool>,
    update_tx: mpsc::UnboundedSender<TaskUpdate>,
    done_tx: mpsc::UnboundedSender<TaskDone>,
) {
    tokio::spawn(async move {
        let outcome = run_forwarded(
            &orchestrator,
            &task,
            TurnInput::Prompt(prompt),
            cancel_rx,
            &update_tx,
        )
        .await;
        let _ = done_tx.send(TaskDone {
            task,
            result: Ok(TaskResult::Turn(outcome)),
        });
    });
}

/// Spawn approval resolution, optionally followed by a continuation turn.
pub(super) fn spawn_resolve_task(
    orchestrator: Arc<Orchestrator>,
    task: TaskRef,
    request: ResolveRequest,
    cancel_rx: watch::Receiver<bool>,
    update_tx: mpsc::UnboundedSender<TaskUpdate>,
    done_tx: mpsc::UnboundedSender<TaskDone>,
) {
    tokio::spawn(async move {
        let result = resolve_then_follow_up(&orchestrator, &task, request, cancel_rx, &update_tx).await;
        let _ = done_tx.send(TaskDone { task, result });
    });
}

async fn resolve_then_follow_up(
    orchestrator: &Orchestrator,
    task: &TaskRef,
    request: ResolveRequest,
    cancel_rx: watch::Receiver<bool>,
    update_tx: &mpsc::UnboundedSender<TaskUpdate>,
) -> Result<TaskResult, StoreError> {
    let store = orchestrator.store();
    let mode = store.load(&task.chat_id)?.mode;
    let ctx = orchestrator.operation_context(&task.chat_id, mode);
    let resolver = ApprovalResolver::new(orchestrator.catalog(), orchestrator.handlers());
    let resolution = resolver
        .resolve_stored(
            store,
            &task.chat_id,
            request.message_created,
            &request.approved,
            &request.rejected,
            &ctx,
        )
        .await?;
    let _ = update_tx.send(TaskUpdate::Resolved {
        task: task.clone(),
        message_created: request.message_created,
        resolution: resolution.clone(),
    });

    let follow_up = if request.follow_up && resolution.all_terminal {
        Some(run_forwarded(orchestrator, task, TurnInput::Continue, cancel_rx, update_tx).await)
    } else {
        None
    };
    Ok(TaskResult::Resolved {
        resolution,
        follow_up,
    })
}

/// Run the orchestrator while forwarding its chat events to the actor.
async fn run_forwarded(
    orchestrator: &Orchestrator,
    task: &TaskRef,
    input: TurnInput,
    cancel_rx: watch::Receiver<bool>,
    update_tx: &mpsc::UnboundedSender<TaskUpdate>,
) -> TurnOutcome {
    let (chat_tx, mut chat_rx) = mpsc::unbounded_channel::<ChatEventEnvelope>();
    let work = async move {
        let mut sink = EventSink::new(task.chat_id.clone(), chat_tx);
        orchestrator
            .run(&task.chat_id, input, &mut sink, Some(cancel_rx))
            .await
    };
    let forward = async {
        while let Some(envelope) = chat_rx.recv().await {
            let _ = update_tx.send(TaskUpdate::Chat(ChatStreamEvent {
                task: task.clone(),
                envelope,
            }));
        }
    };
    let (outcome, ()) = tokio::join!(work, forward);
    outcome
}
