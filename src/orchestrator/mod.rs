//! Conversation orchestrator: one logical request/response exchange.
//!
//! A run stores the user's prompt, streams a model turn, routes tool calls
//! through a fresh [`OperationManager`], persists the assistant message with
//! its operations, and then either follows up (every operation concluded),
//! stops awaiting approval (something is pending), or completes.
//!
//! The run is bounded by a wall-clock deadline and observes a cooperative
//! cancellation signal at every stream read and loop boundary. Handlers that
//! already started are never interrupted.

pub mod events;
pub mod state;

pub use events::{ChatEvent, ChatEventEnvelope, EventSink};
pub use state::TurnState;

use crate::chat::history::model_messages;
use crate::chat::{ChatMessage, ChatStore};
use crate::config::AgentConfig;
use crate::error::{ModelError, TurnError};
use crate::handlers::{Environment, HandlerRegistry};
use crate::model::{ModelClient, ModelRequest, StreamEvent};
use crate::operation::{
    Catalog, Operation, OperationContext, OperationManager, OperationRequest, OperationSummary,
};
use crate::tokens::{TokenCounts, TokenTracker};
use crate::types::{FunctionCall, Message, Role, ToolCall, ToolDefinition};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Per-run limits, usually taken from `[agent]`.
#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub system_prompt: String,
    pub max_followup_turns: u32,
    pub turn_timeout: Duration,
    pub max_message_chars: usize,
}

impl TurnSettings {
    pub fn from_config(agent: &AgentConfig) -> Self {
        Self {
            system_prompt: agent.system_prompt.clone(),
            max_followup_turns: agent.max_followup_turns,
            turn_timeout: Duration::from_secs(agent.turn_timeout_secs),
            max_message_chars: agent.max_message_chars,
        }
    }
}

/// What starts a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnInput {
    /// A new user message.
    Prompt(String),
    /// Continue from the stored transcript, e.g. after approvals.
    Continue,
}

/// Final report of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub state: TurnState,
    /// `created` of the last assistant message written by the run.
    pub created: Option<u64>,
    pub operations: Vec<Operation>,
    pub tokens: TokenCounts,
    pub error: Option<String>,
}

pub struct Orchestrator {
    client: Arc<dyn ModelClient>,
    catalog: Arc<Catalog>,
    handlers: Arc<HandlerRegistry>,
    store: ChatStore,
    env: Environment,
    settings: TurnSettings,
}

struct RunState {
    state: TurnState,
    created: Option<u64>,
    operations: Vec<Operation>,
    tokens: TokenTracker,
}

/// Mutable state of one streamed model turn.
struct TurnPass<'m> {
    pending: ChatMessage,
    manager: OperationManager<'m>,
    calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassEnd {
    Complete,
    Cancelled,
}

enum Guarded<T> {
    Ready(T),
    Cancelled,
    TimedOut,
}

impl Orchestrator {
    pub fn new(
        client: Arc<dyn ModelClient>,
        catalog: Arc<Catalog>,
        handlers: Arc<HandlerRegistry>,
        store: ChatStore,
        env: Environment,
        settings: TurnSettings,
    ) -> Self {
        Self {
            client,
            catalog,
            handlers,
            store,
            env,
            settings,
        }
    }

    pub fn store(&self) -> &ChatStore {
        &self.store
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn settings(&self) -> &TurnSettings {
        &self.settings
    }

    /// Operation context for `chat_id` in `mode`, sharing this orchestrator's environment.
    pub fn operation_context(&self, chat_id: &str, mode: crate::operation::ChatMode) -> OperationContext {
        OperationContext {
            chat_id: chat_id.to_string(),
            mode,
            env: self.env.clone(),
            max_message_chars: self.settings.max_message_chars,
        }
    }

    /// Run one exchange to a final state. Never fails; failures are
    /// reported once as an `Error` event and in the outcome.
    pub async fn run(
        &self,
        chat_id: &str,
        input: TurnInput,
        events: &mut EventSink,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> TurnOutcome {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.settings.turn_timeout;
        let mut run = RunState {
            state: TurnState::Idle,
            created: None,
            operations: Vec::new(),
            tokens: TokenTracker::new(),
        };
        tracing::info!(chat_id, "turn started");

        let error = match self
            .drive(chat_id, input, events, cancel.as_mut(), deadline, &mut run)
            .await
        {
            Ok(()) => None,
            Err(err) => {
                tracing::warn!(chat_id, error = %err, "turn failed");
                let message = err.to_string();
                events.emit(ChatEvent::Error {
                    error: message.clone(),
                });
                run.state = run
                    .state
                    .transition(TurnState::Errored)
                    .unwrap_or(TurnState::Errored);
                events.emit(ChatEvent::Status {
                    status: TurnState::Errored,
                    detail: None,
                });
                Some(message)
            }
        };

        events.emit(ChatEvent::Elapsed {
            ms: started.elapsed().as_millis() as u64,
        });
        tracing::info!(chat_id, state = %run.state, "turn finished");
        TurnOutcome {
            state: run.state,
            created: run.created,
            operations: run.operations,
            tokens: run.tokens.counts(),
            error,
        }
    }

    async fn drive(
        &self,
        chat_id: &str,
        input: TurnInput,
        events: &mut EventSink,
        mut cancel: Option<&mut watch::Receiver<bool>>,
        deadline: tokio::time::Instant,
        run: &mut RunState,
    ) -> Result<(), TurnError> {
        let data = match input {
            TurnInput::Prompt(prompt) => {
                let (data, message) = self
                    .store
                    .update(chat_id, |data| {
                        let message = ChatMessage::user(data.next_created(), prompt);
                        data.upsert(message.clone());
                        (data.clone(), message)
                    })
                    .await?;
                events.emit(ChatEvent::UserMessage { message });
                data
            }
            TurnInput::Continue => self.store.load(chat_id)?,
        };
        let ctx = self.operation_context(chat_id, data.mode);

        if is_cancelled(cancel.as_deref()) {
            return advance(run, TurnState::Cancelled, events);
        }
        advance(run, TurnState::Running, events)?;

        let mut messages = model_messages(&self.settings.system_prompt, &data.messages);
        let tools: Vec<ToolDefinition> = self.handlers.definitions();
        let mut followups = 0u32;

        loop {
            if is_cancelled(cancel.as_deref()) {
                return advance(run, TurnState::Cancelled, events);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(TurnError::Timeout(self.settings.turn_timeout));
            }

            let created = self
                .store
                .update(chat_id, |data| {
                    let created = data.next_created();
                    data.upsert(ChatMessage::assistant(created));
                    created
                })
                .await?;
            run.created = Some(created);
            run.tokens.begin_turn();

            let mut pass = TurnPass {
                pending: ChatMessage::assistant(created),
                manager: OperationManager::new(&self.catalog, &self.handlers, ctx.clone()),
                calls: Vec::new(),
            };
            let request = ModelRequest {
                messages: messages.clone(),
                tools: tools.clone(),
            };
            let ended = self
                .stream_pass(
                    request,
                    &mut pass,
                    &mut run.tokens,
                    events,
                    cancel.as_deref_mut(),
                    deadline,
                )
                .await;

            let TurnPass {
                mut pending,
                manager,
                calls,
            } = pass;
            let operations = manager.into_operations();
            pending.operations = (!operations.is_empty()).then(|| operations.clone());
            pending.tokens = Some(run.tokens.counts());
            run.operations = operations.clone();
            // Whatever the pass produced is kept, including on timeout or cancel.
            let saved = self
                .store
                .update(chat_id, |data| data.upsert(pending.clone()))
                .await;
            let ended = ended?;
            saved?;

            if ended == PassEnd::Cancelled {
                return advance(run, TurnState::Cancelled, events);
            }

            if !operations.is_empty() {
                events.emit(ChatEvent::Operations {
                    created,
                    operations: operations.clone(),
                    summary: OperationSummary::from_operations(&operations),
                });
            }
            if operations.iter().any(|op| !op.status.is_terminal()) {
                return advance(run, TurnState::AwaitingApproval, events);
            }
            if !operations.is_empty() && followups < self.settings.max_followup_turns {
                followups += 1;
                tracing::info!(chat_id, followups, "operations concluded; following up");
                messages.push(assistant_tool_message(&pending.content, calls.clone()));
                for (call, op) in calls.iter().zip(&operations) {
                    messages.push(Message::tool_result(&call.id, op.summary_line()));
                }
                continue;
            }

            events.emit(ChatEvent::Complete { message: pending });
            return advance(run, TurnState::Done, events);
        }
    }

    /// Stream one model turn into `pass`.
    async fn stream_pass(
        &self,
        request: ModelRequest,
        pass: &mut TurnPass<'_>,
        tokens: &mut TokenTracker,
        events: &mut EventSink,
        mut cancel: Option<&mut watch::Receiver<bool>>,
        deadline: tokio::time::Instant,
    ) -> Result<PassEnd, TurnError> {
        let timeout = || TurnError::Timeout(self.settings.turn_timeout);
        let mut stream = match guarded(self.client.stream(request), deadline, cancel.as_deref_mut()).await {
            Guarded::Ready(stream) => stream?,
            Guarded::Cancelled => return Ok(PassEnd::Cancelled),
            Guarded::TimedOut => return Err(timeout()),
        };

        loop {
            let event = match guarded(stream.recv(), deadline, cancel.as_deref_mut()).await {
                Guarded::Ready(Some(Ok(event))) => event,
                Guarded::Ready(Some(Err(err))) => return Err(err.into()),
                Guarded::Ready(None) => return Err(ModelError::StreamClosed.into()),
                Guarded::Cancelled => return Ok(PassEnd::Cancelled),
                Guarded::TimedOut => return Err(timeout()),
            };

            match event {
                StreamEvent::RequestTokens { count } => {
                    tokens.record_request(count);
                    events.emit(ChatEvent::Tokens(tokens.counts()));
                }
                StreamEvent::ResponseTokens { count } => {
                    tokens.record_output(count);
                    events.emit(ChatEvent::Tokens(tokens.counts()));
                }
                StreamEvent::Reason { delta, tokens: count } => {
                    tokens.record_reasoning(count);
                    pass.pending
                        .reasoning
                        .get_or_insert_with(String::new)
                        .push_str(&delta);
                    events.emit(ChatEvent::Tokens(tokens.counts()));
                }
                StreamEvent::Usage {
                    prompt,
                    output,
                    reasoning,
                } => {
                    tokens.reconcile(prompt, output, reasoning);
                    events.emit(ChatEvent::Tokens(tokens.counts()));
                }
                StreamEvent::TextPartial { delta } => {
                    pass.pending.content.push_str(&delta);
                    events.emit(ChatEvent::PendingUpdate {
                        message: pass.pending.clone(),
                    });
                }
                StreamEvent::TextComplete { text } => {
                    pass.pending.content = text;
                    events.emit(ChatEvent::PendingUpdate {
                        message: pass.pending.clone(),
                    });
                }
                StreamEvent::TextReset => {
                    pass.pending.content.clear();
                    tokens.discard_turn_output();
                    events.emit(ChatEvent::Tokens(tokens.counts()));
                    events.emit(ChatEvent::PendingUpdate {
                        message: pass.pending.clone(),
                    });
                }
                StreamEvent::ToolStart { name, .. } => {
                    events.emit(ChatEvent::Status {
                        status: TurnState::Running,
                        detail: Some(format!("calling {name}")),
                    });
                }
                StreamEvent::ToolCall {
                    id,
                    name,
                    arguments,
                } => {
                    // Unparseable arguments still become an operation, which
                    // then fails validation and is reported to the model.
                    let input = serde_json::from_str(&arguments)
                        .unwrap_or_else(|_| Value::String(arguments.clone()));
                    pass.manager
                        .handle(OperationRequest::new(name.clone(), input))
                        .await;
                    pass.calls.push(ToolCall {
                        id,
                        call_type: "function".to_string(),
                        function: FunctionCall { name, arguments },
                    });
                    pass.pending.operations = Some(pass.manager.operations().to_vec());
                    events.emit(ChatEvent::PendingUpdate {
                        message: pass.pending.clone(),
                    });
                }
                StreamEvent::Complete => return Ok(PassEnd::Complete),
            }
        }
    }
}

fn advance(run: &mut RunState, next: TurnState, events: &mut EventSink) -> Result<(), TurnError> {
    run.state = run.state.transition(next)?;
    events.emit(ChatEvent::Status {
        status: next,
        detail: None,
    });
    Ok(())
}

fn assistant_tool_message(content: &str, calls: Vec<ToolCall>) -> Message {
    Message {
        role: Role::Assistant,
        content: (!content.is_empty()).then(|| content.to_string()),
        tool_calls: Some(calls),
        tool_call_id: None,
    }
}

fn is_cancelled(cancel_rx: Option<&watch::Receiver<bool>>) -> bool {
    cancel_rx.is_some_and(|rx| *rx.borrow())
}

/// Race `fut` against cancellation and the run deadline.
async fn guarded<F: Future>(
    fut: F,
    deadline: tokio::time::Instant,
    cancel_rx: Option<&mut watch::Receiver<bool>>,
) -> Guarded<F::Output> {
    tokio::select! {
        biased;
        _ = wait_for_cancellation(cancel_rx) => Guarded::Cancelled,
        _ = tokio::time::sleep_until(deadline) => Guarded::TimedOut,
        output = fut => Guarded::Ready(output),
    }
}

/// Resolve once cancellation is requested. Never resolves without a
/// receiver or after the sender is gone.
async fn wait_for_cancellation(cancel_rx: Option<&mut watch::Receiver<bool>>) {
    let Some(cancel_rx) = cancel_rx else {
        return std::future::pending::<()>().await;
    };
    while !*cancel_rx.borrow_and_update() {
        if cancel_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
