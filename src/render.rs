//! Terminal output for runtime events.
//!
//! Assistant text streams to stdout; status lines, operation lists and
//! errors go to stderr so piping a chat's answer stays clean.

use crate::chat::{ChatMessage, ChatRole};
use crate::operation::{Operation, OperationStatus};
use crate::orchestrator::{ChatEvent, TurnState};
use crate::runtime::{
    ApprovalEvent, ChatStreamEvent, ModeEvent, RuntimeEvent, TaskEvent,
};
use crate::tokens::TokenCounts;
use crossterm::style::{Color, Stylize};
use std::io::{self, Write};

const INDENT: &str = "  ";
const LABEL_WARNING: &str = "warning:";
const LABEL_ERROR: &str = "error:";
const LABEL_TOKENS: &str = "tokens";
const GLYPH_BULLET: &str = "•";

const COLOR_WARNING: Color = Color::Yellow;
const COLOR_ERROR: Color = Color::Red;
const COLOR_BULLET: Color = Color::DarkGrey;
const COLOR_TITLE: Color = Color::White;
const COLOR_FIELD_KEY: Color = Color::DarkGrey;
const COLOR_FIELD_VALUE: Color = Color::Grey;
const COLOR_REASONING: Color = Color::DarkGrey;

/// Low-level line printer.
#[derive(Debug, Clone, Copy)]
pub struct Renderer {
    color: bool,
}

impl Renderer {
    pub fn new(color: bool) -> Self {
        Self { color }
    }

    pub fn warn(&self, msg: &str) {
        if self.color {
            eprintln!("\r{} {msg}", LABEL_WARNING.with(COLOR_WARNING).bold());
        } else {
            eprintln!("\r{LABEL_WARNING} {msg}");
        }
    }

    pub fn error(&self, msg: &str) {
        if self.color {
            eprintln!("\r{} {msg}", LABEL_ERROR.with(COLOR_ERROR).bold());
        } else {
            eprintln!("\r{LABEL_ERROR} {msg}");
        }
    }

    /// Print a small section header.
    pub fn section(&self, title: &str) {
        if self.color {
            eprintln!(
                "\r{} {}",
                GLYPH_BULLET.with(COLOR_BULLET),
                title.with(COLOR_TITLE).bold()
            );
        } else {
            eprintln!("\r{title}:");
        }
    }

    pub fn field(&self, key: &str, value: &str) {
        if self.color {
            eprintln!(
                "\r{INDENT}{} {}",
                format!("{key}:").with(COLOR_FIELD_KEY),
                value.with(COLOR_FIELD_VALUE)
            );
        } else {
            eprintln!("\r{INDENT}{key}: {value}");
        }
    }

    pub fn detail(&self, text: &str) {
        if self.color {
            eprintln!("\r{INDENT}{}", text.with(COLOR_FIELD_VALUE));
        } else {
            eprintln!("\r{INDENT}{text}");
        }
    }

    pub fn reasoning(&self, text: &str) {
        self.section("thinking");
        for line in text.lines() {
            if self.color {
                eprintln!("\r{INDENT}{}", line.with(COLOR_REASONING).italic());
            } else {
                eprintln!("\r{INDENT}{line}");
            }
        }
    }

    pub fn token_usage(&self, counts: &TokenCounts) {
        let text = format_tokens(counts);
        if self.color {
            eprintln!("\r{INDENT}{} {}", LABEL_TOKENS.with(COLOR_FIELD_KEY), text.with(COLOR_FIELD_VALUE));
        } else {
            eprintln!("\r{INDENT}{LABEL_TOKENS} {text}");
        }
    }

    pub fn operation(&self, index: usize, operation: &Operation) {
        let line = format_operation_line(index, operation);
        if self.color {
            eprintln!("\r{INDENT}{}", line.with(status_color(operation.status)));
        } else {
            eprintln!("\r{INDENT}{line}");
        }
    }

    /// Write assistant text to stdout without a trailing newline.
    pub fn assistant_text(&self, text: &str) {
        let mut out = io::stdout().lock();
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }

    pub fn end_assistant_text(&self) {
        println!();
    }
}

fn status_color(status: OperationStatus) -> Color {
    match status {
        OperationStatus::Done => Color::Green,
        OperationStatus::Failed => Color::Red,
        OperationStatus::Rejected => Color::DarkGrey,
        OperationStatus::Analyzed | OperationStatus::AnalyzedBlocked => Color::Yellow,
        OperationStatus::Analyzing | OperationStatus::Doing => Color::Grey,
    }
}

/// `#index summary` for one operation.
pub fn format_operation_line(index: usize, operation: &Operation) -> String {
    format!("#{index} {}", operation.summary_line())
}

pub fn format_tokens(counts: &TokenCounts) -> String {
    let mut text = format!(
        "prompt:{} output:{} reasoning:{}",
        counts.prompt, counts.output, counts.reasoning
    );
    if counts.discarded > 0 {
        text.push_str(&format!(" discarded:{}", counts.discarded));
    }
    text
}

/// Command line that approves every operation still waiting on `created`.
///
/// Returns `None` when nothing waits for a decision.
pub fn approval_hint(chat_id: &str, created: u64, operations: &[Operation]) -> Option<String> {
    let waiting: Vec<String> = operations
        .iter()
        .enumerate()
        .filter(|(_, op)| op.status.awaits_approval())
        .map(|(index, _)| index.to_string())
        .collect();
    if waiting.is_empty() {
        return None;
    }
    Some(format!(
        "steward approve --chat {chat_id} --message {created} --approve {}",
        waiting.join(",")
    ))
}

/// Stateful renderer for one runtime event stream.
///
/// Pending assistant updates carry the whole message so far; only the new
/// suffix is written, and a shrinking message is treated as a restart.
#[derive(Debug)]
pub struct EventRenderer {
    renderer: Renderer,
    show_tokens: bool,
    show_reasoning: bool,
    streamed: Option<(u64, usize)>,
    last_tokens: Option<TokenCounts>,
}

impl EventRenderer {
    pub fn new(renderer: Renderer, show_tokens: bool, show_reasoning: bool) -> Self {
        Self {
            renderer,
            show_tokens,
            show_reasoning,
            streamed: None,
            last_tokens: None,
        }
    }

    pub fn renderer(&self) -> Renderer {
        self.renderer
    }

    pub fn render(&mut self, event: &RuntimeEvent) {
        match event {
            RuntimeEvent::Lifecycle(_) => {}
            RuntimeEvent::Task(task) => self.render_task(task),
            RuntimeEvent::Chat(ChatStreamEvent { envelope, .. }) => {
                self.render_chat(&envelope.chat_id, &envelope.event)
            }
            RuntimeEvent::Approval(ApprovalEvent::Resolved {
                message_created,
                resolution,
                ..
            }) => {
                self.renderer.section("approval");
                self.renderer
                    .field("message", &message_created.to_string());
                self.renderer
                    .field("executed", &join_indices(&resolution.executed));
                self.renderer
                    .field("rejected", &join_indices(&resolution.rejected));
                if !resolution.ignored.is_empty() {
                    self.renderer.warn(&format!(
                        "ignored indices: {}",
                        join_indices(&resolution.ignored)
                    ));
                }
            }
            RuntimeEvent::Mode(ModeEvent::Changed { chat_id, mode }) => {
                self.renderer.section("mode");
                self.renderer.field("chat", chat_id);
                self.renderer.field("mode", mode.as_str());
            }
            RuntimeEvent::Error(err) => {
                self.finish_stream();
                self.renderer.error(&err.message);
            }
        }
    }

    fn render_task(&mut self, event: &TaskEvent) {
        match event {
            TaskEvent::Queued { .. } | TaskEvent::Started { .. } => {}
            TaskEvent::Cancelling { task } => {
                self.finish_stream();
                self.renderer
                    .warn(&format!("cancelling task {}", task.task_id));
            }
            TaskEvent::Completed { state, .. } => {
                self.finish_stream();
                if *state == TurnState::Cancelled {
                    self.renderer.warn("turn cancelled");
                }
            }
            TaskEvent::Failed { message, .. } => {
                self.finish_stream();
                self.renderer.error(message);
            }
        }
    }

    fn render_chat(&mut self, chat_id: &str, event: &ChatEvent) {
        match event {
            ChatEvent::UserMessage { .. } => {}
            ChatEvent::PendingUpdate { message } => self.stream_message(message),
            ChatEvent::Tokens(counts) => self.last_tokens = Some(*counts),
            ChatEvent::Elapsed { ms } => {
                self.finish_stream();
                if self.show_tokens {
                    if let Some(counts) = self.last_tokens.take() {
                        self.renderer.token_usage(&counts);
                    }
                    self.renderer.field("elapsed", &format!("{ms}ms"));
                }
            }
            ChatEvent::Operations {
                created,
                operations,
                ..
            } => {
                self.finish_stream();
                self.renderer.section("operations");
                for (index, operation) in operations.iter().enumerate() {
                    self.renderer.operation(index, operation);
                }
                if let Some(hint) = approval_hint(chat_id, *created, operations) {
                    self.renderer.detail(&format!("approve with: {hint}"));
                }
            }
            ChatEvent::Status { status, detail } => {
                if *status == TurnState::AwaitingApproval {
                    self.finish_stream();
                    self.renderer.warn("operations are waiting for approval");
                }
                if let Some(detail) = detail {
                    tracing::debug!(%status, detail, "turn status");
                }
            }
            ChatEvent::Complete { message } => {
                if message.role == ChatRole::Assistant {
                    self.stream_message(message);
                    self.finish_stream();
                    if self.show_reasoning {
                        if let Some(reasoning) = message.reasoning.as_deref() {
                            self.renderer.reasoning(reasoning);
                        }
                    }
                }
            }
            ChatEvent::Error { error } => {
                self.finish_stream();
                self.renderer.error(error);
            }
        }
    }

    fn stream_message(&mut self, message: &ChatMessage) {
        let printed = match self.streamed {
            Some((created, printed)) if created == message.created => printed,
            _ => {
                self.finish_stream();
                0
            }
        };
        let printed = if message.content.len() < printed {
            self.renderer.end_assistant_text();
            self.renderer.warn("response restarted");
            0
        } else {
            printed
        };
        if let Some(suffix) = message.content.get(printed..) {
            if !suffix.is_empty() {
                self.renderer.assistant_text(suffix);
            }
        }
        self.streamed = Some((message.created, message.content.len()));
    }

    fn finish_stream(&mut self) {
        if let Some((_, printed)) = self.streamed.take() {
            if printed > 0 {
                self.renderer.end_assistant_text();
            }
        }
    }
}

fn join_indices(indices: &[usize]) -> String {
    if indices.is_empty() {
        return "-".to_string();
    }
    indices
        .iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{OperationRequest, OperationRiskKind};
    use serde_json::json;

    fn op(status: OperationStatus) -> Operation {
        let mut op = Operation::new(
            OperationRequest::new("file_write", json!({"path": "a.txt"})),
            OperationRiskKind::Create,
        );
        op.status = status;
        op
    }

    #[test]
    fn approval_hint_lists_waiting_indices() {
        let ops = vec![
            op(OperationStatus::Done),
            op(OperationStatus::Analyzed),
            op(OperationStatus::AnalyzedBlocked),
        ];
        assert_eq!(
            approval_hint("ab12-cd34-ef56-0789", 17, &ops).as_deref(),
            Some("steward approve --chat ab12-cd34-ef56-0789 --message 17 --approve 1,2")
        );
        assert!(approval_hint("c", 1, &ops[..1]).is_none());
    }

    #[test]
    fn operation_line_starts_with_index() {
        let line = format_operation_line(3, &op(OperationStatus::Analyzed));
        assert!(line.starts_with("#3 file_write (create) analyzed"), "{line}");
    }

    #[test]
    fn tokens_mention_discarded_only_when_present() {
        let mut counts = TokenCounts {
            prompt: 4,
            output: 2,
            reasoning: 1,
            discarded: 0,
        };
        assert_eq!(format_tokens(&counts), "prompt:4 output:2 reasoning:1");
        counts.discarded = 5;
        assert!(format_tokens(&counts).ends_with("discarded:5"));
    }

    #[test]
    fn stream_tracks_printed_suffix_and_restarts() {
        let mut renderer = EventRenderer::new(Renderer::new(false), false, false);
        let mut message = ChatMessage::assistant(9);
        message.content = "hello".into();
        renderer.stream_message(&message);
        assert_eq!(renderer.streamed, Some((9, 5)));
        message.content = "hi".into();
        renderer.stream_message(&message);
        assert_eq!(renderer.streamed, Some((9, 2)));
        renderer.finish_stream();
        assert!(renderer.streamed.is_none());
    }
}
