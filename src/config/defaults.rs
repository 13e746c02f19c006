//! Default configuration constants.

/// Embedded default `steward.toml` written by `steward init`.
pub(super) const DEFAULT_CONFIG_TEMPLATE: &str = include_str!("../templates/steward.toml");
pub(super) const DEFAULT_API_BASE_URL: &str = "https://api.openai.com/v1";
pub(super) const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub(super) const DEFAULT_MODEL_ID: &str = "gpt-4o-mini";
pub(super) const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
pub(super) const DEFAULT_TURN_TIMEOUT_SECS: u64 = 300;
pub(super) const DEFAULT_MAX_FOLLOWUP_TURNS: u32 = 1;
pub(super) const DEFAULT_MAX_MESSAGE_CHARS: usize = 2000;

pub(super) const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a careful assistant working in the user's local environment.
You act through the provided tools. Every tool call is an operation that may
run immediately or wait for the user's approval, depending on the chat's mode.
When an operation is waiting for approval, say what you intend and stop.
Prefer reading before writing, and never guess file contents you have not read.";
