//! CLI argument parsing via clap.

use clap::{Parser, Subcommand};
use steward::operation::ChatMode;

/// A chat agent whose side effects wait for your approval.
#[derive(Debug, Parser)]
#[command(name = "steward", disable_version_flag = true)]
pub struct Args {
    /// Prompt to send to a new chat. Same as `steward chat --new PROMPT`.
    pub prompt: Option<String>,

    /// Path to config file (default: ./steward.toml or ~/.config/steward/steward.toml).
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<String>,

    /// Disable color output.
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,

    /// Print version and build information.
    #[arg(short = 'V', long = "version")]
    pub version: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
pub enum Command {
    /// Send a prompt to a chat.
    Chat {
        /// Chat id; defaults to the most recently updated chat.
        #[arg(long = "chat", conflicts_with = "new")]
        chat: Option<String>,
        /// Start a new chat.
        #[arg(long = "new")]
        new: bool,
        /// Mode for a newly created chat.
        #[arg(long = "mode")]
        mode: Option<ChatMode>,
        prompt: String,
    },
    /// Approve or reject operations waiting on an assistant message.
    Approve {
        #[arg(long = "chat")]
        chat: Option<String>,
        /// Message `created` id; defaults to the latest message awaiting approval.
        #[arg(long = "message")]
        message: Option<u64>,
        /// Operation indices to approve.
        #[arg(long = "approve", value_delimiter = ',')]
        approve: Vec<usize>,
        /// Operation indices to reject.
        #[arg(long = "reject", value_delimiter = ',')]
        reject: Vec<usize>,
        /// Do not ask the model to continue once every operation concluded.
        #[arg(long = "no-follow-up")]
        no_follow_up: bool,
    },
    /// Print a chat transcript.
    History {
        #[arg(long = "chat")]
        chat: Option<String>,
    },
    /// Show or change a chat's autonomy mode.
    Mode {
        #[arg(long = "chat")]
        chat: Option<String>,
        mode: Option<ChatMode>,
    },
    /// List saved chats.
    Chats,
    /// Write the default config to ~/.config/steward/steward.toml.
    Init {
        /// Overwrite an existing config file.
        #[arg(long = "force")]
        force: bool,
    },
}
