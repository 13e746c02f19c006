//! Steward: a chat agent whose side effects are gated by risk and approval.
//!
//! Every tool call the model makes becomes an [`operation::Operation`]. The
//! operation is classified by risk, checked against the chat's autonomy
//! mode, and either executed right away or parked until the user approves
//! it. Chats persist on disk so approvals can arrive in a later process.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use steward::chat::ChatStore;
//! use steward::config::load_config;
//! use steward::handlers::{Environment, HandlerRegistry};
//! use steward::model::OpenAiClient;
//! use steward::operation::Catalog;
//! use steward::orchestrator::{EventSink, Orchestrator, TurnInput, TurnSettings};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config(None)?;
//! let store = ChatStore::open(config.storage.chats_dir(), config.agent.default_mode)?;
//! let chat_id = store.create_chat(None).await?;
//! let orchestrator = Orchestrator::new(
//!     Arc::new(OpenAiClient::new(&config.model)?),
//!     Catalog::builtin(),
//!     Arc::new(HandlerRegistry::builtin()),
//!     store,
//!     Environment::in_memory(&config.storage.workspace),
//!     TurnSettings::from_config(&config.agent),
//! );
//! let mut sink = EventSink::discard(chat_id.clone());
//! let outcome = orchestrator
//!     .run(&chat_id, TurnInput::Prompt("Hello!".into()), &mut sink, None)
//!     .await;
//! println!("{}", outcome.state);
//! # Ok(())
//! # }
//! ```

pub mod build_info;
pub mod chat;
pub mod config;
pub mod error;
pub mod handlers;
pub mod model;
pub mod operation;
pub mod orchestrator;
pub mod render;
pub mod runtime;
#[cfg(test)]
pub mod testsupport;
pub mod textutil;
pub mod tokens;
pub mod types;
