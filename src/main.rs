//! CLI entry point for steward.

mod cli;

use clap::Parser;
use std::sync::Arc;
use steward::build_info::cli_version_text;
use steward::chat::{ChatRole, ChatStore};
use steward::config::{default_global_config_path, initialize_config_at, load_config, Config, ConfigInitResult};
use steward::handlers::records::RecordStore;
use steward::handlers::{Environment, HandlerRegistry, Workspace};
use steward::model::openai::OpenAiClient;
use steward::operation::{Catalog, ChatMode, OutputStash};
use steward::orchestrator::{Orchestrator, TurnSettings, TurnState};
use steward::render::{EventRenderer, Renderer};
use steward::runtime::{spawn_runtime, RuntimeCommand, RuntimeEvent, TaskEvent};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let args = cli::Args::parse();
    if args.version {
        println!("{}", cli_version_text());
        return;
    }
    init_tracing();

    if let Some(cli::Command::Init { force }) = args.command {
        std::process::exit(run_init(force, !args.no_color));
    }

    let mut config = match load_config(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };
    if args.no_color {
        config.display.color = false;
    }
    let renderer = Renderer::new(config.display.color);

    let store = match ChatStore::open(config.storage.chats_dir(), config.agent.default_mode) {
        Ok(store) => store,
        Err(e) => fail(&renderer, &format!("failed to open chat store: {e}")),
    };

    let code = match args.command {
        None => match args.prompt {
            Some(prompt) => run_chat(&config, store, None, true, None, prompt).await,
            None => {
                renderer.error("nothing to do; pass a prompt or a subcommand (see --help)");
                2
            }
        },
        Some(cli::Command::Chat {
            chat,
            new,
            mode,
            prompt,
        }) => run_chat(&config, store, chat, new, mode, prompt).await,
        Some(cli::Command::Approve {
            chat,
            message,
            approve,
            reject,
            no_follow_up,
        }) => {
            run_approve(&config, store, chat, message, approve, reject, !no_follow_up).await
        }
        Some(cli::Command::History { chat }) => run_history(&renderer, &store, chat),
        Some(cli::Command::Mode { chat, mode }) => run_mode(&renderer, &store, chat, mode).await,
        Some(cli::Command::Chats) => run_chats(&renderer, &store),
        Some(cli::Command::Init { .. }) => 0,
    };
    std::process::exit(code);
}

/// Install the stderr subscriber. `STEWARD_LOG` takes an `EnvFilter` directive.
fn init_tracing() {
    let filter = EnvFilter::try_from_env("STEWARD_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn fail(renderer: &Renderer, msg: &str) -> ! {
    renderer.error(msg);
    std::process::exit(1);
}

fn run_init(force: bool, color: bool) -> i32 {
    let renderer = Renderer::new(color);
    let Some(path) = default_global_config_path() else {
        renderer.error("could not determine a config directory");
        return 1;
    };
    match initialize_config_at(&path, force) {
        Ok(ConfigInitResult::Created { path }) => {
            renderer.field("created", &path.display().to_string());
            0
        }
        Ok(ConfigInitResult::Overwritten { path }) => {
            renderer.field("overwritten", &path.display().to_string());
            0
        }
        Ok(ConfigInitResult::AlreadyInitialized { path }) => {
            renderer.warn(&format!(
                "{} already exists; pass --force to overwrite",
                path.display()
            ));
            0
        }
        Err(e) => {
            renderer.error(&format!("failed to write config: {e}"));
            1
        }
    }
}

fn build_orchestrator(config: &Config, store: ChatStore) -> Result<Orchestrator, String> {
    let client = OpenAiClient::new(&config.model).map_err(|e| format!("model client: {e}"))?;
    let records = RecordStore::open(config.storage.records_path())
        .map_err(|e| format!("failed to open records: {e}"))?;
    let stash = OutputStash::open(config.storage.stash_path())
        .map_err(|e| format!("failed to open output stash: {e}"))?;
    let env = Environment::new(Workspace::new(config.storage.workspace.clone()), records, stash);
    Ok(Orchestrator::new(
        Arc::new(client),
        Catalog::builtin(),
        Arc::new(HandlerRegistry::builtin()),
        store,
        env,
        TurnSettings::from_config(&config.agent),
    ))
}

/// Pick the chat a command applies to: explicit id, else the latest chat.
fn resolve_chat(store: &ChatStore, chat: Option<String>) -> Result<String, String> {
    match chat {
        Some(id) if store.exists(&id) => Ok(id),
        Some(id) => Err(format!("no chat with id `{id}`")),
        None => store
            .resolve_last()
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "no saved chats yet".to_string()),
    }
}

async fn run_chat(
    config: &Config,
    store: ChatStore,
    chat: Option<String>,
    new: bool,
    mode: Option<ChatMode>,
    prompt: String,
) -> i32 {
    let renderer = Renderer::new(config.display.color);
    let chat_id = if new || (chat.is_none() && matches!(store.resolve_last(), Ok(None))) {
        match store.create_chat(mode).await {
            Ok(id) => {
                renderer.field("chat", &id);
                id
            }
            Err(e) => fail(&renderer, &format!("failed to create chat: {e}")),
        }
    } else {
        match resolve_chat(&store, chat) {
            Ok(id) => id,
            Err(msg) => fail(&renderer, &msg),
        }
    };
    let command = RuntimeCommand::SubmitPrompt { chat_id, prompt };
    drive_runtime(config, store, command).await
}

async fn run_approve(
    config: &Config,
    store: ChatStore,
    chat: Option<String>,
    message: Option<u64>,
    approved: Vec<usize>,
    rejected: Vec<usize>,
    follow_up: bool,
) -> i32 {
    let renderer = Renderer::new(config.display.color);
    if approved.is_empty() && rejected.is_empty() {
        fail(&renderer, "nothing to resolve; pass --approve and/or --reject");
    }
    let chat_id = match resolve_chat(&store, chat) {
        Ok(id) => id,
        Err(msg) => fail(&renderer, &msg),
    };
    let message_created = match message {
        Some(created) => created,
        None => match store.load(&chat_id) {
            Ok(data) => match data.latest_awaiting() {
                Some(message) => message.created,
                None => fail(&renderer, "no message in this chat is waiting for approval"),
            },
            Err(e) => fail(&renderer, &e.to_string()),
        },
    };
    let command = RuntimeCommand::Resolve {
        chat_id,
        message_created,
        approved,
        rejected,
        follow_up,
    };
    drive_runtime(config, store, command).await
}

/// Submit one command to a fresh runtime and render until its task ends.
async fn drive_runtime(config: &Config, store: ChatStore, command: RuntimeCommand) -> i32 {
    let renderer = Renderer::new(config.display.color);
    let orchestrator = match build_orchestrator(config, store) {
        Ok(o) => Arc::new(o),
        Err(msg) => fail(&renderer, &msg),
    };
    let (handle, mut events) = spawn_runtime(orchestrator);
    if let Err(msg) = handle.send(command).await {
        fail(&renderer, &msg);
    }

    let mut view = EventRenderer::new(
        renderer,
        config.display.show_tokens,
        config.display.show_reasoning,
    );
    let mut task_id = None;
    let mut cancel_sent = false;
    let mut code = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !cancel_sent => {
                cancel_sent = true;
                match task_id {
                    Some(task_id) => {
                        let _ = handle.send(RuntimeCommand::CancelTask { task_id }).await;
                    }
                    None => {
                        code = 130;
                        break;
                    }
                }
            }
            envelope = events.recv() => {
                let Some(envelope) = envelope else { break };
                view.render(&envelope.event);
                match &envelope.event {
                    RuntimeEvent::Task(TaskEvent::Queued { task, .. }) => task_id = Some(task.task_id),
                    RuntimeEvent::Task(TaskEvent::Completed { state, .. }) => {
                        code = match state {
                            TurnState::Errored => 1,
                            TurnState::Cancelled => 130,
                            _ => 0,
                        };
                        break;
                    }
                    RuntimeEvent::Task(TaskEvent::Failed { .. }) => {
                        code = 1;
                        break;
                    }
                    RuntimeEvent::Error(err) if err.task.is_none() && task_id.is_none() => {
                        code = 1;
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
    let _ = handle.send(RuntimeCommand::Shutdown).await;
    code
}

fn run_history(renderer: &Renderer, store: &ChatStore, chat: Option<String>) -> i32 {
    let chat_id = match resolve_chat(store, chat) {
        Ok(id) => id,
        Err(msg) => fail(renderer, &msg),
    };
    let data = match store.load(&chat_id) {
        Ok(data) => data,
        Err(e) => fail(renderer, &e.to_string()),
    };
    renderer.field("chat", &data.id);
    renderer.field("mode", data.mode.as_str());
    for message in &data.messages {
        let role = match message.role {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        };
        renderer.section(&format!("{role} {}", message.created));
        if !message.content.is_empty() {
            println!("{}", message.content);
        }
        for (index, operation) in message.operations().iter().enumerate() {
            renderer.operation(index, operation);
        }
    }
    0
}

async fn run_mode(
    renderer: &Renderer,
    store: &ChatStore,
    chat: Option<String>,
    mode: Option<ChatMode>,
) -> i32 {
    let chat_id = match resolve_chat(store, chat) {
        Ok(id) => id,
        Err(msg) => fail(renderer, &msg),
    };
    if let Some(mode) = mode {
        if let Err(e) = store.set_mode(&chat_id, mode).await {
            fail(renderer, &format!("failed to set mode: {e}"));
        }
    }
    match store.load(&chat_id) {
        Ok(data) => {
            renderer.field("chat", &chat_id);
            renderer.field("mode", data.mode.as_str());
            0
        }
        Err(e) => fail(renderer, &e.to_string()),
    }
}

fn run_chats(renderer: &Renderer, store: &ChatStore) -> i32 {
    let chats = match store.list() {
        Ok(chats) => chats,
        Err(e) => fail(renderer, &e.to_string()),
    };
    if chats.is_empty() {
        renderer.detail("no saved chats");
        return 0;
    }
    for chat in chats {
        println!("{}  {:<6}  {} messages", chat.id, chat.mode.as_str(), chat.messages);
    }
    0
}
