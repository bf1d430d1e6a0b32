#![forbid(unsafe_code)]

//! `agent-conduit`: interactive front end for the session engine.
//!
//! Loads configuration and credentials, optionally opens the session store,
//! and runs one of the `chat`, `ask`, or `sessions` commands.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_conduit::config::{GlobalConfig, DEFAULT_LOG_FILTER};
use agent_conduit::models::message::{ContentBlock, Message};
use agent_conduit::models::session::{PermissionMode, Session};
use agent_conduit::persistence::{db, retention, SessionRepo};
use agent_conduit::registry::{EventSink, SessionEvent, SessionRegistry};
use agent_conduit::stream::BlockDelta;
use agent_conduit::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-conduit", about = "Coding-agent session engine", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the default workspace root.
    #[arg(long)]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive conversation; each input line is one exchange.
    Chat {
        /// Project directory (defaults to the workspace root).
        #[arg(long)]
        project: Option<PathBuf>,
        /// Model override.
        #[arg(long)]
        model: Option<String>,
        /// Permission mode (default, accept-edits, plan, bypass-permissions).
        #[arg(long)]
        mode: Option<PermissionMode>,
        /// Continue an earlier agent conversation.
        #[arg(long)]
        resume: Option<String>,
    },
    /// Single exchange; prints the final assistant text.
    Ask {
        /// Prompt text.
        prompt: String,
        /// Project directory (defaults to the workspace root).
        #[arg(long)]
        project: Option<PathBuf>,
        /// Permission mode for this exchange.
        #[arg(long)]
        mode: Option<PermissionMode>,
    },
    /// List stored sessions that can be resumed.
    Sessions {
        /// Restrict to one project directory.
        #[arg(long)]
        project: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;

    if let Some(ws) = args.workspace {
        let canonical = ws
            .canonicalize()
            .map_err(|err| AppError::Config(format!("invalid workspace override: {err}")))?;
        config.default_workspace_root = canonical;
    }

    config.load_credentials().await?;
    let config = Arc::new(config);
    info!(cli = %config.cli_path, "configuration loaded");

    // ── Session store ───────────────────────────────────
    let ct = CancellationToken::new();
    let (store, retention_handle) = open_store(&config, &ct).await?;

    let outcome = match args.command {
        Command::Sessions { project } => list_sessions(store.as_ref(), project.as_deref()).await,
        Command::Ask {
            prompt,
            project,
            mode,
        } => {
            let session_config = config.default_session_config(project.as_deref());
            with_registry(&config, store, false, |registry| async move {
                let session = registry.start(session_config).await?;
                let outcome = ask(&registry, &session, &prompt, mode).await;
                registry.shutdown().await;
                outcome
            })
            .await
        }
        Command::Chat {
            project,
            model,
            mode,
            resume,
        } => {
            let mut session_config = config.default_session_config(project.as_deref());
            if model.is_some() {
                session_config.model = model;
            }
            if let Some(mode) = mode {
                session_config.permission_mode = mode;
            }
            let print_complete = !session_config.include_partial_messages;
            with_registry(&config, store, print_complete, |registry| async move {
                let session = match resume {
                    Some(resume_id) => registry.resume(session_config, &resume_id).await?,
                    None => registry.start(session_config).await?,
                };
                let outcome = chat(&registry, &session).await;
                registry.shutdown().await;
                outcome
            })
            .await
        }
    };

    ct.cancel();
    if let Some(handle) = retention_handle {
        if let Err(err) = handle.await {
            warn!(%err, "retention task failed");
        }
    }
    outcome
}

async fn open_store(
    config: &GlobalConfig,
    ct: &CancellationToken,
) -> Result<(Option<SessionRepo>, Option<JoinHandle<()>>)> {
    if !config.store.enabled {
        return Ok((None, None));
    }

    let pool = Arc::new(db::connect(&config.store_path()).await?);
    let repo = SessionRepo::new(pool);
    info!(path = %config.store_path().display(), "session store connected");

    let handle =
        retention::spawn_retention_task(repo.clone(), config.store.retention_days, ct.clone());
    Ok((Some(repo), Some(handle)))
}

/// Build a registry wired to a stdout event printer and run `body` with it.
async fn with_registry<F, Fut>(
    config: &GlobalConfig,
    store: Option<SessionRepo>,
    print_complete: bool,
    body: F,
) -> Result<()>
where
    F: FnOnce(Arc<SessionRegistry>) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let (sink, rx) = EventSink::channel(config.event_buffer);
    let mut registry = SessionRegistry::from_config(config, sink);
    if let Some(repo) = store {
        registry = registry.with_store(repo);
    }
    let registry = Arc::new(registry);
    let printer = tokio::spawn(print_events(rx, print_complete));

    let outcome = body(Arc::clone(&registry)).await;

    drop(registry);
    if let Err(err) = printer.await {
        warn!(%err, "event printer task failed");
    }
    outcome
}

async fn chat(registry: &SessionRegistry, session: &Session) -> Result<()> {
    eprintln!(
        "session {} in {} (type /stop to quit)",
        session.id,
        session.config.project_path.display()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == "/stop" {
            break;
        }

        match exchange(registry, &session.id, text, None).await {
            Ok(()) => {}
            Err(err) if err.is_cancelled() => {
                eprintln!("(cancelled)");
                registry.restart(&session.id).await?;
            }
            Err(err) => {
                eprintln!("error: {err}");
                registry.restart(&session.id).await?;
            }
        }
    }
    Ok(())
}

async fn ask(
    registry: &SessionRegistry,
    session: &Session,
    prompt: &str,
    mode: Option<PermissionMode>,
) -> Result<()> {
    exchange(registry, &session.id, prompt, mode).await?;

    let text = registry
        .get(&session.id)
        .and_then(|snapshot| {
            snapshot.history.iter().rev().find_map(|message| match message {
                Message::Assistant(assistant) => Some(assistant.text()),
                _ => None,
            })
        })
        .unwrap_or_default();
    println!("{text}");
    Ok(())
}

/// One exchange that Ctrl-C cancels.
async fn exchange(
    registry: &SessionRegistry,
    session_id: &str,
    text: &str,
    mode: Option<PermissionMode>,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let send = registry.send_message_with_cancel(session_id, text, mode, cancel.clone());
    tokio::pin!(send);

    tokio::select! {
        outcome = &mut send => outcome.map(|_| ()),
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            send.await.map(|_| ())
        }
    }
}

async fn list_sessions(store: Option<&SessionRepo>, project: Option<&Path>) -> Result<()> {
    let Some(store) = store else {
        return Err(AppError::Config(
            "session store is disabled; set [store] enabled = true".into(),
        ));
    };

    let project = project
        .map(|path| {
            path.canonicalize()
                .map_err(|err| AppError::Config(format!("invalid project path: {err}")))
        })
        .transpose()?;
    let project = project.as_ref().map(|path| path.to_string_lossy().into_owned());

    for record in store.list_resumable(project.as_deref()).await? {
        println!(
            "{}\t{}\t{}\t{}\t${:.4}\t{}",
            record.resume_id.unwrap_or_default(),
            record.status,
            record.updated_at.to_rfc3339(),
            record.exchange_count,
            record.total_cost_usd,
            record.project_path.display(),
        );
    }
    Ok(())
}

async fn print_events(mut rx: mpsc::Receiver<SessionEvent>, print_complete: bool) {
    let mut stdout = std::io::stdout();
    while let Some(event) = rx.recv().await {
        let written = match event {
            SessionEvent::StreamBlockDelta {
                delta: BlockDelta::Text(text),
                ..
            } => write!(stdout, "{text}"),
            SessionEvent::StreamBlockStopped {
                block: ContentBlock::Text { .. },
                ..
            } => writeln!(stdout),
            SessionEvent::StreamBlockStopped {
                block: ContentBlock::ToolUse { name, .. },
                ..
            } => writeln!(stdout, "[tool {name}]"),
            SessionEvent::MessageReceived {
                message: Message::Assistant(assistant),
                ..
            } if print_complete => writeln!(stdout, "{}", assistant.text()),
            SessionEvent::ToolResultReceived {
                tool_name,
                is_error,
                ..
            } => {
                let status = if is_error { "failed" } else { "done" };
                writeln!(stdout, "[tool {tool_name} {status}]")
            }
            SessionEvent::ResultReceived { result, .. } => writeln!(
                stdout,
                "[{} turns, {} ms, ${:.4}]",
                result.num_turns,
                result.duration_ms,
                result.total_cost_usd.unwrap_or(0.0)
            ),
            SessionEvent::ExchangeFailed { error, .. } => writeln!(stdout, "[failed: {error}]"),
            _ => Ok(()),
        };
        if let Err(err) = written.and_then(|()| stdout.flush()) {
            error!(%err, "failed to write to stdout");
            break;
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
