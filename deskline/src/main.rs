//! Line-oriented customer-service chat client.
//!
//! Signs in as an end user or an admin, keeps the realtime channel open,
//! and reads commands from stdin. Configuration via CLI flags, environment
//! variables, or config file (`~/.config/deskline/config.toml`).
//!
//! ```bash
//! # End user against a local server
//! cargo run --bin deskline -- --api-base http://127.0.0.1:5000/api --user u1
//!
//! # Admin console
//! cargo run --bin deskline -- --user a1 --admin
//! ```
//!
//! Lines starting with `/` are commands (`/help` lists them); any other
//! line is sent to the open session.

use std::io;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use deskline::config::{CliArgs, ClientConfig};
use deskline::runtime::{ChatRuntime, SessionController};
use deskline::session::{SessionEvent, Surface};
use deskline_proto::message::SessionId;

const HELP: &str = "\
commands:
  /new            open a new session (users only)
  /list           list sessions
  /open <id>      open a session
  /reload         reload the open session
  /read           mark the open session as read
  /status         show the connection status
  /quit           exit
anything else is sent to the open session";

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    // Logs go to a file so they do not interleave with the chat output.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!(surface = %config.surface, "deskline starting");

    let Some(identity) = config.identity() else {
        eprintln!("error: no account configured (use --user or DESKLINE_USER)");
        std::process::exit(2);
    };
    let runtime_config = match config.to_runtime_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
    };
    let runtime = match ChatRuntime::new(runtime_config) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
    };

    if let Err(e) = runtime.start(identity).await {
        println!("! realtime channel unavailable ({e}), using REST only");
    }

    let (controller, events) = runtime.controller(config.surface);
    if let Some(id) = config.session_id() {
        open(&controller, &id).await;
    }
    println!("{HELP}");

    let result = run(&runtime, &controller, events).await;
    runtime.shutdown().await;
    tracing::info!("deskline exiting");
    result
}

/// Initialize file-based logging, returning the guard that flushes on drop.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("deskline.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Main loop: stdin commands, session events, and channel status changes.
async fn run(
    runtime: &ChatRuntime,
    controller: &Arc<SessionController>,
    mut events: tokio::sync::mpsc::Receiver<SessionEvent>,
) -> io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut status = runtime.connection().subscribe_status();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_line(runtime, controller, line.trim()).await {
                    break;
                }
            }
            Some(event) = events.recv() => print_event(&event),
            Ok(()) = status.changed() => {
                let s = *status.borrow_and_update();
                if s.exhausted {
                    println!("! connection lost, reconnection gave up");
                } else if let Some(delay) = s.retry_delay {
                    println!("! {} (retry {} in {:?})", s.state, s.attempts, delay);
                } else {
                    println!("! {}", s.state);
                }
            }
        }
    }
    Ok(())
}

/// Handles one input line; returns `false` to quit.
async fn handle_line(runtime: &ChatRuntime, controller: &Arc<SessionController>, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }
    let Some(command) = line.strip_prefix('/') else {
        send(controller, line).await;
        return true;
    };

    let (name, arg) = command.split_once(' ').unwrap_or((command, ""));
    match name {
        "quit" | "q" => return false,
        "help" => println!("{HELP}"),
        "status" => {
            let s = runtime.connection().status();
            println!(
                "channel {} (attempts {}, queued {})",
                s.state,
                s.attempts,
                runtime.queue().len()
            );
        }
        "new" => {
            if controller.surface() != Surface::User {
                println!("! only users can open sessions");
            } else {
                match runtime.api().create_session().await {
                    Ok(session) => open(controller, &session.id).await,
                    Err(e) => println!("! {e}"),
                }
            }
        }
        "list" => match controller.refresh_sessions().await {
            Ok(summaries) if summaries.is_empty() => println!("(no sessions)"),
            Ok(summaries) => {
                for s in summaries {
                    let last = s.last_message.map(|m| m.content).unwrap_or_default();
                    println!("{}  {:?}  unread {}  {last}", s.id, s.status, s.unread_count);
                }
            }
            Err(e) => println!("! {e}"),
        },
        "open" if !arg.trim().is_empty() => open(controller, &SessionId::new(arg.trim())).await,
        "reload" => {
            if let Err(e) = controller.reload().await {
                println!("! {e}");
            }
        }
        "read" => {
            if let Err(e) = controller.mark_read().await {
                println!("! {e}");
            }
        }
        _ => println!("! unknown command, try /help"),
    }
    true
}

async fn open(controller: &SessionController, id: &SessionId) {
    if let Err(e) = controller.open_session(id).await {
        println!("! {e}");
        return;
    }
    for message in controller.messages() {
        println!("[{}] {}: {}", message.created_at.format("%H:%M"), message.sender, message.content);
    }
}

async fn send(controller: &SessionController, text: &str) {
    let Some(session_id) = controller.open_session_id() else {
        println!("! no open session (try /new or /open <id>)");
        return;
    };
    if let Err(failure) = controller.send_message(&session_id, text).await {
        println!("! {failure}");
        println!("! not sent: {}", failure.content);
    }
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::SessionLoaded { session_id } => println!("-- session {session_id} --"),
        SessionEvent::MessageAppended { message, .. } => println!(
            "[{}] {}: {}",
            message.created_at.format("%H:%M"),
            message.sender,
            message.content
        ),
        SessionEvent::UnreadChanged {
            session_id,
            unread_count,
        } if *unread_count > 0 => println!("* {unread_count} unread in {session_id}"),
        SessionEvent::ReadReceiptDue { .. } => println!("* new reply (/read to mark read)"),
        SessionEvent::DeliveryError { error, .. } => println!("! delivery error: {error}"),
        SessionEvent::MessageRolledBack { .. }
        | SessionEvent::MessageReconciled { .. }
        | SessionEvent::UnreadChanged { .. } => {}
    }
}
