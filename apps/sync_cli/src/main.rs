use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::Parser;
use shared::{
    domain::{ConversationId, MessageId, PendingWriteId},
    protocol::PushPayload,
};
use sync_core::{
    load_settings, HttpCredentialProvider, HttpRemoteStore, LifecycleSignal, SyncEngine,
    SyncEvent, WakeReport,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Settings file; `sync.toml` when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    access_token: Option<String>,
    #[arg(long)]
    refresh_token: Option<String>,
    /// Overrides `user_id` from the settings file.
    #[arg(long)]
    user_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Send(ConversationId, String),
    Read(ConversationId, MessageId),
    Like(MessageId, bool),
    View(MessageId),
    Show(ConversationId),
    Open(ConversationId),
    Close,
    Signal(LifecycleSignalKind),
    Push(String),
    Refresh(Option<ConversationId>),
    Retry(PendingWriteId),
    Failed,
    Status,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleSignalKind {
    Foreground,
    Background,
    Online,
    Offline,
}

fn parse_id(raw: Option<&str>, what: &str) -> Result<i64> {
    let raw = raw.with_context(|| format!("missing {what}"))?;
    raw.parse()
        .with_context(|| format!("{what} must be an integer, got '{raw}'"))
}

fn parse_command(line: &str) -> Result<Command> {
    let line = line.trim();
    let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    let mut args = rest.split_whitespace();
    let command = match word {
        "send" => {
            let conversation = ConversationId(parse_id(args.next(), "conversation id")?);
            let (_, text) = rest.split_once(' ').unwrap_or((rest, ""));
            if text.trim().is_empty() {
                bail!("usage: send <conversation> <text>");
            }
            Command::Send(conversation, text.trim().to_string())
        }
        "read" => Command::Read(
            ConversationId(parse_id(args.next(), "conversation id")?),
            MessageId(parse_id(args.next(), "message id")?),
        ),
        "like" | "unlike" => Command::Like(
            MessageId(parse_id(args.next(), "message id")?),
            word == "like",
        ),
        "view" => Command::View(MessageId(parse_id(args.next(), "message id")?)),
        "show" => Command::Show(ConversationId(parse_id(args.next(), "conversation id")?)),
        "open" => Command::Open(ConversationId(parse_id(args.next(), "conversation id")?)),
        "close" => Command::Close,
        "fg" => Command::Signal(LifecycleSignalKind::Foreground),
        "bg" => Command::Signal(LifecycleSignalKind::Background),
        "online" => Command::Signal(LifecycleSignalKind::Online),
        "offline" => Command::Signal(LifecycleSignalKind::Offline),
        "push" => {
            if rest.is_empty() {
                bail!("usage: push <json payload>");
            }
            Command::Push(rest.to_string())
        }
        "refresh" => Command::Refresh(match args.next() {
            Some(raw) => Some(ConversationId(parse_id(Some(raw), "conversation id")?)),
            None => None,
        }),
        "retry" => Command::Retry(PendingWriteId(parse_id(args.next(), "write id")?)),
        "failed" => Command::Failed,
        "status" => Command::Status,
        "quit" | "exit" => Command::Quit,
        other => bail!("unknown command '{other}'"),
    };
    Ok(command)
}

fn print_report(report: &WakeReport) {
    println!(
        "wake {:?}{}: auth={} rebuild={} resync={} drain={} unread={}",
        report.reason,
        if report.coalesced { " (coalesced)" } else { "" },
        report.auth,
        report.rebuild,
        report.resync,
        report.drain,
        report.unread,
    );
    if !report.follow_ups.is_empty() {
        println!("  follow-ups: {:?}", report.follow_ups);
    }
}

async fn run_command(engine: &Arc<SyncEngine>, command: Command) -> Result<bool> {
    match command {
        Command::Send(conversation, text) => {
            let message = engine.send_message(conversation, &text).await?;
            println!("queued local_id={} ({:?})", message.local_id, message.delivery_status);
        }
        Command::Read(conversation, message) => {
            let applied = engine.mark_read(conversation, message).await?;
            println!("read marker {}", if applied { "advanced" } else { "unchanged" });
        }
        Command::Like(message, liked) => {
            let id = engine.toggle_like(message, liked).await?;
            println!("queued write {id}");
        }
        Command::View(message) => {
            let id = engine.increment_view(message).await?;
            println!("queued write {id}");
        }
        Command::Show(conversation) => {
            for message in engine.messages(conversation, 100).await? {
                let id = message
                    .server_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "[{}] #{id} {} ({:?}): {}",
                    message.created_at.format("%H:%M:%S"),
                    message.sender_id,
                    message.delivery_status,
                    message.content
                );
            }
            let members: Vec<String> = engine
                .members(conversation)
                .await?
                .iter()
                .map(ToString::to_string)
                .collect();
            println!(
                "{} stored, unread {}, members [{}]",
                engine.message_count(conversation).await?,
                engine.unread_count(conversation).await?,
                members.join(", ")
            );
        }
        Command::Open(conversation) => engine.open_conversation(conversation),
        Command::Close => engine.close_conversation(),
        Command::Signal(kind) => {
            let signal = match kind {
                LifecycleSignalKind::Foreground => LifecycleSignal::Foreground,
                LifecycleSignalKind::Background => LifecycleSignal::Background,
                LifecycleSignalKind::Online => LifecycleSignal::NetworkOnline,
                LifecycleSignalKind::Offline => LifecycleSignal::NetworkOffline,
            };
            if let Some(report) = engine.handle_signal(signal).await {
                print_report(&report);
            }
        }
        Command::Push(raw) => {
            let payload: PushPayload =
                serde_json::from_str(&raw).context("push payload must be a JSON object")?;
            let signal = LifecycleSignal::PushWake {
                hint: payload.conversation_id,
                payload: Some(payload),
            };
            if let Some(report) = engine.handle_signal(signal).await {
                print_report(&report);
            }
        }
        Command::Refresh(hint) => print_report(&engine.refresh(hint).await),
        Command::Retry(id) => {
            let requeued = engine.retry_failed(id).await?;
            println!("write {id} {}", if requeued { "requeued" } else { "not failed" });
        }
        Command::Failed => {
            for write in engine.failed_writes().await? {
                println!(
                    "{} {:?} after {} attempts: {}",
                    write.id,
                    write.kind,
                    write.retry_count,
                    write.last_error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        Command::Status => {
            let indicator = *engine.outbox_indicator().borrow();
            println!(
                "user={} connection={:?} pending={} failed={} writes_blocked={}",
                engine.user_id(),
                engine.status(),
                indicator.pending,
                indicator.failed,
                engine.writes_blocked()
            );
        }
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

fn spawn_event_printer(engine: &SyncEngine) {
    let mut events = engine.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SyncEvent::MessageReceived(message)) => {
                    println!("<< {} in {}: {}", message.sender_id, message.conversation_id, message.content);
                }
                Ok(SyncEvent::DeliveryChanged {
                    correlation_key,
                    status,
                    server_id,
                }) => {
                    println!("-- {correlation_key} is {status:?} (server id {server_id:?})");
                }
                Ok(SyncEvent::Banner { class, message }) => println!("!! {class:?}: {message}"),
                Ok(SyncEvent::BannerCleared { class }) => println!("!! {class:?} cleared"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "cli: event printer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn spawn_writes_blocked_printer(engine: &SyncEngine) {
    let mut blocked = engine.subscribe_writes_blocked();
    tokio::spawn(async move {
        while blocked.changed().await.is_ok() {
            if *blocked.borrow_and_update() {
                println!("!! writes paused until sign-in is refreshed");
            } else {
                println!("!! writes resumed");
            }
        }
    });
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = load_settings(args.config.as_deref())?;
    if let Some(user_id) = args.user_id {
        settings.user_id = user_id;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_filter.clone())),
        )
        .init();

    let credentials = Arc::new(HttpCredentialProvider::new(
        &settings.server_url,
        args.access_token,
        args.refresh_token,
    )?);
    let remote = Arc::new(HttpRemoteStore::new(&settings.server_url, credentials.clone())?);
    let engine = SyncEngine::start(&settings, remote, credentials).await?;
    info!(
        server_url = %settings.server_url,
        database_url = %settings.database_url,
        "cli: engine started"
    );

    spawn_event_printer(&engine);
    spawn_writes_blocked_printer(&engine);
    print_report(&engine.cold_start().await);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line) {
            Ok(command) => match run_command(&engine, command).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => println!("error: {err:#}"),
            },
            Err(err) => println!("error: {err:#}"),
        }
    }

    engine.shutdown().await;
    Ok(())
}
