mod command;
mod logging;

use anyhow::{Context, Result};
use clap::Parser;
use command::{parse_line, Command, HELP};
use hdc_core::{ChatWindowState, ToastSeverity};
use hdc_storage::{MemorySnapshotStore, SnapshotStore, SqliteSnapshotStore};
use hdc_workspace::realtime::parse_channel_url;
use hdc_workspace::{
    ChannelConfig, ConnectionManager, DefaultTabResolver, DeskConfig, HttpEscalationClient,
    Notifier, ToastEvent, ToastSubscription, Workspace,
};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};

type Desk = Workspace<Box<dyn SnapshotStore>, HttpEscalationClient, ConnectionManager>;

#[derive(Parser, Debug)]
#[command(name = "hdc-desk", about = "Agent workspace for the helpdesk cockpit")]
struct Args {
    /// TOML config file. Defaults to ~/.config/hdc/desk.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    agent_id: Option<String>,
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    channel_url: Option<String>,
    #[arg(long)]
    snapshot_db: Option<PathBuf>,
    #[arg(long)]
    log_dir: Option<PathBuf>,
    #[arg(long)]
    log_stdout: bool,
    /// Keep tabs in memory only.
    #[arg(long)]
    ephemeral: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    let _log_guard = logging::init_logging(&config);

    let store = open_store(&config, args.ephemeral);
    let api = HttpEscalationClient::new(
        &config.api_base_url,
        Some(config.lookup_timeout()),
        config.api_token.as_deref(),
    )
    .context("building escalation client")?;
    let (mut link, mut inbound) = ConnectionManager::new(ChannelConfig {
        url: parse_channel_url(&config.channel_url)?,
        agent_id: config.agent_id.clone(),
        max_frame_bytes: config.max_frame_bytes,
        max_backoff: config.reconnect_cap(),
    });
    link.connect()?;

    let notifier = Notifier::new(config.toast_ttl_ms);
    let mut desk: Desk = Workspace::new(config.agent_id.clone(), store, api, link, notifier);
    let report = desk.init(&DefaultTabResolver).await;
    if report.corrupt {
        println!("saved tabs were unreadable; starting from the overview");
    }
    for tab_id in &report.dropped {
        println!("dropped stale tab {tab_id}");
    }

    let toast_task = tokio::spawn(print_toasts(desk.subscribe_toasts()));
    let chat_task = tokio::spawn(print_chat(desk.watch_chat()));

    println!("{HELP}");
    print_tabs(&desk);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            msg = inbound.recv() => {
                let Some(msg) = msg else { break };
                desk.handle_channel(msg).await;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => match parse_line(&line) {
                        Ok(Some(Command::Quit)) => break,
                        Ok(Some(command)) => run_command(&mut desk, command).await,
                        Ok(None) => {}
                        Err(err) => println!("{err}"),
                    },
                    Ok(None) => break,
                    Err(err) => {
                        warn!(event = "stdin_read_error", error = %err);
                        break;
                    }
                }
            }
            _ = &mut ctrl_c => break,
        }
    }

    desk.dispose().await;
    toast_task.abort();
    chat_task.abort();
    info!(event = "desk_exit");
    Ok(())
}

fn load_config(args: &Args) -> Result<DeskConfig> {
    let mut config = DeskConfig::load(args.config.as_deref())?;
    config.apply_env()?;
    if let Some(agent_id) = &args.agent_id {
        config.agent_id = agent_id.clone();
    }
    if let Some(api_url) = &args.api_url {
        config.api_base_url = api_url.clone();
    }
    if let Some(channel_url) = &args.channel_url {
        config.channel_url = channel_url.clone();
    }
    if let Some(snapshot_db) = &args.snapshot_db {
        config.snapshot_db = snapshot_db.clone();
    }
    if let Some(log_dir) = &args.log_dir {
        config.log_dir = log_dir.clone();
    }
    if args.log_stdout {
        config.log_stdout = true;
    }
    config.validate()?;
    Ok(config)
}

fn open_store(config: &DeskConfig, ephemeral: bool) -> Box<dyn SnapshotStore> {
    if ephemeral {
        return Box::new(MemorySnapshotStore::new());
    }
    match SqliteSnapshotStore::open(&config.snapshot_db) {
        Ok(store) => Box::new(store),
        Err(err) => {
            warn!(
                event = "snapshot_store_unavailable",
                path = %config.snapshot_db.display(),
                error = %err
            );
            Box::new(MemorySnapshotStore::new())
        }
    }
}

async fn run_command(desk: &mut Desk, command: Command) {
    let outcome = match command {
        Command::Open {
            escalation_id,
            case_number,
        } => desk.open_case(&escalation_id, &case_number).map(|_| ()),
        Command::Close(id) => desk.close_tab(&id).map(|closed| {
            if !closed {
                println!("tab {id} cannot be closed");
            }
        }),
        Command::CloseOthers(id) => desk.close_other_tabs(&id).map(|_| ()),
        Command::CloseAll => desk.close_all_tabs(),
        Command::Activate(id) => desk.activate_tab(&id).map(|found| {
            if !found {
                println!("no tab {id}");
            }
        }),
        Command::Accept(escalation_id) => desk.accept_chat(&escalation_id).await.map(|_| ()),
        Command::Dismiss(escalation_id) => {
            if !desk.dismiss_chat(&escalation_id) {
                println!("no pending chat {escalation_id}");
            }
            Ok(())
        }
        Command::End => {
            if desk.end_chat().await.is_none() {
                println!("no live chat");
            }
            Ok(())
        }
        Command::Status {
            escalation_id,
            status,
        } => desk
            .set_case_status(&escalation_id, status)
            .await
            .map(|_| ()),
        Command::Tabs => Ok(()),
        Command::Pending => {
            for pending in desk.pending() {
                println!(
                    "  {} #{} {}: {}",
                    pending.escalation_id,
                    pending.summary.case_number,
                    pending.summary.customer_name,
                    pending.summary.concern
                );
            }
            return;
        }
        Command::Help => {
            println!("{HELP}");
            return;
        }
        Command::Quit => return,
    };
    match outcome {
        Ok(()) => print_tabs(desk),
        Err(err) => println!("error: {err}"),
    }
}

fn print_tabs(desk: &Desk) {
    let active = desk.active_tab_id();
    let live = desk.live_tab_id();
    for tab in desk.tabs() {
        let marker = if Some(tab.id.as_str()) == active { '*' } else { ' ' };
        let live_marker = if live.as_deref() == Some(tab.id.as_str()) {
            " (live)"
        } else {
            ""
        };
        println!("{marker} {:<24} {}{live_marker}", tab.id, tab.title);
    }
}

async fn print_toasts(mut toasts: ToastSubscription) {
    while let Some(event) = toasts.recv().await {
        if let ToastEvent::Shown(toast) = event {
            let label = match toast.severity {
                ToastSeverity::Success => "ok",
                ToastSeverity::Error => "error",
                ToastSeverity::Info => "info",
                ToastSeverity::Warning => "warn",
            };
            println!("[{label}] {}", toast.message);
        }
    }
}

async fn print_chat(mut chat: watch::Receiver<ChatWindowState>) {
    while chat.changed().await.is_ok() {
        let state = chat.borrow_and_update().clone();
        match state.escalation_id.as_deref() {
            Some(escalation_id) => println!(
                "chat {escalation_id}: {} ({})",
                state.phase(),
                state.customer_name.as_deref().unwrap_or("unknown customer")
            ),
            None => println!("chat closed"),
        }
    }
}
