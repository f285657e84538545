//! greenlight - remote permission prompts and session relay for Claude Code
//!
//! Subcommands:
//!   connect   host `claude` in a PTY and mirror the session to the relay
//!   hook      handle one hook event on stdin (wired into Claude's hooks)
//!   stream    detached transcript streamer (spawned by the hook)
//!   register  store the device id in ~/.greenlight/config
//!   version   print version and relay URL
//!
//! All logging goes to a file: the controlling terminal may be in raw mode.

use std::path::PathBuf;

use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use regex::Regex;
use tokio::io::AsyncReadExt;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use greenlight_core::hook::{self, HookAction, HookContext};
use greenlight_core::pty::{BridgeHandle, Relay, RelayOptions};
use greenlight_core::ws::{WsClientOptions, WsMode};
use greenlight_core::{bridge, enroll, sessions, settings, stream, Settings};

#[derive(Parser)]
#[command(name = "greenlight", disable_version_flag = true)]
#[command(about = "Remote permission prompts for Claude Code")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start Claude Code with a remote relay to the Greenlight app
    Connect {
        /// Device ID (overrides GREENLIGHT_DEVICE_ID and the config file)
        #[arg(long)]
        device_id: Option<String>,
        /// Project name (overrides GREENLIGHT_PROJECT and the config file)
        #[arg(long)]
        project: Option<String>,
        /// Resume a previous Claude Code session by conversation ID
        #[arg(long)]
        resume: Option<String>,
    },
    /// Handle Claude Code hook events (used by hooks, not called directly)
    Hook,
    /// Tail a transcript file and forward lines to the relay
    Stream {
        #[arg(long)]
        transcript: PathBuf,
        #[arg(long)]
        session_id: String,
        #[arg(long)]
        relay_id: String,
        /// Append lines to this bridge file instead of POSTing
        #[arg(long)]
        bridge: Option<PathBuf>,
        /// Relay base URL (HTTP mode)
        #[arg(long)]
        server: Option<String>,
        #[arg(long)]
        device_id: Option<String>,
        #[arg(long)]
        project: Option<String>,
    },
    /// Store the device ID in ~/.greenlight/config
    Register { device_id: String },
    /// Print version and build settings
    Version,
}

#[tokio::main]
async fn main() {
    let settings = Settings::from_env();
    init_logging();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            std::process::exit(code);
        }
    };

    let code = match cli.command {
        Command::Connect {
            device_id,
            project,
            resume,
        } => run_connect(&settings, device_id, project, resume).await,
        Command::Hook => run_hook(&settings).await,
        Command::Stream {
            transcript,
            session_id,
            relay_id,
            bridge,
            server,
            device_id,
            project,
        } => {
            run_stream(
                transcript, session_id, relay_id, bridge, server, device_id, project,
            )
            .await
        }
        Command::Register { device_id } => run_register(&device_id),
        Command::Version => {
            eprintln!("greenlight {} (relay: {})", settings.version, settings.ws_url);
            0
        }
    };
    std::process::exit(code);
}

fn init_logging() {
    let path = settings::log_path();
    let Ok(file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
    else {
        return;
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .init();
}

async fn run_connect(
    settings: &Settings,
    device_id: Option<String>,
    project: Option<String>,
    resume: Option<String>,
) -> i32 {
    if settings.ws_url.is_empty() {
        eprintln!("greenlight: no relay server URL configured (set GREENLIGHT_RELAY_URL)");
        return 1;
    }
    let Some(device_id) = settings::resolve_device_id(device_id.as_deref()) else {
        eprintln!("greenlight: device ID not configured. Run: greenlight register DEVICE_ID");
        return 1;
    };
    let Some(project) = settings::resolve_project(project.as_deref()) else {
        eprintln!("greenlight: project not configured. Run: greenlight connect --project PROJECT_NAME");
        return 1;
    };

    // A resumed conversation keeps its relay id; otherwise mint a new one.
    let relay_id = resume
        .as_deref()
        .and_then(sessions::lookup_relay_id)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let base = match settings.server_base_url() {
        Ok(base) => base,
        Err(e) => {
            eprintln!("greenlight: {e:#}");
            return 1;
        }
    };
    if let Err(e) = enroll::ensure_enrolled(&base, &device_id, &relay_id, Some(&project)).await {
        eprintln!("greenlight: session enrollment failed: {e:#}");
        return 1;
    }

    let dial_url = match settings::dial_url(&settings.ws_url, &relay_id, &project) {
        Ok(url) => url,
        Err(e) => {
            eprintln!("greenlight: {e:#}");
            return 1;
        }
    };

    // Empty rendezvous for the streamer; removed again on the way out.
    let bridge_path = settings::bridge_path(&relay_id);
    if let Err(e) = std::fs::write(&bridge_path, b"") {
        warn!(error = %e, "bridge file creation failed");
    }

    let mut args = Vec::new();
    if let Some(conversation) = &resume {
        args.push("--resume".to_string());
        args.push(conversation.clone());
    }
    let export_env = vec![
        ("GREENLIGHT_DEVICE_ID".to_string(), device_id.clone()),
        ("GREENLIGHT_SESSION_ID".to_string(), relay_id.clone()),
        ("GREENLIGHT_PROJECT".to_string(), project.clone()),
        (
            "GREENLIGHT_BRIDGE".to_string(),
            bridge_path.to_string_lossy().into_owned(),
        ),
    ];

    let relay = Relay::new(
        RelayOptions {
            command: "claude".to_string(),
            args,
            export_env,
        },
        Some(WsClientOptions {
            url: dial_url,
            token: settings.token.clone(),
            mode: WsMode::Read,
            translate_newlines: true,
        }),
    );
    let mut relay = match relay {
        Ok(relay) => relay,
        Err(e) => {
            eprintln!("greenlight: {e:#}");
            return 1;
        }
    };

    if let Some(ws) = relay.ws_client() {
        let (done_tx, done_rx) = tokio::sync::watch::channel(false);
        let task = tokio::spawn(bridge::tail_bridge(bridge_path.clone(), ws, done_rx));
        relay.set_bridge(BridgeHandle { done_tx, task });
    }

    let code = match relay.run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("greenlight: {e:#}");
            1
        }
    };
    let _ = std::fs::remove_file(&bridge_path);

    if code != 0 {
        1
    } else {
        0
    }
}

async fn run_hook(settings: &Settings) -> i32 {
    let mut input = Vec::new();
    if let Err(e) = tokio::io::stdin().read_to_end(&mut input).await {
        warn!(error = %e, "failed to read hook input");
    }

    let ctx = HookContext::from_env(settings);
    match hook::run_hook(&ctx, &input).await {
        HookAction::Emit(envelope) => {
            if let Ok(body) = serde_json::to_string(&envelope) {
                println!("{body}");
            }
        }
        HookAction::Silent => {}
    }
    // The hosted program treats a non-zero exit as its own signal; the
    // decision envelope is the only channel for verdicts.
    0
}

#[allow(clippy::too_many_arguments)]
async fn run_stream(
    transcript: PathBuf,
    session_id: String,
    relay_id: String,
    bridge: Option<PathBuf>,
    server: Option<String>,
    device_id: Option<String>,
    project: Option<String>,
) -> i32 {
    let mode = match bridge {
        Some(path) => stream::StreamerMode::Bridge { path },
        None => {
            let (Some(server), Some(device_id)) = (server, device_id) else {
                eprintln!("greenlight stream: missing required flags (--server, --device-id or --bridge)");
                return 1;
            };
            stream::StreamerMode::Http {
                server,
                device_id,
                project: project.unwrap_or_default(),
            }
        }
    };

    let options = stream::StreamerOptions {
        transcript,
        session_id,
        relay_id,
        mode,
    };
    if let Err(e) = stream::run_streamer(options).await {
        warn!(error = %e, "streamer exited");
    }
    0
}

fn run_register(device_id: &str) -> i32 {
    if !is_uuid(device_id) {
        eprintln!("greenlight: invalid device ID {device_id:?} (expected UUID format)");
        return 1;
    }
    let Some(dir) = settings::config_dir() else {
        eprintln!("greenlight: cannot determine home directory");
        return 1;
    };
    if let Err(e) = std::fs::create_dir_all(&dir) {
        eprintln!("greenlight: cannot create {}: {e}", dir.display());
        return 1;
    }
    let path = dir.join("config");
    if let Err(e) = std::fs::write(&path, format!("device_id={device_id}\n")) {
        eprintln!("greenlight: cannot write {}: {e}", path.display());
        return 1;
    }
    eprintln!("Registered device {device_id}");
    0
}

/// Hyphenated 8-4-4-4-12 hex groups; the 32-hex form is not accepted.
fn is_uuid(value: &str) -> bool {
    Regex::new(
        r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$",
    )
    .map(|re| re.is_match(value))
    .unwrap_or(false)
}
