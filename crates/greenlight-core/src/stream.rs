//! Transcript Streamer
//!
//! A detached process that tails the hosted program's append-only JSONL
//! transcript and forwards whole lines downstream: in bridge mode by
//! appending them to the local bridge file (which the host tails over the
//! WebSocket), in HTTP mode by POSTing each line to the relay.
//!
//! Exactly-one discipline: a per-session PID file records
//! `"<pid> <relay_id>"` so the hook can refuse to spawn a duplicate.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{info, warn};

use crate::http;
use crate::settings;
use crate::tail::LineFollower;

/// 300 × 100 ms: how long to wait for the transcript file to appear.
const WAIT_ATTEMPTS: u32 = 300;
const WAIT_INTERVAL: Duration = Duration::from_millis(100);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// HTTP mode backfills roughly this many trailing lines at startup.
const BACKFILL_LINES: usize = 50;
const POST_TIMEOUT: Duration = Duration::from_secs(5);

pub enum StreamerMode {
    /// Append lines to the bridge file; the host forwards them.
    Bridge { path: PathBuf },
    /// POST lines straight to `<server>/transcript`.
    Http {
        server: String,
        device_id: String,
        project: String,
    },
}

pub struct StreamerOptions {
    pub transcript: PathBuf,
    pub session_id: String,
    pub relay_id: String,
    pub mode: StreamerMode,
}

/// Run the streamer until the downstream fails fatally. Maintains the
/// PID file for the whole lifetime.
pub async fn run_streamer(options: StreamerOptions) -> Result<()> {
    let pid_path = settings::streamer_pid_path(&options.session_id);
    std::fs::write(
        &pid_path,
        format!("{} {}", std::process::id(), options.relay_id),
    )
    .with_context(|| format!("write pid file {pid_path:?}"))?;

    let result = stream_loop(&options).await;
    let _ = std::fs::remove_file(&pid_path);
    result
}

async fn stream_loop(options: &StreamerOptions) -> Result<()> {
    let mut transcript = wait_for_file(&options.transcript).await?;

    match &options.mode {
        StreamerMode::Bridge { path } => {
            // Fresh transcript per session: start from the beginning,
            // no backfill seek.
            stream_to_bridge(&mut transcript, path).await
        }
        StreamerMode::Http {
            server,
            device_id,
            project,
        } => {
            seek_to_last_lines(&mut transcript, BACKFILL_LINES).await?;
            stream_to_http(
                &mut transcript,
                server,
                device_id,
                &options.session_id,
                project,
                &options.relay_id,
            )
            .await
        }
    }
}

async fn wait_for_file(path: &Path) -> Result<File> {
    for _ in 0..WAIT_ATTEMPTS {
        if let Ok(file) = File::open(path).await {
            return Ok(file);
        }
        tokio::time::sleep(WAIT_INTERVAL).await;
    }
    Err(anyhow!("transcript file never appeared: {path:?}"))
}

async fn stream_to_bridge(transcript: &mut File, bridge_path: &Path) -> Result<()> {
    let mut bridge = tokio::fs::OpenOptions::new()
        .append(true)
        .open(bridge_path)
        .await
        .with_context(|| format!("open bridge file {bridge_path:?}"))?;
    info!(bridge = ?bridge_path, "streaming transcript to bridge");

    let mut follower = LineFollower::new();
    let mut buf = vec![0u8; 8192];
    loop {
        match transcript.read(&mut buf).await {
            Ok(0) => tokio::time::sleep(POLL_INTERVAL).await,
            Ok(n) => {
                for line in follower.feed(&buf[..n]) {
                    let mut record = line;
                    record.push(b'\n');
                    if let Err(e) = bridge.write_all(&record).await {
                        warn!(error = %e, "bridge write error");
                        return Ok(());
                    }
                }
                if let Err(e) = bridge.flush().await {
                    warn!(error = %e, "bridge flush error");
                    return Ok(());
                }
            }
            Err(e) => {
                warn!(error = %e, "transcript read error");
                return Ok(());
            }
        }
    }
}

async fn stream_to_http(
    transcript: &mut File,
    server: &str,
    device_id: &str,
    session_id: &str,
    project: &str,
    relay_id: &str,
) -> Result<()> {
    info!(server, "streaming transcript over HTTP");
    let mut follower = LineFollower::new();
    let mut buf = vec![0u8; 8192];
    loop {
        match transcript.read(&mut buf).await {
            Ok(0) => tokio::time::sleep(POLL_INTERVAL).await,
            Ok(n) => {
                for line in follower.feed(&buf[..n]) {
                    if !post_line(server, device_id, session_id, project, relay_id, &line).await {
                        return Ok(()); // fatal server response
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "transcript read error");
                return Ok(());
            }
        }
    }
}

/// POST one transcript line. Returns false only on a fatal response
/// (4xx other than 429); transient failures keep the loop alive.
async fn post_line(
    server: &str,
    device_id: &str,
    session_id: &str,
    project: &str,
    relay_id: &str,
    line: &[u8],
) -> bool {
    let body = transcript_payload(device_id, session_id, project, relay_id, line);
    match http::post_raw_json(&format!("{server}/transcript"), body, POST_TIMEOUT).await {
        Ok(response) => {
            let status = response.status().as_u16();
            if (400..500).contains(&status) && status != 429 {
                warn!(status, "transcript POST rejected, giving up");
                return false;
            }
            true
        }
        Err(e) => {
            warn!(error = %e, "transcript POST error");
            true
        }
    }
}

/// Build the `/transcript` payload with the raw JSONL line embedded
/// verbatim, so the transcript entry is not double-encoded.
fn transcript_payload(
    device_id: &str,
    session_id: &str,
    project: &str,
    relay_id: &str,
    line: &[u8],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(line.len() + 128);
    body.extend_from_slice(b"{\"device_id\":");
    body.extend_from_slice(json_string(device_id).as_bytes());
    body.extend_from_slice(b",\"session_id\":");
    body.extend_from_slice(json_string(session_id).as_bytes());
    body.extend_from_slice(b",\"project\":");
    body.extend_from_slice(json_string(project).as_bytes());
    body.extend_from_slice(b",\"relay_id\":");
    body.extend_from_slice(json_string(relay_id).as_bytes());
    body.extend_from_slice(b",\"data\":");
    body.extend_from_slice(line);
    body.push(b'}');
    body
}

fn json_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

/// Position the file just after the n-th trailing newline, scanning
/// backwards from the end. A shorter file rewinds to the start.
async fn seek_to_last_lines(file: &mut File, n: usize) -> Result<()> {
    let len = file.metadata().await.context("transcript metadata")?.len();
    if len == 0 {
        return Ok(());
    }

    let mut count = 0usize;
    let mut pos = len - 1;
    let mut byte = [0u8; 1];
    while pos > 0 {
        file.seek(SeekFrom::Start(pos)).await?;
        file.read_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            count += 1;
            if count > n {
                file.seek(SeekFrom::Start(pos + 1)).await?;
                return Ok(());
            }
        }
        pos -= 1;
    }
    file.seek(SeekFrom::Start(0)).await?;
    Ok(())
}
