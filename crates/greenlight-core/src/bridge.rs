//! Bridge Tailer
//!
//! The streamer appends raw transcript JSONL lines to a local bridge file;
//! this task tails that file and wraps each complete line as a
//! `{"type":"transcript","data":...}` text frame on the WebSocket. The
//! bridge may not exist yet when tailing starts, and pre-existing content
//! is never re-read: the tailer seeks to the end so a stale streamer
//! restart cannot duplicate frames.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::tail::LineFollower;
use crate::ws::WsClient;

const OPEN_RETRY: Duration = Duration::from_millis(200);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Grace period in the drain pass so the streamer can flush its last lines.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Wrap a raw transcript line (itself valid JSON) as a relay text frame.
/// The line is spliced in verbatim to avoid double-encoding.
pub fn frame_transcript_line(line: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(line.len() + 32);
    frame.extend_from_slice(b"{\"type\":\"transcript\",\"data\":");
    frame.extend_from_slice(line);
    frame.push(b'}');
    frame
}

/// Tail the bridge file until `done` flips, then drain the remainder.
pub async fn tail_bridge(path: PathBuf, ws: Arc<WsClient>, mut done: watch::Receiver<bool>) {
    // Wait for the file to appear; the streamer may not have started yet.
    let mut file = loop {
        if *done.borrow() {
            return;
        }
        match File::open(&path).await {
            Ok(file) => break file,
            Err(_) => {
                tokio::select! {
                    _ = tokio::time::sleep(OPEN_RETRY) => {}
                    changed = done.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    };

    // No backfill: start from the current end of the file.
    if file.seek(SeekFrom::End(0)).await.is_err() {
        return;
    }
    debug!(path = ?path, "tailing bridge");

    let mut follower = LineFollower::new();
    let mut buf = vec![0u8; 8192];
    loop {
        if *done.borrow() {
            drain(&mut file, &mut follower, &ws, &mut buf).await;
            return;
        }
        match file.read(&mut buf).await {
            Ok(0) => {
                tokio::select! {
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    changed = done.changed() => {
                        if changed.is_err() {
                            drain(&mut file, &mut follower, &ws, &mut buf).await;
                            return;
                        }
                    }
                }
            }
            Ok(n) => {
                for line in follower.feed(&buf[..n]) {
                    ws.send_text(frame_transcript_line(&line)).await;
                }
            }
            Err(e) => {
                warn!(error = %e, "bridge read error");
                return;
            }
        }
    }
}

/// Final pass after shutdown is requested: give the streamer a moment to
/// flush, forward remaining complete lines, then the buffered partial as a
/// best-effort last frame.
async fn drain(
    file: &mut File,
    follower: &mut LineFollower,
    ws: &Arc<WsClient>,
    buf: &mut [u8],
) {
    tokio::time::sleep(DRAIN_GRACE).await;
    loop {
        match file.read(buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for line in follower.feed(&buf[..n]) {
                    ws.send_text(frame_transcript_line(&line)).await;
                }
            }
        }
    }
    if let Some(partial) = follower.take_partial() {
        ws.send_text(frame_transcript_line(&partial)).await;
    }
}
