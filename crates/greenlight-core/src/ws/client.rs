//! Reconnecting WebSocket client.
//!
//! `run()` dials in a loop with exponential backoff and owns the single
//! inbound read task; any number of producers may call `send`/`send_text`
//! concurrently. One mutex guards the current connection handle, a second
//! guards the text retry queue, so draining and enqueueing are serialised.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const BINARY_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const TEXT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Saturation point for the attempt counter; prevents shift overflow.
const MAX_ATTEMPT: u32 = 30;
/// A connection that survives this long resets the backoff schedule.
const BACKOFF_RESET_AFTER: Duration = Duration::from_secs(60);
const RETRY_QUEUE_CAP: usize = 1024;
/// Delay before the synthetic Enter, so TUIs see typing rather than a paste.
const SUBMIT_DELAY: Duration = Duration::from_millis(50);

/// Callback that injects inbound bytes into the PTY master.
pub type InjectFn = Arc<dyn Fn(&[u8]) -> Result<()> + Send + Sync>;

/// Directionality of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsMode {
    /// Inject inbound frames and send PTY output.
    ReadWrite,
    /// Inject inbound frames only; binary sends are dropped.
    Read,
    /// Send PTY output only; inbound frames are ignored.
    Write,
}

pub struct WsClientOptions {
    pub url: String,
    pub token: Option<String>,
    pub mode: WsMode,
    /// Rewrite `\n` to `\r` and split off a delayed Enter on inbound frames.
    pub translate_newlines: bool,
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

pub struct WsClient {
    url: String,
    token: Option<String>,
    mode: WsMode,
    translate_newlines: bool,
    inject: InjectFn,
    /// Current live connection, replaced on every reconnect.
    conn: Mutex<Option<WsSink>>,
    /// Text frames awaiting transport, oldest first.
    queue: Mutex<VecDeque<Vec<u8>>>,
    shutdown_tx: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl WsClient {
    pub fn new(options: WsClientOptions, inject: InjectFn) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            url: options.url,
            token: options.token,
            mode: options.mode,
            translate_newlines: options.translate_newlines,
            inject,
            conn: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            shutdown_tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Connect and read in a loop, reconnecting with backoff on any error.
    /// Blocks until `close` is called.
    pub async fn run(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut attempt: u32 = 0;

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }

            let (connected_for, result) = self.connect_and_read(&mut shutdown_rx).await;
            *self.conn.lock().await = None;

            let err = match result {
                Ok(()) => return, // clean shutdown via close()
                Err(err) => err,
            };
            if self.closed.load(Ordering::SeqCst) {
                return;
            }

            if connected_for.is_some_and(|lived| lived >= BACKOFF_RESET_AFTER) {
                attempt = 0;
            }
            let delay = backoff_delay(attempt);
            attempt = (attempt + 1).min(MAX_ATTEMPT);
            warn!(error = %err, delay_ms = delay.as_millis() as u64, "ws disconnected, reconnecting");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.recv() => return,
            }
        }
    }

    /// Signal shutdown. Idempotent; unblocks the read loop and makes
    /// `run()` return.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
    }

    /// Send PTY output as a binary frame. Silently drops data while
    /// disconnected or in read-only mode; never queues (lossy by design).
    pub async fn send(&self, data: &[u8]) {
        if self.mode == WsMode::Read {
            return;
        }
        let mut conn = self.conn.lock().await;
        if let Some(sink) = conn.as_mut() {
            let _ = timeout(
                BINARY_WRITE_TIMEOUT,
                sink.send(Message::Binary(data.to_vec())),
            )
            .await;
        }
    }

    /// Send a text frame. If disconnected or the write fails, the payload
    /// joins the retry queue and is delivered after the next reconnect.
    pub async fn send_text(&self, data: Vec<u8>) {
        let mut conn = self.conn.lock().await;
        match conn.as_mut() {
            None => {
                drop(conn);
                self.enqueue(data).await;
            }
            Some(sink) => {
                let text = String::from_utf8_lossy(&data).into_owned();
                match timeout(TEXT_WRITE_TIMEOUT, sink.send(Message::Text(text))).await {
                    Ok(Ok(())) => {}
                    _ => {
                        drop(conn);
                        self.enqueue(data).await;
                    }
                }
            }
        }
    }

    /// Number of text frames currently waiting for transport.
    pub async fn queued_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    async fn enqueue(&self, data: Vec<u8>) {
        let mut queue = self.queue.lock().await;
        queue.push_back(data);
        while queue.len() > RETRY_QUEUE_CAP {
            queue.pop_front();
        }
    }

    /// One dial + read loop. Returns how long the connection lived (if it
    /// was established at all) and `Ok` only on the clean-shutdown path.
    async fn connect_and_read(
        &self,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> (Option<Duration>, Result<()>) {
        let request = match self.build_request() {
            Ok(request) => request,
            Err(err) => return (None, Err(err)),
        };

        let stream = tokio::select! {
            dialed = timeout(DIAL_TIMEOUT, connect_async(request)) => match dialed {
                Ok(Ok((stream, _response))) => stream,
                Ok(Err(err)) => return (None, Err(err.into())),
                Err(_) => return (None, Err(anyhow!("dial timed out"))),
            },
            _ = shutdown_rx.recv() => return (None, Ok(())),
        };

        let connected_at = Instant::now();
        info!(url = %self.url, "ws connected");

        let (sink, mut read) = stream.split();
        *self.conn.lock().await = Some(sink);
        self.drain_queue().await;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    if let Some(sink) = self.conn.lock().await.as_mut() {
                        let _ = sink.send(Message::Close(None)).await;
                    }
                    return (Some(connected_at.elapsed()), Ok(()));
                }
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => self.handle_inbound(text.as_bytes()).await,
                    Some(Ok(Message::Binary(data))) => self.handle_inbound(&data).await,
                    Some(Ok(Message::Close(_))) | None => {
                        return (
                            Some(connected_at.elapsed()),
                            Err(anyhow!("connection closed by server")),
                        );
                    }
                    Some(Ok(_)) => {} // ping/pong handled by tungstenite
                    Some(Err(err)) => {
                        return (Some(connected_at.elapsed()), Err(err.into()));
                    }
                },
            }
        }
    }

    /// Treat inbound bytes as keystrokes for the hosted program.
    ///
    /// The outer terminal is raw, so Enter is `\r` there; `\n` is rewritten
    /// first. The trailing `\r` (if any) is stripped and injected as a
    /// separate delayed write so TUI paste heuristics see typing + Enter.
    async fn handle_inbound(&self, data: &[u8]) {
        if data.is_empty() || self.mode == WsMode::Write {
            return;
        }

        if !self.translate_newlines {
            if let Err(err) = (self.inject)(data) {
                warn!(error = %err, "inject failed");
            }
            return;
        }

        let data: Vec<u8> = data
            .iter()
            .map(|&b| if b == b'\n' { b'\r' } else { b })
            .collect();
        let text_len = data
            .iter()
            .rposition(|&b| b != b'\r')
            .map_or(0, |pos| pos + 1);
        let needs_submit = text_len < data.len();

        if text_len > 0 {
            if let Err(err) = (self.inject)(&data[..text_len]) {
                warn!(error = %err, "inject failed");
            }
        }
        if needs_submit {
            tokio::time::sleep(SUBMIT_DELAY).await;
            if let Err(err) = (self.inject)(b"\r") {
                warn!(error = %err, "inject failed");
            }
        }
    }

    /// Deliver queued text frames in FIFO order over a fresh connection.
    /// On failure the unsent remainder goes back to the front, so frames
    /// enqueued meanwhile stay behind it.
    async fn drain_queue(&self) {
        let pending: Vec<Vec<u8>> = {
            let mut queue = self.queue.lock().await;
            queue.drain(..).collect()
        };
        if pending.is_empty() {
            return;
        }
        debug!(frames = pending.len(), "draining text retry queue");

        let mut failed_at = None;
        {
            let mut conn = self.conn.lock().await;
            match conn.as_mut() {
                None => failed_at = Some(0),
                Some(sink) => {
                    for (index, payload) in pending.iter().enumerate() {
                        let text = String::from_utf8_lossy(payload).into_owned();
                        match timeout(TEXT_WRITE_TIMEOUT, sink.send(Message::Text(text))).await {
                            Ok(Ok(())) => {}
                            _ => {
                                failed_at = Some(index);
                                break;
                            }
                        }
                    }
                }
            }
        }

        if let Some(index) = failed_at {
            let mut queue = self.queue.lock().await;
            for payload in pending[index..].iter().rev() {
                queue.push_front(payload.clone());
            }
            while queue.len() > RETRY_QUEUE_CAP {
                queue.pop_front();
            }
        }
    }

    fn build_request(&self) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
        let mut request = self.url.as_str().into_client_request()?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Ok(request)
    }
}

/// Exponential backoff with ±25% jitter: 1s, 2s, 4s, ... capped at 30s.
fn backoff_delay(attempt: u32) -> Duration {
    let base = Duration::from_secs(1u64 << attempt.min(MAX_ATTEMPT)).min(MAX_BACKOFF);
    base.mul_f64(rand::thread_rng().gen_range(0.75..=1.25))
}
