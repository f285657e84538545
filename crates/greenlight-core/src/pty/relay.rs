//! PTY Relay
//!
//! Owns the child process lifecycle and the I/O fabric around it: master →
//! local stdout (and WebSocket binary send), local stdin → master with
//! Ctrl-Z suspend handling, window-resize and signal forwarding. Every
//! write to the master passes through a single mutex, so bytes from local
//! stdin and bytes injected from the WebSocket never interleave within one
//! write.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::unix::AsyncFd;
use tokio::io::AsyncReadExt;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::pty::transport::{self, RawModeGuard};
use crate::settings::ENV_PREFIX;
use crate::ws::{WsClient, WsClientOptions};

/// Ctrl-Z in the local input stream triggers shell job-control suspend.
const SUSPEND_BYTE: u8 = 0x1a;
/// How long to wait for the output reader to drain after the child exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct RelayOptions {
    pub command: String,
    pub args: Vec<String>,
    /// Added to the child environment after the `GREENLIGHT_*` scrub.
    pub export_env: Vec<(String, String)>,
}

/// Bridge tailer handle: the done signal plus the task to await for drain.
pub struct BridgeHandle {
    pub done_tx: watch::Sender<bool>,
    pub task: tokio::task::JoinHandle<()>,
}

/// Thread-safe writer to the PTY master. All writes acquire one lock.
#[derive(Clone)]
pub struct PtyWriter {
    master: Arc<OwnedFd>,
    lock: Arc<std::sync::Mutex<()>>,
}

impl PtyWriter {
    /// Write the whole buffer as one serialised unit.
    pub fn write_all(&self, data: &[u8]) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut written = 0;
        while written < data.len() {
            match nix::unistd::write(&*self.master, &data[written..]) {
                Ok(n) => written += n,
                Err(nix::errno::Errno::EAGAIN) => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(e).context("pty master write"),
            }
        }
        Ok(())
    }
}

/// Wrapper so `AsyncFd` can share the master with the writer.
struct MasterFd(Arc<OwnedFd>);

impl AsRawFd for MasterFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

pub struct Relay {
    options: RelayOptions,
    master: Arc<OwnedFd>,
    slave: Option<OwnedFd>,
    writer: PtyWriter,
    ws: Option<Arc<WsClient>>,
    bridge: Option<BridgeHandle>,
}

impl Relay {
    /// Open the PTY pair and, if configured, wire a WebSocket client whose
    /// inject callback writes to the master through the shared lock.
    pub fn new(options: RelayOptions, ws: Option<WsClientOptions>) -> Result<Self> {
        let pair = transport::open_pty()?;
        let master = Arc::new(pair.master);
        let writer = PtyWriter {
            master: master.clone(),
            lock: Arc::new(std::sync::Mutex::new(())),
        };

        let ws = ws.map(|options| {
            let injector = writer.clone();
            Arc::new(WsClient::new(
                options,
                Arc::new(move |data: &[u8]| injector.write_all(data)),
            ))
        });

        Ok(Self {
            options,
            master,
            slave: Some(pair.slave),
            writer,
            ws,
            bridge: None,
        })
    }

    pub fn ws_client(&self) -> Option<Arc<WsClient>> {
        self.ws.clone()
    }

    /// Thread-safe injection entry point.
    pub fn injector(&self) -> PtyWriter {
        self.writer.clone()
    }

    /// Attach the bridge tailer so shutdown can drain it before the
    /// WebSocket client closes.
    pub fn set_bridge(&mut self, handle: BridgeHandle) {
        self.bridge = Some(handle);
    }

    /// Start the child and run the relay fabric until it exits.
    /// Returns the child's exit code.
    pub async fn run(&mut self) -> Result<i32> {
        let stdin_fd = libc::STDIN_FILENO;
        let master_raw = self.master.as_raw_fd();

        // Copy the outer window size onto the inner PTY before the child
        // draws anything.
        if let Err(e) = sync_winsize(stdin_fd, master_raw) {
            warn!(error = %e, "initial winsize sync failed");
        }

        let raw_guard = RawModeGuard::new(stdin_fd).context("set raw mode")?;

        let slave = self
            .slave
            .take()
            .ok_or_else(|| anyhow!("relay already ran"))?;
        let mut child = spawn_child(&self.options, &slave)?;
        drop(slave); // the child owns its copy now
        let child_pid = child.id().map(|pid| Pid::from_raw(pid as i32));
        info!(command = %self.options.command, pid = ?child_pid, "child started");

        let ws_task = self.ws.as_ref().map(|ws| {
            let ws = ws.clone();
            tokio::spawn(async move { ws.run().await })
        });

        // Window-resize forwarding.
        let mut winch = unix_signal(SignalKind::window_change()).context("SIGWINCH handler")?;
        let resize_task = tokio::spawn(async move {
            while winch.recv().await.is_some() {
                if let Err(e) = sync_winsize(stdin_fd, master_raw) {
                    warn!(error = %e, "winsize sync failed");
                }
            }
        });

        // Interrupt/terminate forwarding to the child's process group.
        let mut sigint = unix_signal(SignalKind::interrupt()).context("SIGINT handler")?;
        let mut sigterm = unix_signal(SignalKind::terminate()).context("SIGTERM handler")?;
        let forward_task = tokio::spawn(async move {
            loop {
                let sig = tokio::select! {
                    Some(_) = sigint.recv() => Signal::SIGINT,
                    Some(_) = sigterm.recv() => Signal::SIGTERM,
                    else => break,
                };
                if let Some(pid) = child_pid {
                    let _ = signal::killpg(pid, sig);
                }
            }
        });

        let output_task = tokio::spawn(output_loop(self.master.clone(), self.ws.clone()));
        let input_task = tokio::spawn(input_loop(
            self.writer.clone(),
            raw_guard.saved(),
            stdin_fd,
            master_raw,
        ));

        let status = child.wait().await.context("wait for child")?;
        let exit_code = status
            .code()
            .unwrap_or_else(|| 128 + status.signal().unwrap_or(0));
        info!(exit_code, "child exited");

        resize_task.abort();
        forward_task.abort();

        // The reader unblocks with EIO once the child side of the slave is
        // gone; give it a moment to drain what is left.
        if tokio::time::timeout(DRAIN_TIMEOUT, output_task).await.is_err() {
            warn!("output drain timed out");
        }
        input_task.abort();

        // Drain the bridge before the WebSocket client goes away so its
        // final frames make it onto the wire.
        if let Some(bridge) = self.bridge.take() {
            let _ = bridge.done_tx.send(true);
            let _ = bridge.task.await;
        }
        if let Some(ws) = &self.ws {
            ws.close();
        }
        if let Some(task) = ws_task {
            let _ = task.await;
        }

        raw_guard.restore();
        Ok(exit_code)
    }
}

/// Launch the child with stdin/stdout/stderr on the slave, in a new session
/// with the slave as its controlling terminal. The environment is the
/// parent's minus every `GREENLIGHT_*` variable, plus the export map.
fn spawn_child(options: &RelayOptions, slave: &OwnedFd) -> Result<tokio::process::Child> {
    let mut cmd = tokio::process::Command::new(&options.command);
    cmd.args(&options.args);
    cmd.stdin(Stdio::from(slave.try_clone().context("dup slave")?));
    cmd.stdout(Stdio::from(slave.try_clone().context("dup slave")?));
    cmd.stderr(Stdio::from(slave.try_clone().context("dup slave")?));

    cmd.env_clear();
    for (key, value) in std::env::vars() {
        if !key.starts_with(ENV_PREFIX) {
            cmd.env(key, value);
        }
    }
    for (key, value) in &options.export_env {
        cmd.env(key, value);
    }

    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            if libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY as _, 0) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    cmd.spawn()
        .with_context(|| format!("start child {:?}", options.command))
}

/// master → local stdout, and → WebSocket binary send when configured.
async fn output_loop(master: Arc<OwnedFd>, ws: Option<Arc<WsClient>>) {
    use std::io::Write;

    let raw = master.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) };

    let afd = match AsyncFd::new(MasterFd(master)) {
        Ok(afd) => afd,
        Err(e) => {
            warn!(error = %e, "master AsyncFd registration failed");
            return;
        }
    };

    let mut stdout = std::io::stdout();
    let mut buf = vec![0u8; 4096];
    loop {
        let mut guard = match afd.readable().await {
            Ok(guard) => guard,
            Err(_) => break,
        };
        match nix::unistd::read(raw, &mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let _ = stdout.write_all(&buf[..n]);
                let _ = stdout.flush();
                if let Some(ws) = &ws {
                    ws.send(&buf[..n]).await;
                }
            }
            Err(nix::errno::Errno::EAGAIN) => {
                guard.clear_ready();
            }
            // EIO means the child closed its side; anything else is fatal
            // to the reader either way.
            Err(_) => break,
        }
    }
}

/// local stdin → master, scanning for Ctrl-Z which suspends the relay.
async fn input_loop(
    writer: PtyWriter,
    cooked: nix::sys::termios::Termios,
    stdin_fd: RawFd,
    master_raw: RawFd,
) {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 256];
    loop {
        let n = match stdin.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let mut data = &buf[..n];
        while !data.is_empty() {
            match data.iter().position(|&b| b == SUSPEND_BYTE) {
                None => {
                    if writer.write_all(data).is_err() {
                        return;
                    }
                    break;
                }
                Some(idx) => {
                    if idx > 0 && writer.write_all(&data[..idx]).is_err() {
                        return;
                    }
                    suspend(&cooked, stdin_fd, master_raw);
                    data = &data[idx + 1..];
                }
            }
        }
    }
}

/// Restore the cooked terminal and stop ourselves for shell job control.
/// Execution resumes past the kill after `fg`; re-enter raw mode and
/// re-sync the window size, which may have changed while suspended.
fn suspend(cooked: &nix::sys::termios::Termios, stdin_fd: RawFd, master_raw: RawFd) {
    if let Err(e) = transport::restore_termios(stdin_fd, cooked) {
        warn!(error = %e, "termios restore before suspend failed");
    }
    unsafe {
        let _ = signal::signal(Signal::SIGTSTP, signal::SigHandler::SigDfl);
    }
    let _ = signal::kill(Pid::from_raw(0), Signal::SIGTSTP);
    // resumed
    if let Err(e) = transport::set_raw(stdin_fd) {
        warn!(error = %e, "raw mode after resume failed");
    }
    if let Err(e) = sync_winsize(stdin_fd, master_raw) {
        warn!(error = %e, "winsize sync after resume failed");
    }
}

fn sync_winsize(from_fd: RawFd, to_fd: RawFd) -> Result<()> {
    let ws = transport::get_winsize(from_fd)?;
    transport::set_winsize(to_fd, &ws)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn read_master_until(
        master: Arc<OwnedFd>,
        stop: impl Fn(&[u8]) -> bool + Send + 'static,
    ) -> tokio::task::JoinHandle<Vec<u8>> {
        tokio::spawn(async move {
            let raw = master.as_raw_fd();
            let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
            unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            let afd = AsyncFd::new(MasterFd(master)).unwrap();
            let mut collected = Vec::new();
            let mut buf = vec![0u8; 4096];
            loop {
                let mut guard = match afd.readable().await {
                    Ok(guard) => guard,
                    Err(_) => break,
                };
                match nix::unistd::read(raw, &mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        collected.extend_from_slice(&buf[..n]);
                        if stop(&collected) {
                            break;
                        }
                    }
                    Err(nix::errno::Errno::EAGAIN) => guard.clear_ready(),
                    Err(_) => break,
                }
            }
            collected
        })
    }

    // Disable echo and output post-processing so the child relays bytes
    // unchanged.
    fn raw_slave(slave: &OwnedFd) {
        transport::set_raw(slave.as_raw_fd()).unwrap();
    }

    #[tokio::test]
    async fn test_spawn_child_writes_through_master() {
        let pair = transport::open_pty().unwrap();
        let master = Arc::new(pair.master);
        raw_slave(&pair.slave);

        let options = RelayOptions {
            command: "echo".to_string(),
            args: vec!["pty-hello".to_string()],
            export_env: vec![],
        };
        let mut child = spawn_child(&options, &pair.slave).unwrap();
        drop(pair.slave);

        let reader = read_master_until(master.clone(), |data| {
            data.windows(9).any(|w| w == b"pty-hello")
        });
        let collected = tokio::time::timeout(Duration::from_secs(10), reader)
            .await
            .expect("child output never arrived")
            .unwrap();
        assert!(collected.windows(9).any(|w| w == b"pty-hello"));

        let status = child.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_child_env_scrubbed_and_exported() {
        std::env::set_var("GREENLIGHT_TEST_LEAK", "must-not-appear");
        let pair = transport::open_pty().unwrap();
        let master = Arc::new(pair.master);
        raw_slave(&pair.slave);

        let options = RelayOptions {
            command: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "echo \"leak=[$GREENLIGHT_TEST_LEAK] keep=[$GREENLIGHT_SESSION_ID]\"".to_string(),
            ],
            export_env: vec![("GREENLIGHT_SESSION_ID".to_string(), "relay-xyz".to_string())],
        };
        let mut child = spawn_child(&options, &pair.slave).unwrap();
        drop(pair.slave);

        let reader = read_master_until(master.clone(), |data| {
            data.windows(6).any(|w| w == b"keep=[")
        });
        let collected = tokio::time::timeout(Duration::from_secs(10), reader)
            .await
            .expect("child output never arrived")
            .unwrap();
        let output = String::from_utf8_lossy(&collected);
        assert!(output.contains("leak=[]"), "output: {output}");
        assert!(output.contains("keep=[relay-xyz]"), "output: {output}");

        child.wait().await.unwrap();
        std::env::remove_var("GREENLIGHT_TEST_LEAK");
    }

    #[tokio::test]
    async fn test_pty_writer_serialises_concurrent_writes() {
        const BLOCK: usize = 512;
        const WRITES_PER_PRODUCER: usize = 4;
        let letters = [b'A', b'B', b'C', b'D'];

        let pair = transport::open_pty().unwrap();
        let master = Arc::new(pair.master);
        raw_slave(&pair.slave);

        let options = RelayOptions {
            command: "cat".to_string(),
            args: vec![],
            export_env: vec![],
        };
        let mut child = spawn_child(&options, &pair.slave).unwrap();
        drop(pair.slave);

        let writer = PtyWriter {
            master: master.clone(),
            lock: Arc::new(std::sync::Mutex::new(())),
        };

        let expected_total = letters.len() * WRITES_PER_PRODUCER * BLOCK;
        let reader = read_master_until(master.clone(), move |data| data.len() >= expected_total);

        let mut producers = Vec::new();
        for &letter in &letters {
            let writer = writer.clone();
            producers.push(tokio::task::spawn_blocking(move || {
                for _ in 0..WRITES_PER_PRODUCER {
                    writer.write_all(&vec![letter; BLOCK]).unwrap();
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }

        let collected = tokio::time::timeout(Duration::from_secs(10), reader)
            .await
            .expect("echoed output never arrived")
            .unwrap();
        assert_eq!(collected.len(), expected_total);

        // Every maximal run of one letter must be a whole number of blocks:
        // a broken run would mean two writes interleaved.
        let mut runs: HashMap<u8, usize> = HashMap::new();
        let mut current = collected[0];
        let mut run_len = 0usize;
        for &byte in &collected {
            if byte == current {
                run_len += 1;
            } else {
                assert_eq!(run_len % BLOCK, 0, "interleaved run of {}", current as char);
                *runs.entry(current).or_default() += run_len;
                current = byte;
                run_len = 1;
            }
        }
        assert_eq!(run_len % BLOCK, 0);
        *runs.entry(current).or_default() += run_len;
        for &letter in &letters {
            assert_eq!(runs[&letter], WRITES_PER_PRODUCER * BLOCK);
        }

        // cat exits once the master writer side is done with it.
        child.start_kill().unwrap();
        child.wait().await.unwrap();
    }
}
