//! Detached Subprocess Launch
//!
//! The transcript streamer must outlive individual hook invocations and
//! never depend on a controlling terminal, so it is started in its own
//! session with all stdio detached.

use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use anyhow::{anyhow, Context, Result};

/// Spawn `argv` as a detached subprocess: new session, stdio to null,
/// never waited on. Returns the child PID.
pub fn spawn_detached(argv: &[String], env: &[(String, String)]) -> Result<u32> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("spawn_detached: empty argv"))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    for (key, value) in env {
        cmd.env(key, value);
    }
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            Ok(())
        });
    }

    let child = cmd
        .spawn()
        .with_context(|| format!("spawn detached {program:?}"))?;
    // The child is intentionally never reaped here; it outlives this process
    // and is adopted by init once we exit.
    Ok(child.id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_argv_is_error() {
        assert!(spawn_detached(&[], &[]).is_err());
    }

    #[test]
    fn test_spawns_and_returns_pid() {
        let pid = spawn_detached(&["true".to_string()], &[]).unwrap();
        assert!(pid > 0);
    }
}
