//! Peer process lifecycle.
//!
//! The peer is spawned with all three standard streams piped. stdin and
//! stdout are handed to the RPC client; stderr is drained in the background
//! into the log and a short tail kept for diagnostics, never parsed.
//!
//! # Process Cleanup Safety
//!
//! `PeerProcess` owns the child. `shutdown()` asks it to leave (stdin EOF,
//! then SIGTERM on Unix), kills it after the grace period, and always waits
//! for the exit status. If the handle is dropped without `shutdown()`, `Drop`
//! kills the child and tokio reaps it, so no path leaves an orphan behind.

use std::collections::VecDeque;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use marionette_core::error::ClientError;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Number of peer stderr lines retained for error reports.
const STDERR_TAIL_LINES: usize = 64;

/// How long shutdown waits for the stderr drain to see EOF.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

pub struct PeerProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_task: Option<JoinHandle<()>>,
    /// Exit status has been collected.
    reaped: bool,
}

impl PeerProcess {
    /// Spawn the peer. `command[0]` is the executable.
    pub fn spawn(command: &[String]) -> Result<Self, ClientError> {
        let command_line = command.join(" ");
        let Some((program, args)) = command.split_first() else {
            return Err(ClientError::Spawn {
                command: command_line,
                source: io::Error::new(io::ErrorKind::InvalidInput, "command cannot be empty"),
            });
        };

        info!("Starting peer: {}", command_line);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ClientError::Spawn {
                command: command_line.clone(),
                source,
            })?;

        debug!("Peer started with pid {:?}", child.id());

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain_stderr(stderr, Arc::clone(&stderr_tail))));

        Ok(Self {
            child,
            stdin,
            stdout,
            stderr_tail,
            stderr_task,
            reaped: false,
        })
    }

    /// Input stream of the peer. Can be taken once.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Output stream of the peer. Can be taken once.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// The most recent stderr lines, oldest first.
    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail
            .lock()
            .map(|tail| tail.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Check whether the peer has exited without blocking.
    pub fn has_exited(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!("Peer exited with {}", status);
                self.reaped = true;
                true
            }
            Ok(None) => false,
            Err(e) => {
                debug!("Failed to poll peer status: {}", e);
                false
            }
        }
    }

    /// Stop the peer and collect its exit status.
    ///
    /// Closes stdin (if still held) and gives the peer the first half of
    /// `grace` to exit on its own. After that it gets SIGTERM on Unix, and is
    /// killed if still running once the rest of `grace` has passed.
    pub async fn shutdown(&mut self, grace: Duration) -> io::Result<ExitStatus> {
        drop(self.stdin.take());

        let polite = grace / 2;
        let status = match tokio::time::timeout(polite, self.child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                debug!("Peer still running {:?} after stdin closed", polite);
                request_terminate(&self.child);
                match tokio::time::timeout(grace - polite, self.child.wait()).await {
                    Ok(status) => status?,
                    Err(_) => {
                        warn!("Peer did not exit within {:?}, killing it", grace);
                        self.child.kill().await?;
                        self.child.wait().await?
                    }
                }
            }
        };
        self.reaped = true;
        info!("Peer exited with {}", status);

        if let Some(task) = self.stderr_task.take() {
            if tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await.is_err() {
                debug!("Peer stderr still open after exit");
            }
        }

        Ok(status)
    }
}

impl Drop for PeerProcess {
    fn drop(&mut self) {
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        if self.reaped {
            return;
        }
        // Mirrors shutdown() without the grace period, since Drop can't await.
        if let Err(e) = self.child.start_kill() {
            debug!("Failed to kill peer on drop (may have already exited): {}", e);
        }
        if let Err(e) = self.child.try_wait() {
            debug!("Failed to collect peer exit status on drop: {}", e);
        }
    }
}

#[cfg(unix)]
fn request_terminate(child: &Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: the child has not been reaped, so the pid still refers to it.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        debug!(
            "Failed to send SIGTERM to peer {}: {}",
            pid,
            io::Error::last_os_error()
        );
    }
}

/// Without signals, closing stdin is the only polite request.
#[cfg(not(unix))]
fn request_terminate(_child: &Child) {}

async fn drain_stderr(stderr: ChildStderr, tail: Arc<Mutex<VecDeque<String>>>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(target: "marionette::peer", "{}", line);
                if let Ok(mut tail) = tail.lock() {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Stopped reading peer stderr: {}", e);
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_cat_echoes_a_line() {
        let mut peer = PeerProcess::spawn(&cmd(&["cat"])).expect("spawn cat");
        let mut stdin = peer.take_stdin().expect("stdin");
        let stdout = peer.take_stdout().expect("stdout");
        assert!(peer.take_stdin().is_none(), "stdin can only be taken once");

        stdin
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"ping\"}\n")
            .await
            .expect("write");
        stdin.flush().await.expect("flush");

        let mut line = String::new();
        timeout(TEST_TIMEOUT, BufReader::new(stdout).read_line(&mut line))
            .await
            .expect("read timed out")
            .expect("read");
        assert_eq!(line, "{\"jsonrpc\":\"2.0\",\"method\":\"ping\"}\n");

        drop(stdin);
        let status = timeout(TEST_TIMEOUT, peer.shutdown(Duration::from_secs(1)))
            .await
            .expect("shutdown timed out")
            .expect("shutdown");
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_peer_exiting_on_stdin_eof_keeps_its_status() {
        let mut peer = PeerProcess::spawn(&cmd(&["sh", "-c", "read line; exit 7"]))
            .expect("spawn sh");

        let status = timeout(TEST_TIMEOUT, peer.shutdown(Duration::from_secs(2)))
            .await
            .expect("shutdown timed out")
            .expect("shutdown");
        assert_eq!(status.code(), Some(7));
    }

    #[tokio::test]
    async fn test_shutdown_terminates_unresponsive_peer() {
        let mut peer = PeerProcess::spawn(&cmd(&["sleep", "30"])).expect("spawn sleep");
        assert!(!peer.has_exited());

        let status = timeout(TEST_TIMEOUT, peer.shutdown(Duration::from_millis(100)))
            .await
            .expect("shutdown should not wait for sleep to finish")
            .expect("shutdown");
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_stderr_tail_is_retained() {
        let mut peer =
            PeerProcess::spawn(&cmd(&["sh", "-c", "echo 'peer warming up' >&2; exit 3"]))
                .expect("spawn sh");

        let status = timeout(TEST_TIMEOUT, peer.shutdown(Duration::from_secs(1)))
            .await
            .expect("shutdown timed out")
            .expect("shutdown");
        assert_eq!(status.code(), Some(3));
        assert_eq!(peer.stderr_tail(), vec!["peer warming up".to_string()]);
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let result = PeerProcess::spawn(&cmd(&["definitely-not-a-real-peer-binary"]));
        match result {
            Err(ClientError::Spawn { command, source }) => {
                assert_eq!(command, "definitely-not-a-real-peer-binary");
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            Err(other) => panic!("Expected Spawn error, got {:?}", other),
            Ok(_) => panic!("Expected Spawn error, got a process"),
        }
    }

    #[tokio::test]
    async fn test_spawn_empty_command_fails() {
        assert!(matches!(
            PeerProcess::spawn(&[]),
            Err(ClientError::Spawn { .. })
        ));
    }
}
