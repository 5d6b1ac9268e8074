//! Persistent child shell proxied through stdio pipes. Shaped after a
//! spawn/reader-task/shutdown structure common to session managers, but
//! deliberately plain `tokio::process` pipes rather than a real PTY.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command as ProcessCommand};
use tokio::sync::{mpsc, Mutex};

const OUTPUT_CHANNEL_CAPACITY: usize = 100;
const READ_CHUNK: usize = 1024;

/// One running interactive shell child, with its stdin writer and the
/// channel its reader tasks feed.
pub struct InteractiveSession {
    stdin: Mutex<ChildStdin>,
    output_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    exited: Arc<AtomicBool>,
}

impl InteractiveSession {
    /// Spawns the platform shell, wiring stdin/stdout/stderr and starting
    /// the two reader tasks plus the waiter task.
    pub fn spawn(init_cmd: &str) -> std::io::Result<Self> {
        let mut cmd = if cfg!(windows) {
            let mut c = ProcessCommand::new("powershell.exe");
            c.arg("-NoLogo");
            if !init_cmd.is_empty() {
                c.arg("-Command").arg(init_cmd);
            }
            c
        } else {
            let mut c = ProcessCommand::new("/bin/bash");
            if !init_cmd.is_empty() {
                c.arg("-c").arg(init_cmd);
            }
            c
        };

        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .spawn()?;

        let stdin = child.stdin.take().expect("stdin was piped");
        let mut stdout = child.stdout.take().expect("stdout was piped");
        let mut stderr = child.stderr.take().expect("stderr was piped");

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);

        let out_tx = tx.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if out_tx.send(buf[..n].to_vec()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let err_tx = tx;
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match stderr.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if err_tx.send(buf[..n].to_vec()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let exited = Arc::new(AtomicBool::new(false));
        let waiter_exited = exited.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::info!(%status, "interactive shell exited"),
                Err(e) => tracing::warn!(error = %e, "failed to wait on interactive shell"),
            }
            waiter_exited.store(true, Ordering::Relaxed);
        });

        Ok(Self {
            stdin: Mutex::new(stdin),
            output_rx: Mutex::new(rx),
            exited,
        })
    }

    /// True once the waiter task has observed the child exit.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Relaxed)
    }

    /// Writes `text` to the child's stdin, appending a trailing newline if
    /// missing.
    pub async fn write_input(&self, text: &str) -> std::io::Result<()> {
        let mut payload = text.to_string();
        if !payload.ends_with('\n') {
            payload.push('\n');
        }
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(payload.as_bytes()).await
    }

    /// Non-blocking receive from the output channel with a deadline; empty
    /// bytes on timeout, not an error.
    pub async fn poll_output(&self, deadline: std::time::Duration) -> Vec<u8> {
        let mut rx = self.output_rx.lock().await;
        match tokio::time::timeout(deadline, rx.recv()).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) | Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn echoes_input_back_as_output() {
        let session = InteractiveSession::spawn("").expect("spawn shell");
        session.write_input("echo hello-from-test").await.expect("write");

        let mut collected = Vec::new();
        for _ in 0..20 {
            let chunk = session.poll_output(Duration::from_millis(200)).await;
            if chunk.is_empty() && !collected.is_empty() {
                break;
            }
            collected.extend(chunk);
            if String::from_utf8_lossy(&collected).contains("hello-from-test") {
                break;
            }
        }
        assert!(String::from_utf8_lossy(&collected).contains("hello-from-test"));
    }

    #[tokio::test]
    async fn has_exited_flips_once_the_child_process_dies() {
        let session = InteractiveSession::spawn("exit 0").expect("spawn shell");
        let mut seen_exit = false;
        for _ in 0..50 {
            if session.has_exited() {
                seen_exit = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(seen_exit, "waiter task never observed the child exiting");
    }
}
