//! Dispatches inbound directives (carried as tagged UTF-8 text inside a
//! `CommandResponse.result`) onto shell execution, interactive-session
//! control, or a pass-through reply.

use crate::interactive::InteractiveSession;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command as ProcessCommand;
use tokio::sync::Mutex;

const OUTPUT_POLL_DEADLINE: Duration = Duration::from_millis(500);

/// Holds at most one interactive shell session at a time, matching the
/// legacy "Shell session already running" behaviour.
pub struct Executor {
    interactive: Mutex<Option<InteractiveSession>>,
}

impl Executor {
    pub fn new() -> Self {
        Self {
            interactive: Mutex::new(None),
        }
    }

    /// Executes one directive and returns the bytes to send back as the
    /// response payload.
    pub async fn execute(&self, directive: &str) -> Vec<u8> {
        if let Some(cmd) = directive.strip_prefix("shell:") {
            return run_shell(cmd).await;
        }
        if let Some(init_cmd) = directive.strip_prefix("interactive:") {
            return self.start_interactive(init_cmd).await;
        }
        if let Some(text) = directive.strip_prefix("input:") {
            return self.send_input(text).await;
        }
        if directive == "output:" {
            return self.poll_output().await;
        }
        format!("Received command: {directive}").into_bytes()
    }

    async fn start_interactive(&self, init_cmd: &str) -> Vec<u8> {
        let mut guard = self.interactive.lock().await;
        if let Some(session) = guard.as_ref() {
            if session.has_exited() {
                *guard = None;
            } else {
                return b"Shell session already running".to_vec();
            }
        }
        match InteractiveSession::spawn(init_cmd) {
            Ok(session) => {
                *guard = Some(session);
                b"Interactive shell session started".to_vec()
            }
            Err(e) => format!("Failed to start interactive shell: {e}").into_bytes(),
        }
    }

    async fn send_input(&self, text: &str) -> Vec<u8> {
        let guard = self.interactive.lock().await;
        match guard.as_ref() {
            Some(session) => match session.write_input(text).await {
                Ok(()) => b"Input sent successfully".to_vec(),
                Err(e) => format!("Failed to write input: {e}").into_bytes(),
            },
            None => b"No interactive shell session running".to_vec(),
        }
    }

    async fn poll_output(&self) -> Vec<u8> {
        let guard = self.interactive.lock().await;
        match guard.as_ref() {
            Some(session) => session.poll_output(OUTPUT_POLL_DEADLINE).await,
            None => Vec::new(),
        }
    }
}

async fn run_shell(cmd: &str) -> Vec<u8> {
    let output = if cfg!(windows) {
        ProcessCommand::new("cmd")
            .arg("/C")
            .arg(cmd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
    } else {
        ProcessCommand::new("sh")
            .arg("-c")
            .arg(cmd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
    };

    match output {
        Ok(output) => {
            let mut combined = output.stdout;
            combined.extend_from_slice(&output.stderr);
            combined
        }
        Err(e) => e.to_string().into_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shell_tag_runs_command_and_captures_stdout() {
        let executor = Executor::new();
        let result = executor.execute("shell:echo hi").await;
        assert_eq!(String::from_utf8_lossy(&result).trim(), "hi");
    }

    #[tokio::test]
    async fn unknown_tag_is_echoed_back() {
        let executor = Executor::new();
        let result = executor.execute("agent-1").await;
        assert_eq!(result, b"Received command: agent-1");
    }

    #[tokio::test]
    async fn second_interactive_start_is_rejected() {
        let executor = Executor::new();
        let first = executor.execute("interactive:").await;
        assert_eq!(first, b"Interactive shell session started");
        let second = executor.execute("interactive:").await;
        assert_eq!(second, b"Shell session already running");
    }

    #[tokio::test]
    async fn input_without_session_is_rejected() {
        let executor = Executor::new();
        let result = executor.execute("input:ls").await;
        assert_eq!(result, b"No interactive shell session running");
    }

    #[tokio::test]
    async fn a_new_session_can_start_once_the_previous_child_has_exited() {
        let executor = Executor::new();
        let first = executor.execute("interactive:exit 0").await;
        assert_eq!(first, b"Interactive shell session started");

        let mut restarted = Vec::new();
        for _ in 0..50 {
            restarted = executor.execute("interactive:").await;
            if restarted != b"Shell session already running" {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(restarted, b"Interactive shell session started");
    }
}
