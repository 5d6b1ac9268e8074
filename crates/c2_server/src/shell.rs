//! Operator websocket bridge into an agent's interactive shell.

use crate::registry::Registry;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const INTERACTIVE_INIT_TIMEOUT: Duration = Duration::from_secs(5);
const OUTPUT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const OUTPUT_POLL_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Deserialize)]
struct InboundFrame {
    input: String,
}

#[derive(Serialize)]
#[serde(untagged)]
enum OutboundFrame {
    Output { output: String },
    Error { error: String },
}

/// Drives one operator's shell session against `agent_id` over `socket`
/// until the socket closes or the session becomes unrecoverable. Does not
/// tear down the agent-side shell process on exit.
pub async fn run_session(socket: WebSocket, registry: Arc<Registry>, agent_id: String) {
    let ack = registry
        .issue_command(&agent_id, "interactive", Vec::new(), INTERACTIVE_INIT_TIMEOUT)
        .await;

    let (mut sender, mut receiver) = socket.split();

    match ack {
        Ok(resp) if resp.success => {
            tracing::info!(agent_id = %agent_id, "interactive shell session started");
        }
        Ok(resp) => {
            let _ = send_json(
                &mut sender,
                &OutboundFrame::Error {
                    error: resp.error_message,
                },
            )
            .await;
            return;
        }
        Err(e) => {
            let _ = send_json(
                &mut sender,
                &OutboundFrame::Error {
                    error: e.to_string(),
                },
            )
            .await;
            return;
        }
    }

    // Serialises enqueues into the agent's single mailbox so the input and
    // output pumps never interleave their issued commands.
    let issue_lock = Arc::new(Mutex::new(()));

    let (out_tx, mut out_rx) = tokio::sync::mpsc::channel::<OutboundFrame>(32);

    let poll_registry = registry.clone();
    let poll_agent_id = agent_id.clone();
    let poll_lock = issue_lock.clone();
    let poll_tx = out_tx.clone();
    let mut poll_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(OUTPUT_POLL_INTERVAL);
        loop {
            interval.tick().await;
            let resp = {
                let _guard = poll_lock.lock().await;
                poll_registry
                    .issue_command(&poll_agent_id, "output", Vec::new(), OUTPUT_POLL_TIMEOUT)
                    .await
            };
            match resp {
                Ok(resp) if resp.success && !resp.result.is_empty() => {
                    let text = String::from_utf8_lossy(&resp.result).into_owned();
                    if poll_tx
                        .send(OutboundFrame::Output { output: text })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(agent_id = %poll_agent_id, error = %e, "output poll failed");
                    break;
                }
            }
        }
    });

    let input_registry = registry.clone();
    let input_agent_id = agent_id.clone();
    let input_lock = issue_lock.clone();
    let mut input_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            let msg = match msg {
                Ok(m) => m,
                Err(_) => break,
            };
            match msg {
                Message::Text(text) => {
                    let frame: InboundFrame = match serde_json::from_str(&text) {
                        Ok(f) => f,
                        Err(_) => continue,
                    };
                    let _guard = input_lock.lock().await;
                    if let Err(e) = input_registry
                        .issue_command(&input_agent_id, "input", frame.input.into_bytes(), Duration::from_secs(5))
                        .await
                    {
                        tracing::warn!(agent_id = %input_agent_id, error = %e, "failed to deliver shell input");
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    loop {
        tokio::select! {
            frame = out_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if send_json(&mut sender, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = &mut poll_task => break,
            _ = &mut input_task => break,
        }
    }

    poll_task.abort();
    input_task.abort();
    tracing::info!(agent_id = %agent_id, "shell session ended");
}

async fn send_json(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    frame: &OutboundFrame,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_default();
    sender.send(Message::Text(text)).await
}
