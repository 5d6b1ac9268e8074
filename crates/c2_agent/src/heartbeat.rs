//! Periodic `Heartbeat` RPC; triggers reconnection on transport failure or
//! a `Success:false` reply.

use crate::metrics::AgentMetrics;
use crate::telemetry::Telemetry;
use api::gen::c2::v1::{c2_service_client::C2ServiceClient, HeartbeatRequest};
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::Channel;
use tonic::Request;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Runs until a heartbeat fails or is rejected, then returns so the
/// caller can drive a reconnect.
pub async fn run(
    mut client: C2ServiceClient<Channel>,
    agent_id: String,
    ip_address: String,
    telemetry: Arc<dyn Telemetry>,
    metrics: Arc<AgentMetrics>,
) {
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        interval.tick().await;

        let stats = telemetry.snapshot();
        let req = HeartbeatRequest {
            agent_id: agent_id.clone(),
            timestamp: crate::now_seconds(),
            stats: Some(stats),
            ip_address: ip_address.clone(),
        };

        match client.heartbeat(Request::new(req)).await {
            Ok(resp) => {
                let resp = resp.into_inner();
                if !resp.success {
                    tracing::warn!(agent_id = %agent_id, message = %resp.message, "heartbeat rejected");
                    metrics.set_connection_status(false);
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(agent_id = %agent_id, error = %e, "heartbeat RPC failed");
                metrics.set_connection_status(false);
                return;
            }
        }
    }
}
