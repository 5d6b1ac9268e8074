//! Dial/register state machine.

use api::gen::c2::v1::{c2_service_client::C2ServiceClient, AgentInfo};
use std::time::Duration;
use thiserror::Error;
use tonic::transport::{Channel, Endpoint};
use tonic::Request;

#[derive(Debug, Error)]
pub enum Error {
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("gRPC status error: {0}")]
    Status(#[from] tonic::Status),
    #[error("registration rejected: {0}")]
    Rejected(String),
}

/// `Disconnected/Connecting/Registered/Streaming/Degraded` vocabulary used
/// for logging and the connection-status gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disconnected,
    Connecting,
    Registered,
    Streaming,
    Degraded,
}

/// Dials `server_addr` with a short connect timeout and keepalive pings,
/// then performs the unary `RegisterAgent` call, returning a connected client
/// and the (possibly reconnect-preserved) AgentId.
pub async fn connect(
    server_addr: &str,
    descriptor: AgentInfo,
) -> Result<(C2ServiceClient<Channel>, String), Error> {
    let uri = if server_addr.starts_with("http") {
        server_addr.to_string()
    } else {
        format!("http://{server_addr}")
    };

    let endpoint = Endpoint::from_shared(uri)?
        .connect_timeout(Duration::from_secs(10))
        .keep_alive_while_idle(true)
        .http2_keep_alive_interval(Duration::from_secs(10))
        .keep_alive_timeout(Duration::from_secs(5));

    let channel = endpoint.connect().await?;
    let mut client = C2ServiceClient::new(channel);

    let resp = client
        .register_agent(Request::new(descriptor))
        .await?
        .into_inner();

    if !resp.success {
        return Err(Error::Rejected(resp.error_message));
    }

    Ok((client, resp.agent_id))
}
