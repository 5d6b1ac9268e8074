//! `C2Service` implementation: `RegisterAgent`, `Heartbeat`, and the
//! bidirectional `SendCommands` stream session.
//!
//! The RPC's two directions are NOT request/response in the usual sense:
//! the agent drives the request stream with `Command` messages (its first
//! message is a `register` handshake, later ones are execution results),
//! while the server drives the response stream with `CommandResponse`
//! messages that the [`crate::codec`] has re-purposed to carry outbound
//! directives rather than replies.

use crate::codec;
use crate::metrics::Metrics;
use crate::registry::{unix_seconds, Registry};
use api::gen::c2::v1::{
    c2_service_server::{C2Service, C2ServiceServer},
    AgentInfo, Command, CommandResponse, HeartbeatRequest, HeartbeatResponse,
    RegistrationResponse,
};
use futures::Stream;
use std::{net::SocketAddr, pin::Pin, sync::Arc, time::Duration};
use tonic::{Request, Response, Status, Streaming};

pub struct C2Svc {
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
}

impl C2Svc {
    pub fn new(registry: Arc<Registry>, metrics: Arc<Metrics>) -> Self {
        Self { registry, metrics }
    }
}

#[tonic::async_trait]
impl C2Service for C2Svc {
    async fn register_agent(
        &self,
        req: Request<AgentInfo>,
    ) -> Result<Response<RegistrationResponse>, Status> {
        self.metrics.grpc_requests_total.inc();
        let mut info = req.into_inner();
        info.registration_time = unix_seconds(std::time::SystemTime::now());

        let agent_id = self.registry.register(info);
        self.metrics.agents_registered_total.inc();
        self.metrics
            .update_active_agents(self.registry.active_count() as i64);

        Ok(Response::new(RegistrationResponse {
            success: true,
            agent_id,
            error_message: String::new(),
        }))
    }

    async fn heartbeat(
        &self,
        req: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        self.metrics.grpc_requests_total.inc();
        let req = req.into_inner();

        match self
            .registry
            .heartbeat(&req.agent_id, &req.ip_address, req.stats.as_ref())
        {
            Ok(()) => Ok(Response::new(HeartbeatResponse {
                success: true,
                server_time: unix_seconds(std::time::SystemTime::now()),
                message: String::new(),
            })),
            Err(_) => Ok(Response::new(HeartbeatResponse {
                success: false,
                server_time: unix_seconds(std::time::SystemTime::now()),
                message: "Agent not registered".into(),
            })),
        }
    }

    type SendCommandsStream =
        Pin<Box<dyn Stream<Item = Result<CommandResponse, Status>> + Send + 'static>>;

    async fn send_commands(
        &self,
        req: Request<Streaming<Command>>,
    ) -> Result<Response<Self::SendCommandsStream>, Status> {
        self.metrics.grpc_requests_total.inc();
        let mut inbound = req.into_inner();
        let registry = self.registry.clone();

        // Handshake: first message identifies the agent.
        let first = inbound
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("stream closed before registration"))?;
        if first.command_type != "register" {
            return Err(Status::invalid_argument("first message must be a register command"));
        }
        let agent_id = first.id.clone();
        let agent = registry
            .get(&agent_id)
            .ok_or_else(|| Status::not_found("agent not registered"))?;

        // A bare reconnect (no RegisterAgent call) lands here too: the
        // handshake above only needs `agent_id` to already be known to
        // the registry, not freshly registered. `acquire_stream` is what
        // actually gates concurrent sessions, and its guard is what lets
        // a later reconnect reattach once this session ends.
        let (guard, outbound_rx) = agent.acquire_stream().ok_or_else(|| {
            Status::already_exists("agent already has an active command stream")
        })?;
        let guard = Arc::new(guard);

        tracing::info!(agent_id = %agent_id, "command stream established");

        // Inbound pump: every subsequent Command
        // from the agent is translated into a CommandResponse and handed
        // to whichever waiter registered for its id, or parked as
        // unsolicited if none is waiting.
        {
            let agent = agent.clone();
            let agent_id = agent_id.clone();
            let _guard = guard.clone();
            tokio::spawn(async move {
                loop {
                    match inbound.message().await {
                        Ok(Some(cmd)) => {
                            agent.touch();
                            let result = if cmd.command_type == "response" {
                                cmd.payload
                            } else {
                                b"Command received".to_vec()
                            };
                            agent.deliver_response(CommandResponse {
                                command_id: cmd.id,
                                success: true,
                                result,
                                error_message: String::new(),
                                timestamp: unix_seconds(std::time::SystemTime::now()),
                            });
                        }
                        Ok(None) => {
                            tracing::info!(agent_id = %agent_id, "command stream closed by agent");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(agent_id = %agent_id, error = %e, "command stream error");
                            break;
                        }
                    }
                }
                // _guard drops here, releasing the hold once the peer
                // (or a dead connection) has closed the request side.
            });
        }

        // Outbound pump: every Command the registry enqueues for this
        // agent is re-serialised by the Payload Codec into a
        // CommandResponse on the wire. Driven off the shared receiver
        // rather than `ReceiverStream` because the receiver is reattached
        // across bare reconnects instead of being consumed by value.
        let outbound = futures::stream::unfold((outbound_rx, guard), |(rx, guard)| async move {
            let cmd = rx.lock().await.recv().await?;
            let resp = CommandResponse {
                command_id: cmd.id,
                success: true,
                result: codec::encode(&cmd.command_type, &cmd.payload),
                error_message: String::new(),
                timestamp: unix_seconds(std::time::SystemTime::now()),
            };
            Some((Ok(resp), (rx, guard)))
        });

        Ok(Response::new(Box::pin(outbound) as Self::SendCommandsStream))
    }
}

/// Configures and runs the gRPC server.
pub async fn serve_grpc(
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
    addr: SocketAddr,
) -> anyhow::Result<()> {
    let svc = C2Svc::new(registry, metrics);

    tracing::info!(address = %addr, "starting gRPC server");

    tonic::transport::Server::builder()
        .http2_keepalive_interval(Some(Duration::from_secs(30)))
        .http2_keepalive_timeout(Some(Duration::from_secs(20)))
        .tcp_keepalive(Some(Duration::from_secs(30)))
        .add_service(C2ServiceServer::new(svc))
        .serve(addr)
        .await?;

    Ok(())
}
