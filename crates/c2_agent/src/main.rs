use api::gen::c2::v1::AgentInfo;
use c2_agent::config::Config;
use c2_agent::executor::Executor;
use c2_agent::metrics::AgentMetrics;
use c2_agent::telemetry::{SysinfoTelemetry, Telemetry};
use c2_agent::{connector, heartbeat, now_seconds, stream};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(5);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
const CONSECUTIVE_FAILURES_BEFORE_FULL_RECONNECT: u32 = 3;

fn local_descriptor() -> AgentInfo {
    use sysinfo::SystemExt;
    let hostname = sysinfo::System::new()
        .host_name()
        .unwrap_or_else(|| "unknown-host".to_string());

    AgentInfo {
        agent_id: String::new(),
        hostname,
        os: std::env::consts::OS.to_string(),
        architecture: std::env::consts::ARCH.to_string(),
        ip_address: String::new(),
        username: std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string()),
        registration_time: now_seconds(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let filter = if config.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    fmt().with_env_filter(filter).json().init();

    tracing::info!(config = ?config, "c2-agent starting");

    let telemetry: Arc<dyn Telemetry> = Arc::new(SysinfoTelemetry::new());
    let executor = Arc::new(Executor::new());

    let metrics_addr: std::net::SocketAddr = config.metrics_addr.parse()?;
    let mut metrics: Option<Arc<AgentMetrics>> = None;

    let mut reconnect_delay = INITIAL_RECONNECT_DELAY;

    // Outer loop: a full reconnect, dialing the channel and re-running
    // `RegisterAgent`. Entered on startup and whenever the inner loop
    // escalates past the consecutive-failure threshold.
    'reconnect: loop {
        let descriptor = local_descriptor();
        let (client, agent_id) = match connector::connect(&config.server, descriptor).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "failed to connect/register; backing off");
                tokio::time::sleep(reconnect_delay).await;
                reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY);
                continue 'reconnect;
            }
        };

        tracing::info!(agent_id = %agent_id, "registered with server");
        reconnect_delay = INITIAL_RECONNECT_DELAY;
        let mut consecutive_failures: u32 = 0;

        if metrics.is_none() {
            let m = Arc::new(AgentMetrics::new(&agent_id));
            let router = m.router();
            tokio::spawn(async move {
                match tokio::net::TcpListener::bind(metrics_addr).await {
                    Ok(listener) => {
                        tracing::info!(address = %metrics_addr, "agent metrics server started");
                        if let Err(e) = axum::serve(listener, router.into_make_service()).await {
                            tracing::error!(error = %e, "agent metrics server failed");
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "failed to bind agent metrics listener"),
                }
            });
            metrics = Some(m);
        }
        let metrics = metrics.clone().expect("metrics initialized above");

        // Inner loop: retries the bare `SendCommands` stream on the same
        // client/agent_id, without re-registering, while failures stay
        // at or below the threshold.
        'session: loop {
            let heartbeat_client = client.clone();
            let heartbeat_agent_id = agent_id.clone();
            let heartbeat_metrics = metrics.clone();
            let heartbeat_telemetry = telemetry.clone();
            let mut heartbeat_task = tokio::spawn(async move {
                heartbeat::run(
                    heartbeat_client,
                    heartbeat_agent_id,
                    String::new(),
                    heartbeat_telemetry,
                    heartbeat_metrics,
                )
                .await;
            });

            let stream_executor = executor.clone();
            let stream_metrics = metrics.clone();
            let stream_client = client.clone();
            let stream_agent_id = agent_id.clone();

            enum SessionEnd {
                Stream(Result<(), stream::Error>),
                HeartbeatLost,
            }

            let session_end = tokio::select! {
                res = stream::run(stream_client, stream_agent_id, stream_executor, stream_metrics) => {
                    SessionEnd::Stream(res)
                }
                _ = &mut heartbeat_task => {
                    SessionEnd::HeartbeatLost
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown signal received");
                    heartbeat_task.abort();
                    return Ok(());
                }
            };

            heartbeat_task.abort();

            let keep_retrying = match session_end {
                SessionEnd::Stream(Ok(())) => {
                    tracing::info!(agent_id = %agent_id, "command stream ended cleanly; reconnecting");
                    false
                }
                SessionEnd::Stream(Err(e)) => {
                    consecutive_failures += 1;
                    tracing::warn!(agent_id = %agent_id, error = %e, failures = consecutive_failures, "command stream failed");
                    consecutive_failures <= CONSECUTIVE_FAILURES_BEFORE_FULL_RECONNECT
                }
                SessionEnd::HeartbeatLost => {
                    consecutive_failures += 1;
                    tracing::warn!(agent_id = %agent_id, failures = consecutive_failures, "heartbeat lost; ending session");
                    consecutive_failures <= CONSECUTIVE_FAILURES_BEFORE_FULL_RECONNECT
                }
            };

            if keep_retrying {
                tracing::info!(agent_id = %agent_id, "retrying command stream without re-registering");
                tokio::time::sleep(INITIAL_RECONNECT_DELAY).await;
                continue 'session;
            }

            if consecutive_failures > CONSECUTIVE_FAILURES_BEFORE_FULL_RECONNECT {
                tracing::warn!("escalating to full reconnect after repeated failures");
            }
            break 'session;
        }

        tokio::time::sleep(reconnect_delay).await;
        reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY);
    }
}
