use clap::Parser;

/// `c2-agent` — a reconnecting agent that registers with a C2 server and
/// executes the commands it dispatches.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Address of the `c2-serverd` gRPC endpoint.
    #[arg(long, env = "C2_SERVER_ADDR", default_value = "localhost:50051")]
    pub server: String,

    /// Enable verbose (debug-level) logging.
    #[arg(long, env = "C2_AGENT_DEBUG", default_value_t = false)]
    pub debug: bool,

    /// Listen address for this agent's own Prometheus metrics endpoint.
    #[arg(long, env = "C2_AGENT_METRICS_ADDR", default_value = "0.0.0.0:9100")]
    pub metrics_addr: String,
}
