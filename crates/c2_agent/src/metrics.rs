use axum::{response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, Gauge, Registry, TextEncoder};

/// Prometheus metrics exposed by `c2-agent`, labeled with this process's
/// assigned agent id once known.
pub struct AgentMetrics {
    pub registry: Registry,
    pub connection_status: Gauge,
    pub last_command_latency_seconds: Gauge,
}

impl AgentMetrics {
    pub fn new(agent_id: &str) -> Self {
        let registry = Registry::new_custom(Some("c2_agent".into()), None)
            .expect("failed to create custom metrics registry");

        macro_rules! reg_gauge {
            ($name:expr, $help:expr) => {{
                let gauge = Gauge::with_opts(
                    prometheus::Opts::new($name, $help).const_label("agent_id", agent_id),
                )
                .unwrap();
                registry.register(Box::new(gauge.clone())).unwrap();
                gauge
            }};
        }

        Self {
            connection_status: reg_gauge!(
                "connection_status",
                "1 if connected to the server, 0 otherwise"
            ),
            last_command_latency_seconds: reg_gauge!(
                "last_command_latency_seconds",
                "Duration of the most recently executed command"
            ),
            registry,
        }
    }

    pub fn router(&self) -> Router {
        let registry = self.registry.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let registry = registry.clone();
                async move {
                    let metric_families = registry.gather();
                    let mut buffer = Vec::new();
                    let encoder = TextEncoder::new();
                    encoder
                        .encode(&metric_families, &mut buffer)
                        .expect("failed to encode metrics");
                    String::from_utf8(buffer)
                        .expect("metrics buffer is not valid UTF-8")
                        .into_response()
                }
            }),
        )
    }

    pub fn set_connection_status(&self, is_connected: bool) {
        self.connection_status.set(if is_connected { 1.0 } else { 0.0 });
    }

    pub fn set_last_command_latency(&self, seconds: f64) {
        self.last_command_latency_seconds.set(seconds);
    }
}
