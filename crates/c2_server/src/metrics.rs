use axum::{response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// A container for all Prometheus metric collectors for `c2-serverd`.
///
/// Wrapped in an `Arc` and shared across every concurrent task of the
/// application.
pub struct Metrics {
    pub registry: Registry,
    /// Total number of agents that have ever registered.
    pub agents_registered_total: IntCounter,
    /// Number of currently active (heartbeating within the liveness
    /// threshold) agents.
    pub agents_active: IntGauge,
    /// Total number of gRPC requests handled.
    pub grpc_requests_total: IntCounter,
    /// Total number of commands accepted onto an outbound mailbox.
    pub commands_dispatched_total: IntCounter,
    /// Total number of enqueue attempts rejected because a mailbox was full.
    pub queue_full_total: IntCounter,
    /// Total number of operator waits that timed out before a correlated
    /// response arrived.
    pub command_timeouts_total: IntCounter,
    /// Total number of HTTP requests served on the operator surface.
    pub http_requests_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("c2_server".into()), None)
            .expect("failed to create custom metrics registry");

        macro_rules! reg {
            ($metric:expr) => {{
                let collector = $metric;
                registry
                    .register(Box::new(collector.clone()))
                    .expect("failed to register metric");
                collector
            }};
        }

        Self {
            agents_registered_total: reg!(IntCounter::new(
                "agents_registered_total",
                "Total number of agents that have ever registered"
            )
            .unwrap()),
            agents_active: reg!(IntGauge::new(
                "agents_active",
                "Number of currently active agents"
            )
            .unwrap()),
            grpc_requests_total: reg!(IntCounter::new(
                "grpc_requests_total",
                "Total number of gRPC requests received"
            )
            .unwrap()),
            commands_dispatched_total: reg!(IntCounter::new(
                "commands_dispatched_total",
                "Total number of commands accepted onto an outbound mailbox"
            )
            .unwrap()),
            queue_full_total: reg!(IntCounter::new(
                "queue_full_total",
                "Total number of enqueue attempts rejected due to a full mailbox"
            )
            .unwrap()),
            command_timeouts_total: reg!(IntCounter::new(
                "command_timeouts_total",
                "Total number of operator waits that timed out"
            )
            .unwrap()),
            http_requests_total: reg!(IntCounter::new(
                "http_requests_total",
                "Total number of operator HTTP requests served"
            )
            .unwrap()),
            registry,
        }
    }

    /// Creates an `axum::Router` that serves metrics on `/metrics`.
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

    pub fn update_active_agents(&self, count: i64) {
        self.agents_active.set(count);
    }
}
