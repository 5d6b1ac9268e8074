pub mod config;
pub mod connector;
pub mod executor;
pub mod heartbeat;
pub mod interactive;
pub mod metrics;
pub mod stream;
pub mod telemetry;

pub fn now_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
