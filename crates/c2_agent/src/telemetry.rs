//! Pluggable CPU/memory/uptime provider. The core only propagates whatever a [`Telemetry`]
//! implementation reports; the legacy fixed values (5.0/20.0/3600) are
//! kept only as [`StubTelemetry`] for tests.

use api::gen::c2::v1::SystemStats;
use std::sync::Mutex;
use std::time::Instant;
use sysinfo::{CpuExt, System, SystemExt};

pub trait Telemetry: Send + Sync {
    fn snapshot(&self) -> SystemStats;
}

/// Real provider backed by `sysinfo`.
pub struct SysinfoTelemetry {
    system: Mutex<System>,
    started_at: Instant,
}

impl SysinfoTelemetry {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
            started_at: Instant::now(),
        }
    }
}

impl Telemetry for SysinfoTelemetry {
    fn snapshot(&self) -> SystemStats {
        let mut system = self.system.lock().expect("telemetry mutex poisoned");
        system.refresh_cpu();
        system.refresh_memory();

        let cpu_usage = if system.cpus().is_empty() {
            0.0
        } else {
            let total: f32 = system.cpus().iter().map(|c| c.cpu_usage()).sum();
            (total / system.cpus().len() as f32) as f64
        };

        let memory_usage = if system.total_memory() == 0 {
            0.0
        } else {
            (system.used_memory() as f64 / system.total_memory() as f64) * 100.0
        };

        SystemStats {
            cpu_usage,
            memory_usage,
            uptime: self.started_at.elapsed().as_secs() as i64,
        }
    }
}

/// Legacy placeholder, kept for tests that don't want real system access.
pub struct StubTelemetry;

impl Telemetry for StubTelemetry {
    fn snapshot(&self) -> SystemStats {
        SystemStats {
            cpu_usage: 5.0,
            memory_usage: 20.0,
            uptime: 3600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_reports_legacy_placeholder_values() {
        let stats = StubTelemetry.snapshot();
        assert_eq!(stats.cpu_usage, 5.0);
        assert_eq!(stats.memory_usage, 20.0);
        assert_eq!(stats.uptime, 3600);
    }
}
