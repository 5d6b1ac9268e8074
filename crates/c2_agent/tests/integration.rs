//! Drives the directive Executor and Telemetry provider directly,
//! without dialing a real server.

use c2_agent::executor::Executor;
use c2_agent::telemetry::{StubTelemetry, Telemetry};

#[tokio::test]
async fn shell_directive_round_trips_through_the_executor() {
    let executor = Executor::new();
    let result = executor.execute("shell:echo integration").await;
    assert_eq!(String::from_utf8_lossy(&result).trim(), "integration");
}

#[tokio::test]
async fn interactive_session_accepts_input_and_replays_output() {
    let executor = Executor::new();
    let started = executor.execute("interactive:").await;
    assert_eq!(started, b"Interactive shell session started");

    let sent = executor.execute("input:echo from-interactive").await;
    assert_eq!(sent, b"Input sent successfully");

    // Give the child process a moment to produce output before polling;
    // poll_output itself waits up to its own deadline.
    let mut collected = Vec::new();
    for _ in 0..10 {
        let chunk = executor.execute("output:").await;
        if chunk.is_empty() {
            continue;
        }
        collected.extend_from_slice(&chunk);
        if String::from_utf8_lossy(&collected).contains("from-interactive") {
            break;
        }
    }
    assert!(String::from_utf8_lossy(&collected).contains("from-interactive"));
}

#[test]
fn stub_telemetry_matches_the_legacy_placeholder_contract() {
    let stats = StubTelemetry.snapshot();
    assert_eq!(stats.cpu_usage, 5.0);
    assert_eq!(stats.memory_usage, 20.0);
    assert_eq!(stats.uptime, 3600);
}
