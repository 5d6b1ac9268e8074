//! Drives the Agent Registry and Payload Codec directly, without opening
//! any real network sockets.

use api::gen::c2::v1 as pb;
use c2_server::codec;
use c2_server::registry::Registry;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn agent_info(hostname: &str) -> pb::AgentInfo {
    pb::AgentInfo {
        agent_id: String::new(),
        hostname: hostname.to_string(),
        os: "linux".to_string(),
        architecture: "amd64".to_string(),
        ip_address: "10.0.0.9".to_string(),
        username: "root".to_string(),
        registration_time: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64,
    }
}

#[test]
fn register_then_list_reports_the_agent() {
    let registry = Registry::new();
    let id = registry.register(agent_info("web-01"));

    let agents = registry.list();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].agent_id, id);
    assert_eq!(agents[0].hostname, "web-01");
}

#[test]
fn heartbeat_refreshes_liveness_for_a_known_agent() {
    let registry = Registry::new();
    let id = registry.register(agent_info("web-02"));

    let stats = pb::SystemStats {
        cpu_usage: 12.5,
        memory_usage: 40.0,
        uptime: 9001,
    };
    registry
        .heartbeat(&id, "10.0.0.10", Some(&stats))
        .expect("heartbeat on a registered agent must succeed");

    let agent = registry.get(&id).expect("agent must still be registered");
    assert!(agent.is_active());
    assert_eq!(agent.info.read().ip_address, "10.0.0.10");
}

#[tokio::test]
async fn issue_command_delivers_a_codec_encoded_directive_to_the_mailbox() {
    let registry = Registry::new();
    let id = registry.register(agent_info("web-03"));
    let agent = registry.get(&id).unwrap();
    let (_guard, outbound_rx) = agent.acquire_stream().expect("fresh mailbox");
    let mut outbound = outbound_rx.lock().await;

    let issuer = {
        let registry = registry.clone();
        let id = id.clone();
        tokio::spawn(async move {
            registry
                .issue_command(&id, "shell", b"whoami".to_vec(), Duration::from_secs(2))
                .await
        })
    };

    let queued = outbound
        .recv()
        .await
        .expect("the issued command must land in the outbound mailbox");
    assert_eq!(queued.command_type, "shell");

    let directive = codec::encode(&queued.command_type, &queued.payload);
    assert_eq!(directive, b"shell:whoami");

    let response = pb::CommandResponse {
        command_id: queued.id.clone(),
        success: true,
        result: b"root".to_vec(),
        error_message: String::new(),
        timestamp: 0,
    };
    agent.deliver_response(response);

    let resolved = issuer
        .await
        .expect("issuer task must not panic")
        .expect("issue_command must resolve once the response arrives");
    assert_eq!(resolved.result, b"root");
    assert!(resolved.success);
}

#[tokio::test]
async fn issue_command_against_an_unknown_agent_is_rejected() {
    let registry = Registry::new();
    let err = registry
        .issue_command("agent-ghost", "shell", vec![], Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        c2_server::registry::IssueError::NotRegistered(_)
    ));
}

#[test]
fn reconnecting_the_same_host_reuses_the_agent_id_and_resets_mailboxes() {
    let registry = Registry::new();
    let first_id = registry.register(agent_info("db-01"));
    // Attach a stream so the slot is held; a reconnect must still hand
    // back a fresh, attachable mailbox rather than leaving it locked out.
    let _guard = registry.get(&first_id).unwrap().acquire_stream().unwrap();

    let second_id = registry.register(agent_info("db-01"));
    assert_eq!(first_id, second_id);

    let agent = registry.get(&second_id).unwrap();
    assert!(agent.acquire_stream().is_some());
}
