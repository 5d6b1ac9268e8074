//! In-memory table of live agents, their mailboxes, and their liveness.

use crate::identity;
use api::gen::c2::v1 as pb;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::time::timeout;

/// Shared handle onto an agent's outbound command queue. Kept behind a
/// mutex rather than handed out by value so a bare stream reconnect (no
/// re-registration) can reattach to the same queue instead of losing
/// whatever was enqueued while no stream was attached.
pub type OutboundReceiver = Arc<AsyncMutex<mpsc::Receiver<pb::Command>>>;

/// Commands/responses mailboxes are bounded at this capacity.
pub const MAILBOX_CAPACITY: usize = 100;

/// An agent is considered active iff it has been seen within this window.
pub const LIVENESS_THRESHOLD: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum HeartbeatError {
    #[error("Agent not registered")]
    NotRegistered,
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("agent {0} not registered")]
    NotRegistered(String),
    #[error("command queue full for agent {0}")]
    QueueFull(String),
}

#[derive(Debug, Error)]
pub enum IssueError {
    #[error("agent {0} not registered")]
    NotRegistered(String),
    #[error("command queue full for agent {0}")]
    QueueFull(String),
}

/// Bounded, non-blocking-enqueue queues attached to one agent. Replaced
/// wholesale on reconnect; dropping the old pair closes both halves.
struct Mailboxes {
    outbound_tx: mpsc::Sender<pb::Command>,
    outbound_rx: OutboundReceiver,
    /// Landing zone for responses that arrive with no registered waiter —
    /// either unsolicited agent output, or a response that arrived after
    /// its waiter already timed out.
    unsolicited_tx: mpsc::Sender<pb::CommandResponse>,
    unsolicited_rx: RwLock<Option<mpsc::Receiver<pb::CommandResponse>>>,
}

impl Mailboxes {
    fn new() -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (unsolicited_tx, unsolicited_rx) = mpsc::channel(MAILBOX_CAPACITY);
        Self {
            outbound_tx,
            outbound_rx: Arc::new(AsyncMutex::new(outbound_rx)),
            unsolicited_tx,
            unsolicited_rx: RwLock::new(Some(unsolicited_rx)),
        }
    }
}

/// Held for the lifetime of one `SendCommands` stream session. Dropping it
/// (session ends, either side) clears the agent's `stream_active` flag so
/// a later bare reconnect can reattach to the same outbound queue without
/// re-registering.
pub struct StreamGuard {
    agent: Arc<Agent>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.agent.stream_active.store(false, Ordering::SeqCst);
    }
}

/// Server-resident record for one agent.
pub struct Agent {
    pub info: RwLock<pb::AgentInfo>,
    pub last_seen: RwLock<Instant>,
    mailboxes: RwLock<Mailboxes>,
    /// Response Correlator slots: one-shot waiters keyed by the
    /// `CommandId` they are waiting on, registered before the command is
    /// enqueued.
    pending: DashMap<String, oneshot::Sender<pb::CommandResponse>>,
    /// Set while a `SendCommands` stream session holds this agent's
    /// outbound queue; guards against two concurrent sessions racing on
    /// the same mailbox.
    stream_active: AtomicBool,
}

impl Agent {
    fn new(info: pb::AgentInfo) -> Self {
        Self {
            info: RwLock::new(info),
            last_seen: RwLock::new(Instant::now()),
            mailboxes: RwLock::new(Mailboxes::new()),
            pending: DashMap::new(),
            stream_active: AtomicBool::new(false),
        }
    }

    pub fn is_active(&self) -> bool {
        self.last_seen.read().elapsed() <= LIVENESS_THRESHOLD
    }

    pub fn touch(&self) {
        *self.last_seen.write() = Instant::now();
    }

    /// Attaches a `SendCommands` stream session to this agent's outbound
    /// queue. Returns `None` if another session already holds it. The
    /// returned [`StreamGuard`] releases the hold when dropped (session
    /// ends on either side), which is what lets a bare reconnect — a new
    /// `SendCommands` call that skips `RegisterAgent` — reattach to the
    /// same queue rather than being rejected.
    pub fn acquire_stream(self: &Arc<Self>) -> Option<(StreamGuard, OutboundReceiver)> {
        if self.stream_active.swap(true, Ordering::SeqCst) {
            return None;
        }
        let rx = self.mailboxes.read().outbound_rx.clone();
        Some((
            StreamGuard {
                agent: self.clone(),
            },
            rx,
        ))
    }

    pub fn take_unsolicited_receiver(&self) -> Option<mpsc::Receiver<pb::CommandResponse>> {
        self.mailboxes.read().unsolicited_rx.write().take()
    }

    fn outbound_tx(&self) -> mpsc::Sender<pb::Command> {
        self.mailboxes.read().outbound_tx.clone()
    }

    fn unsolicited_tx(&self) -> mpsc::Sender<pb::CommandResponse> {
        self.mailboxes.read().unsolicited_tx.clone()
    }

    /// Resets this agent's mailboxes to a fresh pair, closing the
    /// previous ones by dropping them. Also force-clears `stream_active`:
    /// a full reconnect (re-registration) always wins over whatever
    /// session, if any, was previously attached.
    fn reset_mailboxes(&self) {
        *self.mailboxes.write() = Mailboxes::new();
        self.pending.clear();
        self.stream_active.store(false, Ordering::SeqCst);
    }

    /// Registers a correlator slot for `command_id`. Overwrites any
    /// previous (presumably timed-out) waiter for the same id.
    pub fn register_waiter(&self, command_id: &str) -> oneshot::Receiver<pb::CommandResponse> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(command_id.to_string(), tx);
        rx
    }

    pub fn remove_waiter(&self, command_id: &str) {
        self.pending.remove(command_id);
    }

    /// Hands a response to whichever waiter registered for its
    /// `command_id`; if none is waiting, the response is pushed onto the
    /// unsolicited mailbox instead of being dropped.
    pub fn deliver_response(&self, resp: pb::CommandResponse) {
        if let Some((_, waiter)) = self.pending.remove(&resp.command_id) {
            // The waiter may have timed out and dropped its receiver
            // between removal and send; that is not an error here.
            let _ = waiter.send(resp);
            return;
        }
        let tx = self.unsolicited_tx();
        if tx.try_send(resp).is_err() {
            tracing::warn!("unsolicited response mailbox full or closed, dropping response");
        }
    }
}

/// In-memory registry of all agents known to this process.
pub struct Registry {
    agents: DashMap<String, Arc<Agent>>,
    next_command_seq: AtomicU64,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            agents: DashMap::new(),
            next_command_seq: AtomicU64::new(0),
        })
    }

    /// Implements the Identity Resolver: detects a
    /// reconnect by `(Hostname, OS)`, reassigns the existing AgentId on a
    /// hit, assigns a fresh one otherwise, and installs fresh mailboxes.
    pub fn register(&self, mut info: pb::AgentInfo) -> String {
        // Held across the whole resolve-and-insert sequence: the registry
        // mutex analogue here is DashMap's per-shard lock, but the
        // reconnect scan + insert must still be atomic with respect to
        // other registrations, so the scan-then-insert below accepts
        // that a prior entry may already be in the map under any
        // transiently-stale id: the shard lock taken by the subsequent
        // `entry()` call serialises same-shard traffic, and cross-shard
        // ties are prevented by the nanosecond clock (see `identity`).
        let reconnect_id = identity::find_reconnect(&self.agents, &info.hostname, &info.os);

        let agent_id = match reconnect_id {
            Some(id) => {
                tracing::info!(agent_id = %id, hostname = %info.hostname, "agent reconnected");
                id
            }
            None => {
                let id = identity::generate_agent_id();
                tracing::info!(agent_id = %id, hostname = %info.hostname, "agent registered");
                id
            }
        };

        info.agent_id = agent_id.clone();

        match self.agents.get(&agent_id) {
            Some(existing) => {
                existing.reset_mailboxes();
                *existing.info.write() = info;
                existing.touch();
            }
            None => {
                self.agents.insert(agent_id.clone(), Arc::new(Agent::new(info)));
            }
        }

        agent_id
    }

    pub fn get(&self, id: &str) -> Option<Arc<Agent>> {
        self.agents.get(id).map(|e| e.value().clone())
    }

    /// Updates liveness/IP/stats for a heartbeating agent. Does NOT
    /// create an entry for an unknown id.
    pub fn heartbeat(
        &self,
        id: &str,
        ip_address: &str,
        stats: Option<&pb::SystemStats>,
    ) -> Result<(), HeartbeatError> {
        let agent = self.agents.get(id).ok_or(HeartbeatError::NotRegistered)?;
        agent.touch();
        if !ip_address.is_empty() {
            agent.info.write().ip_address = ip_address.to_string();
        }
        if let Some(stats) = stats {
            tracing::debug!(
                agent_id = id,
                cpu_usage = stats.cpu_usage,
                memory_usage = stats.memory_usage,
                uptime = stats.uptime,
                "heartbeat stats"
            );
        }
        Ok(())
    }

    /// Deep copy of every agent's descriptor, with `registration_time`
    /// overwritten per the freshness-substitution rule below.
    pub fn list(&self) -> Vec<pb::AgentInfo> {
        let now = SystemTime::now();
        self.agents
            .iter()
            .map(|entry| {
                let agent = entry.value();
                let mut info = agent.info.read().clone();
                let last_seen_instant = *agent.last_seen.read();
                let age = last_seen_instant.elapsed();
                info.registration_time = if age < Duration::from_secs(u64::MAX / 2) {
                    unix_seconds(now) - age.as_secs() as i64
                } else if info.registration_time > 0 {
                    info.registration_time
                } else {
                    unix_seconds(now) - 24 * 3600
                };
                info
            })
            .collect()
    }

    pub fn snapshot_one(&self, id: &str) -> Option<pb::AgentInfo> {
        self.list().into_iter().find(|a| a.agent_id == id)
    }

    pub fn active_count(&self) -> usize {
        self.agents.iter().filter(|e| e.value().is_active()).count()
    }

    /// Non-blocking enqueue into the agent's outbound mailbox.
    pub fn enqueue(&self, id: &str, cmd: pb::Command) -> Result<(), EnqueueError> {
        let agent = self
            .agents
            .get(id)
            .ok_or_else(|| EnqueueError::NotRegistered(id.to_string()))?;
        agent
            .outbound_tx()
            .try_send(cmd)
            .map_err(|_| EnqueueError::QueueFull(id.to_string()))
    }

    /// Allocates a unique command id of the form `cmd-<nanos>`.
    pub fn generate_command_id(&self) -> String {
        let seq = self.next_command_seq.fetch_add(1, Ordering::Relaxed);
        format!("cmd-{}-{}", identity::now_nanos(), seq)
    }

    /// Issues a command to `agent_id` and waits up to `wait` for a
    /// correlated response. Returns a synthetic failed response on
    /// timeout rather than an error, so callers never have to special-case
    /// a slow agent.
    pub async fn issue_command(
        &self,
        agent_id: &str,
        command_type: &str,
        payload: Vec<u8>,
        wait: Duration,
    ) -> Result<pb::CommandResponse, IssueError> {
        let agent = self
            .agents
            .get(agent_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| IssueError::NotRegistered(agent_id.to_string()))?;

        let id = self.generate_command_id();
        let cmd = pb::Command {
            id: id.clone(),
            command_type: command_type.to_string(),
            payload,
            timestamp: unix_seconds(SystemTime::now()),
        };

        let rx = agent.register_waiter(&id);

        if let Err(e) = self.enqueue(agent_id, cmd) {
            agent.remove_waiter(&id);
            return Err(match e {
                EnqueueError::NotRegistered(a) => IssueError::NotRegistered(a),
                EnqueueError::QueueFull(a) => IssueError::QueueFull(a),
            });
        }

        match timeout(wait, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) | Err(_) => {
                agent.remove_waiter(&id);
                Ok(pb::CommandResponse {
                    command_id: id,
                    success: false,
                    result: Vec::new(),
                    error_message: format!("Command timed out after {}s", wait.as_secs()),
                    timestamp: unix_seconds(SystemTime::now()),
                })
            }
        }
    }
}

pub fn unix_seconds(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent_info(hostname: &str, os: &str) -> pb::AgentInfo {
        pb::AgentInfo {
            agent_id: String::new(),
            hostname: hostname.to_string(),
            os: os.to_string(),
            architecture: "amd64".to_string(),
            ip_address: "10.0.0.5".to_string(),
            username: "root".to_string(),
            registration_time: unix_seconds(SystemTime::now()),
        }
    }

    #[test]
    fn identity_is_stable_across_reconnects() {
        let registry = Registry::new();
        let id1 = registry.register(agent_info("h1", "linux"));
        let id2 = registry.register(agent_info("h1", "linux"));
        assert_eq!(id1, id2);
    }

    #[test]
    fn distinct_hosts_get_distinct_ids() {
        let registry = Registry::new();
        let id1 = registry.register(agent_info("h1", "linux"));
        let id2 = registry.register(agent_info("h2", "linux"));
        assert_ne!(id1, id2);
    }

    #[test]
    fn heartbeat_on_unknown_agent_does_not_create_one() {
        let registry = Registry::new();
        let err = registry.heartbeat("agent-nope", "1.2.3.4", None);
        assert!(matches!(err, Err(HeartbeatError::NotRegistered)));
        assert!(registry.get("agent-nope").is_none());
    }

    #[test]
    fn mailbox_rejects_101st_enqueue() {
        let registry = Registry::new();
        let id = registry.register(agent_info("h1", "linux"));
        for i in 0..MAILBOX_CAPACITY {
            let cmd = pb::Command {
                id: format!("cmd-{i}"),
                command_type: "shell".into(),
                payload: vec![],
                timestamp: 0,
            };
            registry.enqueue(&id, cmd).expect("capacity not yet exceeded");
        }
        let overflow = pb::Command {
            id: "cmd-overflow".into(),
            command_type: "shell".into(),
            payload: vec![],
            timestamp: 0,
        };
        let err = registry.enqueue(&id, overflow).unwrap_err();
        assert!(matches!(err, EnqueueError::QueueFull(_)));
    }

    #[test]
    fn reconnect_closes_previous_mailbox_receiver() {
        let registry = Registry::new();
        let id = registry.register(agent_info("h1", "linux"));
        let agent = registry.get(&id).unwrap();
        let (_guard, old_rx) = agent.acquire_stream().unwrap();

        // Reconnect: fresh mailboxes installed under the same id.
        registry.register(agent_info("h1", "linux"));

        // The old receiver's sender has been replaced/dropped, so it now
        // observes a closed channel.
        let mut old_rx = old_rx.try_lock().expect("guard still holds sole access");
        assert_eq!(old_rx.try_recv().unwrap_err(), tokio::sync::mpsc::error::TryRecvError::Disconnected);
    }

    #[test]
    fn second_concurrent_stream_is_rejected() {
        let registry = Registry::new();
        let id = registry.register(agent_info("h1", "linux"));
        let agent = registry.get(&id).unwrap();
        let first = agent.acquire_stream();
        assert!(first.is_some());
        assert!(agent.acquire_stream().is_none());
    }

    #[test]
    fn stream_can_reattach_after_the_previous_guard_drops() {
        let registry = Registry::new();
        let id = registry.register(agent_info("h1", "linux"));
        let agent = registry.get(&id).unwrap();

        let (guard, _rx) = agent.acquire_stream().expect("first session attaches");
        assert!(agent.acquire_stream().is_none(), "still held by the first session");

        drop(guard);
        assert!(
            agent.acquire_stream().is_some(),
            "a bare reconnect should reattach once the previous session ends"
        );
    }

    #[tokio::test]
    async fn issue_command_times_out_with_synthetic_failure() {
        let registry = Registry::new();
        let id = registry.register(agent_info("h1", "linux"));

        // Nothing ever drains the outbound mailbox or calls
        // `deliver_response`, so the waiter must time out.
        let resp = registry
            .issue_command(&id, "shell", b"echo hi".to_vec(), Duration::from_millis(50))
            .await
            .expect("unregistered agent would be an error, not a timeout");

        assert!(!resp.success);
        assert!(resp.error_message.starts_with("Command timed out"));
    }

    #[tokio::test]
    async fn deliver_response_resolves_matching_waiter_only() {
        let registry = Registry::new();
        let id = registry.register(agent_info("h1", "linux"));
        let agent = registry.get(&id).unwrap();

        let command_id = registry.generate_command_id();
        let rx = agent.register_waiter(&command_id);

        agent.deliver_response(pb::CommandResponse {
            command_id: "some-other-id".into(),
            success: true,
            result: b"irrelevant".to_vec(),
            error_message: String::new(),
            timestamp: 0,
        });
        agent.deliver_response(pb::CommandResponse {
            command_id: command_id.clone(),
            success: true,
            result: b"hi\n".to_vec(),
            error_message: String::new(),
            timestamp: 0,
        });

        let resp = rx.await.expect("waiter should be resolved");
        assert_eq!(resp.command_id, command_id);
        assert_eq!(resp.result, b"hi\n");
    }
}
