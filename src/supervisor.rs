//! Agent subprocess supervision: on-demand spawn, health probing, restart
//! with capped exponential backoff, idle reaping, adoption of an existing
//! instance, and graceful two-phase termination.
//!
//! The supervisor is the only component that holds subprocess handles or
//! restart counters. Everything else asks it for a port.

mod catalog;

pub use catalog::{find as find_agent, AgentDialect, AgentSpec, CATALOG};

use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Health probe timeout per request.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
/// Interval between probes while waiting for a fresh process.
const PROBE_INTERVAL: Duration = Duration::from_millis(500);
/// Total budget for a spawned process to come up healthy.
const PROBE_BUDGET: Duration = Duration::from_secs(10);
/// An unused agent is reaped after this long.
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);
/// Grace between soft and hard signal for targeted stops.
const STOP_GRACE: Duration = Duration::from_secs(3);
/// Grace between soft and hard signal for idle reaping and `stop_all`.
const REAP_GRACE: Duration = Duration::from_secs(5);
/// Rolling window over which restarts are counted.
const RESTART_WINDOW: Duration = Duration::from_secs(300);
/// Exits inside the window after which the supervisor gives up.
const MAX_RESTARTS_IN_WINDOW: usize = 10;
/// Base and cap for the exponential restart delay.
const BACKOFF_BASE_MS: u64 = 1000;
const BACKOFF_CAP_MS: u64 = 30_000;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),
    #[error("Agent unavailable: {0}")]
    Unavailable(String),
}

/// Delay before the next restart given the number of recent restarts.
/// Doubles from one second, capped at thirty.
pub fn restart_delay(recent_restarts: usize) -> Duration {
    let exp = u32::try_from(recent_restarts.min(15)).unwrap_or(15);
    let ms = BACKOFF_BASE_MS.saturating_mul(1u64 << exp);
    Duration::from_millis(ms.min(BACKOFF_CAP_MS))
}

/// Drop timestamps older than the rolling window and return how many remain.
pub fn prune_restart_window(restarts: &mut Vec<Instant>, now: Instant) -> usize {
    restarts.retain(|t| now.duration_since(*t) < RESTART_WINDOW);
    restarts.len()
}

/// Per-agent live state. Exactly one entry per running (or restarting) agent.
struct AgentProcess {
    /// Pid of the child. `None` while a restart is pending or the instance
    /// is adopted and we never learned it.
    pid: Option<i32>,
    port: u16,
    last_started_at: Instant,
    restarts: Vec<Instant>,
    healthy: bool,
    last_used_at: Instant,
    stopping: bool,
    adopted: bool,
    idle_task: Option<JoinHandle<()>>,
}

impl AgentProcess {
    fn new(spec: &AgentSpec) -> Self {
        let now = Instant::now();
        Self {
            pid: None,
            port: spec.health_port,
            last_started_at: now,
            restarts: Vec::new(),
            healthy: false,
            last_used_at: now,
            stopping: false,
            adopted: false,
            idle_task: None,
        }
    }
}

/// Snapshot row returned by `status()`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub id: String,
    pub running: bool,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    pub uptime_ms: u64,
    pub restart_count: usize,
    pub idle_ms: u64,
    pub adopted: bool,
}

pub struct Supervisor {
    http: reqwest::Client,
    agents: Mutex<HashMap<String, AgentProcess>>,
    shutting_down: AtomicBool,
}

impl Supervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            http: reqwest::Client::new(),
            agents: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    // ==================== Public Contract ====================

    /// Ensure the agent's service process is up and healthy; return its port.
    ///
    /// Healthy instance: refreshes the idle timer and returns immediately.
    /// Existing process on the target port: adopted (never owned, never
    /// restarted). Otherwise a fresh process is spawned and probed every
    /// 500 ms for up to 10 s.
    pub async fn ensure_running(self: &Arc<Self>, agent_id: &str) -> Result<u16, SupervisorError> {
        let spec = catalog::find(agent_id)
            .ok_or_else(|| SupervisorError::UnknownAgent(agent_id.to_string()))?;

        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SupervisorError::Unavailable("server shutting down".into()));
        }

        let mut spawned_here = false;
        {
            let mut agents = self.agents.lock().await;
            match agents.get_mut(agent_id) {
                Some(agent) if agent.healthy && !agent.stopping => {
                    agent.last_used_at = Instant::now();
                    Self::arm_idle_timer(self, agent_id, agent);
                    return Ok(agent.port);
                }
                Some(_) => {
                    // A start or restart is already in flight; fall through to
                    // the probe loop without spawning a second process.
                }
                None => {
                    agents.insert(agent_id.to_string(), AgentProcess::new(spec));
                    spawned_here = true;
                }
            }
        }

        if spawned_here {
            // Adoption: something already answers on the fixed port.
            if self.probe(spec.health_port).await {
                let mut agents = self.agents.lock().await;
                if let Some(agent) = agents.get_mut(agent_id) {
                    agent.healthy = true;
                    agent.adopted = true;
                    agent.last_used_at = Instant::now();
                }
                tracing::info!(agent = agent_id, port = spec.health_port, "Adopted running agent");
                return Ok(spec.health_port);
            }

            if let Err(e) = self.spawn_process(spec).await {
                self.agents.lock().await.remove(agent_id);
                return Err(e);
            }
        }

        // Probe until healthy or the budget runs out.
        let deadline = Instant::now() + PROBE_BUDGET;
        loop {
            if self.probe(spec.health_port).await {
                let mut agents = self.agents.lock().await;
                if let Some(agent) = agents.get_mut(agent_id) {
                    agent.healthy = true;
                    agent.last_used_at = Instant::now();
                    Self::arm_idle_timer(self, agent_id, agent);
                }
                return Ok(spec.health_port);
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }

        if spawned_here {
            self.stop_agent(agent_id, STOP_GRACE).await;
        }
        Err(SupervisorError::Unavailable(format!(
            "{agent_id} did not become healthy within {PROBE_BUDGET:?} (is {} installed? package {})",
            spec.binary, spec.package
        )))
    }

    /// Extend the idle timer for an agent that just did work.
    pub async fn touch(self: &Arc<Self>, agent_id: &str) {
        let mut agents = self.agents.lock().await;
        if let Some(agent) = agents.get_mut(agent_id) {
            agent.last_used_at = Instant::now();
            Self::arm_idle_timer(self, agent_id, agent);
        }
    }

    /// Snapshot of every tracked agent.
    pub async fn status(&self) -> Vec<AgentStatus> {
        let now = Instant::now();
        let agents = self.agents.lock().await;
        let mut out: Vec<AgentStatus> = agents
            .iter()
            .map(|(id, a)| AgentStatus {
                id: id.clone(),
                running: a.pid.is_some() || a.adopted,
                healthy: a.healthy,
                pid: a.pid,
                uptime_ms: u64::try_from(now.duration_since(a.last_started_at).as_millis())
                    .unwrap_or(u64::MAX),
                restart_count: a.restarts.len(),
                idle_ms: u64::try_from(now.duration_since(a.last_used_at).as_millis())
                    .unwrap_or(u64::MAX),
                adopted: a.adopted,
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Stop and re-spawn an agent, resetting its restart history.
    pub async fn restart(self: &Arc<Self>, agent_id: &str) -> Result<u16, SupervisorError> {
        catalog::find(agent_id)
            .ok_or_else(|| SupervisorError::UnknownAgent(agent_id.to_string()))?;
        self.stop_agent(agent_id, STOP_GRACE).await;
        self.ensure_running(agent_id).await
    }

    /// One-shot query of the agent's provider endpoint for its model list.
    /// Any failure collapses to an empty list.
    pub async fn query_models(&self, agent_id: &str) -> Vec<serde_json::Value> {
        let Some(spec) = catalog::find(agent_id) else {
            return Vec::new();
        };
        let url = format!("http://127.0.0.1:{}/provider/models", spec.health_port);
        let response = self.http.get(&url).timeout(PROBE_TIMEOUT).send().await;
        match response {
            Ok(resp) if resp.status().is_success() => resp
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v.as_array().cloned())
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Shut everything down: cancel timers, soft-stop every child, escalate
    /// to hard-stop after the grace window.
    pub async fn stop_all(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let targets: Vec<(String, Option<i32>)> = {
            let mut agents = self.agents.lock().await;
            agents
                .iter_mut()
                .map(|(id, a)| {
                    a.stopping = true;
                    if let Some(task) = a.idle_task.take() {
                        task.abort();
                    }
                    // Adopted processes are not ours to stop.
                    (id.clone(), if a.adopted { None } else { a.pid })
                })
                .collect()
        };

        for (id, pid) in &targets {
            if let Some(pid) = pid {
                tracing::info!(agent = %id, pid, "Soft-stopping agent");
                signal_tree(*pid, Signal::SIGTERM);
            }
        }

        tokio::time::sleep(REAP_GRACE).await;

        for (id, pid) in &targets {
            if let Some(pid) = pid {
                if process_alive(*pid) {
                    tracing::warn!(agent = %id, pid, "Escalating to SIGKILL");
                    signal_tree(*pid, Signal::SIGKILL);
                }
            }
        }

        self.agents.lock().await.clear();
        tracing::info!("All agents stopped");
    }

    // ==================== Internals ====================

    async fn probe(&self, port: u16) -> bool {
        let url = format!("http://127.0.0.1:{port}/provider");
        matches!(
            self.http.get(&url).timeout(PROBE_TIMEOUT).send().await,
            Ok(resp) if resp.status().is_success()
        )
    }

    /// Spawn the service process and attach the exit watcher.
    ///
    /// Returns a manually boxed future (rather than `async fn`) because this
    /// function participates in a call cycle with `on_exit`/`respawn`
    /// (reached via the spawned retry task below); rustc cannot resolve the
    /// opaque `impl Future` type for mutually-recursive async fns, so the
    /// cycle is broken here by erasing the type.
    fn spawn_process(
        self: &Arc<Self>,
        spec: &'static AgentSpec,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), SupervisorError>> + Send + '_>>
    {
        Box::pin(self.spawn_process_inner(spec))
    }

    async fn spawn_process_inner(
        self: &Arc<Self>,
        spec: &'static AgentSpec,
    ) -> Result<(), SupervisorError> {
        let mut cmd = Command::new(spec.binary);
        cmd.args(spec.launch_args)
            .env("PORT", spec.health_port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        // Own process group so signals reach nested children.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0))
                    .ok();
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|e| {
            SupervisorError::Unavailable(format!(
                "failed to spawn {} ({}): {e}",
                spec.binary, spec.package
            ))
        })?;

        let pid = child.id().and_then(|p| i32::try_from(p).ok());
        tracing::info!(agent = spec.id, ?pid, "Spawned agent process");

        if let Some(stderr) = child.stderr.take() {
            let agent_id = spec.id;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "agent_stderr", agent = agent_id, "{line}");
                }
            });
        }

        {
            let mut agents = self.agents.lock().await;
            if let Some(agent) = agents.get_mut(spec.id) {
                agent.pid = pid;
                agent.last_started_at = Instant::now();
                agent.healthy = false;
                agent.adopted = false;
            }
        }

        let supervisor = Arc::clone(self);
        let agent_id = spec.id.to_string();
        tokio::spawn(async move {
            let status = child.wait().await.ok();
            supervisor
                .on_exit(&agent_id, status.and_then(|s| s.code()), pid)
                .await;
        });

        Ok(())
    }

    /// Child exited. Either a stop we initiated, or an unexpected death that
    /// triggers the backoff policy.
    async fn on_exit(self: &Arc<Self>, agent_id: &str, exit_code: Option<i32>, watcher_pid: Option<i32>) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        let delay = {
            let mut agents = self.agents.lock().await;
            let Some(agent) = agents.get_mut(agent_id) else {
                return;
            };
            // A watcher for a process this entry no longer tracks is stale
            // (the agent was already restarted).
            if watcher_pid.is_some() && agent.pid != watcher_pid {
                return;
            }
            if agent.stopping {
                agents.remove(agent_id);
                return;
            }

            agent.healthy = false;
            agent.pid = None;
            let recent = prune_restart_window(&mut agent.restarts, Instant::now());
            if recent >= MAX_RESTARTS_IN_WINDOW {
                tracing::warn!(
                    agent = agent_id,
                    recent,
                    "Restart storm: giving up on agent until explicit restart"
                );
                if let Some(task) = agent.idle_task.take() {
                    task.abort();
                }
                agents.remove(agent_id);
                return;
            }
            restart_delay(recent)
        };

        tracing::warn!(
            agent = agent_id,
            ?exit_code,
            delay_ms = delay.as_millis() as u64,
            "Agent exited unexpectedly; restart scheduled"
        );

        let supervisor = Arc::clone(self);
        let agent_id = agent_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            supervisor.respawn(&agent_id).await;
        });
    }

    /// Bring a dead agent back. The restart timestamp is appended only after
    /// the new process has actually started.
    ///
    /// Returns a manually boxed future (rather than `async fn`) because this
    /// function and `on_exit` call each other (directly here, and via the
    /// spawned retry task in `on_exit`); rustc cannot resolve the opaque
    /// `impl Future` type for mutually-recursive async fns, so the cycle is
    /// broken here by erasing the type.
    fn respawn<'a>(
        self: &'a Arc<Self>,
        agent_id: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(self.respawn_inner(agent_id))
    }

    async fn respawn_inner(self: &Arc<Self>, agent_id: &str) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let Some(spec) = catalog::find(agent_id) else {
            return;
        };
        {
            let agents = self.agents.lock().await;
            match agents.get(agent_id) {
                Some(agent) if !agent.stopping => {}
                _ => return,
            }
        }

        if self.spawn_process(spec).await.is_err() {
            // Spawn itself failed; treat like another exit so backoff applies.
            self.on_exit(agent_id, None, None).await;
            return;
        }

        {
            let mut agents = self.agents.lock().await;
            if let Some(agent) = agents.get_mut(agent_id) {
                agent.restarts.push(Instant::now());
            }
        }

        // Flip the healthy flag in the background once the probe answers.
        let supervisor = Arc::clone(self);
        let agent_id = agent_id.to_string();
        let port = spec.health_port;
        tokio::spawn(async move {
            let deadline = Instant::now() + PROBE_BUDGET;
            while Instant::now() < deadline {
                if supervisor.probe(port).await {
                    let mut agents = supervisor.agents.lock().await;
                    if let Some(agent) = agents.get_mut(&agent_id) {
                        agent.healthy = true;
                    }
                    return;
                }
                tokio::time::sleep(PROBE_INTERVAL).await;
            }
        });
    }

    /// Reset (or start) the idle timer for an agent entry. Adopted instances
    /// are externally owned and never reaped.
    fn arm_idle_timer(supervisor: &Arc<Self>, agent_id: &str, agent: &mut AgentProcess) {
        if agent.adopted {
            return;
        }
        if let Some(task) = agent.idle_task.take() {
            task.abort();
        }
        let supervisor = Arc::clone(supervisor);
        let agent_id = agent_id.to_string();
        agent.idle_task = Some(tokio::spawn(async move {
            tokio::time::sleep(IDLE_TIMEOUT).await;
            supervisor.reap_idle(&agent_id).await;
        }));
    }

    /// Idle timer fired: stop and forget the agent. The next `ensure_running`
    /// cold-starts it.
    async fn reap_idle(self: &Arc<Self>, agent_id: &str) {
        {
            let mut agents = self.agents.lock().await;
            let Some(agent) = agents.get_mut(agent_id) else {
                return;
            };
            // A touch may have raced the timer firing.
            if agent.stopping || agent.last_used_at.elapsed() < IDLE_TIMEOUT {
                return;
            }
            agent.stopping = true;
        }
        tracing::info!(agent = agent_id, "Idle timeout; stopping agent");
        self.stop_agent(agent_id, REAP_GRACE).await;
    }

    /// Two-phase termination: soft signal, grace, hard signal, remove.
    async fn stop_agent(&self, agent_id: &str, grace: Duration) {
        let pid = {
            let mut agents = self.agents.lock().await;
            let Some(agent) = agents.get_mut(agent_id) else {
                return;
            };
            agent.stopping = true;
            agent.healthy = false;
            if let Some(task) = agent.idle_task.take() {
                task.abort();
            }
            if agent.adopted {
                // Not ours: forget the entry, leave the process alone.
                agents.remove(agent_id);
                return;
            }
            agent.pid
        };

        if let Some(pid) = pid {
            signal_tree(pid, Signal::SIGTERM);
            tokio::time::sleep(grace).await;
            if process_alive(pid) {
                tracing::warn!(agent = agent_id, pid, "Process survived SIGTERM; sending SIGKILL");
                signal_tree(pid, Signal::SIGKILL);
            }
        }

        self.agents.lock().await.remove(agent_id);
    }
}

/// Signal the child's process group when it made one, falling back to the
/// process itself.
fn signal_tree(pid: i32, sig: Signal) {
    if killpg(Pid::from_raw(pid), sig).is_err() {
        let _ = kill(Pid::from_raw(pid), sig);
    }
}

/// `kill(pid, 0)` liveness check.
fn process_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}
