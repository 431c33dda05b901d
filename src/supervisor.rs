//! Supervisor: owner of all mailbox agents
//!
//! A registry keyed by [`AccountKey`] behind a single mutex. The supervisor
//! is the only component that creates or destroys agents; at most one agent
//! exists per key at any instant. Agent state transitions fan in here and
//! out to the event bus. Panicked agent tasks are restarted within a fixed
//! budget, then parked in permanent `Error`.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;

use crate::account::{AccountKey, CredentialStore};
use crate::agent::{self, AgentContext, StatusSink};
use crate::config::SyncConfig;
use crate::errors::AppResult;
use crate::events::{EventBus, StatusEvent};
use crate::models::{AgentState, now_iso};
use crate::pipeline::IngestionPipeline;

/// Maximum panic restarts per agent inside [`PANIC_WINDOW`]
const PANIC_RESTART_MAX: usize = 5;

/// Sliding window for the panic restart budget
const PANIC_WINDOW: Duration = Duration::from_secs(60);

/// Pause between stop and start during a rolling restart
const RESTART_PAUSE: Duration = Duration::from_secs(2);

/// Outcome of a start request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// An agent for the key exists in a non-`Stopped` state
    AlreadyRunning,
}

struct AgentHandle {
    /// Distinguishes this registration from a later one under the same key
    serial: u64,
    state: AgentState,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

struct SupervisorInner {
    agents: Mutex<HashMap<AccountKey, AgentHandle>>,
    credentials: Arc<dyn CredentialStore>,
    pipeline: Arc<IngestionPipeline>,
    bus: Arc<EventBus>,
    config: Arc<SyncConfig>,
    serial: AtomicU64,
}

impl StatusSink for SupervisorInner {
    fn publish(&self, key: &AccountKey, state: AgentState) {
        {
            let mut agents = self.agents.lock().expect("supervisor lock poisoned");
            if let Some(handle) = agents.get_mut(key) {
                handle.state = state.clone();
            }
        }
        self.bus.publish_status(StatusEvent {
            user_id: key.user_id.clone(),
            email: key.email.clone(),
            state,
            at: now_iso(),
        });
    }
}

/// Registry and lifecycle manager for mailbox agents
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        pipeline: Arc<IngestionPipeline>,
        bus: Arc<EventBus>,
        config: Arc<SyncConfig>,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                agents: Mutex::new(HashMap::new()),
                credentials,
                pipeline,
                bus,
                config,
                serial: AtomicU64::new(0),
            }),
        }
    }

    /// Start an agent for the key
    ///
    /// Returns `AlreadyRunning` without side effects if a live agent exists.
    /// A finished (`Stopped`) entry that was never removed is replaced.
    pub fn start(&self, key: &AccountKey) -> StartOutcome {
        let mut agents = self.inner.agents.lock().expect("supervisor lock poisoned");
        if let Some(existing) = agents.get(key)
            && existing.state != AgentState::Stopped
        {
            return StartOutcome::AlreadyRunning;
        }

        let serial = self.inner.serial.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        agents.insert(
            key.clone(),
            AgentHandle {
                serial,
                state: AgentState::Starting,
                cancel: cancel.clone(),
                task: None,
            },
        );

        let task = tokio::spawn(supervised_agent(self.inner.clone(), key.clone(), cancel));
        if let Some(handle) = agents.get_mut(key) {
            handle.task = Some(task);
        }
        tracing::info!(key = %key, serial, "agent started");
        StartOutcome::Started
    }

    /// Stop the agent for the key, waiting until it reaches `Stopped`
    ///
    /// Idempotent; the entry is removed after termination.
    pub async fn stop(&self, key: &AccountKey) {
        let taken = {
            let mut agents = self.inner.agents.lock().expect("supervisor lock poisoned");
            agents.get_mut(key).map(|handle| {
                handle.cancel.cancel();
                (handle.serial, handle.task.take())
            })
        };
        let Some((serial, task)) = taken else {
            return;
        };

        if let Some(task) = task {
            if let Err(error) = task.await {
                tracing::warn!(key = %key, %error, "agent task join failed during stop");
            }
        }

        let mut agents = self.inner.agents.lock().expect("supervisor lock poisoned");
        if agents.get(key).is_some_and(|handle| handle.serial == serial) {
            agents.remove(key);
        }
        tracing::info!(key = %key, "agent stopped");
    }

    /// Stop every agent belonging to a user
    pub async fn stop_all(&self, user_id: &str) {
        let keys = self.keys_for(user_id);
        futures::future::join_all(keys.iter().map(|key| self.stop(key))).await;
    }

    /// Last published state per mailbox for a user
    pub fn status(&self, user_id: &str) -> Vec<(String, AgentState)> {
        let agents = self.inner.agents.lock().expect("supervisor lock poisoned");
        let mut statuses: Vec<(String, AgentState)> = agents
            .iter()
            .filter(|(key, _)| key.user_id == user_id)
            .map(|(key, handle)| (key.email.clone(), handle.state.clone()))
            .collect();
        statuses.sort_by(|a, b| a.0.cmp(&b.0));
        statuses
    }

    /// Number of registered agents across all users
    pub fn agent_count(&self) -> usize {
        self.inner.agents.lock().expect("supervisor lock poisoned").len()
    }

    /// Rolling restart of every agent
    ///
    /// Stops each agent, pauses, and starts it again. Failures are logged
    /// and do not abort the loop.
    pub async fn restart_all(&self) {
        let keys: Vec<AccountKey> = {
            let agents = self.inner.agents.lock().expect("supervisor lock poisoned");
            agents.keys().cloned().collect()
        };

        for key in keys {
            self.stop(&key).await;
            tokio::time::sleep(RESTART_PAUSE).await;
            if self.start(&key) == StartOutcome::AlreadyRunning {
                tracing::warn!(key = %key, "agent reappeared during rolling restart");
            }
        }
    }

    /// Start agents for every stored credential of a user
    ///
    /// Existing agents are left untouched.
    pub async fn ensure_for_user(&self, user_id: &str) -> AppResult<()> {
        let emails = self.inner.credentials.list(user_id).await?;
        for email in emails {
            let key = AccountKey::new(user_id, email);
            // AlreadyRunning is the expected case for a reconnecting user.
            let _ = self.start(&key);
        }
        Ok(())
    }

    /// Stop everything, force-terminating past the deadline
    ///
    /// Agents that do not stop within the configured deadline are aborted
    /// and their `Stopped` transition is published on their behalf.
    pub async fn shutdown(&self) {
        let mut tasks: Vec<(AccountKey, JoinHandle<()>)> = Vec::new();
        {
            let mut agents = self.inner.agents.lock().expect("supervisor lock poisoned");
            for (key, handle) in agents.iter_mut() {
                handle.cancel.cancel();
                if let Some(task) = handle.task.take() {
                    tasks.push((key.clone(), task));
                }
            }
        }
        tracing::info!(agents = tasks.len(), "supervisor shutdown initiated");

        let joined = timeout(
            self.inner.config.shutdown_deadline,
            futures::future::join_all(tasks.iter_mut().map(|(_, task)| task)),
        )
        .await;

        if joined.is_err() {
            for (key, task) in &tasks {
                if !task.is_finished() {
                    task.abort();
                    tracing::warn!(key = %key, "agent force-terminated at shutdown deadline");
                    self.inner.publish(key, AgentState::Stopped);
                }
            }
        }

        let mut agents = self.inner.agents.lock().expect("supervisor lock poisoned");
        agents.clear();
    }

    fn keys_for(&self, user_id: &str) -> Vec<AccountKey> {
        let agents = self.inner.agents.lock().expect("supervisor lock poisoned");
        agents
            .keys()
            .filter(|key| key.user_id == user_id)
            .cloned()
            .collect()
    }
}

/// Agent task wrapper enforcing the panic restart budget
async fn supervised_agent(
    inner: Arc<SupervisorInner>,
    key: AccountKey,
    cancel: CancellationToken,
) {
    let mut restarts: VecDeque<Instant> = VecDeque::new();
    loop {
        let ctx = AgentContext {
            key: key.clone(),
            credentials: inner.credentials.clone(),
            pipeline: inner.pipeline.clone(),
            status: inner.clone(),
            config: inner.config.clone(),
            cancel: cancel.clone(),
        };

        match AssertUnwindSafe(agent::run(ctx)).catch_unwind().await {
            // run() published Stopped itself; the registry entry is removed
            // by the stop path that joined us.
            Ok(()) => break,
            Err(_) => {
                let now = Instant::now();
                restarts.push_back(now);
                while restarts
                    .front()
                    .is_some_and(|t| now.duration_since(*t) > PANIC_WINDOW)
                {
                    restarts.pop_front();
                }

                if restarts.len() > PANIC_RESTART_MAX {
                    tracing::error!(key = %key, "panic restart budget exhausted, agent parked");
                    inner.publish(
                        &key,
                        AgentState::Error("agent panicked repeatedly; manual restart required".to_owned()),
                    );
                    cancel.cancelled().await;
                    inner.publish(&key, AgentState::Stopped);
                    break;
                }
                tracing::error!(key = %key, restarts = restarts.len(), "agent panicked, restarting");
            }
        }
    }
}
