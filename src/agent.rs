//! Mailbox agent: one live IMAP session per account
//!
//! An agent owns exactly one connection for one `(userId, email)`. It
//! connects, backfills a bounded window, then holds IDLE and feeds every
//! new message to the ingestion pipeline in arrival order, never in
//! parallel. Failures recover autonomously through the backoff ladder;
//! authorization failures park the agent until it is stopped or restarted
//! with new credentials. The agent task is the single writer of its state,
//! and every suspension point observes the cancellation token.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_imap::extensions::idle::IdleResponse;
use async_imap::types::Fetch;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::account::{AccountKey, CredentialStore};
use crate::config::SyncConfig;
use crate::errors::AppError;
use crate::imap::{self, ImapSession};
use crate::mime;
use crate::models::{AgentState, RawMessage};
use crate::pipeline::IngestionPipeline;

/// The only folder synchronized in this revision
const FOLDER: &str = "INBOX";

/// Deadline for terminating IDLE on the stop path
const IDLE_DONE_TIMEOUT: Duration = Duration::from_secs(2);

/// Receiver of agent state transitions
///
/// Implemented by the supervisor; publishing must not block, so the sink is
/// synchronous and fans out through the non-blocking event bus.
pub trait StatusSink: Send + Sync {
    fn publish(&self, key: &AccountKey, state: AgentState);
}

/// Everything an agent task needs, supplied at construction
pub struct AgentContext {
    pub key: AccountKey,
    pub credentials: Arc<dyn CredentialStore>,
    pub pipeline: Arc<IngestionPipeline>,
    pub status: Arc<dyn StatusSink>,
    pub config: Arc<SyncConfig>,
    pub cancel: CancellationToken,
}

/// Why one pass through connect/backfill/IDLE ended
enum PassOutcome {
    /// Cancellation observed; leave the loop
    Stop,
    /// Unrecoverable until new credentials arrive; hold `Error` until stopped
    Park(String),
    /// Transient failure; re-enter `Starting` after backoff
    Retry(String),
}

/// Interruption of an operation sequence inside one pass
enum Interrupt {
    Stopped,
    Failed(AppError),
}

/// Run the agent to completion
///
/// Publishes `Stopped` exactly once, as its final transition, on every exit
/// path.
pub async fn run(ctx: AgentContext) {
    let mut attempt: u32 = 0;
    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }
        ctx.status.publish(&ctx.key, AgentState::Starting);

        match sync_pass(&ctx, &mut attempt).await {
            PassOutcome::Stop => break,
            PassOutcome::Park(reason) => {
                tracing::warn!(key = %ctx.key, %reason, "agent parked until restart");
                ctx.status.publish(&ctx.key, AgentState::Error(reason));
                ctx.cancel.cancelled().await;
                break;
            }
            PassOutcome::Retry(reason) => {
                tracing::warn!(key = %ctx.key, attempt, %reason, "agent error, will reconnect");
                ctx.status.publish(&ctx.key, AgentState::Error(reason));
                let delay = backoff_delay(attempt, ctx.config.retry_base, ctx.config.retry_cap);
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    _ = ctx.cancel.cancelled() => break,
                    _ = sleep(delay) => {}
                }
            }
        }
    }
    ctx.status.publish(&ctx.key, AgentState::Stopped);
}

/// One pass: credential, connect, backfill, IDLE until it breaks
async fn sync_pass(ctx: &AgentContext, attempt: &mut u32) -> PassOutcome {
    let credential = tokio::select! {
        _ = ctx.cancel.cancelled() => return PassOutcome::Stop,
        result = ctx.credentials.get_fresh(&ctx.key) => match result {
            Ok(credential) => credential,
            Err(AppError::Unauthorized(_)) => return PassOutcome::Park("unauthorized".to_owned()),
            Err(error) if error.is_retryable() => return PassOutcome::Retry(error.to_string()),
            Err(error) => return PassOutcome::Park(error.to_string()),
        }
    };

    let mut session = tokio::select! {
        _ = ctx.cancel.cancelled() => return PassOutcome::Stop,
        result = imap::connect_authenticated(&ctx.config, &ctx.key, &credential) => match result {
            Ok(session) => session,
            Err(AppError::Unauthorized(_)) => return PassOutcome::Park("unauthorized".to_owned()),
            Err(error) if error.is_retryable() => return PassOutcome::Retry(error.to_string()),
            // Permanent local faults (bad host for SNI, internal bugs) must
            // not spin the reconnect ladder.
            Err(error) => return PassOutcome::Park(error.to_string()),
        }
    };

    // A stop received while connecting must not leave a zombie connection:
    // re-check before the first post-connect state publish.
    if ctx.cancel.is_cancelled() {
        imap::logout_quietly(&mut session).await;
        return PassOutcome::Stop;
    }

    ctx.status.publish(&ctx.key, AgentState::Syncing);

    let mut last_exists = match backfill(ctx, &mut session).await {
        Ok(exists) => exists,
        Err(Interrupt::Stopped) => {
            imap::logout_quietly(&mut session).await;
            return PassOutcome::Stop;
        }
        Err(Interrupt::Failed(error)) => {
            imap::logout_quietly(&mut session).await;
            return PassOutcome::Retry(error.to_string());
        }
    };

    ctx.status.publish(&ctx.key, AgentState::Idle);
    *attempt = 0;

    idle_loop(ctx, session, &mut last_exists).await
}

/// Initial bounded-window fetch
///
/// Selects the inbox, searches `SINCE` the cutoff date, and ingests each
/// hit in ascending UID order. The precise cutoff is enforced client-side
/// against INTERNALDATE; server `SINCE` inclusivity is unreliable.
async fn backfill(ctx: &AgentContext, session: &mut ImapSession) -> Result<u32, Interrupt> {
    let exists = guarded(ctx, imap::select_inbox(&ctx.config, session)).await?;

    let window = chrono::Duration::from_std(ctx.config.backfill_window)
        .unwrap_or_else(|_| chrono::Duration::hours(24));
    let cutoff = Utc::now() - window;

    let uids = guarded(ctx, imap::uid_search_since(&ctx.config, session, cutoff)).await?;
    tracing::info!(key = %ctx.key, candidates = uids.len(), "backfill window selected");

    for uid in uids {
        if ctx.cancel.is_cancelled() {
            return Err(Interrupt::Stopped);
        }
        let Some(fetch) = guarded(ctx, imap::fetch_by_uid(&ctx.config, session, uid)).await? else {
            continue;
        };
        ingest_fetch(ctx, &fetch, Some(cutoff)).await;
    }

    Ok(exists)
}

/// Hold IDLE, cycling proactively and draining EXISTS growth
async fn idle_loop(
    ctx: &AgentContext,
    mut session: ImapSession,
    last_exists: &mut u32,
) -> PassOutcome {
    loop {
        let mut idle = session.idle();
        if let Err(error) = idle.init().await {
            return PassOutcome::Retry(format!("IDLE init failed: {error}"));
        }

        // The wait carries its own deadline: a Timeout response is the
        // proactive cycle that keeps us under server-side IDLE limits.
        let (idle_wait, _interrupt) = idle.wait_with_timeout(ctx.config.idle_max);
        enum IdleEvent {
            Cancelled,
            Response(IdleResponse),
            Failed(String),
        }
        let event = tokio::select! {
            _ = ctx.cancel.cancelled() => IdleEvent::Cancelled,
            result = idle_wait => match result {
                Ok(response) => IdleEvent::Response(response),
                Err(error) => IdleEvent::Failed(format!("IDLE wait failed: {error}")),
            }
        };

        match event {
            IdleEvent::Cancelled => {
                if let Ok(Ok(mut session)) = timeout(IDLE_DONE_TIMEOUT, idle.done()).await {
                    imap::logout_quietly(&mut session).await;
                }
                return PassOutcome::Stop;
            }
            IdleEvent::Failed(reason) => return PassOutcome::Retry(reason),
            IdleEvent::Response(response) => {
                session = match idle.done().await {
                    Ok(session) => session,
                    Err(error) => {
                        return PassOutcome::Retry(format!("IDLE done failed: {error}"));
                    }
                };
                if matches!(response, IdleResponse::NewData(_)) {
                    match drain_new_messages(ctx, &mut session, last_exists).await {
                        Ok(()) => {}
                        Err(Interrupt::Stopped) => {
                            imap::logout_quietly(&mut session).await;
                            return PassOutcome::Stop;
                        }
                        Err(Interrupt::Failed(error)) => {
                            imap::logout_quietly(&mut session).await;
                            return PassOutcome::Retry(error.to_string());
                        }
                    }
                }
            }
        }
    }
}

/// Fetch the messages behind an EXISTS growth, one by one, oldest first
async fn drain_new_messages(
    ctx: &AgentContext,
    session: &mut ImapSession,
    last_exists: &mut u32,
) -> Result<(), Interrupt> {
    // Re-select to learn the fresh EXISTS count; growth since the last
    // observation is the set of new sequence numbers.
    let exists = guarded(ctx, imap::select_inbox(&ctx.config, session)).await?;

    if exists > *last_exists {
        for seq in (*last_exists + 1)..=exists {
            if ctx.cancel.is_cancelled() {
                return Err(Interrupt::Stopped);
            }
            if let Some(fetch) = guarded(ctx, imap::fetch_by_seq(&ctx.config, session, seq)).await?
            {
                ingest_fetch(ctx, &fetch, None).await;
            }
        }
    }
    *last_exists = exists;
    Ok(())
}

/// Convert a fetch into a raw message and hand it to the pipeline
///
/// The hand-off is bounded: past the fetch timeout the message is abandoned
/// and logged, with no state transition.
async fn ingest_fetch(ctx: &AgentContext, fetch: &Fetch, cutoff: Option<DateTime<Utc>>) {
    let Some(uid) = fetch.uid else {
        tracing::warn!(key = %ctx.key, "fetch response without UID, skipped");
        return;
    };
    let internal_date = fetch.internal_date().map(|date| date.with_timezone(&Utc));
    if outside_backfill_window(internal_date, cutoff) {
        tracing::debug!(key = %ctx.key, uid, "message older than backfill cutoff, skipped");
        return;
    }

    let source = fetch.body().map(<[u8]>::to_vec).unwrap_or_default();
    let envelope = mime::message_envelope(fetch, &source);
    let raw = RawMessage {
        uid: u64::from(uid),
        envelope,
        source,
        internal_date,
    };

    match timeout(
        ctx.config.fetch_timeout,
        ctx.pipeline.ingest(&ctx.key, FOLDER, raw),
    )
    .await
    {
        Ok(outcome) => {
            tracing::debug!(key = %ctx.key, uid, ?outcome, "message handed to pipeline");
        }
        Err(_) => {
            tracing::error!(key = %ctx.key, uid, "pipeline hand-off timed out, message abandoned");
        }
    }
}

/// Whether an INTERNALDATE falls before the backfill cutoff
///
/// The cutoff is inclusive: a message dated exactly at it is ingested. A
/// missing INTERNALDATE is never skipped.
fn outside_backfill_window(
    internal_date: Option<DateTime<Utc>>,
    cutoff: Option<DateTime<Utc>>,
) -> bool {
    match (internal_date, cutoff) {
        (Some(date), Some(cutoff)) => date < cutoff,
        _ => false,
    }
}

/// Reconnect delay: `min(base · 2^attempt, cap)` with ±20% jitter
fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exponential = base.saturating_mul(2u32.saturating_pow(attempt.min(16)));
    let capped = exponential.min(cap);
    capped.mul_f64(rand::thread_rng().gen_range(0.8..=1.2))
}

/// Run a fallible operation, aborting promptly on cancellation
async fn guarded<T>(
    ctx: &AgentContext,
    operation: impl Future<Output = crate::errors::AppResult<T>>,
) -> Result<T, Interrupt> {
    tokio::select! {
        _ = ctx.cancel.cancelled() => Err(Interrupt::Stopped),
        result = operation => result.map_err(Interrupt::Failed),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use tokio_util::sync::CancellationToken;

    use super::{AgentContext, StatusSink, backoff_delay, outside_backfill_window, run};
    use crate::account::{AccountKey, MemoryCredentialStore};
    use crate::classify::KeywordClassifier;
    use crate::config::{CredentialSeed, SyncConfig};
    use crate::events::EventBus;
    use crate::index::MemoryIndex;
    use crate::models::AgentState;
    use crate::pipeline::IngestionPipeline;

    struct RecordingSink {
        states: Mutex<Vec<AgentState>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                states: Mutex::new(Vec::new()),
            })
        }

        fn states(&self) -> Vec<AgentState> {
            self.states.lock().unwrap().clone()
        }
    }

    impl StatusSink for RecordingSink {
        fn publish(&self, _key: &AccountKey, state: AgentState) {
            self.states.lock().unwrap().push(state);
        }
    }

    fn test_config() -> SyncConfig {
        SyncConfig {
            backfill_window: Duration::from_secs(86_400),
            idle_max: Duration::from_secs(28 * 60),
            connect_timeout: Duration::from_millis(200),
            fetch_timeout: Duration::from_millis(500),
            retry_base: Duration::from_millis(10),
            retry_cap: Duration::from_millis(40),
            ws_heartbeat: Duration::from_secs(30),
            ws_write_timeout: Duration::from_secs(5),
            session_queue: 256,
            shutdown_deadline: Duration::from_secs(10),
            bind_addr: "127.0.0.1:0".to_owned(),
        }
    }

    fn context(
        credentials: Arc<MemoryCredentialStore>,
        sink: Arc<RecordingSink>,
        cancel: CancellationToken,
    ) -> AgentContext {
        let bus = Arc::new(EventBus::new());
        AgentContext {
            key: AccountKey::new("u1", "a@x.com"),
            credentials,
            pipeline: Arc::new(IngestionPipeline::new(
                Arc::new(MemoryIndex::new()),
                Arc::new(KeywordClassifier),
                bus,
            )),
            status: sink,
            config: Arc::new(test_config()),
            cancel,
        }
    }

    async fn wait_for<F: Fn(&[AgentState]) -> bool>(sink: &RecordingSink, predicate: F) {
        for _ in 0..200 {
            if predicate(&sink.states()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for states, saw {:?}", sink.states());
    }

    #[test]
    fn cutoff_is_inclusive_at_the_boundary() {
        let cutoff = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let just_inside = cutoff + chrono::Duration::milliseconds(1);
        let just_outside = cutoff - chrono::Duration::milliseconds(1);

        assert!(!outside_backfill_window(Some(just_inside), Some(cutoff)));
        assert!(!outside_backfill_window(Some(cutoff), Some(cutoff)));
        assert!(outside_backfill_window(Some(just_outside), Some(cutoff)));
        assert!(!outside_backfill_window(None, Some(cutoff)));
        assert!(!outside_backfill_window(Some(just_outside), None));
    }

    #[test]
    fn backoff_grows_exponentially_within_jitter_bounds() {
        let base = Duration::from_secs(5);
        let cap = Duration::from_secs(60);

        for (attempt, expected_secs) in [(0u32, 5.0f64), (1, 10.0), (2, 20.0), (3, 40.0)] {
            let delay = backoff_delay(attempt, base, cap).as_secs_f64();
            assert!(delay >= expected_secs * 0.8 - f64::EPSILON, "attempt {attempt}: {delay}");
            assert!(delay <= expected_secs * 1.2 + f64::EPSILON, "attempt {attempt}: {delay}");
        }

        // Far past the cap the delay stays bounded by cap plus jitter.
        let capped = backoff_delay(30, base, cap).as_secs_f64();
        assert!(capped <= 60.0 * 1.2 + f64::EPSILON);
        assert!(capped >= 60.0 * 0.8 - f64::EPSILON);
    }

    #[tokio::test]
    async fn missing_credentials_park_the_agent_in_error() {
        let sink = RecordingSink::new();
        let cancel = CancellationToken::new();
        let ctx = context(Arc::new(MemoryCredentialStore::new()), sink.clone(), cancel.clone());

        let task = tokio::spawn(run(ctx));
        wait_for(&sink, |states| {
            states.contains(&AgentState::Error("unauthorized".to_owned()))
        })
        .await;
        assert_eq!(sink.states()[0], AgentState::Starting);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(sink.states().last(), Some(&AgentState::Stopped));
    }

    #[tokio::test]
    async fn connect_failure_recovers_through_starting() {
        let credentials = Arc::new(MemoryCredentialStore::new());
        // Port 1 on loopback: refused or timed out quickly, never an IMAP server.
        credentials
            .put(
                AccountKey::new("u1", "a@x.com"),
                CredentialSeed {
                    user_id: "u1".to_owned(),
                    email: "a@x.com".to_owned(),
                    imap_host: "127.0.0.1".to_owned(),
                    imap_port: 1,
                    access_token: secrecy::SecretString::new("tok".to_owned().into()),
                    refresh_token: None,
                },
            )
            .await;

        let sink = RecordingSink::new();
        let cancel = CancellationToken::new();
        let ctx = context(credentials, sink.clone(), cancel.clone());

        let task = tokio::spawn(run(ctx));
        // Starting → Error → (backoff) → Starting again: the recovery ladder.
        wait_for(&sink, |states| {
            states.iter().filter(|s| **s == AgentState::Starting).count() >= 2
                && states.iter().any(|s| matches!(s, AgentState::Error(_)))
        })
        .await;

        cancel.cancel();
        task.await.unwrap();

        let states = sink.states();
        assert_eq!(states.last(), Some(&AgentState::Stopped));
        assert_eq!(
            states.iter().filter(|s| **s == AgentState::Stopped).count(),
            1
        );
    }

    #[tokio::test]
    async fn stop_during_backoff_exits_promptly() {
        let sink = RecordingSink::new();
        let cancel = CancellationToken::new();
        let ctx = context(Arc::new(MemoryCredentialStore::new()), sink.clone(), cancel.clone());

        let task = tokio::spawn(run(ctx));
        wait_for(&sink, |states| !states.is_empty()).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("agent exits within the stop deadline")
            .unwrap();
        assert_eq!(sink.states().last(), Some(&AgentState::Stopped));
    }
}
