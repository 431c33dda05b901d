//! inboxd: multi-tenant IMAP sync daemon
//!
//! Maintains real-time synchronization with remote IMAP mailboxes: one
//! supervised IDLE agent per (user, mailbox), exactly-once ingestion into a
//! searchable index, classification of every message, and live WebSocket
//! notifications to connected clients.
//!
//! # Architecture
//!
//! - [`main`]: Process entry point with env loading and graceful shutdown
//! - [`config`]: Environment-driven settings and development seeds
//! - [`errors`]: Application error model grouped by recovery class
//! - [`models`]: Core data model and WebSocket frame unions
//! - [`account`]: Account identity, credentials, token verification
//! - [`index`]: Full-text index interface with explicit outcome kinds
//! - [`classify`]: Category model adapter and deterministic fallback
//! - [`events`]: Typed in-process event bus with bounded queues
//! - [`imap`]: IMAP transport/session operations with timeout wrappers
//! - [`mime`]: Header extraction and body decoding
//! - [`pipeline`]: Dedupe → classify → index → notify
//! - [`agent`]: Per-account IMAP IDLE worker with autonomous recovery
//! - [`supervisor`]: Agent registry and lifecycle owner
//! - [`hub`]: WebSocket session registry and event fan-out

mod account;
mod agent;
mod classify;
mod config;
mod errors;
mod events;
mod hub;
mod imap;
mod index;
mod mime;
mod models;
mod pipeline;
mod supervisor;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::account::{MemoryCredentialStore, StaticTokenVerifier};
use crate::classify::KeywordClassifier;
use crate::config::SyncConfig;
use crate::events::EventBus;
use crate::hub::SessionHub;
use crate::index::MemoryIndex;
use crate::pipeline::IngestionPipeline;
use crate::supervisor::Supervisor;

/// Application entry point
///
/// Initializes tracing from environment, loads config, wires the sync core,
/// and serves the WebSocket surface until interrupted. On ctrl-c the
/// listener drains and every agent is stopped within the shutdown deadline.
///
/// # Environment Variables
///
/// See [`SyncConfig::load_from_env`] for tuning knobs,
/// [`config::load_credential_seeds`] for development accounts, and
/// [`config::load_ws_tokens`] for the session token table.
///
/// # Example
///
/// ```no_run
/// MAIL_SYNC_ACCOUNT_DEV_USER_ID=u1 \
/// MAIL_SYNC_ACCOUNT_DEV_EMAIL=dev@gmail.com \
/// MAIL_SYNC_ACCOUNT_DEV_ACCESS_TOKEN=ya29... \
/// MAIL_SYNC_WS_TOKENS=dev-token:u1 \
/// cargo run
/// ```
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = Arc::new(SyncConfig::load_from_env()?);
    let credentials = Arc::new(MemoryCredentialStore::from_seeds(
        config::load_credential_seeds()?,
    ));
    let verifier = Arc::new(StaticTokenVerifier::new(config::load_ws_tokens()?));

    // External collaborators; swap in real backends behind the same traits.
    let index = Arc::new(MemoryIndex::new());
    let classifier = Arc::new(KeywordClassifier);

    let bus = Arc::new(EventBus::new());
    let pipeline = Arc::new(IngestionPipeline::new(index, classifier, bus.clone()));
    let supervisor = Supervisor::new(credentials, pipeline, bus.clone(), config.clone());
    let hub = SessionHub::new(supervisor.clone(), verifier, bus, config.clone());
    hub.spawn_fanout();

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, hub.router())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!(sessions = hub.session_count(), "draining agents");
    hub.broadcast_all(models::Frame::Broadcast(models::BroadcastData {
        message: serde_json::json!({ "shuttingDown": true }),
        at: models::now_iso(),
    }));
    supervisor.shutdown().await;
    // The final sync_status frames are still travelling bus → queue →
    // socket; flush and close every session before the runtime goes away.
    hub.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to install ctrl-c handler");
    }
}
