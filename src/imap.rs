//! IMAP transport and session operations
//!
//! Provides timeout-bounded wrappers around `async-imap` operations. All
//! connections are IMAPS over rustls with XOAUTH2 authentication; timeouts
//! are derived from [`SyncConfig`]. The IDLE dance itself lives in the
//! agent, which owns the session exclusively.

use std::sync::Arc;
use std::time::Duration;

use async_imap::types::Fetch;
use async_imap::{Authenticator, Client, Session};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::account::{AccountKey, Credential};
use crate::config::SyncConfig;
use crate::errors::{AppError, AppResult};

/// Type alias for an authenticated IMAP session over TLS
///
/// Wraps the TLS stream type to simplify signatures throughout the codebase.
pub type ImapSession = Session<tokio_rustls::client::TlsStream<TcpStream>>;

/// FETCH query used everywhere: identity, envelope, arrival time, full source
const FETCH_QUERY: &str = "(UID ENVELOPE INTERNALDATE BODY.PEEK[])";

/// Best-effort LOGOUT deadline
const LOGOUT_TIMEOUT: Duration = Duration::from_secs(2);

/// XOAUTH2 SASL initial response builder
///
/// `async-imap` base64-encodes the response; this produces the raw
/// `user=...\x01auth=Bearer ...\x01\x01` string.
struct XOAuth2 {
    user: String,
    access_token: String,
}

impl Authenticator for XOAuth2 {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}

/// Connect to the account's IMAP server and authenticate
///
/// Performs the full connection sequence with timeouts:
/// 1. TCP connect
/// 2. TLS handshake with webpki root certificates
/// 3. Read IMAP greeting
/// 4. AUTHENTICATE XOAUTH2 with the supplied bearer
///
/// # Errors
///
/// - `InvalidInput` if the hostname is invalid for TLS SNI
/// - `Timeout` if any connection phase exceeds `connect_timeout`
/// - `Unauthorized` if the server rejects the bearer
/// - `Transport` for TCP, TLS, or greeting failures
pub async fn connect_authenticated(
    config: &SyncConfig,
    key: &AccountKey,
    credential: &Credential,
) -> AppResult<ImapSession> {
    let connect_duration = config.connect_timeout;

    let tcp = timeout(
        connect_duration,
        TcpStream::connect((credential.imap_host.as_str(), credential.imap_port)),
    )
    .await
    .map_err(|_| AppError::Timeout("tcp connect timeout".to_owned()))
    .and_then(|r| r.map_err(|e| AppError::Transport(format!("tcp connect failed: {e}"))))?;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));

    let server_name = ServerName::try_from(credential.imap_host.clone())
        .map_err(|_| AppError::InvalidInput("invalid IMAP host for TLS SNI".to_owned()))?;
    let tls_stream = timeout(connect_duration, connector.connect(server_name, tcp))
        .await
        .map_err(|_| AppError::Timeout("TLS handshake timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Transport(format!("TLS handshake failed: {e}"))))?;

    let mut client = Client::new(tls_stream);
    let greeting = timeout(connect_duration, client.read_response())
        .await
        .map_err(|_| AppError::Timeout("IMAP greeting timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Protocol(format!("IMAP greeting failed: {e}"))))?;

    if greeting.is_none() {
        return Err(AppError::Transport(
            "IMAP server closed connection before greeting".to_owned(),
        ));
    }

    let authenticator = XOAuth2 {
        user: key.email.clone(),
        access_token: credential.access_token.expose_secret().to_owned(),
    };
    let session = timeout(
        connect_duration,
        client.authenticate("XOAUTH2", authenticator),
    )
    .await
    .map_err(|_| AppError::Timeout("IMAP authenticate timeout".to_owned()))
    .and_then(|r| {
        r.map_err(|(e, _)| {
            let msg = e.to_string();
            if msg.to_ascii_lowercase().contains("auth") {
                AppError::Unauthorized(msg)
            } else {
                AppError::Protocol(msg)
            }
        })
    })?;

    Ok(session)
}

/// Select the primary inbox in read-write mode
///
/// Returns the current EXISTS count, the baseline for detecting growth
/// while in IDLE.
pub async fn select_inbox(config: &SyncConfig, session: &mut ImapSession) -> AppResult<u32> {
    let mailbox = timeout(config.fetch_timeout, session.select("INBOX"))
        .await
        .map_err(|_| AppError::Timeout("SELECT INBOX timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Protocol(format!("cannot select INBOX: {e}"))))?;
    Ok(mailbox.exists)
}

/// Search the selected mailbox for UIDs at or after a date
///
/// IMAP `SINCE` has date granularity and unreliable inclusivity across
/// servers; callers must re-check INTERNALDATE against the precise cutoff.
/// Returns UIDs in ascending order so ingestion preserves arrival order.
pub async fn uid_search_since(
    config: &SyncConfig,
    session: &mut ImapSession,
    since: DateTime<Utc>,
) -> AppResult<Vec<u32>> {
    let query = format!("SINCE {}", since.format("%d-%b-%Y"));
    let set = timeout(config.fetch_timeout, session.uid_search(&query))
        .await
        .map_err(|_| AppError::Timeout("UID SEARCH timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Protocol(format!("uid search failed: {e}"))))?;
    let mut uids: Vec<u32> = set.into_iter().collect();
    uids.sort_unstable();
    Ok(uids)
}

/// Fetch a single message by UID
///
/// Returns `None` when the UID no longer exists (expunged between search
/// and fetch).
pub async fn fetch_by_uid(
    config: &SyncConfig,
    session: &mut ImapSession,
    uid: u32,
) -> AppResult<Option<Fetch>> {
    let stream = timeout(
        config.fetch_timeout,
        session.uid_fetch(uid.to_string(), FETCH_QUERY),
    )
    .await
    .map_err(|_| AppError::Timeout("UID FETCH timed out".to_owned()))
    .and_then(|r| r.map_err(|e| AppError::Protocol(format!("uid fetch failed: {e}"))))?;
    let fetches: Vec<Fetch> = timeout(config.fetch_timeout, stream.try_collect())
        .await
        .map_err(|_| AppError::Timeout("UID FETCH stream timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Protocol(format!("uid fetch stream failed: {e}"))))?;
    Ok(fetches.into_iter().next())
}

/// Fetch a single message by sequence number
///
/// Used for the newest messages after EXISTS growth during IDLE.
pub async fn fetch_by_seq(
    config: &SyncConfig,
    session: &mut ImapSession,
    seq: u32,
) -> AppResult<Option<Fetch>> {
    let stream = timeout(
        config.fetch_timeout,
        session.fetch(seq.to_string(), FETCH_QUERY),
    )
    .await
    .map_err(|_| AppError::Timeout("FETCH timed out".to_owned()))
    .and_then(|r| r.map_err(|e| AppError::Protocol(format!("fetch failed: {e}"))))?;
    let fetches: Vec<Fetch> = timeout(config.fetch_timeout, stream.try_collect())
        .await
        .map_err(|_| AppError::Timeout("FETCH stream timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Protocol(format!("fetch stream failed: {e}"))))?;
    Ok(fetches.into_iter().next())
}

/// Log out and drop the session, best-effort
///
/// Stop paths must never hang on a dying server; failures are logged at
/// debug and otherwise ignored.
pub async fn logout_quietly(session: &mut ImapSession) {
    match timeout(LOGOUT_TIMEOUT, session.logout()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(error = %e, "IMAP logout failed"),
        Err(_) => tracing::debug!("IMAP logout timed out"),
    }
}
