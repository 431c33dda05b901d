//! Account identity, credentials, and the collaborator interfaces around them
//!
//! An [`AccountKey`] is the primary identity of a sync agent: one opaque
//! tenant id plus one mailbox address, with equality and hashing defined on
//! the composite to keep registries flat. Credentials are owned by a
//! [`CredentialStore`]; agents hold only the momentary token returned by
//! `get_fresh`. Tokens live in `SecretString` so they cannot leak through
//! `Debug` formatting, logs, or serialized events.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use secrecy::SecretString;
use tokio::sync::Mutex;

use crate::config::CredentialSeed;
use crate::errors::{AppError, AppResult};

/// Primary identity of a sync agent: `(userId, email)`
///
/// Immutable; equality and hashing cover both fields so a single flat map
/// replaces nested per-user lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccountKey {
    /// Opaque tenant identifier
    pub user_id: String,
    /// Mailbox address
    pub email: String,
}

impl AccountKey {
    pub fn new(user_id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: email.into(),
        }
    }
}

impl std::fmt::Display for AccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.user_id, self.email)
    }
}

/// Short-lived access credential for one account
///
/// Carries the IMAP endpoint next to the tokens; the endpoint is as much a
/// property of the account as the bearer that unlocks it.
#[derive(Debug, Clone)]
pub struct Credential {
    /// OAuth bearer for XOAUTH2
    pub access_token: SecretString,
    /// Refresh token, if the upstream issued one
    pub refresh_token: Option<SecretString>,
    /// Expiry instant; always at least 60 s in the future when returned
    pub expires_at: DateTime<Utc>,
    /// IMAP server hostname
    pub imap_host: String,
    /// IMAP server port
    pub imap_port: u16,
}

/// Store of per-account access credentials
///
/// `get_fresh` refreshes transparently; the returned credential's
/// `expires_at` is at least 60 s in the future. Failures map onto the
/// shared taxonomy: `Unauthorized` when no credential exists or the
/// upstream rejected the refresh, `Unavailable` when the refresh transport
/// itself failed (retryable).
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Return a credential valid for at least 60 s
    async fn get_fresh(&self, key: &AccountKey) -> AppResult<Credential>;

    /// List mailbox addresses with stored credentials for a user
    async fn list(&self, user_id: &str) -> AppResult<Vec<String>>;

    /// Drop stored credentials; best-effort and idempotent
    ///
    /// `email = None` revokes every account of the user.
    async fn revoke(&self, user_id: &str, email: Option<&str>);
}

/// Resolve a WebSocket bearer token to a user id
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// `Some(userId)` for a valid token, `None` otherwise
    async fn verify(&self, token: &str) -> Option<String>;
}

/// Minimum remaining validity of a returned credential
const FRESHNESS_FLOOR_SECS: i64 = 60;

/// Lease granted on each refresh of a seeded credential
const SEED_LEASE_SECS: i64 = 3_600;

struct MemoryEntry {
    access_token: SecretString,
    refresh_token: Option<SecretString>,
    imap_host: String,
    imap_port: u16,
    expires_at: DateTime<Utc>,
}

/// In-memory credential store seeded from the environment
///
/// Refreshes are serialized per [`AccountKey`]: each entry sits behind its
/// own async mutex, so concurrent `get_fresh` calls for one account never
/// race a refresh while different accounts proceed independently.
pub struct MemoryCredentialStore {
    entries: Mutex<HashMap<AccountKey, Arc<Mutex<MemoryEntry>>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Build a store from development seeds
    pub fn from_seeds(seeds: Vec<CredentialSeed>) -> Self {
        let entries = seeds
            .into_iter()
            .map(|seed| {
                (
                    AccountKey::new(seed.user_id.clone(), seed.email.clone()),
                    Arc::new(Mutex::new(MemoryEntry {
                        access_token: seed.access_token,
                        refresh_token: seed.refresh_token,
                        imap_host: seed.imap_host,
                        imap_port: seed.imap_port,
                        expires_at: Utc::now(),
                    })),
                )
            })
            .collect();
        Self {
            entries: Mutex::new(entries),
        }
    }

    /// Insert or replace a credential entry
    pub async fn put(&self, key: AccountKey, seed: CredentialSeed) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key,
            Arc::new(Mutex::new(MemoryEntry {
                access_token: seed.access_token,
                refresh_token: seed.refresh_token,
                imap_host: seed.imap_host,
                imap_port: seed.imap_port,
                expires_at: Utc::now(),
            })),
        );
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get_fresh(&self, key: &AccountKey) -> AppResult<Credential> {
        let entry = {
            let entries = self.entries.lock().await;
            entries
                .get(key)
                .cloned()
                .ok_or_else(|| AppError::Unauthorized(format!("no credential stored for {key}")))?
        };

        // Per-key serialization point: only one refresh per account at a time.
        let mut entry = entry.lock().await;
        if entry.expires_at - Utc::now() < ChronoDuration::seconds(FRESHNESS_FLOOR_SECS) {
            entry.expires_at = Utc::now() + ChronoDuration::seconds(SEED_LEASE_SECS);
        }

        Ok(Credential {
            access_token: entry.access_token.clone(),
            refresh_token: entry.refresh_token.clone(),
            expires_at: entry.expires_at,
            imap_host: entry.imap_host.clone(),
            imap_port: entry.imap_port,
        })
    }

    async fn list(&self, user_id: &str) -> AppResult<Vec<String>> {
        let entries = self.entries.lock().await;
        let mut emails: Vec<String> = entries
            .keys()
            .filter(|key| key.user_id == user_id)
            .map(|key| key.email.clone())
            .collect();
        emails.sort();
        Ok(emails)
    }

    async fn revoke(&self, user_id: &str, email: Option<&str>) {
        let mut entries = self.entries.lock().await;
        entries.retain(|key, _| {
            key.user_id != user_id || email.is_some_and(|e| e != key.email)
        });
    }
}

/// Static token table for development deployments
pub struct StaticTokenVerifier {
    tokens: HashMap<String, String>,
}

impl StaticTokenVerifier {
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Self {
            tokens: pairs.into_iter().collect(),
        }
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Option<String> {
        self.tokens.get(token).cloned()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, Utc};
    use secrecy::SecretString;

    use super::{
        AccountKey, CredentialStore, MemoryCredentialStore, StaticTokenVerifier, TokenVerifier,
    };
    use crate::config::CredentialSeed;
    use crate::errors::AppError;

    fn seed(user_id: &str, email: &str) -> CredentialSeed {
        CredentialSeed {
            user_id: user_id.to_owned(),
            email: email.to_owned(),
            imap_host: "imap.example.com".to_owned(),
            imap_port: 993,
            access_token: SecretString::new("tok".to_owned().into()),
            refresh_token: None,
        }
    }

    #[tokio::test]
    async fn get_fresh_returns_credential_with_freshness_floor() {
        let store = MemoryCredentialStore::new();
        let key = AccountKey::new("u1", "a@x.com");
        store.put(key.clone(), seed("u1", "a@x.com")).await;

        let credential = store.get_fresh(&key).await.expect("credential present");
        assert!(credential.expires_at - Utc::now() >= ChronoDuration::seconds(60));
        assert_eq!(credential.imap_port, 993);
    }

    #[tokio::test]
    async fn get_fresh_for_unknown_account_is_unauthorized() {
        let store = MemoryCredentialStore::new();
        let err = store
            .get_fresh(&AccountKey::new("u1", "a@x.com"))
            .await
            .expect_err("must fail");
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn list_returns_only_the_users_accounts_sorted() {
        let store = MemoryCredentialStore::new();
        store
            .put(AccountKey::new("u1", "b@x.com"), seed("u1", "b@x.com"))
            .await;
        store
            .put(AccountKey::new("u1", "a@x.com"), seed("u1", "a@x.com"))
            .await;
        store
            .put(AccountKey::new("u2", "c@x.com"), seed("u2", "c@x.com"))
            .await;

        assert_eq!(store.list("u1").await.unwrap(), vec!["a@x.com", "b@x.com"]);
        assert_eq!(store.list("u3").await.unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn revoke_is_scoped_and_idempotent() {
        let store = MemoryCredentialStore::new();
        store
            .put(AccountKey::new("u1", "a@x.com"), seed("u1", "a@x.com"))
            .await;
        store
            .put(AccountKey::new("u1", "b@x.com"), seed("u1", "b@x.com"))
            .await;

        store.revoke("u1", Some("a@x.com")).await;
        assert_eq!(store.list("u1").await.unwrap(), vec!["b@x.com"]);

        store.revoke("u1", Some("a@x.com")).await;
        store.revoke("u1", None).await;
        assert!(store.list("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn static_verifier_resolves_known_tokens_only() {
        let verifier = StaticTokenVerifier::new(vec![("tok-1".to_owned(), "u1".to_owned())]);
        assert_eq!(verifier.verify("tok-1").await.as_deref(), Some("u1"));
        assert_eq!(verifier.verify("tok-2").await, None);
    }
}
