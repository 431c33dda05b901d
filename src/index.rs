//! Full-text index interface and in-memory implementation
//!
//! The index itself is an external collaborator; the core depends only on
//! this narrow trait. Control flow branches on explicit outcome kinds
//! rather than errors: `Conflict` on insert is the authoritative duplicate
//! signal for the exactly-once contract, and `Transient` marks a retryable
//! store hiccup.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::errors::AppResult;
use crate::models::{Category, StoredMessage};

/// Outcome of an insert attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Record written; the id was not present before
    Inserted,
    /// The id already exists; nothing was overwritten
    Conflict,
    /// The store was temporarily unavailable; the caller may retry
    Transient(String),
}

/// Outcome of a status mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    NotFound,
    Transient(String),
}

/// Partial update of the mutable message bits
#[derive(Debug, Clone, Default)]
pub struct MessagePatch {
    pub is_read: Option<bool>,
    pub is_starred: Option<bool>,
    pub category: Option<Category>,
}

/// Searchable message store
///
/// `insert` must fail with `Conflict` when the id is already present; a
/// retry with the same `(userId, email, uid)` never produces a second
/// record. `get` enforces tenant scoping.
#[async_trait]
pub trait EmailIndex: Send + Sync {
    /// Existence check by exactly-once id
    async fn exists(&self, id: &str) -> AppResult<bool>;

    /// Idempotent insert; `Conflict` if the id is present
    async fn insert(&self, message: &StoredMessage) -> InsertOutcome;

    /// Patch `isRead` / `isStarred` / `category` on an existing record
    async fn update(&self, id: &str, patch: MessagePatch) -> UpdateOutcome;

    /// Point lookup scoped to the owning user
    async fn get(&self, user_id: &str, id: &str) -> Option<StoredMessage>;

    /// Full-text search scoped to the owning user
    async fn search(&self, user_id: &str, query: &str) -> Vec<StoredMessage>;
}

/// In-memory index for development and tests
///
/// A mutex-guarded map with the same contract as a real backend; search is
/// a naive substring scan over subject and body.
pub struct MemoryIndex {
    records: Mutex<HashMap<String, StoredMessage>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.lock().expect("index lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmailIndex for MemoryIndex {
    async fn exists(&self, id: &str) -> AppResult<bool> {
        Ok(self.records.lock().expect("index lock poisoned").contains_key(id))
    }

    async fn insert(&self, message: &StoredMessage) -> InsertOutcome {
        let mut records = self.records.lock().expect("index lock poisoned");
        if records.contains_key(&message.id) {
            return InsertOutcome::Conflict;
        }
        records.insert(message.id.clone(), message.clone());
        InsertOutcome::Inserted
    }

    async fn update(&self, id: &str, patch: MessagePatch) -> UpdateOutcome {
        let mut records = self.records.lock().expect("index lock poisoned");
        let Some(record) = records.get_mut(id) else {
            return UpdateOutcome::NotFound;
        };
        if let Some(is_read) = patch.is_read {
            record.is_read = is_read;
        }
        if let Some(is_starred) = patch.is_starred {
            record.is_starred = is_starred;
        }
        if let Some(category) = patch.category {
            record.category = category;
        }
        record.updated_at = chrono::Utc::now();
        UpdateOutcome::Updated
    }

    async fn get(&self, user_id: &str, id: &str) -> Option<StoredMessage> {
        let records = self.records.lock().expect("index lock poisoned");
        records
            .get(id)
            .filter(|record| record.user_id == user_id)
            .cloned()
    }

    async fn search(&self, user_id: &str, query: &str) -> Vec<StoredMessage> {
        let needle = query.to_lowercase();
        let records = self.records.lock().expect("index lock poisoned");
        let mut hits: Vec<StoredMessage> = records
            .values()
            .filter(|record| record.user_id == user_id)
            .filter(|record| {
                record.subject.to_lowercase().contains(&needle)
                    || record.body.to_lowercase().contains(&needle)
            })
            .cloned()
            .collect();
        hits.sort_by(|a, b| b.date.cmp(&a.date));
        hits
    }
}
