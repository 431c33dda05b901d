//! Ingestion pipeline: dedupe → classify → index → event
//!
//! Stateless per message. The exactly-once guarantee hangs on two checks:
//! an advisory `exists` probe before any work, and the authoritative
//! `Conflict` from insert. Classification failures cannot propagate (the
//! classifier contract absorbs them), and transient index failures walk a
//! fixed retry ladder before the message is abandoned and counted.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;

use crate::account::AccountKey;
use crate::classify::{Classifier, ClassifyInput};
use crate::errors::AppError;
use crate::events::{EventBus, NewMessageEvent};
use crate::index::{EmailIndex, InsertOutcome};
use crate::mime;
use crate::models::{RawMessage, StoredMessage, message_id, now_iso};

/// Retry delays for transient index failures, in order
const INSERT_RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(200),
    Duration::from_millis(800),
    Duration::from_millis(3_000),
];

/// Result of ingesting one raw message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Stored and announced
    Indexed,
    /// Already present; dropped silently
    Duplicate,
    /// Transient failures exhausted the retry ladder
    Abandoned,
}

/// Per-message ingestion pipeline
///
/// Parallelism is bounded per agent (each agent hands messages over
/// serially) but unbounded across agents.
pub struct IngestionPipeline {
    index: Arc<dyn EmailIndex>,
    classifier: Arc<dyn Classifier>,
    bus: Arc<EventBus>,
    duplicates: AtomicU64,
    abandoned: AtomicU64,
}

impl IngestionPipeline {
    pub fn new(
        index: Arc<dyn EmailIndex>,
        classifier: Arc<dyn Classifier>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            index,
            classifier,
            bus,
            duplicates: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
        }
    }

    /// Messages dropped as duplicates since start
    pub fn duplicate_count(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    /// Messages abandoned after retry exhaustion since start
    pub fn abandoned_count(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    /// Ingest one raw message for an account
    ///
    /// Duplicates are not errors; the caller only needs to know the
    /// outcome for its counters and logs.
    pub async fn ingest(
        &self,
        key: &AccountKey,
        folder: &str,
        raw: RawMessage,
    ) -> IngestOutcome {
        let id = message_id(&key.user_id, &key.email, raw.uid);

        // Advisory probe; a store error here falls through to insert, whose
        // Conflict is the authoritative duplicate signal.
        match self.index.exists(&id).await {
            Ok(true) => return self.count_duplicate(&id),
            Ok(false) => {}
            Err(error) => {
                tracing::debug!(%id, %error, "exists probe failed, relying on insert conflict");
            }
        }

        let body = mime::decode_body(&raw.source);
        let category = self
            .classifier
            .classify(ClassifyInput {
                subject: &raw.envelope.subject,
                body: &body,
                from: &raw.envelope.from,
            })
            .await;

        let now = Utc::now();
        let message = StoredMessage {
            id: id.clone(),
            user_id: key.user_id.clone(),
            email: key.email.clone(),
            folder: folder.to_owned(),
            uid: raw.uid,
            subject: raw.envelope.subject,
            from: raw.envelope.from,
            to: raw.envelope.to,
            date: raw.envelope.date.or(raw.internal_date).unwrap_or(now),
            body,
            is_read: false,
            is_starred: false,
            category,
            created_at: now,
            updated_at: now,
        };

        for (attempt, delay) in std::iter::once(None)
            .chain(INSERT_RETRY_DELAYS.iter().copied().map(Some))
            .enumerate()
        {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            match self.index.insert(&message).await {
                InsertOutcome::Inserted => {
                    self.bus.publish_message(NewMessageEvent {
                        user_id: key.user_id.clone(),
                        email: key.email.clone(),
                        message: message.clone(),
                        at: now_iso(),
                    });
                    return IngestOutcome::Indexed;
                }
                InsertOutcome::Conflict => return self.count_duplicate(&id),
                InsertOutcome::Transient(reason) => {
                    tracing::warn!(
                        %id,
                        attempt,
                        %reason,
                        "transient index failure during insert"
                    );
                }
            }
        }

        self.abandoned.fetch_add(1, Ordering::Relaxed);
        let error = AppError::Unavailable("index retries exhausted".to_owned());
        tracing::error!(%id, %error, "message abandoned");
        IngestOutcome::Abandoned
    }

    fn count_duplicate(&self, id: &str) -> IngestOutcome {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%id, "duplicate message dropped");
        IngestOutcome::Duplicate
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::{IngestOutcome, IngestionPipeline};
    use crate::account::AccountKey;
    use crate::classify::KeywordClassifier;
    use crate::errors::AppResult;
    use crate::events::EventBus;
    use crate::index::{EmailIndex, InsertOutcome, MemoryIndex, MessagePatch, UpdateOutcome};
    use crate::models::{MessageEnvelope, RawMessage, StoredMessage};

    /// Index stub that replays a script of insert outcomes
    struct ScriptedIndex {
        outcomes: Mutex<VecDeque<InsertOutcome>>,
        inserts: Mutex<u64>,
    }

    impl ScriptedIndex {
        fn new(outcomes: Vec<InsertOutcome>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                inserts: Mutex::new(0),
            })
        }

        fn insert_calls(&self) -> u64 {
            *self.inserts.lock().unwrap()
        }
    }

    #[async_trait]
    impl EmailIndex for ScriptedIndex {
        async fn exists(&self, _id: &str) -> AppResult<bool> {
            Ok(false)
        }

        async fn insert(&self, _message: &StoredMessage) -> InsertOutcome {
            *self.inserts.lock().unwrap() += 1;
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(InsertOutcome::Conflict)
        }

        async fn update(&self, _id: &str, _patch: MessagePatch) -> UpdateOutcome {
            UpdateOutcome::NotFound
        }

        async fn get(&self, _user_id: &str, _id: &str) -> Option<StoredMessage> {
            None
        }

        async fn search(&self, _user_id: &str, _query: &str) -> Vec<StoredMessage> {
            Vec::new()
        }
    }

    fn raw_message(uid: u64, subject: &str) -> RawMessage {
        RawMessage {
            uid,
            envelope: MessageEnvelope {
                subject: subject.to_owned(),
                from: "sender@example.com".to_owned(),
                to: vec!["a@x.com".to_owned()],
                date: None,
            },
            source: format!("Subject: {subject}\r\n\r\nHello").into_bytes(),
            internal_date: None,
        }
    }

    fn pipeline_with(index: Arc<dyn EmailIndex>) -> (IngestionPipeline, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let pipeline =
            IngestionPipeline::new(index, Arc::new(KeywordClassifier), bus.clone());
        (pipeline, bus)
    }

    #[tokio::test]
    async fn happy_path_inserts_once_and_announces_once() {
        let index = Arc::new(MemoryIndex::new());
        let (pipeline, bus) = pipeline_with(index.clone());
        let mut events = bus.subscribe_messages(8);
        let key = AccountKey::new("u1", "a@x.com");

        let outcome = pipeline.ingest(&key, "INBOX", raw_message(42, "Hello")).await;

        assert_eq!(outcome, IngestOutcome::Indexed);
        assert_eq!(index.len(), 1);
        let event = events.try_recv().expect("one event");
        assert_eq!(event.message.id, "u1|a@x.com|42");
        assert_eq!(event.user_id, "u1");
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn redelivery_is_dropped_without_a_second_event() {
        let index = Arc::new(MemoryIndex::new());
        let (pipeline, bus) = pipeline_with(index.clone());
        let mut events = bus.subscribe_messages(8);
        let key = AccountKey::new("u1", "a@x.com");

        let first = pipeline.ingest(&key, "INBOX", raw_message(42, "Hello")).await;
        let second = pipeline.ingest(&key, "INBOX", raw_message(42, "Hello")).await;

        assert_eq!(first, IngestOutcome::Indexed);
        assert_eq!(second, IngestOutcome::Duplicate);
        assert_eq!(index.len(), 1);
        assert_eq!(pipeline.duplicate_count(), 1);
        assert!(events.try_recv().is_some());
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn insert_conflict_counts_as_duplicate_without_event() {
        let index = ScriptedIndex::new(vec![InsertOutcome::Conflict]);
        let (pipeline, bus) = pipeline_with(index.clone());
        let mut events = bus.subscribe_messages(8);
        let key = AccountKey::new("u1", "a@x.com");

        let outcome = pipeline.ingest(&key, "INBOX", raw_message(7, "Hi")).await;

        assert_eq!(outcome, IngestOutcome::Duplicate);
        assert_eq!(pipeline.duplicate_count(), 1);
        assert!(events.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_insert_retries_after_the_base_delay() {
        let index = ScriptedIndex::new(vec![
            InsertOutcome::Transient("index down".to_owned()),
            InsertOutcome::Inserted,
        ]);
        let (pipeline, bus) = pipeline_with(index.clone());
        let mut events = bus.subscribe_messages(8);
        let key = AccountKey::new("u1", "a@x.com");

        let started = Instant::now();
        let outcome = pipeline.ingest(&key, "INBOX", raw_message(9, "Hi")).await;

        assert_eq!(outcome, IngestOutcome::Indexed);
        assert_eq!(index.insert_calls(), 2);
        assert_eq!(started.elapsed().as_millis(), 200);
        assert!(events.try_recv().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhaustion_abandons_the_message() {
        let index = ScriptedIndex::new(vec![
            InsertOutcome::Transient("1".to_owned()),
            InsertOutcome::Transient("2".to_owned()),
            InsertOutcome::Transient("3".to_owned()),
            InsertOutcome::Transient("4".to_owned()),
        ]);
        let (pipeline, bus) = pipeline_with(index.clone());
        let mut events = bus.subscribe_messages(8);
        let key = AccountKey::new("u1", "a@x.com");

        let outcome = pipeline.ingest(&key, "INBOX", raw_message(9, "Hi")).await;

        assert_eq!(outcome, IngestOutcome::Abandoned);
        assert_eq!(index.insert_calls(), 4);
        assert_eq!(pipeline.abandoned_count(), 1);
        assert!(events.try_recv().is_none());
    }
}
