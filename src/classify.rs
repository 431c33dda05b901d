//! Message classification
//!
//! Maps `{subject, body, from}` to one of the six closed categories. The
//! remote language model sits behind the narrow [`CategoryModel`] trait;
//! [`ModelClassifier`] wraps any model with the full contract: bounded
//! inputs, exact-label matching, the deterministic keyword fallback, and
//! collapse of remote failures. Classification never fails; the worst
//! outcome is `Uncategorized`.

use async_trait::async_trait;

use crate::errors::AppResult;
use crate::mime::truncate_chars;
use crate::models::Category;

/// Maximum subject characters forwarded to a remote model
pub const SUBJECT_MAX_CHARS: usize = 500;

/// Maximum body characters forwarded to a remote model
pub const BODY_MAX_CHARS: usize = 4_000;

/// Keyword table for the deterministic fallback, in priority order
///
/// The first category whose keyword matches the normalized `subject||body`
/// wins.
const KEYWORD_TABLE: &[(Category, &[&str])] = &[
    (
        Category::Spam,
        &["unsubscribe", "promotional", "offer", "discount", "limited time", "act now"],
    ),
    (
        Category::OutOfOffice,
        &["out of office", "vacation", "away", "automatic reply", "auto-reply"],
    ),
    (
        Category::MeetingBooked,
        &["meeting", "call", "schedule", "appointment", "booked", "calendar"],
    ),
    (
        Category::NotInterested,
        &["not interested", "decline", "reject", "no thank", "pass"],
    ),
    (
        Category::Interested,
        &["interested", "yes", "sounds good", "let's do", "count me in"],
    ),
];

/// Classification input
#[derive(Debug, Clone, Copy)]
pub struct ClassifyInput<'a> {
    pub subject: &'a str,
    pub body: &'a str,
    pub from: &'a str,
}

/// Message classifier
///
/// Implementations must always return a category; remote failures collapse
/// into the fallback internally.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, input: ClassifyInput<'_>) -> Category;
}

/// Remote category model
///
/// Receives pre-truncated inputs and returns a free-form label string. Any
/// error is absorbed by the wrapping [`ModelClassifier`].
#[async_trait]
pub trait CategoryModel: Send + Sync {
    async fn complete(&self, subject: &str, body: &str, from: &str) -> AppResult<String>;
}

/// Deterministic keyword fallback over normalized `subject||body`
///
/// Normalization is lowercasing; matching is plain substring search in the
/// fixed priority order of [`KEYWORD_TABLE`].
pub fn keyword_category(subject: &str, body: &str) -> Option<Category> {
    let haystack = format!("{subject} {body}").to_lowercase();
    KEYWORD_TABLE
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|kw| haystack.contains(kw)))
        .map(|(category, _)| *category)
}

/// Keyword-only classifier for model-less deployments
pub struct KeywordClassifier;

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(&self, input: ClassifyInput<'_>) -> Category {
        keyword_category(input.subject, input.body).unwrap_or(Category::Uncategorized)
    }
}

/// Contract wrapper around a remote category model
///
/// 1. Truncates subject/body to the configured bounds.
/// 2. Accepts an exact (trimmed, case-insensitive) label match.
/// 3. Falls back to the keyword table.
/// 4. Resolves to `Uncategorized` when nothing matches.
/// 5. Collapses remote errors into steps 3–4 without surfacing them.
pub struct ModelClassifier<M> {
    model: M,
}

impl<M: CategoryModel> ModelClassifier<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }
}

#[async_trait]
impl<M: CategoryModel> Classifier for ModelClassifier<M> {
    async fn classify(&self, input: ClassifyInput<'_>) -> Category {
        let subject = truncate_chars(input.subject.to_owned(), SUBJECT_MAX_CHARS);
        let body = truncate_chars(input.body.to_owned(), BODY_MAX_CHARS);

        match self.model.complete(&subject, &body, input.from).await {
            Ok(label) => {
                if let Some(category) = Category::parse_label(&label) {
                    return category;
                }
                tracing::debug!(label = %label.trim(), "model label outside category set");
            }
            Err(error) => {
                tracing::warn!(%error, "category model failed; using keyword fallback");
            }
        }

        keyword_category(input.subject, input.body).unwrap_or(Category::Uncategorized)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::{
        BODY_MAX_CHARS, CategoryModel, Classifier, ClassifyInput, KeywordClassifier,
        ModelClassifier, SUBJECT_MAX_CHARS, keyword_category,
    };
    use crate::errors::{AppError, AppResult};
    use crate::models::Category;

    /// Scripted model that records the inputs it was given
    struct ScriptedModel {
        response: AppResult<String>,
        seen: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedModel {
        fn ok(label: &str) -> Arc<Self> {
            Arc::new(Self {
                response: Ok(label.to_owned()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                response: Err(AppError::Transport("model unreachable".to_owned())),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CategoryModel for Arc<ScriptedModel> {
        async fn complete(&self, subject: &str, body: &str, _from: &str) -> AppResult<String> {
            self.seen
                .lock()
                .unwrap()
                .push((subject.to_owned(), body.to_owned()));
            match &self.response {
                Ok(label) => Ok(label.clone()),
                Err(_) => Err(AppError::Transport("model unreachable".to_owned())),
            }
        }
    }

    fn input<'a>(subject: &'a str, body: &'a str) -> ClassifyInput<'a> {
        ClassifyInput {
            subject,
            body,
            from: "sender@example.com",
        }
    }

    #[test]
    fn keyword_priority_order_is_fixed() {
        // "unsubscribe" (Spam) and "meeting" (Meeting Booked) both match;
        // Spam is earlier in the priority order.
        assert_eq!(
            keyword_category("meeting invite", "click unsubscribe below"),
            Some(Category::Spam)
        );
        assert_eq!(
            keyword_category("Automatic Reply: hi", "back next week"),
            Some(Category::OutOfOffice)
        );
        assert_eq!(
            keyword_category("", "let's schedule a call"),
            Some(Category::MeetingBooked)
        );
        assert_eq!(
            keyword_category("re: offer", "no thank you"),
            Some(Category::Spam)
        );
        assert_eq!(
            keyword_category("", "count me in"),
            Some(Category::Interested)
        );
        assert_eq!(keyword_category("hello", "nothing relevant"), None);
    }

    #[tokio::test]
    async fn keyword_classifier_returns_sentinel_when_unresolved() {
        let category = KeywordClassifier
            .classify(input("status", "quarterly numbers attached"))
            .await;
        assert_eq!(category, Category::Uncategorized);
    }

    #[tokio::test]
    async fn model_label_match_is_case_insensitive_and_trimmed() {
        let model = ScriptedModel::ok("  not interested \n");
        let classifier = ModelClassifier::new(model);
        let category = classifier.classify(input("re: proposal", "body")).await;
        assert_eq!(category, Category::NotInterested);
    }

    #[tokio::test]
    async fn unrecognized_model_label_falls_back_to_keywords() {
        let model = ScriptedModel::ok("probably spam, hard to say");
        let classifier = ModelClassifier::new(model);
        let category = classifier
            .classify(input("limited time offer", "buy now"))
            .await;
        assert_eq!(category, Category::Spam);
    }

    #[tokio::test]
    async fn model_failure_collapses_to_deterministic_fallback() {
        let model = ScriptedModel::failing();
        let classifier = ModelClassifier::new(model);

        let first = classifier.classify(input("on vacation", "away until June")).await;
        let second = classifier.classify(input("on vacation", "away until June")).await;
        assert_eq!(first, Category::OutOfOffice);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn inputs_are_truncated_before_reaching_the_model() {
        let model = ScriptedModel::ok("Interested");
        let classifier = ModelClassifier::new(model.clone());

        let long_subject = "s".repeat(SUBJECT_MAX_CHARS + 100);
        let long_body = "b".repeat(BODY_MAX_CHARS + 100);
        classifier.classify(input(&long_subject, &long_body)).await;

        let seen = model.seen.lock().unwrap();
        assert_eq!(seen[0].0.chars().count(), SUBJECT_MAX_CHARS);
        assert_eq!(seen[0].1.chars().count(), BODY_MAX_CHARS);
    }
}
