//! Enrich worker: title + text → tags, summaries, language.
//!
//! The model reply must be a JSON object; anything else is a retryable
//! failure. Newly discovered tags flow back to the compacted catalog topic
//! only after the enrichment itself succeeded.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use lifestream_events::{EnrichPayload, EnrichmentCompleted, EventKind, WorkCommand, WorkKind};

use crate::tags::{TagCatalog, TagCatalogStore};

use super::{StageError, StageWorker};

/// Bounds requested from the model and enforced on parse.
const MAX_TAGS: usize = 7;
const MIN_TAGS: usize = 3;
const SUMMARY_SHORT_MAX_CHARS: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model request failed: {0}")]
    Http(String),

    #[error("model reply unusable: {0}")]
    Api(String),
}

/// External model access. One implementation talks HTTP; tests use fakes.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, ModelError>;

    /// Version tag recorded on the enrichment event.
    fn model_version(&self) -> String;
}

/// OpenAI-style chat-completions client.
pub struct HttpModelClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpModelClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn complete(&self, prompt: &str) -> Result<String, ModelError> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0.2,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ModelError::Api(format!("http status {status}")));
        }

        let reply: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ModelError::Api(e.to_string()))?;

        reply["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ModelError::Api("reply has no message content".to_string()))
    }

    fn model_version(&self) -> String {
        self.model.clone()
    }
}

#[derive(Debug, Deserialize)]
struct ModelReply {
    tags: Vec<String>,
    #[serde(default)]
    summary_short: Option<String>,
    #[serde(default)]
    summary_long: Option<String>,
    #[serde(default)]
    language: Option<String>,
}

/// Cut the body to the model's character budget (on a char boundary).
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Build the enrichment prompt.
pub fn build_prompt(title: Option<&str>, text: &str, known_tags: &[String]) -> String {
    let mut prompt = String::with_capacity(text.len() + 1024);
    prompt.push_str(
        "Analyze the following article and reply with a single JSON object of the shape \
         {\"tags\": [string], \"summary_short\": string, \"summary_long\": string, \
         \"language\": string}. Use between 3 and 7 lowercase tags, keep summary_short \
         under 200 characters, and set language to the BCP-47 tag of the article text.\n",
    );
    if !known_tags.is_empty() {
        prompt.push_str("Prefer reusing these existing tags where they apply: ");
        prompt.push_str(&known_tags.join(", "));
        prompt.push('\n');
    }
    if let Some(title) = title {
        prompt.push_str("Title: ");
        prompt.push_str(title);
        prompt.push('\n');
    }
    prompt.push_str("Article:\n");
    prompt.push_str(text);
    prompt
}

/// Parse the model reply into an enrichment payload.
///
/// Tolerates code fences and prose around the object; rejects replies with
/// no tags. Over-long fields are clamped rather than rejected.
pub fn parse_enrichment(reply: &str, model_version: &str) -> Result<EnrichmentCompleted, String> {
    let start = reply.find('{').ok_or("reply contains no JSON object")?;
    let end = reply.rfind('}').ok_or("reply contains no JSON object")?;
    if end < start {
        return Err("reply contains no JSON object".to_string());
    }

    let parsed: ModelReply = serde_json::from_str(&reply[start..=end])
        .map_err(|e| format!("reply is not the requested JSON shape: {e}"))?;

    let mut tags: Vec<String> = parsed
        .tags
        .into_iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    tags.sort();
    tags.dedup();
    if tags.is_empty() {
        return Err("model returned no usable tags".to_string());
    }
    tags.truncate(MAX_TAGS);
    if tags.len() < MIN_TAGS {
        // Under-tagging is tolerable; the vocabulary stays small early on.
        warn!(count = tags.len(), "model returned fewer tags than requested");
    }

    let summary_short = parsed
        .summary_short
        .map(|s| truncate_text(s.trim(), SUMMARY_SHORT_MAX_CHARS))
        .filter(|s| !s.is_empty());

    Ok(EnrichmentCompleted {
        tags,
        summary_short,
        summary_long: parsed.summary_long.filter(|s| !s.trim().is_empty()),
        language: parsed.language.filter(|s| !s.trim().is_empty()),
        model_version: Some(model_version.to_string()),
    })
}

pub struct Enricher<M, T> {
    model: M,
    tag_store: T,
    truncate_chars: usize,
    timeout: Duration,
}

impl<M, T> Enricher<M, T>
where
    M: ModelClient,
    T: TagCatalogStore,
{
    pub fn new(model: M, tag_store: T, truncate_chars: usize, timeout: Duration) -> Self {
        Self {
            model,
            tag_store,
            truncate_chars,
            timeout,
        }
    }
}

#[async_trait]
impl<M, T> StageWorker for Enricher<M, T>
where
    M: ModelClient,
    T: TagCatalogStore,
{
    fn kind(&self) -> WorkKind {
        WorkKind::EnrichLink
    }

    fn agent_name(&self) -> &'static str {
        "enricher"
    }

    fn timeout(&self) -> Duration {
        // Headroom over the model budget for the catalog round trips.
        self.timeout + Duration::from_secs(10)
    }

    async fn execute(&self, work: &WorkCommand) -> Result<EventKind, StageError> {
        let payload: EnrichPayload = work
            .decode_payload()
            .map_err(|e| StageError::new(format!("bad enrich payload: {e}")))?;

        // Reseed the in-process catalog from the compacted topic.
        let mut catalog = match self.tag_store.load().await {
            Ok(tags) => TagCatalog::from_tags(tags),
            Err(err) => {
                warn!(error = %err, "tag catalog unavailable, enriching without hints");
                TagCatalog::default()
            }
        };

        let text = truncate_text(&payload.text_content, self.truncate_chars);
        let prompt = build_prompt(payload.title.as_deref(), &text, &catalog.prompt_hint());

        let reply = self
            .model
            .complete(&prompt)
            .await
            .map_err(|e| StageError::new(e.to_string()))?;
        let enrichment = parse_enrichment(&reply, &self.model.model_version())
            .map_err(StageError::new)?;

        // The catalog is a soft vocabulary: a failed write must not fail the
        // enrichment itself.
        if catalog.merge(enrichment.tags.iter().cloned()) {
            if let Err(err) = self.tag_store.store(&catalog.sorted()).await {
                warn!(error = %err, "tag catalog write failed");
            }
        }

        Ok(EventKind::EnrichmentCompleted(enrichment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use uuid::Uuid;

    use lifestream_core::SubjectId;

    use crate::bus::BusError;

    struct FakeModel {
        reply: String,
    }

    #[async_trait]
    impl ModelClient for FakeModel {
        async fn complete(&self, _prompt: &str) -> Result<String, ModelError> {
            Ok(self.reply.clone())
        }

        fn model_version(&self) -> String {
            "fake-1".to_string()
        }
    }

    #[derive(Default)]
    struct FakeTagStore {
        seeded: Vec<String>,
        stored: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl TagCatalogStore for FakeTagStore {
        async fn load(&self) -> Result<Vec<String>, BusError> {
            Ok(self.seeded.clone())
        }

        async fn store(&self, tags: &[String]) -> Result<(), BusError> {
            self.stored.lock().unwrap().push(tags.to_vec());
            Ok(())
        }
    }

    fn work() -> WorkCommand {
        WorkCommand::first_attempt(
            SubjectId::from("link:abc"),
            WorkKind::EnrichLink,
            Uuid::now_v7(),
            Uuid::now_v7(),
            3,
            serde_json::json!({"title": "T", "text_content": "body text"}),
        )
    }

    #[test]
    fn parses_a_fenced_reply() {
        let reply = "Here you go:\n```json\n{\"tags\": [\"Rust\", \"rust\", \"async\", \"tokio\"], \
                     \"summary_short\": \" a short one \", \"summary_long\": \"longer\", \
                     \"language\": \"en\"}\n```";

        let enrichment = parse_enrichment(reply, "m-1").unwrap();
        assert_eq!(enrichment.tags, vec!["async", "rust", "tokio"]);
        assert_eq!(enrichment.summary_short.as_deref(), Some("a short one"));
        assert_eq!(enrichment.language.as_deref(), Some("en"));
        assert_eq!(enrichment.model_version.as_deref(), Some("m-1"));
    }

    #[test]
    fn clamps_overlong_fields() {
        let long = "x".repeat(500);
        let reply = format!(
            "{{\"tags\": [\"a\",\"b\",\"c\",\"d\",\"e\",\"f\",\"g\",\"h\",\"i\"], \
             \"summary_short\": \"{long}\"}}"
        );

        let enrichment = parse_enrichment(&reply, "m-1").unwrap();
        assert_eq!(enrichment.tags.len(), 7);
        assert_eq!(enrichment.summary_short.unwrap().len(), 200);
    }

    #[test]
    fn rejects_replies_without_tags() {
        assert!(parse_enrichment("{\"tags\": []}", "m-1").is_err());
        assert!(parse_enrichment("no json here", "m-1").is_err());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "héllo wörld".repeat(10);
        let cut = truncate_text(&text, 5);
        assert_eq!(cut.chars().count(), 5);
    }

    #[tokio::test]
    async fn successful_enrichment_publishes_the_grown_catalog() {
        let model = FakeModel {
            reply: "{\"tags\": [\"rust\", \"async\", \"streams\"]}".to_string(),
        };
        let store = FakeTagStore {
            seeded: vec!["rust".to_string(), "postgres".to_string()],
            ..Default::default()
        };
        let enricher = Enricher::new(model, store, 32_000, Duration::from_secs(60));

        let kind = enricher.execute(&work()).await.unwrap();
        let EventKind::EnrichmentCompleted(enrichment) = kind else {
            panic!("expected an enrichment");
        };
        assert_eq!(enrichment.tags, vec!["async", "rust", "streams"]);

        let stored = enricher.tag_store.stored.lock().unwrap().clone();
        assert_eq!(stored.len(), 1);
        // The full sorted union, not just the new tags.
        assert_eq!(stored[0], vec!["async", "postgres", "rust", "streams"]);
    }

    #[tokio::test]
    async fn unparseable_reply_is_a_stage_failure() {
        let enricher = Enricher::new(
            FakeModel {
                reply: "I could not do that".to_string(),
            },
            FakeTagStore::default(),
            32_000,
            Duration::from_secs(60),
        );

        let err = enricher.execute(&work()).await.unwrap_err();
        assert!(err.0.contains("JSON"));
    }
}
