// Memory capability
// Three memory flavors behind one trait: episodic experiences, semantic
// facts with relations, and procedural skills. Backed by the shared store;
// recall ranking combines lexical similarity with access-recency decay.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use foreman_persistence::{MemoryRecord, Store, StoreError};

pub const EPISODIC: &str = "episodic";
pub const SEMANTIC: &str = "semantic";
pub const PROCEDURAL: &str = "procedural";

/// Weight of lexical similarity in the combined recall score.
const SIMILARITY_WEIGHT: f64 = 0.6;
/// Weight of the access-recency component in the combined recall score.
const RECENCY_WEIGHT: f64 = 0.4;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type MemoryResult<T> = Result<T, MemoryError>;

/// Unified memory capability consumed by the supervisor and workers.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    // episodic
    async fn remember(
        &self,
        experience: &str,
        outcome: &str,
        context: Value,
        importance: f64,
    ) -> MemoryResult<String>;
    async fn recall_similar(&self, query: &str, top_k: usize) -> MemoryResult<Vec<MemoryRecord>>;
    async fn recall_recent(&self, n: usize) -> MemoryResult<Vec<MemoryRecord>>;

    // semantic
    async fn learn_fact(
        &self,
        topic: &str,
        fact: &str,
        source: &str,
        confidence: f64,
    ) -> MemoryResult<String>;
    async fn query_topic(&self, topic: &str) -> MemoryResult<Option<MemoryRecord>>;
    async fn search_facts(
        &self,
        query: &str,
        top_k: usize,
    ) -> MemoryResult<Vec<(String, MemoryRecord)>>;
    async fn add_relation(&self, a: &str, b: &str, relation: &str) -> MemoryResult<()>;

    // procedural
    async fn learn_procedure(&self, skill_name: &str, steps: &[String]) -> MemoryResult<()>;
    async fn execute_procedure(&self, skill_name: &str, inputs: Value) -> MemoryResult<Value>;
}

#[derive(Debug, Clone, Copy)]
struct AccessStats {
    last_access: DateTime<Utc>,
    count: u32,
}

/// Store-backed implementation of [`MemoryStore`].
pub struct SqliteMemoryStore {
    store: Arc<Store>,
    access: RwLock<HashMap<String, AccessStats>>,
}

impl SqliteMemoryStore {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            access: RwLock::new(HashMap::new()),
        }
    }

    async fn touch(&self, id: &str) {
        let mut access = self.access.write().await;
        let entry = access.entry(id.to_string()).or_insert(AccessStats {
            last_access: Utc::now(),
            count: 0,
        });
        entry.last_access = Utc::now();
        entry.count += 1;
    }

    /// Combined recall score: similarity dominates, recency decays by half
    /// per day since last access, repeated access adds a small boost.
    async fn score(&self, record: &MemoryRecord, query: &str) -> f64 {
        let similarity = token_similarity(query, &record.content);
        let access = self.access.read().await;
        let (last, count) = access
            .get(&record.id)
            .map(|s| (s.last_access, s.count))
            .unwrap_or((record.created_at, 0));
        let age_days = (Utc::now() - last).num_seconds().max(0) as f64 / 86_400.0;
        let decay = 0.5f64.powf(age_days);
        let boost = (1.0 + count as f64).ln() / 10.0;
        SIMILARITY_WEIGHT * similarity + RECENCY_WEIGHT * (decay + boost).min(1.0)
    }

    async fn ranked(
        &self,
        memory_type: &str,
        query: &str,
        top_k: usize,
    ) -> MemoryResult<Vec<MemoryRecord>> {
        let candidates = self.store.recent_memories(memory_type, 1000).await?;
        let mut scored = Vec::with_capacity(candidates.len());
        for record in candidates {
            let score = self.score(&record, query).await;
            scored.push((score, record));
        }
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        for (_, record) in &scored {
            self.touch(&record.id).await;
        }
        Ok(scored.into_iter().map(|(_, record)| record).collect())
    }
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    async fn remember(
        &self,
        experience: &str,
        outcome: &str,
        context: Value,
        importance: f64,
    ) -> MemoryResult<String> {
        let id = Uuid::new_v4().to_string();
        let record = MemoryRecord {
            id: id.clone(),
            memory_type: EPISODIC.to_string(),
            content: format!("{experience} -> {outcome}"),
            metadata: json!({
                "experience": experience,
                "outcome": outcome,
                "context": context,
            }),
            importance: importance.clamp(0.0, 1.0),
            created_at: Utc::now(),
        };
        self.store.store_memory(&record).await?;
        tracing::debug!(memory_id = %id, "episodic memory stored");
        Ok(id)
    }

    async fn recall_similar(&self, query: &str, top_k: usize) -> MemoryResult<Vec<MemoryRecord>> {
        self.ranked(EPISODIC, query, top_k).await
    }

    async fn recall_recent(&self, n: usize) -> MemoryResult<Vec<MemoryRecord>> {
        Ok(self.store.recent_memories(EPISODIC, n).await?)
    }

    async fn learn_fact(
        &self,
        topic: &str,
        fact: &str,
        source: &str,
        confidence: f64,
    ) -> MemoryResult<String> {
        if topic.trim().is_empty() {
            return Err(MemoryError::InvalidInput("empty topic".to_string()));
        }
        let id = format!("fact-{}", normalize_topic(topic));
        let record = MemoryRecord {
            id: id.clone(),
            memory_type: SEMANTIC.to_string(),
            content: fact.to_string(),
            metadata: json!({
                "topic": topic,
                "source": source,
                "confidence": confidence.clamp(0.0, 1.0),
            }),
            importance: confidence.clamp(0.0, 1.0),
            created_at: Utc::now(),
        };
        self.store.store_memory(&record).await?;
        Ok(id)
    }

    async fn query_topic(&self, topic: &str) -> MemoryResult<Option<MemoryRecord>> {
        let id = format!("fact-{}", normalize_topic(topic));
        let record = self.store.get_memory(&id).await?;
        if let Some(record) = &record {
            self.touch(&record.id).await;
        }
        Ok(record)
    }

    async fn search_facts(
        &self,
        query: &str,
        top_k: usize,
    ) -> MemoryResult<Vec<(String, MemoryRecord)>> {
        let records = self.ranked(SEMANTIC, query, top_k).await?;
        Ok(records
            .into_iter()
            .map(|record| {
                let topic = record
                    .metadata
                    .get("topic")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                (topic, record)
            })
            .collect())
    }

    async fn add_relation(&self, a: &str, b: &str, relation: &str) -> MemoryResult<()> {
        let record = MemoryRecord {
            id: Uuid::new_v4().to_string(),
            memory_type: SEMANTIC.to_string(),
            content: format!("{a} {relation} {b}"),
            metadata: json!({
                "relation": { "from": a, "to": b, "type": relation },
            }),
            importance: 0.5,
            created_at: Utc::now(),
        };
        self.store.store_memory(&record).await?;
        Ok(())
    }

    async fn learn_procedure(&self, skill_name: &str, steps: &[String]) -> MemoryResult<()> {
        if steps.is_empty() {
            return Err(MemoryError::InvalidInput(format!(
                "procedure `{skill_name}` has no steps"
            )));
        }
        let record = MemoryRecord {
            id: format!("proc-{}", normalize_topic(skill_name)),
            memory_type: PROCEDURAL.to_string(),
            content: steps.join("\n"),
            metadata: json!({ "skill": skill_name, "steps": steps }),
            importance: 0.5,
            created_at: Utc::now(),
        };
        self.store.store_memory(&record).await?;
        Ok(())
    }

    /// Render the stored steps with `{key}` placeholders substituted from
    /// the inputs object. Side effects belong to the caller's tools.
    async fn execute_procedure(&self, skill_name: &str, inputs: Value) -> MemoryResult<Value> {
        let id = format!("proc-{}", normalize_topic(skill_name));
        let record = self
            .store
            .get_memory(&id)
            .await?
            .ok_or_else(|| MemoryError::NotFound(format!("procedure `{skill_name}`")))?;
        self.touch(&record.id).await;

        let steps = record
            .metadata
            .get("steps")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let rendered = steps
            .iter()
            .filter_map(|step| step.as_str())
            .map(|step| render_step(step, &inputs))
            .collect::<Vec<_>>();

        Ok(json!({
            "skill": skill_name,
            "steps": rendered,
            "inputs": inputs,
        }))
    }
}

fn normalize_topic(topic: &str) -> String {
    topic
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn render_step(step: &str, inputs: &Value) -> String {
    let mut out = step.to_string();
    if let Some(map) = inputs.as_object() {
        for (key, value) in map {
            let needle = format!("{{{key}}}");
            let replacement = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out = out.replace(&needle, &replacement);
        }
    }
    out
}

/// Tokenized overlap similarity in [0, 1].
fn token_similarity(a: &str, b: &str) -> f64 {
    let tokens_a = tokenize(a);
    let tokens_b = tokenize(b);
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }
    let overlap = tokens_a.iter().filter(|t| tokens_b.contains(*t)).count();
    let union = tokens_a.len() + tokens_b.len() - overlap;
    overlap as f64 / union as f64
}

fn tokenize(text: &str) -> std::collections::BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(ToString::to_string)
        .collect()
}
