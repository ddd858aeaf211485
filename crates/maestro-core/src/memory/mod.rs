//! Hierarchical memory: short-term, long-term, and episodic partitions.
//!
//! Short-term items carry a TTL and expire lazily; long-term and episodic
//! items are embedded and indexed for semantic retrieval. Relevance is
//! boosted on access and decays with idleness; low-relevance items are
//! pruned. All operations are best-effort: failures degrade to empty
//! results, never a crash.

pub mod embed;
pub mod patterns;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use self::embed::{cosine_similarity, term_similarity, Embedder, HashEmbedder, Reranker};
use maestro_store::{keys, KvStore};

/// Memory partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    ShortTerm,
    LongTerm,
    Episodic,
}

/// A single memory item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    /// Content-derived id: first 16 hex chars of sha256(content + created_at).
    pub id: String,
    pub content: String,
    pub memory_type: MemoryType,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Relevance in [0, 1]; starts at 1.0, boosted on access, decayed when
    /// idle.
    pub relevance: f64,
    #[serde(default)]
    pub access_count: u64,
    #[serde(default)]
    pub last_accessed: Option<DateTime<Utc>>,
}

/// Status of an architecture decision record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdrStatus {
    Proposed,
    Accepted,
    Deprecated,
    Superseded,
}

/// An architecture decision record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchitectureDecision {
    pub id: String,
    pub title: String,
    pub context: String,
    pub decision: String,
    pub rationale: String,
    #[serde(default)]
    pub alternatives: Vec<String>,
    #[serde(default)]
    pub consequences: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub status: AdrStatus,
    pub created_at: DateTime<Utc>,
}

impl ArchitectureDecision {
    pub fn new(
        title: impl Into<String>,
        context: impl Into<String>,
        decision: impl Into<String>,
        rationale: impl Into<String>,
    ) -> Self {
        let title = title.into();
        let context = context.into();
        let id = short_hash(&format!("{title}:{context}"), 12);
        Self {
            id,
            title,
            context,
            decision: decision.into(),
            rationale: rationale.into(),
            alternatives: Vec::new(),
            consequences: Vec::new(),
            tags: Vec::new(),
            status: AdrStatus::Accepted,
            created_at: Utc::now(),
        }
    }
}

/// A post-mortem note from a task attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reflection {
    pub id: String,
    pub task_id: String,
    pub agent_id: String,
    pub attempt_number: u32,
    pub critique: String,
    pub improved_approach: String,
    #[serde(default)]
    pub lessons_learned: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Reflection {
    pub fn new(
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        attempt_number: u32,
        critique: impl Into<String>,
        improved_approach: impl Into<String>,
    ) -> Self {
        let task_id = task_id.into();
        let agent_id = agent_id.into();
        let id = short_hash(&format!("{task_id}:{agent_id}:{attempt_number}"), 12);
        Self {
            id,
            task_id,
            agent_id,
            attempt_number,
            critique: critique.into(),
            improved_approach: improved_approach.into(),
            lessons_learned: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

/// Configuration for the memory layer.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// TTL for short-term items.
    pub short_term_ttl: Duration,
    /// Weekly decay applied to idle items.
    pub decay_rate: f64,
    /// Items below this relevance are pruned.
    pub prune_threshold: f64,
    /// Initial retrieval fetches `limit * fetch_multiplier` candidates for
    /// re-ranking.
    pub fetch_multiplier: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            short_term_ttl: Duration::from_secs(60 * 60 * 24),
            decay_rate: 0.1,
            prune_threshold: 0.2,
            fetch_multiplier: 3,
        }
    }
}

/// Aggregate memory statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub short_term: usize,
    pub long_term: usize,
    pub episodic: usize,
    pub decisions: usize,
    pub reflections: usize,
    pub embeddings: usize,
}

#[derive(Debug, Clone)]
struct StoredEmbedding {
    vector: Vec<f32>,
    semantic: bool,
}

/// Optional write-through persistence for memory items.
struct Persistence {
    kv: Arc<dyn KvStore>,
    project_id: String,
}

/// The hierarchical memory store.
pub struct MemoryStore {
    config: MemoryConfig,
    embedder: Arc<dyn Embedder>,
    reranker: Option<Arc<dyn Reranker>>,
    persistence: Option<Persistence>,
    short_term: RwLock<HashMap<String, MemoryItem>>,
    long_term: RwLock<HashMap<String, MemoryItem>>,
    episodic: RwLock<HashMap<String, MemoryItem>>,
    embeddings: RwLock<HashMap<String, StoredEmbedding>>,
    decisions: RwLock<HashMap<String, ArchitectureDecision>>,
    reflections: RwLock<HashMap<String, Reflection>>,
}

impl MemoryStore {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            embedder: Arc::new(HashEmbedder::default()),
            reranker: None,
            persistence: None,
            short_term: RwLock::new(HashMap::new()),
            long_term: RwLock::new(HashMap::new()),
            episodic: RwLock::new(HashMap::new()),
            embeddings: RwLock::new(HashMap::new()),
            decisions: RwLock::new(HashMap::new()),
            reflections: RwLock::new(HashMap::new()),
        }
    }

    /// Swap in a real embedding collaborator.
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = embedder;
        self
    }

    /// Attach a cross-encoder re-ranking collaborator.
    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// Write items through to a key-value store under the given project
    /// namespace. Persistence is best-effort.
    pub fn with_persistence(mut self, kv: Arc<dyn KvStore>, project_id: impl Into<String>) -> Self {
        self.persistence = Some(Persistence {
            kv,
            project_id: project_id.into(),
        });
        self
    }

    /// Store a new memory item.
    pub async fn store(
        &self,
        content: &str,
        memory_type: MemoryType,
        metadata: Option<Map<String, Value>>,
        tags: Vec<String>,
    ) -> MemoryItem {
        let created_at = Utc::now();
        let id = short_hash(&format!("{content}{}", created_at.to_rfc3339()), 16);

        let item = MemoryItem {
            id: id.clone(),
            content: content.to_string(),
            memory_type,
            created_at,
            metadata: metadata.unwrap_or_default(),
            tags,
            relevance: 1.0,
            access_count: 0,
            last_accessed: None,
        };

        match memory_type {
            MemoryType::ShortTerm => {
                self.short_term.write().await.insert(id.clone(), item.clone());
            }
            MemoryType::LongTerm | MemoryType::Episodic => {
                match self.embedder.embed(content).await {
                    Ok(vector) => {
                        self.embeddings.write().await.insert(
                            id.clone(),
                            StoredEmbedding {
                                vector,
                                semantic: self.embedder.is_semantic(),
                            },
                        );
                    }
                    Err(e) => {
                        tracing::warn!(memory_id = %id, error = %e, "embedding failed, term fallback only");
                    }
                }
                let partition = if memory_type == MemoryType::LongTerm {
                    &self.long_term
                } else {
                    &self.episodic
                };
                partition.write().await.insert(id.clone(), item.clone());
            }
        }

        self.persist(&item).await;

        tracing::debug!(memory_id = %id, memory_type = ?memory_type, "memory stored");
        item
    }

    /// Retrieve memories matching a query.
    ///
    /// Each candidate scores `similarity(query, item) * item.relevance`;
    /// similarity is cosine when both sides have semantic vectors, term
    /// overlap otherwise. The top `limit * fetch_multiplier` candidates go
    /// through the optional re-ranker; returned items get their access
    /// bookkeeping updated and relevance boosted by 5% (capped at 1.0).
    pub async fn retrieve(
        &self,
        query: &str,
        memory_type: Option<MemoryType>,
        limit: usize,
        min_relevance: f64,
    ) -> Vec<MemoryItem> {
        if limit == 0 {
            return Vec::new();
        }
        self.expire_short_term().await;

        let query_vector = if self.embedder.is_semantic() {
            match self.embedder.embed(query).await {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!(error = %e, "query embedding failed, term fallback");
                    None
                }
            }
        } else {
            None
        };

        let partitions: Vec<MemoryType> = match memory_type {
            Some(t) => vec![t],
            None => vec![MemoryType::ShortTerm, MemoryType::LongTerm, MemoryType::Episodic],
        };

        let embeddings = self.embeddings.read().await;
        let mut scored: Vec<(f64, MemoryType, String)> = Vec::new();

        for partition_type in &partitions {
            let partition = self.partition(*partition_type).read().await;
            for item in partition.values() {
                let similarity = match (&query_vector, embeddings.get(&item.id)) {
                    (Some(qv), Some(stored)) if stored.semantic => {
                        cosine_similarity(qv, &stored.vector)
                    }
                    _ => term_similarity(query, &item.content),
                };
                let score = similarity * item.relevance;
                if score >= min_relevance {
                    scored.push((score, *partition_type, item.id.clone()));
                }
            }
        }
        drop(embeddings);

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit * self.config.fetch_multiplier.max(1));

        let ordered = self.rerank(query, scored).await;

        // Touch and collect the winners.
        let mut results = Vec::with_capacity(limit);
        let now = Utc::now();
        for (_, partition_type, id) in ordered.into_iter().take(limit) {
            let mut partition = self.partition(partition_type).write().await;
            if let Some(item) = partition.get_mut(&id) {
                item.access_count += 1;
                item.last_accessed = Some(now);
                item.relevance = (item.relevance * 1.05).min(1.0);
                results.push(item.clone());
            }
        }
        results
    }

    /// Fetch an item by id without touching access bookkeeping.
    pub async fn get(&self, memory_id: &str) -> Option<MemoryItem> {
        for partition in [&self.short_term, &self.long_term, &self.episodic] {
            if let Some(item) = partition.read().await.get(memory_id) {
                return Some(item.clone());
            }
        }
        None
    }

    /// Apply relevance decay to items idle for at least a week:
    /// `relevance *= (1 - rate) ^ weeks`. Returns the number affected.
    pub async fn apply_decay(&self, rate: f64) -> usize {
        let now = Utc::now();
        let mut affected = 0;
        for partition in [&self.short_term, &self.long_term, &self.episodic] {
            let mut partition = partition.write().await;
            for item in partition.values_mut() {
                let Some(last) = item.last_accessed else {
                    continue;
                };
                let idle_days = (now - last).num_days();
                if idle_days >= 7 {
                    let weeks = (idle_days / 7) as u32;
                    item.relevance *= (1.0 - rate).powi(weeks as i32);
                    affected += 1;
                }
            }
        }
        if affected > 0 {
            tracing::info!(affected, rate, "memory decay applied");
        }
        affected
    }

    /// Remove every item below the relevance threshold, along with its
    /// embedding. Returns the number removed.
    pub async fn prune(&self, threshold: f64) -> usize {
        let mut removed_ids = Vec::new();
        for partition in [&self.short_term, &self.long_term, &self.episodic] {
            let mut partition = partition.write().await;
            let doomed: Vec<String> = partition
                .iter()
                .filter(|(_, item)| item.relevance < threshold)
                .map(|(id, _)| id.clone())
                .collect();
            for id in doomed {
                partition.remove(&id);
                removed_ids.push(id);
            }
        }
        {
            let mut embeddings = self.embeddings.write().await;
            for id in &removed_ids {
                embeddings.remove(id);
            }
        }
        for id in &removed_ids {
            self.unpersist(id).await;
        }
        if !removed_ids.is_empty() {
            tracing::info!(pruned = removed_ids.len(), "low-relevance memories pruned");
        }
        removed_ids.len()
    }

    /// Store an architecture decision and mirror it into long-term memory.
    pub async fn store_decision(&self, decision: ArchitectureDecision) {
        let content = format!(
            "ADR: {}\nContext: {}\nDecision: {}",
            decision.title, decision.context, decision.decision
        );
        let mut tags = decision.tags.clone();
        tags.extend(["adr".to_string(), "architecture".to_string()]);
        let mut metadata = Map::new();
        metadata.insert("adr_id".to_string(), Value::String(decision.id.clone()));

        self.store(&content, MemoryType::LongTerm, Some(metadata), tags)
            .await;
        tracing::info!(adr = %decision.title, "architecture decision stored");
        self.decisions.write().await.insert(decision.id.clone(), decision);
    }

    /// Store a reflection and mirror its lessons into episodic memory.
    pub async fn store_reflection(&self, reflection: Reflection) {
        let content = format!(
            "Task {}: {}\nLessons: {}",
            reflection.task_id,
            reflection.critique,
            reflection.lessons_learned.join(", ")
        );
        let mut metadata = Map::new();
        metadata.insert(
            "reflection_id".to_string(),
            Value::String(reflection.id.clone()),
        );
        metadata.insert("task_id".to_string(), Value::String(reflection.task_id.clone()));

        self.store(
            &content,
            MemoryType::Episodic,
            Some(metadata),
            vec!["reflection".to_string(), "lesson".to_string()],
        )
        .await;
        tracing::info!(task_id = %reflection.task_id, "reflection stored");
        self.reflections
            .write()
            .await
            .insert(reflection.id.clone(), reflection);
    }

    pub async fn decisions(&self) -> Vec<ArchitectureDecision> {
        self.decisions.read().await.values().cloned().collect()
    }

    pub async fn reflections_for_task(&self, task_id: &str) -> Vec<Reflection> {
        self.reflections
            .read()
            .await
            .values()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> MemoryStats {
        self.expire_short_term().await;
        MemoryStats {
            short_term: self.short_term.read().await.len(),
            long_term: self.long_term.read().await.len(),
            episodic: self.episodic.read().await.len(),
            decisions: self.decisions.read().await.len(),
            reflections: self.reflections.read().await.len(),
            embeddings: self.embeddings.read().await.len(),
        }
    }

    fn partition(&self, memory_type: MemoryType) -> &RwLock<HashMap<String, MemoryItem>> {
        match memory_type {
            MemoryType::ShortTerm => &self.short_term,
            MemoryType::LongTerm => &self.long_term,
            MemoryType::Episodic => &self.episodic,
        }
    }

    /// Drop short-term items whose TTL elapsed.
    async fn expire_short_term(&self) {
        let ttl = chrono::Duration::from_std(self.config.short_term_ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        let now = Utc::now();
        let mut partition = self.short_term.write().await;
        let expired: Vec<String> = partition
            .iter()
            .filter(|(_, item)| now - item.created_at > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            partition.remove(id);
        }
        if !expired.is_empty() {
            tracing::debug!(expired = expired.len(), "short-term memories expired");
        }
    }

    async fn rerank(
        &self,
        query: &str,
        scored: Vec<(f64, MemoryType, String)>,
    ) -> Vec<(f64, MemoryType, String)> {
        let Some(reranker) = &self.reranker else {
            return scored;
        };
        if scored.is_empty() {
            return scored;
        }

        let mut contents = Vec::with_capacity(scored.len());
        for (_, partition_type, id) in &scored {
            let partition = self.partition(*partition_type).read().await;
            contents.push(
                partition
                    .get(id)
                    .map(|item| item.content.clone())
                    .unwrap_or_default(),
            );
        }

        match reranker.rerank(query, &contents).await {
            Ok(new_scores) if new_scores.len() == scored.len() => {
                let mut rescored: Vec<(f64, MemoryType, String)> = scored
                    .into_iter()
                    .zip(new_scores)
                    .map(|((_, t, id), s)| (s as f64, t, id))
                    .collect();
                rescored
                    .sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
                rescored
            }
            Ok(_) => {
                tracing::warn!("re-ranker returned mismatched score count, keeping initial order");
                scored
            }
            Err(e) => {
                tracing::warn!(error = %e, "re-ranking failed, keeping initial order");
                scored
            }
        }
    }

    async fn persist(&self, item: &MemoryItem) {
        let Some(p) = &self.persistence else { return };
        let Ok(value) = serde_json::to_value(item) else {
            return;
        };
        let (key, ttl) = match item.memory_type {
            MemoryType::ShortTerm => (
                keys::short_term(&p.project_id, &item.id),
                Some(self.config.short_term_ttl),
            ),
            MemoryType::LongTerm => (keys::long_term(&p.project_id, &item.id), None),
            MemoryType::Episodic => (keys::episodic(&p.project_id, &item.id), None),
        };
        if let Err(e) = p.kv.set(&key, value, ttl).await {
            tracing::warn!(error = %e, key, "memory persistence write failed");
            return;
        }
        let index = keys::partition_index(&p.project_id, item.memory_type.as_key());
        if let Err(e) = p.kv.set_add(&index, &item.id).await {
            tracing::warn!(error = %e, index, "memory index update failed");
        }
    }

    async fn unpersist(&self, memory_id: &str) {
        let Some(p) = &self.persistence else { return };
        for mem_type in ["short", "long", "episodic"] {
            let key = keys::memory_key(&p.project_id, mem_type, memory_id);
            let _ = p.kv.delete(&key).await;
            let _ = p
                .kv
                .set_remove(&keys::partition_index(&p.project_id, mem_type), memory_id)
                .await;
        }
    }
}

impl MemoryType {
    /// Short key segment used in the persisted-state scheme.
    pub fn as_key(self) -> &'static str {
        match self {
            MemoryType::ShortTerm => "short",
            MemoryType::LongTerm => "long",
            MemoryType::Episodic => "episodic",
        }
    }
}

fn short_hash(input: &str, len: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)[..len].to_string()
}
