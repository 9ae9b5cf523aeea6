//! Memory items, entities and the store that ties storage, extraction and scoring together

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::extraction::EntityExtractor;
use crate::message::{ConversationTurn, Message};
use crate::retrieval::{tokenize, PromptBuilder, RelevanceScorer, ScoredMemory};
use crate::storage::AsyncSqliteStorage;

/// Type of memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    /// A stored conversation turn or exchange
    Conversation,

    /// A fact or preference learned about the user
    Knowledge,

    /// A task record
    Task,

    /// A skill record
    Skill,
}

impl MemoryType {
    pub const ALL: [MemoryType; 4] = [
        MemoryType::Conversation,
        MemoryType::Knowledge,
        MemoryType::Task,
        MemoryType::Skill,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Conversation => "conversation",
            MemoryType::Knowledge => "knowledge",
            MemoryType::Task => "task",
            MemoryType::Skill => "skill",
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "conversation" => Ok(MemoryType::Conversation),
            "knowledge" => Ok(MemoryType::Knowledge),
            "task" => Ok(MemoryType::Task),
            "skill" => Ok(MemoryType::Skill),
            _ => Err(Error::invalid_input(format!("Unknown memory type: {}", s))),
        }
    }
}

/// Kind of a recognized entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Person,
    Organization,
    Location,
    Date,
    Other,
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityType::Person => write!(f, "person"),
            EntityType::Organization => write!(f, "organization"),
            EntityType::Location => write!(f, "location"),
            EntityType::Date => write!(f, "date"),
            EntityType::Other => write!(f, "other"),
        }
    }
}

/// A named thing recognized in text
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entity {
    /// Surface form as it appeared in the text
    pub text: String,

    #[serde(rename = "type")]
    pub entity_type: EntityType,

    /// Canonical form used for matching
    pub normalized_form: String,
}

impl Entity {
    /// Create an entity whose normalized form is the lower-cased, whitespace-collapsed text
    pub fn new(text: impl Into<String>, entity_type: EntityType) -> Self {
        let text = text.into();
        let normalized_form = text
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        Self {
            text,
            entity_type,
            normalized_form,
        }
    }

    pub fn with_normalized_form(mut self, normalized_form: impl Into<String>) -> Self {
        self.normalized_form = normalized_form.into();
        self
    }
}

/// A directed, predicated link between two entities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub subject: Entity,
    pub predicate: String,
    pub object: Entity,

    /// 0.0 - 1.0; never NaN, which JSON cannot store
    pub confidence: f32,
}

impl Relationship {
    pub fn new(subject: Entity, predicate: impl Into<String>, object: Entity, confidence: f32) -> Self {
        Self {
            subject,
            predicate: predicate.into(),
            object,
            confidence: if confidence.is_finite() {
                confidence.clamp(0.0, 1.0)
            } else {
                0.0
            },
        }
    }
}

/// A stored unit of agent memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    /// Unique memory ID, never reassigned
    pub id: String,

    #[serde(rename = "type")]
    pub memory_type: MemoryType,

    pub content: Map<String, Value>,

    #[serde(default)]
    pub metadata: Map<String, Value>,

    #[serde(default)]
    pub entities: Vec<Entity>,

    #[serde(default)]
    pub relationships: Vec<Relationship>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Reserved; not persisted
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

impl MemoryItem {
    /// Create a new memory item with a fresh id.
    ///
    /// Non-object content is wrapped as `{"value": content}`.
    pub fn new(memory_type: MemoryType, content: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            memory_type,
            content: into_object(content),
            metadata: Map::new(),
            entities: Vec::new(),
            relationships: Vec::new(),
            created_at: now,
            updated_at: now,
            embedding: None,
        }
    }

    pub fn conversation(content: Value) -> Self {
        Self::new(MemoryType::Conversation, content)
    }

    pub fn knowledge(content: Value) -> Self {
        Self::new(MemoryType::Knowledge, content)
    }

    /// Use a caller-chosen id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Replace the content; non-object values are wrapped as in [`MemoryItem::new`]
    pub fn with_content(mut self, content: Value) -> Self {
        self.content = into_object(content);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = into_object(metadata);
        self
    }

    pub fn with_entities(mut self, entities: Vec<Entity>) -> Self {
        self.entities = entities;
        self
    }

    pub fn with_relationships(mut self, relationships: Vec<Relationship>) -> Self {
        self.relationships = relationships;
        self
    }

    /// Set both timestamps
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.updated_at = at;
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Bump `updated_at`, never moving it before `created_at`
    pub fn touch(&mut self) {
        self.updated_at = Utc::now().max(self.created_at);
    }

    /// All string values in the content, depth-first, joined by spaces
    pub fn content_text(&self) -> String {
        let mut parts = Vec::new();
        for value in self.content.values() {
            collect_strings(value, &mut parts);
        }
        parts.join(" ")
    }
}

fn into_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

/// The main memory store: persists turns and knowledge, and ranks stored
/// memory against the current user input
pub struct MemoryStore {
    config: Config,
    storage: AsyncSqliteStorage,
    extractor: EntityExtractor,
    scorer: RelevanceScorer,
    prompts: PromptBuilder,
}

impl MemoryStore {
    /// Create a new memory store, opening (and migrating) the database
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        config.ensure_dirs()?;

        let storage = AsyncSqliteStorage::open(config.sqlite_path()).await?;
        Ok(Self::with_storage(config, storage))
    }

    /// Build a store over an already opened storage
    pub fn with_storage(config: Config, storage: AsyncSqliteStorage) -> Self {
        let scorer = RelevanceScorer::new(config.relevance.clone());
        let prompts = PromptBuilder::from_config(&config.relevance);
        Self {
            config,
            storage,
            extractor: EntityExtractor::new(),
            scorer,
            prompts,
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the storage
    pub fn storage(&self) -> &AsyncSqliteStorage {
        &self.storage
    }

    pub fn extractor(&self) -> &EntityExtractor {
        &self.extractor
    }

    pub fn scorer(&self) -> &RelevanceScorer {
        &self.scorer
    }

    /// Persist one conversation turn as a conversation memory item.
    ///
    /// Entities and relationships are extracted from the turn text unless the
    /// turn already carries them. Returns once the write has completed.
    pub async fn save_conversation_turn(&self, turn: ConversationTurn) -> Result<String> {
        let entities = if turn.entities.is_empty() {
            self.extractor.extract_entities(&turn.content)
        } else {
            turn.entities
        };
        let relationships = if turn.relationships.is_empty() {
            self.extractor.extract_relationships(&entities, &turn.content)
        } else {
            turn.relationships
        };

        // Role and timestamp stay out of content so they never count as keywords
        let mut metadata = turn.metadata;
        metadata.insert("role".to_string(), Value::String(turn.role.to_string()));
        metadata.insert("timestamp".to_string(), json!(turn.timestamp));

        let item = MemoryItem::conversation(json!({ "content": turn.content }))
        .with_metadata(Value::Object(metadata))
        .with_entities(entities)
        .with_relationships(relationships)
        .created_at(turn.timestamp);

        self.persist(item).await
    }

    /// Persist a user/assistant exchange as a single conversation item
    pub async fn save_exchange(
        &self,
        user_id: &str,
        user_input: &str,
        agent_response: &str,
    ) -> Result<String> {
        let mut entities = self.extractor.extract_entities(user_input);
        let mut relationships = self.extractor.extract_relationships(&entities, user_input);
        let agent_entities = self.extractor.extract_entities(agent_response);
        relationships.extend(
            self.extractor
                .extract_relationships(&agent_entities, agent_response),
        );
        entities.extend(agent_entities);

        let item = MemoryItem::conversation(json!({
            "user_input": user_input,
            "agent_response": agent_response,
        }))
        .with_metadata(json!({ "user_id": user_id }))
        .with_entities(entities)
        .with_relationships(relationships);

        self.persist(item).await
    }

    /// Store a fact about the user
    pub async fn remember_fact(&self, user_id: &str, fact: &str) -> Result<String> {
        self.remember(user_id, "fact", fact).await
    }

    /// Store a user preference
    pub async fn remember_preference(&self, user_id: &str, preference: &str) -> Result<String> {
        self.remember(user_id, "preference", preference).await
    }

    async fn remember(&self, user_id: &str, category: &str, text: &str) -> Result<String> {
        let entities = self.extractor.extract_entities(text);
        let relationships = self.extractor.extract_relationships(&entities, text);

        let mut content = Map::new();
        content.insert(category.to_string(), Value::String(text.to_string()));
        let item = MemoryItem::knowledge(Value::Object(content))
            .with_metadata(json!({ "user_id": user_id, "category": category }))
            .with_entities(entities)
            .with_relationships(relationships);

        self.persist(item).await
    }

    async fn persist(&self, item: MemoryItem) -> Result<String> {
        let memory_type = item.memory_type;
        match self.storage.save(item).await {
            Ok(id) => {
                debug!(%id, %memory_type, "memory item saved");
                self.check_capacity().await;
                Ok(id)
            }
            Err(e) => {
                warn!(%memory_type, error = %e, "failed to save memory item");
                Err(e)
            }
        }
    }

    async fn check_capacity(&self) {
        match self.storage.count(None).await {
            Ok(count) if count > self.config.max_memory_items => {
                warn!(
                    count,
                    max = self.config.max_memory_items,
                    "memory store is over its soft capacity"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to count memory items"),
        }
    }

    /// Search knowledge items, optionally only those stored for one user
    pub async fn search_knowledge(
        &self,
        query: &str,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MemoryItem>> {
        let mut results = self
            .storage
            .search(query, Some(MemoryType::Knowledge), limit)
            .await?;
        if let Some(uid) = user_id {
            results.retain(|item| item.metadata.get("user_id").and_then(Value::as_str) == Some(uid));
        }
        Ok(results)
    }

    /// Most recent conversation items, newest first
    pub async fn get_conversation_history(&self, limit: usize) -> Result<Vec<MemoryItem>> {
        self.storage.recent(Some(MemoryType::Conversation), limit).await
    }

    /// Rank stored memory against the user input, best first
    pub async fn score_memory_context(
        &self,
        user_input: &str,
        limit: usize,
    ) -> Result<Vec<ScoredMemory>> {
        let candidates = self.collect_candidates(user_input).await?;
        let mut scored = self.scorer.score_context_relevance(user_input, candidates);
        scored.truncate(limit);
        Ok(scored)
    }

    /// The most relevant memory items for the user input, best first
    pub async fn get_memory_context(&self, user_input: &str, limit: usize) -> Result<Vec<MemoryItem>> {
        let scored = self.score_memory_context(user_input, limit).await?;
        Ok(scored.into_iter().map(|s| s.item).collect())
    }

    /// Assemble the prompt messages for the next LLM call
    pub async fn build_prompt(
        &self,
        user_input: &str,
        history: &[ConversationTurn],
    ) -> Result<Vec<Message>> {
        let memory = self
            .get_memory_context(user_input, self.config.relevance.max_context_items)
            .await?;
        Ok(self
            .prompts
            .create_context_aware_prompt(user_input, history, &memory))
    }

    /// Recent items plus keyword hits for the input's tokens, deduplicated by
    /// id in first-seen order
    async fn collect_candidates(&self, user_input: &str) -> Result<Vec<MemoryItem>> {
        let pool = self.config.relevance.candidate_pool;
        let mut terms: Vec<String> = tokenize(user_input).into_iter().collect();
        terms.sort();
        terms.truncate(8);

        let recent = self.storage.recent(None, pool);
        let hits = try_join_all(
            terms
                .iter()
                .map(|term| self.storage.search(term, None, pool)),
        );
        let (recent, hits) = futures::try_join!(recent, hits)?;

        let mut seen = std::collections::HashSet::new();
        let mut candidates = Vec::new();
        for item in recent.into_iter().chain(hits.into_iter().flatten()) {
            if seen.insert(item.id.clone()) {
                candidates.push(item);
            }
        }
        Ok(candidates)
    }
}
