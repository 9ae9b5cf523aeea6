//! Agent Memory Server
//!
//! HTTP API for the memory system.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_memory::{
    config::Config,
    error::Error,
    feedback::{Feedback, FeedbackStats, FeedbackType},
    memory::{Entity, MemoryItem, MemoryStore, MemoryType, Relationship},
    message::{ConversationTurn, Message, Role},
    recovery::{AttemptContext, ErrorRecoveryManager, LlmError, MetricsSnapshot, RecoveryOutcome},
    retrieval::ScoredMemory,
    storage::StorageStats,
};

/// Application state shared across handlers
struct AppState {
    store: MemoryStore,
    recovery: ErrorRecoveryManager,
}

type SharedState = Arc<RwLock<AppState>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::default();
    tracing::info!("Starting Agent Memory Server on port {}", config.server_port);
    tracing::info!("Data directory: {:?}", config.data_dir);

    let recovery = ErrorRecoveryManager::new(config.retry.clone());
    let store = MemoryStore::new(config.clone()).await?;

    let state = Arc::new(RwLock::new(AppState { store, recovery }));

    let app = Router::new()
        // Health check
        .route("/health", get(health))
        // Memory CRUD
        .route("/memories", get(list_memories).post(create_memory))
        .route(
            "/memories/:id",
            get(get_memory).put(update_memory).delete(delete_memory),
        )
        // Conversation
        .route("/turns", post(save_turn))
        .route("/exchanges", post(save_exchange))
        .route("/history", get(get_history))
        // Knowledge
        .route("/knowledge", get(search_knowledge))
        .route("/knowledge/facts", post(remember_fact))
        .route("/knowledge/preferences", post(remember_preference))
        // Context
        .route("/context", post(get_context))
        .route("/prompt", post(build_prompt))
        .route("/extract", post(extract))
        // Feedback
        .route("/feedback", get(list_feedback).post(save_feedback))
        .route("/feedback/stats", get(feedback_stats))
        // Recovery
        .route("/recover", post(recover))
        // Introspection
        .route("/metrics", get(get_metrics).delete(clear_metrics))
        .route("/stats", get(get_stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state);

    let port = config.server_port;
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!("Server listening on http://127.0.0.1:{}", port);

    axum::serve(listener, app).await?;

    Ok(())
}

fn status_for(error: Error) -> StatusCode {
    match error {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
        other => {
            tracing::error!("Request failed: {}", other);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn parse_type(name: Option<&str>) -> Result<Option<MemoryType>, StatusCode> {
    name.map(|n| n.parse::<MemoryType>())
        .transpose()
        .map_err(|_| StatusCode::BAD_REQUEST)
}

// === Handlers ===

async fn health() -> &'static str {
    "ok"
}

// --- Memory handlers ---

#[derive(Debug, Deserialize)]
struct ListMemoriesQuery {
    #[serde(rename = "type")]
    memory_type: Option<String>,
    q: Option<String>,
    limit: Option<usize>,
}

async fn list_memories(
    State(state): State<SharedState>,
    Query(query): Query<ListMemoriesQuery>,
) -> Result<Json<Vec<MemoryItem>>, StatusCode> {
    let state = state.read().await;
    let memory_type = parse_type(query.memory_type.as_deref())?;
    let limit = query.limit.unwrap_or(20);

    let items = match query.q.as_deref() {
        Some(q) => state.store.storage().search(q, memory_type, limit).await,
        None => state.store.storage().recent(memory_type, limit).await,
    }
    .map_err(status_for)?;

    Ok(Json(items))
}

#[derive(Debug, Deserialize)]
struct CreateMemoryRequest {
    #[serde(rename = "type")]
    memory_type: String,
    content: Value,
    #[serde(default)]
    metadata: Option<Value>,
}

async fn create_memory(
    State(state): State<SharedState>,
    Json(req): Json<CreateMemoryRequest>,
) -> Result<(StatusCode, Json<MemoryItem>), StatusCode> {
    let state = state.read().await;
    let memory_type = req
        .memory_type
        .parse::<MemoryType>()
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let mut item = MemoryItem::new(memory_type, req.content);
    let text = item.content_text();
    let extractor = state.store.extractor();
    let entities = extractor.extract_entities(&text);
    let relationships = extractor.extract_relationships(&entities, &text);
    item = item.with_entities(entities).with_relationships(relationships);
    if let Some(metadata) = req.metadata {
        item = item.with_metadata(metadata);
    }

    state
        .store
        .storage()
        .save(item.clone())
        .await
        .map_err(status_for)?;

    Ok((StatusCode::CREATED, Json(item)))
}

async fn get_memory(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<MemoryItem>, StatusCode> {
    let state = state.read().await;

    let item = state
        .store
        .storage()
        .retrieve(&id)
        .await
        .map_err(status_for)?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(item))
}

#[derive(Debug, Deserialize)]
struct UpdateMemoryRequest {
    #[serde(rename = "type")]
    memory_type: Option<String>,
    content: Option<Value>,
    metadata: Option<Value>,
    entities: Option<Vec<Entity>>,
    relationships: Option<Vec<Relationship>>,
}

async fn update_memory(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateMemoryRequest>,
) -> Result<Json<MemoryItem>, StatusCode> {
    let state = state.read().await;
    let storage = state.store.storage();

    let mut item = storage
        .retrieve(&id)
        .await
        .map_err(status_for)?
        .ok_or(StatusCode::NOT_FOUND)?;

    if let Some(memory_type) = parse_type(req.memory_type.as_deref())? {
        item.memory_type = memory_type;
    }
    if let Some(content) = req.content {
        item = item.with_content(content);
    }
    if let Some(metadata) = req.metadata {
        item = item.with_metadata(metadata);
    }
    if let Some(entities) = req.entities {
        item.entities = entities;
    }
    if let Some(relationships) = req.relationships {
        item.relationships = relationships;
    }

    storage.update(item).await.map_err(status_for)?;
    let updated = storage
        .retrieve(&id)
        .await
        .map_err(status_for)?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(updated))
}

async fn delete_memory(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    let state = state.read().await;

    state
        .store
        .storage()
        .delete(&id)
        .await
        .map_err(status_for)?;

    Ok(StatusCode::NO_CONTENT)
}

// --- Conversation handlers ---

#[derive(Debug, Deserialize)]
struct SaveTurnRequest {
    role: Role,
    content: String,
    #[serde(default)]
    metadata: Map<String, Value>,
}

#[derive(Debug, Serialize)]
struct IdResponse {
    id: String,
}

async fn save_turn(
    State(state): State<SharedState>,
    Json(req): Json<SaveTurnRequest>,
) -> Result<(StatusCode, Json<IdResponse>), StatusCode> {
    let state = state.read().await;

    let turn = ConversationTurn::new(req.role, req.content).with_metadata(req.metadata);
    let id = state
        .store
        .save_conversation_turn(turn)
        .await
        .map_err(status_for)?;

    Ok((StatusCode::CREATED, Json(IdResponse { id })))
}

#[derive(Debug, Deserialize)]
struct SaveExchangeRequest {
    user_id: String,
    user_input: String,
    agent_response: String,
}

async fn save_exchange(
    State(state): State<SharedState>,
    Json(req): Json<SaveExchangeRequest>,
) -> Result<(StatusCode, Json<IdResponse>), StatusCode> {
    let state = state.read().await;

    let id = state
        .store
        .save_exchange(&req.user_id, &req.user_input, &req.agent_response)
        .await
        .map_err(status_for)?;

    Ok((StatusCode::CREATED, Json(IdResponse { id })))
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn get_history(
    State(state): State<SharedState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<MemoryItem>>, StatusCode> {
    let state = state.read().await;
    let items = state
        .store
        .get_conversation_history(query.limit.unwrap_or(10))
        .await
        .map_err(status_for)?;
    Ok(Json(items))
}

// --- Knowledge handlers ---

#[derive(Debug, Deserialize)]
struct KnowledgeQuery {
    q: String,
    user_id: Option<String>,
    limit: Option<usize>,
}

async fn search_knowledge(
    State(state): State<SharedState>,
    Query(query): Query<KnowledgeQuery>,
) -> Result<Json<Vec<MemoryItem>>, StatusCode> {
    let state = state.read().await;
    let items = state
        .store
        .search_knowledge(&query.q, query.user_id.as_deref(), query.limit.unwrap_or(10))
        .await
        .map_err(status_for)?;
    Ok(Json(items))
}

#[derive(Debug, Deserialize)]
struct RememberRequest {
    user_id: String,
    text: String,
}

async fn remember_fact(
    State(state): State<SharedState>,
    Json(req): Json<RememberRequest>,
) -> Result<(StatusCode, Json<IdResponse>), StatusCode> {
    let state = state.read().await;
    let id = state
        .store
        .remember_fact(&req.user_id, &req.text)
        .await
        .map_err(status_for)?;
    Ok((StatusCode::CREATED, Json(IdResponse { id })))
}

async fn remember_preference(
    State(state): State<SharedState>,
    Json(req): Json<RememberRequest>,
) -> Result<(StatusCode, Json<IdResponse>), StatusCode> {
    let state = state.read().await;
    let id = state
        .store
        .remember_preference(&req.user_id, &req.text)
        .await
        .map_err(status_for)?;
    Ok((StatusCode::CREATED, Json(IdResponse { id })))
}

// --- Context handlers ---

#[derive(Debug, Deserialize)]
struct ContextRequest {
    user_input: String,
    limit: Option<usize>,
}

async fn get_context(
    State(state): State<SharedState>,
    Json(req): Json<ContextRequest>,
) -> Result<Json<Vec<ScoredMemory>>, StatusCode> {
    let state = state.read().await;
    let limit = req
        .limit
        .unwrap_or(state.store.config().relevance.max_context_items);

    let scored = state
        .store
        .score_memory_context(&req.user_input, limit)
        .await
        .map_err(status_for)?;

    Ok(Json(scored))
}

#[derive(Debug, Deserialize)]
struct PromptRequest {
    user_input: String,
    #[serde(default)]
    history: Vec<ConversationTurn>,
}

async fn build_prompt(
    State(state): State<SharedState>,
    Json(req): Json<PromptRequest>,
) -> Result<Json<Vec<Message>>, StatusCode> {
    let state = state.read().await;
    let messages = state
        .store
        .build_prompt(&req.user_input, &req.history)
        .await
        .map_err(status_for)?;
    Ok(Json(messages))
}

#[derive(Debug, Deserialize)]
struct ExtractRequest {
    text: String,
}

#[derive(Debug, Serialize)]
struct ExtractResponse {
    entities: Vec<Entity>,
    relationships: Vec<Relationship>,
}

async fn extract(
    State(state): State<SharedState>,
    Json(req): Json<ExtractRequest>,
) -> Json<ExtractResponse> {
    let state = state.read().await;
    let extractor = state.store.extractor();
    let entities = extractor.extract_entities(&req.text);
    let relationships = extractor.extract_relationships(&entities, &req.text);
    Json(ExtractResponse {
        entities,
        relationships,
    })
}

// --- Feedback handlers ---

#[derive(Debug, Deserialize)]
struct FeedbackRequest {
    user_id: String,
    message_id: String,
    #[serde(default = "default_feedback_type")]
    feedback_type: FeedbackType,
    rating: Option<u8>,
    up: Option<bool>,
    comment: Option<String>,
    conversation_id: Option<String>,
    turn_index: Option<u32>,
    #[serde(default)]
    metadata: Option<Value>,
}

fn default_feedback_type() -> FeedbackType {
    FeedbackType::Rating
}

async fn save_feedback(
    State(state): State<SharedState>,
    Json(req): Json<FeedbackRequest>,
) -> Result<(StatusCode, Json<IdResponse>), StatusCode> {
    let state = state.read().await;

    let mut feedback = match req.feedback_type {
        FeedbackType::Rating => {
            let rating = req.rating.ok_or(StatusCode::BAD_REQUEST)?;
            Feedback::rating(&req.user_id, &req.message_id, rating)
        }
        FeedbackType::ThumbsUpDown => {
            let up = req.up.ok_or(StatusCode::BAD_REQUEST)?;
            Feedback::thumbs(&req.user_id, &req.message_id, up)
        }
        FeedbackType::Comment => {
            let comment = req.comment.clone().ok_or(StatusCode::BAD_REQUEST)?;
            Feedback::comment(&req.user_id, &req.message_id, comment)
        }
    };
    if feedback.comment.is_none() {
        if let Some(comment) = req.comment {
            feedback = feedback.with_comment(comment);
        }
    }
    if let Some(conversation_id) = req.conversation_id {
        feedback = feedback.with_conversation(conversation_id, req.turn_index);
    }
    if let Some(metadata) = req.metadata {
        feedback = feedback.with_metadata(metadata);
    }

    let id = state
        .store
        .storage()
        .save_feedback(feedback)
        .await
        .map_err(status_for)?;

    Ok((StatusCode::CREATED, Json(IdResponse { id })))
}

#[derive(Debug, Deserialize)]
struct FeedbackQuery {
    message_id: Option<String>,
    limit: Option<usize>,
}

async fn list_feedback(
    State(state): State<SharedState>,
    Query(query): Query<FeedbackQuery>,
) -> Result<Json<Vec<Feedback>>, StatusCode> {
    let state = state.read().await;
    let feedback = state
        .store
        .storage()
        .get_feedback(query.message_id.as_deref(), query.limit.unwrap_or(100))
        .await
        .map_err(status_for)?;
    Ok(Json(feedback))
}

#[derive(Debug, Deserialize)]
struct FeedbackStatsQuery {
    user_id: Option<String>,
}

async fn feedback_stats(
    State(state): State<SharedState>,
    Query(query): Query<FeedbackStatsQuery>,
) -> Result<Json<FeedbackStats>, StatusCode> {
    let state = state.read().await;
    let stats = state
        .store
        .storage()
        .feedback_stats(query.user_id.as_deref())
        .await
        .map_err(status_for)?;
    Ok(Json(stats))
}

// --- Recovery handlers ---

/// A provider failure reported by a client that called the LLM itself
#[derive(Debug, Deserialize)]
struct RecoverRequest {
    operation: Option<String>,
    status: u16,
    #[serde(default)]
    body: String,
    attempt: Option<u32>,
    retry_after_secs: Option<u64>,
}

async fn recover(
    State(state): State<SharedState>,
    Json(req): Json<RecoverRequest>,
) -> Json<RecoveryOutcome> {
    let state = state.read().await;

    let error = LlmError::from_status(req.status, req.body)
        .with_retry_after(req.retry_after_secs.map(Duration::from_secs));
    let context = AttemptContext::new(
        req.operation.unwrap_or_else(|| "chat".to_string()),
        req.attempt.unwrap_or(1).max(1),
    );

    Json(state.recovery.recover(&error, &context))
}

// --- Introspection handlers ---

async fn get_metrics(State(state): State<SharedState>) -> Json<MetricsSnapshot> {
    let state = state.read().await;
    Json(state.recovery.get_error_metrics())
}

async fn clear_metrics(State(state): State<SharedState>) -> StatusCode {
    let state = state.read().await;
    state.recovery.metrics().clear();
    StatusCode::NO_CONTENT
}

async fn get_stats(State(state): State<SharedState>) -> Result<Json<StorageStats>, StatusCode> {
    let state = state.read().await;
    let stats = state.store.storage().stats().await.map_err(status_for)?;
    Ok(Json(stats))
}
