//! # Agent Memory
//!
//! Persistent memory, context relevance and LLM error recovery for
//! conversational agents.
//!
//! ## Architecture
//!
//! - **Storage**: SQLite store for memory items and conversations, with
//!   in-place schema migration and identical blocking and async surfaces
//! - **Extraction**: pattern-based entity and relationship extraction
//! - **Retrieval**: relevance scoring of stored memory against user input,
//!   and prompt assembly around the top results
//! - **Recovery**: classification, backoff and retry of failed LLM calls,
//!   with metrics
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_memory::{Config, ConversationTurn, MemoryStore};
//!
//! let store = MemoryStore::new(Config::default()).await?;
//!
//! // Persist a turn
//! store.save_conversation_turn(ConversationTurn::user("I moved to Oslo")).await?;
//!
//! // Rank stored memory for the next prompt
//! let context = store.get_memory_context("Where do I live?", 5).await?;
//! ```

pub mod config;
pub mod error;
pub mod extraction;
pub mod feedback;
pub mod memory;
pub mod message;
pub mod recovery;
pub mod retrieval;
pub mod storage;

pub use config::{Config, RelevanceConfig, RetryConfig};
pub use error::{Error, Result};
pub use extraction::{enhance_memory_with_context, EntityExtractor};
pub use feedback::{Feedback, FeedbackStats, FeedbackType};
pub use memory::{Entity, EntityType, MemoryItem, MemoryStore, MemoryType, Relationship};
pub use message::{Conversation, ConversationTurn, Message, Role};
pub use recovery::{CancelHandle, ErrorCategory, ErrorRecoveryManager, Exhausted, LlmError};
pub use retrieval::{PromptBuilder, RelevanceScorer, ScoredMemory};
pub use storage::{AsyncSqliteStorage, SqliteStorage};
