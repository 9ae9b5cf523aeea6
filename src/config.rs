//! Configuration for agent-memory

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::memory::MemoryType;

/// Configuration for the memory system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory for all storage
    pub data_dir: PathBuf,

    /// Soft cap on stored memory items. Crossing it is logged; the sweep
    /// itself belongs to the caller.
    pub max_memory_items: usize,

    /// Retry and backoff settings for LLM calls
    pub retry: RetryConfig,

    /// Relevance scoring and prompt assembly settings
    pub relevance: RelevanceConfig,

    /// HTTP server port
    pub server_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("agent-memory");

        Self {
            data_dir,
            max_memory_items: 1000,
            retry: RetryConfig::default(),
            relevance: RelevanceConfig::default(),
            server_port: 8420,
        }
    }
}

impl Config {
    /// Create a new config with a custom data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Get the path to the SQLite database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("memory.db")
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
    }

    /// Reject settings the engines cannot work with
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        self.relevance.validate()?;
        if self.max_memory_items == 0 {
            return Err(Error::config("max_memory_items must be at least 1"));
        }
        Ok(())
    }
}

/// Retry and backoff settings for the error recovery manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry; doubles on each further retry
    pub base_delay: Duration,

    /// Upper bound for any single backoff delay
    pub max_delay: Duration,

    /// Total attempts per call, including the first one
    pub max_attempts: u32,

    /// Attempts allowed for Model and Generic failures
    pub bounded_attempts: u32,

    /// Number of failure records kept for inspection
    pub metrics_history: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 3,
            bounded_attempts: 2,
            metrics_history: 1000,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::config("retry.max_attempts must be at least 1"));
        }
        if self.base_delay > self.max_delay {
            return Err(Error::config(format!(
                "retry.base_delay ({:?}) exceeds retry.max_delay ({:?})",
                self.base_delay, self.max_delay
            )));
        }
        Ok(())
    }
}

/// Relevance scoring settings
///
/// `score = keyword_weight * overlap + type_weight * type_factor + recency_weight * decay`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelevanceConfig {
    pub keyword_weight: f32,
    pub type_weight: f32,
    pub recency_weight: f32,

    /// Per-type constants used as the type factor
    pub type_weights: TypeWeights,

    /// Hours used in `exp(-age_hours / half_life_hours)`
    pub half_life_hours: f64,

    /// Only items scoring strictly above this are returned
    pub score_floor: f32,

    /// How many stored items are read as scoring candidates
    pub candidate_pool: usize,

    /// Memory items placed in the prompt context block
    pub max_context_items: usize,

    /// Conversation turns carried into the prompt
    pub history_turns: usize,
}

impl Default for RelevanceConfig {
    fn default() -> Self {
        Self {
            keyword_weight: 0.5,
            type_weight: 0.3,
            recency_weight: 0.2,
            type_weights: TypeWeights::default(),
            half_life_hours: 72.0,
            score_floor: 0.2,
            candidate_pool: 50,
            max_context_items: 5,
            history_turns: 6,
        }
    }
}

impl RelevanceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.half_life_hours.is_nan() || self.half_life_hours <= 0.0 {
            return Err(Error::config("relevance.half_life_hours must be positive"));
        }
        let weights = [self.keyword_weight, self.type_weight, self.recency_weight];
        if weights.iter().any(|w| *w < 0.0 || !w.is_finite()) {
            return Err(Error::config("relevance weights must be finite and non-negative"));
        }
        if self.candidate_pool == 0 {
            return Err(Error::config("relevance.candidate_pool must be at least 1"));
        }
        Ok(())
    }
}

/// Fixed per-type weights, knowledge and conversation above task and skill
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TypeWeights {
    pub conversation: f32,
    pub knowledge: f32,
    pub task: f32,
    pub skill: f32,
}

impl Default for TypeWeights {
    fn default() -> Self {
        Self {
            conversation: 0.7,
            knowledge: 0.9,
            task: 0.6,
            skill: 0.5,
        }
    }
}

impl TypeWeights {
    pub fn weight(&self, memory_type: MemoryType) -> f32 {
        match memory_type {
            MemoryType::Conversation => self.conversation,
            MemoryType::Knowledge => self.knowledge,
            MemoryType::Task => self.task,
            MemoryType::Skill => self.skill,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn sqlite_path_lives_in_data_dir() {
        let config = Config::with_data_dir("/tmp/agent");
        assert_eq!(config.sqlite_path(), PathBuf::from("/tmp/agent/memory.db"));
    }

    #[test]
    fn rejects_inverted_delays() {
        let mut config = Config::default();
        config.retry.base_delay = Duration::from_secs(90);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_zero_half_life() {
        let mut config = Config::default();
        config.relevance.half_life_hours = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn knowledge_outweighs_task() {
        let weights = TypeWeights::default();
        assert!(weights.weight(MemoryType::Knowledge) > weights.weight(MemoryType::Task));
        assert!(weights.weight(MemoryType::Conversation) > weights.weight(MemoryType::Skill));
    }
}
