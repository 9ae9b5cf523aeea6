//! Relevance scoring and context injection for prompts

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::config::RelevanceConfig;
use crate::memory::MemoryItem;
use crate::message::{ConversationTurn, Message};

lazy_static! {
    static ref STOP_WORDS: HashSet<&'static str> = [
        "a", "an", "and", "are", "as", "at", "be", "but", "by", "can", "did", "do", "does",
        "for", "from", "had", "has", "have", "he", "her", "his", "how", "i", "if", "in", "into",
        "is", "it", "its", "me", "my", "no", "not", "of", "on", "or", "our", "she", "so",
        "that", "the", "their", "them", "then", "there", "these", "they", "this", "to", "us",
        "was", "we", "were", "what", "when", "where", "which", "who", "why", "will", "with",
        "would", "you", "your",
    ]
    .into_iter()
    .collect();
}

const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a helpful assistant with a long-term memory of \
previous conversations with this user. Use the remembered context below when it is relevant, \
and ignore it when it is not.";

/// Lower-cased word tokens with stop-words removed
pub fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 1)
        .map(str::to_lowercase)
        .filter(|t| !STOP_WORDS.contains(t.as_str()))
        .collect()
}

/// The three factors that make up a relevance score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreFactors {
    /// Jaccard overlap of input and item tokens
    pub keyword_overlap: f32,
    pub type_weight: f32,
    /// `exp(-age_hours / half_life_hours)`
    pub recency: f32,
}

/// A memory item with its relevance to the current input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredMemory {
    pub item: MemoryItem,
    pub score: f32,
    pub factors: ScoreFactors,
    /// Human-readable breakdown of the score
    pub reasoning: String,
}

/// Ranks stored memory against user input
#[derive(Debug, Clone)]
pub struct RelevanceScorer {
    config: RelevanceConfig,
}

impl RelevanceScorer {
    pub fn new(config: RelevanceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RelevanceConfig {
        &self.config
    }

    /// Score candidates against the input, best first.
    ///
    /// Only items scoring strictly above the floor are kept. Ties go to the
    /// newer item, then to the earlier candidate.
    pub fn score_context_relevance(
        &self,
        user_input: &str,
        candidates: Vec<MemoryItem>,
    ) -> Vec<ScoredMemory> {
        self.score_at(user_input, candidates, Utc::now())
    }

    /// [`score_context_relevance`](Self::score_context_relevance) with a fixed "now"
    pub fn score_at(
        &self,
        user_input: &str,
        candidates: Vec<MemoryItem>,
        now: DateTime<Utc>,
    ) -> Vec<ScoredMemory> {
        let query_tokens = tokenize(user_input);

        let mut scored: Vec<ScoredMemory> = candidates
            .into_iter()
            .map(|item| {
                let factors = self.factors(&query_tokens, &item, now);
                let score = self.combine(&factors);
                let reasoning = format!(
                    "keyword overlap {:.2}, type weight {:.2} ({}), recency {:.2}",
                    factors.keyword_overlap, factors.type_weight, item.memory_type, factors.recency
                );
                ScoredMemory {
                    item,
                    score,
                    factors,
                    reasoning,
                }
            })
            .filter(|s| s.score > self.config.score_floor)
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.item.created_at.cmp(&a.item.created_at))
        });
        scored
    }

    /// Factor breakdown for one item
    pub fn factors(
        &self,
        query_tokens: &HashSet<String>,
        item: &MemoryItem,
        now: DateTime<Utc>,
    ) -> ScoreFactors {
        let item_tokens = tokenize(&item.content_text());
        let union = query_tokens.union(&item_tokens).count();
        let keyword_overlap = if union == 0 {
            0.0
        } else {
            query_tokens.intersection(&item_tokens).count() as f32 / union as f32
        };

        let age_hours = ((now - item.created_at).num_milliseconds() as f64 / 3_600_000.0).max(0.0);
        let recency = (-age_hours / self.config.half_life_hours).exp() as f32;

        ScoreFactors {
            keyword_overlap,
            type_weight: self.config.type_weights.weight(item.memory_type),
            recency,
        }
    }

    fn combine(&self, factors: &ScoreFactors) -> f32 {
        self.config.keyword_weight * factors.keyword_overlap
            + self.config.type_weight * factors.type_weight
            + self.config.recency_weight * factors.recency
    }
}

/// Assembles prompt messages from memory, history and the user input
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    system_instruction: String,
    max_context_items: usize,
    history_turns: usize,
}

impl PromptBuilder {
    pub fn new(max_context_items: usize, history_turns: usize) -> Self {
        Self {
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            max_context_items,
            history_turns,
        }
    }

    pub fn from_config(config: &RelevanceConfig) -> Self {
        Self::new(config.max_context_items, config.history_turns)
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = instruction.into();
        self
    }

    /// System instruction, memory context block, recent history, then the input.
    ///
    /// The context block is left out when there is no memory.
    pub fn create_context_aware_prompt(
        &self,
        user_input: &str,
        history: &[ConversationTurn],
        memory: &[MemoryItem],
    ) -> Vec<Message> {
        let mut messages = vec![Message::system(self.system_instruction.clone())];

        if let Some(context) = self.format_context(memory) {
            messages.push(Message::system(context));
        }

        let start = history.len().saturating_sub(self.history_turns);
        messages.extend(history[start..].iter().map(Message::from));

        messages.push(Message::user(user_input));
        messages
    }

    /// Format the top memory items for injection into a prompt
    pub fn format_context(&self, memory: &[MemoryItem]) -> Option<String> {
        let lines: Vec<String> = memory
            .iter()
            .take(self.max_context_items)
            .map(|item| format!("- [{}] {}\n", item.memory_type, item.content_text()))
            .collect();

        if lines.is_empty() {
            return None;
        }
        Some(format!("## Relevant Memories\n{}", lines.concat()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryType;
    use crate::message::Role;
    use chrono::Duration;
    use serde_json::json;

    fn scorer() -> RelevanceScorer {
        RelevanceScorer::new(RelevanceConfig {
            score_floor: 0.0,
            ..Default::default()
        })
    }

    #[test]
    fn tokenize_drops_stop_words_and_case() {
        let tokens = tokenize("What is the Weather in Paris?");
        let mut tokens: Vec<_> = tokens.into_iter().collect();
        tokens.sort();
        assert_eq!(tokens, vec!["paris", "weather"]);
    }

    #[test]
    fn higher_overlap_ranks_first() {
        let now = Utc::now();
        let weak = MemoryItem::knowledge(json!({ "fact": "weather is nice" })).created_at(now);
        let strong = MemoryItem::knowledge(json!({ "fact": "weather in paris" })).created_at(now);

        let scored = scorer().score_at("weather paris", vec![weak.clone(), strong.clone()], now);
        assert_eq!(scored[0].item.id, strong.id);
        assert_eq!(scored[1].item.id, weak.id);
        assert!(scored[0].factors.keyword_overlap > scored[1].factors.keyword_overlap);
    }

    #[test]
    fn type_weight_breaks_equal_overlap() {
        let now = Utc::now();
        let task = MemoryItem::new(MemoryType::Task, json!({ "text": "buy milk" })).created_at(now);
        let fact = MemoryItem::knowledge(json!({ "text": "buy milk" })).created_at(now);

        let scored = scorer().score_at("milk", vec![task, fact.clone()], now);
        assert_eq!(scored[0].item.id, fact.id);
    }

    #[test]
    fn recency_decays_with_half_life() {
        let now = Utc::now();
        let scorer = scorer();
        let tokens = tokenize("anything");
        let fresh = MemoryItem::knowledge(json!({ "fact": "x" })).created_at(now);
        let old = MemoryItem::knowledge(json!({ "fact": "x" })).created_at(now - Duration::hours(72));
        let future = MemoryItem::knowledge(json!({ "fact": "x" })).created_at(now + Duration::hours(5));

        assert!((scorer.factors(&tokens, &fresh, now).recency - 1.0).abs() < 1e-6);
        let decayed = scorer.factors(&tokens, &old, now).recency;
        assert!((decayed - (-1.0f32).exp()).abs() < 1e-4);
        assert!((scorer.factors(&tokens, &future, now).recency - 1.0).abs() < 1e-6);
    }

    #[test]
    fn floor_is_strict() {
        let now = Utc::now();
        let item = MemoryItem::knowledge(json!({ "fact": "unrelated" }))
            .created_at(now - Duration::days(365));
        let config = RelevanceConfig::default();
        let scorer = RelevanceScorer::new(RelevanceConfig {
            score_floor: 0.3 * config.type_weights.knowledge,
            recency_weight: 0.0,
            ..config
        });
        assert!(scorer.score_at("weather", vec![item], now).is_empty());
    }

    #[test]
    fn ties_prefer_newer_then_input_order() {
        let now = Utc::now();
        let older = MemoryItem::knowledge(json!({ "fact": "a" })).created_at(now - Duration::hours(1));
        let newer = MemoryItem::knowledge(json!({ "fact": "a" })).created_at(now);
        let twin = MemoryItem::knowledge(json!({ "fact": "a" })).created_at(now);
        let scorer = RelevanceScorer::new(RelevanceConfig {
            score_floor: 0.0,
            recency_weight: 0.0,
            ..Default::default()
        });

        let scored = scorer.score_at("a", vec![older.clone(), newer.clone(), twin.clone()], now);
        let ids: Vec<_> = scored.iter().map(|s| s.item.id.clone()).collect();
        assert_eq!(ids, vec![newer.id, twin.id, older.id]);
    }

    #[test]
    fn prompt_layout() {
        let builder = PromptBuilder::new(1, 2);
        let history = vec![
            ConversationTurn::user("one"),
            ConversationTurn::assistant("two"),
            ConversationTurn::user("three"),
        ];
        let memory = vec![
            MemoryItem::knowledge(json!({ "fact": "likes tea" })),
            MemoryItem::knowledge(json!({ "fact": "lives in Oslo" })),
        ];

        let messages = builder.create_context_aware_prompt("hello", &history, &memory);
        let roles: Vec<_> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::System, Role::Assistant, Role::User, Role::User]
        );
        assert!(messages[1].content.contains("likes tea"));
        assert!(!messages[1].content.contains("Oslo"));
        assert_eq!(messages[2].content, "two");
        assert_eq!(messages[4].content, "hello");
    }

    #[test]
    fn prompt_without_memory_has_no_context_block() {
        let builder = PromptBuilder::new(5, 6);
        let messages = builder.create_context_aware_prompt("hi", &[], &[]);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1], Message::user("hi"));
    }
}
