//! Ratings and comments on assistant responses

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};

pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 5;

/// Kind of feedback given
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackType {
    Rating,
    ThumbsUpDown,
    Comment,
}

impl FeedbackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackType::Rating => "rating",
            FeedbackType::ThumbsUpDown => "thumbs_up_down",
            FeedbackType::Comment => "comment",
        }
    }
}

impl fmt::Display for FeedbackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedbackType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rating" => Ok(FeedbackType::Rating),
            "thumbs_up_down" => Ok(FeedbackType::ThumbsUpDown),
            "comment" => Ok(FeedbackType::Comment),
            other => Err(Error::invalid_input(format!("Unknown feedback type: {}", other))),
        }
    }
}

/// Feedback on one assistant response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub id: String,

    pub user_id: Option<String>,

    pub conversation_id: Option<String>,

    /// Id of the response being rated
    pub message_id: Option<String>,

    /// Position of the rated turn in its conversation
    pub turn_index: Option<u32>,

    /// 1 to 5; thumbs up and down are stored as 5 and 1
    pub rating: Option<u8>,

    pub feedback_type: FeedbackType,

    pub comment: Option<String>,

    #[serde(default)]
    pub metadata: Map<String, Value>,

    pub created_at: DateTime<Utc>,
}

impl Feedback {
    fn new(user_id: &str, message_id: &str, feedback_type: FeedbackType) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: Some(user_id.to_string()),
            conversation_id: None,
            message_id: Some(message_id.to_string()),
            turn_index: None,
            rating: None,
            feedback_type,
            comment: None,
            metadata: Map::new(),
            created_at: Utc::now(),
        }
    }

    pub fn rating(user_id: &str, message_id: &str, rating: u8) -> Self {
        Self {
            rating: Some(rating),
            ..Self::new(user_id, message_id, FeedbackType::Rating)
        }
    }

    pub fn thumbs(user_id: &str, message_id: &str, up: bool) -> Self {
        Self {
            rating: Some(if up { MAX_RATING } else { MIN_RATING }),
            ..Self::new(user_id, message_id, FeedbackType::ThumbsUpDown)
        }
    }

    pub fn comment(user_id: &str, message_id: &str, comment: impl Into<String>) -> Self {
        Self {
            comment: Some(comment.into()),
            ..Self::new(user_id, message_id, FeedbackType::Comment)
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>, turn_index: Option<u32>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self.turn_index = turn_index;
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        if let Value::Object(map) = metadata {
            self.metadata = map;
        }
        self
    }

    /// Ratings must be on the 1 to 5 scale
    pub fn validate(&self) -> Result<()> {
        match self.rating {
            Some(r) if !(MIN_RATING..=MAX_RATING).contains(&r) => Err(Error::invalid_input(format!(
                "Rating {} is outside {}..={}",
                r, MIN_RATING, MAX_RATING
            ))),
            _ => Ok(()),
        }
    }
}

/// Aggregate over stored feedback
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackStats {
    pub total_feedback: usize,

    /// Mean rating rounded to two decimals; 0 when nothing is rated
    pub average_rating: f64,

    /// Ratings of 4 or more
    pub positive_feedback: usize,

    /// Ratings of 2 or less
    pub negative_feedback: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thumbs_map_to_scale_ends() {
        assert_eq!(Feedback::thumbs("u1", "m1", true).rating, Some(5));
        assert_eq!(Feedback::thumbs("u1", "m1", false).rating, Some(1));
    }

    #[test]
    fn out_of_range_rating_is_rejected() {
        assert!(Feedback::rating("u1", "m1", 0).validate().is_err());
        assert!(Feedback::rating("u1", "m1", 6).validate().is_err());
        assert!(Feedback::rating("u1", "m1", 3).validate().is_ok());
        assert!(Feedback::comment("u1", "m1", "nice").validate().is_ok());
    }

    #[test]
    fn feedback_type_names_parse_back() {
        for t in [FeedbackType::Rating, FeedbackType::ThumbsUpDown, FeedbackType::Comment] {
            assert_eq!(t.as_str().parse::<FeedbackType>().unwrap(), t);
        }
        assert!("stars".parse::<FeedbackType>().is_err());
    }
}
