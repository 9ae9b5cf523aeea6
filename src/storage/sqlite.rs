//! SQLite storage for memory items and conversations

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::feedback::{Feedback, FeedbackStats, FeedbackType};
use crate::memory::{Entity, MemoryItem, MemoryType, Relationship};
use crate::message::{Conversation, ConversationTurn};

use super::migration::MigrationManager;

const ITEM_COLUMNS: &str =
    "id, type, content, metadata, entities, relationships, created_at, updated_at";

/// Summary counts over the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageStats {
    pub total_items: usize,
    pub by_type: BTreeMap<MemoryType, usize>,
    pub total_conversations: usize,
    pub total_turns: usize,
    pub schema_version: i32,
}

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteStorage {
    /// Open the store at the configured database path
    pub fn new(config: &Config) -> Result<Self> {
        config.ensure_dirs()?;
        Self::open(config.sqlite_path())
    }

    /// Open (creating and migrating as needed) the store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        let storage = Self::from_connection(conn, Some(path.to_path_buf()))?;
        info!("Opened memory store at {}", path.display());
        Ok(storage)
    }

    /// A private, throwaway store
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(mut conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        register_functions(&conn)?;
        MigrationManager::new(&mut conn).initialize_database()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Database file, if the store is file-backed
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Insert or fully replace a memory item, keyed by id
    pub fn save(&self, item: &MemoryItem) -> Result<String> {
        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;

        conn.execute(
            r#"
            INSERT INTO memory_items (
                id, type, content, metadata, entities, relationships, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                type = excluded.type,
                content = excluded.content,
                metadata = excluded.metadata,
                entities = excluded.entities,
                relationships = excluded.relationships,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at
            "#,
            params![
                item.id,
                item.memory_type.as_str(),
                serde_json::to_string(&item.content)?,
                serde_json::to_string(&item.metadata)?,
                serde_json::to_string(&item.entities)?,
                serde_json::to_string(&item.relationships)?,
                encode_time(&item.created_at),
                encode_time(&item.updated_at.max(item.created_at)),
            ],
        )?;

        debug!(id = %item.id, "saved memory item");
        Ok(item.id.clone())
    }

    /// Get a memory item by id
    pub fn retrieve(&self, id: &str) -> Result<Option<MemoryItem>> {
        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;

        let row = conn
            .query_row(
                &format!("SELECT {} FROM memory_items WHERE id = ?1", ITEM_COLUMNS),
                params![id],
                MemoryRow::from_row,
            )
            .optional()?;

        row.map(|row| row.into_item()).transpose()
    }

    /// Case-insensitive substring search over content and metadata, newest first
    pub fn search(
        &self,
        query: &str,
        memory_type: Option<MemoryType>,
        limit: usize,
    ) -> Result<Vec<MemoryItem>> {
        let query = query.trim();
        if limit == 0 || (query.is_empty() && memory_type.is_none()) {
            return Ok(Vec::new());
        }

        let mut sql = format!("SELECT {} FROM memory_items WHERE 1=1", ITEM_COLUMNS);
        let mut params_vec: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(t) = memory_type {
            sql.push_str(" AND type = ?");
            params_vec.push(Box::new(t.as_str()));
        }

        if !query.is_empty() {
            sql.push_str(
                " AND (unicode_lower(content) LIKE ? ESCAPE '\\' \
                 OR unicode_lower(COALESCE(metadata, '')) LIKE ? ESCAPE '\\')",
            );
            let pattern = format!("%{}%", escape_like(&query.to_lowercase()));
            params_vec.push(Box::new(pattern.clone()));
            params_vec.push(Box::new(pattern));
        }

        sql.push_str(" ORDER BY created_at DESC, rowid DESC LIMIT ?");
        params_vec.push(Box::new(clamp_limit(limit)));

        self.query_items(&sql, &params_vec)
    }

    /// Replace an existing item, keeping its stored `created_at`
    pub fn update(&self, item: &MemoryItem) -> Result<bool> {
        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;

        let changed = conn.execute(
            r#"
            UPDATE memory_items SET
                type = ?2,
                content = ?3,
                metadata = ?4,
                entities = ?5,
                relationships = ?6,
                updated_at = MAX(?7, created_at)
            WHERE id = ?1
            "#,
            params![
                item.id,
                item.memory_type.as_str(),
                serde_json::to_string(&item.content)?,
                serde_json::to_string(&item.metadata)?,
                serde_json::to_string(&item.entities)?,
                serde_json::to_string(&item.relationships)?,
                encode_time(&Utc::now()),
            ],
        )?;

        if changed == 0 {
            return Err(Error::not_found(format!("memory item {}", item.id)));
        }
        Ok(true)
    }

    /// Delete a memory item; `false` if it did not exist
    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;
        let deleted = conn.execute("DELETE FROM memory_items WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    /// Most recent items, newest first
    pub fn recent(&self, memory_type: Option<MemoryType>, limit: usize) -> Result<Vec<MemoryItem>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut sql = format!("SELECT {} FROM memory_items", ITEM_COLUMNS);
        let mut params_vec: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(t) = memory_type {
            sql.push_str(" WHERE type = ?");
            params_vec.push(Box::new(t.as_str()));
        }
        sql.push_str(" ORDER BY created_at DESC, rowid DESC LIMIT ?");
        params_vec.push(Box::new(clamp_limit(limit)));

        self.query_items(&sql, &params_vec)
    }

    /// Number of stored items, optionally of one type
    pub fn count(&self, memory_type: Option<MemoryType>) -> Result<usize> {
        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;
        let count: i64 = match memory_type {
            Some(t) => conn.query_row(
                "SELECT COUNT(*) FROM memory_items WHERE type = ?1",
                params![t.as_str()],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM memory_items", [], |row| row.get(0))?,
        };
        Ok(count as usize)
    }

    /// Ids of the oldest items, oldest first
    pub fn oldest_ids(&self, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;
        let mut stmt = conn.prepare(
            "SELECT id FROM memory_items ORDER BY created_at ASC, rowid ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![clamp_limit(limit)], |row| row.get::<_, String>(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Error::from)
    }

    pub fn stats(&self) -> Result<StorageStats> {
        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;

        let mut by_type = BTreeMap::new();
        let mut total_items = 0;
        {
            let mut stmt = conn.prepare("SELECT type, COUNT(*) FROM memory_items GROUP BY type")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (name, count) = row?;
                total_items += count as usize;
                match name.parse::<MemoryType>() {
                    Ok(t) => {
                        by_type.insert(t, count as usize);
                    }
                    Err(_) => warn!("Skipping unknown memory type in stats: {}", name),
                }
            }
        }

        let total_conversations: i64 =
            conn.query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))?;
        let total_turns: i64 =
            conn.query_row("SELECT COUNT(*) FROM conversation_turns", [], |row| row.get(0))?;
        let schema_version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        Ok(StorageStats {
            total_items,
            by_type,
            total_conversations: total_conversations as usize,
            total_turns: total_turns as usize,
            schema_version,
        })
    }

    /// Save a conversation header and replace its turns
    pub fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        let mut conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO conversations (id, user_id, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                updated_at = excluded.updated_at
            "#,
            params![
                conversation.id,
                conversation.user_id,
                encode_time(&conversation.created_at),
                encode_time(&conversation.updated_at.max(conversation.created_at)),
            ],
        )?;

        tx.execute(
            "DELETE FROM conversation_turns WHERE conversation_id = ?1",
            params![conversation.id],
        )?;

        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO conversation_turns (
                    conversation_id, turn_index, role, content, timestamp,
                    metadata, entities, relationships
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )?;
            for (index, turn) in conversation.turns.iter().enumerate() {
                stmt.execute(params![
                    conversation.id,
                    index as i64,
                    turn.role.to_string(),
                    turn.content,
                    encode_time(&turn.timestamp),
                    serde_json::to_string(&turn.metadata)?,
                    serde_json::to_string(&turn.entities)?,
                    serde_json::to_string(&turn.relationships)?,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Get a conversation with its turns in order
    pub fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;

        let header = conn
            .query_row(
                "SELECT id, user_id, created_at, updated_at FROM conversations WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, user_id, created_at, updated_at)) = header else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            r#"
            SELECT role, content, timestamp, metadata, entities, relationships
            FROM conversation_turns
            WHERE conversation_id = ?1
            ORDER BY COALESCE(turn_index, id) ASC, id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok(TurnRow {
                role: row.get(0)?,
                content: row.get(1)?,
                timestamp: row.get(2)?,
                metadata: row.get(3)?,
                entities: row.get(4)?,
                relationships: row.get(5)?,
            })
        })?;

        let mut turns = Vec::new();
        for row in rows {
            turns.push(row?.into_turn()?);
        }

        Ok(Some(Conversation {
            id,
            user_id,
            turns,
            created_at: decode_time(&created_at)?,
            updated_at: decode_time(&updated_at)?,
        }))
    }

    /// Insert or replace a feedback record, keyed by id
    pub fn save_feedback(&self, feedback: &Feedback) -> Result<String> {
        feedback.validate()?;
        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;

        conn.execute(
            r#"
            INSERT INTO feedback (
                id, conversation_id, turn_index, user_id, message_id,
                rating, feedback_type, comment, metadata, timestamp
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(id) DO UPDATE SET
                conversation_id = excluded.conversation_id,
                turn_index = excluded.turn_index,
                user_id = excluded.user_id,
                message_id = excluded.message_id,
                rating = excluded.rating,
                feedback_type = excluded.feedback_type,
                comment = excluded.comment,
                metadata = excluded.metadata,
                timestamp = excluded.timestamp
            "#,
            params![
                feedback.id,
                feedback.conversation_id,
                feedback.turn_index,
                feedback.user_id,
                feedback.message_id,
                feedback.rating,
                feedback.feedback_type.as_str(),
                feedback.comment,
                serde_json::to_string(&feedback.metadata)?,
                encode_time(&feedback.created_at),
            ],
        )?;

        debug!(id = %feedback.id, "saved feedback");
        Ok(feedback.id.clone())
    }

    /// Most recent feedback, optionally only for one rated message
    pub fn get_feedback(&self, message_id: Option<&str>, limit: usize) -> Result<Vec<Feedback>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;

        let mut sql = String::from(
            "SELECT id, conversation_id, turn_index, user_id, message_id, rating, \
             feedback_type, comment, metadata, timestamp FROM feedback",
        );
        let mut params_vec: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(message_id) = message_id {
            sql.push_str(" WHERE message_id = ?");
            params_vec.push(Box::new(message_id.to_string()));
        }
        sql.push_str(" ORDER BY timestamp DESC, rowid DESC LIMIT ?");
        params_vec.push(Box::new(clamp_limit(limit)));

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(params_refs.as_slice(), FeedbackRow::from_row)?;

        let mut feedback = Vec::new();
        for row in rows {
            let row = row?;
            let id = row.id.clone();
            match row.into_feedback() {
                Ok(f) => feedback.push(f),
                Err(e) => warn!(%id, error = %e, "skipping unreadable feedback"),
            }
        }
        Ok(feedback)
    }

    /// Rating counts and average, optionally for one user
    pub fn feedback_stats(&self, user_id: Option<&str>) -> Result<FeedbackStats> {
        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;

        let (total, average, positive, negative): (i64, Option<f64>, i64, i64) = conn.query_row(
            r#"
            SELECT
                COUNT(*),
                AVG(rating),
                COUNT(CASE WHEN rating >= 4 THEN 1 END),
                COUNT(CASE WHEN rating <= 2 THEN 1 END)
            FROM feedback
            WHERE ?1 IS NULL OR user_id = ?1
            "#,
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        Ok(FeedbackStats {
            total_feedback: total as usize,
            average_rating: average.map_or(0.0, |avg| (avg * 100.0).round() / 100.0),
            positive_feedback: positive as usize,
            negative_feedback: negative as usize,
        })
    }

    /// Run an item query; rows that cannot be decoded are logged and skipped
    fn query_items(&self, sql: &str, params_vec: &[Box<dyn ToSql>]) -> Result<Vec<MemoryItem>> {
        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;

        let mut stmt = conn.prepare(sql)?;
        let params_refs: Vec<&dyn ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(params_refs.as_slice(), MemoryRow::from_row)?;

        let mut items = Vec::new();
        for row in rows {
            let row = row?;
            let id = row.id.clone();
            match row.into_item() {
                Ok(item) => items.push(item),
                Err(e) => warn!(%id, error = %e, "skipping unreadable memory item"),
            }
        }
        Ok(items)
    }
}

/// SQLite's own `lower()` only folds ASCII; search needs the same folding
/// as `str::to_lowercase` on both sides of `LIKE`
fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "unicode_lower",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let text = ctx.get::<Option<String>>(0)?;
            Ok(text.map(|t| t.to_lowercase()))
        },
    )
}

/// Fixed-width UTC timestamp, so text order equals time order
pub(crate) fn encode_time(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a stored timestamp; naive ISO-8601 values are taken as UTC
pub(crate) fn decode_time(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|naive| naive.and_utc())
        .map_err(|e| Error::storage(format!("Invalid timestamp {:?}: {}", s, e)))
}

fn escape_like(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len());
    for c in query.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn clamp_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn parse_list<T: serde::de::DeserializeOwned>(raw: Option<String>) -> Result<Vec<T>> {
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(Vec::new()),
        Some(s) => Ok(serde_json::from_str(s)?),
    }
}

fn parse_object(raw: Option<String>) -> Result<Map<String, Value>> {
    match raw.as_deref().map(str::trim) {
        None | Some("") | Some("null") => Ok(Map::new()),
        Some(s) => Ok(serde_json::from_str(s)?),
    }
}

/// Intermediate struct for reading from SQLite
struct MemoryRow {
    id: String,
    memory_type: String,
    content: String,
    metadata: Option<String>,
    entities: Option<String>,
    relationships: Option<String>,
    created_at: String,
    updated_at: String,
}

impl MemoryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            memory_type: row.get(1)?,
            content: row.get(2)?,
            metadata: row.get(3)?,
            entities: row.get(4)?,
            relationships: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_item(self) -> Result<MemoryItem> {
        let memory_type = self
            .memory_type
            .parse::<MemoryType>()
            .map_err(|_| Error::storage(format!("Unknown memory type: {}", self.memory_type)))?;

        let entities: Vec<Entity> = parse_list(self.entities)?;
        let relationships: Vec<Relationship> = parse_list(self.relationships)?;
        let created_at = decode_time(&self.created_at)?;
        let updated_at = decode_time(&self.updated_at)?.max(created_at);

        Ok(MemoryItem {
            id: self.id,
            memory_type,
            content: serde_json::from_str(&self.content)?,
            metadata: parse_object(self.metadata)?,
            entities,
            relationships,
            created_at,
            updated_at,
            embedding: None,
        })
    }
}

struct TurnRow {
    role: String,
    content: String,
    timestamp: String,
    metadata: Option<String>,
    entities: Option<String>,
    relationships: Option<String>,
}

impl TurnRow {
    fn into_turn(self) -> Result<ConversationTurn> {
        Ok(ConversationTurn {
            role: self.role.parse()?,
            content: self.content,
            timestamp: decode_time(&self.timestamp)?,
            metadata: parse_object(self.metadata)?,
            entities: parse_list(self.entities)?,
            relationships: parse_list(self.relationships)?,
        })
    }
}

struct FeedbackRow {
    id: String,
    conversation_id: Option<String>,
    turn_index: Option<i64>,
    user_id: Option<String>,
    message_id: Option<String>,
    rating: Option<i64>,
    feedback_type: Option<String>,
    comment: Option<String>,
    metadata: Option<String>,
    timestamp: Option<String>,
}

impl FeedbackRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            turn_index: row.get(2)?,
            user_id: row.get(3)?,
            message_id: row.get(4)?,
            rating: row.get(5)?,
            feedback_type: row.get(6)?,
            comment: row.get(7)?,
            metadata: row.get(8)?,
            timestamp: row.get(9)?,
        })
    }

    /// Rows written before feedback types existed count as ratings
    fn into_feedback(self) -> Result<Feedback> {
        let feedback_type = match self.feedback_type.as_deref() {
            None | Some("") => FeedbackType::Rating,
            Some(name) => name.parse()?,
        };
        let created_at = match self.timestamp.as_deref() {
            Some(ts) => decode_time(ts)?,
            None => DateTime::<Utc>::UNIX_EPOCH,
        };

        Ok(Feedback {
            id: self.id,
            user_id: self.user_id,
            conversation_id: self.conversation_id,
            message_id: self.message_id,
            turn_index: self.turn_index.and_then(|i| u32::try_from(i).ok()),
            rating: self.rating.and_then(|r| u8::try_from(r).ok()),
            feedback_type,
            comment: self.comment,
            metadata: parse_object(self.metadata)?,
            created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::EntityType;
    use crate::storage::SCHEMA_VERSION;
    use chrono::TimeZone;
    use serde_json::json;

    fn item_at(memory_type: MemoryType, content: Value, secs: i64) -> MemoryItem {
        MemoryItem::new(memory_type, content).created_at(Utc.timestamp_opt(secs, 0).unwrap())
    }

    #[test]
    fn save_and_retrieve_round_trip() {
        let storage = SqliteStorage::in_memory().unwrap();
        let paris = Entity::new("Paris", EntityType::Location);
        let alice = Entity::new("Alice", EntityType::Person);
        let item = MemoryItem::knowledge(json!({ "fact": "Alice lives in Paris" }))
            .with_metadata(json!({ "user_id": "u1" }))
            .with_entities(vec![alice.clone(), paris.clone()])
            .with_relationships(vec![Relationship::new(alice, "lives_in", paris, 0.9)]);

        let id = storage.save(&item).unwrap();
        assert_eq!(id, item.id);
        assert_eq!(storage.retrieve(&id).unwrap(), Some(item));
    }

    #[test]
    fn retrieve_missing_is_none() {
        let storage = SqliteStorage::in_memory().unwrap();
        assert!(storage.retrieve("nope").unwrap().is_none());
    }

    #[test]
    fn save_replaces_existing_row() {
        let storage = SqliteStorage::in_memory().unwrap();
        let mut item = MemoryItem::knowledge(json!({ "fact": "v1" }));
        storage.save(&item).unwrap();
        item.content = json!({ "fact": "v2" }).as_object().cloned().unwrap();
        storage.save(&item).unwrap();

        assert_eq!(storage.count(None).unwrap(), 1);
        let stored = storage.retrieve(&item.id).unwrap().unwrap();
        assert_eq!(stored.content["fact"], "v2");
    }

    #[test]
    fn search_matches_literal_wildcards() {
        let storage = SqliteStorage::in_memory().unwrap();
        storage
            .save(&MemoryItem::knowledge(json!({ "fact": "growth was 50% this year" })))
            .unwrap();
        storage
            .save(&MemoryItem::knowledge(json!({ "fact": "growth was 50 units" })))
            .unwrap();

        let hits = storage.search("50%", None, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(storage.search("w_s", None, 10).unwrap().is_empty());
    }

    #[test]
    fn search_orders_newest_first_and_respects_limit() {
        let storage = SqliteStorage::in_memory().unwrap();
        for secs in [100, 300, 200] {
            storage
                .save(&item_at(MemoryType::Task, json!({ "task": format!("task {}", secs) }), secs))
                .unwrap();
        }

        let hits = storage.search("TASK", Some(MemoryType::Task), 2).unwrap();
        let texts: Vec<_> = hits.iter().map(|i| i.content["task"].clone()).collect();
        assert_eq!(texts, vec![json!("task 300"), json!("task 200")]);
    }

    #[test]
    fn blank_query_depends_on_type_filter() {
        let storage = SqliteStorage::in_memory().unwrap();
        storage.save(&MemoryItem::knowledge(json!({ "fact": "x" }))).unwrap();

        assert!(storage.search("  ", None, 10).unwrap().is_empty());
        assert_eq!(storage.search("", Some(MemoryType::Knowledge), 10).unwrap().len(), 1);
    }

    #[test]
    fn update_preserves_created_at() {
        let storage = SqliteStorage::in_memory().unwrap();
        let item = item_at(MemoryType::Knowledge, json!({ "fact": "old" }), 1_000);
        storage.save(&item).unwrap();

        let mut changed = item.clone().created_at(Utc::now());
        changed.content = json!({ "fact": "new" }).as_object().cloned().unwrap();
        assert!(storage.update(&changed).unwrap());

        let stored = storage.retrieve(&item.id).unwrap().unwrap();
        assert_eq!(stored.created_at, item.created_at);
        assert!(stored.updated_at > item.created_at);
        assert_eq!(stored.content["fact"], "new");
    }

    #[test]
    fn update_missing_is_not_found() {
        let storage = SqliteStorage::in_memory().unwrap();
        let err = storage
            .update(&MemoryItem::knowledge(json!({ "fact": "x" })))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn oldest_ids_ascending() {
        let storage = SqliteStorage::in_memory().unwrap();
        let newer = item_at(MemoryType::Skill, json!({ "skill": "b" }), 20);
        let older = item_at(MemoryType::Skill, json!({ "skill": "a" }), 10);
        storage.save(&newer).unwrap();
        storage.save(&older).unwrap();

        assert_eq!(storage.oldest_ids(5).unwrap(), vec![older.id, newer.id]);
    }

    #[test]
    fn conversation_round_trip_keeps_turn_order() {
        let storage = SqliteStorage::in_memory().unwrap();
        let mut conversation = Conversation::new("u1");
        conversation.push(ConversationTurn::user("hello"));
        conversation.push(ConversationTurn::assistant("hi there"));
        storage.save_conversation(&conversation).unwrap();

        conversation.push(ConversationTurn::user("bye"));
        storage.save_conversation(&conversation).unwrap();

        let stored = storage.get_conversation(&conversation.id).unwrap().unwrap();
        let texts: Vec<_> = stored.turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(texts, vec!["hello", "hi there", "bye"]);

        let stats = storage.stats().unwrap();
        assert_eq!(stats.total_conversations, 1);
        assert_eq!(stats.total_turns, 3);
        assert_eq!(stats.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn naive_timestamps_are_read_as_utc() {
        let at = decode_time("2024-01-01T12:00:00.123456").unwrap();
        assert_eq!(encode_time(&at), "2024-01-01T12:00:00.123456000Z");
    }

    #[test]
    fn search_folds_non_ascii_case() {
        let storage = SqliteStorage::in_memory().unwrap();
        storage
            .save(&MemoryItem::knowledge(json!({ "fact": "Meeting at the ÉCOLE tomorrow" })))
            .unwrap();
        storage
            .save(&MemoryItem::knowledge(json!({ "fact": "Straße closed" })))
            .unwrap();

        assert_eq!(storage.search("école", None, 10).unwrap().len(), 1);
        assert_eq!(storage.search("ÉCOLE", None, 10).unwrap().len(), 1);
        assert_eq!(storage.search("École", None, 10).unwrap().len(), 1);
        assert_eq!(storage.search("STRASSE", None, 10).unwrap().len(), 0);
        assert_eq!(storage.search("STRAßE", None, 10).unwrap().len(), 1);
    }

    #[test]
    fn feedback_is_filtered_by_message_and_newest_first() {
        let storage = SqliteStorage::in_memory().unwrap();
        let mut older = Feedback::rating("u1", "m1", 5);
        older.created_at = Utc.timestamp_opt(1_000, 0).unwrap();
        let newer = Feedback::comment("u1", "m1", "too long")
            .with_conversation("c1", Some(3))
            .with_metadata(json!({ "source": "cli" }));
        storage.save_feedback(&older).unwrap();
        storage.save_feedback(&newer).unwrap();
        storage.save_feedback(&Feedback::thumbs("u2", "m2", false)).unwrap();

        let for_m1 = storage.get_feedback(Some("m1"), 10).unwrap();
        let ids: Vec<_> = for_m1.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec![newer.id.as_str(), older.id.as_str()]);
        assert_eq!(for_m1[0], newer);

        assert_eq!(storage.get_feedback(None, 10).unwrap().len(), 3);
        assert_eq!(storage.get_feedback(None, 1).unwrap().len(), 1);
        assert!(storage.get_feedback(None, 0).unwrap().is_empty());
    }

    #[test]
    fn feedback_stats_per_user() {
        let storage = SqliteStorage::in_memory().unwrap();
        assert_eq!(storage.feedback_stats(None).unwrap(), FeedbackStats::default());

        for rating in [5, 4, 1] {
            storage.save_feedback(&Feedback::rating("u1", "m1", rating)).unwrap();
        }
        storage.save_feedback(&Feedback::rating("u2", "m2", 3)).unwrap();
        storage.save_feedback(&Feedback::comment("u1", "m3", "no rating")).unwrap();

        let mine = storage.feedback_stats(Some("u1")).unwrap();
        assert_eq!(mine.total_feedback, 4);
        assert_eq!(mine.average_rating, 3.33);
        assert_eq!(mine.positive_feedback, 2);
        assert_eq!(mine.negative_feedback, 1);

        let all = storage.feedback_stats(None).unwrap();
        assert_eq!(all.total_feedback, 5);
        assert_eq!(all.average_rating, 3.25);
    }

    #[test]
    fn invalid_rating_is_not_stored() {
        let storage = SqliteStorage::in_memory().unwrap();
        let err = storage.save_feedback(&Feedback::rating("u1", "m1", 9)).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(storage.feedback_stats(None).unwrap().total_feedback, 0);
    }
}
