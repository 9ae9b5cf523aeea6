//! Schema creation and in-place upgrades of older databases

use rusqlite::{Connection, Transaction};
use tracing::{error, info};

use crate::error::{Error, Result};

/// Version written to `PRAGMA user_version` once the schema is current
pub const SCHEMA_VERSION: i32 = 3;

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Created after the column upgrades, since older tables may lack indexed columns
const INDEX_SQL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_memory_items_type ON memory_items(type);
CREATE INDEX IF NOT EXISTS idx_memory_items_created_at ON memory_items(created_at);
CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations(user_id);
CREATE INDEX IF NOT EXISTS idx_turns_conversation ON conversation_turns(conversation_id, turn_index);
CREATE INDEX IF NOT EXISTS idx_feedback_message ON feedback(message_id);
CREATE INDEX IF NOT EXISTS idx_feedback_user ON feedback(user_id);
"#;

/// Columns that stores written before entity tracking do not have
const ADDED_COLUMNS: &[(&str, &str, &str)] = &[
    ("memory_items", "entities", "TEXT DEFAULT '[]'"),
    ("memory_items", "relationships", "TEXT DEFAULT '[]'"),
    ("conversation_turns", "turn_index", "INTEGER"),
    ("conversation_turns", "metadata", "TEXT"),
    ("conversation_turns", "entities", "TEXT DEFAULT '[]'"),
    ("conversation_turns", "relationships", "TEXT DEFAULT '[]'"),
    ("feedback", "message_id", "TEXT"),
    ("feedback", "feedback_type", "TEXT DEFAULT 'rating'"),
    ("feedback", "metadata", "TEXT"),
];

/// Manages database schema migrations
pub struct MigrationManager<'a> {
    conn: &'a mut Connection,
}

impl<'a> MigrationManager<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    /// Bring the database to `SCHEMA_VERSION`.
    ///
    /// Everything runs in one transaction; rows are never dropped. Any
    /// failure is reported as `Error::Migration`.
    pub fn initialize_database(&mut self) -> Result<()> {
        let current = self.current_version()?;
        info!("Current memory schema version: {}", current);

        if current > SCHEMA_VERSION {
            return Err(Error::migration(format!(
                "database schema version {} is newer than supported version {}",
                current, SCHEMA_VERSION
            )));
        }

        let tx = self
            .conn
            .transaction()
            .map_err(|e| Error::migration(e.to_string()))?;

        if let Err(e) = apply(&tx) {
            error!("Failed to migrate memory schema: {}", e);
            return Err(Error::migration(e.to_string()));
        }

        tx.commit().map_err(|e| Error::migration(e.to_string()))?;

        if current < SCHEMA_VERSION {
            info!("Memory schema migrated from version {} to {}", current, SCHEMA_VERSION);
        }
        Ok(())
    }

    /// Version recorded in `PRAGMA user_version` (0 for a new or legacy file)
    pub fn current_version(&self) -> Result<i32> {
        self.conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .map_err(|e| Error::migration(e.to_string()))
    }
}

fn apply(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(SCHEMA_SQL)?;

    for (table, column, decl) in ADDED_COLUMNS {
        if !has_column(tx, table, column)? {
            info!("Adding column {}.{}", table, column);
            tx.execute(
                &format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl),
                [],
            )?;
        }
    }

    tx.execute_batch(INDEX_SQL)?;
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}

/// Whether `table` has a column named `column`
pub fn has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEGACY_SCHEMA: &str = r#"
        CREATE TABLE memory_items (
            id TEXT PRIMARY KEY,
            type TEXT NOT NULL,
            content TEXT NOT NULL,
            metadata TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            embedding BLOB
        );
        INSERT INTO memory_items (id, type, content, metadata, created_at, updated_at)
        VALUES ('legacy-1', 'knowledge', '{"fact":"likes tea"}', NULL,
                '2024-01-01T12:00:00.000000', '2024-01-01T12:00:00.000000');
    "#;

    #[test]
    fn fresh_database_gets_current_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        MigrationManager::new(&mut conn).initialize_database().unwrap();

        let manager = MigrationManager::new(&mut conn);
        assert_eq!(manager.current_version().unwrap(), SCHEMA_VERSION);
        assert!(has_column(&conn, "memory_items", "entities").unwrap());
    }

    #[test]
    fn legacy_table_gains_columns_and_keeps_rows() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(LEGACY_SCHEMA).unwrap();
        assert!(!has_column(&conn, "memory_items", "relationships").unwrap());

        MigrationManager::new(&mut conn).initialize_database().unwrap();

        assert!(has_column(&conn, "memory_items", "entities").unwrap());
        assert!(has_column(&conn, "memory_items", "relationships").unwrap());
        let (count, entities): (i64, String) = conn
            .query_row(
                "SELECT COUNT(*), MAX(entities) FROM memory_items",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(entities, "[]");
    }

    #[test]
    fn legacy_feedback_table_gains_columns() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE feedback (
                id TEXT PRIMARY KEY,
                conversation_id TEXT,
                turn_index INTEGER,
                user_id TEXT,
                rating INTEGER,
                comment TEXT,
                timestamp TEXT
            );
            INSERT INTO feedback (id, user_id, rating) VALUES ('f1', 'u1', 4);
            "#,
        )
        .unwrap();

        MigrationManager::new(&mut conn).initialize_database().unwrap();

        assert!(has_column(&conn, "feedback", "message_id").unwrap());
        let kind: String = conn
            .query_row("SELECT feedback_type FROM feedback WHERE id = 'f1'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(kind, "rating");
    }

    #[test]
    fn migration_is_repeatable() {
        let mut conn = Connection::open_in_memory().unwrap();
        MigrationManager::new(&mut conn).initialize_database().unwrap();
        MigrationManager::new(&mut conn).initialize_database().unwrap();
    }

    #[test]
    fn newer_schema_is_refused() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1).unwrap();
        let err = MigrationManager::new(&mut conn).initialize_database().unwrap_err();
        assert!(matches!(err, Error::Migration(_)));
    }
}
