use agent_memory::memory::{Entity, EntityType, MemoryItem, MemoryType};
use agent_memory::storage::{AsyncSqliteStorage, SqliteStorage, SCHEMA_VERSION};
use agent_memory::message::{Conversation, ConversationTurn};
use rusqlite::Connection;
use serde_json::json;
use tempfile::tempdir;

#[test]
fn items_survive_reopening_the_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("memory.db");

    let item = MemoryItem::knowledge(json!({ "fact": "Ada lives in London" }))
        .with_metadata(json!({ "user_id": "u1" }))
        .with_entities(vec![
            Entity::new("Ada", EntityType::Person),
            Entity::new("London", EntityType::Location),
        ]);
    let id = {
        let storage = SqliteStorage::open(&path).unwrap();
        storage.save(&item).unwrap()
    };

    let storage = SqliteStorage::open(&path).unwrap();
    let loaded = storage.retrieve(&id).unwrap().expect("item should exist");
    assert_eq!(loaded.memory_type, MemoryType::Knowledge);
    assert_eq!(loaded.content, item.content);
    assert_eq!(loaded.metadata, item.metadata);
    assert_eq!(loaded.entities, item.entities);
    assert_eq!(loaded.created_at, item.created_at);
}

#[test]
fn legacy_database_is_upgraded_in_place() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("memory.db");

    {
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE memory_items (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE conversations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE conversation_turns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );
            INSERT INTO memory_items VALUES
                ('old-1', 'conversation', '{"role": "user", "content": "hello there"}', NULL,
                 '2024-01-05 10:00:00', '2024-01-05 10:00:00'),
                ('old-2', 'knowledge', '{"fact": "likes tea"}', '{"user_id": "u1"}',
                 '2024-01-06T09:30:00.123456', '2024-01-06T09:30:00.123456');
            "#,
        )
        .unwrap();
    }

    let storage = SqliteStorage::open(&path).unwrap();
    assert_eq!(storage.stats().unwrap().schema_version, SCHEMA_VERSION);
    assert_eq!(storage.count(None).unwrap(), 2);

    let old = storage.retrieve("old-1").unwrap().expect("legacy row kept");
    assert!(old.entities.is_empty());
    assert!(old.relationships.is_empty());
    assert!(old.metadata.is_empty());
    assert_eq!(old.created_at.to_rfc3339(), "2024-01-05T10:00:00+00:00");

    let fact = storage.retrieve("old-2").unwrap().expect("legacy row kept");
    assert_eq!(fact.metadata["user_id"], "u1");

    // New writes work against the upgraded tables
    let mut conversation = Conversation::new("u1");
    conversation.push(ConversationTurn::user("first"));
    conversation.push(ConversationTurn::assistant("second"));
    storage.save_conversation(&conversation).unwrap();
    let loaded = storage.get_conversation(&conversation.id).unwrap().unwrap();
    assert_eq!(loaded.turns.len(), 2);
    assert_eq!(loaded.turns[1].content, "second");
}

#[test]
fn type_filtered_search_is_case_insensitive() {
    let storage = SqliteStorage::in_memory().unwrap();
    storage
        .save(&MemoryItem::conversation(json!({ "content": "The WEATHER was grim" })))
        .unwrap();
    storage
        .save(&MemoryItem::knowledge(json!({ "fact": "weather in Bergen is wet" })))
        .unwrap();
    storage
        .save(&MemoryItem::conversation(json!({ "content": "nothing relevant" })))
        .unwrap();

    let results = storage.search("weather", Some(MemoryType::Conversation), 10).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].memory_type, MemoryType::Conversation);
    assert!(results[0].content_text().contains("WEATHER"));

    let all = storage.search("Weather", None, 10).unwrap();
    assert_eq!(all.len(), 2);
}

#[test]
fn delete_is_idempotent() {
    let storage = SqliteStorage::in_memory().unwrap();
    let id = storage
        .save(&MemoryItem::knowledge(json!({ "fact": "temporary" })))
        .unwrap();

    assert!(storage.delete(&id).unwrap());
    assert!(!storage.delete(&id).unwrap());
    assert!(storage.retrieve(&id).unwrap().is_none());
}

#[test]
fn updating_a_missing_item_is_not_found() {
    let storage = SqliteStorage::in_memory().unwrap();
    let item = MemoryItem::knowledge(json!({ "fact": "never saved" }));
    let err = storage.update(&item).unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn blocking_and_async_surfaces_agree() {
    let dir = tempdir().unwrap();
    let storage = AsyncSqliteStorage::open(dir.path().join("memory.db")).await.unwrap();

    let first = storage
        .save(MemoryItem::knowledge(json!({ "fact": "Oslo is cold" })))
        .await
        .unwrap();
    storage
        .save(MemoryItem::conversation(json!({ "content": "cold coffee again" })))
        .await
        .unwrap();

    let blocking = storage.blocking();
    let sync_hits = blocking.search("cold", None, 10).unwrap();
    let async_hits = storage.search("cold", None, 10).await.unwrap();
    let ids = |items: &[MemoryItem]| items.iter().map(|i| i.id.clone()).collect::<Vec<_>>();
    assert_eq!(ids(&sync_hits), ids(&async_hits));

    assert_eq!(
        blocking.retrieve(&first).unwrap().map(|i| i.content),
        storage.retrieve(&first).await.unwrap().map(|i| i.content)
    );
    assert_eq!(blocking.count(None).unwrap(), storage.count(None).await.unwrap());
}

#[test]
fn async_surface_can_be_driven_from_sync_code() {
    let saved = tokio_test::block_on(async {
        let storage = AsyncSqliteStorage::in_memory().await.unwrap();
        let id = storage
            .save(MemoryItem::knowledge(json!({ "fact": "block_on works" })))
            .await
            .unwrap();
        storage.retrieve(&id).await.unwrap()
    });
    assert_eq!(saved.unwrap().content["fact"], "block_on works");
}
