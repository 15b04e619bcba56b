// Handles SQLite database operations

use rusqlite::{params, Connection, OptionalExtension, Result};
use std::fs;
use std::path::Path;

use crate::errors::ChatError;
use crate::ollama_api::ChatMessage;

/// A stored chat message.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub conversation_id: i64,
    pub role: String,
    pub message: String,
    pub timestamp: String,
}

impl From<&HistoryEntry> for ChatMessage {
    fn from(entry: &HistoryEntry) -> Self {
        ChatMessage {
            role: entry.role.clone(),
            content: entry.message.clone(),
        }
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS chat_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id INTEGER NOT NULL,
            role TEXT NOT NULL,
            message TEXT NOT NULL,
            timestamp DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Opens (creating if needed) the database at `path`.
pub fn open_db(path: &Path) -> std::result::Result<Connection, ChatError> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(path)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Inserts or updates a configuration key-value pair.
pub fn update_config_value(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO app_config (key, value) VALUES (?1, ?2)",
        [key, value],
    )?;
    Ok(())
}

/// Retrieves a configuration value by key. Returns `None` if the key doesn't exist.
pub fn get_config_value(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        [key],
        |row| row.get(0),
    )
    .optional()
}

/// Id for a conversation that has no messages yet.
pub fn next_conversation_id(conn: &Connection) -> Result<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(conversation_id), 0) + 1 FROM chat_history",
        [],
        |row| row.get(0),
    )
}

pub fn save_chat_message(conn: &Connection, conversation_id: i64, role: &str, message: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO chat_history (conversation_id, role, message) VALUES (?1, ?2, ?3)",
        params![conversation_id, role, message],
    )?;
    Ok(())
}

/// Fetches the messages of a conversation, oldest first.
pub fn fetch_chat_history(conn: &Connection, conversation_id: i64) -> Result<Vec<HistoryEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, conversation_id, role, message, timestamp FROM chat_history
         WHERE conversation_id = ?1 ORDER BY id ASC",
    )?;

    let rows = stmt.query_map(params![conversation_id], |row| {
        Ok(HistoryEntry {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            role: row.get(2)?,
            message: row.get(3)?,
            timestamp: row.get(4)?,
        })
    })?;

    let messages = rows.collect::<Result<Vec<_>>>()?;
    Ok(messages)
}
