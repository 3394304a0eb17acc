// Persisted token mirror in a SQLite key/value table

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::types::TokenPair;

/// Key holding the JSON-encoded token pair
const TOKENS_KEY: &str = "tally:session:tokens";

/// Write-through copy of the token pair for restart continuity
///
/// The in-memory pair in `TokenManager` is authoritative; this is only read
/// back by session bootstrap.
pub struct SqliteMirror {
    conn: Mutex<Connection>,
}

impl SqliteMirror {
    /// Open (or create) the mirror database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create session directory: {}", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;

        Self::from_connection(conn)
    }

    /// In-memory mirror, lost when dropped
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .context("Failed to create auth_kv table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A panic mid-statement leaves nothing half-written in SQLite
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Load the persisted pair, if any
    pub fn load(&self) -> Result<Option<TokenPair>> {
        let value: Option<String> = self
            .conn()
            .query_row(
                "SELECT value FROM auth_kv WHERE key = ?",
                [TOKENS_KEY],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to load token data from SQLite")?;

        value
            .map(|json| {
                serde_json::from_str(&json).context("Failed to parse token data from SQLite")
            })
            .transpose()
    }

    /// Replace the persisted pair
    pub fn save(&self, pair: &TokenPair) -> Result<()> {
        let json = serde_json::to_string(pair).context("Failed to serialize token data")?;

        self.conn()
            .execute(
                "INSERT INTO auth_kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                [TOKENS_KEY, json.as_str()],
            )
            .context("Failed to save token data to SQLite")?;

        Ok(())
    }

    /// Remove the persisted pair
    pub fn remove(&self) -> Result<()> {
        self.conn()
            .execute("DELETE FROM auth_kv WHERE key = ?", [TOKENS_KEY])
            .context("Failed to delete token data from SQLite")?;

        Ok(())
    }
}
