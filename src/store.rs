//! Chunk store for inbound sessions
//!
//! Holds the announced metadata of every input session and the fragments
//! received so far, keyed by `(session, position)`. A second write to the
//! same position replaces the first.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS input_sessions (
    session TEXT PRIMARY KEY NOT NULL,
    handle TEXT NOT NULL,
    expected INTEGER NOT NULL CHECK(expected >= 0)
);

CREATE TABLE IF NOT EXISTS input_fragments (
    session TEXT NOT NULL,
    pos INTEGER NOT NULL CHECK(pos >= 0),
    data TEXT NOT NULL,
    PRIMARY KEY (session, pos)
);
"#;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Announced metadata of one inbound transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSession {
    pub session_id: String,
    pub handle: String,
    pub expected_fragments: u32,
}

/// Ordered fragment storage for input sessions
pub trait ChunkStore: Send {
    /// Create or replace the metadata of a session
    fn begin_input_session(&mut self, session_id: &str, handle: &str, expected: u32) -> Result<()>;

    /// Store a fragment; rewriting a position replaces its data
    fn put_fragment(&mut self, session_id: &str, position: u32, data: &str) -> Result<()>;

    fn session(&mut self, session_id: &str) -> Result<Option<InputSession>>;

    fn count_distinct_positions(&mut self, session_id: &str) -> Result<u32>;

    /// Fragment data sorted by ascending position
    fn assemble_ordered(&mut self, session_id: &str) -> Result<Vec<String>>;

    /// Drop the metadata and every fragment of a session
    fn delete_session(&mut self, session_id: &str) -> Result<()>;
}

/// SQLite-backed store that survives restarts
pub struct SqliteChunkStore {
    conn: Connection,
}

impl SqliteChunkStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        configure_pragmas(&conn);
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }
}

fn configure_pragmas(db: &Connection) {
    let _ = db.busy_timeout(Duration::from_millis(5000));
    let _ = db.execute_batch(
        "PRAGMA journal_mode=WAL;\n\
         PRAGMA synchronous=NORMAL;\n\
         PRAGMA temp_store=MEMORY;",
    );
}

impl ChunkStore for SqliteChunkStore {
    fn begin_input_session(&mut self, session_id: &str, handle: &str, expected: u32) -> Result<()> {
        self.conn.execute(
            "INSERT INTO input_sessions (session, handle, expected) VALUES (?1, ?2, ?3)
             ON CONFLICT(session) DO UPDATE SET handle = excluded.handle, expected = excluded.expected",
            params![session_id, handle, expected],
        )?;
        Ok(())
    }

    fn put_fragment(&mut self, session_id: &str, position: u32, data: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO input_fragments (session, pos, data) VALUES (?1, ?2, ?3)
             ON CONFLICT(session, pos) DO UPDATE SET data = excluded.data",
            params![session_id, position, data],
        )?;
        Ok(())
    }

    fn session(&mut self, session_id: &str) -> Result<Option<InputSession>> {
        let row = self
            .conn
            .query_row(
                "SELECT handle, expected FROM input_sessions WHERE session = ?1",
                params![session_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)),
            )
            .optional()?;

        Ok(row.map(|(handle, expected_fragments)| InputSession {
            session_id: session_id.to_string(),
            handle,
            expected_fragments,
        }))
    }

    fn count_distinct_positions(&mut self, session_id: &str) -> Result<u32> {
        let count = self.conn.query_row(
            "SELECT COUNT(DISTINCT pos) FROM input_fragments WHERE session = ?1",
            params![session_id],
            |row| row.get::<_, u32>(0),
        )?;
        Ok(count)
    }

    fn assemble_ordered(&mut self, session_id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT data FROM input_fragments WHERE session = ?1 ORDER BY pos ASC")?;
        let rows = stmt.query_map(params![session_id], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for data in rows {
            out.push(data?);
        }
        Ok(out)
    }

    fn delete_session(&mut self, session_id: &str) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM input_fragments WHERE session = ?1",
            params![session_id],
        )?;
        tx.execute(
            "DELETE FROM input_sessions WHERE session = ?1",
            params![session_id],
        )?;
        tx.commit()?;
        Ok(())
    }
}

/// Volatile store, lost on restart
#[derive(Debug, Default)]
pub struct MemoryChunkStore {
    sessions: HashMap<String, InputSession>,
    fragments: HashMap<String, BTreeMap<u32, String>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChunkStore for MemoryChunkStore {
    fn begin_input_session(&mut self, session_id: &str, handle: &str, expected: u32) -> Result<()> {
        self.sessions.insert(
            session_id.to_string(),
            InputSession {
                session_id: session_id.to_string(),
                handle: handle.to_string(),
                expected_fragments: expected,
            },
        );
        Ok(())
    }

    fn put_fragment(&mut self, session_id: &str, position: u32, data: &str) -> Result<()> {
        self.fragments
            .entry(session_id.to_string())
            .or_default()
            .insert(position, data.to_string());
        Ok(())
    }

    fn session(&mut self, session_id: &str) -> Result<Option<InputSession>> {
        Ok(self.sessions.get(session_id).cloned())
    }

    fn count_distinct_positions(&mut self, session_id: &str) -> Result<u32> {
        Ok(self
            .fragments
            .get(session_id)
            .map_or(0, |frags| frags.len() as u32))
    }

    fn assemble_ordered(&mut self, session_id: &str) -> Result<Vec<String>> {
        Ok(self
            .fragments
            .get(session_id)
            .map(|frags| frags.values().cloned().collect())
            .unwrap_or_default())
    }

    fn delete_session(&mut self, session_id: &str) -> Result<()> {
        self.sessions.remove(session_id);
        self.fragments.remove(session_id);
        Ok(())
    }
}
