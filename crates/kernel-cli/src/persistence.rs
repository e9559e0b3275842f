//! SQLite event store. Mirrors the JSONL log for range queries and resume
//! checks; the kernel only ever appends.

use std::fmt;
use std::path::Path;

use contracts::{EventRecord, KernelConfig, KernelError};
use kernel_core::event_log::EventSink;
use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Serde(serde_json::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "sqlite error: {err}"),
            Self::Serde(err) => write!(f, "serde error: {err}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serde(value)
    }
}

#[derive(Debug)]
pub struct SqliteEventStore {
    conn: Connection,
}

impl SqliteEventStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let mut store = Self { conn };
        store.configure()?;
        store.migrate()?;
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let mut store = Self { conn };
        store.configure()?;
        store.migrate()?;
        Ok(store)
    }

    pub fn record_run(&mut self, config: &KernelConfig) -> Result<(), StoreError> {
        let config_json = serde_json::to_string(config)?;
        self.conn.execute(
            "INSERT INTO runs (seed, start_tick, config_json)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(seed) DO UPDATE SET
                start_tick = excluded.start_tick,
                config_json = excluded.config_json",
            params![
                config.seed.to_string(),
                config.clock.start_tick,
                config_json
            ],
        )?;
        Ok(())
    }

    pub fn append_record(&mut self, record: &EventRecord) -> Result<(), StoreError> {
        let payload_json = serde_json::to_string(record)?;
        let (record_type, character_id) = match record {
            EventRecord::Event(event) => ("event", Some(event.character_id.as_str())),
            EventRecord::TickAborted { .. } => ("tick_aborted", None),
        };
        self.conn.execute(
            "INSERT INTO events (tick, record_type, character_id, payload_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                i64::try_from(record.tick()).unwrap_or(i64::MAX),
                record_type,
                character_id,
                payload_json
            ],
        )?;
        Ok(())
    }

    pub fn last_tick(&self) -> Result<Option<u64>, StoreError> {
        let tick = self
            .conn
            .query_row("SELECT MAX(tick) FROM events", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .optional()?
            .flatten();
        Ok(tick.and_then(|value| u64::try_from(value).ok()))
    }

    pub fn load_events_range(
        &self,
        from_tick: u64,
        to_tick: u64,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT payload_json
             FROM events
             WHERE tick >= ?1 AND tick <= ?2
             ORDER BY tick ASC, id ASC",
        )?;
        let rows = stmt.query_map(
            params![
                i64::try_from(from_tick).unwrap_or(i64::MAX),
                i64::try_from(to_tick).unwrap_or(i64::MAX)
            ],
            |row| row.get::<_, String>(0),
        )?;

        let mut records = Vec::new();
        for row in rows {
            let payload = row?;
            records.push(serde_json::from_str::<EventRecord>(&payload)?);
        }
        Ok(records)
    }

    fn configure(&mut self) -> Result<(), StoreError> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(())
    }

    fn migrate(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS runs (
                seed TEXT PRIMARY KEY,
                start_tick INTEGER NOT NULL,
                config_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tick INTEGER NOT NULL,
                record_type TEXT NOT NULL,
                character_id TEXT,
                payload_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_tick ON events(tick);
            CREATE INDEX IF NOT EXISTS idx_events_character_tick
                ON events(character_id, tick);
            ",
        )?;
        Ok(())
    }
}

/// Fans every append out to the JSONL log and, when configured, the SQLite
/// mirror. A failure in either sink is fatal to the run.
pub struct CompositeSink {
    jsonl: Box<dyn EventSink>,
    sqlite: Option<SqliteEventStore>,
}

impl CompositeSink {
    pub fn new(jsonl: Box<dyn EventSink>, sqlite: Option<SqliteEventStore>) -> Self {
        Self { jsonl, sqlite }
    }
}

impl EventSink for CompositeSink {
    fn append(&mut self, record: &EventRecord) -> Result<(), KernelError> {
        self.jsonl.append(record)?;
        if let Some(store) = self.sqlite.as_mut() {
            store
                .append_record(record)
                .map_err(|err| KernelError::io(format!("sqlite append failed: {err}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::ErrorCode;

    #[test]
    fn appends_and_reads_back_in_tick_order() {
        let mut store = SqliteEventStore::open_in_memory().expect("store");
        store
            .append_record(&EventRecord::aborted(24, ErrorCode::RuleError, "first"))
            .expect("append");
        store
            .append_record(&EventRecord::aborted(48, ErrorCode::RuleError, "second"))
            .expect("append");

        assert_eq!(store.last_tick().expect("last"), Some(48));
        let records = store.load_events_range(0, 100).expect("range");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].tick(), 24);
        assert_eq!(records[1].tick(), 48);
    }

    #[test]
    fn range_filters_by_tick() {
        let mut store = SqliteEventStore::open_in_memory().expect("store");
        for tick in [10_u64, 20, 30] {
            store
                .append_record(&EventRecord::aborted(tick, ErrorCode::RuleError, "x"))
                .expect("append");
        }
        let records = store.load_events_range(15, 25).expect("range");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tick(), 20);
    }

    #[test]
    fn empty_store_has_no_last_tick() {
        let store = SqliteEventStore::open_in_memory().expect("store");
        assert_eq!(store.last_tick().expect("last"), None);
    }

    #[test]
    fn run_metadata_upserts_by_seed() {
        let mut store = SqliteEventStore::open_in_memory().expect("store");
        let config: KernelConfig = serde_json::from_value(serde_json::json!({
            "seed": 42,
            "llm": {
                "default_provider": "local",
                "providers": {"local": {"kind": "ollama", "model": "llama3"}}
            }
        }))
        .expect("config");
        store.record_run(&config).expect("record");
        store.record_run(&config).expect("record again");
    }
}
