// src/markov/mod.rs
// Persisted bigram model backing tarpit text generation. Two tables:
// words(id, word) with ID 1 reserved for the empty token, and
// sequences(p1, p2, next_id, freq). The store is populated offline by the
// corpus trainer and opened read-only at runtime; the generator samples
// successors weighted by stored frequency.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OpenFlags, OptionalExtension};

use crate::error::{Error, Result};

/// Interned ID of the empty token. Chains start from, and restart at,
/// the (empty, empty) bigram.
pub const EMPTY_TOKEN_ID: i64 = 1;

/// Rows considered per successor lookup; matches the trainer's pruning.
pub const SUCCESSOR_LIMIT: usize = 20;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS words (
    id   INTEGER PRIMARY KEY,
    word TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS sequences (
    p1      INTEGER NOT NULL,
    p2      INTEGER NOT NULL,
    next_id INTEGER NOT NULL,
    freq    INTEGER NOT NULL DEFAULT 1,
    UNIQUE (p1, p2, next_id)
);
CREATE INDEX IF NOT EXISTS idx_sequences_bigram ON sequences (p1, p2);
INSERT OR IGNORE INTO words (id, word) VALUES (1, '');
";

/// A weighted successor candidate for a bigram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Successor {
    pub word: String,
    pub id: i64,
    pub freq: u32,
}

#[derive(Debug)]
pub struct MarkovStore {
    conn: Mutex<Connection>,
}

impl MarkovStore {
    /// Opens an existing model read-only. Fails when the file is missing or
    /// lacks the expected schema, which is a startup error when a model path
    /// is configured.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::Markov(format!(
                "markov store not found at {}",
                path.display()
            )));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let store = MarkovStore {
            conn: Mutex::new(conn),
        };
        store.verify_schema()?;
        Ok(store)
    }

    /// Fresh in-memory store with the schema installed. Used by tests and by
    /// the offline trainer's bootstrap path.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(MarkovStore {
            conn: Mutex::new(conn),
        })
    }

    fn verify_schema(&self) -> Result<()> {
        let conn = self.lock();
        let check = |table: &str| -> Result<()> {
            let found: Option<String> = conn
                .query_row(
                    "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .optional()?;
            if found.is_none() {
                return Err(Error::Markov(format!("missing table '{}'", table)));
            }
            Ok(())
        };
        check("words")?;
        check("sequences")
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Interned ID for a word; the empty-token ID when unknown, mirroring
    /// the trainer's convention.
    pub fn word_id(&self, word: &str) -> Result<i64> {
        if word.is_empty() {
            return Ok(EMPTY_TOKEN_ID);
        }
        let conn = self.lock();
        let id: Option<i64> = conn
            .query_row("SELECT id FROM words WHERE word = ?1", [word], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(id.unwrap_or(EMPTY_TOKEN_ID))
    }

    /// Successor candidates for a bigram, highest frequency first. An empty
    /// result means the chain hit a dead end and must restart.
    pub fn successors(&self, p1: i64, p2: i64) -> Result<Vec<Successor>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT w.word, w.id, s.freq
             FROM sequences s
             JOIN words w ON w.id = s.next_id
             WHERE s.p1 = ?1 AND s.p2 = ?2
             ORDER BY s.freq DESC, w.id ASC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![p1, p2, SUCCESSOR_LIMIT as i64],
            |row| {
                Ok(Successor {
                    word: row.get(0)?,
                    id: row.get(1)?,
                    freq: row.get::<_, i64>(2)?.max(0) as u32,
                })
            },
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Inserts a word, returning its ID. Used by tests and the offline
    /// bootstrap; runtime connections are read-only.
    pub fn insert_word(&self, word: &str) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO words (word) VALUES (?1)",
            [word],
        )?;
        let id: i64 = conn.query_row("SELECT id FROM words WHERE word = ?1", [word], |row| {
            row.get(0)
        })?;
        Ok(id)
    }

    /// Records (or reinforces) a bigram transition.
    pub fn insert_sequence(&self, p1: i64, p2: i64, next_id: i64, freq: u32) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO sequences (p1, p2, next_id, freq) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (p1, p2, next_id) DO UPDATE SET freq = freq + excluded.freq",
            rusqlite::params![p1, p2, next_id, freq as i64],
        )?;
        Ok(())
    }

    /// Feeds a whitespace-tokenized corpus line into the model. Sentences
    /// are chained from the (empty, empty) bigram and terminated back into
    /// the empty token.
    pub fn train_line(&self, line: &str) -> Result<()> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            return Ok(());
        }
        let mut p1 = EMPTY_TOKEN_ID;
        let mut p2 = EMPTY_TOKEN_ID;
        for token in &tokens {
            let id = self.insert_word(token)?;
            self.insert_sequence(p1, p2, id, 1)?;
            p1 = p2;
            p2 = id;
        }
        self.insert_sequence(p1, p2, EMPTY_TOKEN_ID, 1)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_store() -> MarkovStore {
        let store = MarkovStore::open_in_memory().unwrap();
        store
            .train_line("the archive holds the records of the archive")
            .unwrap();
        store.train_line("the archive holds nothing today.").unwrap();
        store
    }

    #[test]
    fn empty_token_id_is_reserved() {
        let store = MarkovStore::open_in_memory().unwrap();
        assert_eq!(store.word_id("").unwrap(), EMPTY_TOKEN_ID);
        assert_eq!(store.word_id("unseen-word").unwrap(), EMPTY_TOKEN_ID);
    }

    #[test]
    fn chain_starts_from_empty_bigram() {
        let store = seeded_store();
        let successors = store
            .successors(EMPTY_TOKEN_ID, EMPTY_TOKEN_ID)
            .unwrap();
        assert!(!successors.is_empty());
        assert!(successors.iter().all(|s| s.word == "the"));
    }

    #[test]
    fn successors_are_frequency_ordered() {
        let store = seeded_store();
        let the = store.word_id("the").unwrap();
        let archive = store.word_id("archive").unwrap();
        let successors = store.successors(the, archive).unwrap();
        assert_eq!(successors.first().unwrap().word, "holds");
        assert!(successors.windows(2).all(|w| w[0].freq >= w[1].freq));
    }

    #[test]
    fn dead_end_returns_empty() {
        let store = seeded_store();
        let today = store.word_id("today.").unwrap();
        // "today." is terminal: its only successor is the empty token; the
        // bigram (today., <unknown>) has none.
        let successors = store.successors(today, 999_999).unwrap();
        assert!(successors.is_empty());
    }

    #[test]
    fn reinforcement_accumulates_frequency() {
        let store = MarkovStore::open_in_memory().unwrap();
        let a = store.insert_word("alpha").unwrap();
        let b = store.insert_word("beta").unwrap();
        store.insert_sequence(EMPTY_TOKEN_ID, a, b, 1).unwrap();
        store.insert_sequence(EMPTY_TOKEN_ID, a, b, 4).unwrap();
        let successors = store.successors(EMPTY_TOKEN_ID, a).unwrap();
        assert_eq!(successors.len(), 1);
        assert_eq!(successors[0].freq, 5);
    }

    #[test]
    fn missing_file_is_a_startup_error() {
        let err = MarkovStore::open(std::path::Path::new("/nonexistent/markov.db")).unwrap_err();
        assert!(matches!(err, Error::Markov(_)));
    }
}
