//! SQLite connection management for collection files.

use crate::{FlashmarkError, Result};
use rusqlite::{Connection, OpenFlags};
use std::path::Path;

const TABLE_CHECK_SQL: &str = "SELECT COUNT(*) FROM sqlite_master
     WHERE type='table'
     AND name IN ('collection_meta', 'models', 'model_fields', 'decks', 'notes', 'note_tags', 'cards')";
const REQUIRED_TABLE_COUNT: i64 = 7;

pub struct Storage {
    conn: Connection,
}

impl Storage {
    /// Creates (or upgrades) the collection schema at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(Self { conn })
    }

    /// Opens an existing collection file.
    ///
    /// # Errors
    ///
    /// Returns [`FlashmarkError::StoreUnavailable`] if the file does not exist,
    /// is not a SQLite database, or lacks the collection tables.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let unavailable = |e: rusqlite::Error| {
            FlashmarkError::StoreUnavailable(format!("{}: {e}", path.display()))
        };

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(unavailable)?;

        // Validate database structure
        let table_count: i64 = conn
            .query_row(TABLE_CHECK_SQL, [], |row| row.get(0))
            .map_err(unavailable)?;

        if table_count != REQUIRED_TABLE_COUNT {
            return Err(FlashmarkError::StoreUnavailable(format!(
                "{} is not a Flashmark collection",
                path.display()
            )));
        }

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}
