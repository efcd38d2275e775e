//! The note store interface and its SQLite-backed collection.
//!
//! [`NoteStore`] is everything the reconciler needs from a storage engine.
//! [`Collection`] owns a collection file; [`Collection::begin`] opens the
//! single transaction a synchronization run works in, returned as a
//! [`CollectionTx`] which implements [`NoteStore`].

use crate::{
    CardId, DeckId, FlashmarkError, Model, NoteId, PersistedNote, Result, Storage,
    DEFAULT_LATEX_POST, DEFAULT_LATEX_PRE,
};
use rusqlite::{Connection, OptionalExtension, Transaction};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Name of the deck every new collection starts with.
pub const DEFAULT_DECK: &str = "Default";

const SAVEPOINT: &str = "note_block";

/// Operations the reconciler performs against a storage engine.
///
/// All methods run inside an already open transaction. `begin_block` /
/// `end_block` bracket the work for one note block so that a failed block
/// leaves no partial writes behind.
pub trait NoteStore {
    /// Looks up a model by exact name.
    fn find_model(&self, name: &str) -> Result<Option<Model>>;

    /// Looks up a deck by exact name.
    fn find_deck(&self, name: &str) -> Result<Option<DeckId>>;

    fn create_deck(&mut self, name: &str) -> Result<DeckId>;

    /// Inserts a note with its cards and returns the newly assigned note ID.
    fn create_note(
        &mut self,
        model: &Model,
        fields: &[String],
        tags: &BTreeSet<String>,
        deck: DeckId,
    ) -> Result<NoteId>;

    fn get_note(&self, id: NoteId) -> Result<Option<PersistedNote>>;

    /// Returns the note owning card `card_id`.
    fn note_for_card(&self, card_id: CardId) -> Result<Option<NoteId>>;

    /// Returns a note of `model` whose first field equals `first_field`.
    fn find_duplicate(&self, model: &Model, first_field: &str) -> Result<Option<NoteId>>;

    /// Replaces a note's field values and tag set.
    fn update_note(&mut self, id: NoteId, fields: &[String], tags: &BTreeSet<String>) -> Result<()>;

    /// Moves all cards of a note to `deck`.
    fn set_note_deck(&mut self, id: NoteId, deck: DeckId) -> Result<()>;

    /// Directory holding media files, including rendered LaTeX images.
    fn media_dir(&self) -> &Path;

    fn begin_block(&mut self) -> Result<()>;

    /// Keeps (`keep == true`) or discards the writes made since `begin_block`.
    fn end_block(&mut self, keep: bool) -> Result<()>;
}

/// An open collection file.
pub struct Collection {
    storage: Storage,
    media_dir: PathBuf,
}

impl Collection {
    /// Creates a new collection at `path` seeded with the stock models and the
    /// default deck.
    ///
    /// # Errors
    ///
    /// Returns [`FlashmarkError::Database`] for any SQLite failure.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut storage = Storage::create(&path)?;
        {
            let tx = storage.connection_mut().transaction()?;
            for (name, fields, card_templates) in [
                ("Basic", &["Front", "Back"][..], 1),
                ("Basic (and reversed card)", &["Front", "Back"][..], 2),
                ("Cloze", &["Text", "Back Extra"][..], 1),
            ] {
                insert_model(&tx, name, fields, card_templates)?;
            }
            tx.execute("INSERT OR IGNORE INTO decks (name) VALUES (?)", [DEFAULT_DECK])?;
            tx.commit()?;
        }
        log::info!("created collection {}", path.as_ref().display());
        Ok(Self {
            storage,
            media_dir: media_dir_for(path.as_ref()),
        })
    }

    /// Opens an existing collection.
    ///
    /// # Errors
    ///
    /// Returns [`FlashmarkError::StoreUnavailable`] if `path` is not a collection.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let storage = Storage::open(&path)?;
        Ok(Self {
            storage,
            media_dir: media_dir_for(path.as_ref()),
        })
    }

    /// Returns the underlying SQLite connection.
    pub fn connection(&self) -> &Connection {
        self.storage.connection()
    }

    pub fn media_dir(&self) -> &Path {
        &self.media_dir
    }

    /// Opens the transaction a synchronization run works in.
    pub fn begin(&mut self) -> Result<CollectionTx<'_>> {
        let media_dir = self.media_dir.as_path();
        let tx = self.storage.connection_mut().transaction()?;
        Ok(CollectionTx { tx, media_dir })
    }

    /// Adds a model with the given ordered field names.
    ///
    /// # Errors
    ///
    /// Returns [`FlashmarkError::Database`] if a model with that name exists.
    pub fn add_model(&mut self, name: &str, fields: &[&str]) -> Result<Model> {
        let tx = self.storage.connection_mut().transaction()?;
        let model = insert_model(&tx, name, fields, 1)?;
        tx.commit()?;
        Ok(model)
    }

    /// Returns all models ordered by name.
    pub fn models(&self) -> Result<Vec<Model>> {
        let names = {
            let mut stmt = self.connection().prepare("SELECT name FROM models ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            names
        };
        let mut models = Vec::with_capacity(names.len());
        for name in names {
            if let Some(model) = load_model(self.connection(), &name)? {
                models.push(model);
            }
        }
        Ok(models)
    }

    pub fn model(&self, name: &str) -> Result<Option<Model>> {
        load_model(self.connection(), name)
    }

    pub fn get_note(&self, id: NoteId) -> Result<Option<PersistedNote>> {
        load_note(self.connection(), id)
    }

    pub fn note_count(&self) -> Result<usize> {
        let count: i64 = self
            .connection()
            .query_row("SELECT COUNT(*) FROM notes", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Returns every deck name, sorted.
    pub fn deck_names(&self) -> Result<Vec<String>> {
        let mut stmt = self.connection().prepare("SELECT name FROM decks ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }
}

/// The open transaction of one synchronization run.
///
/// Dropping it without calling [`commit`](Self::commit) rolls back.
pub struct CollectionTx<'c> {
    tx: Transaction<'c>,
    media_dir: &'c Path,
}

impl CollectionTx<'_> {
    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }

    pub fn rollback(self) -> Result<()> {
        self.tx.rollback()?;
        Ok(())
    }
}

impl NoteStore for CollectionTx<'_> {
    fn find_model(&self, name: &str) -> Result<Option<Model>> {
        load_model(&self.tx, name)
    }

    fn find_deck(&self, name: &str) -> Result<Option<DeckId>> {
        let id = self
            .tx
            .query_row("SELECT id FROM decks WHERE name = ?", [name], |row| row.get(0))
            .optional()?;
        Ok(id)
    }

    fn create_deck(&mut self, name: &str) -> Result<DeckId> {
        self.tx.execute("INSERT INTO decks (name) VALUES (?)", [name])?;
        log::info!("created deck '{name}'");
        Ok(self.tx.last_insert_rowid())
    }

    fn create_note(
        &mut self,
        model: &Model,
        fields: &[String],
        tags: &BTreeSet<String>,
        deck: DeckId,
    ) -> Result<NoteId> {
        let now = chrono::Utc::now();
        let id = next_id(&self.tx, "last_note_id", now.timestamp_millis())?;
        self.tx.execute(
            "INSERT INTO notes (id, model_id, fields_json, sort_field, modified)
             VALUES (?, ?, ?, ?, ?)",
            rusqlite::params![
                id,
                model.id,
                serde_json::to_string(fields)?,
                fields.first().map(String::as_str).unwrap_or_default(),
                now.timestamp(),
            ],
        )?;
        write_tags(&self.tx, id, tags)?;
        for ord in 0..model.card_templates.max(1) {
            let card_id = next_id(&self.tx, "last_card_id", now.timestamp_millis())?;
            self.tx.execute(
                "INSERT INTO cards (id, note_id, deck_id, ord) VALUES (?, ?, ?, ?)",
                rusqlite::params![card_id, id, deck, ord as i64],
            )?;
        }
        Ok(id)
    }

    fn get_note(&self, id: NoteId) -> Result<Option<PersistedNote>> {
        load_note(&self.tx, id)
    }

    fn note_for_card(&self, card_id: CardId) -> Result<Option<NoteId>> {
        let id = self
            .tx
            .query_row("SELECT note_id FROM cards WHERE id = ?", [card_id], |row| row.get(0))
            .optional()?;
        Ok(id)
    }

    fn find_duplicate(&self, model: &Model, first_field: &str) -> Result<Option<NoteId>> {
        let id = self
            .tx
            .query_row(
                "SELECT id FROM notes WHERE model_id = ? AND sort_field = ? LIMIT 1",
                rusqlite::params![model.id, first_field],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    fn update_note(&mut self, id: NoteId, fields: &[String], tags: &BTreeSet<String>) -> Result<()> {
        let changed = self.tx.execute(
            "UPDATE notes SET fields_json = ?1, sort_field = ?2, modified = ?3 WHERE id = ?4",
            rusqlite::params![
                serde_json::to_string(fields)?,
                fields.first().map(String::as_str).unwrap_or_default(),
                chrono::Utc::now().timestamp(),
                id,
            ],
        )?;
        if changed == 0 {
            return Err(FlashmarkError::UnknownIdentifier(id));
        }
        self.tx.execute("DELETE FROM note_tags WHERE note_id = ?", [id])?;
        write_tags(&self.tx, id, tags)?;
        Ok(())
    }

    fn set_note_deck(&mut self, id: NoteId, deck: DeckId) -> Result<()> {
        self.tx.execute(
            "UPDATE cards SET deck_id = ? WHERE note_id = ?",
            rusqlite::params![deck, id],
        )?;
        Ok(())
    }

    fn media_dir(&self) -> &Path {
        self.media_dir
    }

    fn begin_block(&mut self) -> Result<()> {
        self.tx.execute_batch(&format!("SAVEPOINT {SAVEPOINT}"))?;
        Ok(())
    }

    fn end_block(&mut self, keep: bool) -> Result<()> {
        let sql = if keep {
            format!("RELEASE {SAVEPOINT}")
        } else {
            format!("ROLLBACK TO {SAVEPOINT}; RELEASE {SAVEPOINT}")
        };
        self.tx.execute_batch(&sql)?;
        Ok(())
    }
}

/// `collection.db` keeps its media next to it in `collection.media/`.
fn media_dir_for(path: &Path) -> PathBuf {
    path.with_extension("media")
}

/// Allocates an ID strictly greater than every ID handed out before.
///
/// IDs follow the wall clock in milliseconds, like the desktop application's,
/// but never repeat even when notes are deleted or the clock goes backwards.
fn next_id(conn: &Connection, key: &str, now_millis: i64) -> Result<i64> {
    let last: Option<String> = conn
        .query_row("SELECT value FROM collection_meta WHERE key = ?", [key], |row| row.get(0))
        .optional()?;
    let last = last.and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
    let id = now_millis.max(last + 1);
    conn.execute(
        "INSERT INTO collection_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        rusqlite::params![key, id.to_string()],
    )?;
    Ok(id)
}

fn write_tags(conn: &Connection, note_id: NoteId, tags: &BTreeSet<String>) -> Result<()> {
    for tag in tags {
        conn.execute(
            "INSERT OR IGNORE INTO note_tags (note_id, tag) VALUES (?, ?)",
            rusqlite::params![note_id, tag],
        )?;
    }
    Ok(())
}

fn insert_model(conn: &Connection, name: &str, fields: &[&str], card_templates: usize) -> Result<Model> {
    conn.execute(
        "INSERT INTO models (name, card_templates, latex_pre, latex_post, modified)
         VALUES (?, ?, ?, ?, ?)",
        rusqlite::params![
            name,
            card_templates as i64,
            DEFAULT_LATEX_PRE,
            DEFAULT_LATEX_POST,
            chrono::Utc::now().timestamp(),
        ],
    )?;
    let id = conn.last_insert_rowid();
    for (ord, field) in fields.iter().enumerate() {
        conn.execute(
            "INSERT INTO model_fields (model_id, ord, name) VALUES (?, ?, ?)",
            rusqlite::params![id, ord as i64, field],
        )?;
    }
    Ok(Model {
        id,
        name: name.to_string(),
        fields: fields.iter().map(|f| f.to_string()).collect(),
        card_templates,
        latex_pre: DEFAULT_LATEX_PRE.to_string(),
        latex_post: DEFAULT_LATEX_POST.to_string(),
    })
}

fn load_model(conn: &Connection, name: &str) -> Result<Option<Model>> {
    let row = conn
        .query_row(
            "SELECT id, card_templates, latex_pre, latex_post FROM models WHERE name = ?",
            [name],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;
    let Some((id, card_templates, latex_pre, latex_post)) = row else {
        return Ok(None);
    };

    let mut stmt = conn.prepare("SELECT name FROM model_fields WHERE model_id = ? ORDER BY ord")?;
    let fields = stmt
        .query_map([id], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(Some(Model {
        id,
        name: name.to_string(),
        fields,
        card_templates: card_templates as usize,
        latex_pre,
        latex_post,
    }))
}

fn load_note(conn: &Connection, id: NoteId) -> Result<Option<PersistedNote>> {
    let row = conn
        .query_row(
            "SELECT n.model_id, m.name, n.fields_json, n.modified,
                    (SELECT GROUP_CONCAT(tag, ' ') FROM note_tags WHERE note_id = n.id),
                    (SELECT d.name FROM cards c JOIN decks d ON d.id = c.deck_id
                      WHERE c.note_id = n.id ORDER BY c.ord LIMIT 1),
                    (SELECT COUNT(*) FROM cards WHERE note_id = n.id)
             FROM notes n
             JOIN models m ON m.id = n.model_id
             WHERE n.id = ?",
            [id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            },
        )
        .optional()?;
    let Some((model_id, model_name, fields_json, modified, tags, deck, card_count)) = row else {
        return Ok(None);
    };

    Ok(Some(PersistedNote {
        id,
        model_id,
        model_name,
        fields: serde_json::from_str(&fields_json)?,
        tags: tags
            .unwrap_or_default()
            .split(' ')
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect(),
        deck,
        card_count: card_count as usize,
        modified,
    }))
}
