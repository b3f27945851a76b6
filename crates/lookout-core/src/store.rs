//! Durable gallery storage.
//!
//! The gallery is persisted as one serialized identity list under a fixed key.
//! Two backends are provided: a JSON document on disk and a SQLite key-value
//! table.

use crate::types::Identity;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// Key the identity list is stored under.
pub const GALLERY_KEY: &str = "knownFaces";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("gallery store is corrupt: {0}")]
    Corrupt(String),
}

/// Key-value persistence for the identity list.
pub trait GalleryStore: Send + Sync {
    /// Read the stored list. `Ok(None)` means nothing has been stored yet.
    fn load(&self) -> Result<Option<Vec<Identity>>, StoreError>;

    /// Replace the stored list.
    fn save(&self, identities: &[Identity]) -> Result<(), StoreError>;

    /// Human-readable location, for logs.
    fn location(&self) -> String;
}

/// Load the gallery, recovering from a missing or unreadable store.
///
/// Entries that violate gallery invariants (blank name, no embeddings) are
/// dropped and duplicate names are merged.
pub fn load_or_empty(store: &dyn GalleryStore) -> Vec<Identity> {
    match store.load() {
        Ok(Some(identities)) => {
            let loaded = sanitize(identities);
            tracing::info!(
                location = %store.location(),
                identities = loaded.len(),
                "gallery loaded"
            );
            loaded
        }
        Ok(None) => {
            tracing::info!(location = %store.location(), "no stored gallery; starting empty");
            Vec::new()
        }
        Err(e) => {
            tracing::warn!(
                location = %store.location(),
                error = %e,
                "gallery store unreadable; starting with an empty gallery"
            );
            Vec::new()
        }
    }
}

fn sanitize(identities: Vec<Identity>) -> Vec<Identity> {
    let mut out: Vec<Identity> = Vec::with_capacity(identities.len());
    for mut identity in identities {
        identity.name = identity.name.trim().to_string();
        if identity.name.is_empty() || identity.embeddings.is_empty() {
            tracing::warn!(name = %identity.name, "dropping invalid stored identity");
            continue;
        }
        match out.iter_mut().find(|i| i.name == identity.name) {
            Some(existing) => existing.embeddings.append(&mut identity.embeddings),
            None => out.push(identity),
        }
    }
    out
}

#[derive(Serialize, Deserialize)]
struct GalleryDocument {
    #[serde(rename = "knownFaces")]
    known_faces: Vec<Identity>,
}

/// JSON document on disk: `{"knownFaces": [...]}`.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl GalleryStore for JsonFileStore {
    fn load(&self) -> Result<Option<Vec<Identity>>, StoreError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let doc: GalleryDocument = serde_json::from_str(&raw)
            .map_err(|e| StoreError::Corrupt(format!("{}: {e}", self.path.display())))?;
        Ok(Some(doc.known_faces))
    }

    fn save(&self, identities: &[Identity]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let doc = GalleryDocument {
            known_faces: identities.to_vec(),
        };
        let json = serde_json::to_string_pretty(&doc)?;

        // Write-then-rename so a crash never leaves a half-written gallery.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// SQLite key-value table `kv(key, value)`.
pub struct SqliteStore {
    conn: Mutex<rusqlite::Connection>,
    location: String,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = rusqlite::Connection::open(path)?;
        Self::init(conn, path.display().to_string())
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::init(rusqlite::Connection::open_in_memory()?, ":memory:".into())
    }

    fn init(conn: rusqlite::Connection, location: String) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            location,
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, rusqlite::Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl GalleryStore for SqliteStore {
    fn load(&self) -> Result<Option<Vec<Identity>>, StoreError> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT value FROM kv WHERE key = ?1",
                [GALLERY_KEY],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|raw| {
            serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt(format!("{GALLERY_KEY}: {e}")))
        })
        .transpose()
    }

    fn save(&self, identities: &[Identity]) -> Result<(), StoreError> {
        let json = serde_json::to_string(identities)?;
        self.conn().execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![GALLERY_KEY, json],
        )?;
        Ok(())
    }

    fn location(&self) -> String {
        self.location.clone()
    }
}

/// Volatile store holding the serialized list in memory.
#[derive(Default)]
pub struct MemoryStore {
    raw: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with raw serialized content (may be invalid).
    pub fn with_raw(raw: impl Into<String>) -> Self {
        Self {
            raw: Mutex::new(Some(raw.into())),
        }
    }
}

impl GalleryStore for MemoryStore {
    fn load(&self) -> Result<Option<Vec<Identity>>, StoreError> {
        let raw = self.raw.lock().unwrap_or_else(PoisonError::into_inner);
        raw.as_deref()
            .map(|raw| serde_json::from_str(raw).map_err(|e| StoreError::Corrupt(e.to_string())))
            .transpose()
    }

    fn save(&self, identities: &[Identity]) -> Result<(), StoreError> {
        let json = serde_json::to_string(identities)?;
        *self.raw.lock().unwrap_or_else(PoisonError::into_inner) = Some(json);
        Ok(())
    }

    fn location(&self) -> String {
        "memory".into()
    }
}
