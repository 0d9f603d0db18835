//! Durable revision ↔ build mapping.
//!
//! The store answers two questions: "which build did this revision
//! trigger?" (superseding) and "which revision does this build belong to?"
//! (webhook correlation). Entries are append-only: a cancelled or
//! superseded build's history stays queryable for audit and for webhooks
//! that arrive after the build stopped mattering.
//!
//! # Schema Versioning
//!
//! The SQLite implementation uses the `user_version` pragma to track the
//! schema version. When the schema changes, increment `SCHEMA_VERSION` and
//! extend `run_migrations`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tokio::sync::RwLock;

use gatebot_core::{BuildId, Revision};

/// Current schema version. Increment when making schema changes.
const SCHEMA_VERSION: i32 = 1;

/// Underlying-store fault. Absence of a mapping is never an error: lookups
/// report it as `Ok(None)` and callers branch on that as a normal outcome.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("database schema version {0} is newer than supported version {SCHEMA_VERSION}")]
    SchemaTooNew(i32),
}

/// Key-value contract over the revision ↔ build mapping.
#[async_trait]
pub trait MappingStore: Send + Sync {
    /// Record that `build` was triggered for `revision`.
    ///
    /// Both lookup directions become visible atomically; the store never
    /// holds one direction without the other. Re-recording a build id that
    /// is already present is a no-op (entries are append-only).
    async fn put(&self, revision: &Revision, build: &BuildId) -> Result<(), StoreError>;

    /// The revision a build was triggered for.
    async fn get_by_build(&self, build: &BuildId) -> Result<Option<Revision>, StoreError>;

    /// The most recent build triggered for `(patch, change)`.
    async fn get_by_revision(
        &self,
        patch_number: u64,
        change_number: u64,
    ) -> Result<Option<BuildId>, StoreError>;
}

/// SQLite-backed mapping store.
///
/// One row per build carries the full revision, so a single insert writes
/// both lookup directions, so a crash can never leave the store with one
/// direction and not the other. Revision lookups take the newest row, so a
/// re-triggered revision maps to its latest build while every build keeps
/// resolving to its revision.
///
/// `rusqlite::Connection` is not `Sync`; the connection sits behind a
/// `Mutex` and every call runs under `tokio::task::spawn_blocking`.
pub struct SqliteMappingStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMappingStore {
    /// Open or create the database file at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        let current_version: i32 =
            conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        if current_version > SCHEMA_VERSION {
            return Err(StoreError::SchemaTooNew(current_version));
        }

        if current_version < SCHEMA_VERSION {
            Self::run_migrations(conn, current_version)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }

        Ok(())
    }

    fn run_migrations(conn: &Connection, from_version: i32) -> Result<(), StoreError> {
        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS build_mappings (
                    build_id TEXT NOT NULL PRIMARY KEY,
                    patch_number INTEGER NOT NULL,
                    change_number INTEGER NOT NULL,
                    commit_sha TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_build_mappings_revision
                    ON build_mappings (change_number, patch_number);
                "#,
            )?;
        }
        Ok(())
    }
}

#[async_trait]
impl MappingStore for SqliteMappingStore {
    async fn put(&self, revision: &Revision, build: &BuildId) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let revision = revision.clone();
        let build = build.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            // INSERT OR IGNORE keeps the table append-only: a build id is
            // recorded at most once, and never rewritten.
            conn.execute(
                "INSERT OR IGNORE INTO build_mappings \
                 (build_id, patch_number, change_number, commit_sha) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    build.as_str(),
                    revision.patch_number,
                    revision.change_number,
                    revision.sha,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    async fn get_by_build(&self, build: &BuildId) -> Result<Option<Revision>, StoreError> {
        let conn = self.conn.clone();
        let build = build.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            let revision = conn
                .query_row(
                    "SELECT patch_number, change_number, commit_sha \
                     FROM build_mappings WHERE build_id = ?1",
                    params![build.as_str()],
                    |row| {
                        Ok(Revision::new(
                            row.get::<_, u64>(0)?,
                            row.get::<_, u64>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()?;
            Ok(revision)
        })
        .await?
    }

    async fn get_by_revision(
        &self,
        patch_number: u64,
        change_number: u64,
    ) -> Result<Option<BuildId>, StoreError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("mutex poisoned");
            let build = conn
                .query_row(
                    "SELECT build_id FROM build_mappings \
                     WHERE patch_number = ?1 AND change_number = ?2 \
                     ORDER BY rowid DESC LIMIT 1",
                    params![patch_number, change_number],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(build.map(BuildId::from))
        })
        .await?
    }
}

/// In-memory mapping store, used in tests and wherever a durable backend
/// is not required. Both direction maps are mutated under one write lock,
/// so the two directions can never diverge.
#[derive(Default)]
pub struct InMemoryMappingStore {
    inner: RwLock<MappingTables>,
}

#[derive(Default)]
struct MappingTables {
    by_build: HashMap<BuildId, Revision>,
    by_revision: HashMap<(u64, u64), BuildId>,
}

impl InMemoryMappingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MappingStore for InMemoryMappingStore {
    async fn put(&self, revision: &Revision, build: &BuildId) -> Result<(), StoreError> {
        let mut tables = self.inner.write().await;
        if tables.by_build.contains_key(build) {
            return Ok(());
        }
        tables.by_build.insert(build.clone(), revision.clone());
        tables.by_revision.insert(
            (revision.patch_number, revision.change_number),
            build.clone(),
        );
        Ok(())
    }

    async fn get_by_build(&self, build: &BuildId) -> Result<Option<Revision>, StoreError> {
        Ok(self.inner.read().await.by_build.get(build).cloned())
    }

    async fn get_by_revision(
        &self,
        patch_number: u64,
        change_number: u64,
    ) -> Result<Option<BuildId>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .by_revision
            .get(&(patch_number, change_number))
            .cloned())
    }
}
