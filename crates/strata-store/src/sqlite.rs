//! SQLite backend
//!
//! Records live in a single `resources` table keyed by the composite
//! `(chain, id)` - the scope chain partitions rows exactly the way the
//! filesystem backend partitions directories. The connection is shared
//! behind a mutex and every statement runs on the blocking pool.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use strata_core::{
    ResourceId, ScopeChain, StateRecord, StateStore, StoreFactory, StrataError, StrataResult,
};
use strata_crypto::SecretCipher;

use crate::serial;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS resources (
    chain TEXT NOT NULL,
    id    TEXT NOT NULL,
    state TEXT NOT NULL,
    PRIMARY KEY (chain, id)
)";

type SharedConn = Arc<Mutex<Connection>>;

async fn blocking<T, F>(conn: &SharedConn, f: F) -> StrataResult<T>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
{
    let conn = Arc::clone(conn);
    tokio::task::spawn_blocking(move || {
        let guard = conn
            .lock()
            .map_err(|_| StrataError::Store("sqlite connection poisoned".into()))?;
        f(&guard).map_err(StrataError::store)
    })
    .await
    .map_err(StrataError::store)?
}

/// Store partition backed by one chain's rows in a shared SQLite database.
pub struct SqliteStore {
    conn: SharedConn,
    chain: String,
    cipher: Option<Arc<SecretCipher>>,
}

impl SqliteStore {
    fn cipher(&self) -> Option<&SecretCipher> {
        self.cipher.as_deref()
    }

    fn parse(&self, state: &str) -> StrataResult<StateRecord> {
        let json: serde_json::Value =
            serde_json::from_str(state).map_err(|e| StrataError::Serialize(e.to_string()))?;
        serial::record_from_json(&json, self.cipher())
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn list(&self) -> StrataResult<Vec<ResourceId>> {
        let chain = self.chain.clone();
        let rows = blocking(&self.conn, move |conn| {
            let mut stmt = conn.prepare("SELECT id FROM resources WHERE chain = ?1 ORDER BY id")?;
            let rows = stmt.query_map(params![chain], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await?;
        Ok(rows.into_iter().map(ResourceId::new).collect())
    }

    async fn count(&self) -> StrataResult<usize> {
        let chain = self.chain.clone();
        let count: i64 = blocking(&self.conn, move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM resources WHERE chain = ?1",
                params![chain],
                |row| row.get(0),
            )
        })
        .await?;
        Ok(count as usize)
    }

    async fn get(&self, id: &ResourceId) -> StrataResult<Option<StateRecord>> {
        let chain = self.chain.clone();
        let id = id.as_str().to_string();
        let state: Option<String> = blocking(&self.conn, move |conn| {
            conn.query_row(
                "SELECT state FROM resources WHERE chain = ?1 AND id = ?2",
                params![chain, id],
                |row| row.get(0),
            )
            .optional()
        })
        .await?;

        match state {
            Some(state) => self.parse(&state).map(Some),
            None => Ok(None),
        }
    }

    async fn all(&self) -> StrataResult<std::collections::HashMap<ResourceId, StateRecord>> {
        let chain = self.chain.clone();
        let rows = blocking(&self.conn, move |conn| {
            let mut stmt =
                conn.prepare("SELECT id, state FROM resources WHERE chain = ?1")?;
            let rows = stmt.query_map(params![chain], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await?;

        let mut out = std::collections::HashMap::with_capacity(rows.len());
        for (id, state) in rows {
            out.insert(ResourceId::new(id), self.parse(&state)?);
        }
        Ok(out)
    }

    async fn set(&self, id: &ResourceId, record: &StateRecord) -> StrataResult<()> {
        let json = serial::record_to_json(record, self.cipher())?;
        let state =
            serde_json::to_string(&json).map_err(|e| StrataError::Serialize(e.to_string()))?;
        let chain = self.chain.clone();
        let id = id.as_str().to_string();

        blocking(&self.conn, move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO resources (chain, id, state) VALUES (?1, ?2, ?3)",
                params![chain, id, state],
            )
            .map(|_| ())
        })
        .await
    }

    async fn delete(&self, id: &ResourceId) -> StrataResult<()> {
        let chain = self.chain.clone();
        let id = id.as_str().to_string();
        blocking(&self.conn, move |conn| {
            conn.execute(
                "DELETE FROM resources WHERE chain = ?1 AND id = ?2",
                params![chain, id],
            )
            .map(|_| ())
        })
        .await
    }
}

/// Factory sharing one SQLite database across all scope chains.
pub struct SqliteStoreFactory {
    conn: SharedConn,
    cipher: Option<Arc<SecretCipher>>,
}

impl SqliteStoreFactory {
    /// Open (or create) a database file and ensure the schema exists.
    pub fn open_file(path: impl AsRef<std::path::Path>, password: Option<&str>) -> StrataResult<Self> {
        let conn = Connection::open(path).map_err(StrataError::store)?;
        Self::with_connection(conn, password)
    }

    /// An in-memory database, handy for tests.
    pub fn open_in_memory(password: Option<&str>) -> StrataResult<Self> {
        let conn = Connection::open_in_memory().map_err(StrataError::store)?;
        Self::with_connection(conn, password)
    }

    fn with_connection(conn: Connection, password: Option<&str>) -> StrataResult<Self> {
        conn.execute(SCHEMA, []).map_err(StrataError::store)?;
        Ok(SqliteStoreFactory {
            conn: Arc::new(Mutex::new(conn)),
            cipher: password.map(|pw| Arc::new(SecretCipher::from_passphrase(pw))),
        })
    }
}

#[async_trait]
impl StoreFactory for SqliteStoreFactory {
    async fn open(&self, chain: &ScopeChain) -> StrataResult<Arc<dyn StateStore>> {
        Ok(Arc::new(SqliteStore {
            conn: Arc::clone(&self.conn),
            chain: chain.key(),
            cipher: self.cipher.clone(),
        }))
    }
}
