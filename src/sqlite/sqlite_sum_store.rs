use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};

use crate::{
    TallyKey, TallymanError,
    store::{DurableStore, SumRecord},
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS sum_table (
        key TEXT PRIMARY KEY NOT NULL,
        sum INTEGER NOT NULL
    );
";

const UPSERT_ADD: &str = "
    INSERT INTO sum_table (key, sum) VALUES (?1, ?2)
    ON CONFLICT(key) DO UPDATE SET sum = sum + excluded.sum
    RETURNING sum
";

/// [`DurableStore`] backed by a SQLite database.
///
/// Statements run on tokio's blocking pool. Clones share the same connection.
#[derive(Clone)]
pub struct SqliteSumStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSumStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TallymanError> {
        let path = path.as_ref();
        tracing::info!(path = %path.display(), "Opening SQLite sum store");

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::with_connection(conn)
    }

    /// Open an in-memory database.
    pub fn open_in_memory() -> Result<Self, TallymanError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, TallymanError> {
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T, TallymanError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || -> Result<T, TallymanError> {
            let conn = conn.lock().map_err(|_| {
                TallymanError::StoreUnavailable("sqlite connection lock poisoned".to_string())
            })?;

            Ok(f(&conn)?)
        })
        .await
        .map_err(|err| TallymanError::StoreUnavailable(format!("sqlite task failed: {err}")))?
    }
}

impl std::fmt::Debug for SqliteSumStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSumStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl DurableStore for SqliteSumStore {
    async fn upsert_add(&self, key: &TallyKey, delta: i64) -> Result<i64, TallymanError> {
        let key = key.to_string();

        self.run(move |conn| conn.query_row(UPSERT_ADD, params![key, delta], |row| row.get(0)))
            .await
    }

    async fn get(&self, key: &TallyKey) -> Result<Option<SumRecord>, TallymanError> {
        let key = key.to_string();

        self.run(move |conn| {
            conn.query_row(
                "SELECT key, sum FROM sum_table WHERE key = ?1",
                params![key],
                |row| {
                    Ok(SumRecord {
                        key: row.get(0)?,
                        sum: row.get(1)?,
                    })
                },
            )
            .optional()
        })
        .await
    }
}
