//! Persistent store: durable, transactional storage for every core entity.
//!
//! Backed by `rusqlite` with a bundled SQLite. Migrations are embedded SQL
//! strings (`include_str!`, not read from disk) so the binary stays
//! self-contained, the same way the teacher's prompt loader embeds static
//! resources at compile time. Single-writer access is enforced by wrapping
//! the connection in a `tokio::sync::Mutex` and running blocking SQLite work
//! via `spawn_blocking`, mirroring how the teacher's vector store wraps its
//! embedding model handle.

use std::path::Path;
use std::sync::Arc;

use rusqlite::{params_from_iter, Connection, ToSql};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::error::{MamaError, Result};

/// One embedded migration file, applied at most once.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "init",
    sql: include_str!("migrations/001_init.sql"),
}];

/// A single row returned from `all`/`get`, keyed by column name.
pub type Row = serde_json::Map<String, Value>;

/// The persistent store. Cheaply cloneable; all clones share one connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path` and apply pending migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let conn = Connection::open(&path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            Ok(conn)
        })
        .await
        .map_err(|e| MamaError::Internal {
            message: e.to_string(),
        })??;

        let store = Store {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// In-memory store, used by tests.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Store {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Apply all pending migrations in version order. Idempotent: running
    /// twice applies nothing the second time.
    pub async fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL
            )",
            [],
        )?;

        let mut applied: Vec<i64> = {
            let mut stmt = conn.prepare("SELECT version FROM schema_migrations")?;
            let rows = stmt.query_map([], |r| r.get::<_, i64>(0))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };
        applied.sort_unstable();

        let mut pending: Vec<&Migration> = MIGRATIONS
            .iter()
            .filter(|m| !applied.contains(&m.version))
            .collect();
        pending.sort_by_key(|m| m.version);

        for migration in pending {
            info!(version = migration.version, name = migration.name, "applying migration");
            if let Err(e) = conn.execute_batch(migration.sql) {
                error!(version = migration.version, error = %e, "migration failed");
                return Err(MamaError::MigrationFailed {
                    version: migration.version,
                    message: e.to_string(),
                });
            }
            conn.execute(
                "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![
                    migration.version,
                    migration.name,
                    chrono::Utc::now().to_rfc3339()
                ],
            )?;
        }
        Ok(())
    }

    /// Execute a statement with no expected result rows (INSERT/UPDATE/DELETE).
    pub async fn run(&self, sql: &str, params: Vec<Value>) -> Result<usize> {
        let sql = sql.to_string();
        let conn = self.conn.lock().await;
        let bound = to_sql_params(&params);
        Ok(conn.execute(&sql, params_from_iter(bound.iter().map(|b| b.as_ref())))?)
    }

    /// Run a query and return every matching row.
    pub async fn all(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Row>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(sql)?;
        let col_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let bound = to_sql_params(&params);
        let rows = stmt.query_map(params_from_iter(bound.iter().map(|b| b.as_ref())), |r| {
            row_to_map(r, &col_names)
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(MamaError::from)
    }

    /// Run a query and return the first matching row, if any.
    pub async fn get(&self, sql: &str, params: Vec<Value>) -> Result<Option<Row>> {
        Ok(self.all(sql, params).await?.into_iter().next())
    }

    /// Run `body` inside a transaction. On `Err`, the transaction rolls back.
    pub async fn transaction<F, T>(&self, body: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let result = body(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}

fn to_sql_params(values: &[Value]) -> Vec<Box<dyn ToSql>> {
    values
        .iter()
        .map(|v| -> Box<dyn ToSql> {
            match v {
                Value::Null => Box::new(Option::<String>::None),
                Value::Bool(b) => Box::new(*b),
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Box::new(i)
                    } else {
                        Box::new(n.as_f64().unwrap_or(0.0))
                    }
                }
                Value::String(s) => Box::new(s.clone()),
                other => Box::new(other.to_string()),
            }
        })
        .collect()
}

fn row_to_map(row: &rusqlite::Row<'_>, col_names: &[String]) -> rusqlite::Result<Row> {
    let mut map = Row::new();
    for (i, name) in col_names.iter().enumerate() {
        let value: Value = match row.get_ref(i)? {
            rusqlite::types::ValueRef::Null => Value::Null,
            rusqlite::types::ValueRef::Integer(n) => Value::from(n),
            rusqlite::types::ValueRef::Real(f) => Value::from(f),
            rusqlite::types::ValueRef::Text(t) => {
                Value::from(String::from_utf8_lossy(t).into_owned())
            }
            rusqlite::types::ValueRef::Blob(b) => Value::from(String::from_utf8_lossy(b).into_owned()),
        };
        map.insert(name.clone(), value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_create_tables() {
        let store = Store::open_in_memory().await.unwrap();
        let rows = store
            .all(
                "SELECT name FROM sqlite_master WHERE type='table' AND name='episodes'",
                vec![],
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        store.run_migrations().await.unwrap();
        let rows = store
            .all("SELECT version FROM schema_migrations", vec![])
            .await
            .unwrap();
        assert_eq!(rows.len(), MIGRATIONS.len());
    }

    #[tokio::test]
    async fn run_and_get_roundtrip() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .run(
                "INSERT INTO skill_registry (name, description, created_at) VALUES (?1, ?2, ?3)",
                vec![
                    Value::from("read_file"),
                    Value::from("reads a file"),
                    Value::from(chrono::Utc::now().to_rfc3339()),
                ],
            )
            .await
            .unwrap();
        let row = store
            .get(
                "SELECT * FROM skill_registry WHERE name = ?1",
                vec![Value::from("read_file")],
            )
            .await
            .unwrap();
        assert!(row.is_some());
    }

    #[tokio::test]
    async fn transaction_rolls_back_on_error() {
        let store = Store::open_in_memory().await.unwrap();
        let result: Result<()> = store
            .transaction(|tx| {
                tx.execute(
                    "INSERT INTO skill_registry (name, description, created_at) VALUES ('x','y','z')",
                    [],
                )?;
                Err(MamaError::Internal {
                    message: "force rollback".into(),
                })
            })
            .await;
        assert!(result.is_err());
        let rows = store.all("SELECT * FROM skill_registry", vec![]).await.unwrap();
        assert!(rows.is_empty());
    }
}
