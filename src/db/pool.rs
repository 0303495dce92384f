// db/pool.rs
// Async connection pool using deadpool-sqlite
//
// # Async Database Access Patterns
//
// ## Preferred Pattern: pool.run()
// Use `pool.run()` from store/compaction/retrieval code — it converts errors
// into `LcmError` automatically:
// ```ignore
// let result = backend.run(move |conn| some_function(conn)).await?;
// ```
//
// ## Lower-Level: pool.interact()
// Use `pool.interact()` when you need `anyhow::Result` instead of `LcmError`,
// e.g. in migrations or the integrity checker.
//
// ## Common Pitfalls
//
// 1. **Don't block the async runtime**: always go through `run`/`interact`,
//    never open a `rusqlite::Connection` directly outside of tests.
// 2. **Type inference**: closures sometimes need an explicit `Ok::<_, ...>`
//    annotation on their return value.
// 3. **In-memory testing**: use the shared-cache URI
//    (`file:memdb_xxx?mode=memory&cache=shared`) so multiple pool
//    connections see the same database state.

use crate::error::LcmError;
use anyhow::{Context, Result};
use deadpool_sqlite::{Config, Hook, Pool, Runtime};
use rusqlite::Connection;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Transaction isolation/locking mode, mirrored from SQLite's `BEGIN` variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    Deferred,
    Immediate,
    Exclusive,
}

impl TxMode {
    fn to_rusqlite(self) -> rusqlite::TransactionBehavior {
        match self {
            TxMode::Deferred => rusqlite::TransactionBehavior::Deferred,
            TxMode::Immediate => rusqlite::TransactionBehavior::Immediate,
            TxMode::Exclusive => rusqlite::TransactionBehavior::Exclusive,
        }
    }
}

/// Check if a rusqlite error is SQLITE_BUSY or SQLITE_LOCKED.
///
/// SQLITE_BUSY ("database is locked") occurs with file-based databases under write contention.
/// SQLITE_LOCKED ("database table is locked") occurs with shared-cache in-memory databases
/// when another connection holds a write lock on the same table.
fn is_rusqlite_contention(err: &rusqlite::Error) -> bool {
    use rusqlite::ffi;
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            ffi::Error {
                code: ffi::ErrorCode::DatabaseBusy | ffi::ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}

/// Check if an LcmError wraps a SQLite contention error.
fn is_lcm_contention(err: &LcmError) -> bool {
    match err {
        LcmError::Db(rusqlite_err) => is_rusqlite_contention(rusqlite_err),
        _ => false,
    }
}

/// Retry delays for SQLite contention backoff (100ms, 500ms, 2s).
const RETRY_DELAYS: [std::time::Duration; 3] = [
    std::time::Duration::from_millis(100),
    std::time::Duration::from_millis(500),
    std::time::Duration::from_millis(2000),
];

/// Generic retry-with-backoff for async operations that may encounter SQLite contention.
async fn retry_with_backoff<F, Fut, R, E>(
    mut op: F,
    is_retryable: impl Fn(&E) -> bool,
) -> Result<R, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<R, E>>,
{
    for (attempt, delay) in RETRY_DELAYS.iter().enumerate() {
        match op().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if is_retryable(&e) {
                    tracing::warn!(
                        "SQLite contention on attempt {}/{}, retrying in {:?}",
                        attempt + 1,
                        RETRY_DELAYS.len(),
                        delay
                    );
                    tokio::time::sleep(*delay).await;
                } else {
                    return Err(e);
                }
            }
        }
    }
    // Final attempt (no retry after this) — exhausting retries surfaces as Busy upstream.
    op().await
}

/// Pooled SQLite storage backend for the LCM engine. Wraps deadpool-sqlite with
/// per-connection PRAGMA setup, busy-retry, and schema migrations on open.
pub struct StorageBackend {
    pool: Pool,
    path: Option<PathBuf>,
    memory_uri: Option<String>,
    fts_available: bool,
}

impl StorageBackend {
    /// Open a pooled database at the given path, running migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        Self::open_internal(DbStorage::File(path.to_path_buf())).await
    }

    /// Open a pooled in-memory database (shared cache, for tests).
    pub async fn open_in_memory() -> Result<Self> {
        Self::open_internal(DbStorage::InMemory).await
    }

    async fn open_internal(storage: DbStorage) -> Result<Self> {
        let (conn_str, path, memory_uri, hook) = match storage {
            DbStorage::File(p) => {
                ensure_parent_directory(&p)?;
                let s = p.to_string_lossy().to_string();
                let hook = make_file_post_create_hook(p.clone());
                (s, Some(p), None, hook)
            }
            DbStorage::InMemory => {
                let uri = format!("file:lcm_memdb_{}?mode=memory&cache=shared", uuid::Uuid::new_v4());
                let hook = make_memory_post_create_hook();
                (uri.clone(), None, Some(uri), hook)
            }
        };

        let cfg = Config::new(&conn_str);
        let pool = cfg
            .builder(Runtime::Tokio1)
            .context("failed to create pool builder")?
            .max_size(8)
            .post_create(hook)
            .build()
            .context("failed to build connection pool")?;

        let mut backend = Self {
            pool,
            path,
            memory_uri,
            fts_available: false,
        };

        backend.run_migrations().await?;
        backend.fts_available = backend.probe_fts().await;
        if backend.fts_available {
            backend.interact(|conn| crate::db::migrations::ensure_fts(conn)).await?;
        } else {
            tracing::warn!("FTS5 unavailable on this SQLite build; falling back to substring search");
        }

        Ok(backend)
    }

    /// Whether this build of SQLite supports FTS5 (probed once at open).
    pub fn fts_available(&self) -> bool {
        self.fts_available
    }

    /// Get the memory URI (for sharing state across pools in tests).
    pub fn memory_uri(&self) -> Option<&str> {
        self.memory_uri.as_deref()
    }

    /// Get the database file path (None for in-memory).
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run a closure with a pooled connection. Primary low-level access point;
    /// errors are `anyhow::Error` (use [`run`](Self::run) for `LcmError`).
    pub async fn interact<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self
            .pool
            .get()
            .await
            .context("failed to get connection from pool")?;

        conn.interact(move |conn| f(conn))
            .await
            .map_err(|e| anyhow::anyhow!("interact failed: {e}"))?
    }

    /// Run a closure that returns `Result<_, LcmError>` — the preferred API for
    /// store/compaction/retrieval code.
    pub async fn run<F, R, E>(&self, f: F) -> Result<R, LcmError>
    where
        F: FnOnce(&Connection) -> Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: Into<LcmError> + Send + 'static,
    {
        self.pool
            .get()
            .await
            .map_err(|e| LcmError::Other(format!("failed to get connection: {e}")))?
            .interact(move |conn| f(conn).map_err(Into::into))
            .await
            .map_err(|e| LcmError::Other(format!("database error: {e}")))?
    }

    /// Like [`run`](Self::run), retrying on SQLite contention with exponential
    /// backoff (100ms, 500ms, 2000ms). The closure must be `Clone` to support retries.
    pub async fn run_with_retry<F, R, E>(&self, f: F) -> Result<R, LcmError>
    where
        F: FnOnce(&Connection) -> Result<R, E> + Send + Clone + 'static,
        R: Send + 'static,
        E: Into<LcmError> + Send + 'static,
    {
        retry_with_backoff(
            || {
                let f_clone = f.clone();
                self.run(f_clone)
            },
            is_lcm_contention,
        )
        .await
    }

    /// Run `f` inside a transaction opened with the given [`TxMode`], committing on
    /// `Ok` and rolling back on `Err`. Retries up to `retries` times on contention.
    pub async fn with_transaction<F, R>(&self, mode: TxMode, retries: usize, f: F) -> Result<R, LcmError>
    where
        F: Fn(&Connection) -> Result<R, LcmError> + Send + Clone + 'static,
        R: Send + 'static,
    {
        let mut attempt = 0usize;
        loop {
            let f = f.clone();
            let outcome = self
                .pool
                .get()
                .await
                .map_err(|e| LcmError::Other(format!("failed to get connection: {e}")))?
                .interact(move |conn| {
                    let tx = conn
                        .transaction_with_behavior(mode.to_rusqlite())
                        .map_err(LcmError::from)?;
                    let result = f(&tx)?;
                    tx.commit().map_err(LcmError::from)?;
                    Ok::<R, LcmError>(result)
                })
                .await
                .map_err(|e| LcmError::Other(format!("database error: {e}")))?;

            match outcome {
                Ok(r) => return Ok(r),
                Err(e) if is_lcm_contention(&e) && attempt < retries => {
                    attempt += 1;
                    let delay = RETRY_DELAYS
                        .get(attempt - 1)
                        .copied()
                        .unwrap_or(*RETRY_DELAYS.last().unwrap());
                    tracing::warn!("transaction busy, retry {}/{} in {:?}", attempt, retries, delay);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn run_migrations(&self) -> Result<()> {
        self.interact(|conn| {
            crate::db::migrations::run_all(conn)?;
            if let Err(e) = conn.execute_batch("PRAGMA optimize") {
                tracing::debug!("PRAGMA optimize skipped: {}", e);
            }
            Ok(())
        })
        .await
    }

    /// Try creating (and immediately dropping) a throwaway FTS5 virtual table to
    /// detect whether this SQLite build has the FTS5 module compiled in.
    async fn probe_fts(&self) -> bool {
        self.interact(|conn| {
            let ok = conn
                .execute_batch(
                    "CREATE VIRTUAL TABLE IF NOT EXISTS __lcm_fts_probe USING fts5(x); \
                     DROP TABLE IF EXISTS __lcm_fts_probe;",
                )
                .is_ok();
            Ok(ok)
        })
        .await
        .unwrap_or(false)
    }

    /// Get pool status for monitoring.
    pub fn status(&self) -> PoolStatus {
        let status = self.pool.status();
        PoolStatus {
            size: status.size,
            available: status.available,
        }
    }
}

/// Pool status for monitoring.
#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub size: usize,
    pub available: usize,
}

enum DbStorage {
    File(PathBuf),
    InMemory,
}

fn ensure_parent_directory(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            let mut perms = std::fs::metadata(parent)?.permissions();
            perms.set_mode(0o700);
            std::fs::set_permissions(parent, perms)?;
        }
    }
    Ok(())
}

fn make_file_post_create_hook(path: PathBuf) -> Hook {
    Hook::async_fn(move |conn, _metrics| {
        let path_for_perms = path.clone();
        Box::pin(async move {
            conn.interact(move |conn| {
                setup_connection(conn)?;

                #[cfg(unix)]
                if let Ok(metadata) = std::fs::metadata(&path_for_perms) {
                    let mut perms = metadata.permissions();
                    perms.set_mode(0o600);
                    if let Err(e) = std::fs::set_permissions(&path_for_perms, perms) {
                        tracing::warn!("failed to set database file permissions to 0600: {}", e);
                    }
                }

                Ok::<_, rusqlite::Error>(())
            })
            .await
            .map_err(|e| deadpool_sqlite::HookError::Message(format!("interact failed: {e}").into()))?
            .map_err(|e| {
                deadpool_sqlite::HookError::Message(format!("connection setup failed: {e}").into())
            })
        })
    })
}

fn make_memory_post_create_hook() -> Hook {
    Hook::async_fn(|conn, _metrics| {
        Box::pin(async move {
            conn.interact(|conn| {
                conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;
                Ok::<_, rusqlite::Error>(())
            })
            .await
            .map_err(|e| deadpool_sqlite::HookError::Message(format!("interact failed: {e}").into()))?
            .map_err(|e| {
                deadpool_sqlite::HookError::Message(format!("connection setup failed: {e}").into())
            })
        })
    })
}

/// Configure a connection after it's created: WAL mode, foreign keys, busy timeout.
fn setup_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL; \
         PRAGMA foreign_keys=ON; \
         PRAGMA busy_timeout=5000; \
         PRAGMA synchronous=NORMAL;",
    )?;
    Ok(())
}
