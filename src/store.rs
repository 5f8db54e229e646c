use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Durable, append-mostly ledger of admitted API calls.
///
/// Holds only a path; every operation opens its own connection inside
/// `spawn_blocking`, so the store is cheap to clone and safe to share
/// across tasks. Window queries are range filters on the timestamp
/// index, never full scans.
#[derive(Clone, Debug)]
pub struct UsageStore {
    path: PathBuf,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordId(i64);

/// Category of the admitted call. Retained for observability; quota math
/// only ever aggregates counts and token sums.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Embedding,
    Generation,
    TokenCount,
}

impl CallKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CallKind::Embedding => "embedding",
            CallKind::Generation => "generation",
            CallKind::TokenCount => "token_count",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "embedding" => Some(CallKind::Embedding),
            "generation" => Some(CallKind::Generation),
            "token_count" => Some(CallKind::TokenCount),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallRecord {
    pub id: RecordId,
    pub ts_ms: i64,
    pub tokens: u64,
    pub kind: CallKind,
}

/// One window's worth of usage, fetched in a single query so an admission
/// check does not open three connections per tier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WindowUsage {
    pub requests: u64,
    pub tokens: u64,
    pub oldest_ts_ms: Option<i64>,
}

impl UsageStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    /// Appends one admitted call. `tokens` holds the admission-time
    /// estimate until `update_tokens` reconciles it.
    pub async fn append(
        &self,
        kind: CallKind,
        tokens: u64,
        ts_ms: i64,
    ) -> Result<RecordId, StoreError> {
        let path = self.path.clone();
        let tokens_i64 = tokens_to_i64(tokens);
        tokio::task::spawn_blocking(move || -> Result<RecordId, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO api_calls (ts_ms, tokens, kind) VALUES (?1, ?2, ?3)",
                rusqlite::params![ts_ms, tokens_i64, kind.as_str()],
            )?;
            Ok(RecordId(conn.last_insert_rowid()))
        })
        .await?
    }

    /// Number of records with `ts_ms >= now - window`.
    pub async fn count_in_window(&self, now_ms: i64, window: Duration) -> Result<u64, StoreError> {
        let path = self.path.clone();
        let cutoff = now_ms.saturating_sub(duration_to_ms(window));
        tokio::task::spawn_blocking(move || -> Result<u64, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM api_calls WHERE ts_ms >= ?1",
                rusqlite::params![cutoff],
                |row| row.get(0),
            )?;
            Ok(i64_to_u64(count))
        })
        .await?
    }

    /// Token sum over the same filter as [`count_in_window`].
    ///
    /// [`count_in_window`]: UsageStore::count_in_window
    pub async fn sum_tokens_in_window(
        &self,
        now_ms: i64,
        window: Duration,
    ) -> Result<u64, StoreError> {
        let path = self.path.clone();
        let cutoff = now_ms.saturating_sub(duration_to_ms(window));
        tokio::task::spawn_blocking(move || -> Result<u64, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let sum: i64 = conn.query_row(
                "SELECT COALESCE(SUM(tokens), 0) FROM api_calls WHERE ts_ms >= ?1",
                rusqlite::params![cutoff],
                |row| row.get(0),
            )?;
            Ok(i64_to_u64(sum))
        })
        .await?
    }

    /// Requests in the last 24 hours. Daily usage is a sliding window
    /// anchored at `now`, not a calendar-day bucket; calls at 23:59 and
    /// 00:01 do not share a quota reset.
    pub async fn count_in_last_day(&self, now_ms: i64) -> Result<u64, StoreError> {
        self.count_in_window(now_ms, Duration::from_secs(86_400)).await
    }

    /// Count, token sum, and oldest counted timestamp for one window.
    pub async fn window_usage(
        &self,
        now_ms: i64,
        window: Duration,
    ) -> Result<WindowUsage, StoreError> {
        let path = self.path.clone();
        let cutoff = now_ms.saturating_sub(duration_to_ms(window));
        tokio::task::spawn_blocking(move || -> Result<WindowUsage, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let (requests, tokens, oldest_ts_ms): (i64, i64, Option<i64>) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(tokens), 0), MIN(ts_ms)
                 FROM api_calls WHERE ts_ms >= ?1",
                rusqlite::params![cutoff],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            Ok(WindowUsage {
                requests: i64_to_u64(requests),
                tokens: i64_to_u64(tokens),
                oldest_ts_ms,
            })
        })
        .await?
    }

    /// Corrects a previously recorded token estimate in place. Idempotent;
    /// a no-op when the row has already been pruned.
    pub async fn update_tokens(&self, id: RecordId, tokens: u64) -> Result<(), StoreError> {
        let path = self.path.clone();
        let tokens_i64 = tokens_to_i64(tokens);
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "UPDATE api_calls SET tokens = ?2 WHERE id = ?1",
                rusqlite::params![id.0, tokens_i64],
            )?;
            Ok(())
        })
        .await?
    }

    /// Deletes records with `ts_ms <= now - retention`. Returns the number
    /// of rows removed. The delete runs in a single statement, so a
    /// concurrent window query sees each record exactly once or not at all.
    pub async fn prune(&self, now_ms: i64, retention: Duration) -> Result<u64, StoreError> {
        let path = self.path.clone();
        let cutoff = now_ms.saturating_sub(duration_to_ms(retention));
        let removed = tokio::task::spawn_blocking(move || -> Result<u64, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let removed = conn.execute(
                "DELETE FROM api_calls WHERE ts_ms <= ?1",
                rusqlite::params![cutoff],
            )?;
            Ok(removed as u64)
        })
        .await??;
        if removed > 0 {
            tracing::debug!(removed, "pruned usage records past retention");
        }
        Ok(removed)
    }

    pub async fn get(&self, id: RecordId) -> Result<Option<CallRecord>, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<CallRecord>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let row = conn
                .query_row(
                    "SELECT id, ts_ms, tokens, kind FROM api_calls WHERE id = ?1",
                    rusqlite::params![id.0],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()?;
            let Some((id, ts_ms, tokens, kind_raw)) = row else {
                return Ok(None);
            };
            let kind = CallKind::parse(&kind_raw).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    3,
                    rusqlite::types::Type::Text,
                    format!("unknown call kind: {kind_raw}").into(),
                )
            })?;
            Ok(Some(CallRecord {
                id: RecordId(id),
                ts_ms,
                tokens: i64_to_u64(tokens),
                kind,
            }))
        })
        .await?
    }
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS api_calls (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts_ms INTEGER NOT NULL,
            tokens INTEGER NOT NULL,
            kind TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_api_calls_ts_ms
            ON api_calls(ts_ms);",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn duration_to_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn tokens_to_i64(tokens: u64) -> i64 {
    if tokens > i64::MAX as u64 {
        i64::MAX
    } else {
        tokens as i64
    }
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}
