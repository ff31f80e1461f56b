//! Change-log sources
//!
//! A change log is an append-only table of `(sequence_id, resource_id)` rows with a
//! strictly increasing sequence id. The watcher reads it through [`ChangeLogSource`].

use crate::error::QueueError;
use async_trait::async_trait;
use core_config::database::DatabaseConfig;
use sea_orm::{Database, DatabaseConnection, DbBackend, FromQueryResult, Statement};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

/// One change-log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromQueryResult)]
pub struct ChangeLogEntry {
    pub sequence_id: i64,
    pub resource_id: i64,
}

/// Read access to a change log.
#[async_trait]
pub trait ChangeLogSource: Send + Sync {
    /// Highest sequence id in the log, 0 when the log is empty.
    async fn latest_sequence_id(&self) -> Result<i64, QueueError>;

    /// Rows with `sequence_id > cursor`, ascending, at most `limit` of them.
    async fn entries_after(
        &self,
        cursor: i64,
        limit: usize,
    ) -> Result<Vec<ChangeLogEntry>, QueueError>;
}

/// Table and column names of a change log.
///
/// Names are spliced into SQL, so only plain identifiers (optionally
/// schema-qualified) are accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeLogTable {
    table: String,
    sequence_column: String,
    resource_column: String,
}

impl ChangeLogTable {
    pub fn new(
        table: impl Into<String>,
        sequence_column: impl Into<String>,
        resource_column: impl Into<String>,
    ) -> Result<Self, QueueError> {
        let table = table.into();
        let sequence_column = sequence_column.into();
        let resource_column = resource_column.into();

        if !table.split('.').all(is_identifier) || table.split('.').count() > 2 {
            return Err(QueueError::Config(format!("invalid table name: {table:?}")));
        }
        for column in [&sequence_column, &resource_column] {
            if !is_identifier(column) {
                return Err(QueueError::Config(format!("invalid column name: {column:?}")));
            }
        }

        Ok(Self {
            table,
            sequence_column,
            resource_column,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn latest_sql(&self) -> String {
        format!(
            "SELECT MAX({seq})::bigint AS latest FROM {table}",
            seq = self.sequence_column,
            table = self.table,
        )
    }

    fn entries_sql(&self) -> String {
        format!(
            "SELECT {seq}::bigint AS sequence_id, {res}::bigint AS resource_id \
             FROM {table} WHERE {seq} > $1 ORDER BY {seq} ASC LIMIT $2",
            seq = self.sequence_column,
            res = self.resource_column,
            table = self.table,
        )
    }
}

impl Default for ChangeLogTable {
    fn default() -> Self {
        Self {
            table: "change_log".to_string(),
            sequence_column: "sequence_id".to_string(),
            resource_column: "resource_id".to_string(),
        }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, FromQueryResult)]
struct LatestRow {
    latest: Option<i64>,
}

/// PostgreSQL change log read through sea-orm.
#[derive(Clone)]
pub struct PgChangeLog {
    db: DatabaseConnection,
    table: ChangeLogTable,
}

impl PgChangeLog {
    /// Read the default `change_log(sequence_id, resource_id)` table.
    pub fn new(db: DatabaseConnection) -> Self {
        Self::with_table(db, ChangeLogTable::default())
    }

    pub fn with_table(db: DatabaseConnection, table: ChangeLogTable) -> Self {
        Self { db, table }
    }

    /// Connect using a DatabaseConfig
    pub async fn connect(config: &DatabaseConfig, table: ChangeLogTable) -> Result<Self, QueueError> {
        let db = Database::connect(config.url.as_str()).await?;
        info!(table = %table.table(), "Connected to change-log database");
        Ok(Self::with_table(db, table))
    }

    /// Get the database connection
    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }
}

#[async_trait]
impl ChangeLogSource for PgChangeLog {
    async fn latest_sequence_id(&self) -> Result<i64, QueueError> {
        let stmt = Statement::from_string(DbBackend::Postgres, self.table.latest_sql());

        let row = LatestRow::find_by_statement(stmt).one(&self.db).await?;
        Ok(row.and_then(|r| r.latest).unwrap_or(0))
    }

    async fn entries_after(
        &self,
        cursor: i64,
        limit: usize,
    ) -> Result<Vec<ChangeLogEntry>, QueueError> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            self.table.entries_sql(),
            [cursor.into(), (limit as i64).into()],
        );

        let entries = ChangeLogEntry::find_by_statement(stmt).all(&self.db).await?;
        debug!(cursor = cursor, count = entries.len(), "Polled change log");
        Ok(entries)
    }
}

/// In-process change log for tests and local tooling.
#[derive(Debug, Default)]
pub struct MemoryChangeLog {
    inner: Mutex<MemoryLogInner>,
}

#[derive(Debug, Default)]
struct MemoryLogInner {
    entries: Vec<ChangeLogEntry>,
    pending_failures: usize,
    read_delay: Duration,
}

impl MemoryChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a row for `resource_id` and return its sequence id.
    pub fn append(&self, resource_id: i64) -> i64 {
        let mut inner = self.lock();
        let sequence_id = inner.entries.last().map_or(1, |e| e.sequence_id + 1);
        inner.entries.push(ChangeLogEntry {
            sequence_id,
            resource_id,
        });
        sequence_id
    }

    /// Make the next `count` reads fail.
    pub fn fail_next(&self, count: usize) {
        self.lock().pending_failures += count;
    }

    /// Make every `entries_after` call take at least `delay`, like a slow query.
    pub fn set_read_delay(&self, delay: Duration) {
        self.lock().read_delay = delay;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryLogInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_failure(inner: &mut MemoryLogInner) -> Result<(), QueueError> {
        if inner.pending_failures == 0 {
            return Ok(());
        }
        inner.pending_failures -= 1;
        Err(QueueError::Database(sea_orm::DbErr::Custom(
            "injected change-log failure".to_string(),
        )))
    }
}

#[async_trait]
impl ChangeLogSource for MemoryChangeLog {
    async fn latest_sequence_id(&self) -> Result<i64, QueueError> {
        let mut inner = self.lock();
        Self::take_failure(&mut inner)?;
        Ok(inner.entries.last().map_or(0, |e| e.sequence_id))
    }

    async fn entries_after(
        &self,
        cursor: i64,
        limit: usize,
    ) -> Result<Vec<ChangeLogEntry>, QueueError> {
        let delay = self.lock().read_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.lock();
        Self::take_failure(&mut inner)?;
        Ok(inner
            .entries
            .iter()
            .filter(|e| e.sequence_id > cursor)
            .take(limit)
            .copied()
            .collect())
    }
}
