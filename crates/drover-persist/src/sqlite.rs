//! SQLite job store
//!
//! Each queue root gets one table, `{root}_jobs`, holding the full job
//! document as JSON next to the columns used to narrow lookups. Conditional
//! updates and deletes run inside `BEGIN IMMEDIATE` transactions, so the
//! match-then-mutate step is atomic across connections and processes.

use async_trait::async_trait;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{QueryBuilder, Row, Sqlite, Transaction};
use std::env;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use drover_queue::store::{JobIndex, JobOrder, JobQuery, JobStore, Mutation, RunIdFilter};
use drover_queue::{JobDoc, JobId, StoreError};

/// SQLite configuration options
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database URL (e.g., "sqlite:drover.db?mode=rwc" or "sqlite::memory:")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Enable WAL journal mode for better concurrency
    pub wal_mode: bool,
    /// Busy timeout in seconds
    pub busy_timeout_secs: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:drover.db?mode=rwc".to_string(),
            max_connections: 5,
            wal_mode: true,
            busy_timeout_secs: 30,
        }
    }
}

impl SqliteConfig {
    /// Create config for in-memory database (testing)
    pub fn memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            wal_mode: false,
            busy_timeout_secs: 5,
        }
    }

    /// Load configuration from environment variables
    ///
    /// Reads:
    /// - DROVER_DATABASE_URL (default: "sqlite:drover.db?mode=rwc")
    /// - DROVER_DB_MAX_CONNECTIONS (default: 5)
    /// - DROVER_DB_BUSY_TIMEOUT_SECS (default: 30)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: env::var("DROVER_DATABASE_URL").unwrap_or(defaults.url),
            max_connections: env::var("DROVER_DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            wal_mode: defaults.wal_mode,
            busy_timeout_secs: env::var("DROVER_DB_BUSY_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.busy_timeout_secs),
        }
    }

    /// `busy_timeout` pragma value, capped at what SQLite accepts
    fn busy_timeout_ms(&self) -> u64 {
        u64::from(self.busy_timeout_secs)
            .saturating_mul(1000)
            .min(i32::MAX as u64)
    }

    fn is_memory(&self) -> bool {
        self.url.contains(":memory:")
    }
}

/// Indexed columns written next to the JSON document
const COLUMNS: &str =
    "job_type, status, priority, run_id, after_us, retry_until_us, expires_after_us, repeats, created_us, doc";

/// Job store persisting documents in SQLite
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
    table: String,
}

impl SqliteJobStore {
    /// Open a pool from `config` and prepare the table for `root`
    pub async fn connect(root: &str, config: SqliteConfig) -> Result<Self, StoreError> {
        let mut options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        options = options.pragma("busy_timeout", config.busy_timeout_ms().to_string());
        if config.wal_mode {
            options = options.pragma("journal_mode", "WAL");
        }

        let mut pool_options = SqlitePoolOptions::new().max_connections(config.max_connections);
        if config.is_memory() {
            // an in-memory database lives only as long as its connection
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        info!(url = %config.url, wal = config.wal_mode, root = root, "Connected to SQLite");
        Self::new(pool, root).await
    }

    /// Use an existing pool; creates `{root}_jobs` if missing
    pub async fn new(pool: SqlitePool, root: &str) -> Result<Self, StoreError> {
        if root.is_empty() || !root.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(StoreError::Internal(format!(
                "Invalid queue root {root:?}: use letters, digits and underscores"
            )));
        }
        let table = format!("{root}_jobs");

        // Times are stored as microseconds since the epoch
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL,
                run_id TEXT,
                after_us INTEGER NOT NULL,
                retry_until_us INTEGER NOT NULL,
                expires_after_us INTEGER,
                repeats INTEGER NOT NULL,
                created_us INTEGER NOT NULL,
                doc TEXT NOT NULL
            )
            "#
        ))
        .execute(&pool)
        .await
        .map_err(query_err)?;

        Ok(Self { pool, table })
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// SELECT with every `JobQuery` predicate, the order and the limit in SQL
    fn select<'q>(
        &self,
        query: &JobQuery,
        order: Option<JobOrder>,
        limit: Option<usize>,
    ) -> QueryBuilder<'q, Sqlite> {
        let mut qb = QueryBuilder::new(format!("SELECT id, doc FROM {} WHERE 1 = 1", self.table));
        self.push_filter(&mut qb, query);

        match order {
            Some(JobOrder::Claim) => {
                qb.push(" ORDER BY priority, retry_until_us, after_us, created_us");
            }
            Some(JobOrder::Created) => {
                qb.push(" ORDER BY created_us");
            }
            None => {}
        }
        if let Some(limit) = limit {
            qb.push(" LIMIT ");
            qb.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }
        qb
    }

    fn push_filter(&self, qb: &mut QueryBuilder<'_, Sqlite>, query: &JobQuery) {
        if let Some(ids) = &query.ids {
            push_in(qb, "id", ids.iter().map(|id| id.to_string()).collect());
        }
        if let Some(statuses) = &query.statuses {
            push_in(
                qb,
                "status",
                statuses.iter().map(|s| s.as_str().to_string()).collect(),
            );
        }
        if let Some(types) = &query.types {
            push_in(qb, "job_type", types.clone());
        }
        match query.run_id {
            RunIdFilter::Any => {}
            RunIdFilter::Absent => {
                qb.push(" AND run_id IS NULL");
            }
            RunIdFilter::Equals(run_id) => {
                qb.push(" AND run_id = ");
                qb.push_bind(run_id.to_string());
            }
        }
        if let Some(ids) = &query.depends_on_any {
            if ids.is_empty() {
                qb.push(" AND 0");
            } else {
                qb.push(format!(
                    " AND EXISTS (SELECT 1 FROM json_each({}.doc, '$.depends') AS dep WHERE dep.value IN (",
                    self.table
                ));
                let mut separated = qb.separated(", ");
                for id in ids {
                    separated.push_bind(id.to_string());
                }
                separated.push_unseparated("))");
            }
        }
        if query.depends_empty {
            qb.push(" AND COALESCE(json_array_length(doc, '$.depends'), 0) = 0");
        }
        if let Some(time) = query.due_by {
            qb.push(" AND after_us <= ");
            qb.push_bind(time.timestamp_micros());
        }
        if let Some(time) = query.expired_before {
            qb.push(" AND expires_after_us < ");
            qb.push_bind(time.timestamp_micros());
        }
        if let Some(repeats) = query.repeats {
            qb.push(" AND repeats = ");
            qb.push_bind(i64::try_from(repeats).unwrap_or(i64::MAX));
        }
    }

    async fn load(
        &self,
        conn: &mut SqliteConnection,
        query: &JobQuery,
        order: Option<JobOrder>,
        limit: Option<usize>,
    ) -> Result<Vec<JobDoc>, StoreError> {
        let rows = self
            .select(query, order, limit)
            .build()
            .fetch_all(&mut *conn)
            .await
            .map_err(query_err)?;

        // columns hold whole microseconds; the document decides ties inside one
        let mut docs = Vec::with_capacity(rows.len());
        for row in rows {
            let doc = decode(&row)?;
            if query.matches(&doc) {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    async fn update_in(
        &self,
        conn: &mut SqliteConnection,
        query: &JobQuery,
        mutation: Mutation<'_>,
        multi: bool,
    ) -> Result<u64, StoreError> {
        let docs = if multi {
            self.load(conn, query, None, None).await?
        } else {
            self.load(conn, query, Some(JobOrder::Created), Some(1)).await?
        };

        let sql = format!(
            "UPDATE {} SET job_type = ?, status = ?, priority = ?, run_id = ?, after_us = ?, \
             retry_until_us = ?, expires_after_us = ?, repeats = ?, created_us = ?, doc = ? \
             WHERE id = ?",
            self.table
        );
        let mut count = 0;
        for mut doc in docs {
            let Some(id) = doc.id else { continue };
            mutation(&mut doc);
            doc.id = Some(id);
            Columns::of(&doc)?
                .bind(sqlx::query(&sql))
                .bind(id.to_string())
                .execute(&mut *conn)
                .await
                .map_err(query_err)?;
            count += 1;
        }
        Ok(count)
    }

    async fn delete_in(
        &self,
        conn: &mut SqliteConnection,
        query: &JobQuery,
    ) -> Result<u64, StoreError> {
        let ids: Vec<String> = self
            .load(conn, query, None, None)
            .await?
            .into_iter()
            .filter_map(|doc| doc.id.map(|id| id.to_string()))
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let mut qb = QueryBuilder::new(format!("DELETE FROM {} WHERE 1 = 1", self.table));
        push_in(&mut qb, "id", ids);
        let result = qb.build().execute(&mut *conn).await.map_err(query_err)?;
        Ok(result.rows_affected())
    }

    /// Write transaction holding the database write lock from its first statement.
    /// Dropping it uncommitted rolls it back.
    async fn write_tx(&self) -> Result<Transaction<'static, Sqlite>, StoreError> {
        self.pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn find(
        &self,
        query: &JobQuery,
        order: Option<JobOrder>,
        limit: Option<usize>,
    ) -> Result<Vec<JobDoc>, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let order = order.unwrap_or(JobOrder::Created);
        let mut docs = self.load(&mut conn, query, Some(order), limit).await?;
        JobOrder::apply(Some(order), &mut docs, limit);
        Ok(docs)
    }

    async fn update(
        &self,
        query: &JobQuery,
        mutation: Mutation<'_>,
        multi: bool,
    ) -> Result<u64, StoreError> {
        let mut tx = self.write_tx().await?;
        let count = self.update_in(&mut tx, query, mutation, multi).await?;
        tx.commit().await.map_err(query_err)?;
        if count > 0 {
            debug!(table = %self.table, count = count, "Updated jobs");
        }
        Ok(count)
    }

    async fn insert(&self, mut doc: JobDoc) -> Result<JobId, StoreError> {
        let id = Uuid::new_v4();
        doc.id = Some(id);

        let sql = format!(
            "INSERT INTO {} (id, {COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.table
        );
        Columns::of(&doc)?
            .bind(sqlx::query(&sql).bind(id.to_string()))
            .execute(&self.pool)
            .await
            .map_err(query_err)?;

        Ok(id)
    }

    async fn delete(&self, query: &JobQuery) -> Result<u64, StoreError> {
        let mut tx = self.write_tx().await?;
        let count = self.delete_in(&mut tx, query).await?;
        tx.commit().await.map_err(query_err)?;
        Ok(count)
    }

    async fn create_index(&self, index: JobIndex) -> Result<(), StoreError> {
        let (suffix, columns) = match index {
            JobIndex::TypeStatus => ("type_status", "job_type, status"),
            JobIndex::ClaimOrder => (
                "claim_order",
                "status, priority, retry_until_us, after_us, created_us",
            ),
            JobIndex::Status => ("status", "status, expires_after_us"),
        };
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {table}_{suffix} ON {table} ({columns})",
            table = self.table
        ))
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        debug!(table = %self.table, index = suffix, "Ensured index");
        Ok(())
    }
}

/// Column values for one document, in [`COLUMNS`] order
struct Columns {
    job_type: String,
    status: String,
    priority: i32,
    run_id: Option<String>,
    after: i64,
    retry_until: i64,
    expires_after: Option<i64>,
    repeats: i64,
    created: i64,
    doc: String,
}

impl Columns {
    fn of(doc: &JobDoc) -> Result<Self, StoreError> {
        Ok(Self {
            job_type: doc.job_type.clone(),
            status: doc.status.as_str().to_string(),
            priority: doc.priority,
            run_id: doc.run_id.map(|id| id.to_string()),
            after: doc.after.timestamp_micros(),
            retry_until: doc.retry_until.timestamp_micros(),
            expires_after: doc.expires_after.map(|t| t.timestamp_micros()),
            repeats: i64::try_from(doc.repeats).unwrap_or(i64::MAX),
            created: doc.created.timestamp_micros(),
            doc: serde_json::to_string(doc)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
        })
    }

    fn bind<'q>(
        self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        query
            .bind(self.job_type)
            .bind(self.status)
            .bind(self.priority)
            .bind(self.run_id)
            .bind(self.after)
            .bind(self.retry_until)
            .bind(self.expires_after)
            .bind(self.repeats)
            .bind(self.created)
            .bind(self.doc)
    }
}

fn push_in(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, values: Vec<String>) {
    if values.is_empty() {
        qb.push(" AND 0");
        return;
    }
    qb.push(format!(" AND {column} IN ("));
    let mut separated = qb.separated(", ");
    for value in values {
        separated.push_bind(value);
    }
    separated.push_unseparated(")");
}

fn decode(row: &SqliteRow) -> Result<JobDoc, StoreError> {
    let id: String = row.try_get("id").map_err(query_err)?;
    let json: String = row.try_get("doc").map_err(query_err)?;
    let mut doc: JobDoc =
        serde_json::from_str(&json).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let id = Uuid::parse_str(&id)
        .map_err(|e| StoreError::Serialization(format!("Invalid job id {id}: {e}")))?;
    doc.id = Some(id);
    Ok(doc)
}

fn query_err(e: sqlx::Error) -> StoreError {
    StoreError::Query(e.to_string())
}
