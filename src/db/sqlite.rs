//! SQLite implementation of the run store.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use sqlx::FromRow;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::sqlite::SqliteSynchronous;

use super::Database;
use super::DatabaseError;
use super::Result;
use super::RunPageEntry;
use crate::model::Attachment;
use crate::model::Log;
use crate::model::RunDocument;
use crate::model::RunLog;
use crate::model::RunLogPatch;
use crate::model::RunRequest;
use crate::model::ServiceInfoDocument;
use crate::model::State;
use crate::model::WesEndpoint;

/// Configure 5-second timeout when the database is locked to prevent spurious
/// failures.
const SQLITE_BUSY_TIMEOUT: &str = "5000";

/// Metadata key for the store schema version.
const VERSION_KEY: &str = "version";

/// Expected store schema version.
const EXPECTED_VERSION: &str = "1";

/// Sentinel primary key of the service-info singleton.
const SERVICE_INFO_ID: &str = "service-info";

/// SQL tuple of the finished states, used in state-write guards.
const FINISHED_STATES: &str = "('COMPLETE', 'EXECUTOR_ERROR', 'SYSTEM_ERROR', 'CANCELED')";

/// The column list selected for full run documents.
const RUN_COLUMNS: &str = "id, task_id, run_id, user_id, work_dir, request, attachments, \
                           wes_host, wes_base_path, wes_run_id, state, engine_log, task_logs, \
                           outputs, created_at";

/// SQLite run store.
#[derive(Debug, Clone)]
pub struct SqliteDatabase {
    /// The underlying SQLite connection pool.
    pool: SqlitePool,
}

impl SqliteDatabase {
    /// Creates a new SQLite store from a connection URL.
    ///
    /// Migrations are run upon a successful connection pool being
    /// established.
    pub async fn new(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("busy_timeout", SQLITE_BUSY_TIMEOUT)
            .pragma("foreign_keys", "on");

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Creates a new SQLite store from an existing pool.
    ///
    /// This method also runs the embedded migrations and checks the schema
    /// version recorded in the `metadata` table.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;

        let version: Option<String> =
            sqlx::query_scalar("select value from metadata where key = ?")
                .bind(VERSION_KEY)
                .fetch_optional(&pool)
                .await?;

        match version {
            None => {
                sqlx::query("insert into metadata (key, value) values (?, ?)")
                    .bind(VERSION_KEY)
                    .bind(EXPECTED_VERSION)
                    .execute(&pool)
                    .await?;
            }
            Some(ref v) if v == EXPECTED_VERSION => {}
            Some(v) => {
                return Err(DatabaseError::InvalidVersion {
                    expected: EXPECTED_VERSION.to_string(),
                    found: v,
                });
            }
        }

        Ok(Self { pool })
    }

    /// Gets the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Fetches a full run document by task identifier.
    async fn fetch_by_task_id(&self, task_id: &str) -> Result<Option<RunDocument>> {
        let row: Option<RunRow> =
            sqlx::query_as(&format!("select {RUN_COLUMNS} from runs where task_id = ?"))
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(RunDocument::try_from).transpose()
    }
}

/// A raw row of the `runs` table.
#[derive(Debug, FromRow)]
struct RunRow {
    /// Insertion-order cursor.
    #[allow(dead_code, reason = "selected for cursor-bearing queries")]
    id: i64,
    /// Task identifier.
    task_id: String,
    /// Gateway-minted run identifier.
    run_id: String,
    /// Owner identifier.
    user_id: Option<String>,
    /// Workspace directory.
    work_dir: String,
    /// JSON-encoded run request.
    request: String,
    /// JSON-encoded attachment list.
    attachments: String,
    /// Upstream host.
    wes_host: String,
    /// Upstream base path.
    wes_base_path: String,
    /// Upstream run identifier.
    wes_run_id: Option<String>,
    /// Current state.
    state: String,
    /// JSON-encoded engine log.
    engine_log: Option<String>,
    /// JSON-encoded task logs.
    task_logs: Option<String>,
    /// JSON-encoded outputs.
    outputs: Option<String>,
    /// Insertion timestamp.
    created_at: DateTime<Utc>,
}

impl TryFrom<RunRow> for RunDocument {
    type Error = DatabaseError;

    fn try_from(row: RunRow) -> Result<Self> {
        /// Decodes a JSON column, mapping failures to [`DatabaseError::Corrupt`].
        fn decode<T: serde::de::DeserializeOwned>(column: &str, value: &str) -> Result<T> {
            serde_json::from_str(value)
                .map_err(|e| DatabaseError::Corrupt(format!("column `{column}`: {e}")))
        }

        let request: RunRequest = decode("request", &row.request)?;
        let attachments: Vec<Attachment> = decode("attachments", &row.attachments)?;
        let state: State = row
            .state
            .parse()
            .map_err(|e: String| DatabaseError::Corrupt(e))?;
        let run_log = row
            .engine_log
            .as_deref()
            .map(|v| decode::<Log>("engine_log", v))
            .transpose()?;
        let task_logs = row
            .task_logs
            .as_deref()
            .map(|v| decode::<Vec<Log>>("task_logs", v))
            .transpose()?
            .unwrap_or_default();
        let outputs = row
            .outputs
            .as_deref()
            .map(|v| decode::<serde_json::Value>("outputs", v))
            .transpose()?;

        Ok(Self {
            task_id: row.task_id,
            user_id: row.user_id,
            work_dir: row.work_dir.into(),
            attachments,
            wes_endpoint: WesEndpoint {
                host: row.wes_host,
                base_path: row.wes_base_path,
                run_id: row.wes_run_id,
            },
            run_log: RunLog {
                run_id: row.run_id,
                request,
                state,
                run_log,
                task_logs,
                outputs,
            },
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn insert_run(&self, document: &RunDocument) -> Result<()> {
        let attachments = serde_json::to_string(&document.attachments)
            .map_err(|e| DatabaseError::Corrupt(e.to_string()))?;
        let request = serde_json::to_string(&document.run_log.request)
            .map_err(|e| DatabaseError::Corrupt(e.to_string()))?;

        let result = sqlx::query(
            "insert into runs (task_id, run_id, user_id, work_dir, request, attachments, \
             wes_host, wes_base_path, wes_run_id, state, created_at) values (?, ?, ?, ?, ?, ?, \
             ?, ?, ?, ?, ?)",
        )
        .bind(&document.task_id)
        .bind(&document.run_log.run_id)
        .bind(&document.user_id)
        .bind(document.work_dir.to_string_lossy().into_owned())
        .bind(request)
        .bind(attachments)
        .bind(&document.wes_endpoint.host)
        .bind(&document.wes_endpoint.base_path)
        .bind(&document.wes_endpoint.run_id)
        .bind(document.run_log.state.to_string())
        .bind(document.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(DatabaseError::Duplicate)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_run_by_run_id(&self, run_id: &str) -> Result<Option<RunDocument>> {
        let row: Option<RunRow> =
            sqlx::query_as(&format!("select {RUN_COLUMNS} from runs where run_id = ?"))
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(RunDocument::try_from).transpose()
    }

    async fn get_run_by_task_id(&self, task_id: &str) -> Result<Option<RunDocument>> {
        self.fetch_by_task_id(task_id).await
    }

    async fn update_run_state(&self, task_id: &str, state: State) -> Result<bool> {
        let result = sqlx::query(&format!(
            "update runs set state = ? where task_id = ? and state not in {FINISHED_STATES}"
        ))
        .bind(state.to_string())
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_remote_run_id(
        &self,
        task_id: &str,
        run_id: &str,
    ) -> Result<Option<RunDocument>> {
        let result = sqlx::query("update runs set wes_run_id = ? where task_id = ?")
            .bind(run_id)
            .bind(task_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        self.fetch_by_task_id(task_id).await
    }

    async fn merge_run_log(
        &self,
        task_id: &str,
        patch: &RunLogPatch,
    ) -> Result<Option<RunDocument>> {
        /// Encodes an optional patch field as an optional JSON string.
        fn encode<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>> {
            value
                .as_ref()
                .map(|v| {
                    serde_json::to_string(v).map_err(|e| DatabaseError::Corrupt(e.to_string()))
                })
                .transpose()
        }

        let result = sqlx::query(&format!(
            "update runs set \
             state = case when ?2 is not null and state not in {FINISHED_STATES} \
             then ?2 else state end, \
             engine_log = coalesce(?3, engine_log), \
             task_logs = coalesce(?4, task_logs), \
             outputs = coalesce(?5, outputs) \
             where task_id = ?1"
        ))
        .bind(task_id)
        .bind(patch.state.map(|s| s.to_string()))
        .bind(encode(&patch.run_log)?)
        .bind(encode(&patch.task_logs)?)
        .bind(encode(&patch.outputs)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        self.fetch_by_task_id(task_id).await
    }

    async fn list_runs(
        &self,
        user_id: Option<&str>,
        before: Option<i64>,
        limit: i64,
    ) -> Result<Vec<RunPageEntry>> {
        let rows: Vec<(i64, String, String)> = sqlx::query_as(
            "select id, run_id, state from runs \
             where (?1 is null or user_id = ?1) and (?2 is null or id < ?2) \
             order by id desc limit ?3",
        )
        .bind(user_id)
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(cursor, run_id, state)| {
                Ok(RunPageEntry {
                    cursor,
                    run_id,
                    state: state.parse().map_err(DatabaseError::Corrupt)?,
                })
            })
            .collect()
    }

    async fn count_runs_by_state(&self) -> Result<Vec<(State, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("select state, count(*) from runs group by state")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(state, count)| Ok((state.parse().map_err(DatabaseError::Corrupt)?, count)))
            .collect()
    }

    async fn list_unfinished_runs(&self) -> Result<Vec<RunDocument>> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            "select {RUN_COLUMNS} from runs where state not in {FINISHED_STATES} order by id"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RunDocument::try_from).collect()
    }

    async fn get_service_info(&self) -> Result<Option<ServiceInfoDocument>> {
        let document: Option<String> =
            sqlx::query_scalar("select document from service_info where id = ?")
                .bind(SERVICE_INFO_ID)
                .fetch_optional(&self.pool)
                .await?;

        document
            .map(|d| {
                serde_json::from_str(&d).map_err(|e| DatabaseError::Corrupt(e.to_string()))
            })
            .transpose()
    }

    async fn set_service_info(&self, document: &ServiceInfoDocument) -> Result<()> {
        let encoded = serde_json::to_string(document)
            .map_err(|e| DatabaseError::Corrupt(e.to_string()))?;

        sqlx::query(
            "insert into service_info (id, document, updated_at) values (?, ?, \
             current_timestamp) on conflict (id) do update set document = excluded.document, \
             updated_at = current_timestamp",
        )
        .bind(SERVICE_INFO_ID)
        .bind(encoded)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
