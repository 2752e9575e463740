//! The run store: schema, operations, and the task-scoped connector.

use async_trait::async_trait;

use crate::model::RunDocument;
use crate::model::RunLogPatch;
use crate::model::ServiceInfoDocument;
use crate::model::State;

pub mod connector;
pub mod sqlite;

pub use connector::ConnectorError;
pub use connector::RunConnector;
pub use sqlite::SqliteDatabase;

/// Store errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// A database error.
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    /// A migration error.
    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// An insert violated a uniqueness constraint.
    #[error("a run with the same identifier already exists")]
    Duplicate,

    /// A stored document does not conform to the schema.
    #[error("stored document does not conform to schema: {0}")]
    Corrupt(String),

    /// Invalid store schema version.
    #[error("invalid store schema version: expected `{expected}`, found `{found}`")]
    InvalidVersion {
        /// Expected version.
        expected: String,
        /// Found version.
        found: String,
    },
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, DatabaseError>;

/// A single entry of a run listing page.
#[derive(Debug, Clone)]
pub struct RunPageEntry {
    /// The internal insertion-order cursor of the document.
    pub cursor: i64,
    /// The run identifier minted by this gateway.
    pub run_id: String,
    /// The current state of the run.
    pub state: State,
}

/// The run store.
///
/// Mutations are keyed on `task_id` and use atomic single-statement updates,
/// so concurrent writers on disjoint fields do not lose writes. State writes
/// are refused once a run has reached a finished state.
#[async_trait]
pub trait Database: Send + Sync {
    /// Inserts a new run document.
    ///
    /// Fails with [`DatabaseError::Duplicate`] if the document's `task_id` or
    /// `run_log.run_id` collides with an existing document.
    async fn insert_run(&self, document: &RunDocument) -> Result<()>;

    /// Gets a run document by its gateway-minted run identifier.
    async fn get_run_by_run_id(&self, run_id: &str) -> Result<Option<RunDocument>>;

    /// Gets a run document by its task identifier.
    async fn get_run_by_task_id(&self, task_id: &str) -> Result<Option<RunDocument>>;

    /// Sets the run state, provided the current state is not finished.
    ///
    /// Returns `true` if the write was applied; `false` if the document does
    /// not exist or is already in a finished state.
    async fn update_run_state(&self, task_id: &str, state: State) -> Result<bool>;

    /// Records the remote run identifier assigned by the upstream engine and
    /// returns the post-update document.
    async fn set_remote_run_id(&self, task_id: &str, run_id: &str)
    -> Result<Option<RunDocument>>;

    /// Applies a partial run-log update and returns the post-update document.
    ///
    /// Absent patch fields leave the stored fields untouched. A state carried
    /// in the patch is subject to the same finished-state guard as
    /// [`update_run_state`][Self::update_run_state].
    async fn merge_run_log(
        &self,
        task_id: &str,
        patch: &RunLogPatch,
    ) -> Result<Option<RunDocument>>;

    /// Lists runs in descending insertion order.
    ///
    /// `before` restricts the page to documents with an internal cursor
    /// strictly less than the given one; `user_id` restricts it to runs owned
    /// by that user.
    async fn list_runs(
        &self,
        user_id: Option<&str>,
        before: Option<i64>,
        limit: i64,
    ) -> Result<Vec<RunPageEntry>>;

    /// Counts runs per state. States with no runs are absent from the result.
    async fn count_runs_by_state(&self) -> Result<Vec<(State, i64)>>;

    /// Lists every run whose state is not finished.
    async fn list_unfinished_runs(&self) -> Result<Vec<RunDocument>>;

    /// Reads the service-info singleton, if it has ever been set.
    async fn get_service_info(&self) -> Result<Option<ServiceInfoDocument>>;

    /// Replaces (or inserts) the service-info singleton.
    async fn set_service_info(&self, document: &ServiceInfoDocument) -> Result<()>;
}
