//! A store connector scoped to a single run document.

use std::sync::Arc;

use tracing::info;
use tracing::warn;

use super::Database;
use super::DatabaseError;
use crate::model::RunDocument;
use crate::model::RunLogPatch;
use crate::model::State;

/// Errors produced by the task-scoped connector.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// A store error.
    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// No document exists for the connector's task.
    #[error("no run document for task `{0}`")]
    DocumentMissing(String),
}

/// A connector bound to the run document of a single task.
///
/// All mutations for a given run flow through one connector instance; the
/// underlying operations are atomic single-statement updates keyed on the
/// task identifier, so concurrent partial updates on disjoint fields do not
/// lose writes.
#[derive(Clone)]
pub struct RunConnector {
    /// The run store.
    db: Arc<dyn Database>,
    /// The task this connector is bound to.
    task_id: String,
}

impl RunConnector {
    /// Creates a connector bound to the given task.
    pub fn new(db: Arc<dyn Database>, task_id: impl Into<String>) -> Self {
        Self {
            db,
            task_id: task_id.into(),
        }
    }

    /// The task identifier this connector is bound to.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Fetches the document associated with the task.
    pub async fn document(&self) -> Result<RunDocument, ConnectorError> {
        self.db
            .get_run_by_task_id(&self.task_id)
            .await?
            .ok_or_else(|| ConnectorError::DocumentMissing(self.task_id.clone()))
    }

    /// Sets the run state.
    ///
    /// The write is refused by the store once the run has reached a finished
    /// state; a refused write is not an error here, since trackers may race
    /// a synchronously recorded terminal state.
    pub async fn update_run_state(&self, state: State) -> Result<(), ConnectorError> {
        if self.db.update_run_state(&self.task_id, state).await? {
            info!("[{}] {}", self.task_id, state);
        } else {
            warn!("[{}] state write to {} refused", self.task_id, state);
        }
        Ok(())
    }

    /// Records the remote run identifier and returns the updated document.
    pub async fn set_remote_run_id(
        &self,
        run_id: &str,
    ) -> Result<RunDocument, ConnectorError> {
        self.db
            .set_remote_run_id(&self.task_id, run_id)
            .await?
            .ok_or_else(|| ConnectorError::DocumentMissing(self.task_id.clone()))
    }

    /// Applies a partial run-log update and returns the updated document.
    pub async fn merge_run_log(
        &self,
        patch: &RunLogPatch,
    ) -> Result<RunDocument, ConnectorError> {
        self.db
            .merge_run_log(&self.task_id, patch)
            .await?
            .ok_or_else(|| ConnectorError::DocumentMissing(self.task_id.clone()))
    }
}

impl std::fmt::Debug for RunConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunConnector")
            .field("task_id", &self.task_id)
            .finish_non_exhaustive()
    }
}
