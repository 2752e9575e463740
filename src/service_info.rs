//! Controllers for the `/service-info` routes.

use std::collections::BTreeMap;

use tracing::info;

use crate::config::Config;
use crate::db::Database;
use crate::db::DatabaseError;
use crate::model::ServiceInfo;
use crate::model::ServiceInfoDocument;
use crate::model::State;

/// Error type for service-info operations.
#[derive(Debug, thiserror::Error)]
pub enum ServiceInfoError {
    /// A store error.
    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// The service-info singleton has never been set.
    #[error("service info has not been set")]
    NotSet,
}

/// Returns the stored service descriptor augmented with live per-state run
/// counts.
///
/// Every defined state appears in the counts, including states with no runs.
pub async fn get_service_info(db: &dyn Database) -> Result<ServiceInfo, ServiceInfoError> {
    let document = db
        .get_service_info()
        .await?
        .ok_or(ServiceInfoError::NotSet)?;

    let mut system_state_counts: BTreeMap<String, i64> = State::ALL
        .iter()
        .map(|state| (state.to_string(), 0))
        .collect();
    for (state, count) in db.count_runs_by_state().await? {
        system_state_counts.insert(state.to_string(), count);
    }

    Ok(ServiceInfo {
        document,
        system_state_counts,
    })
}

/// Replaces (or inserts) the service descriptor.
pub async fn set_service_info(
    db: &dyn Database,
    document: &ServiceInfoDocument,
) -> Result<(), ServiceInfoError> {
    db.set_service_info(document).await?;
    Ok(())
}

/// Registers the configured service descriptor at startup.
///
/// The singleton is only written when it is absent or differs from the
/// configured descriptor.
pub async fn register_from_config(
    db: &dyn Database,
    config: &Config,
) -> Result<(), ServiceInfoError> {
    let Some(document) = &config.service_info else {
        return Ok(());
    };

    match db.get_service_info().await? {
        Some(existing) if existing == *document => {
            info!("using available service info");
        }
        _ => {
            db.set_service_info(document).await?;
            info!("service info registered");
        }
    }

    Ok(())
}
