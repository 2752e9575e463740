//! API state and handlers.

use std::sync::Arc;

use crate::config::Config;
use crate::db::Database;
use crate::tracker::TrackerHandle;
use crate::wes::EndpointSelector;

pub mod context;
pub mod error;
pub mod runs;
pub mod service_info;

/// Application state shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    /// The gateway configuration.
    pub config: Arc<Config>,
    /// The run store.
    pub db: Arc<dyn Database>,
    /// The upstream endpoint selector.
    pub selector: Arc<dyn EndpointSelector>,
    /// A handle to the background tracker service.
    pub tracker: TrackerHandle,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}
