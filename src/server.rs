//! REST API server exposing the WES proxy surface.

mod api;
pub mod router;

pub use api::AppState;
pub use api::error::ErrorResponse;
pub use router::create_router;
pub use router::run;
