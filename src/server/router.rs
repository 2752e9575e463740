//! Server setup and routing.

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use axum::routing::post;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use super::api::AppState;
use super::api::runs::*;
use super::api::service_info::*;
use crate::config::Config;
use crate::db::Database;
use crate::db::SqliteDatabase;
use crate::service_info;
use crate::tracker::TrackerSvc;
use crate::tracker::recover;
use crate::wes::ConfiguredEndpoint;
use crate::wes::EndpointSelector;

/// OpenAPI documentation.
#[derive(OpenApi)]
#[openapi(
    paths(
        submit_run,
        list_runs,
        get_run_log,
        get_run_status,
        cancel_run,
        get_service_info,
        post_service_info,
    ),
    components(schemas(
        crate::model::RunId,
        crate::model::RunStatus,
        crate::model::RunListResponse,
        crate::model::RunLog,
        crate::model::RunRequest,
        crate::model::Log,
        crate::model::State,
        crate::model::ServiceInfo,
        crate::model::ServiceInfoDocument,
        crate::model::WorkflowTypeVersion,
        super::api::runs::ListRunsQueryParams,
    )),
    tags(
        (name = "runs", description = "Workflow run endpoints"),
        (name = "service-info", description = "Service descriptor endpoints")
    )
)]
struct ApiDoc;

/// Creates the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route(
            "/service-info",
            get(get_service_info).post(post_service_info),
        )
        .route("/runs", post(submit_run).get(list_runs))
        .route("/runs/{run_id}", get(get_run_log))
        .route("/runs/{run_id}/status", get(get_run_status))
        .route("/runs/{run_id}/cancel", post(cancel_run))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Runs the server.
///
/// # Errors
///
/// Returns an error if the configuration is invalid, the store cannot be
/// opened, or the server fails to bind to the address.
pub async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;

    let db = SqliteDatabase::new(&config.database.url, config.database.max_connections).await?;
    let db: Arc<dyn Database> = Arc::new(db);

    // The workspace root must exist before runs can be admitted.
    tokio::fs::create_dir_all(&config.post_runs.storage_path).await?;

    service_info::register_from_config(db.as_ref(), &config).await?;

    let (_, tracker) =
        TrackerSvc::spawn(config.post_runs.clone(), config.defaults.clone(), db.clone());
    let resumed = recover(&db, &tracker).await?;
    if resumed > 0 {
        info!("resumed {} tracker(s) for in-flight runs", resumed);
    }

    let selector: Arc<dyn EndpointSelector> = Arc::new(ConfiguredEndpoint {
        host: config.wes.host.clone(),
        base_path: config.wes.base_path.clone(),
    });

    let addr = format!("{}:{}", config.server.host, config.server.port);

    let state = AppState {
        config: Arc::new(config),
        db,
        selector,
        tracker,
    };
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("server listening on `{}`", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
