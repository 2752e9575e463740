//! API error types and their HTTP mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use serde::Serialize;

use crate::db::DatabaseError;
use crate::runs::CancelRunError;
use crate::runs::GetRunError;
use crate::runs::ListRunsError;
use crate::runs::SubmitRunError;
use crate::service_info::ServiceInfoError;
use crate::wes::WesClientError;

/// The internal server error message.
///
/// This is intentionally vague to discourage leaking information.
const INTERNAL_ERROR_MESSAGE: &str =
    "an internal server error occurred; contact the system administrator for more information";

/// An API error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error kind.
    pub kind: String,
    /// Error message.
    pub message: String,
}

/// An API error type.
#[derive(Debug)]
pub enum Error {
    /// The request is malformed (`400`).
    BadRequest(String),

    /// No suitable workflow engine is known for the request (`400`).
    NoSuitableEngine(String),

    /// The request is unauthorized, as reported by the upstream engine
    /// (`401`).
    Unauthorized(String),

    /// The requester is not allowed to access the resource (`403`).
    Forbidden(String),

    /// The requested resource was not found (`404`).
    NotFound(String),

    /// No unique run identifier could be found (`500`).
    IdsUnavailable(String),

    /// The workspace storage is missing or unwritable (`500`).
    StorageUnavailable(String),

    /// The upstream engine could not be reached (`500`).
    EngineUnavailable(String),

    /// The upstream engine is reachable but misbehaving (`500`).
    EngineProblem(String),

    /// An unspecified internal error (`500`).
    Internal,
}

impl From<WesClientError> for Error {
    fn from(err: WesClientError) -> Self {
        match err {
            WesClientError::EngineUnavailable(_) => Self::EngineUnavailable(err.to_string()),
            WesClientError::Upstream(ref response) => {
                let message = response
                    .msg
                    .clone()
                    .unwrap_or_else(|| err.to_string());
                match response.status_code {
                    400 => Self::BadRequest(message),
                    401 => Self::Unauthorized(message),
                    403 => Self::Forbidden(message),
                    _ => Self::EngineProblem(message),
                }
            }
            WesClientError::InvalidResponse(_) => {
                Self::EngineProblem(String::from("received an invalid upstream response"))
            }
            WesClientError::Attachment { .. } => Self::StorageUnavailable(err.to_string()),
        }
    }
}

impl From<DatabaseError> for Error {
    fn from(_err: DatabaseError) -> Self {
        Self::Internal
    }
}

impl From<SubmitRunError> for Error {
    fn from(err: SubmitRunError) -> Self {
        match err {
            SubmitRunError::Request(e) => Self::BadRequest(e.to_string()),
            SubmitRunError::NoSuitableEngine { .. } => Self::NoSuitableEngine(err.to_string()),
            SubmitRunError::StorageUnavailable { .. } => {
                Self::StorageUnavailable(err.to_string())
            }
            SubmitRunError::IdsUnavailable(_) => Self::IdsUnavailable(err.to_string()),
            SubmitRunError::Database(_) => Self::Internal,
            SubmitRunError::Connector(_) => Self::Internal,
            SubmitRunError::Engine(e) => e.into(),
            SubmitRunError::TrackerUnavailable => Self::Internal,
        }
    }
}

impl From<GetRunError> for Error {
    fn from(err: GetRunError) -> Self {
        match err {
            GetRunError::Database(_) => Self::Internal,
            GetRunError::NotFound(_) => Self::NotFound(err.to_string()),
            GetRunError::Forbidden(_) => Self::Forbidden(err.to_string()),
        }
    }
}

impl From<ListRunsError> for Error {
    fn from(err: ListRunsError) -> Self {
        match err {
            ListRunsError::Database(_) => Self::Internal,
            ListRunsError::InvalidPageToken(_) | ListRunsError::InvalidPageSize => {
                Self::BadRequest(err.to_string())
            }
        }
    }
}

impl From<CancelRunError> for Error {
    fn from(err: CancelRunError) -> Self {
        match err {
            CancelRunError::Database(_) => Self::Internal,
            CancelRunError::NotFound(_) => Self::NotFound(err.to_string()),
            CancelRunError::Forbidden(_) => Self::Forbidden(err.to_string()),
            CancelRunError::MissingRemoteRunId(_) => Self::EngineProblem(err.to_string()),
            CancelRunError::Engine(e) => e.into(),
        }
    }
}

impl From<ServiceInfoError> for Error {
    fn from(err: ServiceInfoError) -> Self {
        match err {
            ServiceInfoError::Database(_) => Self::Internal,
            ServiceInfoError::NotSet => Self::NotFound(err.to_string()),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BadRequest", msg),
            Self::NoSuitableEngine(msg) => (StatusCode::BAD_REQUEST, "NoSuitableEngine", msg),
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "Unauthorized", msg),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, "Forbidden", msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "NotFound", msg),
            Self::IdsUnavailable(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "IdsUnavailable", msg)
            }
            Self::StorageUnavailable(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "StorageUnavailable", msg)
            }
            Self::EngineUnavailable(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "EngineUnavailable", msg)
            }
            Self::EngineProblem(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "EngineProblem", msg)
            }
            Self::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal",
                String::from(INTERNAL_ERROR_MESSAGE),
            ),
        };

        let body = Json(ErrorResponse {
            kind: kind.to_string(),
            message,
        });

        (status, body).into_response()
    }
}
