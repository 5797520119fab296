use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use guildnet_common::response::err_resp;

/// The process-wide error taxonomy. Every component returns one of these
/// kinds; component boundaries preserve the kind and wrap the message with
/// the operation name rather than inventing a new kind.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("validation failed: {0:?}")]
    ValidationFailed(Vec<String>),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("canceled")]
    Canceled,

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sled(#[from] sled::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Error::ValidationFailed(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Unreachable(_) => StatusCode::BAD_GATEWAY,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            Error::Canceled => StatusCode::from_u16(499).unwrap(),
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Kube(e) => match e {
                kube::Error::Api(ae) if ae.code == 404 => StatusCode::NOT_FOUND,
                kube::Error::Api(ae) if ae.code == 409 => StatusCode::CONFLICT,
                kube::Error::Api(ae) if ae.code == 401 || ae.code == 403 => {
                    StatusCode::UNAUTHORIZED
                }
                _ => StatusCode::BAD_GATEWAY,
            },
            Error::Postgres(_) => StatusCode::BAD_GATEWAY,
            Error::Reqwest(_) => StatusCode::BAD_GATEWAY,
            Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::Sled(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Canceled is not logged as an error; every other kind is.
    pub fn log(&self, correlation_id: &str) {
        if matches!(self, Error::Canceled) {
            tracing::debug!(correlation_id, "request canceled");
            return;
        }
        tracing::error!(correlation_id, error = %self, "request failed");
    }

    /// Wrap a lower error with the name of the operation that observed it,
    /// preserving its kind.
    pub fn wrap(self, operation: &str) -> Error {
        match self {
            Error::NotFound(m) => Error::NotFound(format!("{operation}: {m}")),
            Error::Conflict(m) => Error::Conflict(format!("{operation}: {m}")),
            Error::PermissionDenied(m) => Error::PermissionDenied(format!("{operation}: {m}")),
            Error::Unauthorized(m) => Error::Unauthorized(format!("{operation}: {m}")),
            Error::Unreachable(m) => Error::Unreachable(format!("{operation}: {m}")),
            Error::Timeout(m) => Error::Timeout(format!("{operation}: {m}")),
            Error::Upstream(m) => Error::Upstream(format!("{operation}: {m}")),
            Error::Internal(m) => Error::Internal(format!("{operation}: {m}")),
            other => other,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        err_resp(self, status)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
