use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found")]
    NotFound,

    /// Client state conflict: duplicate submission, disallowed status
    /// transition, protocol call outside its valid state.
    #[error("{0}")]
    Request(String),

    /// Malformed input: missing required fields, invalid values.
    #[error("{0}")]
    BadRequest(String),

    /// Body rejected before reaching a handler (bad content type, invalid
    /// JSON, unknown fields, oversized payload). Keeps the rejection's own
    /// status code so the caller sees which rule was violated.
    #[error("{message}")]
    Rejection { status: StatusCode, message: String },

    #[error("no gpu capacity: requested {requested}, available {available}")]
    NoCapacity { requested: usize, available: usize },

    #[error("no free port in pool")]
    ZeroFreePort,

    /// The job's container exited with a non-zero code. Distinct from
    /// infrastructure failures so the termination reason can tell "the job
    /// failed" apart from "the platform failed to run the job".
    #[error("container exited with code {code}")]
    ContainerExited { code: i64 },

    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::Request(_) => StatusCode::CONFLICT,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Rejection { status, .. } => *status,
            Error::NoCapacity { .. } | Error::ZeroFreePort => StatusCode::CONFLICT,
            Error::ContainerExited { .. } | Error::Docker(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
            // Full detail stays server-side.
            (status, Json(json!({ "error": "internal error" }))).into_response()
        } else {
            (status, Json(json!({ "error": self.to_string() }))).into_response()
        }
    }
}

/// Unwraps a JSON body extraction, converting the axum rejection into the
/// crate error so both APIs report malformed bodies the same way.
pub fn json_body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    match payload {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => Err(Error::Rejection {
            status: rejection.status(),
            message: rejection.body_text(),
        }),
    }
}
