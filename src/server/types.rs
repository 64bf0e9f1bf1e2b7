use axum::extract::multipart::MultipartError;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::DataslotError;
use crate::registry::DatasetSummary;
use crate::storage::ChunkRequest;

/// Failures surfaced by HTTP handlers.
#[derive(Debug, Error)]
pub enum AppError {
    /// Registry, storage, or query failure.
    #[error(transparent)]
    Dataslot(#[from] DataslotError),
    /// The multipart body could not be read.
    #[error("invalid upload body: {0}")]
    Multipart(#[from] MultipartError),
    /// The multipart body had no `file` part.
    #[error("upload is missing the 'file' field")]
    MissingFile,
    /// A JSON request body did not match the endpoint's shape.
    #[error("invalid request body: {rejection}")]
    BadBody {
        /// Code reported by the endpoint.
        code: &'static str,
        /// Extractor failure.
        rejection: JsonRejection,
    },
    /// A blocking worker panicked or was cancelled.
    #[error("internal task failure: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl AppError {
    /// Body rejection on the raw SQL endpoint.
    pub(crate) fn sql_body(rejection: JsonRejection) -> Self {
        AppError::BadBody {
            code: "BAD_SQL",
            rejection,
        }
    }

    /// Body rejection on the pipeline endpoint.
    pub(crate) fn ops_body(rejection: JsonRejection) -> Self {
        AppError::BadBody {
            code: "OPS_VALIDATION_ERROR",
            rejection,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AppError::Dataslot(err) => err.code(),
            AppError::Multipart(err) if err.status() == StatusCode::PAYLOAD_TOO_LARGE => {
                "FILE_TOO_LARGE"
            }
            AppError::Multipart(_) | AppError::MissingFile => "BAD_UPLOAD",
            AppError::BadBody { code, .. } => *code,
            AppError::Join(_) => "INTERNAL",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Dataslot(err) => {
                StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            AppError::Multipart(err) => err.status(),
            AppError::MissingFile | AppError::BadBody { .. } => StatusCode::BAD_REQUEST,
            AppError::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        if status.is_server_error() {
            tracing::error!(code, err = %self, "server.request.failed");
        } else {
            tracing::debug!(code, err = %self, "server.request.rejected");
        }
        let body = Json(ErrorEnvelope {
            detail: ErrorPayload {
                code,
                detail: self.to_string(),
            },
        });
        (status, body).into_response()
    }
}

/// `{"detail": {"code", "detail"}}` error body.
#[derive(Debug, Serialize)]
pub(crate) struct ErrorEnvelope {
    pub(crate) detail: ErrorPayload,
}

#[derive(Debug, Serialize)]
pub(crate) struct ErrorPayload {
    pub(crate) code: &'static str,
    pub(crate) detail: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub(crate) status: &'static str,
}

#[derive(Debug, Serialize)]
pub(crate) struct CurrentResponse {
    pub(crate) datasets: Vec<DatasetSummary>,
}

#[derive(Debug, Serialize)]
pub(crate) struct RemoveResponse {
    pub(crate) ok: bool,
    pub(crate) slot_count: usize,
}

/// Query string of `GET /multifile/chunk`. Kept flat so numbers parse from
/// the query string.
#[derive(Debug, Deserialize)]
pub(crate) struct ChunkParams {
    pub(crate) dataset_id: String,
    #[serde(default)]
    pub(crate) row_start: Option<i64>,
    #[serde(default)]
    pub(crate) col_start: Option<i64>,
    #[serde(default)]
    pub(crate) n_rows: Option<i64>,
    #[serde(default)]
    pub(crate) n_cols: Option<i64>,
}

impl ChunkParams {
    pub(crate) fn request(&self) -> ChunkRequest {
        let defaults = ChunkRequest::default();
        ChunkRequest {
            row_start: self.row_start.unwrap_or(defaults.row_start),
            col_start: self.col_start.unwrap_or(defaults.col_start),
            n_rows: self.n_rows.unwrap_or(defaults.n_rows),
            n_cols: self.n_cols.unwrap_or(defaults.n_cols),
        }
    }
}
