use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use study_rag::RagError;
use thiserror::Error;
use tracing::error;

/// Error body returned by every JSON endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    pub error_code: &'static str,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Rag(#[from] RagError),

    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Rag(e) => match e {
                RagError::AccessDenied { .. } | RagError::StudyAccessDenied { .. } => {
                    StatusCode::FORBIDDEN
                }
                RagError::NotFound(_) => StatusCode::NOT_FOUND,
                RagError::InvalidQuery(_)
                | RagError::MissingScope(_)
                | RagError::ChunkingError(_) => StatusCode::BAD_REQUEST,
                e if e.is_transient() => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "INVALID_INPUT",
            ApiError::Rag(e) => match e {
                RagError::AccessDenied { .. } | RagError::StudyAccessDenied { .. } => {
                    "ACCESS_DENIED"
                }
                RagError::NotFound(_) => "NOT_FOUND",
                RagError::InvalidQuery(_) => "INVALID_QUERY",
                RagError::MissingScope(_) => "MISSING_SCOPE",
                RagError::ChunkingError(_) => "INVALID_DOCUMENT",
                RagError::EmbeddingError { .. } => "EMBEDDING_UNAVAILABLE",
                RagError::ChunkStoreError { .. } => "STORE_UNAVAILABLE",
                RagError::Cancelled => "CANCELLED",
                _ => "INTERNAL_ERROR",
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "request failed");
        }
        let body = ErrorBody { error: self.to_string(), error_code: self.error_code() };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_error_kind() {
        let denied: ApiError =
            RagError::AccessDenied { study_id: "s".into(), document_ids: vec!["d".into()] }.into();
        assert_eq!(denied.status_code(), StatusCode::FORBIDDEN);

        let foreign: ApiError =
            RagError::StudyAccessDenied { user_id: "u".into(), study_id: "s".into() }.into();
        assert_eq!(foreign.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(foreign.error_code(), "ACCESS_DENIED");

        let upstream: ApiError =
            RagError::EmbeddingError { provider: "mock".into(), message: "503".into() }.into();
        assert_eq!(upstream.status_code(), StatusCode::BAD_GATEWAY);

        assert_eq!(
            ApiError::from(RagError::MissingScope("study".into())).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(RagError::NotFound("tool".into())).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(RagError::CodecError("bad".into())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
