//! 统一的错误类型：服务端 API 错误与客户端上传错误。

use axum::Json;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::io::ErrorKind;

use crate::protocol::ChunkResponse;
use crate::storage::StorageError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    PayloadTooLarge(String),
    Internal(String),
    TooManyRequests(u64),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::BadRequest(msg)
            | ApiError::NotFound(msg)
            | ApiError::Conflict(msg)
            | ApiError::PayloadTooLarge(msg)
            | ApiError::Internal(msg) => msg.clone(),
            ApiError::TooManyRequests(_) => "Too many concurrent uploads.".into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ChunkResponse::rejected(self.message()));
        let mut headers = HeaderMap::new();
        if let ApiError::TooManyRequests(retry_after) = self
            && retry_after > 0
            && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert(header::RETRY_AFTER, value);
        }
        (status, headers, body).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidPath => ApiError::BadRequest("Invalid path.".into()),
            StorageError::Io(err) => match err.kind() {
                ErrorKind::NotFound => ApiError::NotFound(err.to_string()),
                _ => ApiError::Internal(err.to_string()),
            },
        }
    }
}

/// 单个分片或单个文件传输的失败原因。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    /// 网络或超时错误，不自动重试。
    #[error("transport error: {0}")]
    Transport(String),

    /// 服务端业务拒绝，原文透出。
    #[error("{0}")]
    ServerRejection(String),

    #[error("upload canceled")]
    Canceled,

    #[error("server accepted the final chunk without confirming assembly")]
    IncompleteAssembly,

    #[error("failed to read source file: {0}")]
    Source(String),
}

impl From<reqwest::Error> for TransferError {
    fn from(err: reqwest::Error) -> Self {
        TransferError::Transport(err.to_string())
    }
}

/// 入队被拒绝的原因；被拒绝时不会创建任何任务。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionRejected {
    #[error("cannot track more than {max} uploads at once")]
    TooManyFiles { max: usize },

    #[error("cannot upload more than {max} files in one batch")]
    TooManyFilesInBatch { max: usize },

    #[error("no files to upload")]
    EmptyBatch,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("upload {0} already has a live cancellation handle")]
    AlreadyRegistered(String),
}
