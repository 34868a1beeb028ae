use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use common::storage::StorageError;
use sea_orm::{DbErr, TransactionError};
use serde::Serialize;
use serde_json::{Value, json};

use crate::database::Transient;

/// Error payload inside the failure envelope.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorBody {
    /// Machine-readable error code, e.g. `FILE_NOT_FOUND`, `VALIDATION_FAILED`,
    /// `USER_NOT_APPROVED`, `JOB_NOT_COMPLETED`, `STORAGE_ERROR`.
    #[schema(example = "FILE_NOT_FOUND")]
    pub code: &'static str,
    /// Human-readable error description.
    #[schema(example = "File not found")]
    pub message: String,
    /// Structured context, present for some codes.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub details: Option<Value>,
}

/// Failure envelope returned by all endpoints.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorEnvelope {
    #[schema(example = false)]
    pub success: bool,
    pub error: ErrorBody,
}

/// Application-level error type.
#[derive(Debug)]
pub enum AppError {
    // auth
    Unauthorized,
    GatewayHeaderMissing,
    UserNotRegistered,
    UserNotApproved,
    UserSuspended,
    InsufficientPermissions,
    TokenInvalid,

    // validation
    InvalidRequest(String),
    Validation(String),
    MissingParameter(&'static str),
    InvalidFileType(String),
    FileSizeExceeded { limit: u64 },
    InvalidPath(String),

    // resources
    FileNotFound,
    CategoryNotFound,
    JobNotFound,
    UserNotFound,
    RegistrationNotFound,
    ShareNotFound,
    UploadSessionNotFound,

    // state
    CategoryInUse,
    CategoryExists,
    JobNotCompleted { status: String, progress: i32 },
    DownloadExpired,
    RegistrationExists,
    UserExists,
    NameConflict(String),
    FileDeleted,
    ShareExpired,
    UploadSessionClosed(String),
    ChunkConflict(String),
    IncompleteUpload { missing: Vec<i32> },
    DigestMismatch { expected: String, actual: String },

    // systemic
    Database(DbErr),
    Storage(String),
    Internal(String),
    ServiceUnavailable(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Unauthorized => "UNAUTHORIZED",
            AppError::GatewayHeaderMissing => "CF_ACCESS_HEADER_MISSING",
            AppError::UserNotRegistered => "USER_NOT_REGISTERED",
            AppError::UserNotApproved => "USER_NOT_APPROVED",
            AppError::UserSuspended => "USER_SUSPENDED",
            AppError::InsufficientPermissions => "INSUFFICIENT_PERMISSIONS",
            AppError::TokenInvalid => "TOKEN_INVALID",
            AppError::InvalidRequest(_) => "INVALID_REQUEST",
            AppError::Validation(_) => "VALIDATION_FAILED",
            AppError::MissingParameter(_) => "MISSING_PARAMETER",
            AppError::InvalidFileType(_) => "INVALID_FILE_TYPE",
            AppError::FileSizeExceeded { .. } => "FILE_SIZE_EXCEEDED",
            AppError::InvalidPath(_) => "INVALID_PATH",
            AppError::FileNotFound => "FILE_NOT_FOUND",
            AppError::CategoryNotFound => "CATEGORY_NOT_FOUND",
            AppError::JobNotFound => "JOB_NOT_FOUND",
            AppError::UserNotFound => "USER_NOT_FOUND",
            AppError::RegistrationNotFound => "REGISTRATION_NOT_FOUND",
            AppError::ShareNotFound => "SHARE_NOT_FOUND",
            AppError::UploadSessionNotFound => "UPLOAD_SESSION_NOT_FOUND",
            AppError::CategoryInUse => "CATEGORY_IN_USE",
            AppError::CategoryExists => "CATEGORY_EXISTS",
            AppError::JobNotCompleted { .. } => "JOB_NOT_COMPLETED",
            AppError::DownloadExpired => "DOWNLOAD_EXPIRED",
            AppError::RegistrationExists => "REGISTRATION_EXISTS",
            AppError::UserExists => "USER_EXISTS",
            AppError::NameConflict(_) => "NAME_CONFLICT",
            AppError::FileDeleted => "FILE_DELETED",
            AppError::ShareExpired => "SHARE_EXPIRED",
            AppError::UploadSessionClosed(_) => "UPLOAD_SESSION_CLOSED",
            AppError::ChunkConflict(_) => "CHUNK_CONFLICT",
            AppError::IncompleteUpload { .. } => "INCOMPLETE_UPLOAD",
            AppError::DigestMismatch { .. } => "DIGEST_MISMATCH",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Storage(_) => "STORAGE_ERROR",
            AppError::Internal(_) => "INTERNAL_SERVER_ERROR",
            AppError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized
            | AppError::GatewayHeaderMissing
            | AppError::UserNotRegistered
            | AppError::TokenInvalid => StatusCode::UNAUTHORIZED,
            AppError::UserNotApproved
            | AppError::UserSuspended
            | AppError::InsufficientPermissions => StatusCode::FORBIDDEN,
            AppError::InvalidRequest(_)
            | AppError::Validation(_)
            | AppError::MissingParameter(_)
            | AppError::InvalidFileType(_)
            | AppError::InvalidPath(_) => StatusCode::BAD_REQUEST,
            AppError::FileSizeExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::FileNotFound
            | AppError::CategoryNotFound
            | AppError::JobNotFound
            | AppError::UserNotFound
            | AppError::RegistrationNotFound
            | AppError::ShareNotFound
            | AppError::UploadSessionNotFound => StatusCode::NOT_FOUND,
            AppError::CategoryInUse
            | AppError::CategoryExists
            | AppError::JobNotCompleted { .. }
            | AppError::RegistrationExists
            | AppError::UserExists
            | AppError::NameConflict(_)
            | AppError::UploadSessionClosed(_)
            | AppError::ChunkConflict(_)
            | AppError::IncompleteUpload { .. } => StatusCode::CONFLICT,
            AppError::DownloadExpired | AppError::FileDeleted | AppError::ShareExpired => {
                StatusCode::GONE
            }
            AppError::DigestMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Database(_) | AppError::Storage(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn into_body(self) -> ErrorBody {
        let code = self.code();
        let (message, details) = match self {
            AppError::Unauthorized => ("Authentication required".into(), None),
            AppError::GatewayHeaderMissing => {
                ("Access gateway identity header is missing".into(), None)
            }
            AppError::UserNotRegistered => ("User is not registered".into(), None),
            AppError::UserNotApproved => ("Registration is awaiting approval".into(), None),
            AppError::UserSuspended => ("Account is suspended".into(), None),
            AppError::InsufficientPermissions => ("Insufficient permissions".into(), None),
            AppError::TokenInvalid => ("Invalid or expired token".into(), None),
            AppError::InvalidRequest(msg)
            | AppError::Validation(msg)
            | AppError::InvalidFileType(msg)
            | AppError::InvalidPath(msg)
            | AppError::NameConflict(msg)
            | AppError::UploadSessionClosed(msg)
            | AppError::ChunkConflict(msg) => (msg, None),
            AppError::MissingParameter(name) => (
                format!("Missing required parameter '{name}'"),
                Some(json!({ "parameter": name })),
            ),
            AppError::FileSizeExceeded { limit } => (
                format!("File exceeds the maximum size of {limit} bytes"),
                Some(json!({ "limit": limit })),
            ),
            AppError::FileNotFound => ("File not found".into(), None),
            AppError::CategoryNotFound => ("Category not found".into(), None),
            AppError::JobNotFound => ("Export job not found".into(), None),
            AppError::UserNotFound => ("User not found".into(), None),
            AppError::RegistrationNotFound => ("Registration request not found".into(), None),
            AppError::ShareNotFound => ("Share link not found".into(), None),
            AppError::UploadSessionNotFound => ("Upload session not found".into(), None),
            AppError::CategoryInUse => ("Category is still referenced by files".into(), None),
            AppError::CategoryExists => ("A category with this name already exists".into(), None),
            AppError::JobNotCompleted { status, progress } => (
                format!("Export job is {status}"),
                Some(json!({ "status": status, "progress": progress })),
            ),
            AppError::DownloadExpired => ("Download has expired".into(), None),
            AppError::RegistrationExists => ("A registration request already exists".into(), None),
            AppError::UserExists => ("User already exists".into(), None),
            AppError::FileDeleted => ("File has been deleted".into(), None),
            AppError::ShareExpired => ("Share link has expired".into(), None),
            AppError::IncompleteUpload { missing } => (
                format!("{} chunk(s) still missing", missing.len()),
                Some(json!({ "missing_indices": missing })),
            ),
            AppError::DigestMismatch { expected, actual } => (
                "Uploaded content does not match the expected digest".into(),
                Some(json!({ "expected": expected, "actual": actual })),
            ),
            AppError::Database(err) => {
                tracing::error!("Database error: {}", err);
                ("A database error occurred".into(), None)
            }
            AppError::Storage(detail) => {
                tracing::error!("Storage error: {}", detail);
                ("A storage error occurred".into(), None)
            }
            AppError::Internal(detail) => {
                tracing::error!("Internal error: {}", detail);
                ("An unexpected error occurred".into(), None)
            }
            AppError::ServiceUnavailable(msg) => (msg, None),
        };

        ErrorBody {
            code,
            message,
            details,
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::Database(err) => write!(f, "{}: {err}", self.code()),
            AppError::Storage(msg) | AppError::Internal(msg) | AppError::Validation(msg) => {
                write!(f, "{}: {msg}", self.code())
            }
            other => f.write_str(other.code()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorEnvelope {
            success: false,
            error: self.into_body(),
        };
        (status, Json(body)).into_response()
    }
}

impl Transient for AppError {
    fn is_transient(&self) -> bool {
        matches!(self, AppError::Database(err) if err.is_transient())
    }
}

impl From<DbErr> for AppError {
    fn from(err: DbErr) -> Self {
        AppError::Database(err)
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::SizeLimitExceeded { limit, .. } => AppError::FileSizeExceeded { limit },
            StorageError::HashMismatch { expected, actual } => {
                AppError::DigestMismatch { expected, actual }
            }
            StorageError::ShortRead { expected, actual } => AppError::Validation(format!(
                "Expected {expected} bytes but received {actual}"
            )),
            other => AppError::Storage(other.to_string()),
        }
    }
}

impl From<TransactionError<AppError>> for AppError {
    fn from(err: TransactionError<AppError>) -> Self {
        match err {
            TransactionError::Connection(db) => AppError::Database(db),
            TransactionError::Transaction(app) => app,
        }
    }
}

/// Render a caught handler panic as the standard failure envelope.
pub fn panic_response(_: Box<dyn std::any::Any + Send + 'static>) -> Response {
    tracing::error!("Handler panicked");
    AppError::Internal("handler panicked".into()).into_response()
}
