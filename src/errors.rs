use serde::Serialize;
use thiserror::Error;

/// 统一的 ingress 服务错误类型
#[derive(Debug, Error)]
pub enum IngressError {
    #[error("Ingress not found: {id}")]
    NotFound { id: String },

    #[error("Stream key {stream_key} is already being published")]
    AlreadyPublishing { stream_key: String },

    #[error("Not enough CPU capacity to accept {kind} ingress")]
    CapacityRejected { kind: String },

    #[error("Server capacity exceeded: {message}")]
    CapacityMisconfigured { message: String },

    #[error("Unsupported input type {kind} for ingress {id}")]
    UnsupportedInput { id: String, kind: String },

    #[error("Pipeline build failed: {message}")]
    PipelineBuild { message: String },

    #[error("Pipeline failed: {message}")]
    PipelineFailed { message: String },

    #[error("Failed to deliver state update: {message}")]
    UpdateDelivery { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Request cancelled before the ingress completed")]
    Cancelled,

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {source}")]
    Storage {
        #[from]
        source: std::io::Error,
    },

    #[error("Internal server error: {message}")]
    Internal { message: String },
}

impl From<config::ConfigError> for IngressError {
    fn from(err: config::ConfigError) -> Self {
        IngressError::Config {
            message: err.to_string(),
        }
    }
}

impl From<redis::RedisError> for IngressError {
    fn from(err: redis::RedisError) -> Self {
        IngressError::UpdateDelivery {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for IngressError {
    fn from(err: serde_json::Error) -> Self {
        IngressError::InvalidRequest {
            message: err.to_string(),
        }
    }
}

impl From<prometheus::Error> for IngressError {
    fn from(err: prometheus::Error) -> Self {
        IngressError::Internal {
            message: format!("metrics: {}", err),
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for IngressError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        IngressError::Internal {
            message: format!("Channel send error: {}", err),
        }
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for IngressError {
    fn from(err: tokio::sync::oneshot::error::RecvError) -> Self {
        IngressError::Internal {
            message: format!("Channel receive error: {}", err),
        }
    }
}

impl IngressError {
    pub fn error_code(&self) -> &'static str {
        match self {
            IngressError::NotFound { .. } => "NOT_FOUND",
            IngressError::AlreadyPublishing { .. } => "ALREADY_PUBLISHING",
            IngressError::CapacityRejected { .. } => "CAPACITY_REJECTED",
            IngressError::CapacityMisconfigured { .. } => "SERVER_CAPACITY_EXCEEDED",
            IngressError::UnsupportedInput { .. } => "UNSUPPORTED_INPUT",
            IngressError::PipelineBuild { .. } => "PIPELINE_BUILD_FAILED",
            IngressError::PipelineFailed { .. } => "PIPELINE_FAILED",
            IngressError::UpdateDelivery { .. } => "UPDATE_DELIVERY_FAILED",
            IngressError::InvalidRequest { .. } => "INVALID_REQUEST",
            IngressError::Cancelled => "CANCELLED",
            IngressError::Config { .. } => "CONFIG_ERROR",
            IngressError::Storage { .. } => "STORAGE_ERROR",
            IngressError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    #[cfg(feature = "http-health")]
    pub fn http_status(&self) -> hyper::StatusCode {
        use hyper::StatusCode;
        match self {
            IngressError::NotFound { .. } => StatusCode::NOT_FOUND,
            IngressError::AlreadyPublishing { .. } => StatusCode::CONFLICT,
            IngressError::CapacityRejected { .. } => StatusCode::SERVICE_UNAVAILABLE,
            IngressError::CapacityMisconfigured { .. } => StatusCode::SERVICE_UNAVAILABLE,
            IngressError::UnsupportedInput { .. } => StatusCode::BAD_REQUEST,
            IngressError::PipelineBuild { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            IngressError::PipelineFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            IngressError::UpdateDelivery { .. } => StatusCode::BAD_GATEWAY,
            IngressError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            IngressError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            IngressError::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            IngressError::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            IngressError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The caller should try again, possibly on another node.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngressError::CapacityRejected { .. }
                | IngressError::UpdateDelivery { .. }
                | IngressError::Cancelled
        )
    }

    /// Expected backpressure and client mistakes are logged as warnings only.
    pub fn should_log_error(&self) -> bool {
        !matches!(
            self,
            IngressError::NotFound { .. }
                | IngressError::AlreadyPublishing { .. }
                | IngressError::CapacityRejected { .. }
                | IngressError::InvalidRequest { .. }
                | IngressError::Cancelled
        )
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    pub message: String,
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn from_error(error: &IngressError) -> Self {
        Self {
            error: "IngressError".to_string(),
            code: error.error_code().to_string(),
            message: error.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Result类型别名
pub type Result<T> = std::result::Result<T, IngressError>;
