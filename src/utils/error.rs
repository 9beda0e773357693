use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Unresolved export '{name}': {reason}")]
    UnresolvedExport { name: String, reason: String },

    #[error("Model loading failed: {0}")]
    ModelLoad(String),

    #[error("Image processing failed: {0}")]
    ImageProcessing(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("File too large: {0} bytes, max allowed: {1} bytes")]
    FileTooLarge(usize, usize),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Image decode error: {0}")]
    ImageDecode(#[from] image::ImageError),

    #[error("ORT error: {0}")]
    Ort(#[from] ort::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ModelError {
    pub fn unresolved(name: impl Into<String>, reason: impl Into<String>) -> Self {
        ModelError::UnresolvedExport {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ModelError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ModelError::FileTooLarge(_, _) => StatusCode::PAYLOAD_TOO_LARGE,
            ModelError::Base64(_) => StatusCode::BAD_REQUEST,
            ModelError::Json(_) => StatusCode::BAD_REQUEST,
            ModelError::ImageDecode(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ModelError::UnresolvedExport { .. } => StatusCode::NOT_FOUND,
            ModelError::ModelLoad(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ModelError::UnresolvedExport { .. } => "UNRESOLVED_EXPORT",
            ModelError::ModelLoad(_) => "MODEL_LOAD_ERROR",
            ModelError::ImageProcessing(_) => "IMAGE_PROCESSING_ERROR",
            ModelError::Inference(_) => "INFERENCE_ERROR",
            ModelError::InvalidInput(_) => "INVALID_INPUT",
            ModelError::FileTooLarge(_, _) => "FILE_TOO_LARGE",
            ModelError::Config(_) => "CONFIG_ERROR",
            ModelError::Io(_) => "IO_ERROR",
            ModelError::Json(_) => "JSON_ERROR",
            ModelError::Base64(_) => "BASE64_DECODE_ERROR",
            ModelError::ImageDecode(_) => "IMAGE_DECODE_ERROR",
            ModelError::Ort(_) => "ORT_ERROR",
            ModelError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ModelError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_response = serde_json::json!({
            "error": {
                "code": self.error_code(),
                "message": self.to_string(),
            }
        });

        tracing::error!("Request failed: {} ({})", self, status);

        (status, axum::Json(error_response)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unresolved_export_maps_to_not_found() {
        let err = ModelError::unresolved("SSD", "not defined in module 'ssd'");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.error_code(), "UNRESOLVED_EXPORT");
        assert_eq!(
            err.to_string(),
            "Unresolved export 'SSD': not defined in module 'ssd'"
        );
    }

    #[test]
    fn client_errors_are_bad_request() {
        assert_eq!(
            ModelError::InvalidInput("empty".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ModelError::FileTooLarge(10, 5).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }
}
