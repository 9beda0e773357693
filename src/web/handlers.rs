use crate::{
    image::{ImageLoader, InferenceResult, OutputFormat, ResultFormatter},
    models::{get_model, ExportRegistry, LoadedModel, ModelManager},
    pipeline::AsyncInfer,
    utils::error::ModelError,
    web::extractors::{RequestId, ValidatedJson},
    Config, Result,
};
use axum::{
    extract::{Multipart, State},
    http::header,
    response::{IntoResponse, Json, Response},
};
use image::GenericImageView;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// JSON request body (base64 mode)
#[derive(Debug, Deserialize)]
pub struct InferJsonRequest {
    /// Loaded model name (file stem) or published architecture name
    pub model: String,

    /// Base64 encoded image, optionally as a data URL
    pub image: String,

    /// Drop detections and poses scoring below this value
    #[serde(default)]
    pub min_confidence: Option<f32>,

    /// json (default), csv or text
    #[serde(default)]
    pub output_format: Option<String>,
}

/// JSON response envelope
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    pub timestamp: String,
    pub request_id: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T, request_id: String) -> Self {
        Self {
            success: true,
            data: Some(data),
            timestamp: chrono::Utc::now().to_rfc3339(),
            request_id,
        }
    }
}

/// Options shared by both upload modes.
#[derive(Debug, Default)]
struct InferOptions {
    model: String,
    min_confidence: Option<f32>,
    output_format: OutputFormat,
}

/// JSON base64 upload handler
pub async fn infer_json_handler(
    State(_config): State<Config>,
    RequestId(request_id): RequestId,
    ValidatedJson(request): ValidatedJson<InferJsonRequest>,
) -> Result<Response> {
    let start_time = Instant::now();
    tracing::info!(
        "Processing JSON inference request: request_id={}, model={}, output_format={:?}",
        request_id,
        request.model,
        request.output_format
    );

    let options = InferOptions {
        model: request.model,
        min_confidence: request.min_confidence,
        output_format: request
            .output_format
            .as_deref()
            .map(str::parse::<OutputFormat>)
            .transpose()?
            .unwrap_or_default(),
    };
    let image = ImageLoader::from_base64(&request.image)?;
    respond(image, options, request_id, start_time).await
}

/// Multipart file upload handler: a `file` field plus optional `model`,
/// `min_confidence` and `output_format` text fields.
pub async fn infer_upload_handler(
    State(_config): State<Config>,
    RequestId(request_id): RequestId,
    mut multipart: Multipart,
) -> Result<Response> {
    let start_time = Instant::now();
    tracing::info!("Processing multipart inference request: request_id={}", request_id);

    let mut image_data: Option<axum::body::Bytes> = None;
    let mut options = InferOptions::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ModelError::InvalidInput(format!("Failed to read multipart field: {}", e)))?
    {
        let field_name = field.name().unwrap_or("unknown").to_string();
        match field_name.as_str() {
            "file" => {
                if let Some(content_type) = field.content_type() {
                    if !content_type.starts_with("image/") {
                        return Err(ModelError::InvalidInput(format!(
                            "Unsupported content type: {}",
                            content_type
                        )));
                    }
                }
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ModelError::InvalidInput(format!("Failed to read file data: {}", e)))?;
                if data.is_empty() {
                    return Err(ModelError::InvalidInput("Empty file".to_string()));
                }
                tracing::debug!("Received file: {} bytes", data.len());
                image_data = Some(data);
            }
            "model" => {
                options.model = field.text().await.unwrap_or_default().trim().to_string();
            }
            "min_confidence" => {
                let value = field.text().await.unwrap_or_default();
                options.min_confidence = parse_min_confidence(&value)?;
            }
            "output_format" => {
                let value = field.text().await.unwrap_or_default();
                if !value.trim().is_empty() {
                    options.output_format = value.trim().parse()?;
                }
            }
            _ => {
                tracing::debug!("Ignoring unknown field: {}", field_name);
            }
        }
    }

    let image_data = image_data.ok_or_else(|| ModelError::InvalidInput("No image file provided".to_string()))?;
    if options.model.is_empty() {
        return Err(ModelError::InvalidInput("No model name provided".to_string()));
    }
    let image = ImageLoader::from_bytes(&image_data)?;
    respond(image, options, request_id, start_time).await
}

/// An empty value means no filter; anything else must be a number in `[0, 1]`.
fn parse_min_confidence(value: &str) -> Result<Option<f32>> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    let confidence = value
        .parse::<f32>()
        .map_err(|_| ModelError::InvalidInput(format!("Invalid min_confidence '{}'", value)))?;
    check_min_confidence(confidence)?;
    Ok(Some(confidence))
}

pub(crate) fn check_min_confidence(confidence: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&confidence) {
        return Err(ModelError::InvalidInput(
            "Confidence must be between 0.0 and 1.0".to_string(),
        ));
    }
    Ok(())
}

async fn respond(
    image: image::DynamicImage,
    options: InferOptions,
    request_id: String,
    start_time: Instant,
) -> Result<Response> {
    let loaded = get_model(&options.model)?;
    let result = run(&loaded, image, options.min_confidence, start_time).await?;

    tracing::info!(
        "Inference completed: request_id={}, model={}, {}, time={:.3}s",
        request_id,
        result.model,
        ResultFormatter::summary(&result.result),
        result.processing_time
    );

    let response = match options.output_format {
        OutputFormat::Json => Json(ApiResponse::success(result, request_id)).into_response(),
        OutputFormat::Csv => (
            [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
            ResultFormatter::to_csv(&result.result),
        )
            .into_response(),
        OutputFormat::Text => (
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            ResultFormatter::to_text(&result),
        )
            .into_response(),
    };
    Ok(response)
}

/// Runs one decoded image through a loaded model off the async executor.
pub async fn run(
    loaded: &LoadedModel,
    image: image::DynamicImage,
    min_confidence: Option<f32>,
    start_time: Instant,
) -> Result<InferenceResult> {
    let (width, height) = image.dimensions();
    let array = ImageLoader::preprocess_for(image, loaded.model.input_channels()?)?;
    let mut output = loaded.infer_async(array).await?;
    if let Some(min_confidence) = min_confidence {
        output = output.filter_confidence(min_confidence);
    }
    Ok(InferenceResult {
        model: loaded.name.clone(),
        architecture: loaded.architecture,
        processing_time: start_time.elapsed().as_secs_f32(),
        image_size: [width as usize, height as usize],
        result: output,
    })
}

#[derive(Debug, Serialize)]
pub struct PublishedModel {
    pub name: &'static str,
    pub module: &'static str,
    pub kind: &'static str,
    /// Loaded instances of this wrapper.
    pub loaded: Vec<String>,
}

/// Published names in order, with which of them are loaded.
pub async fn models_handler() -> Result<Json<Vec<PublishedModel>>> {
    let registry = ExportRegistry::global()?;
    let manager = ModelManager::instance().ok();
    let published = registry
        .exports()
        .iter()
        .map(|export| PublishedModel {
            name: export.name,
            module: export.module,
            kind: export.kind.as_str(),
            loaded: manager
                .as_ref()
                .map(|m| {
                    m.models()
                        .iter()
                        .filter(|loaded| loaded.architecture == export.name)
                        .map(|loaded| loaded.name.clone())
                        .collect()
                })
                .unwrap_or_default(),
        })
        .collect();
    Ok(Json(published))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multipart_confidence_is_validated_like_json() {
        assert_eq!(parse_min_confidence(" 0.4 ").unwrap(), Some(0.4));
        assert_eq!(parse_min_confidence("").unwrap(), None);
        assert!(matches!(parse_min_confidence("high"), Err(ModelError::InvalidInput(_))));
        assert!(matches!(parse_min_confidence("1.5"), Err(ModelError::InvalidInput(_))));
        assert!(matches!(parse_min_confidence("-0.1"), Err(ModelError::InvalidInput(_))));
        assert!(matches!(parse_min_confidence("NaN"), Err(ModelError::InvalidInput(_))));
    }
}
