use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::AppError;
use crate::gemini::{GeminiClient, GeminiError};
use crate::upload::{detect_mime_type, StagedUpload};

pub const WELCOME_MESSAGE: &str =
    "Welcome to the Math Expression Extractor API! Use POST /api/calc-from-image with an image file.";

const IMAGE_FIELD: &str = "image";

pub struct AppState {
    pub client: GeminiClient,
    pub upload_dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CalcResponse {
    pub result: String,
}

/// Builds the full application from settings: one shared client, one router.
pub fn app(config: &Config) -> Result<Router, GeminiError> {
    let state = Arc::new(AppState {
        client: GeminiClient::new(config)?,
        upload_dir: config.upload_dir.clone(),
    });
    Ok(router(state, config.max_upload_bytes))
}

pub fn router(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/calc-from-image", post(calc_from_image))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn index() -> &'static str {
    WELCOME_MESSAGE
}

struct ImageUpload {
    staged: StagedUpload,
    content_type: Option<String>,
    size: usize,
}

/// Streams the first `image` file field to disk. Text fields and fields under
/// other names are ignored.
async fn stage_image_field(
    upload_dir: &std::path::Path,
    multipart: &mut Multipart,
) -> Result<Option<ImageUpload>, AppError> {
    while let Some(mut field) = multipart.next_field().await? {
        if field.name() != Some(IMAGE_FIELD) || field.file_name().is_none() {
            continue;
        }

        let content_type = field.content_type().map(str::to_string);
        let staged = StagedUpload::create(upload_dir).await?;
        let mut writer = staged.writer().await?;
        while let Some(chunk) = field.chunk().await? {
            writer.write(&chunk).await?;
        }
        let size = writer.finish().await?;

        return Ok(Some(ImageUpload {
            staged,
            content_type,
            size,
        }));
    }

    Ok(None)
}

async fn calc_from_image(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<CalcResponse>, AppError> {
    // A body that is not multipart at all cannot carry the image either.
    let mut multipart = multipart.map_err(|rejection| {
        debug!(reason = %rejection.body_text(), "Request body is not multipart");
        AppError::MissingImage
    })?;

    let upload = stage_image_field(&state.upload_dir, &mut multipart)
        .await?
        .ok_or(AppError::MissingImage)?;

    info!(
        path = %upload.staged.path().display(),
        bytes = upload.size,
        "Image uploaded"
    );

    let image = upload.staged.read().await?;
    let mime_type = detect_mime_type(&image, upload.content_type.as_deref());
    let result = state.client.extract_expression(&image, &mime_type).await?;

    if let Err(err) = upload.staged.close() {
        warn!(error = %err, "Failed to remove staged upload");
    }

    Ok(Json(CalcResponse { result }))
}
