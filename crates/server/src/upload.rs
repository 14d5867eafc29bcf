use std::path::Path;

use axum::extract::multipart::{Multipart, MultipartError};
use axum::http::StatusCode;
use shared::error::{ApiError, ErrorCode};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Byte ceiling for a staged image: 5 MiB.
pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

/// Fixed rejection message for type mismatches, kept verbatim from the
/// upload contract.
pub const IMAGES_ONLY_MESSAGE: &str = "Error: Images only!";

const ALLOWED_IMAGE_EXTENSIONS: [&str; 4] = ["jpeg", "jpg", "png", "webp"];

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{IMAGES_ONLY_MESSAGE}")]
    NotAnImage,
    #[error("image exceeds {MAX_IMAGE_BYTES} bytes")]
    TooLarge,
    #[error("upload carried no file field")]
    MissingFile,
    #[error("malformed multipart request: {0}")]
    Multipart(#[from] MultipartError),
    #[error("failed to stage upload: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    pub fn status(&self) -> StatusCode {
        match self {
            UploadError::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            UploadError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    pub fn api_error(&self) -> ApiError {
        let code = match self {
            UploadError::TooLarge => ErrorCode::PayloadTooLarge,
            UploadError::Io(_) => ErrorCode::Internal,
            _ => ErrorCode::Validation,
        };
        ApiError::new(code, self.to_string())
    }
}

/// Validates the first file field of `multipart` and stages it under a
/// random unique name in `dir`, preserving the original extension. Returns
/// the staged file name. Nothing is written for rejected uploads; the staged
/// file awaits a remote transfer step performed elsewhere.
pub async fn stage_image(dir: &Path, multipart: &mut Multipart) -> Result<String, UploadError> {
    while let Some(mut field) = multipart.next_field().await? {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let content_type = field.content_type().map(str::to_string);

        // Both the declared content type and the extension must agree that
        // this is one of the four accepted image formats.
        let extension = image_extension(&filename);
        let type_ok = content_type
            .as_deref()
            .is_some_and(is_allowed_content_type);
        let Some(extension) = extension.filter(|_| type_ok) else {
            return Err(UploadError::NotAnImage);
        };

        let mut data = Vec::new();
        while let Some(chunk) = field.chunk().await? {
            if data.len() + chunk.len() > MAX_IMAGE_BYTES {
                return Err(UploadError::TooLarge);
            }
            data.extend_from_slice(&chunk);
        }

        let staged_name = format!("{}.{extension}", Uuid::new_v4());
        tokio::fs::write(dir.join(&staged_name), &data).await?;
        info!(
            %staged_name,
            size_bytes = data.len(),
            original = %filename,
            "upload: image staged"
        );
        return Ok(staged_name);
    }

    Err(UploadError::MissingFile)
}

fn image_extension(filename: &str) -> Option<String> {
    let extension = filename.rsplit_once('.')?.1.to_ascii_lowercase();
    ALLOWED_IMAGE_EXTENSIONS
        .contains(&extension.as_str())
        .then_some(extension)
}

fn is_allowed_content_type(content_type: &str) -> bool {
    content_type
        .strip_prefix("image/")
        .is_some_and(|subtype| ALLOWED_IMAGE_EXTENSIONS.contains(&subtype.to_ascii_lowercase().as_str()))
}
