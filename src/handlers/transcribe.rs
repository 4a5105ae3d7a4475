//! `POST /webhook/audio`: transcribe one uploaded audio file.
//!
//! Multipart body with a `file` field; optional `language` and
//! `initial_prompt` query parameters.

use actix_multipart::Multipart;
use actix_web::{web, HttpResponse};
use futures_util::StreamExt;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{AppError, AppResult};
use crate::models::{AudioChunk, SessionConfig, Transport};
use crate::state::AppState;

const FILE_FIELD: &str = "file";

#[derive(Debug, Default, Deserialize)]
pub struct TranscribeQuery {
    pub language: Option<String>,
    pub initial_prompt: Option<String>,
}

pub async fn transcribe_upload(
    state: web::Data<AppState>,
    query: web::Query<TranscribeQuery>,
    payload: Multipart,
) -> AppResult<HttpResponse> {
    let max = state.pipeline.max_upload_bytes();
    let chunk = read_file_field(payload, max).await?;
    info!(
        "Upload received: {} bytes ({})",
        chunk.size(),
        chunk.mime_hint.as_deref().unwrap_or("no content type")
    );

    let query = query.into_inner();
    let config = SessionConfig::new(query.language, query.initial_prompt);

    let result = state.pipeline.process(chunk, &config, Transport::Http).await?;
    Ok(HttpResponse::Ok().json(result))
}

/// Pull the `file` field out of the multipart body.
///
/// Reads at most `max + 1` bytes: enough for the pipeline to see that the upload
/// is oversized without buffering all of it.
async fn read_file_field(mut payload: Multipart, max: usize) -> AppResult<AudioChunk> {
    while let Some(item) = payload.next().await {
        let mut field = item?;
        if field.name() != Some(FILE_FIELD) {
            debug!("Skipping multipart field {:?}", field.name());
            while let Some(bytes) = field.next().await {
                bytes?;
            }
            continue;
        }

        let mime_hint = field.content_type().map(|mime| mime.to_string());
        let extension = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .and_then(file_extension);

        let limit = max.saturating_add(1);
        let mut data = Vec::new();
        while let Some(bytes) = field.next().await {
            let bytes = bytes?;
            let room = limit - data.len();
            data.extend_from_slice(&bytes[..bytes.len().min(room)]);
            if data.len() >= limit {
                break;
            }
        }

        return Ok(AudioChunk::new(data, mime_hint).with_extension(extension));
    }

    Err(AppError::BadRequest(format!(
        "multipart field '{}' is required",
        FILE_FIELD
    )))
}

fn file_extension(filename: &str) -> Option<String> {
    let (stem, ext) = filename.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > 8 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
