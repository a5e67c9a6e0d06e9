//! Chunked media upload (INIT, APPEND, FINALIZE, STATUS).

use super::client::{ApiAdapter, Body};
use crate::action::MediaRef;
use crate::backend::BackendKind;
use crate::error::{ClassifiedError, ConnectorResult};
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use reqwest::Method;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Upper bound on STATUS polls while the server processes a video.
const MAX_STATUS_POLLS: u32 = 30;
const MAX_CHECK_AFTER: Duration = Duration::from_secs(10);

/// Upload category for a MIME type.
pub fn media_category(mime: &str) -> &'static str {
    match mime {
        "image/gif" => "tweet_gif",
        "video/mp4" | "video/quicktime" => "tweet_video",
        _ => "tweet_image",
    }
}

fn mime_from_url(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_lowercase();
    match path.rsplit('.').next() {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        _ => "image/jpeg",
    }
}

impl ApiAdapter {
    /// Turn media references into uploaded media ids, in order.
    pub(super) async fn upload_media(&self, media: &[MediaRef]) -> ConnectorResult<Vec<String>> {
        let mut ids = Vec::with_capacity(media.len());
        for item in media {
            let id = match item {
                MediaRef::MediaId(id) => id.clone(),
                MediaRef::Url(url) => self.upload_from_url(url).await?,
            };
            ids.push(id);
        }
        Ok(ids)
    }

    #[instrument(skip(self))]
    async fn upload_from_url(&self, url: &str) -> ConnectorResult<String> {
        let (bytes, mime) = self.download(url).await?;
        let category = media_category(&mime);
        let endpoint = format!("{}/1.1/media/upload.json", self.upload_url);

        debug!(size = bytes.len(), mime = %mime, category, "Starting media upload");

        let init = self
            .send(
                Method::POST,
                &endpoint,
                &[],
                Body::Form(vec![
                    ("command".to_string(), "INIT".to_string()),
                    ("total_bytes".to_string(), bytes.len().to_string()),
                    ("media_type".to_string(), mime.clone()),
                    ("media_category".to_string(), category.to_string()),
                ]),
                false,
            )
            .await?;
        let media_id = init
            .get("media_id_string")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| upload_error("INIT response has no media_id_string"))?;

        for (index, chunk) in bytes.chunks(self.media_chunk_bytes).enumerate() {
            let form = Form::new()
                .text("command", "APPEND")
                .text("media_id", media_id.clone())
                .text("segment_index", index.to_string())
                .part("media", Part::bytes(chunk.to_vec()));
            self.send(Method::POST, &endpoint, &[], Body::Multipart(form), false)
                .await?;
        }

        let mut status = self
            .send(
                Method::POST,
                &endpoint,
                &[],
                Body::Form(vec![
                    ("command".to_string(), "FINALIZE".to_string()),
                    ("media_id".to_string(), media_id.clone()),
                ]),
                false,
            )
            .await?;

        let mut polls = 0;
        while let Some(wait) = processing_wait(&status)? {
            polls += 1;
            if polls > MAX_STATUS_POLLS {
                return Err(ClassifiedError::transient(format!(
                    "media {} still processing after {} checks",
                    media_id, MAX_STATUS_POLLS
                ))
                .with_backend(BackendKind::Api));
            }
            tokio::time::sleep(wait).await;
            status = self
                .send(
                    Method::GET,
                    &endpoint,
                    &[
                        ("command".to_string(), "STATUS".to_string()),
                        ("media_id".to_string(), media_id.clone()),
                    ],
                    Body::Empty,
                    false,
                )
                .await?;
        }

        info!(media_id = %media_id, "Media uploaded");
        Ok(media_id)
    }

    async fn download(&self, url: &str) -> ConnectorResult<(Vec<u8>, String)> {
        let response = self.client.get(url).send().await.map_err(|e| {
            ClassifiedError::transient(format!("media download failed: {}", e))
                .with_backend(BackendKind::Api)
        })?;

        let status = response.status();
        if status.is_client_error() {
            return Err(ClassifiedError::validation(format!(
                "media url {} returned {}",
                url, status
            ))
            .with_backend(BackendKind::Api));
        }
        if !status.is_success() {
            return Err(ClassifiedError::transient(format!(
                "media url {} returned {}",
                url, status
            ))
            .with_backend(BackendKind::Api));
        }

        let mime = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_lowercase())
            .filter(|v| v.starts_with("image/") || v.starts_with("video/"))
            .unwrap_or_else(|| mime_from_url(url).to_string());

        let bytes = response.bytes().await.map_err(|e| {
            ClassifiedError::transient(format!("media download failed: {}", e))
                .with_backend(BackendKind::Api)
        })?;
        if bytes.is_empty() {
            return Err(ClassifiedError::validation(format!("media url {} is empty", url))
                .with_backend(BackendKind::Api));
        }

        Ok((bytes.to_vec(), mime))
    }
}

/// How long to wait before the next STATUS check, or `None` once processing is done.
fn processing_wait(status: &Value) -> ConnectorResult<Option<Duration>> {
    let Some(info) = status.get("processing_info") else {
        return Ok(None);
    };

    match info.get("state").and_then(Value::as_str) {
        Some("pending") | Some("in_progress") => {
            let secs = info
                .get("check_after_secs")
                .and_then(Value::as_u64)
                .unwrap_or(1);
            Ok(Some(Duration::from_secs(secs).min(MAX_CHECK_AFTER)))
        }
        Some("failed") => {
            let message = info
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("media processing failed");
            Err(ClassifiedError::validation(message.to_string()).with_backend(BackendKind::Api))
        }
        _ => Ok(None),
    }
}

fn upload_error(message: &str) -> ClassifiedError {
    ClassifiedError::permanent(message.to_string()).with_backend(BackendKind::Api)
}
