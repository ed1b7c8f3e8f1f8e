//! The Mistral OCR API.

use std::{env, fmt};

use crate::prelude::*;

use super::{AnnotationService, OcrRequest, OcrResponse, ServiceError};

/// Where we send requests unless `MISTRAL_API_BASE` says otherwise.
pub const DEFAULT_API_BASE: &str = "https://api.mistral.ai/v1";

/// Client for Mistral's `/ocr` endpoint.
pub struct MistralOcrService {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl MistralOcrService {
    /// Create a client using `MISTRAL_API_KEY` and, optionally,
    /// `MISTRAL_API_BASE`.
    pub fn from_env() -> Result<Self> {
        let api_key = env::var("MISTRAL_API_KEY")
            .ok()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| anyhow!("MISTRAL_API_KEY not found in environment variables"))?;
        let api_base =
            env::var("MISTRAL_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.to_owned());
        Self::new(api_base, api_key)
    }

    /// Create a client for a specific endpoint.
    pub fn new(api_base: String, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("failed to create HTTP client")?;
        let service = Self {
            client,
            api_base,
            api_key,
        };
        info!(api_base = %service.api_base, api_key = %service.redacted_key(), "OCR client initialized");
        Ok(service)
    }

    /// Enough of our API key to tell keys apart, and no more.
    fn redacted_key(&self) -> String {
        let prefix = self.api_key.chars().take(8).collect::<String>();
        format!("{prefix}...")
    }

    /// The full URL of the OCR endpoint.
    fn ocr_url(&self) -> String {
        format!("{}/ocr", self.api_base.trim_end_matches('/'))
    }
}

impl fmt::Debug for MistralOcrService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MistralOcrService")
            .field("api_base", &self.api_base)
            .field("api_key", &self.redacted_key())
            .finish()
    }
}

#[async_trait]
impl AnnotationService for MistralOcrService {
    async fn process(&self, request: &OcrRequest) -> Result<OcrResponse, ServiceError> {
        trace!(?request, "Request");
        let response = self
            .client
            .post(self.ocr_url())
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(ServiceError::Http)?;

        let status = response.status();
        if !status.is_success() {
            // The body usually explains what went wrong, but don't fail
            // harder if we can't read it.
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::Status { status, body });
        }

        let body = response.text().await.map_err(ServiceError::Http)?;
        serde_json::from_str::<OcrResponse>(&body).map_err(|err| {
            ServiceError::InvalidResponse(format!("{err}: {}", truncate(&body, 200)))
        })
    }
}

/// Truncate `text` to at most `max_chars` characters, for error messages.
fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
