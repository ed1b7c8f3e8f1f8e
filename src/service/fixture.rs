//! A service which replays a canned response.
//!
//! This is handy for integration tests, and for re-running reconciliation on
//! a response saved from an earlier run without paying for another OCR call.

use crate::{async_utils::io::read_json_or_toml, prelude::*};

use super::{AnnotationService, OcrRequest, OcrResponse, ServiceError};

/// A canned service failure.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FixtureFailure {
    /// The error to report.
    error: String,
}

/// The contents of a fixture file.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum Fixture {
    /// Fail every request with this error.
    Failure(FixtureFailure),

    /// Answer every request with this response.
    Response(OcrResponse),
}

/// Returns the same canned response for every request.
#[derive(Debug)]
pub struct FixtureService {
    fixture: Fixture,
}

impl FixtureService {
    /// Load a fixture from a JSON or TOML file.
    pub async fn load(path: &Path) -> Result<Self> {
        let fixture = read_json_or_toml::<Fixture>(path)
            .await
            .with_context(|| format!("failed to load OCR fixture {:?}", path))?;
        Ok(Self { fixture })
    }
}

#[async_trait]
impl AnnotationService for FixtureService {
    async fn process(&self, request: &OcrRequest) -> Result<OcrResponse, ServiceError> {
        trace!(?request, "Fixture request");
        match &self.fixture {
            Fixture::Failure(failure) => Err(ServiceError::Other(anyhow!(
                "{}",
                failure.error
            ))),
            Fixture::Response(response) => Ok(response.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        document::Document,
        profile::Profile,
        schema::SchemaStrategy,
        service::RequestOpts,
    };

    async fn load(contents: Value) -> FixtureService {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixture.json");
        tokio::fs::write(&path, contents.to_string()).await.unwrap();
        FixtureService::load(&path).await.unwrap()
    }

    fn request() -> OcrRequest {
        let profile = Profile::builtin("invoice").unwrap();
        OcrRequest::new(
            &Document::new("a.pdf", vec![]),
            &profile.document.build(SchemaStrategy::Direct).unwrap(),
            &profile.region.build(SchemaStrategy::Direct).unwrap(),
            &RequestOpts::default(),
        )
    }

    #[tokio::test]
    async fn test_response_fixture() {
        let service = load(json!({
            "pages": [{ "index": 0, "markdown": "Hello", "images": [] }],
            "document_annotation": "{}",
        }))
        .await;
        let response = service.process(&request()).await.unwrap();
        assert_eq!(response.pages[0].markdown, "Hello");
    }

    #[tokio::test]
    async fn test_failure_fixture() {
        let service = load(json!({ "error": "rate limited" })).await;
        let err = service.process(&request()).await.unwrap_err();
        assert_eq!(err.to_string(), "rate limited");
    }
}
