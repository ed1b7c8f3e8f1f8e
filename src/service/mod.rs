//! OCR annotation services.
//!
//! One request per document carries two schemas: a document schema, which the
//! service fills in once for the whole document, and a region schema, which it
//! fills in for every image or region it detects. We don't interpret the
//! annotations here. That's the reconciler's job.

use std::{error, fmt, sync::Arc, time::Duration};

use clap::{Args, ValueEnum};
use keen_retry::{ExponentialJitter, ResolvedResult};
use reqwest::StatusCode;
use tokio::time;

use crate::{
    data_url::{PDF_MIME_TYPE, data_url},
    document::Document,
    prelude::*,
    profile::Profile,
    result::BoundingBox,
    retry::into_retry_result,
    schema::OutputSchema,
};

pub mod fixture;
pub mod mistral;

/// The OCR model we ask for by default.
pub const DEFAULT_MODEL: &str = "mistral-ocr-latest";

/// We only ever ask for the first 8 pages. This bounds cost and latency.
/// Shorter documents are fine; the service ignores pages that don't exist.
pub const DEFAULT_MAX_PAGES: u32 = 8;

/// Our different service types.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum ServiceType {
    /// The Mistral OCR API. Requires `MISTRAL_API_KEY`.
    #[default]
    Mistral,

    /// Return a canned response from `--fixture` for every document. Useful
    /// for testing and for replaying saved responses offline.
    Fixture,
}

/// Options controlling how we talk to the OCR service.
#[derive(Args, Clone, Debug)]
pub struct ServiceOpts {
    /// The OCR service to use.
    #[clap(long, value_enum, default_value_t = ServiceType::default())]
    pub service: ServiceType,

    /// A JSON or TOML file containing a canned OCR response, for use with
    /// `--service fixture`.
    #[clap(long, required_if_eq("service", "fixture"))]
    pub fixture: Option<PathBuf>,

    /// The OCR model to request.
    #[clap(long, default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Only OCR this many pages, starting from the first.
    #[clap(long, default_value_t = DEFAULT_MAX_PAGES)]
    pub max_pages: u32,

    /// Ask the service to return image bytes for each region, even if the
    /// profile doesn't.
    #[clap(long)]
    pub include_image_base64: bool,

    /// A timeout, in seconds, for each OCR request. By default, we wait as
    /// long as the service takes.
    #[clap(long)]
    pub timeout: Option<u64>,

    /// Retry transient failures (rate limits, gateway errors, timeouts) this
    /// many times, with exponential backoff. By default, we never retry.
    #[clap(long, default_value_t = 0)]
    pub retries: u8,
}

impl ServiceOpts {
    /// Instantiate an appropriate service.
    pub async fn create_service(&self) -> Result<Arc<dyn AnnotationService>> {
        let service: Arc<dyn AnnotationService> = match self.service {
            ServiceType::Mistral => Arc::new(mistral::MistralOcrService::from_env()?),
            ServiceType::Fixture => {
                let path = self
                    .fixture
                    .as_deref()
                    .ok_or_else(|| anyhow!("--fixture is required with --service fixture"))?;
                Arc::new(fixture::FixtureService::load(path).await?)
            }
        };
        if self.timeout.is_none() && self.retries == 0 {
            Ok(service)
        } else {
            Ok(Arc::new(ResilientService {
                inner: service,
                timeout: self.timeout.map(Duration::from_secs),
                retries: self.retries,
            }))
        }
    }

    /// Per-request options for documents processed with `profile`.
    pub fn request_opts(&self, profile: &Profile) -> RequestOpts {
        RequestOpts {
            model: self.model.clone(),
            max_pages: self.max_pages,
            include_image_base64: self.include_image_base64 || profile.include_image_base64,
        }
    }
}

/// Options which are the same for every request in a batch.
#[derive(Clone, Debug)]
pub struct RequestOpts {
    /// The OCR model to request.
    pub model: String,

    /// How many pages to request, starting from page 0.
    pub max_pages: u32,

    /// Should the service return image bytes for each region?
    pub include_image_base64: bool,
}

impl Default for RequestOpts {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_owned(),
            max_pages: DEFAULT_MAX_PAGES,
            include_image_base64: false,
        }
    }
}

/// Interface trait for OCR annotation services.
#[async_trait]
pub trait AnnotationService: fmt::Debug + Send + Sync + 'static {
    /// Run one OCR request. Implementations make exactly one call to the
    /// underlying service, and never retry.
    async fn process(&self, request: &OcrRequest) -> Result<OcrResponse, ServiceError>;
}

/// Build a request for `document` and send it to `service`.
#[instrument(level = "debug", skip_all, fields(id = %document.id))]
pub async fn request_annotations(
    service: &dyn AnnotationService,
    document: &Document,
    document_schema: &OutputSchema,
    region_schema: &OutputSchema,
    opts: &RequestOpts,
) -> Result<OcrResponse, ServiceError> {
    let request = OcrRequest::new(document, document_schema, region_schema, opts);
    let DocumentChunk::DocumentUrl { document_url } = &request.document;
    debug!(size = document_url.len(), "Document encoded");
    let response = service.process(&request).await?;
    debug!(pages = response.pages.len(), "OCR response received");
    Ok(response)
}

/// An OCR request, in the format expected by the service.
#[derive(Clone, Debug, Serialize)]
pub struct OcrRequest {
    /// The OCR model.
    pub model: String,

    /// Zero-based page indices to process.
    pub pages: Vec<u32>,

    /// The document itself.
    pub document: DocumentChunk,

    /// Schema for the whole-document annotation.
    pub document_annotation_format: Value,

    /// Schema for each region annotation.
    pub bbox_annotation_format: Value,

    /// Should the service return image bytes for each region?
    pub include_image_base64: bool,
}

impl OcrRequest {
    /// Build a request asking for both annotation kinds.
    pub fn new(
        document: &Document,
        document_schema: &OutputSchema,
        region_schema: &OutputSchema,
        opts: &RequestOpts,
    ) -> Self {
        Self {
            model: opts.model.clone(),
            // Always the full window, whatever the document length.
            pages: (0..opts.max_pages).collect(),
            document: DocumentChunk::DocumentUrl {
                document_url: data_url(PDF_MIME_TYPE, &document.data),
            },
            document_annotation_format: document_schema.to_response_format(),
            bbox_annotation_format: region_schema.to_response_format(),
            include_image_base64: opts.include_image_base64,
        }
    }
}

/// A document, as sent to the service.
#[derive(Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DocumentChunk {
    /// A `data:` URL containing the whole document.
    DocumentUrl { document_url: String },
}

impl fmt::Debug for DocumentChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentChunk::DocumentUrl { document_url } => f
                .debug_struct("DocumentUrl")
                .field("len", &document_url.len())
                .finish(),
        }
    }
}

/// An OCR response. Everything is optional, because we'd rather reconcile a
/// partial response than reject it.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct OcrResponse {
    /// Pages, in document order.
    #[serde(default)]
    pub pages: Vec<OcrPage>,

    /// The document annotation, as a JSON string.
    #[serde(default)]
    pub document_annotation: Option<String>,

    /// The model which handled the request.
    #[serde(default)]
    pub model: Option<String>,

    /// Usage information.
    #[serde(default)]
    pub usage_info: Option<UsageInfo>,
}

/// A single OCRed page.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct OcrPage {
    /// Zero-based page index.
    #[serde(default)]
    pub index: u32,

    /// Recognized text, in Markdown.
    #[serde(default)]
    pub markdown: String,

    /// Images or regions detected on this page, in service order.
    #[serde(default)]
    pub images: Vec<OcrImage>,
}

/// A single image or region.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct OcrImage {
    /// The service's identifier, like `img-0.jpeg`.
    pub id: String,

    #[serde(default)]
    pub top_left_x: Option<i64>,
    #[serde(default)]
    pub top_left_y: Option<i64>,
    #[serde(default)]
    pub bottom_right_x: Option<i64>,
    #[serde(default)]
    pub bottom_right_y: Option<i64>,

    /// Image bytes, if requested.
    #[serde(default)]
    pub image_base64: Option<String>,

    /// The region annotation, as a JSON string.
    #[serde(default)]
    pub image_annotation: Option<String>,
}

impl OcrImage {
    /// The bounding box, if the service sent all four coordinates.
    pub fn bounding_box(&self) -> Option<BoundingBox> {
        Some(BoundingBox {
            top_left_x: self.top_left_x?,
            top_left_y: self.top_left_y?,
            bottom_right_x: self.bottom_right_x?,
            bottom_right_y: self.bottom_right_y?,
        })
    }

    /// Did the service send any image bytes?
    pub fn has_image(&self) -> bool {
        self.image_base64.as_deref().is_some_and(|data| !data.is_empty())
    }
}

/// Usage information.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct UsageInfo {
    /// How many pages were processed?
    #[serde(default)]
    pub pages_processed: u32,

    /// How big was the document?
    #[serde(default)]
    pub doc_size_bytes: Option<u64>,
}

/// An error which occurred while calling the OCR service.
#[derive(Debug)]
pub enum ServiceError {
    /// The HTTP request couldn't be completed.
    Http(reqwest::Error),

    /// The service answered with an error status.
    Status { status: StatusCode, body: String },

    /// The service answered, but we couldn't understand the response.
    InvalidResponse(String),

    /// The request took longer than our timeout.
    Timeout,

    /// Anything else.
    Other(anyhow::Error),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::Http(err) => write!(f, "OCR request failed: {err}"),
            ServiceError::Status { status, body } => {
                write!(f, "OCR service returned {status}: {body}")
            }
            ServiceError::InvalidResponse(msg) => write!(f, "invalid OCR response: {msg}"),
            ServiceError::Timeout => write!(f, "OCR request timed out"),
            ServiceError::Other(err) => write!(f, "{err:#}"),
        }
    }
}

impl error::Error for ServiceError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            ServiceError::Http(err) => Some(err),
            ServiceError::Other(err) => Some(&**err),
            _ => None,
        }
    }
}

/// Wraps another service with an optional timeout and optional retries.
#[derive(Debug)]
pub struct ResilientService {
    inner: Arc<dyn AnnotationService>,
    timeout: Option<Duration>,
    retries: u8,
}

impl ResilientService {
    /// Make a single attempt, subject to our timeout.
    async fn call_once(&self, request: &OcrRequest) -> Result<OcrResponse, ServiceError> {
        match self.timeout {
            Some(timeout) => time::timeout(timeout, self.inner.process(request))
                .await
                .unwrap_or(Err(ServiceError::Timeout)),
            None => self.inner.process(request).await,
        }
    }
}

#[async_trait]
impl AnnotationService for ResilientService {
    async fn process(&self, request: &OcrRequest) -> Result<OcrResponse, ServiceError> {
        if self.retries == 0 {
            return self.call_once(request).await;
        }

        // If we have a transient failure, back off exponentially.
        let jitter = ExponentialJitter::FromBackoffRange {
            backoff_range_millis: 1_000..=30_000,
            re_attempts: self.retries,
            jitter_ratio: 0.2,
        };
        let result = into_retry_result(self.call_once(request).await)
            .retry_with_async(|_| async { into_retry_result(self.call_once(request).await) })
            .with_exponential_jitter(|| jitter)
            .await
            .inspect_recovered(|_, _, retry_errors_list| {
                warn!(
                    "succeeded after retrying {} times (failed attempts: [{}])",
                    retry_errors_list.len(),
                    keen_retry::loggable_retry_errors(retry_errors_list)
                )
            })
            .inspect_given_up(|_, retry_errors_list, fatal_error| {
                error!(
                    "FAILED after exhausting all {} retrying attempts with error {fatal_error:?}",
                    retry_errors_list.len(),
                )
            });
        match result {
            ResolvedResult::Ok { output, .. } | ResolvedResult::Recovered { output, .. } => {
                Ok(output)
            }
            ResolvedResult::Fatal { error, .. } => Err(error),
            ResolvedResult::GivenUp { fatal_error, .. }
            | ResolvedResult::Unrecoverable { fatal_error, .. } => Err(fatal_error),
        }
    }
}

/// Test doubles and response builders.
#[cfg(test)]
pub mod testing {
    use std::{collections::VecDeque, sync::Mutex};

    use super::*;

    /// A service which returns queued responses, and remembers every request.
    #[derive(Debug, Default)]
    pub struct StubService {
        responses: Mutex<VecDeque<Result<OcrResponse, ServiceError>>>,
        requests: Mutex<Vec<OcrRequest>>,
    }

    impl StubService {
        /// Create a stub which returns `responses` in order.
        pub fn new(responses: Vec<Result<OcrResponse, ServiceError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(vec![]),
            }
        }

        /// Every request we've seen so far.
        pub fn requests(&self) -> Vec<OcrRequest> {
            self.requests.lock().expect("lock poisoned").clone()
        }
    }

    #[async_trait]
    impl AnnotationService for StubService {
        async fn process(&self, request: &OcrRequest) -> Result<OcrResponse, ServiceError> {
            self.requests
                .lock()
                .expect("lock poisoned")
                .push(request.clone());
            self.responses
                .lock()
                .expect("lock poisoned")
                .pop_front()
                .unwrap_or_else(|| Err(ServiceError::Other(anyhow!("no stubbed response left"))))
        }
    }

    /// A page with the given text and regions.
    pub fn page(index: u32, markdown: &str, images: Vec<OcrImage>) -> OcrPage {
        OcrPage {
            index,
            markdown: markdown.to_owned(),
            images,
        }
    }

    /// A region with a bounding box and the given annotation string.
    pub fn image(id: &str, annotation: &str) -> OcrImage {
        OcrImage {
            id: id.to_owned(),
            top_left_x: Some(0),
            top_left_y: Some(0),
            bottom_right_x: Some(100),
            bottom_right_y: Some(50),
            image_base64: None,
            image_annotation: Some(annotation.to_owned()),
        }
    }

    /// A response with a document annotation and pages.
    pub fn response(document_annotation: &str, pages: Vec<OcrPage>) -> OcrResponse {
        OcrResponse {
            pages,
            document_annotation: Some(document_annotation.to_owned()),
            model: Some(DEFAULT_MODEL.to_owned()),
            usage_info: None,
        }
    }
}
