//! Batch processing.
//!
//! Every input document produces exactly one [`BatchEntry`], in input order,
//! no matter what goes wrong with it. One bad document never takes down the
//! batch. Entries are streamed as they complete, so callers can write each
//! one out without waiting for the rest of the batch.

use std::sync::Arc;

use futures::{StreamExt as _, stream};

use crate::{
    async_utils::BoxedStream,
    document::{Document, DocumentSource},
    prelude::*,
    profile::Profile,
    reconcile::Reconciler,
    result::{BatchEntry, ExtractionRecord, FailureRecord, ServiceFailure},
    schema::{OutputSchema, SchemaStrategy},
    service::{AnnotationService, RequestOpts, request_annotations},
    ui::Ui,
};

/// Everything we need to turn documents into extraction records.
///
/// Schemas are built once, here, and shared by every request in the batch.
pub struct Extractor {
    service: Arc<dyn AnnotationService>,
    document_schema: OutputSchema,
    region_schema: OutputSchema,
    reconciler: Reconciler,
    request_opts: RequestOpts,
}

impl Extractor {
    /// Create a new extractor for `profile`.
    pub fn new(
        service: Arc<dyn AnnotationService>,
        profile: &Profile,
        strategy: SchemaStrategy,
        request_opts: RequestOpts,
    ) -> Result<Self> {
        let document_schema = profile
            .document
            .build(strategy)
            .context("could not build document schema")?;
        let region_schema = profile
            .region
            .build(strategy)
            .context("could not build region schema")?;
        let reconciler = Reconciler::new(&document_schema, &region_schema)?;
        Ok(Self {
            service,
            document_schema,
            region_schema,
            reconciler,
            request_opts,
        })
    }

    /// Process a single document. This never fails; failures are reported in
    /// the returned record.
    #[instrument(level = "debug", skip_all, fields(id = %document.id))]
    pub async fn process_document(&self, document: &Document) -> ExtractionRecord {
        let outcome = request_annotations(
            self.service.as_ref(),
            document,
            &self.document_schema,
            &self.region_schema,
            &self.request_opts,
        )
        .await;
        self.reconciler.reconcile_outcome(&document.id, outcome)
    }

    /// Process a batch of documents, running up to `jobs` at once. Yields
    /// exactly one entry per document, in input order. Fails only if there's
    /// nothing to process.
    pub fn process_batch(
        self: Arc<Self>,
        sources: Vec<DocumentSource>,
        jobs: usize,
    ) -> Result<BoxedStream<BatchEntry>> {
        if sources.is_empty() {
            return Err(anyhow!("no documents to process"));
        }
        let entries = stream::iter(sources)
            .map(move |source| {
                let extractor = self.clone();
                let document_id = source.id();
                async move {
                    // Run each document in its own task, so that a panic only
                    // costs us that document.
                    let task_id = document_id.clone();
                    let handle = tokio::spawn(async move {
                        match source.load().await {
                            Ok(document) => extractor.process_document(&document).await,
                            // Reported like a failed service call, since we
                            // never got as far as making one.
                            Err(err) => {
                                error!(id = %task_id, "Could not load document: {err:#}");
                                ExtractionRecord::ServiceFailed(ServiceFailure {
                                    error: format!("{err:#}"),
                                    source_file: task_id,
                                })
                            }
                        }
                    });
                    let record = match handle.await {
                        Ok(record) => record,
                        Err(err) => {
                            error!(id = %document_id, "Document processing aborted: {err}");
                            unprocessed(&document_id, err.to_string())
                        }
                    };
                    BatchEntry {
                        document_id,
                        record,
                    }
                }
            })
            .buffered(jobs.max(1))
            .boxed();
        Ok(entries)
    }
}

/// A record for a document whose processing was aborted.
fn unprocessed(document_id: &str, error: String) -> ExtractionRecord {
    ExtractionRecord::Unprocessed(FailureRecord {
        filename: document_id.to_owned(),
        error,
    })
}

/// Counts of how each document in a batch turned out.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// How many documents did we see?
    pub total: usize,

    /// How many documents failed outright?
    pub failed: usize,

    /// How many documents had a document annotation we couldn't parse?
    pub document_parse_failures: usize,

    /// How many regions did we extract, across all documents?
    pub total_regions: usize,
}

impl BatchSummary {
    /// Count a record.
    pub fn update(&mut self, record: &ExtractionRecord) {
        self.total += 1;
        self.total_regions += record.total_regions();
        match record {
            _ if record.error().is_some() => self.failed += 1,
            ExtractionRecord::Extracted(result) if result.has_document_parse_error() => {
                self.document_parse_failures += 1;
            }
            _ => {}
        }
    }

    /// How many documents produced results?
    pub fn succeeded(&self) -> usize {
        self.total - self.failed
    }

    /// Report our counts, and fail if too many documents failed.
    pub fn finish(&self, ui: &Ui, allowed_failure_rate: f32) -> Result<()> {
        ui.display_message(
            "📊",
            &format!(
                "{}/{} documents extracted, {} regions",
                self.succeeded(),
                self.total,
                self.total_regions
            ),
        );
        if self.document_parse_failures > 0 {
            ui.display_message(
                "⚠️",
                &format!(
                    "{} document annotations could not be parsed",
                    self.document_parse_failures
                ),
            );
        }
        if self.total == 0 {
            return Ok(());
        }
        let failure_rate = self.failed as f32 / self.total as f32;
        if failure_rate > allowed_failure_rate {
            Err(anyhow!(
                "{}/{} ({:.2}%) of documents failed, but only {:.2}% were allowed",
                self.failed,
                self.total,
                failure_rate * 100.0,
                allowed_failure_rate * 100.0
            ))
        } else {
            if self.failed > 0 {
                ui.display_message(
                    "❌",
                    &format!("{} documents could not be processed", self.failed),
                );
            }
            Ok(())
        }
    }
}
