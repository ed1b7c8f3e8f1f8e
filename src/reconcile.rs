//! Reconciling OCR responses into extraction results.
//!
//! The service returns two independent annotation streams: one document
//! annotation, and one annotation per detected region. Either can be garbage.
//! We isolate failures to the smallest unit we can:
//!
//! - A bad document annotation is replaced by an error sentinel, and we still
//!   keep the OCR text and every region.
//! - A bad region annotation drops that region, and nothing else. This is
//!   deliberate, and it isn't reported as an error.
//! - A failed service call produces an error record with no data at all.

use std::{error, fmt};

use jsonschema::Validator;

use crate::{
    prelude::*,
    result::{
        DOCUMENT_PARSE_ERROR, ExtractionRecord, ExtractionResult, RegionAnnotation,
        ServiceFailure,
    },
    schema::OutputSchema,
    service::{OcrImage, OcrResponse, ServiceError},
};

/// Which annotation stream failed to parse.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnnotationKind {
    Document,
    Region,
}

impl fmt::Display for AnnotationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnnotationKind::Document => write!(f, "document"),
            AnnotationKind::Region => write!(f, "region"),
        }
    }
}

/// Why an annotation failed to parse.
#[derive(Debug)]
pub enum ParseFailure {
    /// The service didn't send an annotation.
    Missing,

    /// The annotation wasn't valid JSON.
    Json(serde_json::Error),

    /// The annotation was JSON, but not an object.
    NotAnObject,

    /// The annotation didn't match its schema.
    Schema(String),
}

/// An annotation which couldn't be parsed as its schema's structured type.
#[derive(Debug)]
pub struct AnnotationParseError {
    pub kind: AnnotationKind,
    pub failure: ParseFailure,
}

impl fmt::Display for AnnotationParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.kind;
        match &self.failure {
            ParseFailure::Missing => write!(f, "no {kind} annotation in response"),
            ParseFailure::Json(err) => write!(f, "{kind} annotation is not JSON: {err}"),
            ParseFailure::NotAnObject => write!(f, "{kind} annotation is not an object"),
            ParseFailure::Schema(msg) => {
                write!(f, "{kind} annotation does not match schema: {msg}")
            }
        }
    }
}

impl error::Error for AnnotationParseError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.failure {
            ParseFailure::Json(err) => Some(err),
            _ => None,
        }
    }
}

/// Turns raw OCR responses into [`ExtractionRecord`]s.
///
/// Holds compiled validators for both schemas, so build one per batch, not one
/// per document.
pub struct Reconciler {
    document_validator: Validator,
    region_validator: Validator,
}

impl Reconciler {
    /// Create a reconciler for the given schemas.
    pub fn new(document_schema: &OutputSchema, region_schema: &OutputSchema) -> Result<Self> {
        Ok(Self {
            document_validator: document_schema.validator()?,
            region_validator: region_schema.validator()?,
        })
    }

    /// Reconcile the outcome of a service call. Service failures become error
    /// records, with nothing else filled in.
    pub fn reconcile_outcome(
        &self,
        source_file: &str,
        outcome: Result<OcrResponse, ServiceError>,
    ) -> ExtractionRecord {
        match outcome {
            Ok(response) => ExtractionRecord::Extracted(self.reconcile(source_file, &response)),
            Err(err) => {
                error!(source_file, "OCR API call failed: {err}");
                ExtractionRecord::ServiceFailed(ServiceFailure {
                    error: err.to_string(),
                    source_file: source_file.to_owned(),
                })
            }
        }
    }

    /// Reconcile a successful response.
    pub fn reconcile(&self, source_file: &str, response: &OcrResponse) -> ExtractionResult {
        // Document fields first, falling back to the sentinel.
        let fields = match self.parse_annotation(
            AnnotationKind::Document,
            response.document_annotation.as_deref(),
        ) {
            Ok(fields) => fields,
            Err(err) => {
                warn!(source_file, "{err}");
                let mut sentinel = JsonObject::new();
                sentinel.insert(
                    "error".to_owned(),
                    Value::String(DOCUMENT_PARSE_ERROR.to_owned()),
                );
                sentinel
            }
        };

        // Then every region on every page, in order.
        let regions = response
            .pages
            .iter()
            .flat_map(|page| page.images.iter())
            .filter_map(|image| self.region_annotation(image))
            .collect::<Vec<_>>();

        let ocr_text = response
            .pages
            .iter()
            .map(|page| page.markdown.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let result = ExtractionResult::new(fields, source_file.to_owned(), ocr_text, regions);
        debug!(
            source_file,
            total_regions = result.total_regions,
            "Reconciled OCR response"
        );
        result
    }

    /// Build a region annotation, or `None` if the annotation doesn't parse.
    fn region_annotation(&self, image: &OcrImage) -> Option<RegionAnnotation> {
        let annotation = match self
            .parse_annotation(AnnotationKind::Region, image.image_annotation.as_deref())
        {
            Ok(annotation) => annotation,
            Err(err) => {
                // Dropped on purpose; the other regions are unaffected.
                debug!(region = %image.id, "Skipping region: {err}");
                return None;
            }
        };
        let bbox_coordinates = image.bounding_box();
        if let Some(bbox) = &bbox_coordinates {
            // We trust the service's coordinates, but make bad ones findable.
            if !bbox.is_well_ordered() {
                debug!(region = %image.id, ?bbox, "Bounding box corners are out of order");
            }
        }
        Some(RegionAnnotation {
            id: image.id.clone(),
            bbox_coordinates,
            annotation,
            has_image: image.has_image(),
        })
    }

    /// Parse an annotation string and check it against the matching schema.
    fn parse_annotation(
        &self,
        kind: AnnotationKind,
        annotation: Option<&str>,
    ) -> Result<JsonObject, AnnotationParseError> {
        let fail = |failure| AnnotationParseError { kind, failure };
        let annotation = annotation.ok_or_else(|| fail(ParseFailure::Missing))?;
        let value = serde_json::from_str::<Value>(annotation)
            .map_err(|err| fail(ParseFailure::Json(err)))?;
        let validator = match kind {
            AnnotationKind::Document => &self.document_validator,
            AnnotationKind::Region => &self.region_validator,
        };
        validator
            .validate(&value)
            .map_err(|err| fail(ParseFailure::Schema(err.to_string())))?;
        match value {
            Value::Object(map) => Ok(map),
            _ => Err(fail(ParseFailure::NotAnObject)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        profile::Profile,
        result::EXTRACTION_METHOD,
        schema::SchemaStrategy,
        service::testing::{image, page, response},
    };

    const INVOICE: &str = r#"{
        "invoice_number": "INV-42",
        "date": "2024-01-31",
        "total_amount": "120.00",
        "vendor_name": "ACME",
        "vendor_address": "1 Road",
        "line_items": [
            { "description": "Widget", "quantity": "2", "unit_price": "60.00", "total_price": "120.00" }
        ]
    }"#;

    const TABLE: &str = r#"{"type": "table", "content": "Widget 2 60.00", "confidence": "high"}"#;
    const AMOUNT: &str = r#"{"type": "amount", "content": "120.00", "confidence": "medium"}"#;

    fn reconciler() -> Reconciler {
        let profile = Profile::builtin("invoice").unwrap();
        Reconciler::new(
            &profile.document.build(SchemaStrategy::Direct).unwrap(),
            &profile.region.build(SchemaStrategy::Direct).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_happy_path() {
        let response = response(
            INVOICE,
            vec![
                page(0, "A", vec![image("img-0.jpeg", TABLE)]),
                page(1, "B", vec![image("img-1.jpeg", AMOUNT)]),
            ],
        );
        let result = reconciler().reconcile("data/input/a.pdf", &response);
        assert_eq!(result.fields["invoice_number"], "INV-42");
        assert_eq!(result.source_file, "data/input/a.pdf");
        assert_eq!(result.ocr_text, "A\nB");
        assert_eq!(result.extraction_method, EXTRACTION_METHOD);
        assert_eq!(result.total_regions, 2);
        assert_eq!(
            result
                .bbox_annotations
                .iter()
                .map(|r| r.id.as_str())
                .collect::<Vec<_>>(),
            ["img-0.jpeg", "img-1.jpeg"]
        );
        assert_eq!(result.bbox_annotations[0].annotation["type"], "table");
        assert!(!result.has_document_parse_error());
    }

    #[test]
    fn test_single_page_text() {
        let response = response(INVOICE, vec![page(0, "Hello", vec![])]);
        let result = reconciler().reconcile("a.pdf", &response);
        assert_eq!(result.ocr_text, "Hello");
        assert_eq!(result.total_regions, 0);
    }

    #[test]
    fn test_bad_region_is_dropped() {
        let response = response(
            INVOICE,
            vec![page(
                0,
                "A",
                vec![
                    image("img-0.jpeg", TABLE),
                    image("img-1.jpeg", "{not json"),
                    image("img-2.jpeg", AMOUNT),
                ],
            )],
        );
        let result = reconciler().reconcile("a.pdf", &response);
        assert_eq!(result.total_regions, 2);
        assert_eq!(result.bbox_annotations.len(), result.total_regions);
        assert_eq!(result.bbox_annotations[0].id, "img-0.jpeg");
        assert_eq!(result.bbox_annotations[1].id, "img-2.jpeg");
        // Document fields are untouched.
        assert_eq!(result.fields["invoice_number"], "INV-42");
        assert!(!result.has_document_parse_error());
    }

    #[test]
    fn test_region_violating_schema_is_dropped() {
        let unknown_type = r#"{"type": "signature", "content": "x", "confidence": "low"}"#;
        let extra_field =
            r#"{"type": "text", "content": "x", "confidence": "low", "color": "red"}"#;
        let mut missing = image("img-2.jpeg", "");
        missing.image_annotation = None;
        let response = response(
            INVOICE,
            vec![page(
                0,
                "A",
                vec![
                    image("img-0.jpeg", unknown_type),
                    image("img-1.jpeg", extra_field),
                    missing,
                    image("img-3.jpeg", "[1, 2]"),
                    image("img-4.jpeg", TABLE),
                ],
            )],
        );
        let result = reconciler().reconcile("a.pdf", &response);
        assert_eq!(result.total_regions, 1);
        assert_eq!(result.bbox_annotations[0].id, "img-4.jpeg");
    }

    #[test]
    fn test_bad_document_annotation_keeps_everything_else() {
        for bad in ["{oops", r#"{"invoice_number": "1"}"#, "42"] {
            let response = response(
                bad,
                vec![
                    page(0, "A", vec![image("img-0.jpeg", TABLE)]),
                    page(1, "B", vec![]),
                ],
            );
            let result = reconciler().reconcile("a.pdf", &response);
            assert!(result.has_document_parse_error(), "{bad}");
            assert_eq!(result.fields.len(), 1);
            assert_eq!(result.fields["error"], DOCUMENT_PARSE_ERROR);
            assert_eq!(result.ocr_text, "A\nB");
            assert_eq!(result.source_file, "a.pdf");
            assert_eq!(result.total_regions, 1);
        }
    }

    #[test]
    fn test_missing_document_annotation() {
        let mut response = response(INVOICE, vec![page(0, "A", vec![])]);
        response.document_annotation = None;
        let result = reconciler().reconcile("a.pdf", &response);
        assert!(result.has_document_parse_error());
        assert_eq!(result.ocr_text, "A");
    }

    #[test]
    fn test_region_details() {
        let mut with_bytes = image("img-0.jpeg", TABLE);
        with_bytes.image_base64 = Some("data:image/jpeg;base64,/9j/".to_owned());
        let mut no_bbox = image("img-1.jpeg", TABLE);
        no_bbox.top_left_x = None;
        let mut backwards = image("img-2.jpeg", TABLE);
        backwards.top_left_x = Some(500);
        let response = response(INVOICE, vec![page(0, "A", vec![with_bytes, no_bbox, backwards])]);
        let result = reconciler().reconcile("a.pdf", &response);
        let regions = &result.bbox_annotations;
        assert!(regions[0].has_image);
        assert!(regions[0].bbox_coordinates.is_some());
        assert!(!regions[1].has_image);
        assert_eq!(regions[1].bbox_coordinates, None);
        // Out-of-order coordinates are passed through untouched.
        assert_eq!(regions[2].bbox_coordinates.unwrap().top_left_x, 500);

        let value = serde_json::to_value(&regions[1]).unwrap();
        assert!(value.get("bbox_coordinates").is_none());
    }

    #[test]
    fn test_service_failure() {
        let record = reconciler().reconcile_outcome("a.pdf", Err(ServiceError::Timeout));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value,
            json!({ "error": "OCR request timed out", "source_file": "a.pdf" })
        );
    }

    #[test]
    fn test_empty_response() {
        let result = reconciler().reconcile("a.pdf", &OcrResponse::default());
        assert!(result.has_document_parse_error());
        assert_eq!(result.ocr_text, "");
        assert_eq!(result.total_regions, 0);
    }

    #[test]
    fn test_parse_error_messages() {
        let err = reconciler()
            .parse_annotation(AnnotationKind::Region, Some("{"))
            .unwrap_err();
        assert!(err.to_string().starts_with("region annotation is not JSON"), "{err}");
        let err = reconciler()
            .parse_annotation(AnnotationKind::Document, None)
            .unwrap_err();
        assert_eq!(err.to_string(), "no document annotation in response");
    }
}
