//! Extraction results.
//!
//! Every input document produces exactly one [`ExtractionRecord`]. Callers
//! tell successes from failures by the presence of an `error` key, so these
//! types serialize as flat JSON objects with no variant tags.

use schemars::JsonSchema;

use crate::prelude::*;

/// Value of `extraction_method`, recording that both a document annotation and
/// per-region annotations were requested.
pub const EXTRACTION_METHOD: &str = "document + bbox";

/// Sentinel stored under `error` when the document annotation can't be parsed.
pub const DOCUMENT_PARSE_ERROR: &str = "Failed to parse document annotation";

/// Keys we always set ourselves. These override any structured document field
/// with the same name.
pub const RESERVED_KEYS: &[&str] = &[
    "source_file",
    "ocr_text",
    "bbox_annotations",
    "extraction_method",
    "total_regions",
];

/// Pixel coordinates of a region on its page.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BoundingBox {
    pub top_left_x: i64,
    pub top_left_y: i64,
    pub bottom_right_x: i64,
    pub bottom_right_y: i64,
}

impl BoundingBox {
    /// Is the top-left corner really above and to the left of the
    /// bottom-right corner?
    pub fn is_well_ordered(&self) -> bool {
        self.top_left_x <= self.bottom_right_x && self.top_left_y <= self.bottom_right_y
    }
}

/// One annotated region.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RegionAnnotation {
    /// The service's identifier for this region.
    pub id: String,

    /// Where the region is, if the service told us.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox_coordinates: Option<BoundingBox>,

    /// The region annotation, matching the region schema.
    pub annotation: JsonObject,

    /// Did the service send image bytes for this region?
    pub has_image: bool,
}

/// A successful extraction. The document annotation may still have failed to
/// parse, in which case `fields` holds only the `error` sentinel.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct ExtractionResult {
    /// Structured fields from the document annotation.
    #[serde(flatten)]
    pub fields: JsonObject,

    /// The document identifier.
    pub source_file: String,

    /// Recognized text of every page, joined with newlines.
    pub ocr_text: String,

    /// Every region annotation that parsed, in service order.
    pub bbox_annotations: Vec<RegionAnnotation>,

    /// Always [`EXTRACTION_METHOD`].
    pub extraction_method: String,

    /// Always `bbox_annotations.len()`.
    pub total_regions: usize,
}

impl ExtractionResult {
    /// Merge document fields with everything else we know.
    ///
    /// Any document field named like one of [`RESERVED_KEYS`] is discarded in
    /// favor of our own value.
    pub fn new(
        mut fields: JsonObject,
        source_file: String,
        ocr_text: String,
        bbox_annotations: Vec<RegionAnnotation>,
    ) -> Self {
        fields.retain(|key, _| {
            let reserved = RESERVED_KEYS.contains(&key.as_str());
            if reserved {
                debug!(%key, "document field shadowed by reserved key");
            }
            !reserved
        });
        Self {
            fields,
            source_file,
            ocr_text,
            total_regions: bbox_annotations.len(),
            bbox_annotations,
            extraction_method: EXTRACTION_METHOD.to_owned(),
        }
    }

    /// Did the document annotation fail to parse?
    pub fn has_document_parse_error(&self) -> bool {
        self.fields.get("error").and_then(Value::as_str) == Some(DOCUMENT_PARSE_ERROR)
    }
}

/// The OCR service call failed, so we have no data at all.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceFailure {
    /// What went wrong.
    pub error: String,

    /// The document identifier.
    pub source_file: String,
}

/// The document couldn't be processed at all, for reasons other than the
/// service call. Usually this means we couldn't read it.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FailureRecord {
    /// The document identifier.
    pub filename: String,

    /// What went wrong.
    pub error: String,
}

/// The outcome for a single document.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ExtractionRecord {
    Extracted(ExtractionResult),
    ServiceFailed(ServiceFailure),
    Unprocessed(FailureRecord),
}

impl ExtractionRecord {
    /// The error message, if this document failed outright.
    pub fn error(&self) -> Option<&str> {
        match self {
            ExtractionRecord::Extracted(_) => None,
            ExtractionRecord::ServiceFailed(failure) => Some(&failure.error),
            ExtractionRecord::Unprocessed(failure) => Some(&failure.error),
        }
    }

    /// How many regions did we extract?
    pub fn total_regions(&self) -> usize {
        match self {
            ExtractionRecord::Extracted(result) => result.total_regions,
            _ => 0,
        }
    }
}

/// One entry in a batch result. A batch yields one entry per input
/// document, in input order.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchEntry {
    /// The document identifier, as given in the input.
    pub document_id: String,

    /// What happened to it.
    pub record: ExtractionRecord,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(id: &str) -> RegionAnnotation {
        RegionAnnotation {
            id: id.to_owned(),
            bbox_coordinates: Some(BoundingBox {
                top_left_x: 10,
                top_left_y: 20,
                bottom_right_x: 110,
                bottom_right_y: 220,
            }),
            annotation: json!({ "type": "table", "content": "Total: 5" })
                .as_object()
                .unwrap()
                .clone(),
            has_image: false,
        }
    }

    #[test]
    fn test_reserved_keys_win() {
        let fields = json!({
            "invoice_number": "INV-1",
            "source_file": "bogus.pdf",
            "total_regions": 99,
        });
        let result = ExtractionResult::new(
            fields.as_object().unwrap().clone(),
            "real.pdf".to_owned(),
            "text".to_owned(),
            vec![region("img-0.jpeg")],
        );
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["source_file"], "real.pdf");
        assert_eq!(value["total_regions"], 1);
        assert_eq!(value["invoice_number"], "INV-1");
        assert_eq!(value["extraction_method"], EXTRACTION_METHOD);

        // No duplicated keys in the serialized text.
        let text = serde_json::to_string(&result).unwrap();
        assert_eq!(text.matches("\"source_file\"").count(), 1);
    }

    #[test]
    fn test_round_trip() {
        let extracted = ExtractionRecord::Extracted(ExtractionResult::new(
            json!({ "invoice_number": "007", "line_items": ["a - 1"] })
                .as_object()
                .unwrap()
                .clone(),
            "a.pdf".to_owned(),
            "A\nB".to_owned(),
            vec![region("img-0.jpeg"), region("img-1.jpeg")],
        ));
        let service_failed = ExtractionRecord::ServiceFailed(ServiceFailure {
            error: "boom".to_owned(),
            source_file: "b.pdf".to_owned(),
        });
        let unprocessed = ExtractionRecord::Unprocessed(FailureRecord {
            filename: "c.pdf".to_owned(),
            error: "unreadable".to_owned(),
        });
        for record in [extracted, service_failed, unprocessed] {
            let text = serde_json::to_string(&record).unwrap();
            let parsed: ExtractionRecord = serde_json::from_str(&text).unwrap();
            assert_eq!(parsed, record);
        }
    }

    #[test]
    fn test_service_failure_has_exactly_two_keys() {
        let record = ExtractionRecord::ServiceFailed(ServiceFailure {
            error: "timeout".to_owned(),
            source_file: "x.pdf".to_owned(),
        });
        let value = serde_json::to_value(&record).unwrap();
        let mut keys = value.as_object().unwrap().keys().cloned().collect::<Vec<_>>();
        keys.sort();
        assert_eq!(keys, ["error", "source_file"]);
        assert_eq!(record.error(), Some("timeout"));
        assert_eq!(record.total_regions(), 0);
    }

    #[test]
    fn test_document_parse_error_sentinel() {
        let fields = json!({ "error": DOCUMENT_PARSE_ERROR });
        let result = ExtractionResult::new(
            fields.as_object().unwrap().clone(),
            "a.pdf".to_owned(),
            String::new(),
            vec![],
        );
        assert!(result.has_document_parse_error());
        let record = ExtractionRecord::Extracted(result);
        // A recovered parse failure is not a failed document.
        assert_eq!(record.error(), None);
    }

    #[test]
    fn test_bounding_box_order() {
        let mut bbox = region("r").bbox_coordinates.unwrap();
        assert!(bbox.is_well_ordered());
        bbox.bottom_right_x = 0;
        assert!(!bbox.is_well_ordered());
    }
}
