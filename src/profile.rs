//! Extraction profiles.
//!
//! A profile names the two schemas we send with every request: one describing
//! the whole document, and one describing each detected region. Different
//! kinds of documents are handled by different profiles, not by different
//! code.

use crate::{
    async_utils::io::read_json_or_toml,
    prelude::*,
    schema::{FieldSpec, OutputSchema, SchemaError, SchemaStrategy, build_schema},
};

/// Invoices with nested line items, regions classified by content type.
const INVOICE_PROFILE: &str = include_str!("profile/invoice.toml");

/// Invoices with string line items, regions classified as images.
const INVOICE_LINES_PROFILE: &str = include_str!("profile/invoice_lines.toml");

/// Names of our built-in profiles.
pub const BUILTIN_PROFILES: &[&str] = &["invoice", "invoice-lines"];

/// The fields of one schema, plus its name.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SchemaSpec {
    /// The name reported to the OCR service.
    pub name: String,

    /// The fields in this schema.
    pub fields: Vec<FieldSpec>,
}

impl SchemaSpec {
    /// Build an [`OutputSchema`] from this specification.
    pub fn build(&self, strategy: SchemaStrategy) -> Result<OutputSchema, SchemaError> {
        build_schema(&self.fields, &self.name, strategy)
    }
}

/// A document schema and a region schema, used together.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    /// Should the service return image bytes for each region?
    #[serde(default)]
    pub include_image_base64: bool,

    /// Structured fields for the whole document.
    pub document: SchemaSpec,

    /// Structured fields for each detected region.
    pub region: SchemaSpec,
}

impl Profile {
    /// Look up a built-in profile by name.
    pub fn builtin(name: &str) -> Option<Profile> {
        let toml_str = match name {
            "invoice" => INVOICE_PROFILE,
            "invoice-lines" => INVOICE_LINES_PROFILE,
            _ => return None,
        };
        Some(toml::from_str(toml_str).expect("failed to parse built-in profile"))
    }

    /// Load a profile, either by built-in name or from a TOML or JSON file.
    pub async fn load(name_or_path: &str) -> Result<Profile> {
        if let Some(profile) = Self::builtin(name_or_path) {
            return Ok(profile);
        }
        let path = Path::new(name_or_path);
        if !path.exists() {
            return Err(anyhow!(
                "unknown profile {:?} (built-in profiles: {})",
                name_or_path,
                BUILTIN_PROFILES.join(", ")
            ));
        }
        read_json_or_toml::<Profile>(path).await
    }
}
