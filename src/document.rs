//! Input documents.

use tokio::fs;

use crate::prelude::*;

/// Document bytes plus an identifier. We never modify or delete the
/// underlying file; it belongs to whoever gave it to us.
#[derive(Clone)]
pub struct Document {
    /// Identifier reported as `source_file`. Usually a path.
    pub id: String,

    /// The raw bytes, which should be a PDF, although we don't check.
    pub data: Vec<u8>,
}

impl Document {
    /// Create a document from bytes already in memory.
    pub fn new(id: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }

    /// Read a document from disk.
    pub async fn read(path: &Path) -> Result<Self> {
        let data = fs::read(path)
            .await
            .with_context(|| format!("failed to read document {:?}", path))?;
        Ok(Self::new(path.display().to_string(), data))
    }
}

// Don't dump megabytes of PDF into our logs.
impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.id)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Where to find a document for a batch.
#[derive(Debug, Clone)]
pub enum DocumentSource {
    /// A file on disk, read when it's processed.
    File(PathBuf),

    /// A document already in memory, such as one read from standard input.
    Memory(Document),
}

impl DocumentSource {
    /// The identifier for this document.
    pub fn id(&self) -> String {
        match self {
            DocumentSource::File(path) => path.display().to_string(),
            DocumentSource::Memory(document) => document.id.clone(),
        }
    }

    /// Load the document bytes.
    pub async fn load(self) -> Result<Document> {
        match self {
            DocumentSource::File(path) => Document::read(&path).await,
            DocumentSource::Memory(document) => Ok(document),
        }
    }
}

/// The file stem of a document identifier, used to name output files.
pub fn output_stem(id: &str) -> String {
    Path::new(id)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_stem() {
        assert_eq!(output_stem("data/input/invoice-001.pdf"), "invoice-001");
        assert_eq!(output_stem("scan.final.PDF"), "scan.final");
        assert_eq!(output_stem(""), "document");
    }

    #[test]
    fn test_debug_hides_bytes() {
        let document = Document::new("a.pdf", vec![b'x'; 1000]);
        let debug = format!("{:?}", document);
        assert!(debug.contains("len: 1000"), "{debug}");
        assert!(!debug.contains("xxx"));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = DocumentSource::File(dir.path().join("missing.pdf"));
        let id = source.id();
        let err = source.load().await.unwrap_err();
        assert!(id.ends_with("missing.pdf"));
        assert!(err.to_string().contains("failed to read document"));
    }
}
