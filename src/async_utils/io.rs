//! I/O utilities.
//!
//! This module is responsible for reading JSON and TOML configuration, finding
//! input documents, and writing results as either one pretty-printed JSON file
//! per document or as JSONL.

use serde::{Serialize, de::DeserializeOwned};
use tokio::{
    fs::{self, File},
    io::{AsyncWrite, AsyncWriteExt as _, BufWriter},
};

use crate::prelude::*;

/// Read TOML or JSON from a file, choosing the format by extension.
pub async fn read_json_or_toml<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    // Read all at once because our parsing libraries don't do async I/O.
    let data = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read file at path: {:?}", path))?;
    let ext = path.extension().unwrap_or_default();
    if ext == "json" {
        serde_json::from_str(&data).with_context(|| {
            format!("Failed to parse JSON from file at path: {:?}", path)
        })
    } else {
        toml::from_str(&data).with_context(|| {
            format!("Failed to parse TOML from file at path: {:?}", path)
        })
    }
}

/// Does this path look like a PDF? We only check the extension, ignoring case.
pub fn has_pdf_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
}

/// List the PDF files directly inside `dir`, sorted by path.
///
/// Comparing extensions case-insensitively means `a.pdf` and `a.PDF` are both
/// found, but each directory entry is only visited once, so we never list the
/// same file twice on case-insensitive filesystems.
pub async fn list_pdfs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("Input directory {:?} does not exist", dir))?;
    let mut paths = vec![];
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("Failed to read directory {:?}", dir))?
    {
        let path = entry.path();
        let file_type = entry
            .file_type()
            .await
            .with_context(|| format!("Failed to stat {:?}", path))?;
        if file_type.is_file() && has_pdf_extension(&path) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Create an [`AsyncWrite`] for a file or stdout.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Write `value` as pretty-printed JSON to `path`, replacing any existing
/// file.
pub async fn write_json_pretty<T>(path: &Path, value: &T) -> Result<()>
where
    T: Serialize,
{
    let json = serde_json::to_string_pretty(value)
        .with_context(|| format!("Failed to serialize JSON for {:?}", path))?;
    let mut writer = create_writer(Some(path)).await?;
    writer
        .write_all(json.as_bytes())
        .await
        .with_context(|| format!("Failed to write JSON to {:?}", path))?;
    writer
        .flush()
        .await
        .with_context(|| format!("Failed to flush {:?}", path))?;
    Ok(())
}

/// Writes one JSON value per line to a file or to standard output.
pub struct JsonlWriter {
    writer: BufWriter<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>>,
}

impl JsonlWriter {
    /// Create a new writer. `None` means standard output.
    pub async fn new(path: Option<&Path>) -> Result<Self> {
        Ok(Self {
            writer: BufWriter::new(create_writer(path).await?),
        })
    }

    /// Write a single record.
    pub async fn write<T>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        let json = serde_json::to_string(value).context("Failed to serialize JSON")?;
        self.writer
            .write_all(json.as_bytes())
            .await
            .context("Failed to write JSON to output")?;
        self.writer
            .write_all(b"\n")
            .await
            .context("Failed to write newline to output")?;
        Ok(())
    }

    /// Flush all buffered output.
    pub async fn finish(mut self) -> Result<()> {
        self.writer.flush().await.context("Failed to flush output")
    }
}
