//! The `extract` subcommand.

use std::{collections::HashSet, sync::Arc};

use clap::Args;
use futures::StreamExt as _;
use tokio::{fs, io::AsyncReadExt as _};

use crate::{
    async_utils::io::{JsonlWriter, has_pdf_extension, list_pdfs, write_json_pretty},
    batch::{BatchSummary, Extractor},
    document::{Document, DocumentSource, output_stem},
    prelude::*,
    profile::Profile,
    schema::SchemaStrategy,
    service::ServiceOpts,
    ui::{ProgressConfig, Ui},
};

/// Where we look for documents if none are given.
const DEFAULT_INPUT_DIR: &str = "data/input";

/// Where we write results by default.
const DEFAULT_OUTPUT_DIR: &str = "data/output";

/// The document identifier used for a PDF read from standard input.
const STDIN_ID: &str = "stdin";

/// Extract command line arguments.
#[derive(Debug, Args)]
pub struct ExtractOpts {
    /// PDF files or directories containing PDF files. Directories are not
    /// searched recursively. Use `-` to read one PDF from standard input.
    /// Defaults to `data/input`.
    #[clap(value_name = "INPUT")]
    pub inputs: Vec<PathBuf>,

    /// Write one `<stem>.json` file per document to this directory.
    #[clap(long, default_value = DEFAULT_OUTPUT_DIR)]
    pub out_dir: PathBuf,

    /// Write one JSON record per line to standard output, instead of writing
    /// files.
    #[clap(long, conflicts_with = "out_dir")]
    pub jsonl: bool,

    /// A built-in profile name (`invoice` or `invoice-lines`), or the path
    /// to a TOML or JSON profile.
    #[clap(long, default_value = "invoice")]
    pub profile: String,

    /// How to build output schemas from the profile.
    #[clap(long, value_enum, default_value_t = SchemaStrategy::default())]
    pub schema_strategy: SchemaStrategy,

    /// Max number of documents to process at a time.
    #[clap(short = 'j', long = "jobs", default_value_t = 1)]
    pub jobs: usize,

    /// What portion of documents should we allow to fail? Specified as a
    /// number between 0.0 and 1.0.
    #[clap(long, default_value_t = 1.0)]
    pub allowed_failure_rate: f32,

    #[clap(flatten)]
    pub service_opts: ServiceOpts,
}

/// The `extract` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_extract(ui: Ui, opts: &ExtractOpts) -> Result<()> {
    let profile = Profile::load(&opts.profile).await?;

    let sources = find_documents(&opts.inputs).await?;
    if sources.is_empty() {
        warn!("No PDF files found to process");
        return Ok(());
    }
    info!(count = sources.len(), "Found PDF files to process");

    let service = opts.service_opts.create_service().await?;
    let extractor = Arc::new(Extractor::new(
        service,
        &profile,
        opts.schema_strategy,
        opts.service_opts.request_opts(&profile),
    )?);

    let mut jsonl = if opts.jsonl {
        Some(JsonlWriter::new(None).await?)
    } else {
        fs::create_dir_all(&opts.out_dir)
            .await
            .with_context(|| format!("failed to create {:?}", opts.out_dir))?;
        None
    };

    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "📄",
            msg: "Extracting documents",
            done_msg: "Extracted documents",
        },
        sources.len() as u64,
    );

    let mut summary = BatchSummary::default();
    let mut output_names = OutputNames::default();
    let mut entries = extractor.process_batch(sources, opts.jobs)?;
    while let Some(entry) = entries.next().await {
        summary.update(&entry.record);
        match &mut jsonl {
            Some(writer) => writer.write(&entry.record).await?,
            None => {
                let file_name = output_names.assign(&entry.document_id);
                let path = opts.out_dir.join(&file_name);
                write_json_pretty(&path, &entry.record).await?;
                debug!(id = %entry.document_id, path = %path.display(), "Wrote result");
            }
        }
        pb.inc(1);
    }
    if let Some(writer) = jsonl {
        writer.finish().await?;
    }
    drop(pb);

    if !opts.jsonl {
        info!("Results saved to {}", opts.out_dir.display());
    }
    summary.finish(&ui, opts.allowed_failure_rate)
}

/// Picks a distinct output file name for each document.
///
/// Two inputs can share a stem (`a.pdf` and `a.PDF`, or `x/a.pdf` and
/// `y/a.pdf`). The first keeps `a.json`, and later ones get `a.2.json`,
/// `a.3.json` and so on. Names are compared ignoring case, so results don't
/// collide on case-insensitive filesystems either.
#[derive(Debug, Default)]
struct OutputNames {
    taken: HashSet<String>,
}

impl OutputNames {
    /// Reserve a file name for `document_id`.
    fn assign(&mut self, document_id: &str) -> String {
        let stem = output_stem(document_id);
        let mut file_name = format!("{stem}.json");
        let mut n = 2;
        while !self.taken.insert(file_name.to_lowercase()) {
            file_name = format!("{stem}.{n}.json");
            n += 1;
        }
        if n > 2 {
            warn!(id = %document_id, "Output name for {stem} already used, writing {file_name}");
        }
        file_name
    }
}

/// Expand our inputs into a list of documents.
///
/// Directories (and anything which isn't obviously a PDF) must exist. A PDF
/// path which doesn't exist is passed through, and fails on its own without
/// affecting the rest of the batch.
async fn find_documents(inputs: &[PathBuf]) -> Result<Vec<DocumentSource>> {
    let default_inputs = [PathBuf::from(DEFAULT_INPUT_DIR)];
    let inputs = if inputs.is_empty() {
        &default_inputs[..]
    } else {
        inputs
    };

    let mut sources = vec![];
    let mut read_stdin = false;
    for input in inputs {
        if input.as_os_str() == "-" {
            if read_stdin {
                return Err(anyhow!("standard input (`-`) can only be read once"));
            }
            read_stdin = true;
            sources.push(DocumentSource::Memory(read_stdin_document().await?));
            continue;
        }

        let metadata = fs::metadata(input).await.ok();
        match metadata {
            Some(metadata) if metadata.is_file() => {
                if !has_pdf_extension(input) {
                    return Err(anyhow!(
                        "Input {:?} is not a PDF file or a directory",
                        input
                    ));
                }
                sources.push(DocumentSource::File(input.to_owned()));
            }
            None if has_pdf_extension(input) => {
                sources.push(DocumentSource::File(input.to_owned()));
            }
            _ => {
                let paths = list_pdfs(input).await?;
                if paths.is_empty() {
                    warn!("No PDF files found in {}", input.display());
                }
                sources.extend(paths.into_iter().map(DocumentSource::File));
            }
        }
    }
    Ok(sources)
}

/// Read a single PDF from standard input.
async fn read_stdin_document() -> Result<Document> {
    let mut data = vec![];
    tokio::io::stdin()
        .read_to_end(&mut data)
        .await
        .context("failed to read document from standard input")?;
    Ok(Document::new(STDIN_ID, data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_find_documents() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.pdf", "a.PDF", "notes.txt"] {
            fs::write(dir.path().join(name), b"%PDF").await.unwrap();
        }
        fs::create_dir(dir.path().join("nested.pdf")).await.unwrap();
        let extra = PathBuf::from("elsewhere/missing.pdf");

        let sources = find_documents(&[dir.path().to_owned(), extra.clone()])
            .await
            .unwrap();
        let ids = sources.iter().map(|s| s.id()).collect::<Vec<_>>();
        assert_eq!(
            ids,
            [
                dir.path().join("a.PDF").display().to_string(),
                dir.path().join("b.pdf").display().to_string(),
                extra.display().to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_non_pdf_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let notes = dir.path().join("notes.txt");
        fs::write(&notes, b"hello").await.unwrap();
        let err = find_documents(&[notes]).await.unwrap_err();
        assert!(
            err.to_string().contains("is not a PDF file or a directory"),
            "{err}"
        );
    }

    #[test]
    fn test_output_names_are_distinct() {
        let mut names = OutputNames::default();
        let assigned = ["in/a.pdf", "in/a.PDF", "other/a.pdf", "in/b.pdf", "in/A.pdf"]
            .iter()
            .map(|id| names.assign(id))
            .collect::<Vec<_>>();
        assert_eq!(
            assigned,
            ["a.json", "a.2.json", "a.3.json", "b.json", "A.4.json"]
        );
    }

    #[test]
    fn test_output_names_skip_existing_suffixes() {
        let mut names = OutputNames::default();
        assert_eq!(names.assign("a.2.pdf"), "a.2.json");
        assert_eq!(names.assign("a.pdf"), "a.json");
        assert_eq!(names.assign("x/a.pdf"), "a.3.json");
    }

    #[tokio::test]
    async fn test_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("input");
        let err = find_documents(&[missing]).await.unwrap_err();
        assert!(err.to_string().contains("does not exist"), "{err}");
    }
}
