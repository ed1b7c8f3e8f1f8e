//! The `schema` subcommand.

use clap::{Args, ValueEnum};
use schemars::schema_for;
use tokio::io::AsyncWriteExt as _;

use crate::{
    async_utils::io::create_writer, prelude::*, profile::Profile, result::ExtractionRecord,
    schema::SchemaStrategy,
};

/// The different schema types we support.
#[derive(Debug, Default, Clone, Copy, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum SchemaType {
    /// The document annotation schema sent to the OCR service.
    #[default]
    Document,
    /// The region annotation schema sent to the OCR service.
    Region,
    /// The records we write for each document.
    Result,
}

/// Schema command line arguments.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// The schema type to generate.
    #[clap(value_enum, value_name = "TYPE", default_value_t = SchemaType::default())]
    pub schema_type: SchemaType,

    /// A built-in profile name, or the path to a TOML or JSON profile.
    #[clap(long, default_value = "invoice")]
    pub profile: String,

    /// How to build output schemas from the profile.
    #[clap(long, value_enum, default_value_t = SchemaStrategy::default())]
    pub schema_strategy: SchemaStrategy,

    /// The output path to write the schema to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `schema` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_schema(schema_opts: &SchemaOpts) -> Result<()> {
    let schema = match schema_opts.schema_type {
        SchemaType::Document | SchemaType::Region => {
            let profile = Profile::load(&schema_opts.profile).await?;
            let spec = match schema_opts.schema_type {
                SchemaType::Document => &profile.document,
                _ => &profile.region,
            };
            spec.build(schema_opts.schema_strategy)?.to_response_format()
        }
        SchemaType::Result => serde_json::to_value(schema_for!(ExtractionRecord))
            .context("failed to serialize schema")?,
    };

    // Write out our schema.
    let mut wtr = create_writer(schema_opts.output_path.as_deref()).await?;
    let schema_str =
        serde_json::to_string_pretty(&schema).context("failed to serialize schema")?;
    wtr.write_all(schema_str.as_bytes())
        .await
        .context("failed to write schema")?;
    wtr.write_all(b"\n").await.context("failed to write schema")?;
    wtr.flush().await.context("failed to flush schema")?;
    Ok(())
}
