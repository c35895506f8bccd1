//! Lifter Ingest - OpenPowerlifting ingestion tool

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lifter_common::logging::{init_logging, LogConfig, LogLevel};
use lifter_ingest::{
    storage, ArtifactKey, ContentAddresser, DigestScope, GateStrategy, IngestConfig,
    IngestPipeline, MalformedRowPolicy, MemberSelector, OutputFormat,
};
use lifter_ingest::extract::Extractor;
use lifter_ingest::manifest::ManifestStore;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "lifter-ingest")]
#[command(author, version, about = "Idempotent OpenPowerlifting ingestion tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch, dedup, enrich and publish the latest export
    Run(RunArgs),

    /// Print the digest and artifact key of a local archive
    Digest {
        /// Archive to hash
        archive: PathBuf,

        #[arg(long, default_value_t = DigestScope::Archive)]
        scope: DigestScope,

        /// Data member base name (member scope only)
        #[arg(long)]
        member_name: Option<String>,

        #[arg(long, default_value_t = OutputFormat::Parquet)]
        format: OutputFormat,
    },

    /// Inspect the publication manifest
    Manifest {
        #[command(subcommand)]
        action: ManifestAction,
    },
}

#[derive(Subcommand, Debug)]
enum ManifestAction {
    /// Print the manifest as JSON
    Show {
        /// Manifest file (defaults to LIFTER_MANIFEST_PATH)
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

/// Overrides for values otherwise taken from `LIFTER_*` variables
#[derive(clap::Args, Debug)]
struct RunArgs {
    #[arg(long)]
    source_url: Option<String>,

    #[arg(long)]
    namespace: Option<String>,

    #[arg(long)]
    staging_dir: Option<PathBuf>,

    /// Publish to this directory instead of S3
    #[arg(long)]
    dest_dir: Option<PathBuf>,

    #[arg(long)]
    format: Option<OutputFormat>,

    #[arg(long)]
    gate: Option<GateStrategy>,

    #[arg(long)]
    manifest: Option<PathBuf>,

    #[arg(long)]
    malformed_rows: Option<MalformedRowPolicy>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    digest_scope: Option<DigestScope>,

    /// Data member base name, when the archive holds several candidates
    #[arg(long)]
    member_name: Option<String>,

    /// Show a download progress bar
    #[arg(long)]
    progress: bool,
}

impl RunArgs {
    fn apply(self, mut config: IngestConfig) -> IngestConfig {
        if let Some(url) = self.source_url {
            config.source_url = url;
        }
        if let Some(namespace) = self.namespace {
            config.namespace = namespace;
        }
        if let Some(dir) = self.staging_dir {
            config.staging_dir = dir;
        }
        if let Some(format) = self.format {
            config.output_format = format;
        }
        if let Some(gate) = self.gate {
            config.gate = gate;
        }
        if let Some(path) = self.manifest {
            config.manifest_path = path;
        }
        if let Some(policy) = self.malformed_rows {
            config.malformed_rows = policy;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(scope) = self.digest_scope {
            config.digest_scope = scope;
        }
        if self.member_name.is_some() {
            config.member.name = self.member_name;
        }
        if self.progress {
            config.show_progress = true;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over the flag
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("lifter-ingest")
        .build()
        .merge_env()?;

    init_logging(&log_config)?;

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Digest {
            archive,
            scope,
            member_name,
            format,
        } => digest(archive, scope, member_name, format),
        Command::Manifest {
            action: ManifestAction::Show { path },
        } => show_manifest(path),
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let dest_dir = args.dest_dir.clone();
    let config = args.apply(IngestConfig::from_env()?);
    config.validate()?;

    let destination = match dest_dir {
        Some(root) => storage::Destination::Local { root },
        None => storage::Destination::from_env()?,
    };
    info!(destination = %destination.describe(), "Publishing destination");

    let store = storage::connect(&destination, config.request_timeout()).await?;
    let pipeline = IngestPipeline::new(config, store)?;

    let summary = pipeline.run().await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn digest(
    archive: PathBuf,
    scope: DigestScope,
    member_name: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let config = IngestConfig::from_env()?;
    let selector = MemberSelector {
        name: member_name.or(config.member.name),
        ..config.member
    };

    let addresser = ContentAddresser::new(scope, Extractor::new(selector));
    let digest = addresser
        .address_path(&archive)
        .with_context(|| format!("Failed to digest {}", archive.display()))?;
    let key = ArtifactKey::new(
        &config.namespace,
        &config.artifact_prefix,
        &digest,
        format.extension(),
    );

    println!("{}  {}", digest, key);
    Ok(())
}

fn show_manifest(path: Option<PathBuf>) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => IngestConfig::from_env()?.manifest_path,
    };

    let manifest = ManifestStore::new(&path).load()?;
    println!("{}", serde_json::to_string_pretty(&manifest)?);
    Ok(())
}
