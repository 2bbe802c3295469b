use anyhow::Context;
use artifact_storage::{storage, Properties};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Upload a conversion artifact and print its download URL.
#[derive(Debug, Parser)]
#[command(name = "artifact-upload", version)]
struct Args {
    /// Properties or YAML file holding the `storageprovider.*` settings
    #[arg(long, env = "ARTIFACT_STORAGE_CONFIG", default_value = "storage.properties")]
    config: PathBuf,

    /// Job identifier used as the key's middle segment (defaults to a fresh UUID)
    #[arg(long)]
    job_id: Option<String>,

    /// Name stored in the bucket (defaults to the file's own name)
    #[arg(long)]
    name: Option<String>,

    /// Skip the bucket reachability check before uploading
    #[arg(long)]
    skip_verify: bool,

    /// File to upload
    file: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "artifact_storage=info,artifact_upload=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    tracing::info!("Loading configuration from: {}", args.config.display());
    let properties = Properties::from_file(&args.config)?;

    let provider = if args.skip_verify {
        storage::from_properties(&properties).await?
    } else {
        storage::connect(&properties).await?
    };

    let file_name = match args.name {
        Some(name) => name,
        None => args
            .file
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .context("Upload path has no usable file name")?,
    };
    let job_id = args
        .job_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let file = tokio::fs::File::open(&args.file)
        .await
        .with_context(|| format!("Failed to open {}", args.file.display()))?;
    let length = file.metadata().await?.len();

    tracing::info!(
        provider = provider.name(),
        job_id = %job_id,
        file_name = %file_name,
        size_bytes = length,
        "Uploading artifact"
    );

    let url = provider
        .put_stream(Box::new(file), length, &file_name, &job_id)
        .await
        .map_err(|e| {
            if e.is_retryable() {
                tracing::warn!("Upload failed with a transient error; it may succeed if retried");
            }
            e
        })?;

    println!("{}", url);

    Ok(())
}
