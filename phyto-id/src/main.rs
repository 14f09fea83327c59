//! phyto-id - identify one plant image from the command line
//!
//! Prints the merged result as pretty JSON. Exits non-zero on validation
//! errors or when every provider is unavailable.

use anyhow::{Context, Result};
use clap::Parser;
use phyto_common::config::{load_logging_config, resolve_config_path};
use phyto_common::events::EventBus;
use phyto_id::config::{IdentifyConfig, CONFIG_ENV_VAR, CONFIG_FILE_NAME};
use phyto_id::{IdentifyError, IdentifyOptions, Organ};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Debug, Parser)]
#[command(name = "phyto-id", version, about = "Identify a plant from a photo")]
struct Cli {
    /// Image file (JPEG, PNG, WebP, HEIC or AVIF)
    image: PathBuf,

    /// Config file (overrides PHYTO_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Also report disease candidates
    #[arg(long)]
    diseases: bool,

    /// Organ shown in the image; repeat for several
    #[arg(long = "organ", value_parser = parse_organ)]
    organs: Vec<Organ>,

    /// Language for common names (ISO 639-1)
    #[arg(long, default_value = "en")]
    language: String,

    /// Maximum candidates to report
    #[arg(long)]
    max_results: Option<usize>,
}

fn parse_organ(value: &str) -> std::result::Result<Organ, String> {
    value.parse::<Organ>().map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging first so that config loading is logged too
    let config_path = resolve_config_path(cli.config.as_deref(), CONFIG_ENV_VAR, CONFIG_FILE_NAME);
    let logging = load_logging_config(config_path.as_deref());

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .context("Invalid logging level")?;
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting phyto-id {}", env!("CARGO_PKG_VERSION"));
    let config = IdentifyConfig::load(config_path.as_deref())?;

    let image = tokio::fs::read(&cli.image)
        .await
        .with_context(|| format!("Failed to read {}", cli.image.display()))?;

    let service = config.build_service(EventBus::default()).await?;
    let options = IdentifyOptions {
        include_diseases: cli.diseases,
        organs: cli.organs,
        language: cli.language,
        max_results: cli.max_results,
    };

    match service.identify(image, options).await {
        Ok(result) => {
            if result.degraded {
                warn!(failures = result.failures.len(), "Result is degraded");
            }
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(IdentifyError::AllProvidersUnavailable { retry_after, failures }) => {
            for failure in &failures {
                warn!(
                    provider = %failure.provider,
                    reason = %failure.reason,
                    "{}",
                    failure.message
                );
            }
            anyhow::bail!(
                "all identification providers unavailable, retry in {}s",
                retry_after.as_secs()
            )
        }
        Err(e) => Err(e.into()),
    }
}
