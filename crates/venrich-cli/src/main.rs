use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value as JsonValue};
use tokio::task::JoinSet;
use tracing::info;
use tracing_subscriber::EnvFilter;
use venrich_adapters::{seed_from_value, FallbackHeuristic, Provider};
use venrich_core::BusinessData;
use venrich_storage::{FixtureTransport, HttpFetcher};
use venrich_sync::{EnrichConfig, Enricher};

#[derive(Debug, Parser)]
#[command(name = "venrich-cli")]
#[command(about = "Venue record enrichment command-line interface")]
struct Cli {
    /// Do not touch the network; only the fallback heuristic contributes.
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Enrich one venue and print the record as JSON.
    Enrich {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        postcode: Option<String>,
        #[arg(long)]
        town: Option<String>,
        #[arg(long, default_value = "cli")]
        id: String,
        /// Upstream entity as JSON; `--name/--postcode/--town` override it.
        #[arg(long)]
        seed_file: Option<PathBuf>,
    },
    /// Enrich a JSON array of upstream entities concurrently.
    Batch {
        #[arg(long)]
        file: PathBuf,
    },
    /// List the configured provider chain.
    Providers,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Offline runs only carry the network-free fallback; the empty transport
/// guarantees nothing leaves the machine.
fn build_enricher(config: &EnrichConfig, offline: bool) -> Result<Enricher> {
    if !offline {
        return Enricher::from_config(config);
    }
    let http = HttpFetcher::with_transport(
        config.http_client_config(),
        Arc::new(FixtureTransport::new()),
    );
    let chain: Vec<Arc<dyn Provider>> = vec![Arc::new(FallbackHeuristic)];
    Ok(Enricher::new(Arc::new(http), chain))
}

fn read_json(path: &Path) -> Result<JsonValue> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn seed_from_args(
    seed_file: Option<&Path>,
    name: Option<String>,
    postcode: Option<String>,
    town: Option<String>,
) -> Result<BusinessData> {
    let mut upstream = match seed_file {
        Some(path) => read_json(path)?,
        None => json!({}),
    };
    let Some(fields) = upstream.as_object_mut() else {
        bail!("seed file must contain a JSON object");
    };
    for (key, value) in [("name", name), ("postcode", postcode), ("town", town)] {
        if let Some(value) = value {
            fields.insert(key.to_string(), json!(value));
        }
    }

    let seed = seed_from_value(&upstream);
    if seed.name.is_empty() {
        bail!("a venue name is required (--name or `name` in the seed file)");
    }
    Ok(seed)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = EnrichConfig::from_env();

    match cli.command {
        Commands::Enrich {
            name,
            postcode,
            town,
            id,
            seed_file,
        } => {
            let seed = seed_from_args(seed_file.as_deref(), name, postcode, town)?;
            let enricher = build_enricher(&config, cli.offline)?;
            let record = enricher.enrich(&id, seed, None).await;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Batch { file } => {
            let upstream = read_json(&file)?;
            let Some(entities) = upstream.as_array() else {
                bail!("{} must contain a JSON array", file.display());
            };
            let enricher = Arc::new(build_enricher(&config, cli.offline)?);

            let mut tasks = JoinSet::new();
            for (index, entity) in entities.iter().enumerate() {
                let seed = seed_from_value(entity);
                let enricher = enricher.clone();
                let venue_id = format!("{}#{index}", file.display());
                tasks.spawn(async move { (index, enricher.enrich(&venue_id, seed, None).await) });
            }

            let mut records: Vec<(usize, BusinessData)> = Vec::with_capacity(entities.len());
            while let Some(joined) = tasks.join_next().await {
                records.push(joined.context("enrichment task failed")?);
            }
            records.sort_by_key(|(index, _)| *index);
            info!(
                venues = records.len(),
                unique = enricher.cache().completed_len().await,
                "batch complete"
            );

            let out: Vec<_> = records.into_iter().map(|(_, record)| record).collect();
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Commands::Providers => {
            let enricher = build_enricher(&config, cli.offline)?;
            for provider_id in enricher.chain_ids() {
                println!("{provider_id}");
            }
        }
    }

    Ok(())
}
