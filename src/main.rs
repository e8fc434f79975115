//! Product Image Cache command line
//!
//! Subcommands:
//! - `serve`    run the image endpoint
//! - `download` batch-cache product images
//! - `audit`    verify and repair the cache
//! - `stats`    summarize the cache and the last batch run

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use product_image_cache::{
    BatchScheduler, FileProductSource, ImageCacheConfig, ImagePipeline, ImageServer,
    ImageVariant, IntegrityAuditor, RunConfirmation, RunEstimate, RunOutcome, ServingMetrics,
    ServingProxy, StatsRecorder,
};
use prometheus::Registry;
use std::io::{self, BufRead, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(
    version,
    about = "Product image cache",
    long_about = "Fetches product images from the origin, stores optimized variants on disk\n\
                  and serves them with a redirect fallback to the origin."
)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the cache root directory
    #[arg(long, global = true)]
    cache_root: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve /api/image, /metrics and /health
    Serve {
        /// Listen address, e.g. 127.0.0.1:3000
        #[arg(short, long)]
        listen: Option<SocketAddr>,
    },

    /// Download product images into the cache
    Download {
        /// File with one product id per line
        #[arg(short, long)]
        products: PathBuf,

        /// Sizes to fetch, comma separated
        #[arg(short, long, value_delimiter = ',')]
        sizes: Vec<ImageVariant>,

        #[arg(long)]
        concurrency: Option<usize>,

        #[arg(long)]
        batch_size: Option<usize>,

        /// Process at most this many products
        #[arg(long)]
        limit: Option<usize>,

        /// Re-download images that are already cached
        #[arg(short, long)]
        force: bool,

        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Verify checksums, rebuild missing metadata and repair corrupted entries
    Audit {
        /// Only report corruption
        #[arg(long)]
        no_repair: bool,
    },

    /// Summarize cache contents and the latest batch run
    Stats,
}

/// Asks on the terminal before a batch run starts
struct TerminalConfirmation;

impl RunConfirmation for TerminalConfirmation {
    fn confirm(&self, estimate: &RunEstimate) -> bool {
        print!(
            "This will download up to {} images (~{:.2} MB). Continue? (y/n) ",
            estimate.expected_downloads, estimate.estimated_megabytes
        );
        if io::stdout().flush().is_err() {
            return false;
        }

        let mut answer = String::new();
        match io::stdin().lock().read_line(&mut answer) {
            Ok(_) => answer.trim().eq_ignore_ascii_case("y"),
            Err(_) => false,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            ImageCacheConfig::from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?
        }
        None => ImageCacheConfig::default(),
    };
    if let Some(root) = &cli.cache_root {
        config.cache_root = root.clone();
    }

    match cli.command {
        Command::Serve { listen } => {
            if let Some(addr) = listen {
                config.server.listen_address = addr.to_string();
            }
            config.validate()?;
            serve(config).await
        }
        Command::Download {
            products,
            sizes,
            concurrency,
            batch_size,
            limit,
            force,
            yes,
        } => {
            if !sizes.is_empty() {
                config.batch.variants = sizes;
            }
            if let Some(n) = concurrency {
                config.batch.concurrency = n;
            }
            if let Some(n) = batch_size {
                config.batch.batch_size = n;
            }
            config.batch.limit = limit.or(config.batch.limit);
            config.batch.force_refetch |= force;
            config.batch.skip_confirmation |= yes;
            config.validate()?;
            download(config, products).await
        }
        Command::Audit { no_repair } => {
            if no_repair {
                config.audit.repair = false;
            }
            config.validate()?;
            audit(config).await
        }
        Command::Stats => stats(config).await,
    }
}

async fn serve(config: ImageCacheConfig) -> Result<()> {
    let addr: SocketAddr = config
        .server
        .listen_address
        .parse()
        .context("invalid listen address")?;

    let pipeline = Arc::new(ImagePipeline::from_config(&config)?);
    pipeline
        .store
        .ensure_layout(&config.server.allowed_variants)
        .await
        .context("cannot create cache directory")?;

    let registry = Arc::new(Registry::new());
    let metrics = ServingMetrics::with_registry(&registry)?;
    let proxy = ServingProxy::new(pipeline, config.server.clone(), config.origin.url_prefix())
        .with_metrics(metrics);

    info!("Cache root: {}", config.cache_root);
    info!("Origin: {}", config.origin.url_prefix());
    ImageServer::new(Arc::new(proxy), registry)
        .start(addr)
        .await?;
    Ok(())
}

async fn download(config: ImageCacheConfig, products: PathBuf) -> Result<()> {
    let pipeline = Arc::new(ImagePipeline::from_config(&config)?);
    let scheduler = BatchScheduler::new(pipeline, config.batch.clone(), &config.origin);
    let source = FileProductSource::new(products);

    match scheduler.run(&source, &TerminalConfirmation).await? {
        RunOutcome::Completed(stats) => {
            println!(
                "Downloaded {} images, {} already cached, {} failed ({:.2} MB)",
                stats.downloaded,
                stats.already_cached,
                stats.failed,
                stats.total_megabytes()
            );
            for (kind, count) in &stats.error_types {
                println!("  {}: {}", kind, count);
            }
        }
        RunOutcome::Declined(_) => println!("Aborted"),
    }
    Ok(())
}

async fn audit(config: ImageCacheConfig) -> Result<()> {
    let pipeline = Arc::new(ImagePipeline::from_config(&config)?);
    let summary = IntegrityAuditor::new(pipeline, config.audit.clone())
        .audit()
        .await?;

    println!("Scanned: {}", summary.scanned);
    println!("Missing metadata fixed: {}", summary.missing_metadata_fixed);
    println!("Corrupted files found: {}", summary.corrupted_found);
    println!("Repaired: {}", summary.repaired);
    println!("Repair failed: {}", summary.repair_failed);
    println!("Duplicate entries: {}", summary.duplicates);
    println!(
        "Total size: {:.2} MB",
        summary.total_bytes as f64 / (1024.0 * 1024.0)
    );
    Ok(())
}

async fn stats(config: ImageCacheConfig) -> Result<()> {
    let pipeline = ImagePipeline::from_config(&config)?;
    let summary = pipeline.store.summarize(&ImageVariant::ALL).await?;

    println!("Cache: {}", config.cache_root);
    for (variant, totals) in &summary.variants {
        println!(
            "  {:<6} {:>6} images, {:>6} sidecars, {:>8.2} MB",
            variant.as_str(),
            totals.blobs,
            totals.sidecars,
            totals.bytes as f64 / (1024.0 * 1024.0)
        );
    }
    println!(
        "Total: {} images, {:.2} MB, average {:.1} KB",
        summary.total_blobs,
        summary.total_bytes as f64 / (1024.0 * 1024.0),
        summary.average_size() / 1024.0
    );
    println!("Size distribution:");
    println!("  <10KB      {}", summary.distribution.under_10kb);
    println!("  10-50KB    {}", summary.distribution.from_10kb_to_50kb);
    println!("  50-100KB   {}", summary.distribution.from_50kb_to_100kb);
    println!("  100-500KB  {}", summary.distribution.from_100kb_to_500kb);
    println!("  >500KB     {}", summary.distribution.over_500kb);

    match StatsRecorder::new(pipeline.store.stats_dir()).load_latest().await {
        Ok(Some(run)) => println!(
            "Latest run: {} total, {} succeeded, {} failed",
            run.total, run.success, run.failed
        ),
        Ok(None) => println!("No batch run recorded"),
        Err(e) => warn!("Unreadable run stats: {}", e),
    }
    Ok(())
}
