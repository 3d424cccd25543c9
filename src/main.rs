use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use hcp_migrate::{
    config::{Cli, Command, DestinationKind, ListConfig, MigrateConfig},
    services::{
        crawler::{CrawlOptions, Crawler, listing_file_name, root_path, write_listing},
        destination::{Destination, LocalDestination, S3Destination, S3Settings},
        pipeline::{MigrationPipeline, PipelineOptions},
        source_client::SourceClient,
    },
};
use std::{path::Path, sync::Arc};
use tokio::{
    fs::{self, File},
    io::{AsyncBufReadExt, BufReader},
};
use tokio_stream::wrappers::LinesStream;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // --- Logging setup ---
    let directive = match &cli.command {
        Command::List(args) => args.source.log_directive(),
        Command::Migrate(args) => args.source.log_directive(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive)),
        )
        .init();

    // --- Ctrl-C stops queueing new work ---
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, finishing in-flight work");
                cancel.cancel();
            }
        }
    });

    match cli.command {
        Command::List(args) => list(ListConfig::from_args(&args)?, cancel).await,
        Command::Migrate(args) => migrate(MigrateConfig::from_args(&args)?, cancel).await,
    }
}

async fn ensure_data_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating data directory {}", dir.display()))?;
        tracing::info!("Created data directory at {}", dir.display());
    }
    Ok(())
}

async fn read_prefixes(path: &Path) -> Result<Vec<String>> {
    let contents = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading prefixes file {}", path.display()))?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

async fn list(cfg: ListConfig, cancel: CancellationToken) -> Result<()> {
    tracing::info!("Starting listing with config: {:?}", cfg);
    ensure_data_dir(&cfg.data_dir).await?;

    let client = Arc::new(SourceClient::new(cfg.source.clone()).context("building HCP client")?);
    let crawler = Crawler::new(
        Arc::clone(&client),
        CrawlOptions {
            workers: cfg.list_workers,
            ..CrawlOptions::default()
        },
    );

    let prefixes: Vec<Option<String>> = match &cfg.prefixes_file {
        Some(path) => read_prefixes(path).await?.into_iter().map(Some).collect(),
        None => vec![None],
    };

    for prefix in prefixes {
        if cancel.is_cancelled() {
            break;
        }
        let root = root_path(client.namespace_url(), prefix.as_deref());
        let output = cfg
            .data_dir
            .join(listing_file_name(prefix.as_deref()));
        tracing::info!(
            "Downloading namespace listing for `{}` to {}",
            prefix.as_deref().unwrap_or(""),
            output.display()
        );

        let file = File::create(&output)
            .await
            .with_context(|| format!("creating listing file {}", output.display()))?;
        let report = write_listing(crawler.start(&root, cancel.clone()), file).await?;

        println!(
            "{}: {} objects in {} directories ({} failed listings){}",
            output.display(),
            report.objects_found,
            report.directories_listed,
            report.failed_listings,
            if report.cancelled { " [cancelled]" } else { "" }
        );
    }

    Ok(())
}

async fn migrate(cfg: MigrateConfig, cancel: CancellationToken) -> Result<()> {
    tracing::info!("Starting migration with config: {:?}", cfg);
    ensure_data_dir(&cfg.data_dir).await?;

    let client = Arc::new(SourceClient::new(cfg.source.clone()).context("building HCP client")?);
    let destination: Arc<dyn Destination> = match cfg.destination {
        DestinationKind::S3 => {
            let settings = S3Settings::from_env().context(
                "MINIO_ENDPOINT, MINIO_ACCESS_KEY, MINIO_SECRET_KEY and MINIO_BUCKET need to be set",
            )?;
            Arc::new(S3Destination::new(settings))
        }
        DestinationKind::Local => Arc::new(
            LocalDestination::open(cfg.data_dir.join("download"))
                .await
                .context("opening local destination")?,
        ),
    };

    let pipeline = MigrationPipeline::new(
        Arc::clone(&client),
        destination,
        PipelineOptions {
            concurrency: cfg.concurrency,
            dry_run: cfg.dry_run,
            annotation: cfg.annotation.clone(),
            log_dir: cfg.data_dir.clone(),
        },
    );

    let summary = match &cfg.input {
        Some(input) => {
            let file = File::open(input)
                .await
                .with_context(|| format!("could not open listing file {}", input.display()))?;
            let lines = LinesStream::new(BufReader::new(file).lines());
            pipeline.run(lines, cfg.skip, &cancel).await?
        }
        None => {
            let crawler = Crawler::new(
                Arc::clone(&client),
                CrawlOptions {
                    workers: cfg.list_workers,
                    ..CrawlOptions::default()
                },
            );
            let handle = crawler.start(&root_path(client.namespace_url(), None), cancel.clone());
            let paths = handle
                .entries()
                .map(|entry| Ok::<_, std::io::Error>(entry.object_path));
            let summary = pipeline.run(paths, cfg.skip, &cancel).await?;
            let report = handle.finish().await?;
            tracing::info!(?report, "crawl finished");
            summary
        }
    };

    if let Some(latency) = client.latency().report() {
        tracing::info!("{}", latency);
    }
    println!("{summary}");
    println!(
        "failures logged to {}, successes to {}",
        summary.failure_log.display(),
        summary.success_log.display()
    );

    Ok(())
}
