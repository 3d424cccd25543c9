//! src/services/pipeline.rs
//!
//! MigrationPipeline: moves a list of object paths from the source
//! namespace to a destination under a fixed concurrency budget.
//!
//! Jobs flow through a bounded queue to `concurrency` transfer workers. Each
//! worker fetches the object, derives its key, checks the destination and
//! uploads when absent. Outcomes go to a single recorder task that owns the
//! failure and success logs, so both logs are complete once `finish`
//! returns.
//!
//! Workers poll the cancellation token before each job. A job dequeued
//! after cancellation is abandoned: it is neither fetched nor logged.

use crate::{
    errors::{MigrationError, PipelineError},
    models::{
        descriptor::FetchedObject,
        job::{MigrationJob, MigrationOutcome},
    },
    services::{destination::Destination, source_client::SourceClient},
};
use chrono::{DateTime, Local};
use futures::{Stream, StreamExt};
use std::{
    fmt, io,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    pin::pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const FAILURE_LOG: &str = "migration_fails.txt";
pub const SUCCESS_LOG: &str = "migration_success.txt";

const LOG_TIMESTAMP_FORMAT: &str = "%m-%d-%Y-%H-%M-%S";

/// Run log name, e.g. `migration_fails.txt.03-14-2024-09-26-53`.
pub fn log_file_name(base: &str, at: DateTime<Local>) -> String {
    format!("{base}.{}", at.format(LOG_TIMESTAMP_FORMAT))
}

/// Available parallelism, at least 1.
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

#[derive(Clone, Debug)]
pub struct PipelineOptions {
    pub concurrency: usize,
    /// Fetch and derive keys but never touch the destination.
    pub dry_run: bool,
    /// Annotation to request with each object.
    pub annotation: Option<String>,
    /// Directory the run logs are written to.
    pub log_dir: PathBuf,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            dry_run: false,
            annotation: None,
            log_dir: PathBuf::from("."),
        }
    }
}

/// Totals for one migration run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MigrationSummary {
    /// Successful jobs, including dry-run and already-present objects.
    pub migrated: u64,
    pub failed: u64,
    pub uploaded: u64,
    pub already_present: u64,
    /// Payload bytes written to the destination.
    pub bytes: u64,
    /// Jobs dropped by the skip offset.
    pub skipped: u64,
    /// Queued jobs dropped after cancellation.
    pub abandoned: u64,
    pub dry_run: bool,
    pub cancelled: bool,
    pub failure_log: PathBuf,
    pub success_log: PathBuf,
}

impl fmt::Display for MigrationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "migrated {} objects ({} uploaded, {} already present, {} bytes), {} failed",
            self.migrated, self.uploaded, self.already_present, self.bytes, self.failed
        )?;
        if self.skipped > 0 {
            write!(f, ", {} skipped", self.skipped)?;
        }
        if self.abandoned > 0 {
            write!(f, ", {} abandoned", self.abandoned)?;
        }
        if self.dry_run {
            f.write_str(" [dry run]")?;
        }
        if self.cancelled {
            f.write_str(" [cancelled]")?;
        }
        Ok(())
    }
}

pub struct MigrationPipeline {
    source: Arc<SourceClient>,
    destination: Arc<dyn Destination>,
    options: PipelineOptions,
}

impl MigrationPipeline {
    pub fn new(
        source: Arc<SourceClient>,
        destination: Arc<dyn Destination>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            source,
            destination,
            options,
        }
    }

    /// Open the run logs and spawn the workers and the recorder.
    ///
    /// Workers stop taking on work once `cancel` fires.
    pub async fn start(
        &self,
        cancel: CancellationToken,
    ) -> Result<MigrationHandle, PipelineError> {
        let now = Local::now();
        let failure_log = self.options.log_dir.join(log_file_name(FAILURE_LOG, now));
        let success_log = self.options.log_dir.join(log_file_name(SUCCESS_LOG, now));
        let failures = open_log(&failure_log).await?;
        let successes = open_log(&success_log).await?;

        let concurrency = self.options.concurrency.max(1);
        let (jobs_tx, jobs_rx) = async_channel::bounded(concurrency);
        let (outcomes_tx, outcomes_rx) = mpsc::channel(concurrency * 2);
        let counters = Arc::new(Counters::default());

        let worker = Arc::new(TransferWorker {
            source: Arc::clone(&self.source),
            destination: Arc::clone(&self.destination),
            dry_run: self.options.dry_run,
            annotation: self.options.annotation.clone(),
            counters: Arc::clone(&counters),
            cancel,
        });

        info!(
            concurrency,
            dry_run = self.options.dry_run,
            destination = %self.destination.describe(),
            "starting migration"
        );

        let mut workers = JoinSet::new();
        for _ in 0..concurrency {
            workers.spawn(Arc::clone(&worker).run(jobs_rx.clone(), outcomes_tx.clone()));
        }

        Ok(MigrationHandle {
            jobs: jobs_tx,
            workers,
            recorder: tokio::spawn(record_outcomes(outcomes_rx, failures, successes)),
            counters,
            dry_run: self.options.dry_run,
            failure_log,
            success_log,
        })
    }

    /// Migrate every path from `jobs`, one per item, after dropping the
    /// first `skip` of them.
    ///
    /// Blank lines are not jobs. Cancellation stops queueing and workers
    /// abandon whatever is still queued; jobs in flight complete and are
    /// logged.
    pub async fn run<S>(
        &self,
        jobs: S,
        skip: u64,
        cancel: &CancellationToken,
    ) -> Result<MigrationSummary, PipelineError>
    where
        S: Stream<Item = io::Result<String>>,
    {
        let handle = self.start(cancel.clone()).await?;
        let mut jobs = pin!(jobs);
        let mut ordinal = 0u64;
        let mut skipped = 0u64;
        let mut cancelled = false;

        let fed: Result<(), PipelineError> = async {
            loop {
                let line = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        cancelled = true;
                        break;
                    }
                    line = jobs.next() => line,
                };
                let Some(line) = line else { break };
                let line = line.map_err(PipelineError::Input)?;
                let path = line.trim();
                if path.is_empty() {
                    continue;
                }

                let position = ordinal;
                ordinal += 1;
                if position < skip {
                    skipped += 1;
                    continue;
                }

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        cancelled = true;
                        break;
                    }
                    queued = handle.queue(MigrationJob::new(path, position)) => queued?,
                }
            }
            Ok(())
        }
        .await;

        let mut summary = handle.finish().await?;
        fed?;
        summary.skipped = skipped;
        summary.cancelled = cancelled;
        info!(%summary, "migration finished");
        Ok(summary)
    }
}

/// A running migration.
pub struct MigrationHandle {
    jobs: async_channel::Sender<MigrationJob>,
    workers: JoinSet<()>,
    recorder: JoinHandle<Result<(), PipelineError>>,
    counters: Arc<Counters>,
    dry_run: bool,
    failure_log: PathBuf,
    success_log: PathBuf,
}

impl MigrationHandle {
    /// Queue one job, waiting while the queue is full.
    pub async fn queue(&self, job: MigrationJob) -> Result<(), PipelineError> {
        self.jobs
            .send(job)
            .await
            .map_err(|_| PipelineError::QueueClosed)
    }

    /// Close the queue, wait for every queued job and for both logs.
    pub async fn finish(mut self) -> Result<MigrationSummary, PipelineError> {
        self.jobs.close();
        while let Some(joined) = self.workers.join_next().await {
            joined?;
        }
        self.recorder.await??;

        Ok(MigrationSummary {
            migrated: self.counters.migrated.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            uploaded: self.counters.uploaded.load(Ordering::Relaxed),
            already_present: self.counters.already_present.load(Ordering::Relaxed),
            bytes: self.counters.bytes.load(Ordering::Relaxed),
            skipped: 0,
            abandoned: self.counters.abandoned.load(Ordering::Relaxed),
            dry_run: self.dry_run,
            cancelled: false,
            failure_log: self.failure_log,
            success_log: self.success_log,
        })
    }
}

#[derive(Debug, Default)]
struct Counters {
    migrated: AtomicU64,
    failed: AtomicU64,
    uploaded: AtomicU64,
    already_present: AtomicU64,
    bytes: AtomicU64,
    abandoned: AtomicU64,
}

enum Transferred {
    DryRun,
    AlreadyPresent,
    Uploaded(u64),
}

struct TransferWorker {
    source: Arc<SourceClient>,
    destination: Arc<dyn Destination>,
    dry_run: bool,
    annotation: Option<String>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
}

impl TransferWorker {
    async fn run(
        self: Arc<Self>,
        jobs: async_channel::Receiver<MigrationJob>,
        outcomes: mpsc::Sender<MigrationOutcome>,
    ) {
        while let Ok(job) = jobs.recv().await {
            if self.cancel.is_cancelled() {
                debug!(path = %job.path, "cancelled, abandoning job");
                self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            let outcome = match self.migrate(&job).await {
                Ok(transferred) => {
                    self.counters.migrated.fetch_add(1, Ordering::Relaxed);
                    match transferred {
                        Transferred::Uploaded(bytes) => {
                            self.counters.uploaded.fetch_add(1, Ordering::Relaxed);
                            self.counters.bytes.fetch_add(bytes, Ordering::Relaxed);
                        }
                        Transferred::AlreadyPresent => {
                            self.counters.already_present.fetch_add(1, Ordering::Relaxed);
                        }
                        Transferred::DryRun => {}
                    }
                    MigrationOutcome::succeeded(job.path)
                }
                Err(err) => {
                    warn!(
                        path = %job.path,
                        ordinal = job.ordinal,
                        error = %err,
                        "migration failed"
                    );
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    MigrationOutcome::failed(job.path, err.to_string())
                }
            };
            if outcomes.send(outcome).await.is_err() {
                break;
            }
        }
    }

    /// Fetch, then check and upload. Strictly sequential per job.
    async fn migrate(&self, job: &MigrationJob) -> Result<Transferred, MigrationError> {
        let FetchedObject { descriptor, body } = self
            .source
            .fetch_object(&job.path, self.annotation.as_deref())
            .await?;

        if self.dry_run {
            info!("{} => {}", job.path, descriptor.key);
            return Ok(Transferred::DryRun);
        }

        if self.destination.exists(&descriptor.key).await? {
            debug!(path = %job.path, key = %descriptor.key, "already present");
            return Ok(Transferred::AlreadyPresent);
        }

        let bytes = self.destination.put(&descriptor, body).await?;
        debug!(path = %job.path, key = %descriptor.key, bytes, "uploaded");
        Ok(Transferred::Uploaded(bytes))
    }
}

async fn open_log(path: &Path) -> Result<BufWriter<File>, PipelineError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map(BufWriter::new)
        .map_err(|source| PipelineError::OpenLog {
            path: path.display().to_string(),
            source,
        })
}

async fn append_line(log: &mut BufWriter<File>, line: &str) -> io::Result<()> {
    log.write_all(line.as_bytes()).await?;
    log.write_all(b"\n").await?;
    log.flush().await
}

async fn record_outcomes(
    mut outcomes: mpsc::Receiver<MigrationOutcome>,
    mut failures: BufWriter<File>,
    mut successes: BufWriter<File>,
) -> Result<(), PipelineError> {
    while let Some(outcome) = outcomes.recv().await {
        let written = match outcome.failure_line() {
            Some(line) => append_line(&mut failures, &line).await,
            None => append_line(&mut successes, &outcome.path).await,
        };
        written.map_err(PipelineError::Log)?;
    }
    failures.shutdown().await.map_err(PipelineError::Log)?;
    successes.shutdown().await.map_err(PipelineError::Log)?;
    Ok(())
}
