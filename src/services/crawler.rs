//! src/services/crawler.rs
//!
//! Crawler: recursive walk of a namespace through directory listings.
//!
//! Directory paths go through an unbounded job queue drained by a fixed
//! pool of listing workers, so in-flight listing requests never exceed the
//! worker count. Discovered objects go to a bounded output channel; a slow
//! consumer blocks the workers.
//!
//! Completion is tracked with an outstanding-job counter: every enqueue
//! increments it, every finished job decrements it. A single watcher task
//! waits for the counter to drain (or for cancellation) and is the only
//! place that closes the job queue and the output channel.

use crate::{
    errors::CrawlError,
    models::entry::{Entry, EntryKind},
    paths,
    services::{listing::ListingDecoder, source_client::SourceClient},
};
use reqwest::Url;
use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt, BufWriter},
    sync::Notify,
    task::{JoinHandle, JoinSet},
};
use tokio_util::{io::StreamReader, sync::CancellationToken};
use tracing::{debug, error, info, warn};

pub const DEFAULT_LIST_WORKERS: usize = 8;
pub const DEFAULT_OUTPUT_BUFFER: usize = 1024;

/// Listing written for a whole-namespace crawl.
pub const LISTING_FILE: &str = "object_listing.txt";

/// Listing file for a crawl root: `object_listing.txt`, or
/// `object_listing_<prefix>.txt` with `/` replaced by `_`.
pub fn listing_file_name(prefix: Option<&str>) -> String {
    match prefix
        .map(paths::file_stem_for_prefix)
        .filter(|stem| !stem.is_empty())
    {
        Some(stem) => format!("object_listing_{stem}.txt"),
        None => LISTING_FILE.to_string(),
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CrawlOptions {
    /// Number of concurrent listing workers.
    pub workers: usize,
    /// Capacity of the discovered-object channel.
    pub output_buffer: usize,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_LIST_WORKERS,
            output_buffer: DEFAULT_OUTPUT_BUFFER,
        }
    }
}

/// Totals for one crawl.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CrawlReport {
    pub directories_listed: u64,
    pub objects_found: u64,
    /// Entries that were neither objects nor directories.
    pub dropped_entries: u64,
    /// Branches abandoned on a protocol or decode error.
    pub failed_listings: u64,
    pub cancelled: bool,
}

/// Root listing path for an optional prefix below the namespace URL.
///
/// Without a prefix the root is the empty path, i.e. the namespace URL
/// itself.
pub fn root_path(namespace_url: &Url, prefix: Option<&str>) -> String {
    match prefix.map(str::trim).filter(|prefix| !prefix.is_empty()) {
        Some(prefix) => paths::join(&[namespace_url.path(), prefix]),
        None => String::new(),
    }
}

pub struct Crawler {
    client: Arc<SourceClient>,
    options: CrawlOptions,
}

impl Crawler {
    pub fn new(client: Arc<SourceClient>, options: CrawlOptions) -> Self {
        Self { client, options }
    }

    /// Start crawling below `root`. Must be called within a tokio runtime.
    pub fn start(&self, root: &str, cancel: CancellationToken) -> CrawlHandle {
        let (jobs_tx, jobs_rx) = async_channel::unbounded::<String>();
        let (entries_tx, entries_rx) = async_channel::bounded(self.options.output_buffer.max(1));

        let state = Arc::new(CrawlState {
            client: Arc::clone(&self.client),
            jobs: jobs_tx,
            entries: entries_tx,
            outstanding: AtomicUsize::new(0),
            drained: Notify::new(),
            cancel: cancel.clone(),
            directories_listed: AtomicU64::new(0),
            objects_found: AtomicU64::new(0),
            dropped_entries: AtomicU64::new(0),
            failed_listings: AtomicU64::new(0),
        });

        info!(root = %root, workers = self.options.workers, "starting crawl");
        state.enqueue(root.to_string());

        let mut workers = JoinSet::new();
        for worker_id in 0..self.options.workers.max(1) {
            workers.spawn(worker_loop(worker_id, Arc::clone(&state), jobs_rx.clone()));
        }
        drop(jobs_rx);

        CrawlHandle {
            entries: entries_rx,
            join: tokio::spawn(watch(state, workers)),
            cancel,
        }
    }
}

/// A running crawl: the discovered-object stream plus its completion.
pub struct CrawlHandle {
    entries: async_channel::Receiver<Entry>,
    join: JoinHandle<CrawlReport>,
    cancel: CancellationToken,
}

impl CrawlHandle {
    /// Next discovered object; `None` once the crawl has finished.
    pub async fn next(&self) -> Option<Entry> {
        self.entries.recv().await.ok()
    }

    /// A second receiver on the discovered-object stream.
    pub fn entries(&self) -> async_channel::Receiver<Entry> {
        self.entries.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the crawl to end and return its totals.
    ///
    /// Undelivered objects are discarded.
    pub async fn finish(self) -> Result<CrawlReport, CrawlError> {
        drop(self.entries);
        Ok(self.join.await?)
    }
}

/// Drain a crawl into `writer`, one object path per line.
///
/// A write failure cancels the crawl.
pub async fn write_listing<W>(handle: CrawlHandle, writer: W) -> Result<CrawlReport, CrawlError>
where
    W: AsyncWrite + Unpin,
{
    let mut out = BufWriter::new(writer);
    let written = async {
        while let Some(entry) = handle.next().await {
            out.write_all(entry.object_path.as_bytes()).await?;
            out.write_all(b"\n").await?;
        }
        out.flush().await
    }
    .await;

    if let Err(err) = written {
        handle.cancel();
        handle.finish().await?;
        return Err(CrawlError::Output(err));
    }
    handle.finish().await
}

struct CrawlState {
    client: Arc<SourceClient>,
    jobs: async_channel::Sender<String>,
    entries: async_channel::Sender<Entry>,
    outstanding: AtomicUsize,
    drained: Notify,
    cancel: CancellationToken,
    directories_listed: AtomicU64,
    objects_found: AtomicU64,
    dropped_entries: AtomicU64,
    failed_listings: AtomicU64,
}

impl CrawlState {
    fn enqueue(&self, path: String) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        if self.jobs.try_send(path).is_err() {
            // queue already closed by the watcher
            self.complete_job();
        }
    }

    fn complete_job(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_one();
        }
    }

    /// List one directory, fanning out sub-directories and emitting objects.
    async fn list_directory(&self, path: &str) -> Result<(), CrawlError> {
        let body = self.client.fetch_listing(path).await?;
        let mut decoder = ListingDecoder::new(StreamReader::new(body));

        while let Some(listing) = decoder.next_listing().await? {
            self.directories_listed.fetch_add(1, Ordering::Relaxed);
            debug!(path = %listing.path, entries = listing.entries.len(), "directory listed");

            for entry in listing.entries {
                match entry.kind {
                    EntryKind::Object => {
                        if self.entries.send(entry).await.is_err() {
                            // output closed: crawl cancelled or consumer gone
                            return Ok(());
                        }
                        self.objects_found.fetch_add(1, Ordering::Relaxed);
                    }
                    EntryKind::Directory => self.enqueue(entry.object_path),
                    EntryKind::Other(kind) => {
                        debug!(path = %entry.object_path, kind = %kind, "skipping entry");
                        self.dropped_entries.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        Ok(())
    }

    fn report(&self, cancelled: bool) -> CrawlReport {
        CrawlReport {
            directories_listed: self.directories_listed.load(Ordering::Relaxed),
            objects_found: self.objects_found.load(Ordering::Relaxed),
            dropped_entries: self.dropped_entries.load(Ordering::Relaxed),
            failed_listings: self.failed_listings.load(Ordering::Relaxed),
            cancelled,
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    state: Arc<CrawlState>,
    jobs: async_channel::Receiver<String>,
) {
    debug!(worker_id, "listing worker starting");
    while let Ok(path) = jobs.recv().await {
        if !state.cancel.is_cancelled() {
            if let Err(err) = state.list_directory(&path).await {
                warn!(path = %path, error = %err, "abandoning branch");
                state.failed_listings.fetch_add(1, Ordering::Relaxed);
            }
        }
        state.complete_job();
    }
    debug!(worker_id, "listing worker exited");
}

/// Waits for the crawl to drain or be cancelled, then closes both channels.
async fn watch(state: Arc<CrawlState>, mut workers: JoinSet<()>) -> CrawlReport {
    let mut cancelled = false;
    loop {
        tokio::select! {
            _ = state.drained.notified() => break,
            _ = state.cancel.cancelled() => {
                cancelled = true;
                break;
            }
            joined = workers.join_next() => match joined {
                Some(Ok(())) => {}
                Some(Err(err)) => {
                    error!(error = %err, "listing worker failed, stopping crawl");
                    state.failed_listings.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                None => break,
            },
        }
    }

    state.jobs.close();
    state.entries.close();
    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            error!(error = %err, "listing worker failed");
        }
    }

    let report = state.report(cancelled);
    info!(
        directories = report.directories_listed,
        objects = report.objects_found,
        failed = report.failed_listings,
        cancelled = report.cancelled,
        "crawl finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_path_without_prefix_is_namespace_root() {
        let url = Url::parse("https://ns.tenant.example.com/rest").unwrap();
        assert_eq!(root_path(&url, None), "");
        assert_eq!(root_path(&url, Some("  ")), "");
    }

    #[test]
    fn listing_file_names_follow_the_prefix() {
        assert_eq!(listing_file_name(None), "object_listing.txt");
        assert_eq!(listing_file_name(Some("/")), "object_listing.txt");
        assert_eq!(
            listing_file_name(Some("reports/2021/")),
            "object_listing_reports_2021.txt"
        );
    }

    #[test]
    fn root_path_joins_prefix_below_namespace_path() {
        let url = Url::parse("https://ns.tenant.example.com/rest").unwrap();
        assert_eq!(root_path(&url, Some("reports/2021")), "/rest/reports/2021");
        assert_eq!(root_path(&url, Some("/reports/")), "/rest/reports");
    }
}
