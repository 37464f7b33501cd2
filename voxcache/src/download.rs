//! # Progressive chunked download
//!
//! One [`FileDownload`] per audio object drives ranged HTTP fetches into
//! the shared chunk store while any number of [`StreamingFile`] handles
//! read the same bytes as a blocking `Read + Seek` stream. A read that runs
//! ahead of the downloaded data registers its position, asks the scheduler
//! to cover it and parks on a condition variable until bytes arrive.
//!
//! Fetches are chunk-aligned, never overlap data that is already owned or
//! in flight, and run at most `max_parallel` at a time. Transient HTTP
//! failures retry on a short backoff; a 404 is fatal for the whole file.

use std::{
    io::{self, Read, Seek, SeekFrom},
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

use reqwest::StatusCode;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use voxid::FileId;

use crate::{
    error::DownloadError,
    range_set::RangeSet,
    store::{AudioFileStore, DEFAULT_CHUNK_SIZE},
};

/// Downloader tunables; defaults are the deployed service values.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub chunk_size: u64,
    /// Upper bound of one speculative fetch window.
    pub prefetch_window: u64,
    /// Maximum concurrent range fetches per file.
    pub max_parallel: usize,
    pub request_timeout: Duration,
    /// Retries after the initial attempt, on transient failures only.
    pub max_retries: u32,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            prefetch_window: 4 * DEFAULT_CHUNK_SIZE,
            max_parallel: 4,
            request_timeout: Duration::from_secs(15),
            max_retries: 4,
        }
    }
}

/// Backoff before transient retries.
const RETRY_BACKOFF_MS: [u64; 4] = [200, 500, 1000, 2000];

/// How often a parked reader re-checks for progress.
const WAIT_RECHECK: Duration = Duration::from_millis(100);

/// Opens progressive downloads against the chunk store.
pub struct ChunkedDownloader {
    client: reqwest::Client,
    store: Arc<AudioFileStore>,
    config: DownloadConfig,
}

impl ChunkedDownloader {
    pub fn new(store: Arc<AudioFileStore>, config: DownloadConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("reqwest client construction cannot fail with these options");
        Self {
            client,
            store,
            config,
        }
    }

    /// Opens (or re-attaches to) the download of `file_id` served at `url`.
    ///
    /// Chunks journaled by a previous run are adopted without refetching.
    /// The first fetch window is issued immediately so playback can start
    /// while the rest of the file arrives.
    pub async fn open(
        &self,
        file_id: FileId,
        url: impl Into<String>,
    ) -> Result<Arc<FileDownload>, DownloadError> {
        let url = url.into();

        let total_size = match self.store.entry(&file_id)? {
            Some(entry) => entry.total_size,
            None => self.probe_total_size(&file_id, &url).await?,
        };
        self.store
            .open_entry(&file_id, total_size, None, self.config.chunk_size)?;

        let owned = self.store.owned_bytes(&file_id)?;
        let (request_tx, request_rx) = mpsc::unbounded_channel();

        let download = Arc::new(FileDownload {
            file_id,
            url,
            total_size,
            config: self.config.clone(),
            client: self.client.clone(),
            store: self.store.clone(),
            state: Mutex::new(DownloadState {
                owned,
                pending: RangeSet::new(),
                fatal: None,
            }),
            progress: Condvar::new(),
            requests: request_tx,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(scheduler(
            Arc::downgrade(&download),
            request_rx,
            download.cancel.clone(),
        ));

        // Kick off the head of the file right away.
        download.request_range(0, self.config.prefetch_window.min(total_size));

        Ok(download)
    }

    /// Asks the server for the object's total size with a one-byte range.
    async fn probe_total_size(&self, file_id: &FileId, url: &str) -> Result<u64, DownloadError> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::RANGE, "bytes=0-0")
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => return Err(DownloadError::NotFound(*file_id)),
            s if !s.is_success() => {
                return Err(match response.error_for_status() {
                    Ok(_) => DownloadError::UnknownSize(*file_id),
                    Err(e) => DownloadError::Http(e),
                });
            }
            _ => {}
        }

        content_range_total(&response)
            .or(response.content_length())
            .ok_or(DownloadError::UnknownSize(*file_id))
    }
}

struct DownloadState {
    /// Byte ranges on disk.
    owned: RangeSet,
    /// Byte ranges currently being fetched.
    pending: RangeSet,
    /// Set once on an unrecoverable failure; readers surface it.
    fatal: Option<String>,
}

/// The shared state of one file's progressive download.
pub struct FileDownload {
    file_id: FileId,
    url: String,
    total_size: u64,
    config: DownloadConfig,
    client: reqwest::Client,
    store: Arc<AudioFileStore>,
    state: Mutex<DownloadState>,
    progress: Condvar,
    requests: mpsc::UnboundedSender<(u64, u64)>,
    cancel: CancellationToken,
}

impl FileDownload {
    pub fn file_id(&self) -> &FileId {
        &self.file_id
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Bytes currently available on disk.
    pub fn downloaded_bytes(&self) -> u64 {
        self.state.lock().unwrap().owned.total_bytes()
    }

    pub fn is_complete(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .owned
            .contains_range(0, self.total_size)
    }

    /// Opens a new independent read handle positioned at zero.
    pub fn stream(self: &Arc<Self>) -> StreamingFile {
        StreamingFile {
            download: self.clone(),
            position: 0,
        }
    }

    /// Asks the scheduler to cover `[start, end)` (chunk-aligned, clamped).
    pub fn request_range(&self, start: u64, end: u64) {
        let start = start - start % self.config.chunk_size;
        let end = end.min(self.total_size).div_ceil(self.config.chunk_size) * self.config.chunk_size;
        if start >= end {
            return;
        }
        let _ = self.requests.send((start, end));
    }

    /// Issues the fetch window covering an upcoming seek target so the
    /// decoder finds bytes waiting when it reopens there.
    pub fn prefetch_for_seek(&self, target_byte: u64) {
        let start = target_byte.min(self.total_size);
        self.request_range(start, start.saturating_add(self.config.prefetch_window));
    }

    /// Stops background fetches. Cached data stays valid.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.progress.notify_all();
    }

    fn chunk_aligned_end(&self, end: u64) -> u64 {
        end.min(self.total_size)
    }
}

impl Drop for FileDownload {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Receives coverage requests and fans out bounded parallel range fetches.
///
/// Holds the download weakly so dropping the last handle tears the task
/// down instead of keeping it alive through its own request sender.
async fn scheduler(
    download: std::sync::Weak<FileDownload>,
    mut requests: mpsc::UnboundedReceiver<(u64, u64)>,
    cancel: CancellationToken,
) {
    let mut semaphore: Option<Arc<Semaphore>> = None;

    loop {
        let (start, end) = tokio::select! {
            _ = cancel.cancelled() => return,
            request = requests.recv() => match request {
                Some(r) => r,
                None => return,
            },
        };
        let Some(download) = download.upgrade() else {
            return;
        };
        let semaphore = semaphore
            .get_or_insert_with(|| Arc::new(Semaphore::new(download.config.max_parallel)))
            .clone();

        // Fetch only what is neither owned nor already in flight.
        let gaps = {
            let mut state = download.state.lock().unwrap();
            let mut covered = state.owned.clone();
            covered.union_with(&state.pending);
            let gaps = covered.gaps(start, download.chunk_aligned_end(end));
            for gap in &gaps {
                state.pending.add(gap.start, gap.end);
            }
            gaps
        };

        for gap in gaps {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let download = download.clone();
            tokio::spawn(async move {
                fetch_range(&download, gap.start, gap.end).await;
                drop(permit);
            });
        }
    }
}

/// Fetches `[start, end)` with retries, streaming chunks into the store.
async fn fetch_range(download: &Arc<FileDownload>, start: u64, end: u64) {
    let mut attempt = 0u32;
    loop {
        if download.cancel.is_cancelled() {
            release_pending(download, start, end);
            return;
        }

        match try_fetch_range(download, start, end).await {
            Ok(()) => return,
            Err(Fetch::Fatal(message)) => {
                warn!(file = %download.file_id, "fatal download failure: {message}");
                let mut state = download.state.lock().unwrap();
                state.fatal = Some(message);
                state.pending.subtract(start, end);
                drop(state);
                download.progress.notify_all();
                return;
            }
            Err(Fetch::Transient(message)) if attempt < download.config.max_retries => {
                debug!(
                    file = %download.file_id,
                    attempt, "transient download failure, retrying: {message}"
                );
                tokio::time::sleep(Duration::from_millis(
                    RETRY_BACKOFF_MS[attempt as usize % RETRY_BACKOFF_MS.len()],
                ))
                .await;
                attempt += 1;
            }
            Err(Fetch::Transient(message)) => {
                // Out of retries; release the claim so a reader can retry.
                warn!(file = %download.file_id, "range fetch gave up: {message}");
                release_pending(download, start, end);
                return;
            }
        }
    }
}

fn release_pending(download: &Arc<FileDownload>, start: u64, end: u64) {
    download
        .state
        .lock()
        .unwrap()
        .pending
        .subtract(start, end);
    download.progress.notify_all();
}

enum Fetch {
    Transient(String),
    Fatal(String),
}

async fn try_fetch_range(download: &Arc<FileDownload>, start: u64, end: u64) -> Result<(), Fetch> {
    trace!(file = %download.file_id, start, end, "fetching range");
    let mut response = download
        .client
        .get(&download.url)
        .header(
            reqwest::header::RANGE,
            format!("bytes={}-{}", start, end - 1),
        )
        .send()
        .await
        .map_err(|e| Fetch::Transient(e.to_string()))?;

    match response.status() {
        StatusCode::NOT_FOUND => {
            return Err(Fetch::Fatal(format!(
                "file {} not found on server",
                download.file_id
            )))
        }
        StatusCode::PARTIAL_CONTENT | StatusCode::OK => {}
        status => return Err(Fetch::Transient(format!("HTTP status {status}"))),
    }

    let chunk_size = download.config.chunk_size as usize;
    let mut cursor = start;
    let mut buffer: Vec<u8> = Vec::with_capacity(chunk_size);

    loop {
        let piece = response
            .chunk()
            .await
            .map_err(|e| Fetch::Transient(e.to_string()))?;
        let Some(piece) = piece else { break };
        buffer.extend_from_slice(&piece);

        while buffer.len() >= chunk_size {
            let rest = buffer.split_off(chunk_size);
            commit_chunk(download, cursor, &buffer)?;
            cursor += chunk_size as u64;
            buffer = rest;
        }
        if cursor + buffer.len() as u64 >= end {
            break;
        }
    }

    // A trailing partial chunk is only valid at the end of the file.
    if !buffer.is_empty() {
        let tail_end = cursor + buffer.len() as u64;
        if tail_end >= download.total_size {
            buffer.truncate((download.total_size - cursor) as usize);
            commit_chunk(download, cursor, &buffer)?;
            cursor = download.total_size;
        }
    }

    if cursor < end {
        // Short body; surrender the rest of the claim.
        release_pending(download, cursor, end);
    }
    Ok(())
}

fn commit_chunk(download: &Arc<FileDownload>, offset: u64, data: &[u8]) -> Result<(), Fetch> {
    let index = (offset / download.config.chunk_size) as u32;
    download
        .store
        .write_chunk(&download.file_id, index, data)
        .map_err(|e| Fetch::Transient(e.to_string()))?;

    let mut state = download.state.lock().unwrap();
    let end = offset + data.len() as u64;
    state.owned.add(offset, end);
    state.pending.subtract(offset, end);
    drop(state);
    download.progress.notify_all();
    Ok(())
}

fn content_range_total(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::CONTENT_RANGE)?
        .to_str()
        .ok()?
        .rsplit('/')
        .next()?
        .parse()
        .ok()
}

/// A blocking, seekable read handle over a progressive download.
///
/// Reads return cached bytes immediately; a read past the downloaded edge
/// requests coverage and parks until data lands, the download fails, or it
/// is shut down.
pub struct StreamingFile {
    download: Arc<FileDownload>,
    position: u64,
}

impl StreamingFile {
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn len(&self) -> u64 {
        self.download.total_size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn download(&self) -> &Arc<FileDownload> {
        &self.download
    }
}

impl Clone for StreamingFile {
    fn clone(&self) -> Self {
        Self {
            download: self.download.clone(),
            position: 0,
        }
    }
}

impl Read for StreamingFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.position >= self.download.total_size {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.download.total_size - self.position);

        loop {
            let available = {
                let state = self.download.state.lock().unwrap();
                if let Some(fatal) = &state.fatal {
                    return Err(io::Error::other(fatal.clone()));
                }
                state.owned.contained_length_from(self.position)
            };

            if available > 0 {
                let take = want.min(available);
                let data = self
                    .download
                    .store
                    .read_range(&self.download.file_id, self.position, take)
                    .map_err(io::Error::other)?;
                buf[..data.len()].copy_from_slice(&data);
                self.position += data.len() as u64;
                return Ok(data.len());
            }

            if self.download.cancel.is_cancelled() {
                return Err(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "download shut down",
                ));
            }

            // Ask for a window over the missing data and park for progress.
            let window_end = self
                .position
                .saturating_add(self.download.config.prefetch_window.max(want));
            self.download.request_range(self.position, window_end);

            let state = self.download.state.lock().unwrap();
            let _ = self
                .download
                .progress
                .wait_timeout(state, WAIT_RECHECK)
                .unwrap();
        }
    }
}

impl Seek for StreamingFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let total = self.download.total_size as i64;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(delta) => total + delta,
            SeekFrom::Current(delta) => self.position as i64 + delta,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before the start of the file",
            ));
        }
        self.position = target as u64;
        Ok(self.position)
    }
}
