use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::header::{CONTENT_LENGTH, HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;
use tracing::{debug, info};

use crate::app::{CancelToken, ProgressEvent, ProgressSink};
use crate::error::ImportError;

#[derive(Debug, Clone, Serialize)]
pub struct FetchedArchive {
    pub path: PathBuf,
    /// `true` when an earlier download was found and nothing was transferred.
    pub reused: bool,
    pub bytes: u64,
}

pub trait Downloader: Send + Sync {
    fn fetch(
        &self,
        url: &str,
        destination: &Path,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<FetchedArchive, ImportError>;
}

#[derive(Clone)]
pub struct HttpDownloader {
    client: Client,
    chunk_size: usize,
}

impl HttpDownloader {
    pub fn new(connect_timeout: Duration, chunk_size: usize) -> Result<Self, ImportError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("ibge-import/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| ImportError::Config(err.to_string()))?,
        );
        // Archives take minutes to stream; only the connect phase is bounded.
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(connect_timeout)
            .timeout(None)
            .build()
            .map_err(|err| ImportError::Transport {
                url: String::new(),
                message: err.to_string(),
            })?;
        Ok(Self {
            client,
            chunk_size: chunk_size.max(1),
        })
    }
}

impl Downloader for HttpDownloader {
    fn fetch(
        &self,
        url: &str,
        destination: &Path,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
    ) -> Result<FetchedArchive, ImportError> {
        if destination.exists() {
            info!(path = %destination.display(), "archive already present, skipping download");
            sink.event(ProgressEvent {
                message: format!("phase=Fetch; reusing {}", destination.display()),
                elapsed: None,
            });
            let bytes = fs::metadata(destination)
                .map(|meta| meta.len())
                .unwrap_or(0);
            return Ok(FetchedArchive {
                path: destination.to_path_buf(),
                reused: true,
                bytes,
            });
        }

        info!(%url, path = %destination.display(), "downloading archive");
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|err| ImportError::Transport {
                url: url.to_string(),
                message: err.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(ImportError::Download {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let total_bytes = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        let mut progress = DownloadProgress::new(total_bytes, self.chunk_size as u64);
        sink.event(ProgressEvent {
            message: format!("phase=Fetch; {}", progress.describe()),
            elapsed: None,
        });

        let parent = match destination.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(|err| ImportError::Filesystem(err.to_string()))?;
        let mut temp = tempfile::Builder::new()
            .prefix(".ibge-download")
            .tempfile_in(&parent)
            .map_err(|err| ImportError::Filesystem(err.to_string()))?;

        let mut buffer = vec![0u8; self.chunk_size];
        loop {
            if cancel.is_cancelled() {
                info!(%url, "download cancelled");
                return Err(ImportError::Cancelled);
            }
            let read = read_chunk(&mut response, &mut buffer).map_err(|err| {
                ImportError::Transport {
                    url: url.to_string(),
                    message: err.to_string(),
                }
            })?;
            if read == 0 {
                break;
            }
            temp.write_all(&buffer[..read])
                .map_err(|err| ImportError::Filesystem(err.to_string()))?;
            progress.record(read as u64);
            debug!(chunks = progress.chunks, bytes = progress.bytes, "chunk written");
            sink.event(ProgressEvent {
                message: format!("phase=Fetch; {}", progress.describe()),
                elapsed: Some(progress.started.elapsed()),
            });
        }

        temp.flush()
            .map_err(|err| ImportError::Filesystem(err.to_string()))?;
        temp.persist(destination)
            .map_err(|err| ImportError::Filesystem(err.to_string()))?;
        info!(bytes = progress.bytes, chunks = progress.chunks, "download complete");

        Ok(FetchedArchive {
            path: destination.to_path_buf(),
            reused: false,
            bytes: progress.bytes,
        })
    }
}

/// Fills `buffer` unless the stream ends first; returns the bytes read.
fn read_chunk<R: Read>(reader: &mut R, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

#[derive(Debug, Clone)]
pub struct DownloadProgress {
    pub bytes: u64,
    pub chunks: u64,
    pub total_bytes: Option<u64>,
    pub total_chunks: Option<u64>,
    started: Instant,
}

impl DownloadProgress {
    pub fn new(total_bytes: Option<u64>, chunk_size: u64) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            bytes: 0,
            chunks: 0,
            total_bytes,
            total_chunks: total_bytes.map(|total| total.div_ceil(chunk_size)),
            started: Instant::now(),
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.bytes += bytes;
        self.chunks += 1;
    }

    /// Remaining time at the average rate so far; unknown without a total.
    pub fn eta(&self) -> Option<Duration> {
        let total = self.total_bytes?;
        if self.bytes == 0 {
            return None;
        }
        let elapsed = self.started.elapsed().as_secs_f64();
        let rate = self.bytes as f64 / elapsed.max(0.001);
        let remaining = total.saturating_sub(self.bytes) as f64;
        Some(Duration::from_secs_f64(remaining / rate))
    }

    pub fn describe(&self) -> String {
        match (self.total_bytes, self.total_chunks) {
            (Some(total), Some(total_chunks)) => {
                let eta = self
                    .eta()
                    .map(|eta| format!(", eta {}s", eta.as_secs()))
                    .unwrap_or_default();
                format!(
                    "{}/{} chunks ({} of {}){eta}",
                    self.chunks,
                    total_chunks,
                    bytes_to_human(self.bytes),
                    bytes_to_human(total)
                )
            }
            _ => format!("{} chunks ({})", self.chunks, bytes_to_human(self.bytes)),
        }
    }
}

pub fn bytes_to_human(bytes: u64) -> String {
    let units = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0usize;
    while value >= 1024.0 && unit < units.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", units[unit])
    } else {
        format!("{value:.1} {}", units[unit])
    }
}
