//! Pooled HTTP client and range-parallel downloader.
//!
//! One long-lived client exists per remote `(host, port)`; everything the
//! process talks to goes through here so connection pools are reused across
//! runs. Large downloads are split into ranged GETs that write into one
//! sparse staging file, which is moved into place only when complete.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, ensure, Context};
use camino::{Utf8Path, Utf8PathBuf};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, RANGE};
use reqwest::{Method, Response, StatusCode};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter, SeekFrom};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;
use utils::backoff::{self, RetryPolicy};

/// Bodies smaller than this are fetched in one request regardless of the
/// requested chunk count.
pub const MIN_CHUNKED_SIZE: u64 = 128 * 1024 * 1024;

/// Buffered-write granularity for downloaded bodies.
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const HTTP_RETRY_POLICY: RetryPolicy = RetryPolicy::new(3, 1.0);

type HostKey = (String, u16);

pub struct ClientPool {
    user_agent: String,
    clients: Mutex<HashMap<HostKey, reqwest::Client>>,
}

impl ClientPool {
    pub fn new(user_agent: &str) -> Self {
        ClientPool {
            user_agent: user_agent.to_owned(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn host_key(url: &Url) -> anyhow::Result<HostKey> {
        let host = url
            .host_str()
            .with_context(|| format!("url {url} has no host"))?;
        let port = url
            .port_or_known_default()
            .with_context(|| format!("url {url} has no port"))?;
        Ok((host.to_owned(), port))
    }

    fn client_for(&self, url: &Url) -> anyhow::Result<reqwest::Client> {
        let key = Self::host_key(url)?;
        let mut clients = self.clients.lock().unwrap();
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }
        let client = self.build_client()?;
        clients.insert(key, client.clone());
        Ok(client)
    }

    /// Drops the pooled client for `url`'s host; the next request builds a
    /// fresh one with an empty connection pool.
    fn discard(&self, url: &Url) {
        if let Ok(key) = Self::host_key(url) {
            self.clients.lock().unwrap().remove(&key);
        }
    }

    fn build_client(&self) -> anyhow::Result<reqwest::Client> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        reqwest::Client::builder()
            .user_agent(&self.user_agent)
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("Failed to construct HTTP client")
    }

    /// Issues one request, retrying timeouts with exponential backoff.
    ///
    /// Only idempotent methods are retried unless `retry_non_idempotent` says
    /// otherwise. When the retries are exhausted on a timeout the pooled
    /// client for the host is torn down and replaced.
    pub async fn request(
        &self,
        method: Method,
        url: &Url,
        headers: Option<HeaderMap>,
        json_body: Option<serde_json::Value>,
        retry_non_idempotent: bool,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Response> {
        let client = self.client_for(url)?;
        let idempotent = method == Method::GET || method == Method::HEAD;
        let result = backoff::retry(
            || {
                let mut request = client.request(method.clone(), url.clone());
                if let Some(headers) = &headers {
                    request = request.headers(headers.clone());
                }
                if let Some(body) = &json_body {
                    request = request.json(body);
                }
                async move { request.send().await }
            },
            |err: &reqwest::Error| !err.is_timeout() || !(idempotent || retry_non_idempotent),
            HTTP_RETRY_POLICY,
            &format!("{method} {url}"),
            cancel,
        )
        .await;
        match result {
            None => bail!("shutting down"),
            Some(Ok(response)) => Ok(response),
            Some(Err(err)) => {
                if err.is_timeout() {
                    self.discard(url);
                }
                Err(err).with_context(|| format!("{method} {url}"))
            }
        }
    }

    /// Downloads `url` into `destination`. Bodies at least [`MIN_CHUNKED_SIZE`]
    /// long are fetched as `chunk_count` concurrent ranged requests.
    ///
    /// The destination either ends up with the complete body or stays
    /// untouched; partial transfers only ever exist in a staging directory.
    /// Concurrent downloads to the same destination are not supported.
    pub async fn download(
        &self,
        url: &Url,
        destination: &Utf8Path,
        chunk_count: u64,
        headers: Option<HeaderMap>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let head = self
            .request(Method::HEAD, url, headers.clone(), None, false, cancel)
            .await?;
        let size = content_length(&head);

        let staging_dir = camino_tempfile::Builder::new()
            .prefix("strmsync-download-")
            .tempdir()
            .context("Failed to create download staging directory")?;
        let staged = staging_dir
            .path()
            .join(destination.file_name().unwrap_or("download"));

        match size {
            None => {
                debug!("size of {url} is unknown, downloading in one request");
                self.fetch_single(url, &staged, headers.clone(), cancel)
                    .await?;
            }
            Some(size) => {
                let ranges = chunk_ranges(size, chunk_count);
                if ranges.len() == 1 {
                    self.fetch_single(url, &staged, headers.clone(), cancel)
                        .await?;
                } else {
                    debug!("downloading {url} in {} ranged requests", ranges.len());
                    let file = tokio::fs::File::create(&staged)
                        .await
                        .with_context(|| format!("create {staged}"))?;
                    file.set_len(size)
                        .await
                        .with_context(|| format!("presize {staged}"))?;
                    drop(file);
                    futures::future::try_join_all(ranges.iter().map(|range| {
                        self.fetch_chunk(url, &staged, *range, headers.clone(), cancel)
                    }))
                    .await?;
                }
                let written = tokio::fs::metadata(&staged)
                    .await
                    .with_context(|| format!("stat {staged}"))?
                    .len();
                ensure!(
                    written == size,
                    "{url} returned {written} bytes, expected {size}"
                );
            }
        }

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {parent}"))?;
        }
        // The staging directory can live on another filesystem, so copy next
        // to the destination first and rename into place.
        let partial = Utf8PathBuf::from(format!("{destination}.part"));
        tokio::fs::copy(&staged, &partial)
            .await
            .with_context(|| format!("copy {staged} to {partial}"))?;
        tokio::fs::rename(&partial, destination)
            .await
            .with_context(|| format!("rename {partial} into place"))?;
        Ok(())
    }

    async fn fetch_single(
        &self,
        url: &Url,
        path: &Utf8Path,
        headers: Option<HeaderMap>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let response = self
            .request(Method::GET, url, headers, None, false, cancel)
            .await?;
        let response = response.error_for_status()?;
        let file = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("create {path}"))?;
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
        write_body(response, &mut writer).await?;
        writer.flush().await.with_context(|| format!("flush {path}"))?;
        Ok(())
    }

    /// Fetches one byte range into `path` at its own offset. The server must
    /// honor the range; a full-body 200 response would corrupt the file.
    async fn fetch_chunk(
        &self,
        url: &Url,
        path: &Utf8Path,
        range: ByteRange,
        headers: Option<HeaderMap>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let mut headers = headers.unwrap_or_default();
        headers.insert(
            RANGE,
            HeaderValue::from_str(&format!("bytes={}-{}", range.start, range.end))
                .context("range header value")?,
        );
        let response = self
            .request(Method::GET, url, Some(headers), None, false, cancel)
            .await?;
        if response.status() != StatusCode::PARTIAL_CONTENT {
            bail!(
                "{url} answered a ranged request with {}, expected 206",
                response.status()
            );
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .with_context(|| format!("open {path}"))?;
        file.seek(SeekFrom::Start(range.start))
            .await
            .with_context(|| format!("seek to {} in {path}", range.start))?;
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
        let written = write_body(response, &mut writer).await?;
        writer.flush().await.with_context(|| format!("flush {path}"))?;
        ensure!(
            written == range.len(),
            "range {}-{} of {url} returned {written} bytes, expected {}",
            range.start,
            range.end,
            range.len()
        );
        Ok(())
    }
}

async fn write_body(
    mut response: Response,
    writer: &mut BufWriter<tokio::fs::File>,
) -> anyhow::Result<u64> {
    let mut written = 0u64;
    while let Some(chunk) = response.chunk().await.context("read response body")? {
        writer.write_all(&chunk).await.context("write body chunk")?;
        written += chunk.len() as u64;
    }
    Ok(written)
}

fn content_length(response: &Response) -> Option<u64> {
    let value = response
        .headers()
        .get(reqwest::header::CONTENT_LENGTH)?
        .to_str()
        .ok()?;
    let length: i64 = value.trim().parse().ok()?;
    u64::try_from(length).ok()
}

/// One inclusive byte range of a chunked download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes the range covers; ranges are never empty.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Splits `[0, size - 1]` into contiguous inclusive ranges whose sizes differ
/// by at most one byte; remainder bytes go to the lowest-index chunks. Small
/// bodies and `chunk_count <= 1` yield a single range.
pub fn chunk_ranges(size: u64, chunk_count: u64) -> Vec<ByteRange> {
    if size < MIN_CHUNKED_SIZE || chunk_count <= 1 {
        return vec![ByteRange {
            start: 0,
            end: size.saturating_sub(1),
        }];
    }
    let step = size / chunk_count;
    let remainder = size % chunk_count;

    let mut ranges = Vec::with_capacity(chunk_count as usize);
    let mut start = 0;
    for i in 0..chunk_count {
        let extra = u64::from(i < remainder);
        let end = start + step + extra - 1;
        ranges.push(ByteRange { start, end });
        start = end + 1;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_bodies_get_one_range() {
        assert_eq!(
            chunk_ranges(1024, 5),
            vec![ByteRange { start: 0, end: 1023 }]
        );
        assert_eq!(
            chunk_ranges(MIN_CHUNKED_SIZE, 1),
            vec![ByteRange {
                start: 0,
                end: MIN_CHUNKED_SIZE - 1
            }]
        );
    }

    #[test]
    fn three_hundred_megabytes_in_five_chunks() {
        let size = 300 * 1024 * 1024;
        let ranges = chunk_ranges(size, 5);
        assert_eq!(
            ranges,
            vec![
                ByteRange { start: 0, end: 62914559 },
                ByteRange { start: 62914560, end: 125829119 },
                ByteRange { start: 125829120, end: 188743679 },
                ByteRange { start: 188743680, end: 251658239 },
                ByteRange { start: 251658240, end: 314572799 },
            ]
        );
    }

    #[test]
    fn ranges_are_disjoint_cover_and_balanced() {
        // a size that does not divide evenly
        let size = MIN_CHUNKED_SIZE + 7;
        let chunk_count = 5;
        let ranges = chunk_ranges(size, chunk_count);
        assert_eq!(ranges.len(), chunk_count as usize);

        assert_eq!(ranges[0].start, 0);
        assert_eq!(ranges.last().unwrap().end, size - 1);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end + 1, pair[1].start);
        }

        let total: u64 = ranges.iter().map(ByteRange::len).sum();
        assert_eq!(total, size);

        let min = ranges.iter().map(ByteRange::len).min().unwrap();
        let max = ranges.iter().map(ByteRange::len).max().unwrap();
        assert!(max - min <= 1);
        // remainder bytes land on the lowest-index chunks
        assert!(ranges[0].len() >= ranges.last().unwrap().len());
    }

    #[test]
    fn pool_keys_carry_default_ports() {
        let https = Url::parse("https://alist.example.com/d/a.mkv").unwrap();
        assert_eq!(
            ClientPool::host_key(&https).unwrap(),
            ("alist.example.com".to_owned(), 443)
        );
        let custom = Url::parse("http://alist.example.com:5244/api/fs/list").unwrap();
        assert_eq!(
            ClientPool::host_key(&custom).unwrap(),
            ("alist.example.com".to_owned(), 5244)
        );
    }
}
