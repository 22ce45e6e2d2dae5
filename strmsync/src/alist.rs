//! Typed client for the remote Alist-style filesystem API.
//!
//! The remote speaks JSON envelopes of the shape `{code, message, data}` over
//! POST endpoints. Listings are lazy: [`AlistClient::iter_path`] walks a
//! subtree depth-first and yields file entries as the traversal discovers
//! them, so a mirror run can start working before the enumeration finishes.

use std::sync::Arc;

use anyhow::Context;
use async_stream::try_stream;
use chrono::{DateTime, Utc};
use futures::Stream;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::fetch::ClientPool;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("unauthenticated against the remote")]
    Unauthenticated,
    #[error("remote API error {code}: {message}")]
    Api { code: i64, message: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One node returned by a remote listing. Immutable for the duration of a
/// run.
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub name: String,
    /// Absolute path in the remote namespace.
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
    /// Server-proxied download URL, signed when the listing supplies a
    /// signature.
    pub download_url: String,
    /// Ultimate origin URL; present only when a detailed listing was
    /// requested.
    pub raw_url: Option<String>,
}

impl RemoteEntry {
    /// Lower-cased extension including the leading dot, or empty.
    pub fn suffix(&self) -> String {
        match self.name.rfind('.') {
            Some(idx) if idx > 0 => self.name[idx..].to_ascii_lowercase(),
            _ => String::new(),
        }
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Deserialize)]
struct LoginData {
    token: String,
}

#[derive(Deserialize)]
struct ListData {
    #[serde(default)]
    content: Option<Vec<ListedEntry>>,
}

#[derive(Debug, Deserialize)]
struct ListedEntry {
    name: String,
    #[serde(default)]
    size: u64,
    is_dir: bool,
    #[serde(default)]
    modified: Option<String>,
    #[serde(default)]
    sign: Option<String>,
}

#[derive(Deserialize)]
struct GetData {
    #[serde(default)]
    raw_url: Option<String>,
}

pub struct AlistClient {
    /// Base URL without a trailing slash, e.g. `https://alist.example.com`.
    base: String,
    username: String,
    password: String,
    /// Configured token, or one obtained from a lazy login.
    token: tokio::sync::Mutex<Option<String>>,
    pool: Arc<ClientPool>,
    cancel: CancellationToken,
}

impl AlistClient {
    pub fn new(
        base_url: &str,
        username: &str,
        password: &str,
        token: &str,
        pool: Arc<ClientPool>,
        cancel: CancellationToken,
    ) -> anyhow::Result<AlistClient> {
        Url::parse(base_url).with_context(|| format!("invalid remote base url {base_url:?}"))?;
        Ok(AlistClient {
            base: base_url.trim_end_matches('/').to_owned(),
            username: username.to_owned(),
            password: password.to_owned(),
            token: tokio::sync::Mutex::new(if token.is_empty() {
                None
            } else {
                Some(token.to_owned())
            }),
            pool,
            cancel,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        Url::parse(&format!("{}{path}", self.base))
            .with_context(|| format!("building url for {path}"))
            .map_err(RemoteError::Other)
    }

    async fn login(&self) -> Result<String, RemoteError> {
        let url = self.endpoint("/api/auth/login")?;
        let body = serde_json::json!({
            "username": self.username,
            "password": self.password,
        });
        let response = self
            .pool
            .request(Method::POST, &url, None, Some(body), false, &self.cancel)
            .await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(RemoteError::Unauthenticated);
        }
        let envelope: Envelope<LoginData> = response
            .json()
            .await
            .context("decode login response")
            .map_err(RemoteError::Other)?;
        match (envelope.code, envelope.data) {
            (200, Some(data)) => Ok(data.token),
            (401, _) => Err(RemoteError::Unauthenticated),
            (code, _) => Err(RemoteError::Api {
                code,
                message: envelope.message,
            }),
        }
    }

    /// Returns the token to authenticate with, logging in on first use when
    /// only credentials were configured.
    async fn auth_token(&self) -> Result<Option<String>, RemoteError> {
        let mut token = self.token.lock().await;
        if token.is_none() && !self.username.is_empty() {
            debug!("no token cached, logging in as {}", self.username);
            *token = Some(self.login().await?);
        }
        Ok(token.clone())
    }

    async fn post_api<T: DeserializeOwned>(
        &self,
        api_path: &str,
        body: serde_json::Value,
    ) -> Result<T, RemoteError> {
        let url = self.endpoint(api_path)?;
        let mut headers = HeaderMap::new();
        if let Some(token) = self.auth_token().await? {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&token)
                    .context("token is not a valid header value")
                    .map_err(RemoteError::Other)?,
            );
        }
        // The listing endpoints are read-only, so retrying the POST is safe.
        let response = self
            .pool
            .request(
                Method::POST,
                &url,
                Some(headers),
                Some(body),
                true,
                &self.cancel,
            )
            .await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(RemoteError::Unauthenticated);
        }
        if response.status() == StatusCode::NOT_FOUND {
            return Err(RemoteError::Api {
                code: 404,
                message: "object not found".to_owned(),
            });
        }
        let envelope: Envelope<T> = response
            .json()
            .await
            .with_context(|| format!("decode {api_path} response"))
            .map_err(RemoteError::Other)?;
        match (envelope.code, envelope.data) {
            (200, Some(data)) => Ok(data),
            (200, None) => Err(RemoteError::Api {
                code: 200,
                message: "response carried no data".to_owned(),
            }),
            (401, _) => Err(RemoteError::Unauthenticated),
            (code, _) => Err(RemoteError::Api {
                code,
                message: envelope.message,
            }),
        }
    }

    /// Lists one directory. `refresh` makes the remote bypass its own listing
    /// cache; `detail` resolves the origin URL of every file at the cost of
    /// one extra request per entry. A missing directory is an empty listing.
    pub async fn list(
        &self,
        path: &str,
        refresh: bool,
        detail: bool,
    ) -> Result<Vec<RemoteEntry>, RemoteError> {
        let body = serde_json::json!({
            "path": path,
            "password": "",
            "page": 1,
            "per_page": 0,
            "refresh": refresh,
        });
        let data: ListData = match self.post_api("/api/fs/list", body).await {
            Ok(data) => data,
            Err(err) if is_not_found(&err) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mut entries = Vec::new();
        for item in data.content.unwrap_or_default() {
            let mut entry = self.build_entry(path, item)?;
            if detail && !entry.is_dir {
                entry.raw_url = self.fetch_raw_url(&entry.path).await?;
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    fn build_entry(&self, dir_path: &str, item: ListedEntry) -> Result<RemoteEntry, RemoteError> {
        let path = join_remote(dir_path, &item.name);
        let download_url = self.download_url(&path, item.sign.as_deref())?;
        Ok(RemoteEntry {
            path,
            is_dir: item.is_dir,
            size: item.size,
            modified_at: item
                .modified
                .as_deref()
                .and_then(|m| DateTime::parse_from_rfc3339(m).ok())
                .map(|m| m.with_timezone(&Utc)),
            download_url,
            raw_url: None,
            name: item.name,
        })
    }

    fn download_url(&self, path: &str, sign: Option<&str>) -> Result<String, RemoteError> {
        // Url::parse percent-encodes whatever the remote names its files
        let mut url = Url::parse(&format!("{}/d{path}", self.base))
            .with_context(|| format!("building download url for {path}"))
            .map_err(RemoteError::Other)?;
        if let Some(sign) = sign.filter(|s| !s.is_empty()) {
            url.query_pairs_mut().append_pair("sign", sign);
        }
        Ok(url.into())
    }

    async fn fetch_raw_url(&self, path: &str) -> Result<Option<String>, RemoteError> {
        let body = serde_json::json!({ "path": path, "password": "" });
        let data: GetData = self.post_api("/api/fs/get", body).await?;
        Ok(data.raw_url)
    }

    /// Walks the subtree under `root` depth-first. `filter` runs exactly once
    /// per discovered entry; entries it accepts are yielded. Directories are
    /// always recursed into but never yielded themselves.
    pub fn iter_path<'a, F>(
        &'a self,
        root: &str,
        refresh: bool,
        detail: bool,
        mut filter: F,
    ) -> impl Stream<Item = Result<RemoteEntry, RemoteError>> + 'a
    where
        F: FnMut(&RemoteEntry) -> bool + 'a,
    {
        let root = root.to_owned();
        try_stream! {
            let mut pending = vec![root];
            while let Some(dir) = pending.pop() {
                let children = self.list(&dir, refresh, detail).await?;
                let mut subdirs = Vec::new();
                for child in children {
                    let wanted = filter(&child);
                    if child.is_dir {
                        subdirs.push(child.path);
                    } else if wanted {
                        yield child;
                    }
                }
                // LIFO traversal: the first-listed subdirectory is visited
                // next, before siblings queued earlier
                subdirs.reverse();
                pending.append(&mut subdirs);
            }
        }
    }

    /// Two-phase cache refresh after an external sync delivered `sub` under
    /// `base`: re-list the parent bypassing the remote cache, and if the new
    /// subtree is already visible, walk it with the cache bypassed too. The
    /// remote's listing cache is eventually consistent, so the subtree may
    /// legitimately not be there yet.
    pub async fn refresh_tree(&self, base: &str, sub: &str) -> Result<(), RemoteError> {
        let target = join_remote(base, sub);
        let children = self.list(base, true, false).await?;
        if !children.iter().any(|c| c.is_dir && c.path == target) {
            debug!("{target} not visible yet, refreshed {base} only");
            return Ok(());
        }
        let mut pending = vec![target];
        while let Some(dir) = pending.pop() {
            let children = self.list(&dir, true, false).await?;
            pending.extend(children.into_iter().filter(|c| c.is_dir).map(|c| c.path));
        }
        Ok(())
    }
}

fn is_not_found(err: &RemoteError) -> bool {
    match err {
        RemoteError::Api { code: 404, .. } => true,
        RemoteError::Api { message, .. } => message.contains("object not found"),
        _ => false,
    }
}

/// Joins two remote paths into a normalized absolute one: a single leading
/// slash, no doubled slashes, no trailing slash except for the root itself.
pub fn join_remote(a: &str, b: &str) -> String {
    let mut out = String::with_capacity(a.len() + b.len() + 2);
    for segment in a.split('/').chain(b.split('/')).filter(|s| !s.is_empty()) {
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}
