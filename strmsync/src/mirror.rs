//! One synchronization run: traverse the remote tree, emit locator files,
//! download auxiliary assets, then optionally delete local orphans.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use futures::{pin_mut, StreamExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use url::Url;
use utils::backoff::{self, RetryPolicy};

use crate::alist::{join_remote, AlistClient, RemoteEntry};
use crate::config::SourceConfig;
use crate::fetch::ClientPool;
use crate::plan::{LocalPlan, LocatorMode, PlanAction, PlanOutcome, Planner};

const EXECUTOR_RETRY_POLICY: RetryPolicy = RetryPolicy::new(3, 3.0);

/// Ranged-request fan-out per download.
const DOWNLOAD_CHUNKS: u64 = 5;

pub struct MirrorEngine {
    pool: Arc<ClientPool>,
}

impl MirrorEngine {
    pub fn new(pool: Arc<ClientPool>) -> MirrorEngine {
        MirrorEngine { pool }
    }

    /// Runs one synchronization of `source`, confined to `sub_dir` beneath
    /// the configured source directory when non-empty.
    ///
    /// Per-entry failures are retried and then logged; only setup and
    /// enumeration errors fail the run as a whole.
    pub async fn run(
        &self,
        source: &SourceConfig,
        refresh: bool,
        sub_dir: &str,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let mode = LocatorMode::from_config(&source.mode);
        let planner = Arc::new(Planner::new(source, mode));
        let effective_source_dir = join_remote(&source.source_dir, sub_dir);
        let client = AlistClient::new(
            &source.url,
            &source.username,
            &source.password,
            &source.token,
            self.pool.clone(),
            cancel.clone(),
        )?;

        info!(
            "mirroring {effective_source_dir} into {} (mode {mode})",
            source.target_dir
        );

        let processed: Arc<Mutex<HashSet<Utf8PathBuf>>> = Arc::default();
        let workers = Arc::new(Semaphore::new(source.max_workers.max(1)));
        let downloaders = Arc::new(Semaphore::new(source.max_downloaders.max(1)));

        let mut executors = JoinSet::new();
        {
            let filter_planner = planner.clone();
            let filter_processed = processed.clone();
            let filter = move |entry: &RemoteEntry| match filter_planner.plan(entry) {
                PlanOutcome::Ignore => false,
                PlanOutcome::UpToDate(local_path) => {
                    filter_processed.lock().unwrap().insert(local_path);
                    false
                }
                PlanOutcome::Execute(plan) => {
                    filter_processed.lock().unwrap().insert(plan.local_path);
                    true
                }
            };

            let stream = client.iter_path(
                &effective_source_dir,
                refresh,
                mode == LocatorMode::OriginUrl,
                filter,
            );
            pin_mut!(stream);
            while let Some(entry) = stream.next().await {
                let entry = entry.context("enumerating the remote tree")?;
                if cancel.is_cancelled() {
                    warn!("shutdown requested, stopping the traversal");
                    break;
                }
                let permit = match workers.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_closed) => unreachable!("we never close the semaphore"),
                };
                let span = info_span!("entry", path = %entry.path);
                let planner = planner.clone();
                let pool = self.pool.clone();
                let downloaders = downloaders.clone();
                let cancel = cancel.clone();
                executors.spawn(
                    async move {
                        let _permit = permit;
                        let Some(plan) = planner.resolve(&entry) else {
                            return;
                        };
                        let result = backoff::retry(
                            || process_entry(&pool, &plan, &downloaders, &cancel),
                            |_: &anyhow::Error| false,
                            EXECUTOR_RETRY_POLICY,
                            "processing the entry",
                            &cancel,
                        )
                        .await;
                        if let Some(Err(e)) = result {
                            error!("giving up on {}: {e:#}", plan.local_path);
                        }
                    }
                    .instrument(span),
                );
            }
        }
        while let Some(joined) = executors.join_next().await {
            if let Err(e) = joined {
                error!("executor task panicked: {e}");
            }
        }
        info!("mirror pass for {} complete", source.id);

        if source.sync_server {
            let processed = processed.lock().unwrap().clone();
            reverse_sync(&source.target_dir, source.flatten_mode, &processed).await;
        }
        Ok(())
    }
}

async fn process_entry(
    pool: &ClientPool,
    plan: &LocalPlan,
    downloaders: &Semaphore,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    if let Some(parent) = plan.local_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create {parent}"))?;
    }
    match &plan.action {
        PlanAction::WriteLocator { content } => {
            write_locator(&plan.local_path, content).await?;
            info!("created {}", plan.local_path.file_name().unwrap_or_default());
        }
        PlanAction::Download { url } => {
            let _permit = match downloaders.acquire().await {
                Ok(permit) => permit,
                Err(_closed) => unreachable!("we never close the semaphore"),
            };
            let url = Url::parse(url).with_context(|| format!("invalid download url {url}"))?;
            pool.download(&url, &plan.local_path, DOWNLOAD_CHUNKS, None, cancel)
                .await?;
            info!(
                "downloaded {}",
                plan.local_path.file_name().unwrap_or_default()
            );
        }
    }
    Ok(())
}

/// Stages the locator next to its destination and renames it into place so
/// that a crash cannot leave a torn file.
async fn write_locator(path: &Utf8Path, content: &str) -> anyhow::Result<()> {
    let staged = Utf8PathBuf::from(format!("{path}.tmp"));
    tokio::fs::write(&staged, content.as_bytes())
        .await
        .with_context(|| format!("write {staged}"))?;
    tokio::fs::rename(&staged, path)
        .await
        .with_context(|| format!("rename {staged} into place"))?;
    Ok(())
}

/// Deletes local files the run did not produce or refresh. Deletion failures
/// are logged without failing the run, and directories left empty stay in
/// place.
async fn reverse_sync(
    target_dir: &Utf8Path,
    flatten_mode: bool,
    processed: &HashSet<Utf8PathBuf>,
) {
    info!("cleaning up local files under {target_dir}");
    let local_files = match list_local_files(target_dir, flatten_mode) {
        Ok(files) => files,
        Err(e) => {
            error!("skipping local cleanup, failed to scan {target_dir}: {e:#}");
            return;
        }
    };
    for file in local_files {
        if processed.contains(&file) {
            continue;
        }
        match tokio::fs::remove_file(&file).await {
            Ok(()) => info!("deleted {file}"),
            Err(e) => error!("failed to delete {file}: {e}"),
        }
    }
    debug!("local cleanup done");
}

/// Regular files under `target_dir`; a flat scan in flatten mode, recursive
/// otherwise.
fn list_local_files(target_dir: &Utf8Path, flatten_mode: bool) -> anyhow::Result<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();
    if flatten_mode {
        for dent in target_dir
            .read_dir_utf8()
            .with_context(|| format!("read {target_dir}"))?
        {
            let dent = dent?;
            if dent.file_type()?.is_file() {
                files.push(dent.path().to_owned());
            }
        }
    } else {
        for dent in walkdir::WalkDir::new(target_dir) {
            let dent = dent?;
            if dent.file_type().is_file() {
                let path = Utf8PathBuf::from_path_buf(dent.into_path())
                    .map_err(|p| anyhow::anyhow!("non-UTF8 local path {}", p.display()))?;
                files.push(path);
            }
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn locator_content_is_exact() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("a.strm");
        write_locator(&path, "https://alist.example.com/d/m/a.mkv")
            .await
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        // one line, no trailing newline
        assert_eq!(content, "https://alist.example.com/d/m/a.mkv");
        // no staging file left behind
        assert_eq!(dir.path().read_dir_utf8().unwrap().count(), 1);
    }

    #[tokio::test]
    async fn reverse_sync_deletes_only_orphans() {
        let dir = camino_tempfile::tempdir().unwrap();
        let target = dir.path();
        std::fs::create_dir_all(target.join("sub")).unwrap();
        std::fs::write(target.join("keep.strm"), "u1").unwrap();
        std::fs::write(target.join("sub/keep.srt"), "s").unwrap();
        std::fs::write(target.join("ghost.strm"), "u2").unwrap();
        std::fs::write(target.join("sub/ghost.jpg"), "j").unwrap();

        let processed: HashSet<Utf8PathBuf> =
            [target.join("keep.strm"), target.join("sub/keep.srt")]
                .into_iter()
                .collect();
        reverse_sync(target, false, &processed).await;

        assert!(target.join("keep.strm").exists());
        assert!(target.join("sub/keep.srt").exists());
        assert!(!target.join("ghost.strm").exists());
        assert!(!target.join("sub/ghost.jpg").exists());
    }

    #[tokio::test]
    async fn reverse_sync_leaves_emptied_directories() {
        let dir = camino_tempfile::tempdir().unwrap();
        let target = dir.path();
        std::fs::create_dir_all(target.join("emptied")).unwrap();
        std::fs::write(target.join("emptied/ghost.strm"), "u").unwrap();

        reverse_sync(target, false, &HashSet::new()).await;

        assert!(!target.join("emptied/ghost.strm").exists());
        assert!(target.join("emptied").is_dir());
    }

    #[test]
    fn flat_scan_ignores_subdirectories() {
        let dir = camino_tempfile::tempdir().unwrap();
        let target = dir.path();
        std::fs::write(target.join("a.strm"), "u").unwrap();
        std::fs::create_dir_all(target.join("nested")).unwrap();
        std::fs::write(target.join("nested/b.strm"), "u").unwrap();

        let flat = list_local_files(target, true).unwrap();
        assert_eq!(flat, vec![target.join("a.strm")]);

        let mut recursive = list_local_files(target, false).unwrap();
        recursive.sort();
        assert_eq!(
            recursive,
            vec![target.join("a.strm"), target.join("nested/b.strm")]
        );
    }
}
