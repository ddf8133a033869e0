//! Wires configuration, the Netdisk client and the transfer engine together.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use tracing::{info, warn};

use panbd_client::{DownloadTarget, PanClient, RefreshTokenGrant};
use panbd_transfer::credentials::authorized;
use panbd_transfer::metadata::metadata_path;
use panbd_transfer::upload::discard_checkpoint;
use panbd_transfer::{
    CachedCredentials, DownloadOptions, DownloadOutcome, DownloadRequest, Downloader,
    ProgressReporter, SessionError, TokenGrant, TransferError, TransferProgress, UploadOptions,
    UploadRequest, Uploader, app_scoped_path,
};

use crate::config::Config;
use crate::{Cli, Command};

/// Runs one CLI command.
pub async fn run(cli: Cli, config: Config, config_path: PathBuf) -> anyhow::Result<()> {
    let client = PanClient::new()?;
    let grant = config.grant().context(
        "no access token configured: set BAIDU_ACCESS_TOKEN or access_token in the config file",
    )?;

    let mut credentials = CachedCredentials::new(grant.clone());
    if !config.app_key.is_empty() && !config.secret_key.is_empty() {
        let refresher = RefreshTokenGrant::new(client.clone(), &config.app_key, &config.secret_key);
        credentials = credentials.with_refresher(Arc::new(refresher));
    }
    let credentials = Arc::new(credentials);

    let result = match cli.command {
        Command::Download {
            remote,
            local,
            overwrite,
            recheck,
            block_size,
        } => {
            let options = download_options(&config, cli.workers, overwrite, recheck, block_size)?;
            download(&client, &credentials, &remote, local, &options).await
        }
        Command::DownloadDir {
            remote,
            local,
            overwrite,
            recheck,
            block_size,
        } => {
            let options = download_options(&config, cli.workers, overwrite, recheck, block_size)?;
            download_dir(&client, &credentials, &remote, &local, &options).await
        }
        Command::Upload {
            local,
            remote,
            rename_policy,
        } => {
            let options = UploadOptions {
                workers: cli.workers.or(config.workers),
                rename_policy: rename_policy.unwrap_or(config.rename_policy),
                retry: config.retry_policy()?,
            };
            upload(&client, &credentials, &config, local, &remote, &options).await
        }
        Command::List { dir } => list(&client, &credentials, &dir).await,
    };

    save_refreshed_grant(&credentials, &grant, &config_path).await;
    result
}

fn download_options(
    config: &Config,
    workers: Option<usize>,
    overwrite: bool,
    recheck: bool,
    block_size: Option<u64>,
) -> anyhow::Result<DownloadOptions> {
    Ok(DownloadOptions {
        block_size_mib: block_size.unwrap_or(config.block_size_mib),
        workers: workers.or(config.workers),
        overwrite,
        recheck,
        retry: config.retry_policy()?,
    })
}

/// A local file without resume metadata is a finished download; it is kept
/// unless `overwrite` is set.
fn already_downloaded(local: &Path, overwrite: bool) -> bool {
    !overwrite && local.is_file() && !metadata_path(local).exists()
}

async fn download(
    client: &PanClient,
    credentials: &Arc<CachedCredentials>,
    remote: &str,
    local: PathBuf,
    options: &DownloadOptions,
) -> anyhow::Result<()> {
    if already_downloaded(&local, options.overwrite) {
        warn!(path = %local.display(), "local file exists, pass --overwrite to replace it");
        return Ok(());
    }
    let target = authorized(credentials.as_ref(), |token| async move {
        client
            .resolve_download(&token, remote)
            .await
            .map_err(TransferError::from)
    })
    .await
    .with_context(|| format!("resolving {remote}"))?;

    fetch(client, credentials, target, local, options).await
}

/// Downloads every file `listall` reports below `dir` into `local_dir`.
async fn download_dir(
    client: &PanClient,
    credentials: &Arc<CachedCredentials>,
    dir: &str,
    local_dir: &Path,
    options: &DownloadOptions,
) -> anyhow::Result<()> {
    let entries = authorized(credentials.as_ref(), |token| async move {
        client.list_all(&token, dir).await.map_err(TransferError::from)
    })
    .await
    .with_context(|| format!("listing {dir}"))?;

    let files: Vec<_> = entries.into_iter().filter(|e| !e.is_dir()).collect();
    if files.is_empty() {
        warn!(dir, "no files below remote directory");
        return Ok(());
    }
    info!(dir, files = files.len(), local = %local_dir.display(), "downloading directory");

    let mut failed = 0usize;
    for entry in &files {
        let Some(local) = destination(local_dir, dir, &entry.path) else {
            warn!(path = %entry.path, "skipping entry outside the listed directory");
            continue;
        };
        if already_downloaded(&local, options.overwrite) {
            info!(path = %local.display(), "already downloaded");
            continue;
        }
        // Download links expire, so each one is fetched right before use.
        let target = authorized(credentials.as_ref(), |token| async move {
            client
                .download_target(&token, entry)
                .await
                .map_err(TransferError::from)
        })
        .await
        .with_context(|| format!("resolving {}", entry.path));
        let result = match target {
            Ok(target) => fetch(client, credentials, target, local, options).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(path = %entry.path, error = %format!("{e:#}"), "file download failed");
            failed += 1;
        }
    }
    anyhow::ensure!(
        failed == 0,
        "{failed} of {} files failed; run the same command again to resume",
        files.len()
    );
    Ok(())
}

/// Maps a remote path below `dir` to its place below `local_dir`.
fn destination(local_dir: &Path, dir: &str, remote: &str) -> Option<PathBuf> {
    let relative = remote
        .strip_prefix(dir.trim_end_matches('/'))?
        .strip_prefix('/')?;
    let mut path = local_dir.to_path_buf();
    for part in relative.split('/') {
        if part.is_empty() || part == "." || part == ".." {
            return None;
        }
        path.push(part);
    }
    Some(path)
}

async fn fetch(
    client: &PanClient,
    credentials: &Arc<CachedCredentials>,
    target: DownloadTarget,
    local: PathBuf,
    options: &DownloadOptions,
) -> anyhow::Result<()> {
    let request = DownloadRequest {
        url: target.dlink,
        resource_path: target.remote_path,
        local_path: local,
        total_size: Some(target.size),
        expected_md5: Some(target.md5).filter(|m| !m.is_empty()),
    };

    let downloader = Downloader::new(Arc::new(client.clone()), credentials.clone())
        .with_progress(progress_logger());
    match downloader.download(&request, options).await {
        Ok(DownloadOutcome::Completed(report)) => {
            info!(
                path = %report.local_path.display(),
                bytes = report.total_size,
                resumed_chunks = report.resumed_chunks,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "download complete"
            );
            Ok(())
        }
        Ok(DownloadOutcome::SkippedExisting { local_path }) => {
            warn!(path = %local_path.display(), "local file exists, pass --overwrite to replace it");
            Ok(())
        }
        Err(e) => Err(session_failure(e)),
    }
}

async fn upload(
    client: &PanClient,
    credentials: &Arc<CachedCredentials>,
    config: &Config,
    local: PathBuf,
    remote: &str,
    options: &UploadOptions,
) -> anyhow::Result<()> {
    anyhow::ensure!(
        !config.app_name.is_empty(),
        "uploads need app_name (or BAIDU_APPNAME) to be set"
    );
    let remote_path = app_scoped_path(&config.app_name, remote)?;
    let request = UploadRequest {
        local_path: local,
        remote_path,
    };
    let local = request.local_path.as_path();

    let uploader = Uploader::new(Arc::new(client.clone()), credentials.clone())
        .with_progress(progress_logger());
    let result = match uploader.upload(&request, options).await {
        // Blocks are already on the server; only the commit is retried.
        Err(SessionError::CommitFailed { plan, source }) => {
            warn!(error = %source, upload_id = %plan.upload_id, "commit failed, retrying once");
            let file = uploader.commit(&plan, &options.retry).await;
            if file.is_ok() {
                if let Err(e) = discard_checkpoint(local).await {
                    warn!(error = %e, "could not remove upload checkpoint");
                }
            }
            file.map(|file| (file, None))
        }
        other => other.map(|outcome| (outcome.file, Some(outcome.report))),
    };

    match result {
        Ok((file, report)) => {
            info!(
                path = %file.path,
                fs_id = file.fs_id,
                bytes = file.size,
                elapsed_ms = ?report.map(|r| r.elapsed.as_millis() as u64),
                "upload complete"
            );
            Ok(())
        }
        Err(e) => Err(session_failure(e)),
    }
}

async fn list(
    client: &PanClient,
    credentials: &Arc<CachedCredentials>,
    dir: &str,
) -> anyhow::Result<()> {
    let entries = authorized(credentials.as_ref(), |token| async move {
        client.list_dir(&token, dir).await.map_err(TransferError::from)
    })
    .await
    .with_context(|| format!("listing {dir}"))?;

    for entry in entries {
        let kind = if entry.is_dir() { "d" } else { "-" };
        println!("{kind} {:>14} {}", entry.size, entry.path);
    }
    Ok(())
}

fn session_failure(err: SessionError) -> anyhow::Error {
    if err.is_resumable() {
        anyhow::Error::new(err).context("transfer interrupted; run the same command again to resume")
    } else {
        anyhow::Error::new(err)
    }
}

/// Logs progress at every whole ten percent.
fn progress_logger() -> Arc<ProgressReporter> {
    let progress = Arc::new(ProgressReporter::new());
    let last_decile = AtomicU64::new(0);
    progress.on_progress(Box::new(move |p: TransferProgress| {
        let decile = (p.percent / 10.0).floor() as u64;
        if decile > last_decile.fetch_max(decile, Ordering::Relaxed) {
            info!(
                percent = %format!("{:.1}", p.percent),
                chunks = %format!("{}/{}", p.completed_chunks, p.total_chunks),
                speed_kib = (p.bytes_per_second / 1024.0) as u64,
                eta_secs = ?p.eta.map(|d| d.as_secs()),
                "progress"
            );
        }
    }));
    progress
}

/// Writes a refreshed token back to the config file.
async fn save_refreshed_grant(credentials: &CachedCredentials, initial: &TokenGrant, path: &Path) {
    let grant = credentials.current().await;
    if &grant == initial {
        return;
    }
    // Reload so environment overrides are not persisted.
    let mut stored = match Config::load(path) {
        Ok(stored) => stored,
        Err(e) => {
            warn!(error = %e, "could not reload configuration to store refreshed token");
            return;
        }
    };
    if !stored.update_grant(&grant) {
        return;
    }
    if let Err(e) = stored.save(path) {
        warn!(error = %e, "could not store refreshed token");
    }
}
