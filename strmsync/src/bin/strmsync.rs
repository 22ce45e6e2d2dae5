//! Main entry point for the strmsync executable.

use std::sync::Arc;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use strmsync::config::{ConfigFile, CONFIG_DIR_NAME, CONFIG_FILE_NAME, LOG_DIR_NAME};
use strmsync::fetch::ClientPool;
use strmsync::http::{self, ApiState};
use strmsync::mirror::MirrorEngine;
use strmsync::notify::Notifier;
use strmsync::scheduler::CronAdapter;
use strmsync::supervisor::TaskSupervisor;
use utils::http::endpoint;
use utils::logging::{self, LogFormat, Output};
use utils::signals;

#[derive(Parser)]
#[command(
    name = "strmsync",
    version = strmsync::VERSION,
    about = "Mirrors an Alist-style remote filesystem into local .strm locator files"
)]
struct Args {
    /// Base directory holding config/ and logs/
    #[arg(short = 'D', long, default_value = ".")]
    workdir: Utf8PathBuf,
    /// Log to stdout instead of the day-rotated log file
    #[arg(long)]
    log_stdout: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let workdir = args
        .workdir
        .canonicalize_utf8()
        .with_context(|| format!("Error opening workdir '{}'", args.workdir))?;

    let config_path = workdir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME);
    let config =
        ConfigFile::load(&config_path).context("Failed to load the configuration file")?;

    let log_dir = workdir.join(LOG_DIR_NAME);
    let output = if args.log_stdout {
        Output::Stdout
    } else {
        Output::DailyFile {
            dir: log_dir.clone(),
            prefix: config.settings.dev.then(|| "dev".to_owned()),
        }
    };
    let _log_guard = logging::init(LogFormat::Plain, output)?;
    logging::replace_panic_hook_with_tracing_panic_hook();

    info!("strmsync {} starting", strmsync::VERSION);
    debug!("DEV mode: {}", config.settings.dev);

    // A single cooperative event loop drives all I/O.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build the runtime")?;
    runtime.block_on(async_main(log_dir, config))
}

async fn async_main(log_dir: Utf8PathBuf, config: ConfigFile) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let pool = Arc::new(ClientPool::new(&format!(
        "{}/{}",
        strmsync::PRODUCT_NAME,
        strmsync::VERSION
    )));
    let notifier = Arc::new(Notifier::new(
        &config.settings.telegram_api_key,
        &config.settings.telegram_user_id,
    ));
    let supervisor = TaskSupervisor::new(
        config.sources.iter().cloned(),
        Box::new(MirrorEngine::new(pool.clone())),
        notifier,
        cancel.clone(),
    );
    let consumer = tokio::spawn(supervisor.clone().consumer_main());

    if config.sources.is_empty() {
        warn!("no sources configured, nothing will be synchronized");
    }
    let mut cron = CronAdapter::new().await?;
    cron.register_sources(&supervisor, &config.sources).await?;
    cron.start().await?;
    let cron = Arc::new(tokio::sync::Mutex::new(cron));

    let mut api_server = None;
    if config.settings.enable_api {
        let state = Arc::new(ApiState {
            supervisor: supervisor.clone(),
            cron: cron.clone(),
            settings: config.settings.clone(),
            log_dir,
            pool: pool.clone(),
            cancel: cancel.clone(),
        });
        let router = http::make_router(state);
        let addr = format!("{}:{}", config.settings.api_host, config.settings.api_port);
        let listener = std::net::TcpListener::bind(&addr)
            .with_context(|| format!("Failed to bind the control API to {addr}"))?;
        info!("control API listening on http://{addr}");
        api_server = Some(tokio::spawn(endpoint::serve(
            router,
            listener,
            cancel.clone(),
        )));
    }

    info!("strmsync startup complete");
    let signal = signals::shutdown_signal().await?;
    info!("{signal} received, shutting down");
    cancel.cancel();

    // Let the server drain and the in-flight run finish its current entries.
    if let Some(server) = api_server {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("control API terminated with an error: {e:#}"),
            Err(e) => error!("control API task panicked: {e}"),
        }
    }
    if let Err(e) = consumer.await {
        error!("task consumer panicked: {e}");
    }
    info!("strmsync exiting");
    Ok(())
}
