//! chunk-drive binary.
//!
//! `serve` runs the chunk receiving server on top of a storage directory.
//! `upload` pushes local files to a running server through the upload
//! orchestrator and exits non-zero if any file fails.

use anyhow::{Context, bail};
use axum_server::Handle;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info, warn};

use chunk_drive::background::spawn_background_tasks;
use chunk_drive::config::{Cli, Command, ServeArgs, UploadArgs};
use chunk_drive::locking::LockManager;
use chunk_drive::logging;
use chunk_drive::server::build_router;
use chunk_drive::storage::Storage;
use chunk_drive::upload::UploadConfig;
use chunk_drive::{
    ChunkTransport, FileRef, HttpTransport, UploadEvent, UploadOrchestrator, UploadStatus,
};

/// Time left for background cancel notices before the process exits.
const CANCEL_NOTICE_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Upload(args) => upload(args).await,
    }
}

/// Starts the server and blocks until shutdown.
async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let storage = Arc::new(Storage::new(PathBuf::from(&args.storage_dir)));
    storage
        .ensure_root()
        .await
        .with_context(|| format!("cannot create storage dir {}", args.storage_dir))?;
    let upload_config = Arc::new(UploadConfig {
        max_total_size: args.upload_max_size,
        max_chunks: args.upload_max_chunks,
        max_concurrent: args.upload_max_concurrent,
        temp_ttl: Duration::from_secs(args.upload_temp_ttl_secs),
    });
    spawn_background_tasks(storage.clone(), upload_config.clone());

    let app = build_router(
        storage,
        upload_config,
        Arc::new(LockManager::new()),
        args.cors_origins.as_deref(),
    );

    let host = args
        .host
        .parse::<IpAddr>()
        .with_context(|| format!("invalid bind address {}", args.host))?;
    let addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    info!("🚀 Starting HTTP server at {}", addr);
    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    tokio::select! {
        result = server => result?,
        _ = shutdown_signal(handle) => {}
    }
    Ok(())
}

/// Uploads every file given on the command line as one batch.
async fn upload(args: UploadArgs) -> anyhow::Result<()> {
    let mut files = Vec::with_capacity(args.files.len());
    for path in &args.files {
        let file = FileRef::from_path(path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?;
        files.push(file);
    }

    let transport: Arc<dyn ChunkTransport> = Arc::new(HttpTransport::new(args.server.clone()));
    let orchestrator = UploadOrchestrator::new(args.orchestrator_config(), transport);
    let mut events = orchestrator
        .take_events()
        .context("upload events already taken")?;
    let reporter = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(&event);
        }
    });

    let tasks = orchestrator.enqueue_batch(files, args.directory.clone())?;
    info!(files = tasks.len(), server = args.server, "uploading");

    let interrupted = tokio::select! {
        _ = orchestrator.wait_idle() => false,
        _ = signal::ctrl_c() => {
            warn!("interrupt received, canceling uploads");
            orchestrator.cancel_all();
            orchestrator.wait_idle().await;
            tokio::time::sleep(CANCEL_NOTICE_GRACE).await;
            true
        }
    };
    reporter.abort();

    if interrupted {
        bail!("upload interrupted");
    }
    let failed: Vec<_> = orchestrator
        .list()
        .into_iter()
        .filter(|task| task.status != UploadStatus::Done)
        .collect();
    for task in &failed {
        error!(
            name = task.file_name,
            error = task.error.as_deref().unwrap_or("canceled"),
            "upload did not complete"
        );
    }
    if !failed.is_empty() {
        bail!("{} of {} uploads failed", failed.len(), tasks.len());
    }
    info!(files = tasks.len(), "all uploads complete");
    Ok(())
}

fn log_event(event: &UploadEvent) {
    match event {
        UploadEvent::Queued(task) => {
            debug!(upload_id = %task.id, name = task.file_name, chunks = task.total_chunks, "queued")
        }
        UploadEvent::Started { id } => info!(upload_id = %id, "started"),
        UploadEvent::Progress { id, percent } => debug!(upload_id = %id, percent, "progress"),
        UploadEvent::Completed(task) => {
            info!(upload_id = %task.id, name = task.file_name, size = task.file_size, "completed")
        }
        UploadEvent::Failed { id, message } => warn!(upload_id = %id, error = message, "failed"),
        UploadEvent::Canceled { id } => info!(upload_id = %id, "canceled"),
        UploadEvent::Removed { id } => debug!(upload_id = %id, "removed"),
    }
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
