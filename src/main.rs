//! topic-archiver binary
//!
//! Reads one message per line from stdin, batches them, and archives each
//! batch as a gzip object. Configuration comes from `ARCHIVER_*` environment
//! variables, or from a TOML file given with `--config`.
//!
//! Exit status: 0 on clean shutdown, 1 on configuration errors, 2 on fatal
//! runtime errors (rejected uploads, durable log failures).

use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use topic_archiver::broker::LineSource;
use topic_archiver::object_store::DryRunObjectStore;
use topic_archiver::observability::{init_tracing, LogFormat};
use topic_archiver::{
    InMemoryObjectStore, LocalFsObjectStore, ObjectStore, Orchestrator, SinkConfig, SinkError,
    StoreType, SystemClock,
};
use tracing::{error, info, warn};

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

enum Command {
    Run { config_file: Option<PathBuf> },
    Version,
}

fn parse_args<I: Iterator<Item = String>>(mut args: I) -> Result<Command, SinkError> {
    let mut config_file = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => return Ok(Command::Version),
            "--config" | "-c" => {
                let path = args
                    .next()
                    .ok_or_else(|| SinkError::Config("--config needs a path".to_string()))?;
                config_file = Some(PathBuf::from(path));
            }
            other => {
                return Err(SinkError::Config(format!("unknown argument '{}'", other)));
            }
        }
    }
    Ok(Command::Run { config_file })
}

fn build_store(config: &SinkConfig) -> Result<Arc<dyn ObjectStore>, SinkError> {
    if config.dry_run {
        return Ok(Arc::new(DryRunObjectStore));
    }
    match config.store.store_type {
        StoreType::Memory => Ok(Arc::new(InMemoryObjectStore::new())),
        StoreType::LocalFs => Ok(Arc::new(LocalFsObjectStore::new(
            config.store.local_path.clone(),
        ))),
        #[cfg(feature = "remote")]
        StoreType::S3 | StoreType::Gcs => {
            let store = topic_archiver::remote_store::RemoteObjectStore::new(&config.store)
                .map_err(|e| SinkError::Config(e.to_string()))?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "remote"))]
        StoreType::S3 | StoreType::Gcs => Err(SinkError::Config(format!(
            "store type {:?} needs a build with the `remote` feature",
            config.store.store_type
        ))),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn run(config_file: Option<PathBuf>) -> Result<(), SinkError> {
    let config = match config_file {
        Some(path) => SinkConfig::from_toml_file(&path)?,
        None => SinkConfig::from_env()?,
    }
    .validate()?;
    config.log_summary();

    let store = build_store(&config)?;
    let orchestrator = Arc::new(Orchestrator::start(config, store, SystemClock).await?);
    let config = orchestrator.config().clone();

    let cancel = CancellationToken::new();
    let timer = orchestrator.spawn_flush_timer(config.check_interval, cancel.clone());

    let source = LineSource::new(
        BufReader::new(tokio::io::stdin()),
        config.dedup_key,
        usize::try_from(config.flush.max_in_flight).unwrap_or(usize::MAX),
    );
    let mut source_task = tokio::spawn(source.run(Arc::clone(&orchestrator), cancel.clone()));

    info!(topic = %config.topic, "Archiver running");

    let source_result = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            cancel.cancel();
            (&mut source_task).await
        }
        result = &mut source_task => result,
    };
    cancel.cancel();

    let mut fatal = None;
    match source_result {
        Ok(Ok(summary)) => info!(
            delivered = summary.delivered,
            acked = summary.acked,
            requeued = summary.requeued,
            "Input closed"
        ),
        Ok(Err(e)) => fatal = Some(e),
        Err(e) => error!(error = %e, "Input task panicked"),
    }

    match timer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            fatal.get_or_insert(e);
        }
        Err(e) => error!(error = %e, "Flush timer panicked"),
    }

    if let Some(e) = fatal {
        // Lines buffered after the failure still get one attempt
        if let Err(flush_err) = orchestrator.shutdown(config.shutdown_timeout).await {
            warn!(error = %flush_err, "Final flush after failure did not complete");
        }
        return Err(e);
    }

    if let Err(e) = orchestrator.shutdown(config.shutdown_timeout).await {
        warn!(error = %e, "Final flush failed");
        return Err(e);
    }

    let stats = orchestrator.stats();
    info!(
        received = stats.received,
        duplicates = stats.duplicates,
        flushes = stats.flushes,
        uploaded = stats.uploaded_messages,
        failed_uploads = stats.failed_uploads,
        "Archiver stopped"
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing(LogFormat::from_env());

    let command = match parse_args(std::env::args().skip(1)) {
        Ok(command) => command,
        Err(e) => {
            error!(error = %e, "Invalid arguments");
            std::process::exit(e.exit_code());
        }
    };

    match command {
        Command::Version => {
            println!("topic-archiver v{}", env!("CARGO_PKG_VERSION"));
        }
        Command::Run { config_file } => {
            if let Err(e) = run(config_file).await {
                error!(error = %e, fatal = e.is_fatal(), "Archiver failed");
                std::process::exit(e.exit_code());
            }
        }
    }
}
