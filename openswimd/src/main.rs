//! openswimd - keeps the Open Swim media library and the headphone in step.
//!
//! Requests arrive as JSON lines on stdin. Progress events and lookup
//! answers leave as JSON lines on stdout, and logs go to stderr and a
//! rotating file.

mod ingest;
mod logging;

use std::process::ExitCode;
use std::sync::Arc;

use openswim_core::{
    AppConfig, ChannelProgressReporter, DeviceManager, DevicePresence, DeviceWatcher,
    ExternalMediaTools, FullSyncPass, LibraryStore, MediaTools, Result, SyncOrchestrator,
    SystemCommandRunner, lookup_playlist, validate_library_directory,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::ingest::{Command, Outbound};

/// What request handling needs from the daemon.
struct Handlers {
    orchestrator: SyncOrchestrator,
    store: LibraryStore,
    tools: Arc<dyn MediaTools>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let logging = match logging::init(&logging::LoggingConfig::auto()) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("openswimd: logging disabled: {e}");
            None
        }
    };

    info!("Starting openswimd {}", env!("CARGO_PKG_VERSION"));
    match run().await {
        Ok(Shutdown::EndOfInput) => {
            info!("openswimd stopped");
            ExitCode::SUCCESS
        }
        Ok(Shutdown::Interrupted) => {
            info!("openswimd interrupted");
            drop(logging);
            // A pending blocking read on stdin would keep the runtime alive
            std::process::exit(130);
        }
        Err(e) => {
            error!("openswimd failed ({}): {}", e.kind(), e);
            ExitCode::FAILURE
        }
    }
}

/// How the request loop ended.
enum Shutdown {
    EndOfInput,
    Interrupted,
}

async fn run() -> Result<Shutdown> {
    let mut config = AppConfig::load()?;
    config.apply_env_overrides()?;
    validate_library_directory(&config.library_path)?;
    info!("Library: {}", config.library_path.display());

    let runner = Arc::new(SystemCommandRunner::from_current()?);
    let tools: Arc<dyn MediaTools> = Arc::new(ExternalMediaTools::new(
        runner,
        config.tools.clone(),
        config.pipeline.clone(),
    ));
    let (reporter, mut progress_rx) = ChannelProgressReporter::new();
    let presence = DevicePresence::new();

    let pass = FullSyncPass::new(
        &config,
        Arc::clone(&tools),
        Arc::new(reporter),
        Arc::new(presence.clone()),
    );
    let store = pass.store().clone();
    let (orchestrator, worker) = SyncOrchestrator::new(Arc::new(pass));
    let worker_task = tokio::spawn(worker.run());

    // Single stdout writer, one envelope per line
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
    let output_task = tokio::spawn(async move {
        while let Some(line) = outbound_rx.recv().await {
            match serde_json::to_string(&line) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!("Could not encode output line: {}", e),
            }
        }
    });
    let progress_task = {
        let outbound = outbound.clone();
        tokio::spawn(async move {
            while let Some(event) = progress_rx.recv().await {
                if outbound.send(Outbound::Progress(event)).is_err() {
                    break;
                }
            }
        })
    };

    let detector = Box::new(DeviceManager::new(config.device.clone()));
    let (mut device_rx, watcher) = DeviceWatcher::new(detector)
        .with_interval(config.device.poll_interval())
        .start();
    let device_task = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            while let Some(event) = device_rx.recv().await {
                if presence.apply(&event) {
                    orchestrator.enqueue_full_sync();
                }
            }
            debug!("Device event loop ended");
        })
    };

    orchestrator.enqueue_full_sync();

    let handlers = Handlers {
        orchestrator,
        store,
        tools,
        outbound,
    };
    let shutdown = read_requests(&handlers).await;

    watcher.stop().await;
    if let Err(e) = device_task.await {
        warn!("Device event loop ended abnormally: {}", e);
    }
    drop(handlers);

    match &shutdown {
        Shutdown::EndOfInput => {
            info!("Input closed, finishing queued jobs");
            match worker_task.await {
                Ok(stats) => info!(
                    "Worker finished: {} jobs succeeded, {} failed",
                    stats.succeeded, stats.failed
                ),
                Err(e) => warn!("Worker ended abnormally: {}", e),
            }
            if let Err(e) = progress_task.await {
                warn!("Progress forwarder ended abnormally: {}", e);
            }
            if let Err(e) = output_task.await {
                warn!("Output writer ended abnormally: {}", e);
            }
        }
        Shutdown::Interrupted => {
            info!("Interrupted, dropping queued jobs");
            worker_task.abort();
            progress_task.abort();
            output_task.abort();
        }
    }
    Ok(shutdown)
}

/// Read request lines until stdin closes or Ctrl-C arrives.
async fn read_requests(handlers: &Handlers) -> Shutdown {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => match ingest::parse_line(&line) {
                    Ok(Some(command)) => dispatch(handlers, command),
                    Ok(None) => {}
                    Err(e) => warn!("Ignoring request line: {}", e),
                },
                Ok(None) => return Shutdown::EndOfInput,
                Err(e) => {
                    error!("Could not read stdin: {}", e);
                    return Shutdown::EndOfInput;
                }
            },
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("Could not listen for Ctrl-C: {}", e);
                }
                return Shutdown::Interrupted;
            }
        }
    }
}

/// Queue the persistence of new desired state, then a pass.
///
/// Playlist lookups bypass the queue and answer on stdout.
fn dispatch(handlers: &Handlers, command: Command) {
    info!("Received {} request", command.label());
    let Handlers {
        orchestrator,
        store,
        tools,
        outbound,
    } = handlers;
    match command {
        Command::Episodes(requests) => {
            let store = store.clone();
            info!("{} episodes requested", requests.len());
            orchestrator.enqueue(
                "store episode requests",
                Box::new(move || store.save_episode_requests(&requests)),
            );
        }
        Command::Playlists(requests) => {
            let store = store.clone();
            info!("{} playlists requested", requests.len());
            orchestrator.enqueue(
                "store playlist requests",
                Box::new(move || store.save_playlist_requests(&requests)),
            );
        }
        Command::Sync => {}
        Command::PlaylistInfo(input) => {
            let tools = Arc::clone(tools);
            let outbound = outbound.clone();
            tokio::task::spawn_blocking(move || {
                let response = lookup_playlist(tools.as_ref(), &input);
                if outbound.send(Outbound::PlaylistInfo(response)).is_err() {
                    debug!("Output closed before playlist lookup finished");
                }
            });
            return;
        }
    }
    orchestrator.enqueue_full_sync();
}
