//! Hermes video relay with MJPEG preview

use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tokio::net::TcpListener;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hermes::bus::{discover, select_source, LoopbackBus, VideoBus};
use hermes::ingest::{gradient, Ingest, IngestError, IngestStats, StillImageDecoder};
use hermes::preview::PreviewCache;
use hermes::relay::Relay;
use hermes::server::PreviewServer;
use hermes::status::StatusReporter;
use hermes::{Config, IngestConfig};

/// Name of a long-running loop and how it ended
type Exit = (&'static str, Result<()>);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("hermes=debug"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Hermes Launching...");

    // Load configuration
    let config_file = std::env::args().nth(1);
    let config = Config::load(config_file.as_deref())?;
    hermes::CONFIG.store(Arc::new(config.clone()));

    let shutdown = CancellationToken::new();
    let mut tasks: JoinSet<Exit> = JoinSet::new();
    let bus = LoopbackBus::new(config.ingest.host.clone(), config.ingest.queue_depth);
    info!(version = %bus.version(), "Video bus ready");

    // Publish the input source
    let ingest_stats = if config.ingest.enabled {
        Some(start_ingest(&bus, &config.ingest, &mut tasks, shutdown.clone())?)
    } else {
        None
    };

    // Find the source to relay
    let finder = bus.finder(true)?;
    let wait = Duration::from_millis(config.relay.discovery_wait_ms);
    let attempts = config.relay.discovery_attempts;
    let sources = tokio::task::spawn_blocking(move || discover(&finder, wait, attempts))
        .await??;
    let wanted = config.relay.input.as_deref();
    let input = select_source(&sources, wanted)?.clone();
    info!(source = %input.name, address = %input.address, "Using input source");

    let receiver = bus.connect(&input, &config.relay.receiver_settings())?;
    let output = Arc::new(bus.create_sender(
        &config.relay.output,
        config.relay.clock_video,
        config.relay.clock_audio,
    )?);

    let cache = Arc::new(PreviewCache::new());
    cache.reset(&config.relay.output);

    let mut relay = Relay::new(
        receiver,
        Arc::clone(&output),
        Arc::clone(&cache),
        &config.relay,
    )
    .convert_formats(config.preview.convert_formats);
    let relay_stats = relay.stats();
    {
        let shutdown = shutdown.clone();
        tasks.spawn_blocking(move || {
            relay.run(&shutdown);
            ("relay", Ok(()))
        });
    }

    // Preview server
    let server = PreviewServer::new(Arc::clone(&cache), config.preview.quality, shutdown.clone());
    let listener = TcpListener::bind(&config.server.bind).await?;
    {
        let server = server.clone();
        tasks.spawn(async move {
            let result = server.serve(listener).await;
            ("preview server", result.map_err(color_eyre::Report::from))
        });
    }

    // Status loop
    let mut reporter = StatusReporter::new(bus.version(), input, sources, output, relay_stats)
        .with_preview(server);
    if let Some(stats) = ingest_stats {
        reporter = reporter.with_ingest(stats);
    }
    let interval = Duration::from_millis(config.status.interval_ms);
    let status = Arc::new(reporter).run(interval, shutdown.clone());
    tasks.spawn(async move {
        status.await;
        ("status", Ok(()))
    });

    // Every loop runs until shutdown, so any exit before Ctrl-C stops the process
    let early = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown requested");
            None
        }
        Some(joined) = tasks.join_next() => Some(log_exit(joined)),
    };
    if let Some(task) = early {
        warn!(task, "Loop exited before shutdown, stopping");
    }
    shutdown.cancel();

    while let Some(joined) = tasks.join_next().await {
        log_exit(joined);
    }

    info!("Hermes shutting down");
    match early {
        Some(task) => Err(eyre!("{task} exited before shutdown")),
        None => Ok(()),
    }
}

fn log_exit(joined: std::result::Result<Exit, JoinError>) -> &'static str {
    match joined {
        Ok((task, Ok(()))) => {
            info!(task, "Loop stopped");
            task
        }
        Ok((task, Err(e))) => {
            error!(task, error = %e, "Loop failed");
            task
        }
        Err(e) => {
            error!(error = %e, "Loop panicked");
            "unknown"
        }
    }
}

/// Publish the configured still image (or a gradient) as a clocked source
fn start_ingest(
    bus: &LoopbackBus,
    config: &IngestConfig,
    tasks: &mut JoinSet<Exit>,
    shutdown: CancellationToken,
) -> Result<Arc<IngestStats>> {
    let decoder = StillImageDecoder::new(config.fps, config.frames)
        .with_image(gradient(config.width, config.height))
        .with_audio(config.sample_rate, config.channels);
    let sender = Arc::new(bus.create_sender(&config.source_name, true, true)?);

    let ingest = Ingest::new(Arc::new(decoder), sender, config.path.as_str());
    let (video, audio) = ingest.spawn(shutdown);
    tasks.spawn(async move { ("ingest video", join_ingest(video).await) });
    tasks.spawn(async move { ("ingest audio", join_ingest(audio).await) });
    info!(source = %config.source_name, path = %config.path, fps = config.fps, "Ingest started");

    Ok(ingest.stats())
}

async fn join_ingest(handle: JoinHandle<std::result::Result<(), IngestError>>) -> Result<()> {
    let result = handle
        .await
        .unwrap_or_else(|e| Err(IngestError::Join(e.to_string())));
    Ok(result?)
}
