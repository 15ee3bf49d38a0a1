//! Daemon entry point: wires the pipeline, catalog, server, watchdog, and
//! persistence together, installs signal handlers, and runs the sensor
//! event loop until stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use signal_hook::consts::{SIGINT, SIGTERM, SIGUSR2};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use knd::config::{self, Config};
use knd::pipeline::{driver, FpsCounter, FrameBuffer, Pipeline, PipelineState};
use knd::save::Saver;
use knd::server::{Server, ServerContext};
use knd::watchdog::Watchdog;
use knd::zone::ZoneCatalog;
use knd::{lut, DEPTH_SIZE, VIDEO_SIZE};

// ---------------------------------------------------------------------------
// Logging and crash handling
// ---------------------------------------------------------------------------

fn init_tracing() {
    let filter = std::env::var("KND_LOG_LEVEL")
        .map(EnvFilter::new)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// A panic anywhere means the pipeline state can no longer be trusted; log
/// it and abort so the external supervisor restarts the daemon.
fn install_panic_hook() {
    let default = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!("Crashing due to panic: {info}");
        default(info);
        std::process::abort();
    }));
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() {
    let program = std::env::args().next().unwrap_or_else(|| "knd".into());
    if std::env::args().nth(1).as_deref() == Some("--help") {
        config::usage(&program);
        return;
    }

    init_tracing();
    install_panic_hook();

    if let Err(e) = run() {
        tracing::error!("{e:#}");
        std::process::exit(255);
    }
}

fn run() -> Result<()> {
    let config = Config::from_env();

    lut::init();

    let catalog = Arc::new(ZoneCatalog::new(2, 2));
    let pipeline_state = PipelineState::new();

    let saver = match &config.savedir {
        Some(dir) => {
            tracing::info!("Initializing zone persistence.");
            Some(
                Saver::init(
                    catalog.clone(),
                    pipeline_state.clone(),
                    dir,
                    config.save_interval,
                )
                .context("Error initializing zone saving")?,
            )
        }
        None => None,
    };

    // First TERM/INT stops the main loop; a second one (or any signal once
    // the stop flag is set, including the watchdog's escalation SIGTERM)
    // exits immediately.
    let stop = Arc::new(AtomicBool::new(false));
    for sig in [SIGTERM, SIGINT] {
        signal_hook::flag::register_conditional_shutdown(sig, 1, stop.clone())
            .context("Error setting termination signal handlers")?;
        signal_hook::flag::register(sig, stop.clone())
            .context("Error setting termination signal handlers")?;
    }
    signal_hook::flag::register(SIGUSR2, stop.clone())
        .context("Error setting watchdog signal handler")?;

    tracing::info!("Creating server.");
    let depth_buf = Arc::new(FrameBuffer::new(DEPTH_SIZE));
    let video_buf = Arc::new(FrameBuffer::new(VIDEO_SIZE));
    let fps = Arc::new(FpsCounter::new());
    let ctx = ServerContext {
        catalog: catalog.clone(),
        pipeline: pipeline_state.clone(),
        depth: depth_buf.clone(),
        video: video_buf.clone(),
        fps: fps.clone(),
    };
    let mut server = Server::create(ctx, config.port).context("Error creating server")?;

    tracing::info!("Creating watchdog.");
    let wd_stop = stop.clone();
    let watchdog = Watchdog::new(
        Duration::from_millis(255),
        config.init_timeout,
        Box::new(move |elapsed| {
            tracing::error!(
                "Timed out: at least {:.3}s since last update.",
                elapsed.as_secs_f64()
            );
            if !wd_stop.load(Ordering::Relaxed) {
                wd_stop.store(true, Ordering::Relaxed);
                let _ = signal_hook::low_level::raise(SIGUSR2);
            } else {
                let _ = signal_hook::low_level::raise(SIGTERM);
            }
        }),
    )
    .context("Error creating watchdog")?;

    tracing::info!("Starting video processing.");
    let (sensor, streams) =
        driver::open_synth(config.device).context("Error initializing video processing")?;

    let depth_hook = {
        let catalog = catalog.clone();
        let fps = fps.clone();
        let wd = watchdog.handle();
        let srv = server.handle();
        Box::new(move |buf: &[u8], _ts: u32| {
            wd.kick();
            catalog.update_depth(buf);
            fps.tick();
            // Tell the server to process subscriptions.
            srv.notify_depth();
        })
    };
    let video_hook = {
        let catalog = catalog.clone();
        let srv = server.handle();
        Box::new(move |buf: &[u8], _ts: u32| {
            catalog.update_video(buf);
            srv.notify_video();
        })
    };

    let mut pipeline = Pipeline::start(
        sensor,
        streams,
        pipeline_state.clone(),
        depth_buf,
        video_buf,
        depth_hook,
        video_hook,
    )
    .context("Error initializing video processing")?;

    if let Some(saver) = &saver {
        tracing::info!("Loading saved zones.");
        match saver.load() {
            Ok(n) => tracing::info!("Loaded {n} zone(s)."),
            Err(e) => tracing::error!("Error loading saved zones: {e}"),
        }
    }

    tracing::info!("Starting server.");
    server.run().context("Error starting server")?;

    watchdog.set_timeout(config.run_timeout);

    tracing::info!("Starting event processing.");
    while !stop.load(Ordering::Relaxed) {
        if let Err(e) = pipeline.do_events() {
            tracing::error!("Sensor event processing failed: {e}");
            break;
        }
    }

    tracing::info!("Stopping server.");
    server.stop();

    if let Some(saver) = saver {
        tracing::info!("Saving zones.");
        if let Err(e) = saver.save() {
            tracing::error!("Error saving zones: {e}");
        }
        saver.cleanup();
    }

    tracing::info!("Stopping video processing.");
    pipeline.stop();

    tracing::info!("Destroying watchdog.");
    watchdog.destroy();

    Ok(())
}
