//! Argus demo rig: simulated cameras feeding the extraction pipeline

use std::sync::Arc;
use std::time::Duration;

use argus::sim::{ScriptedEngine, ScriptedSource};
use argus::{CameraId, Config, FrameSource, Pipeline, SyncOutcome};
use color_eyre::Result;
use tracing::{debug, info, warn};

fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("argus=debug"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_timer(fmt::time::uptime()));

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

/// Pull synchronized sets until the pipeline stops.
fn consume(pipeline: &Pipeline) -> u64 {
    let tolerance = pipeline.config().pipeline.sync_tolerance();
    let mut sets = 0u64;

    loop {
        match pipeline.pull_synchronized(tolerance, Duration::from_millis(500)) {
            Ok(SyncOutcome::Complete(set)) => {
                sets += 1;
                if sets % 30 == 0 {
                    let keypoints: usize = set.results.iter().map(|r| r.keypoints.len()).sum();
                    info!(
                        sets,
                        reference_ms = set.reference.as_millis() as u64,
                        spread_ms = set.spread().as_millis() as u64,
                        keypoints,
                        "Synchronized set"
                    );
                }
            }
            Ok(SyncOutcome::Partial(partial)) => {
                debug!(missing = ?partial.missing(), "Partial set");
            }
            Ok(SyncOutcome::TimedOut) => warn!("No results within 500ms"),
            Ok(SyncOutcome::Stopped) => break,
            Err(e) => {
                warn!("Synchronized pull failed: {}", e);
                break;
            }
        }
    }
    sets
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    info!("Argus launching...");

    // Optional config file, then optional run time in seconds
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };
    let run_for = args
        .next()
        .map(|secs| secs.parse::<u64>())
        .transpose()?
        .map(Duration::from_secs);

    // Simulated rig, each camera 5ms behind the previous one
    let sources: Vec<Box<dyn FrameSource>> = config
        .cameras
        .iter()
        .enumerate()
        .map(|(index, camera)| {
            let period = Duration::from_secs(1) / camera.fps.max(1);
            let source = ScriptedSource::periodic(period)
                .starting_at(Duration::from_millis(5 * index as u64))
                .with_pacing(period);
            Box::new(source) as Box<dyn FrameSource>
        })
        .collect();
    let cameras = config.cameras.len();

    let engine = Arc::new(ScriptedEngine::new().with_latency(Duration::from_millis(8)));
    let pipeline = Arc::new(Pipeline::new(config, engine));
    pipeline.initialize(sources)?;

    pipeline.register_callback(|result| {
        if let Some(message) = result.error_message() {
            warn!(camera = %result.camera, frame_id = result.frame_id, "Extraction failed: {}", message);
        }
    })?;

    pipeline.start()?;

    let consumer = {
        let pipeline = pipeline.clone();
        tokio::task::spawn_blocking(move || consume(&pipeline))
    };

    match run_for {
        Some(limit) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = tokio::time::sleep(limit) => {}
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }

    info!("Argus shutting down");
    pipeline.stop();
    let sets = consumer.await?;

    for index in 0..cameras {
        let camera = CameraId(index as u16);
        if let Some(stats) = pipeline.stats(camera) {
            info!(
                %camera,
                captured = stats.captured,
                extracted = stats.extracted,
                failed = stats.failed,
                dropped = stats.dropped(),
                fps = stats.frame_rate,
                "Camera summary"
            );
        }
    }
    info!(sets, "Argus stopped");
    Ok(())
}
