// =============================================================================
// tickflow — Feed Daemon Entry Point
// =============================================================================
//
// Connects to the configured feed, keeps one ring series per symbol and runs
// the render tick, logging what each frame would draw.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use tickflow::pipeline::FeedPipeline;
use tickflow::protocol::encode_heartbeat;
use tickflow::render::FrameProducer;
use tickflow::runtime_config::RuntimeConfig;
use tickflow::worker::WorkerPool;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("tickflow starting");

    let config_path =
        std::env::var("TICKFLOW_CONFIG").unwrap_or_else(|_| "runtime_config.json".into());
    let mut config = RuntimeConfig::load_or_init(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });

    if let Ok(url) = std::env::var("TICKFLOW_FEED_URL") {
        config.feed.url = url;
    }
    if let Ok(syms) = std::env::var("TICKFLOW_SYMBOLS") {
        config.set_symbols_from_list(&syms);
    }
    if config.feed.symbols.is_empty() {
        anyhow::bail!("no symbols configured (set feed.symbols or TICKFLOW_SYMBOLS)");
    }

    info!(
        url = %config.feed.url,
        symbols = ?config.feed.symbols,
        compression = ?config.feed.compression,
        "Configured feed"
    );

    // ── 2. Worker pool ───────────────────────────────────────────────────
    let pool = Arc::new(WorkerPool::new(config.pool())?);
    let mut pool_events = pool.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = pool_events.recv().await {
            error!(event = ?event, "worker pool event");
        }
    });

    // ── 3. Feed pipeline ─────────────────────────────────────────────────
    let pipeline = Arc::new(FeedPipeline::new(config.pipeline(), config.transport())?);
    pipeline.start();

    let transport = pipeline.transport().clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            interval.tick().await;
            if transport.state() == tickflow::transport::ConnectionState::Open {
                transport.send(encode_heartbeat());
            }
        }
    });

    // ── 4. Render tick ───────────────────────────────────────────────────
    let producer = FrameProducer::new(pipeline.channel().clone(), pool.clone(), config.render());
    let tick_pipeline = pipeline.clone();
    let tick_interval = config.tick_interval();
    let render = tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick_interval);
        let mut last_sequence = vec![None; tick_pipeline.symbols().len()];
        loop {
            interval.tick().await;
            for (series, symbol) in tick_pipeline.symbols().iter().enumerate() {
                match producer.tick(series) {
                    Ok(Some(frame)) if last_sequence[series] != Some(frame.sequence) => {
                        last_sequence[series] = Some(frame.sequence);
                        debug!(
                            symbol = %symbol,
                            points = frame.point_count,
                            source = frame.source_count,
                            decimated = frame.decimated,
                            "frame ready"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!(symbol = %symbol, error = %e, "render tick failed"),
                }
            }
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    render.abort();
    pipeline.stop().await;

    let stats = pipeline.stats();
    info!(
        applied = stats.applied(),
        dropped = stats.dropped(),
        "tickflow shut down complete"
    );
    Ok(())
}
