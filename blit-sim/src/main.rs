//! blit-sim entry point.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::{mpsc, Mutex};
use tracing::info;
use tracing_subscriber::EnvFilter;

use blit_core::{ClientCapabilities, CodecRegistry, GlobalStats, WindowScheduler};
use blit_sim::config::SimConfig;
use blit_sim::workload::{drive, spawn_client, SimCapture, SimLink, Workload};

#[derive(Parser, Debug)]
#[command(
    name = "blit-sim",
    version,
    about = "Synthetic workload driver for the blit damage pipeline"
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "blit-sim.toml")]
    config: PathBuf,

    /// Print a default configuration file and exit
    #[arg(long)]
    gen_config: bool,

    /// Override the configured run duration (seconds)
    #[arg(short, long)]
    duration: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        print!("{}", toml::to_string_pretty(&SimConfig::default())?);
        return Ok(());
    }

    let mut config = SimConfig::load(&cli.config);
    if let Some(duration) = cli.duration {
        config.workload.duration_secs = duration;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("blit-sim {} starting", env!("CARGO_PKG_VERSION"));
    info!(
        width = config.window.width,
        height = config.window.height,
        duration_secs = config.workload.duration_secs,
        events_per_sec = config.workload.events_per_sec,
        bandwidth_bps = config.link.bandwidth_bps,
        "simulation parameters"
    );

    // The registry ships with the built-in rgb encoder only; that is
    // enough to move pixels and exercise every scheduling path.
    let registry = CodecRegistry::builder().build();
    let client = ClientCapabilities::default();
    let global = Arc::new(Mutex::new(GlobalStats::new()));

    let (delivered_tx, delivered_rx) = mpsc::unbounded_channel();
    let sink = Arc::new(SimLink::new(&config.link, delivered_tx));

    let (scheduler, handle) = WindowScheduler::new(
        config.to_scheduler_config(),
        Box::new(SimCapture::new(config.workload.seed)),
        registry,
        client,
        sink,
        global,
    );
    let scheduler_task = tokio::spawn(scheduler.run());
    let client_task = spawn_client(
        handle.clone(),
        delivered_rx,
        config.link.clone(),
        config.workload.seed ^ 0x9e37_79b9_7f4a_7c15,
    );

    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, finishing up");
            stop_flag.store(true, Ordering::SeqCst);
        }
    });

    let mut workload = Workload::new(config.window.width, config.window.height, &config.workload);
    let sent = drive(&handle, &mut workload, &config.workload, &stop).await?;

    // Let in-flight packets drain and the last acks land.
    let settle = 2 * (config.link.latency_ms + config.link.jitter_ms) + 500;
    info!(damage_events = sent, settle_ms = settle, "workload finished, draining");
    tokio::time::sleep(Duration::from_millis(settle)).await;

    let snapshot = handle.info().await?;
    info!(
        packets = snapshot.packet_count,
        sequence = snapshot.sequence,
        batch_delay = format_args!("{:.1}ms", snapshot.batch_delay),
        quality = snapshot.quality,
        speed = snapshot.speed,
        congestion = format_args!("{:.2}", snapshot.congestion_value),
        acks_pending = snapshot.acks_pending,
        refresh_pixels = snapshot.refresh_pixels,
        "pipeline summary"
    );
    let mut totals: Vec<_> = snapshot.encoding_totals.iter().collect();
    totals.sort_by(|a, b| b.1 .1.cmp(&a.1 .1));
    for (encoding, (packets, bytes)) in totals {
        info!(%encoding, packets, bytes, "encoding totals");
    }

    handle.stop().await;
    let _ = scheduler_task.await;
    client_task.abort();
    info!("blit-sim done");
    Ok(())
}
