use anyhow::Context;
use podtraced::tracer::{ProbeSet, Tracer};
use podtraced::{Config, alerts, logger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logger::init()?;
    println!("[podtraced] starting tracer daemon...");

    let config = Config::load();

    // The probe loader hands a live ProbeSet to Tracer::new when podtraced
    // is embedded; the standalone binary runs in userspace-only mode, same
    // as running without kernel instrumentation available.
    log::info!("no probe loader linked; running userspace-only");
    let probes = ProbeSet::disabled();

    let mut tracer = Tracer::new(
        &config,
        probes,
        Box::new(|path| {
            log::info!(
                "critical path pid={} total={}ns segments={}",
                path.pid,
                path.total_latency_ns,
                path.segments.len()
            );
        }),
    )
    .context("tracer bootstrap")?;

    alerts::init_global(tracer.pipeline());

    // Drain the output queue; the export path plugs in here.
    let mut events = tracer.take_events().context("event queue already taken")?;
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log::debug!(
                "event kind={} pid={} comm={} latency_ns={}",
                event.kind.name(),
                event.pid,
                event.process_name,
                event.latency_ns
            );
        }
    });

    tracer.start();
    println!("[podtraced] running. Press Ctrl+C to exit.");

    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => println!("[podtraced] interrupt received, shutting down..."),
        _ = sigterm.recv() => println!("[podtraced] SIGTERM received, shutting down..."),
    }

    tracer.shutdown().await;
    Ok(())
}
