use std::{path::PathBuf, process, sync::Arc};

use anyhow::{Context, Result};
use log::{error, info, warn};
use structopt::StructOpt;
use tokio::{
    signal,
    sync::{mpsc, watch},
};

use netlog::{
    capture::{self, CaptureOptions, DEFAULT_POLL_INTERVAL},
    config::{Config, Format},
    identity::{MemoryCache, Resolver, StaticDirectory},
    metrics::{self, Metrics},
    pipeline::{Pipeline, PipelineOptions},
    sink::Sink,
};

#[derive(Debug, StructOpt)]
#[structopt(name = "netlog", about = "Attributes network flows to workloads and logs them")]
struct Opt {
    /// TOML configuration file
    #[structopt(short, long, parse(from_os_str))]
    config: Option<PathBuf>,
    /// Network interface to capture on
    #[structopt(short, long)]
    interface: Option<String>,
    /// Output format: text, json or csv
    #[structopt(short, long)]
    format: Option<Format>,
    /// Listen address for the Prometheus exporter
    #[structopt(short, long)]
    metrics_addr: Option<String>,
    /// Identity directory file of `<ipv4> <namespace>-<name>` lines
    #[structopt(short, long, parse(from_os_str))]
    directory: Option<PathBuf>,
}

impl Opt {
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_path(path)?,
            None => Config::default(),
        };
        if let Some(interface) = &self.interface {
            config.interface = interface.clone();
        }
        if let Some(format) = self.format {
            config.format = format;
        }
        if let Some(addr) = &self.metrics_addr {
            config.metrics_addr = addr.clone();
        }
        if let Some(directory) = &self.directory {
            config.directory_path = Some(directory.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    if let Err(err) = run(Opt::from_args()).await {
        error!("{err:#}");
        process::exit(1);
    }
}

async fn run(opt: Opt) -> Result<()> {
    let config = opt.load_config()?;
    let metrics_addr = config.metrics_socket_addr()?;

    let directory = StaticDirectory::from_option(config.directory_path.as_deref())?;
    info!("identity directory holds {} entries", directory.len());
    let resolver = Resolver::new(
        Arc::new(MemoryCache::new(config.identity_cache_ttl())),
        Arc::new(directory),
    )
    .with_timeout(config.lookup_timeout());

    let metrics = Arc::new(Metrics::new().context("failed to register metrics")?);
    let listener = metrics::bind(metrics_addr).await?;

    let datalink = capture::open(&CaptureOptions {
        interface: config.interface.clone(),
        read_buffer_size: config.read_buffer_size,
        poll_interval: DEFAULT_POLL_INTERVAL,
    })?;
    info!("capturing on {}", config.interface);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (packet_tx, packet_rx) = mpsc::channel(config.packet_queue_capacity);

    let mut capture = capture::spawn(datalink, packet_tx, shutdown_rx.clone());
    let exporter = tokio::spawn(metrics::serve(listener, metrics.clone(), shutdown_rx.clone()));

    let pipeline = Pipeline::new(
        Arc::new(resolver),
        metrics.clone(),
        PipelineOptions::from(&config),
    );
    let (records, running) = pipeline.start(packet_rx, shutdown_rx);
    let sink = Sink::new(
        tokio::io::stdout(),
        config.format,
        metrics,
        config.max_records_per_log,
        config.record_log_interval(),
    );
    let mut sink = tokio::spawn(sink.run(records));

    // A capture or sink that ends on its own takes the agent down with it.
    let mut capture_result = None;
    let mut sink_result = None;
    tokio::select! {
        res = wait_for_signal() => res?,
        res = &mut capture => {
            warn!("capture ended before shutdown");
            capture_result = Some(res);
        }
        res = &mut sink => {
            warn!("sink ended before shutdown");
            sink_result = Some(res);
        }
    }

    info!("shutting down");
    let _ = shutdown_tx.send(true);

    running.join().await?;
    let sink_result = match sink_result {
        Some(res) => res,
        None => sink.await,
    };
    let capture_result = match capture_result {
        Some(res) => res,
        None => capture.await,
    };
    exporter.await.context("metrics exporter panicked")??;

    let written = sink_result.context("sink task panicked")??;
    info!("{written} flow records written");
    capture_result.context("capture thread panicked")??;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use signal::unix::SignalKind;

    let mut terminate = signal::unix::signal(SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    tokio::select! {
        res = signal::ctrl_c() => res.context("failed to listen for ctrl-c")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    signal::ctrl_c().await.context("failed to listen for ctrl-c")
}
