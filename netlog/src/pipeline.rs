//! Task layout: one ingest task (the only writer that creates flows), a flush
//! scheduler and a stale reaper, each on its own timer, all sharing one
//! `FlowTable`. Matured records leave through a bounded queue; when the
//! queue is full or its reader is gone the record is dropped and counted
//! rather than stalling the scheduler.

use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use netlog_common::Packet;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

use crate::{
    classifier::classify,
    config::Config,
    identity::Resolver,
    metrics::Metrics,
    record::FlowRecord,
    table::FlowTable,
    window::FlushPolicy,
};

#[derive(Clone, Copy, Debug)]
pub struct PipelineOptions {
    pub flush_interval: Duration,
    pub reap_interval: Duration,
    pub idle_timeout: Duration,
    pub emit_queue_capacity: usize,
    pub metrics_retention: Duration,
    pub policy: FlushPolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for PipelineOptions {
    fn from(config: &Config) -> Self {
        Self {
            flush_interval: config.flush_interval(),
            reap_interval: config.reap_interval(),
            idle_timeout: config.idle_timeout(),
            emit_queue_capacity: config.emit_queue_capacity,
            metrics_retention: config.metrics_retention(),
            policy: FlushPolicy::default(),
        }
    }
}

pub struct Pipeline {
    table: Arc<FlowTable>,
    resolver: Arc<Resolver>,
    metrics: Arc<Metrics>,
    opts: PipelineOptions,
}

impl Pipeline {
    pub fn new(resolver: Arc<Resolver>, metrics: Arc<Metrics>, opts: PipelineOptions) -> Self {
        Self {
            table: Arc::new(FlowTable::new()),
            resolver,
            metrics,
            opts,
        }
    }

    pub fn table(&self) -> &Arc<FlowTable> {
        &self.table
    }

    /// Spawns the ingest, flush and reap tasks. The returned receiver yields
    /// matured, attributed records and closes once the tasks have stopped.
    pub fn start(
        &self,
        packets: mpsc::Receiver<Packet>,
        shutdown: watch::Receiver<bool>,
    ) -> (mpsc::Receiver<FlowRecord>, PipelineHandle) {
        let (records_tx, records_rx) = mpsc::channel(self.opts.emit_queue_capacity.max(1));

        let ingest = tokio::spawn(ingest_loop(
            self.table.clone(),
            self.resolver.clone(),
            packets,
            shutdown.clone(),
        ));
        let flush = tokio::spawn(flush_loop(
            self.table.clone(),
            self.metrics.clone(),
            records_tx,
            self.opts,
            shutdown.clone(),
        ));
        let reap = tokio::spawn(reap_loop(
            self.table.clone(),
            self.metrics.clone(),
            self.opts,
            shutdown,
        ));

        (
            records_rx,
            PipelineHandle {
                handles: vec![("ingest", ingest), ("flush", flush), ("reap", reap)],
            },
        )
    }
}

pub struct PipelineHandle {
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl PipelineHandle {
    pub async fn join(self) -> Result<()> {
        for (name, handle) in self.handles {
            handle
                .await
                .map_err(|err| anyhow!("{name} task panicked: {err}"))?;
        }
        Ok(())
    }
}

fn stopping(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

async fn ingest_loop(
    table: Arc<FlowTable>,
    resolver: Arc<Resolver>,
    mut packets: mpsc::Receiver<Packet>,
    mut shutdown: watch::Receiver<bool>,
) {
    while !stopping(&shutdown) {
        tokio::select! {
            _ = shutdown.changed() => break,
            packet = packets.recv() => match packet {
                Some(packet) => {
                    let Some(key) = classify(&packet) else { continue };
                    // A new key may wait on identity backends; shutdown
                    // abandons the lookup and the flow is never inserted.
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = table.upsert(key, &packet, &resolver) => {}
                    }
                }
                None => {
                    info!("packet source closed");
                    break;
                }
            },
        }
    }
    debug!("ingest task stopped");
}

async fn flush_loop(
    table: Arc<FlowTable>,
    metrics: Arc<Metrics>,
    records: mpsc::Sender<FlowRecord>,
    opts: PipelineOptions,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = time::interval(opts.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sink_gone = false;

    while !stopping(&shutdown) {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        let matured = table.drain_matured(&opts.policy);
        metrics.tracked_flows.set(table.len() as i64);
        if !emit(matured, &records, &metrics) && !sink_gone {
            warn!("flow record queue closed, matured records are now dropped");
            sink_gone = true;
        }
    }
    debug!("flush task stopped");
}

/// Queues attributed records. Records that cannot be queued are counted as
/// dropped. Returns `false` when the queue is closed.
fn emit(matured: Vec<FlowRecord>, records: &mpsc::Sender<FlowRecord>, metrics: &Metrics) -> bool {
    let mut full = 0u64;
    let mut closed = 0u64;
    for record in matured {
        if !record.is_attributed() {
            metrics.suppressed_records.inc();
            continue;
        }
        match records.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => full += 1,
            Err(mpsc::error::TrySendError::Closed(_)) => closed += 1,
        }
    }
    metrics.dropped_records.inc_by(full + closed);
    if full > 0 {
        warn!("flow record queue full, dropped {full} records");
    }
    if closed > 0 {
        debug!("flow record queue closed, dropped {closed} records");
    }
    closed == 0 && !records.is_closed()
}

async fn reap_loop(
    table: Arc<FlowTable>,
    metrics: Arc<Metrics>,
    opts: PipelineOptions,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = time::interval_at(
        time::Instant::now() + opts.reap_interval,
        opts.reap_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while !stopping(&shutdown) {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        let reaped = table.drain_stale(opts.idle_timeout);
        metrics.reaped_flows.inc_by(reaped as u64);
        metrics.tracked_flows.set(table.len() as i64);
        let retired = metrics.retire_idle(opts.metrics_retention);
        if reaped > 0 || retired > 0 {
            debug!("reaped {reaped} idle flows, retired {retired} metric series");
        }
    }
    debug!("reap task stopped");
}
