use std::{
    io,
    net::Ipv4Addr,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use netlog::{
    config::Format,
    identity::{BackendError, IdentityDirectory, MemoryCache, Resolver, StaticDirectory},
    metrics::Metrics,
    pipeline::{Pipeline, PipelineOptions},
    sink::Sink,
};
use netlog_common::{Direction, Packet, TCP_PROTOCOL};
use tokio::{
    io::AsyncWrite,
    sync::{mpsc, watch},
    time,
};

#[derive(Clone, Default)]
struct SharedBuf(Arc<parking_lot::Mutex<Vec<u8>>>);

impl SharedBuf {
    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().clone()).unwrap()
    }
}

impl AsyncWrite for SharedBuf {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.0.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

struct CountingDirectory {
    inner: StaticDirectory,
    calls: AtomicUsize,
    stall: Option<Duration>,
}

#[async_trait]
impl IdentityDirectory for CountingDirectory {
    async fn find_by_ip(&self, ip: &str) -> Result<Option<String>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(stall) = self.stall {
            time::sleep(stall).await;
        }
        self.inner.find_by_ip(ip).await
    }
}

struct Harness {
    pipeline: Pipeline,
    metrics: Arc<Metrics>,
    directory: Arc<CountingDirectory>,
}

fn harness(opts: PipelineOptions) -> Harness {
    harness_with_stall(opts, None)
}

fn harness_with_stall(opts: PipelineOptions, stall: Option<Duration>) -> Harness {
    let directory = Arc::new(CountingDirectory {
        inner: StaticDirectory::from_entries([
            ("10.0.0.5", "billing-worker"),
            ("10.0.0.9", "shop-frontend"),
        ]),
        calls: AtomicUsize::new(0),
        stall,
    });
    let resolver = Resolver::new(Arc::new(MemoryCache::default()), directory.clone())
        .with_timeout(Duration::from_secs(5));
    let metrics = Arc::new(Metrics::new().unwrap());
    let pipeline = Pipeline::new(Arc::new(resolver), metrics.clone(), opts);
    Harness {
        pipeline,
        metrics,
        directory,
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
}

fn packet(src: [u8; 4], dst: [u8; 4], src_port: u16, offset_ms: i64, bytes: usize) -> Packet {
    Packet {
        timestamp: t0() + chrono::Duration::milliseconds(offset_ms),
        src: Ipv4Addr::from(src),
        dst: Ipv4Addr::from(dst),
        l3_protocol: TCP_PROTOCOL,
        src_port,
        dst_port: 443,
        byte_length: bytes,
    }
}

#[tokio::test(start_paused = true)]
async fn attributed_flows_reach_the_sink() {
    let h = harness(PipelineOptions::default());
    let (packet_tx, packet_rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    for p in [
        // outbound from a known workload
        packet([10, 0, 0, 5], [200, 1, 2, 3], 51000, 0, 1000),
        packet([10, 0, 0, 5], [200, 1, 2, 3], 51000, 1500, 500),
        // inbound to a known workload
        packet([8, 8, 4, 4], [10, 0, 0, 9], 53, 0, 200),
        packet([8, 8, 4, 4], [10, 0, 0, 9], 53, 1200, 200),
        // public but unknown on both ends
        packet([9, 9, 9, 9], [1, 1, 1, 1], 40000, 0, 100),
        packet([9, 9, 9, 9], [1, 1, 1, 1], 40000, 2000, 100),
        // private on both ends, never tracked
        packet([10, 0, 0, 1], [10, 0, 0, 2], 22, 0, 100),
        packet([10, 0, 0, 1], [10, 0, 0, 2], 22, 3000, 100),
    ] {
        packet_tx.send(p).await.unwrap();
    }

    let (records, running) = h.pipeline.start(packet_rx, shutdown_rx);
    let buf = SharedBuf::default();
    let sink = Sink::new(
        buf.clone(),
        Format::Text,
        h.metrics.clone(),
        100,
        Duration::from_millis(100),
    );
    let sink = tokio::spawn(sink.run(records));

    time::sleep(Duration::from_secs(3)).await;
    shutdown_tx.send(true).unwrap();
    running.join().await.unwrap();
    let written = sink.await.unwrap().unwrap();

    assert_eq!(written, 2);
    let out = buf.contents();
    assert!(out.contains(" billing worker 10.0.0.5 => 200.1.2.3 TCP 51000 1500 bytes (2 packets in 1.50s)"));
    assert!(out.contains(" shop frontend 8.8.4.4 => 10.0.0.9 TCP 53 400 bytes (2 packets in 1.20s)"));
    assert!(!out.contains("9.9.9.9"));
    assert!(!out.contains("10.0.0.1 "));

    assert_eq!(h.metrics.suppressed_records.get(), 1);
    assert_eq!(h.metrics.dropped_records.get(), 0);
    assert!(h.pipeline.table().is_empty());

    let exposition = h.metrics.render().unwrap();
    assert!(exposition.contains(r#"direction="outbound""#));
    assert!(exposition.contains(r#"direction="inbound""#));
}

#[tokio::test(start_paused = true)]
async fn full_emission_queue_drops_and_counts() {
    let h = harness(PipelineOptions {
        emit_queue_capacity: 1,
        ..PipelineOptions::default()
    });
    let (packet_tx, packet_rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    for port in [51000, 51001, 51002] {
        packet_tx
            .send(packet([10, 0, 0, 5], [200, 1, 2, 3], port, 0, 100))
            .await
            .unwrap();
        packet_tx
            .send(packet([10, 0, 0, 5], [200, 1, 2, 3], port, 1000, 100))
            .await
            .unwrap();
    }

    let (mut records, running) = h.pipeline.start(packet_rx, shutdown_rx);
    time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(h.metrics.dropped_records.get(), 2);
    let record = records.recv().await.unwrap();
    assert_eq!(record.namespace, "billing");
    assert_eq!(record.direction, Direction::Outbound);
    assert_eq!(record.packets, 2);

    shutdown_tx.send(true).unwrap();
    running.join().await.unwrap();
    assert!(records.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn idle_flows_are_reaped() {
    let h = harness(PipelineOptions::default());
    let (packet_tx, packet_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    packet_tx
        .send(packet([10, 0, 0, 5], [200, 1, 2, 3], 51000, 0, 100))
        .await
        .unwrap();
    let (mut records, running) = h.pipeline.start(packet_rx, shutdown_rx);

    time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.pipeline.table().len(), 1);

    time::sleep(Duration::from_secs(400)).await;
    assert!(h.pipeline.table().is_empty());
    assert_eq!(h.metrics.reaped_flows.get(), 1);
    assert_eq!(h.metrics.tracked_flows.get(), 0);

    shutdown_tx.send(true).unwrap();
    running.join().await.unwrap();
    assert!(records.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn identity_is_looked_up_once_per_address() {
    let h = harness(PipelineOptions::default());
    let (packet_tx, packet_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    for port in [51000, 51001, 51002] {
        packet_tx
            .send(packet([10, 0, 0, 5], [200, 1, 2, 3], port, 0, 100))
            .await
            .unwrap();
    }
    let (_records, running) = h.pipeline.start(packet_rx, shutdown_rx);
    time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.pipeline.table().len(), 3);
    assert_eq!(h.directory.calls.load(Ordering::SeqCst), 1);

    shutdown_tx.send(true).unwrap();
    running.join().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_every_task_within_a_tick() {
    let h = harness(PipelineOptions::default());
    let (_packet_tx, packet_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (mut records, running) = h.pipeline.start(packet_rx, shutdown_rx);
    time::sleep(Duration::from_millis(10)).await;
    shutdown_tx.send(true).unwrap();

    time::timeout(Duration::from_secs(1), running.join())
        .await
        .expect("pipeline did not stop")
        .unwrap();
    assert!(records.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn closed_packet_source_stops_ingest_only() {
    let h = harness(PipelineOptions::default());
    let (packet_tx, packet_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    packet_tx
        .send(packet([10, 0, 0, 5], [200, 1, 2, 3], 51000, 0, 100))
        .await
        .unwrap();
    packet_tx
        .send(packet([10, 0, 0, 5], [200, 1, 2, 3], 51000, 1000, 100))
        .await
        .unwrap();
    drop(packet_tx);

    let (mut records, running) = h.pipeline.start(packet_rx, shutdown_rx);
    let record = records.recv().await.unwrap();
    assert_eq!(record.total_bytes, 200);

    shutdown_tx.send(true).unwrap();
    running.join().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_abandons_a_pending_identity_lookup() {
    let h = harness_with_stall(PipelineOptions::default(), Some(Duration::from_secs(60)));
    let (packet_tx, packet_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    packet_tx
        .send(packet([9, 9, 9, 9], [1, 1, 1, 1], 40000, 0, 100))
        .await
        .unwrap();
    let (_records, running) = h.pipeline.start(packet_rx, shutdown_rx);

    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.directory.calls.load(Ordering::SeqCst), 1);
    let started = time::Instant::now();
    shutdown_tx.send(true).unwrap();

    time::timeout(Duration::from_secs(1), running.join())
        .await
        .expect("ingest stayed blocked on the directory")
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(h.pipeline.table().is_empty());
}

#[tokio::test(start_paused = true)]
async fn closed_sink_counts_every_matured_record_as_dropped() {
    let h = harness(PipelineOptions::default());
    let (packet_tx, packet_rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (records, running) = h.pipeline.start(packet_rx, shutdown_rx);
    drop(records);

    for (round, port) in (51000..51005).enumerate() {
        let at = round as i64 * 2000;
        packet_tx
            .send(packet([10, 0, 0, 5], [200, 1, 2, 3], port, at, 100))
            .await
            .unwrap();
        packet_tx
            .send(packet([10, 0, 0, 5], [200, 1, 2, 3], port, at + 1000, 100))
            .await
            .unwrap();
        time::sleep(Duration::from_millis(1500)).await;
    }
    time::sleep(Duration::from_secs(2)).await;

    assert!(h.pipeline.table().is_empty());
    assert_eq!(h.metrics.dropped_records.get(), 5);
    assert_eq!(h.metrics.suppressed_records.get(), 0);

    shutdown_tx.send(true).unwrap();
    running.join().await.unwrap();
}
