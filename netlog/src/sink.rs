use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use csv_async::AsyncSerializer;
use futures::StreamExt;
use futures_batch::ChunksTimeout;
use log::{debug, info};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tokio_stream::wrappers::ReceiverStream;

use crate::{config::Format, metrics::Metrics, record::FlowRecord};

enum Output<W: AsyncWrite + Unpin + Send> {
    Text(W),
    Json(W),
    Csv(AsyncSerializer<W>),
}

/// Final stop for matured flows: writes them out and feeds the flow metrics.
pub struct Sink<W: AsyncWrite + Unpin + Send> {
    output: Output<W>,
    metrics: Arc<Metrics>,
    max_records_per_log: usize,
    record_log_interval: Duration,
    written: u64,
}

impl<W: AsyncWrite + Unpin + Send> Sink<W> {
    pub fn new(
        writer: W,
        format: Format,
        metrics: Arc<Metrics>,
        max_records_per_log: usize,
        record_log_interval: Duration,
    ) -> Self {
        let output = match format {
            Format::Text => Output::Text(writer),
            Format::Json => Output::Json(writer),
            Format::Csv => Output::Csv(AsyncSerializer::from_writer(writer)),
        };
        Self {
            output,
            metrics,
            max_records_per_log: max_records_per_log.max(1),
            record_log_interval,
            written: 0,
        }
    }

    /// Drains `records` until every sender is gone.
    pub async fn run(mut self, records: mpsc::Receiver<FlowRecord>) -> Result<u64> {
        let batches = ChunksTimeout::new(
            ReceiverStream::new(records),
            self.max_records_per_log,
            self.record_log_interval,
        );
        futures::pin_mut!(batches);

        while let Some(batch) = batches.next().await {
            self.write_batch(&batch).await?;
        }
        info!("sink closed after writing {} flow records", self.written);
        Ok(self.written)
    }

    async fn write_batch(&mut self, batch: &[FlowRecord]) -> Result<()> {
        for record in batch.iter().filter(|record| record.is_attributed()) {
            self.write_record(record).await?;
            self.metrics.observe(record);
            self.written += 1;
        }
        self.flush().await?;
        debug!("wrote batch of {} flow records", batch.len());
        Ok(())
    }

    async fn write_record(&mut self, record: &FlowRecord) -> Result<()> {
        match &mut self.output {
            Output::Text(writer) => {
                let line = format!("{record}\n");
                writer
                    .write_all(line.as_bytes())
                    .await
                    .context("failed to write flow record")?;
            }
            Output::Json(writer) => {
                let mut line = serde_json::to_string(&record.structured())
                    .context("failed to encode flow record")?;
                line.push('\n');
                writer
                    .write_all(line.as_bytes())
                    .await
                    .context("failed to write flow record")?;
            }
            Output::Csv(serializer) => {
                serializer
                    .serialize(record.structured())
                    .await
                    .context("failed to write flow record")?;
            }
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        let flushed = match &mut self.output {
            Output::Text(writer) | Output::Json(writer) => writer.flush().await,
            Output::Csv(serializer) => serializer.flush().await,
        };
        flushed.context("failed to flush flow records")
    }
}
