use futures::{Stream, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use logrelay_types::{ConfigError, PipelineConfig, RawLine, StructuredRecord};

use crate::engine::MultilineEngine;
use crate::sink::{RecordSink, SinkError};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("sink delivery failed: {0}")]
    Sink(#[from] SinkError),
}

/// Counters for one run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    pub lines: u64,
    pub records: u64,
    /// Records whose extract pattern did not match or whose time did not parse
    pub degraded: u64,
    /// Orphan lines dropped by policy
    pub discarded: u64,
}

/// Drives a [`MultilineEngine`] from a line stream into a sink
///
/// Lines, the open record's inactivity deadline and shutdown all compete in
/// one `select!`, so the buffer is only ever touched from this task.
pub struct PipelineRunner<S> {
    engine: MultilineEngine,
    sink: S,
    cancel: CancellationToken,
    stats: RunStats,
}

impl<S: RecordSink> PipelineRunner<S> {
    pub fn new(config: &PipelineConfig, sink: S) -> Result<Self, PipelineError> {
        Ok(Self {
            engine: MultilineEngine::new(config)?,
            sink,
            cancel: CancellationToken::new(),
            stats: RunStats::default(),
        })
    }

    /// Stop when this token is cancelled, after flushing the open record
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Consume `lines` until the stream ends or the runner is cancelled
    pub async fn run<L>(mut self, mut lines: L) -> Result<(RunStats, S), PipelineError>
    where
        L: Stream<Item = String> + Unpin,
    {
        let flush_every = self.sink.flush_interval().filter(|d| !d.is_zero());
        let mut flush_tick = tokio::time::interval(flush_every.unwrap_or(Duration::from_secs(3600)));
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        flush_tick.tick().await;

        loop {
            let deadline = self.engine.deadline();
            let wake_at = deadline
                .map(Instant::from_std)
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    info!("Shutdown requested, flushing open record");
                    break;
                }

                _ = tokio::time::sleep_until(wake_at), if deadline.is_some() => {
                    if let Some(record) = self.engine.expire(Instant::now().into_std()) {
                        self.deliver(record).await?;
                    }
                }

                next = lines.next() => match next {
                    Some(text) => {
                        self.stats.lines += 1;
                        let line = RawLine::at(text, Instant::now().into_std());
                        for record in self.engine.push(line) {
                            self.deliver(record).await?;
                        }
                    }
                    None => {
                        debug!("Line stream ended");
                        break;
                    }
                },

                _ = flush_tick.tick(), if flush_every.is_some() => {
                    self.sink.flush().await?;
                }
            }
        }

        if let Some(record) = self.engine.flush() {
            self.deliver(record).await?;
        }
        self.sink.flush().await?;

        self.stats.discarded = self.engine.discarded();
        info!(
            lines = self.stats.lines,
            records = self.stats.records,
            degraded = self.stats.degraded,
            "Pipeline finished"
        );
        Ok((self.stats, self.sink))
    }

    async fn deliver(&mut self, record: StructuredRecord) -> Result<(), PipelineError> {
        self.stats.records += 1;
        if record.is_degraded() {
            self.stats.degraded += 1;
        }
        self.sink.send(record).await?;
        Ok(())
    }
}

/// Adapt a buffered reader into a stream of lines, ending at EOF or on a read error
///
/// Bytes that are not valid UTF-8 are replaced rather than ending the stream.
pub fn line_stream<R>(reader: R) -> impl Stream<Item = String> + Unpin
where
    R: AsyncBufRead + Unpin,
{
    Box::pin(futures::stream::unfold(reader, |mut reader| async move {
        let mut buf = Vec::new();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => None,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                Some((String::from_utf8_lossy(&buf).into_owned(), reader))
            }
            Err(e) => {
                warn!(error = %e, "Failed to read line, closing stream");
                None
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::ChannelSink;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    fn config() -> PipelineConfig {
        PipelineConfig {
            start_pattern: r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}".to_string(),
            max_wait_time: Duration::from_secs(3),
            extract_pattern: r"(?s)^(?P<time>\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}) (?P<message>.*)$"
                .to_string(),
            ..Default::default()
        }
    }

    fn channel_runner() -> (PipelineRunner<ChannelSink>, mpsc::UnboundedReceiver<StructuredRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let runner = PipelineRunner::new(&config(), ChannelSink::new(tx)).unwrap();
        (runner, rx)
    }

    /// Turn an mpsc receiver into the runner's line stream
    fn receiver_stream(rx: mpsc::UnboundedReceiver<String>) -> impl Stream<Item = String> + Unpin {
        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|line| (line, rx))
        }))
    }

    #[tokio::test]
    async fn test_reader_to_records() {
        let input = "2024-01-01 10:00:00 start\n  continuation\n2024-01-01 10:00:01 next\n";
        let (runner, mut rx) = channel_runner();

        let (stats, _) = runner.run(line_stream(input.as_bytes())).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.message, "start\n  continuation");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.message, "next");
        assert_eq!(
            stats,
            RunStats {
                lines: 3,
                records: 2,
                degraded: 0,
                discarded: 0
            }
        );
    }

    #[tokio::test]
    async fn test_unmatched_stream_yields_degraded_record() {
        let (runner, mut rx) = channel_runner();
        let (stats, _) = runner.run(line_stream("no header\nat all\n".as_bytes())).await.unwrap();

        let record = rx.recv().await.unwrap();
        assert_eq!(record.time, None);
        assert_eq!(record.message, "no header\nat all");
        assert_eq!(stats.degraded, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_does_not_end_stream() {
        let input: &[u8] =
            b"2024-01-01 10:00:00 a\n\xff\xfe bad\r\n2024-01-01 10:00:01 b\n2024-01-01 10:00:02 c\n";
        let (runner, mut rx) = channel_runner();

        let (stats, _) = runner.run(line_stream(input)).await.unwrap();

        assert_eq!(stats.lines, 4);
        assert_eq!(stats.records, 3);
        assert_eq!(rx.recv().await.unwrap().message, "a\n\u{fffd}\u{fffd} bad");
        assert_eq!(rx.recv().await.unwrap().message, "b");
        assert_eq!(rx.recv().await.unwrap().message, "c");
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_timeout_flushes_without_new_lines() {
        let (runner, mut records) = channel_runner();
        let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();
        let task = tokio::spawn(runner.run(receiver_stream(line_rx)));

        line_tx.send("2024-01-01 10:00:00 waiting".to_string()).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        line_tx.send("  still going".to_string()).unwrap();

        // Nothing yet: the deadline moved to 1s + 3s
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(records.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(1)).await;
        let record = records.try_recv().unwrap();
        assert_eq!(record.message, "waiting\n  still going");

        drop(line_tx);
        let (stats, _) = task.await.unwrap().unwrap();
        assert_eq!(stats.records, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_flushes_open_record() {
        let (runner, mut records) = channel_runner();
        let cancel = CancellationToken::new();
        let runner = runner.with_cancellation(cancel.clone());
        let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();
        let task = tokio::spawn(runner.run(receiver_stream(line_rx)));

        line_tx.send("2024-01-01 10:00:00 partial".to_string()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let (stats, _) = task.await.unwrap().unwrap();
        assert_eq!(stats.records, 1);
        assert_eq!(records.recv().await.unwrap().message, "partial");
        // The line sender is still open; the runner did not wait on it
        drop(line_tx);
    }

    /// Counts flushes; asks to be flushed every second
    struct BatchingSink {
        flushes: Arc<AtomicU32>,
    }

    #[async_trait]
    impl RecordSink for BatchingSink {
        async fn send(&mut self, _record: StructuredRecord) -> Result<(), SinkError> {
            Ok(())
        }

        async fn flush(&mut self) -> Result<(), SinkError> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn flush_interval(&self) -> Option<Duration> {
            Some(Duration::from_secs(1))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_flushed_every_interval_while_idle() {
        let flushes = Arc::new(AtomicU32::new(0));
        let sink = BatchingSink {
            flushes: Arc::clone(&flushes),
        };
        let runner = PipelineRunner::new(&config(), sink).unwrap();
        let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();
        let task = tokio::spawn(runner.run(receiver_stream(line_rx)));

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(flushes.load(Ordering::SeqCst), 3);

        // Closing the stream flushes once more
        drop(line_tx);
        task.await.unwrap().unwrap();
        assert_eq!(flushes.load(Ordering::SeqCst), 4);
    }

    struct FailingSink;

    #[async_trait]
    impl RecordSink for FailingSink {
        async fn send(&mut self, _record: StructuredRecord) -> Result<(), SinkError> {
            Err(SinkError::Rejected {
                status: 500,
                body: "down".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_sink_failure_is_surfaced() {
        let runner = PipelineRunner::new(&config(), FailingSink).unwrap();
        let result = runner.run(line_stream("2024-01-01 10:00:00 x\n".as_bytes())).await;
        assert!(matches!(
            result,
            Err(PipelineError::Sink(SinkError::Rejected { status: 500, .. }))
        ));
    }
}
