use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error};

use logrelay_types::{SinkConfig, StructuredRecord};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("push request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("push rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("sink is closed")]
    Closed,

    #[error("sink misconfigured: {0}")]
    Config(String),
}

/// Downstream consumer of structured records
#[async_trait]
pub trait RecordSink: Send {
    async fn send(&mut self, record: StructuredRecord) -> Result<(), SinkError>;

    /// Push anything held back for batching
    async fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    /// How often the runner should call [`flush`](Self::flush) while idle
    fn flush_interval(&self) -> Option<Duration> {
        None
    }
}

#[async_trait]
impl RecordSink for Box<dyn RecordSink> {
    async fn send(&mut self, record: StructuredRecord) -> Result<(), SinkError> {
        (**self).send(record).await
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        (**self).flush().await
    }

    fn flush_interval(&self) -> Option<Duration> {
        (**self).flush_interval()
    }
}

/// Build the sink described by `config`
pub fn sink_from_config(config: &SinkConfig) -> Result<Box<dyn RecordSink>, SinkError> {
    match config.kind {
        logrelay_types::SinkKind::Stdout => Ok(Box::new(JsonLinesSink::stdout())),
        logrelay_types::SinkKind::Loki => Ok(Box::new(LokiSink::new(config)?)),
    }
}

// ============================================================================
// JSON lines
// ============================================================================

/// Writes one JSON object per record
pub struct JsonLinesSink<W> {
    writer: W,
}

impl JsonLinesSink<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W> JsonLinesSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> RecordSink for JsonLinesSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, record: StructuredRecord) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush().await?;
        Ok(())
    }
}

// ============================================================================
// Channel
// ============================================================================

/// Hands records to an in-process consumer
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<StructuredRecord>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<StructuredRecord>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl RecordSink for ChannelSink {
    async fn send(&mut self, record: StructuredRecord) -> Result<(), SinkError> {
        self.tx.send(record).map_err(|_| SinkError::Closed)
    }
}

// ============================================================================
// Loki push API
// ============================================================================

/// A record waiting in a batch, stamped for the push API
#[derive(Clone, Debug)]
struct PendingEntry {
    at: DateTime<Utc>,
    record: StructuredRecord,
}

/// Batches records and pushes them to a Loki-compatible endpoint
pub struct LokiSink {
    client: reqwest::Client,
    url: String,
    tenant_id: Option<String>,

    /// Labels attached to every stream
    labels: BTreeMap<String, String>,

    batch: Vec<PendingEntry>,
    batch_size: usize,
    batch_wait: Duration,
}

impl LokiSink {
    pub fn new(config: &SinkConfig) -> Result<Self, SinkError> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| SinkError::Config("loki sink needs a url".to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            url,
            tenant_id: config.tenant_id.clone(),
            labels: config.labels.clone(),
            batch: Vec::new(),
            batch_size: config.batch_size.max(1),
            batch_wait: config.batch_wait,
        })
    }

    /// Records waiting to be pushed
    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    async fn push_batch(&mut self) -> Result<(), SinkError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let entries = std::mem::take(&mut self.batch);
        let body = encode_push_request(&self.labels, &entries);

        match self.post(&body).await {
            Ok(()) => {
                debug!(records = entries.len(), "Pushed batch");
                Ok(())
            }
            Err(e) => {
                error!(records = entries.len(), error = %e, "Failed to push batch");
                // Keep the records so a later flush can retry them
                let mut restored = entries;
                restored.append(&mut self.batch);
                self.batch = restored;
                Err(e)
            }
        }
    }

    async fn post(&self, body: &Value) -> Result<(), SinkError> {
        let mut request = self.client.post(&self.url).json(body);
        if let Some(tenant) = &self.tenant_id {
            request = request.header("X-Scope-OrgID", tenant);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(SinkError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl RecordSink for LokiSink {
    async fn send(&mut self, record: StructuredRecord) -> Result<(), SinkError> {
        let at = record.time.unwrap_or_else(Utc::now);
        self.batch.push(PendingEntry { at, record });
        if self.batch.len() >= self.batch_size {
            self.push_batch().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.push_batch().await
    }

    fn flush_interval(&self) -> Option<Duration> {
        Some(self.batch_wait)
    }
}

/// Group entries into streams by label set, keeping arrival order within each
fn encode_push_request(labels: &BTreeMap<String, String>, entries: &[PendingEntry]) -> Value {
    let mut streams: BTreeMap<BTreeMap<String, String>, Vec<Value>> = BTreeMap::new();

    for entry in entries {
        let mut stream_labels = labels.clone();
        stream_labels.extend(entry.record.labels.clone());

        let nanos = entry.at.timestamp_nanos_opt().unwrap_or_default();
        streams
            .entry(stream_labels)
            .or_default()
            .push(json!([nanos.to_string(), entry.record.message]));
    }

    let streams: Vec<Value> = streams
        .into_iter()
        .map(|(stream, values)| json!({ "stream": stream, "values": values }))
        .collect();

    json!({ "streams": streams })
}
