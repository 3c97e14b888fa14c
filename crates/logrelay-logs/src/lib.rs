//! Log processing for logrelay
//!
//! This crate provides multi-line record reassembly, field extraction,
//! the stream driver and the sinks records are forwarded to.

mod buffer;
mod engine;
mod extract;
mod sink;
mod stream;

pub use buffer::RecordBuffer;
pub use engine::MultilineEngine;
pub use extract::Extractor;
pub use sink::{sink_from_config, ChannelSink, JsonLinesSink, LokiSink, RecordSink, SinkError};
pub use stream::{line_stream, PipelineError, PipelineRunner, RunStats};

// Re-export types used in our public API
pub use logrelay_types::{OrphanPolicy, PipelineConfig, RawLine, SinkConfig, StructuredRecord};
