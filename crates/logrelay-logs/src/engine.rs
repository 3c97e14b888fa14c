use regex::Regex;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use logrelay_types::{ConfigError, OrphanPolicy, PipelineConfig, RawLine, StructuredRecord};

use crate::buffer::RecordBuffer;
use crate::extract::Extractor;

/// Reassembles multi-line records and extracts their fields
///
/// Holds at most one open [`RecordBuffer`]. The engine has no clock of its
/// own: line arrival instants drive it, and the caller asks for
/// [`expire`](Self::expire) once [`deadline`](Self::deadline) has passed.
#[derive(Debug)]
pub struct MultilineEngine {
    start: Regex,
    max_wait: Duration,
    max_lines: usize,
    orphan_policy: OrphanPolicy,
    extractor: Extractor,

    /// The record currently accepting lines
    current: Option<RecordBuffer>,

    /// Orphan lines dropped under `OrphanPolicy::Discard`
    discarded: u64,
}

impl MultilineEngine {
    pub fn new(config: &PipelineConfig) -> Result<Self, ConfigError> {
        if config.max_wait_time.is_zero() {
            return Err(ConfigError::Invalid("max_wait_time must be positive".to_string()));
        }

        Ok(Self {
            start: Regex::new(&config.start_pattern)?,
            max_wait: config.max_wait_time,
            max_lines: config.max_lines,
            orphan_policy: config.orphan_policy,
            extractor: Extractor::new(&config.extract_pattern, &config.time_format)?,
            current: None,
            discarded: 0,
        })
    }

    /// Feed one line, returning whatever records it completes
    pub fn push(&mut self, line: RawLine) -> Vec<StructuredRecord> {
        let mut out = Vec::new();

        // The line arrived after the open record timed out: close that first
        if let Some(record) = self.expire(line.received_at) {
            out.push(record);
        }

        let is_start = self.start.is_match(&line.text);

        if is_start {
            if !self.is_idle() {
                trace!("start line, flushing previous record");
                out.extend(self.flush());
            }
            self.current = Some(RecordBuffer::open(line));
        } else if let Some(buffer) = self.current.as_mut() {
            buffer.append(line);
        } else {
            match self.orphan_policy {
                OrphanPolicy::Wrap => {
                    debug!("continuation line with no open record, starting one");
                    self.current = Some(RecordBuffer::open(line));
                }
                OrphanPolicy::Discard => {
                    debug!(line = %line.text, "discarding continuation line with no open record");
                    self.discarded += 1;
                }
            }
        }

        if self.max_lines > 0 && self.current.as_ref().is_some_and(|b| b.len() >= self.max_lines) {
            debug!(max_lines = self.max_lines, "record reached line limit");
            out.extend(self.flush());
        }

        out
    }

    /// Flush the open record if it has been idle until `now`
    pub fn expire(&mut self, now: Instant) -> Option<StructuredRecord> {
        let deadline = self.deadline()?;
        if now < deadline {
            return None;
        }
        trace!("record idle for {:?}, flushing", self.max_wait);
        self.flush()
    }

    /// When the open record times out, if one is open
    pub fn deadline(&self) -> Option<Instant> {
        self.current.as_ref().map(|b| b.deadline(self.max_wait))
    }

    /// Finalize the open record; nothing is emitted when none is open
    pub fn flush(&mut self) -> Option<StructuredRecord> {
        let buffer = self.current.take()?;
        if buffer.is_empty() {
            return None;
        }
        let (text, count) = buffer.into_text();
        Some(self.extractor.extract(text, count))
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none()
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}
