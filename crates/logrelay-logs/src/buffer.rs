use std::time::{Duration, Instant};

use logrelay_types::RawLine;

/// Lines of one logical record, in arrival order
#[derive(Clone, Debug)]
pub struct RecordBuffer {
    /// Line texts, never empty
    lines: Vec<String>,

    /// Arrival of the first line
    created_at: Instant,

    /// Arrival of the most recent line
    last_append: Instant,
}

impl RecordBuffer {
    /// Open a buffer holding `first`
    pub fn open(first: RawLine) -> Self {
        Self {
            lines: vec![first.text],
            created_at: first.received_at,
            last_append: first.received_at,
        }
    }

    /// Append a continuation line and restart the inactivity clock
    pub fn append(&mut self, line: RawLine) {
        self.lines.push(line.text);
        // Out-of-order stamps never move the clock backwards
        if line.received_at > self.last_append {
            self.last_append = line.received_at;
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_append(&self) -> Instant {
        self.last_append
    }

    /// When the buffer expires if nothing else arrives
    pub fn deadline(&self, max_wait: Duration) -> Instant {
        self.last_append + max_wait
    }

    /// Join the lines, keeping the line breaks between them
    pub fn into_text(self) -> (String, usize) {
        let count = self.lines.len();
        (self.lines.join("\n"), count)
    }
}
