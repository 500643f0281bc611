//! Response sinks for the manager.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use task_messenger_net::ResponseSink;
use tracing::debug;

/// Sink used by the manager binary: logs each delivery and counts them.
#[derive(Debug, Default)]
pub struct LogSink {
    delivered: AtomicU64,
}

impl LogSink {
    /// Create the sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Responses delivered so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

impl ResponseSink for LogSink {
    fn deliver(&self, task_id: u32, payload: Bytes) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        debug!(task_id, bytes = payload.len(), "response delivered");
    }
}

/// Sink that records every delivery; used by tests and embedders that
/// want to inspect responses (e.g. to re-enqueue unmatched task ids).
#[derive(Debug, Default)]
pub struct CollectSink {
    responses: Mutex<Vec<(u32, Bytes)>>,
}

impl CollectSink {
    /// Create the sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of responses recorded.
    pub fn len(&self) -> usize {
        self.responses.lock().len()
    }

    /// Whether nothing has been delivered yet.
    pub fn is_empty(&self) -> bool {
        self.responses.lock().is_empty()
    }

    /// Drain the recorded responses.
    pub fn take(&self) -> Vec<(u32, Bytes)> {
        std::mem::take(&mut *self.responses.lock())
    }
}

impl ResponseSink for CollectSink {
    fn deliver(&self, task_id: u32, payload: Bytes) {
        self.responses.lock().push((task_id, payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_sink_records_in_order() {
        let sink = CollectSink::new();
        sink.deliver(1, Bytes::from_static(b"a"));
        sink.deliver(2, Bytes::from_static(b"b"));
        assert_eq!(sink.len(), 2);

        let responses = sink.take();
        assert_eq!(responses[0].0, 1);
        assert_eq!(responses[1].0, 2);
        assert!(sink.is_empty());
    }

    #[test]
    fn log_sink_counts() {
        let sink = LogSink::new();
        sink.deliver(1, Bytes::new());
        sink.deliver(2, Bytes::new());
        assert_eq!(sink.delivered(), 2);
    }
}
