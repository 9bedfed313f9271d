use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        OnceLock,
    },
    time::Duration,
};

use metrics::{counter, histogram, Counter, Histogram};

/// A point-in-time snapshot of the client's internal counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Data points encoded into a batch.
    pub points_traced: u64,

    /// Data points rejected before encoding.
    pub invalid_points: u64,

    /// Data points waiting in the active batch.
    pub current_batch_size: u64,

    /// Batches fully written to the transport.
    pub batches_sent: u64,

    /// Bytes written to the transport for those batches.
    pub bytes_sent: u64,

    /// Datagrams, or stream writes, making up those batches.
    pub frames_sent: u64,

    /// Batches that could not be written.
    pub send_errors: u64,

    /// Data points the server reported as failed.
    pub trace_errors: u64,

    /// Batches discarded because they could not be finished.
    pub batches_discarded: u64,

    /// Records too large to fit in a datagram by themselves.
    pub records_dropped: u64,

    /// Responses received from the server.
    pub responses: u64,

    /// Statistics records received from the server and traced back as data points.
    pub stats_traced: u64,

    /// Responses that could not be interpreted.
    pub protocol_errors: u64,

    /// Synchronous flushes that gave up waiting for a response.
    pub flush_timeouts: u64,
}

#[derive(Default)]
struct Counters {
    points_traced: AtomicU64,
    invalid_points: AtomicU64,
    batches_sent: AtomicU64,
    bytes_sent: AtomicU64,
    frames_sent: AtomicU64,
    send_errors: AtomicU64,
    trace_errors: AtomicU64,
    batches_discarded: AtomicU64,
    records_dropped: AtomicU64,
    responses: AtomicU64,
    stats_traced: AtomicU64,
    protocol_errors: AtomicU64,
    flush_timeouts: AtomicU64,
}

/// Handles for the metrics emitted when telemetry is enabled.
struct Exported {
    points_traced: Counter,
    invalid_points: Counter,
    batches_sent: Counter,
    bytes_sent: Counter,
    frames_sent: Counter,
    send_errors: Counter,
    trace_errors: Counter,
    batches_discarded: Counter,
    records_dropped: Counter,
    responses: Counter,
    stats_traced: Counter,
    protocol_errors: Counter,
    flush_timeouts: Counter,
    swap_duration: Histogram,
    flush_duration: Histogram,
    import_elapsed: Histogram,
    import_allocated: Histogram,
}

impl Exported {
    fn new(transport: &'static str) -> Self {
        Self {
            points_traced: counter!("opentsdb.client.points_traced", "client_transport" => transport),
            invalid_points: counter!("opentsdb.client.invalid_points", "client_transport" => transport),
            batches_sent: counter!("opentsdb.client.batches_sent", "client_transport" => transport),
            bytes_sent: counter!("opentsdb.client.bytes_sent", "client_transport" => transport),
            frames_sent: counter!("opentsdb.client.frames_sent", "client_transport" => transport),
            send_errors: counter!("opentsdb.client.send_errors", "client_transport" => transport),
            trace_errors: counter!("opentsdb.client.trace_errors", "client_transport" => transport),
            batches_discarded: counter!("opentsdb.client.batches_discarded", "client_transport" => transport),
            records_dropped: counter!("opentsdb.client.records_dropped", "client_transport" => transport),
            responses: counter!("opentsdb.client.responses", "client_transport" => transport),
            stats_traced: counter!("opentsdb.client.stats_traced", "client_transport" => transport),
            protocol_errors: counter!("opentsdb.client.protocol_errors", "client_transport" => transport),
            flush_timeouts: counter!("opentsdb.client.flush_timeouts", "client_transport" => transport),
            swap_duration: histogram!("opentsdb.client.swap_seconds", "client_transport" => transport),
            flush_duration: histogram!("opentsdb.client.flush_seconds", "client_transport" => transport),
            import_elapsed: histogram!("opentsdb.client.import_elapsed", "client_transport" => transport),
            import_allocated: histogram!("opentsdb.client.import_allocated", "client_transport" => transport),
        }
    }
}

/// Client telemetry.
///
/// Counters are always tracked internally, and can be read back with [`snapshot`](Telemetry::snapshot). When enabled,
/// every update is also emitted through the global `metrics` recorder, labeled with the transport in use.
pub(crate) struct Telemetry {
    transport: &'static str,
    enabled: AtomicBool,
    counters: Counters,
    exported: OnceLock<Exported>,
}

impl Telemetry {
    /// Creates a `Telemetry` instance.
    pub fn new(transport: &'static str, enabled: bool) -> Self {
        Self { transport, enabled: AtomicBool::new(enabled), counters: Counters::default(), exported: OnceLock::new() }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    // Handles are registered lazily, so that they go through whichever recorder is installed by the time telemetry is
    // first emitted rather than the one present when the client was built.
    fn exported(&self) -> Option<&Exported> {
        self.is_enabled().then(|| self.exported.get_or_init(|| Exported::new(self.transport)))
    }

    pub fn track_point_traced(&self) {
        self.counters.points_traced.fetch_add(1, Ordering::Relaxed);
        if let Some(exported) = self.exported() {
            exported.points_traced.increment(1);
        }
    }

    pub fn track_invalid_point(&self) {
        self.counters.invalid_points.fetch_add(1, Ordering::Relaxed);
        if let Some(exported) = self.exported() {
            exported.invalid_points.increment(1);
        }
    }

    pub fn track_batch_sent(&self, bytes: usize, frames: usize) {
        self.counters.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.counters.frames_sent.fetch_add(frames as u64, Ordering::Relaxed);
        if let Some(exported) = self.exported() {
            exported.batches_sent.increment(1);
            exported.bytes_sent.increment(bytes as u64);
            exported.frames_sent.increment(frames as u64);
        }
    }

    pub fn track_send_error(&self) {
        self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
        if let Some(exported) = self.exported() {
            exported.send_errors.increment(1);
        }
    }

    pub fn track_trace_errors(&self, count: u64) {
        self.counters.trace_errors.fetch_add(count, Ordering::Relaxed);
        if let Some(exported) = self.exported() {
            exported.trace_errors.increment(count);
        }
    }

    pub fn track_batch_discarded(&self) {
        self.counters.batches_discarded.fetch_add(1, Ordering::Relaxed);
        if let Some(exported) = self.exported() {
            exported.batches_discarded.increment(1);
        }
    }

    pub fn track_records_dropped(&self, count: u64) {
        self.counters.records_dropped.fetch_add(count, Ordering::Relaxed);
        if let Some(exported) = self.exported() {
            exported.records_dropped.increment(count);
        }
    }

    pub fn track_response(&self) {
        self.counters.responses.fetch_add(1, Ordering::Relaxed);
        if let Some(exported) = self.exported() {
            exported.responses.increment(1);
        }
    }

    pub fn track_stats_traced(&self, count: u64) {
        self.counters.stats_traced.fetch_add(count, Ordering::Relaxed);
        if let Some(exported) = self.exported() {
            exported.stats_traced.increment(count);
        }
    }

    pub fn track_protocol_error(&self) {
        self.counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
        if let Some(exported) = self.exported() {
            exported.protocol_errors.increment(1);
        }
    }

    pub fn track_flush_timeout(&self) {
        self.counters.flush_timeouts.fetch_add(1, Ordering::Relaxed);
        if let Some(exported) = self.exported() {
            exported.flush_timeouts.increment(1);
        }
    }

    pub fn record_swap(&self, elapsed: Duration) {
        if let Some(exported) = self.exported() {
            exported.swap_duration.record(elapsed);
        }
    }

    pub fn record_flush(&self, elapsed: Duration) {
        if let Some(exported) = self.exported() {
            exported.flush_duration.record(elapsed);
        }
    }

    /// Records the import summary the server sends back for a batch.
    pub fn record_import(&self, elapsed: Option<u64>, allocated: Option<u64>) {
        if let Some(exported) = self.exported() {
            if let Some(elapsed) = elapsed {
                exported.import_elapsed.record(elapsed as f64);
            }
            if let Some(allocated) = allocated {
                exported.import_allocated.record(allocated as f64);
            }
        }
    }

    /// Takes a snapshot of the counters.
    pub fn snapshot(&self, current_batch_size: u64) -> ClientStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let c = &self.counters;

        ClientStats {
            points_traced: load(&c.points_traced),
            invalid_points: load(&c.invalid_points),
            current_batch_size,
            batches_sent: load(&c.batches_sent),
            bytes_sent: load(&c.bytes_sent),
            frames_sent: load(&c.frames_sent),
            send_errors: load(&c.send_errors),
            trace_errors: load(&c.trace_errors),
            batches_discarded: load(&c.batches_discarded),
            records_dropped: load(&c.records_dropped),
            responses: load(&c.responses),
            stats_traced: load(&c.stats_traced),
            protocol_errors: load(&c.protocol_errors),
            flush_timeouts: load(&c.flush_timeouts),
        }
    }
}
