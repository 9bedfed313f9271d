use std::{
    net::SocketAddr,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, warn};

use crate::{
    codec::TraceCodec,
    point::{DataPoint, Value},
    state::{FlushError, State, TraceError},
    telemetry::ClientStats,
    transport::IoThread,
    util::localhost::Identity,
    validate::ValidationError,
    worker::Worker,
};

/// A client that batches data points and ships them to an OpenTSDB server.
///
/// Data points are encoded as they are traced, into a batch shared by every thread using the client. Calling
/// [`flush`](Client::flush) sends the batch. In synchronous mode, the flush then waits for the server to acknowledge
/// it, which also throttles producers to the pace of the server.
///
/// The client is shut down when dropped, or explicitly with [`close`](Client::close).
pub struct Client {
    state: Arc<State>,
    io: Option<IoThread>,
    worker: Option<Worker>,
    local_addr: Option<SocketAddr>,
    relay_stop: Option<Sender<()>>,
    relay_stopped: Receiver<()>,
    relays: Vec<JoinHandle<()>>,
}

impl Client {
    pub(crate) fn new(state: Arc<State>, io: IoThread, worker: Worker, local_addr: Option<SocketAddr>) -> Self {
        let (relay_stop, relay_stopped) = bounded(0);
        Self {
            state,
            io: Some(io),
            worker: Some(worker),
            local_addr,
            relay_stop: Some(relay_stop),
            relay_stopped,
            relays: Vec::new(),
        }
    }

    /// Traces a data point, timestamped with the current time.
    ///
    /// If the tags include neither `host` nor `app`, both are added from the client identity.
    ///
    /// # Errors
    ///
    /// If the metric name, a tag, or the value is invalid, an error is returned and the data point is dropped.
    pub fn trace<V, I, K, T>(&self, metric: &str, value: V, tags: I) -> Result<(), TraceError>
    where
        V: Into<Value>,
        I: IntoIterator<Item = (K, T)>,
        K: AsRef<str>,
        T: AsRef<str>,
    {
        self.state.trace(self.state.time_unit().now(), metric, value, tags)
    }

    /// Traces a data point with an explicit timestamp, in the configured time unit.
    ///
    /// # Errors
    ///
    /// If the metric name, a tag, or the value is invalid, an error is returned and the data point is dropped.
    pub fn trace_at<V, I, K, T>(&self, timestamp: i64, metric: &str, value: V, tags: I) -> Result<(), TraceError>
    where
        V: Into<Value>,
        I: IntoIterator<Item = (K, T)>,
        K: AsRef<str>,
        T: AsRef<str>,
    {
        self.state.trace(timestamp, metric, value, tags)
    }

    /// Traces a parsed data point.
    ///
    /// # Errors
    ///
    /// If the data point is invalid, an error is returned and the data point is dropped.
    pub fn trace_point(&self, point: &DataPoint) -> Result<(), TraceError> {
        self.state.trace(point.timestamp, &point.metric, point.value, &point.tags)
    }

    /// Parses a `<metric> <timestamp> <value> <key>=<value>...` line and traces it.
    ///
    /// # Errors
    ///
    /// If the line cannot be parsed, or the data point is invalid, an error is returned and the data point is dropped.
    pub fn trace_line(&self, line: &str) -> Result<(), TraceError> {
        self.state.trace_line(line)
    }

    /// Sends the current batch to the server.
    ///
    /// In synchronous mode, this waits for the server to acknowledge the batch. Must not be called from within a
    /// response callback.
    ///
    /// # Errors
    ///
    /// If the client is closed, the batch could not be sent, or the server did not acknowledge it in time, an error is
    /// returned. A timed out flush leaves the client usable.
    pub fn flush(&self) -> Result<(), FlushError> {
        self.state.flush()
    }

    /// Asks the server for its statistics.
    ///
    /// The statistics arrive asynchronously, and are traced into this client and flushed as they do.
    ///
    /// # Errors
    ///
    /// If the client does not send over UDP, or is closed, an error is returned.
    pub fn request_stats(&self) -> Result<(), FlushError> {
        self.state.request_stats()
    }

    /// Spawns a background thread that requests server statistics every `interval`, until the client is closed.
    ///
    /// # Errors
    ///
    /// If the client does not send over UDP, or the thread cannot be spawned, an error is returned.
    pub fn spawn_stats_relay(&mut self, interval: Duration) -> std::io::Result<()> {
        if !self.state.is_datagram() {
            return Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "stats relay requires UDP"));
        }

        let state = Arc::clone(&self.state);
        let stopped = self.relay_stopped.clone();
        let relay = thread::Builder::new().name("opentsdb-client-stats-relay".to_string()).spawn(move || loop {
            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(e) = state.request_stats() {
                        warn!(error = %e, "Failed to request server statistics.");
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        })?;

        self.relays.push(relay);
        Ok(())
    }

    /// Changes the host and app injected into data points that carry neither tag.
    ///
    /// # Errors
    ///
    /// If either name is not a valid tag value, an error is returned and the identity is unchanged.
    pub fn set_identity(&self, host: &str, app: &str) -> Result<(), ValidationError> {
        self.state.set_identity(host, app)
    }

    /// Returns the host and app injected into data points.
    pub fn identity(&self) -> Identity {
        self.state.identity()
    }

    /// Enables or disables emitting client telemetry through the `metrics` facade.
    pub fn enable_metrics(&self, enabled: bool) {
        self.state.telemetry().set_enabled(enabled);
    }

    /// Returns a snapshot of the client counters.
    pub fn stats(&self) -> ClientStats {
        self.state.stats()
    }

    /// Returns the number of data points in the current batch.
    pub fn current_batch_size(&self) -> u64 {
        self.state.current_batch_size()
    }

    /// Returns the contents of the current batch, lossily decoded as UTF-8.
    pub fn print_current_buffer(&self) -> String {
        self.state.print_current_buffer()
    }

    /// Returns the wire format in use.
    pub fn codec(&self) -> TraceCodec {
        self.state.codec()
    }

    /// Returns the transport ID, such as `tcp` or `udp`.
    pub fn transport_id(&self) -> &'static str {
        self.state.transport_id()
    }

    /// Returns the local address of the connection, if it has one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Shuts the client down.
    ///
    /// Data points not yet flushed are dropped, and any flush still waiting fails.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if !self.state.close() {
            return;
        }

        drop(self.relay_stop.take());
        for relay in self.relays.drain(..) {
            if relay.join().is_err() {
                error!("Stats relay panicked.");
            }
        }

        if let Some(io) = self.io.take() {
            io.shutdown();
        }
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }

        debug!(transport = self.state.transport_id(), "Client closed.");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}
