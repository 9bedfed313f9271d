use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::{
    buffer::{BufferManager, TraceBuffer},
    codec::{Codec, CodecError, HttpResponse, Response, ResponseCallback, TraceCodec},
    command::{Command, ProtocolError},
    framer::DatagramFramer,
    point::{DataPoint, ParseError, Tags, TimeUnit, Value},
    telemetry::{ClientStats, Telemetry},
    transport::{http, Outbound, TransportEvents, TransportHandle, WriteReceipt},
    util::{lines, localhost::Identity, spinlock::SpinLock},
    validate::{check_value, clean_metric, clean_tags, validate_string, ValidationError},
    worker::WorkerHandle,
};

/// Initial size of the scratch buffer each datagram-bound point is encoded into.
const PRE_ENCODE_LEN: usize = 128;

/// Headroom kept below the datagram ceiling when deciding to flush early.
const DATAGRAM_HEADROOM: usize = 3;

/// Errors that could occur while tracing a data point.
#[derive(Debug, Error)]
pub enum TraceError {
    /// The data point failed validation.
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    /// The line could not be parsed as a data point.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The data point could not be encoded.
    #[error(transparent)]
    Codec(CodecError),
}

impl From<CodecError> for TraceError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Invalid(e) => TraceError::Invalid(e),
            other => TraceError::Codec(other),
        }
    }
}

/// Errors that could occur while flushing, or otherwise talking to the server.
#[derive(Debug, Error)]
pub enum FlushError {
    /// The server did not acknowledge the batch in time.
    ///
    /// The client remains usable.
    #[error("timed out after {timeout:?} waiting for the server to acknowledge {points} data points")]
    Timeout {
        /// How long the flush waited.
        timeout: Duration,

        /// Number of data points in the batch.
        points: u64,
    },

    /// The connection was lost before the server acknowledged the batch.
    #[error("connection lost before the server acknowledged the batch")]
    Abandoned,

    /// The client has been closed.
    #[error("client is closed")]
    Closed,

    /// The batch could not be split into datagrams, or compressed.
    #[error("failed to frame batch: {0}")]
    Framing(#[source] io::Error),

    /// The operation is not available over the configured transport.
    #[error("operation not supported over the {transport} transport")]
    Unsupported {
        /// Transport ID of the client.
        transport: &'static str,
    },
}

/// Engine configuration.
pub(crate) struct StateConfiguration {
    pub codec: TraceCodec,
    pub time_unit: TimeUnit,
    pub synchronous: bool,
    pub flush_timeout: Duration,
    pub pending_wait: Duration,
    pub trace_buffer_size: usize,
    pub gzip: bool,
    pub max_datagram_len: Option<usize>,
    pub host_header: String,
    pub transport_id: &'static str,
    pub telemetry: bool,
    pub identity: Identity,
}

struct PendingFlush {
    id: u64,
    points: u64,
    // Released once this many acknowledgements have been received in total.
    until: u64,
    release: Sender<()>,
    completion: Receiver<()>,
}

/// Acknowledgements owed by the server, and the synchronous flush waiting on them.
///
/// The server answers batches in the order they were written, so counting acknowledgements is enough to tell which
/// batch a reply belongs to. A reply arriving when nothing is owed is unsolicited, and never releases a flush.
#[derive(Default)]
struct AckLedger {
    expected: u64,
    received: u64,
    flush: Option<PendingFlush>,
}

/// The summary the server sends back for a batch.
#[derive(Debug, Default, Deserialize)]
struct PutSummary {
    success: Option<u64>,
    failed: Option<u64>,
    errors: Option<ErrorReport>,
    cause: Option<String>,
    elapsed: Option<u64>,
    allocated: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorReport {
    Count(u64),
    Details(Vec<serde_json::Value>),
}

impl PutSummary {
    fn failures(&self) -> u64 {
        self.failed.unwrap_or(match &self.errors {
            Some(ErrorReport::Count(n)) => *n,
            Some(ErrorReport::Details(details)) => details.len() as u64,
            None => 0,
        })
    }
}

/// Shared state of a client.
///
/// Application threads encode data points into the active batch under a spin lock, while flushes swap the batch out
/// and hand it to the I/O thread. Responses from the server come back through [`StateEvents`].
pub(crate) struct State {
    config: StateConfiguration,
    codec: Codec,
    allocator: Arc<BufferManager>,
    framer: Option<DatagramFramer>,
    batch: SpinLock<TraceBuffer>,
    batch_size: AtomicU64,
    pending: Mutex<AckLedger>,
    next_pending_id: AtomicU64,
    flush_gate: Mutex<()>,
    identity: RwLock<Identity>,
    telemetry: Telemetry,
    transport: OnceLock<TransportHandle>,
    worker: WorkerHandle,
    closed: AtomicBool,
}

fn fresh_buffer(codec: &Codec, allocator: &BufferManager, size: usize) -> TraceBuffer {
    let mut buffer = allocator.allocate(size);
    if let Err(e) = codec.header(&mut buffer) {
        error!(error = %e, "Failed to write batch header.");
    }
    buffer.mark_header();
    buffer
}

impl State {
    pub fn new(config: StateConfiguration, allocator: Arc<BufferManager>, worker: WorkerHandle) -> Self {
        let codec = Codec::new(config.codec);
        let framer = config.max_datagram_len.map(|len| DatagramFramer::new(len, config.gzip));
        let batch = SpinLock::new(fresh_buffer(&codec, &allocator, config.trace_buffer_size));
        let telemetry = Telemetry::new(config.transport_id, config.telemetry);
        let identity = RwLock::new(config.identity.clone());

        Self {
            config,
            codec,
            allocator,
            framer,
            batch,
            batch_size: AtomicU64::new(0),
            pending: Mutex::new(AckLedger::default()),
            next_pending_id: AtomicU64::new(0),
            flush_gate: Mutex::new(()),
            identity,
            telemetry,
            transport: OnceLock::new(),
            worker,
            closed: AtomicBool::new(false),
        }
    }

    /// Connects the engine to the I/O thread. Only the first call has any effect.
    pub fn attach(&self, transport: TransportHandle) {
        let _ = self.transport.set(transport);
    }

    pub fn codec(&self) -> TraceCodec {
        self.codec.kind()
    }

    pub fn time_unit(&self) -> TimeUnit {
        self.config.time_unit
    }

    pub fn transport_id(&self) -> &'static str {
        self.config.transport_id
    }

    /// Returns `true` if batches are framed into datagrams.
    pub fn is_datagram(&self) -> bool {
        self.framer.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn identity(&self) -> Identity {
        self.identity.read().clone()
    }

    /// Changes the host and app that are injected into data points.
    pub fn set_identity(&self, host: &str, app: &str) -> Result<(), ValidationError> {
        let host = validate_string("host", host)?.to_string();
        let app = validate_string("app", app)?.to_string();
        *self.identity.write() = Identity { host, app };
        Ok(())
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn current_batch_size(&self) -> u64 {
        self.batch_size.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ClientStats {
        self.telemetry.snapshot(self.current_batch_size())
    }

    /// Returns the contents of the active batch, for debugging.
    pub fn print_current_buffer(&self) -> String {
        let contents = self.batch.with_lock(false, |buffer| buffer.as_bytes().to_vec());
        String::from_utf8_lossy(&contents).into_owned()
    }

    /// Validates a data point and encodes it into the active batch.
    pub fn trace<V, I, K, T>(&self, timestamp: i64, metric: &str, value: V, tags: I) -> Result<(), TraceError>
    where
        V: Into<Value>,
        I: IntoIterator<Item = (K, T)>,
        K: AsRef<str>,
        T: AsRef<str>,
    {
        let result = self.clean_and_encode(timestamp, metric, value.into(), tags);
        if let Err(e) = &result {
            self.telemetry.track_invalid_point();
            debug!(metric, error = %e, "Dropping invalid data point.");
        }
        result
    }

    /// Parses a `<metric> <timestamp> <value> <key>=<value>...` line and traces it.
    pub fn trace_line(&self, line: &str) -> Result<(), TraceError> {
        let point = match line.parse::<DataPoint>() {
            Ok(point) => point,
            Err(e) => {
                self.telemetry.track_invalid_point();
                debug!(line, error = %e, "Dropping unparseable data point.");
                return Err(e.into());
            }
        };

        self.trace(point.timestamp, &point.metric, point.value, &point.tags)
    }

    fn clean_and_encode<I, K, T>(&self, timestamp: i64, metric: &str, value: Value, tags: I) -> Result<(), TraceError>
    where
        I: IntoIterator<Item = (K, T)>,
        K: AsRef<str>,
        T: AsRef<str>,
    {
        let metric = clean_metric(metric)?;
        let value = check_value(&metric, value)?;
        let tags = {
            let identity = self.identity.read();
            clean_tags(tags, &identity.host, &identity.app)?
        };

        match self.datagram_watermark() {
            Some(watermark) => self.append_datagram(watermark, timestamp, &metric, value, &tags)?,
            None => {
                self.batch.with_lock(false, |buffer| self.codec.encode(buffer, timestamp, &metric, value, &tags))?;
            }
        }

        self.telemetry.track_point_traced();
        self.batch_size.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn datagram_watermark(&self) -> Option<usize> {
        self.config.max_datagram_len.map(|len| len.saturating_sub(DATAGRAM_HEADROOM))
    }

    /// Encodes a point on its own first, flushing beforehand if appending it would push the batch past `watermark`.
    fn append_datagram(
        &self,
        watermark: usize,
        timestamp: i64,
        metric: &str,
        value: Value,
        tags: &Tags,
    ) -> Result<(), TraceError> {
        let mut scratch = self.allocator.allocate(PRE_ENCODE_LEN);
        let encoded = self.codec.encode(&mut scratch, timestamp, metric, value, tags);
        self.codec.invalidate(scratch.id());
        if let Err(e) = encoded {
            self.allocator.release(scratch.into_bytes());
            return Err(e.into());
        }

        // The length check and the append happen under one hold of the lock, so concurrent tracers can never push the
        // batch past the watermark between them. Once a flush has failed, the point is appended regardless.
        let mut forced = false;
        loop {
            let appended = self.batch.with_lock(false, |buffer| {
                if !forced && buffer.has_records() && buffer.len() + scratch.len() > watermark {
                    return false;
                }
                buffer.extend_from_slice(scratch.as_bytes());
                true
            });
            if appended {
                break;
            }

            trace!(record_len = scratch.len(), watermark, "Flushing before datagram overflows.");
            if let Err(e) = self.flush() {
                warn!(error = %e, "Implicit flush failed.");
                forced = true;
            }
        }

        self.allocator.release(scratch.into_bytes());
        Ok(())
    }

    /// Retires the active batch, installing a fresh one with its header already written.
    ///
    /// Returns the retired batch, or `None` if it could not be finished and was discarded. A batch without records is
    /// returned without its tailer.
    pub fn swap(&self) -> Option<TraceBuffer> {
        let started = Instant::now();
        let fresh = fresh_buffer(&self.codec, &self.allocator, self.config.trace_buffer_size);

        let finished = self.batch.with_lock(true, |active| {
            let mut retired = std::mem::replace(active, fresh);
            let result = if retired.has_records() { self.codec.tailer(&mut retired) } else { Ok(()) };
            self.codec.invalidate(retired.id());
            match result {
                Ok(()) => Ok(retired),
                Err(e) => {
                    self.batch_size.store(0, Ordering::Release);
                    Err((e, retired))
                }
            }
        });
        self.telemetry.record_swap(started.elapsed());

        match finished {
            Ok(retired) => Some(retired),
            Err((e, retired)) => {
                error!(error = %e, bytes = retired.len(), "Failed to finish batch. Discarding it.");
                self.telemetry.track_batch_discarded();
                self.allocator.release(retired.into_bytes());
                None
            }
        }
    }

    /// Sends the active batch to the server.
    ///
    /// In synchronous mode, this blocks until the server acknowledges the batch or the flush timeout elapses. It must
    /// never be called from the I/O thread.
    pub fn flush(&self) -> Result<(), FlushError> {
        if self.is_closed() {
            return Err(FlushError::Closed);
        }

        let _gate = self.flush_gate.lock();
        self.await_pending();

        let started = Instant::now();
        let points = self.batch_size.swap(0, Ordering::AcqRel);
        let Some(retired) = self.swap() else { return Ok(()) };
        if !retired.has_records() {
            self.allocator.release(retired.into_bytes());
            return Ok(());
        }

        let chunks = self.encode_batch(retired)?;
        self.expect_acks(self.acks_owed(chunks.len()));
        let pending = self.config.synchronous.then(|| self.install_pending(points));
        if let Err(e) = self.send(chunks, points) {
            self.abandon_pending();
            self.forget_acks();
            return Err(e);
        }

        let Some(completion) = pending else { return Ok(()) };
        match completion.recv_timeout(self.config.flush_timeout) {
            Ok(()) => {
                self.telemetry.record_flush(started.elapsed());
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                self.telemetry.track_flush_timeout();
                warn!(points, timeout = ?self.config.flush_timeout, "Timed out waiting for batch acknowledgement.");
                Err(FlushError::Timeout { timeout: self.config.flush_timeout, points })
            }
            Err(RecvTimeoutError::Disconnected) if self.is_closed() => Err(FlushError::Closed),
            Err(RecvTimeoutError::Disconnected) => Err(FlushError::Abandoned),
        }
    }

    /// Turns a retired batch into the chunks written to the transport: datagrams, or an HTTP request.
    fn encode_batch(&self, retired: TraceBuffer) -> Result<Vec<Bytes>, FlushError> {
        let payload = retired.into_bytes();

        let chunks = if let Some(framer) = &self.framer {
            let framed = framer.frame(&payload);
            self.allocator.release(payload);
            let frames = framed.map_err(|e| {
                self.telemetry.track_send_error();
                error!(error = %e, "Failed to frame batch.");
                FlushError::Framing(e)
            })?;

            if frames.records_dropped() > 0 {
                self.telemetry.track_records_dropped(frames.records_dropped());
                warn!(records = frames.records_dropped(), "Dropped records too large for a single datagram.");
            }
            frames.into_frames()
        } else if self.codec.kind() == TraceCodec::Json {
            let body = if self.config.gzip {
                let compressed = http::gzip_body(&payload);
                self.allocator.release(payload);
                compressed.map_err(|e| {
                    self.telemetry.track_send_error();
                    error!(error = %e, "Failed to compress batch.");
                    FlushError::Framing(e)
                })?
            } else {
                payload
            };
            let head = http::request_head(&self.config.host_header, body.len(), self.config.gzip);
            vec![head, body]
        } else {
            vec![payload]
        };
        Ok(chunks)
    }

    /// Number of acknowledgements the server owes for a batch written as `chunks` chunks.
    fn acks_owed(&self, chunks: usize) -> u64 {
        if chunks == 0 || !self.codec.kind().acknowledged() {
            0
        } else if self.framer.is_some() {
            // One `PUTBATCH` reply per datagram.
            chunks as u64
        } else {
            1
        }
    }

    fn send(&self, chunks: Vec<Bytes>, points: u64) -> Result<(), FlushError> {
        let transport = self.transport.get().ok_or(FlushError::Closed)?;

        trace!(points, chunks = chunks.len(), "Handing batch to transport.");
        transport.send(Outbound::Batch { chunks, points }).map_err(|e| {
            self.telemetry.track_send_error();
            error!(error = %e, "Failed to hand batch to transport.");
            FlushError::Closed
        })
    }

    /// Asks the server for its statistics, which come back as data points.
    pub fn request_stats(&self) -> Result<(), FlushError> {
        let Some(framer) = &self.framer else {
            return Err(FlushError::Unsupported { transport: self.config.transport_id });
        };
        if self.is_closed() {
            return Err(FlushError::Closed);
        }

        let transport = self.transport.get().ok_or(FlushError::Closed)?;
        let request = self.allocator.wrap(Command::Stats.request_line());
        let frames = if self.config.gzip {
            framer.frame(&request).map_err(FlushError::Framing)?.into_frames()
        } else {
            vec![request]
        };

        for frame in frames {
            transport.send(Outbound::Command(frame)).map_err(|_| FlushError::Closed)?;
        }
        Ok(())
    }

    /// Records that the batch about to be sent will be answered with `acks` acknowledgements.
    fn expect_acks(&self, acks: u64) {
        self.pending.lock().expected += acks;
    }

    /// Installs the latch for a synchronous flush, released once every acknowledgement expected so far has arrived.
    fn install_pending(&self, points: u64) -> Receiver<()> {
        let (release, completion) = bounded(1);
        let id = self.next_pending_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut ledger = self.pending.lock();
        let until = ledger.expected;
        ledger.flush = Some(PendingFlush { id, points, until, release, completion: completion.clone() });
        completion
    }

    /// Waits for the previous flush to be acknowledged, superseding it if that takes too long.
    fn await_pending(&self) {
        let outstanding = self.pending.lock().flush.as_ref().map(|p| (p.id, p.points, p.completion.clone()));
        let Some((id, points, completion)) = outstanding else { return };

        if let Err(RecvTimeoutError::Timeout) = completion.recv_timeout(self.config.pending_wait) {
            let mut ledger = self.pending.lock();
            if ledger.flush.as_ref().is_some_and(|p| p.id == id) {
                ledger.flush = None;
            }
            warn!(points, "Superseding a flush that was never acknowledged.");
        }
    }

    /// Signals the outstanding flush, if any, as complete.
    fn release_pending(&self) {
        if let Some(pending) = self.pending.lock().flush.take() {
            let _ = pending.release.try_send(());
        }
    }

    /// Credits `acks` acknowledgements from the server, releasing the outstanding flush once all of its are in.
    ///
    /// Replies beyond what is owed are unsolicited, and ignored.
    fn acknowledge(&self, acks: u64) {
        let mut ledger = self.pending.lock();
        let credited = acks.min(ledger.expected - ledger.received);
        if credited < acks {
            debug!(unsolicited = acks - credited, "Ignoring acknowledgement nothing was waiting for.");
        }
        if credited == 0 {
            return;
        }

        ledger.received += credited;
        let received = ledger.received;
        if ledger.flush.as_ref().is_some_and(|p| p.until <= received) {
            if let Some(pending) = ledger.flush.take() {
                let _ = pending.release.try_send(());
            }
        }
    }

    /// Writes off every acknowledgement still owed, such as when the batches they answer were lost.
    fn forget_acks(&self) {
        let mut ledger = self.pending.lock();
        ledger.received = ledger.expected;
    }

    /// Fails the outstanding flush, if any.
    fn abandon_pending(&self) {
        drop(self.pending.lock().flush.take());
    }

    /// Marks the client as closed, failing any outstanding flush. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.abandon_pending();
        true
    }

    fn dispatch<F>(self: &Arc<Self>, job: F)
    where
        F: FnOnce(&State) + Send + 'static,
    {
        let state = Arc::clone(self);
        if !self.worker.dispatch(move || job(state.as_ref())) {
            debug!("Worker stopped. Dropping response.");
        }
    }

    fn on_response(self: &Arc<Self>, response: Response) {
        self.telemetry.track_response();
        match response {
            Response::Lines(lines) => {
                // Only batch summaries answer a batch. Other lines report individual failed points.
                let summaries = lines.iter().filter(|line| line.starts_with('{')).count();
                self.acknowledge(summaries as u64);
                self.dispatch(move |state| state.process_lines(&lines));
            }
            Response::Http(response) => {
                self.acknowledge(1);
                self.dispatch(move |state| state.process_http(&response));
            }
            Response::Datagram(datagram) => match Command::extract(&datagram) {
                Ok(Command::PutBatch) => {
                    self.acknowledge(1);
                    self.dispatch(move |state| state.process_put_batch(&datagram));
                }
                Ok(Command::Stats) => self.dispatch(move |state| state.process_stats(&datagram)),
                Err(e) => self.on_protocol_error(&e),
            },
            Response::Bytes(raw) => {
                self.on_protocol_error(&ProtocolError::MalformedHttp(format!(
                    "{} bytes of undecodable response",
                    raw.len()
                )));
            }
        }
    }

    fn on_protocol_error(&self, error: &ProtocolError) {
        self.telemetry.track_protocol_error();
        warn!(%error, "Ignoring response.");
    }

    fn process_lines(&self, lines: &[String]) {
        for line in lines {
            if line.starts_with('{') {
                match serde_json::from_str::<PutSummary>(line) {
                    Ok(summary) => self.process_summary(&summary),
                    Err(e) => self.on_protocol_error(&ProtocolError::MalformedHttp(e.to_string())),
                }
            } else {
                self.telemetry.track_trace_errors(1);
                error!(response = %line, "Server reported a failed data point.");
            }
        }
    }

    fn process_http(&self, response: &HttpResponse) {
        let summary = serde_json::from_slice::<PutSummary>(&response.body).ok();
        let reported = summary.as_ref().is_some_and(|s| s.cause.is_some() || s.failures() > 0);

        if !response.is_success() && !reported {
            self.telemetry.track_send_error();
            error!(
                status = response.status,
                reason = %response.reason,
                body = %String::from_utf8_lossy(&response.body),
                "Server rejected batch."
            );
            return;
        }

        match summary {
            Some(summary) => self.process_summary(&summary),
            None => debug!(status = response.status, "Batch acknowledged."),
        }
    }

    fn process_put_batch(&self, datagram: &[u8]) {
        let payload = match Command::extract_payload(datagram) {
            Ok(payload) => payload,
            Err(e) => return self.on_protocol_error(&e),
        };

        let payload = lines::trim(payload);
        if payload.is_empty() {
            return;
        }

        match serde_json::from_slice::<PutSummary>(payload) {
            Ok(summary) => self.process_summary(&summary),
            Err(e) => self.on_protocol_error(&ProtocolError::MalformedHttp(e.to_string())),
        }
    }

    fn process_summary(&self, summary: &PutSummary) {
        self.telemetry.record_import(summary.elapsed, summary.allocated);

        let failures = summary.failures();
        if let Some(cause) = &summary.cause {
            self.telemetry.track_trace_errors(failures.max(1));
            error!(cause = %cause, "Server rejected batch.");
        } else if failures > 0 {
            self.telemetry.track_trace_errors(failures);
            warn!(failed = failures, success = ?summary.success, "Server failed to import data points.");
        } else {
            debug!(success = ?summary.success, elapsed = ?summary.elapsed, "Batch acknowledged.");
        }

        if let Some(ErrorReport::Details(details)) = &summary.errors {
            for detail in details.iter().take(10) {
                debug!(error = %detail, "Data point rejected.");
            }
        }
    }

    /// Traces every statistic record in a `STATS` datagram back into this client, then flushes them.
    fn process_stats(&self, datagram: &[u8]) {
        let payload = match Command::extract_payload(datagram) {
            Ok(payload) => payload,
            Err(e) => return self.on_protocol_error(&e),
        };

        let mut traced = 0;
        for record in lines::records(payload) {
            if Command::Stats.is_verb_line(record) {
                continue;
            }

            match std::str::from_utf8(record) {
                Ok(line) => match self.trace_line(line) {
                    Ok(()) => traced += 1,
                    Err(e) => warn!(error = %e, line, "Failed to trace server statistic."),
                },
                Err(_) => warn!("Skipping server statistic that is not valid UTF-8."),
            }
        }

        self.telemetry.track_stats_traced(traced);
        debug!(traced, "Traced server statistics.");

        if traced > 0 {
            if let Err(e) = self.flush() {
                warn!(error = %e, "Failed to flush server statistics.");
            }
        }
    }

    fn on_write_complete(&self, result: io::Result<WriteReceipt>) {
        match result {
            Ok(receipt) => {
                trace!(points = receipt.points, bytes = receipt.bytes, frames = receipt.frames, "Batch written.");
                if receipt.frames > 0 {
                    self.telemetry.track_batch_sent(receipt.bytes, receipt.frames);
                }

                // Nothing will answer an empty or unacknowledged batch.
                if receipt.frames == 0 || !self.codec.kind().acknowledged() {
                    self.release_pending();
                }
            }
            Err(e) => {
                // Nothing will answer a batch that never made it out.
                self.forget_acks();
                self.telemetry.track_send_error();
                error!(error = %e, "Failed to send batch.");
            }
        }
    }
}

/// Routes transport and response events into the engine.
pub(crate) struct StateEvents(pub Arc<State>);

impl ResponseCallback for StateEvents {
    fn on_response(&self, response: Response) {
        self.0.on_response(response);
    }
}

impl TransportEvents for StateEvents {
    fn on_write_complete(&self, result: io::Result<WriteReceipt>) {
        self.0.on_write_complete(result);
    }

    fn on_disconnected(&self) {
        if self.0.pending.lock().flush.is_some() {
            debug!("Connection lost with a flush outstanding.");
        }
        self.0.abandon_pending();
        self.0.forget_acks();
    }

    fn on_protocol_error(&self, error: &ProtocolError) {
        self.0.on_protocol_error(error);
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use bytes::Bytes;

    use super::{FlushError, PutSummary, State, StateConfiguration, TraceError};
    use crate::{
        buffer::BufferManager,
        codec::{HttpResponse, Response, TraceCodec},
        point::{DataPoint, TimeUnit},
        transport::WriteReceipt,
        util::localhost::Identity,
        validate::ValidationError,
        worker::Worker,
    };

    const NO_TAGS: [(&str, &str); 0] = [];

    fn config(codec: TraceCodec) -> StateConfiguration {
        StateConfiguration {
            codec,
            time_unit: TimeUnit::Milliseconds,
            synchronous: true,
            flush_timeout: Duration::from_millis(100),
            pending_wait: Duration::from_millis(10),
            trace_buffer_size: 256,
            gzip: false,
            max_datagram_len: None,
            host_header: "localhost:4242".to_string(),
            transport_id: "tcp",
            telemetry: false,
            identity: Identity { host: "h1".to_string(), app: "a1".to_string() },
        }
    }

    fn state(codec: TraceCodec) -> (Arc<State>, Worker) {
        let worker = Worker::spawn("opentsdb-client-test-worker").unwrap();
        let state = State::new(config(codec), Arc::new(BufferManager::unpooled()), worker.handle());
        (Arc::new(state), worker)
    }

    #[test]
    fn trace_injects_identity_when_neither_tag_present() {
        let (state, worker) = state(TraceCodec::Put);

        state.trace(1000, "sys.cpu", 42, [("dc", "east")]).unwrap();
        state.trace(1001, " sys.mem ", 1.5, [("host", "web1")]).unwrap();
        state.trace(1002, "sys.disk", 7, NO_TAGS).unwrap();

        assert_eq!(
            state.print_current_buffer(),
            "put sys.cpu 1000 42 app=a1 dc=east host=h1\n\
             put sys.mem 1001 1.5 host=web1\n\
             put sys.disk 1002 7 app=a1 host=h1\n"
        );
        assert_eq!(state.current_batch_size(), 3);
        assert_eq!(state.stats().points_traced, 3);

        worker.shutdown();
    }

    #[test]
    fn invalid_points_never_reach_the_batch() {
        let (state, worker) = state(TraceCodec::Text);
        let before = state.print_current_buffer();

        let cases: Vec<Result<(), TraceError>> = vec![
            state.trace(1, "bad metric!", 1, [("a", "b")]),
            state.trace(1, "", 1, [("a", "b")]),
            state.trace(1, "m", f64::NAN, [("a", "b")]),
            state.trace(1, "m", 1, [("a", "b c")]),
            state.trace_line("only two"),
        ];
        for result in cases {
            assert!(result.is_err());
        }

        assert!(matches!(
            state.trace(1, "m", f64::INFINITY, NO_TAGS),
            Err(TraceError::Invalid(ValidationError::NonFiniteValue { .. }))
        ));
        assert_eq!(state.print_current_buffer(), before);
        assert_eq!(state.current_batch_size(), 0);
        assert_eq!(state.stats().invalid_points, 6);

        worker.shutdown();
    }

    #[test]
    fn concurrent_traces_are_never_torn() {
        let (state, worker) = state(TraceCodec::Put);

        let handles = (0..8)
            .map(|t| {
                let state = Arc::clone(&state);
                thread::spawn(move || {
                    for i in 0..250 {
                        let tag = format!("t{t}");
                        state.trace(i, "load.test", i * 3, [("thread", tag.as_str())]).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        let contents = state.print_current_buffer();
        let mut records = 0;
        for line in contents.lines() {
            let point = line.strip_prefix("put ").unwrap().parse::<DataPoint>().unwrap();
            assert_eq!(point.metric, "load.test");
            assert_eq!(point.tags.len(), 3);
            records += 1;
        }

        assert_eq!(records, 2000);
        assert_eq!(state.current_batch_size(), 2000);

        worker.shutdown();
    }

    #[test]
    fn concurrent_traces_survive_swaps() {
        let (state, worker) = state(TraceCodec::Text);
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let swapper = {
            let state = Arc::clone(&state);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut retired = Vec::new();
                while !done.load(std::sync::atomic::Ordering::Acquire) {
                    retired.extend(state.swap().map(|b| b.into_bytes()));
                    thread::yield_now();
                }
                retired
            })
        };

        let tracers = (0..4)
            .map(|_| {
                let state = Arc::clone(&state);
                thread::spawn(move || {
                    for i in 0..500 {
                        state.trace(i, "swap.test", i, [("k", "v")]).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        for tracer in tracers {
            tracer.join().unwrap();
        }
        done.store(true, std::sync::atomic::Ordering::Release);

        let mut batches = swapper.join().unwrap();
        batches.extend(state.swap().map(|b| b.into_bytes()));

        let mut records = 0;
        for batch in &batches {
            let batch = std::str::from_utf8(batch).unwrap();
            let mut lines = batch.lines();
            assert_eq!(lines.next(), Some("PUTBATCH --send-response"));
            for line in lines.filter(|l| !l.is_empty()) {
                let point = line.parse::<DataPoint>().unwrap();
                assert_eq!(point.metric, "swap.test");
                records += 1;
            }
        }

        assert_eq!(records, 2000);
        assert_eq!(state.print_current_buffer(), "PUTBATCH --send-response\n");

        worker.shutdown();
    }

    #[test]
    fn swap_finishes_json_batch() {
        let (state, worker) = state(TraceCodec::Json);

        state.trace(1, "a", 1, [("k", "v")]).unwrap();
        state.trace(2, "b", 2.5, [("k", "v")]).unwrap();

        let retired = state.swap().unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(retired.as_bytes()).unwrap();
        assert_eq!(parsed.as_array().map(Vec::len), Some(2));
        assert_eq!(parsed[1]["value"], serde_json::json!(2.5));

        assert_eq!(state.print_current_buffer(), "[");
        assert_eq!(state.codec.live_generators(), 1);

        worker.shutdown();
    }

    #[test]
    fn swap_discards_batch_that_cannot_be_finished() {
        let (state, worker) = state(TraceCodec::Json);

        state.trace(1, "a", 1, [("k", "v")]).unwrap();
        let active = state.batch.with_lock(false, |buffer| buffer.id());
        state.codec.invalidate(active);

        assert!(state.swap().is_none());
        assert_eq!(state.current_batch_size(), 0);
        assert_eq!(state.stats().batches_discarded, 1);

        state.trace(2, "b", 2, [("k", "v")]).unwrap();
        assert!(state.print_current_buffer().starts_with("[{"));

        worker.shutdown();
    }

    #[test]
    fn flush_without_records_is_a_no_op() {
        let (state, worker) = state(TraceCodec::Json);

        state.flush().unwrap();
        assert_eq!(state.print_current_buffer(), "[");

        assert!(state.close());
        assert!(!state.close());
        assert!(matches!(state.flush(), Err(FlushError::Closed)));

        worker.shutdown();
    }

    #[test]
    fn stats_need_a_datagram_transport() {
        let (state, worker) = state(TraceCodec::Text);

        assert!(matches!(state.request_stats(), Err(FlushError::Unsupported { transport: "tcp" })));

        worker.shutdown();
    }

    #[test]
    fn unacknowledged_batches_release_on_write() {
        let (state, worker) = state(TraceCodec::Put);

        let completion = state.install_pending(3);
        state.on_write_complete(Ok(WriteReceipt { points: 3, bytes: 64, frames: 1 }));

        assert!(completion.try_recv().is_ok());
        let stats = state.stats();
        assert_eq!(stats.batches_sent, 1);
        assert_eq!(stats.bytes_sent, 64);

        worker.shutdown();
    }

    #[test]
    fn acknowledged_batches_wait_for_response() {
        let (state, worker) = state(TraceCodec::Text);

        state.expect_acks(1);
        let completion = state.install_pending(2);
        state.on_write_complete(Ok(WriteReceipt { points: 2, bytes: 80, frames: 1 }));
        assert!(completion.try_recv().is_err());

        state.on_response(Response::Lines(vec![r#"{"success":2,"failed":0}"#.to_string()]));
        assert!(completion.try_recv().is_ok());
        assert_eq!(state.stats().responses, 1);

        worker.shutdown();
    }

    #[test]
    fn unsolicited_replies_never_release_a_flush() {
        let (state, worker) = state(TraceCodec::Text);
        let summary = || Response::Lines(vec![r#"{"success":1,"failed":0}"#.to_string()]);

        state.expect_acks(1);
        let first = state.install_pending(1);
        state.on_response(summary());
        assert!(first.try_recv().is_ok());

        // Nothing is owed between the two flushes.
        state.on_response(summary());
        state.on_response(Response::Bytes(Bytes::from_static(b"garbage")));
        state.on_response(Response::Lines(vec!["m 1 1 k=v: unknown metric".to_string()]));

        state.expect_acks(1);
        let second = state.install_pending(1);
        assert!(second.try_recv().is_err());

        state.on_response(summary());
        assert!(second.try_recv().is_ok());
        assert_eq!(state.stats().responses, 5);

        worker.shutdown();
    }

    #[test]
    fn late_reply_to_superseded_flush_is_not_mistaken_for_the_next() {
        let (state, worker) = state(TraceCodec::Text);
        let summary = || Response::Lines(vec![r#"{"success":1,"failed":0}"#.to_string()]);

        state.expect_acks(1);
        let first = state.install_pending(1);
        state.await_pending();
        assert!(first.try_recv().is_err());

        state.expect_acks(1);
        let second = state.install_pending(1);

        state.on_response(summary());
        assert!(second.try_recv().is_err());

        state.on_response(summary());
        assert!(second.try_recv().is_ok());

        worker.shutdown();
    }

    #[test]
    fn replies_never_release_unacknowledged_batches() {
        let (state, worker) = state(TraceCodec::Put);

        let completion = state.install_pending(1);
        state.on_response(Response::Lines(vec!["put: illegal argument".to_string()]));
        state.on_response(Response::Bytes(Bytes::from_static(b"\x00\x01")));
        assert!(completion.try_recv().is_err());

        state.on_write_complete(Ok(WriteReceipt { points: 1, bytes: 16, frames: 1 }));
        assert!(completion.try_recv().is_ok());

        worker.shutdown();
    }

    #[test]
    fn acknowledgements_of_lost_batches_are_written_off() {
        let (state, worker) = state(TraceCodec::Text);

        state.expect_acks(1);
        let lost = state.install_pending(1);
        state.on_write_complete(Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe)));
        assert!(lost.try_recv().is_err());
        state.abandon_pending();

        state.expect_acks(1);
        let next = state.install_pending(1);
        state.on_response(Response::Lines(vec![r#"{"success":1,"failed":0}"#.to_string()]));
        assert!(next.try_recv().is_ok());

        worker.shutdown();
    }

    #[test]
    fn acknowledgements_owed_per_batch() {
        let (stream, stream_worker) = state(TraceCodec::Text);
        let (put, put_worker) = state(TraceCodec::Put);
        let (datagram, datagram_worker) = {
            let worker = Worker::spawn("opentsdb-client-test-worker").unwrap();
            let config = StateConfiguration { max_datagram_len: Some(256), transport_id: "udp", ..config(TraceCodec::Text) };
            let state = State::new(config, Arc::new(BufferManager::unpooled()), worker.handle());
            (state, worker)
        };

        let cases = [(&*stream, 2, 1), (&*stream, 0, 0), (&*put, 1, 0), (&datagram, 3, 3), (&datagram, 0, 0)];
        for (state, chunks, expected) in cases {
            assert_eq!(state.acks_owed(chunks), expected);
        }
        assert!(datagram.is_datagram());
        assert!(!stream.is_datagram());

        stream_worker.shutdown();
        put_worker.shutdown();
        datagram_worker.shutdown();
    }

    #[test]
    fn failed_writes_leave_the_flush_waiting() {
        let (state, worker) = state(TraceCodec::Put);

        let completion = state.install_pending(1);
        state.on_write_complete(Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe)));

        assert!(completion.try_recv().is_err());
        assert_eq!(state.stats().send_errors, 1);

        worker.shutdown();
    }

    #[test]
    fn put_batch_summary_counts_failures() {
        let (state, worker) = state(TraceCodec::JsonText);

        state.process_put_batch(b"PUTBATCH:\n{\"success\":1,\"failed\":2}\n");
        state.process_put_batch(b"PUTBATCH:\n{\"cause\":\"no such metric\"}");
        state.process_put_batch(b"PUTBATCH:\n");
        state.process_put_batch(b"PUTBATCH");

        let stats = state.stats();
        assert_eq!(stats.trace_errors, 3);
        assert_eq!(stats.protocol_errors, 1);

        worker.shutdown();
    }

    #[test]
    fn http_responses_update_counters() {
        let (state, worker) = state(TraceCodec::Json);
        let response = |status: u16, body: &'static str| HttpResponse {
            status,
            reason: String::new(),
            headers: Vec::new(),
            body: Bytes::from_static(body.as_bytes()),
        };

        state.process_http(&response(204, ""));
        state.process_http(&response(200, r#"{"success":4,"failed":0}"#));
        assert_eq!(state.stats().trace_errors, 0);
        assert_eq!(state.stats().send_errors, 0);

        state.process_http(&response(400, r#"{"success":1,"failed":3,"errors":[]}"#));
        assert_eq!(state.stats().trace_errors, 3);

        state.process_http(&response(500, "internal error"));
        state.process_http(&response(400, r#"{"error":{"code":400}}"#));
        assert_eq!(state.stats().send_errors, 2);

        worker.shutdown();
    }

    #[test]
    fn summary_failures() {
        let cases = [
            (r#"{"success":5}"#, 0),
            (r#"{"failed":1,"errors":5}"#, 1),
            (r#"{"errors":3}"#, 3),
            (r#"{"errors":[{"error":"x"},{"error":"y"}]}"#, 2),
        ];

        for (input, expected) in cases {
            let summary: PutSummary = serde_json::from_str(input).unwrap();
            assert_eq!(summary.failures(), expected, "input: {input}");
        }
    }

    #[test]
    fn server_stats_are_traced_back() {
        let (state, worker) = state(TraceCodec::Put);

        state.process_stats(
            b"STATS:\nSTATS\r\ntsd.rpc.received 1000 5 host=tsd type=put\n\ntsd.uptime 1000 12.5 host=tsd\nbogus\n",
        );

        let stats = state.stats();
        assert_eq!(stats.stats_traced, 2);
        assert_eq!(stats.points_traced, 2);
        assert_eq!(stats.invalid_points, 1);

        worker.shutdown();
    }

    #[test]
    fn identity_is_validated() {
        let (state, worker) = state(TraceCodec::Put);

        assert!(state.set_identity("bad host", "app").is_err());
        state.set_identity(" web2 ", "svc").unwrap();
        assert_eq!(state.identity(), Identity { host: "web2".to_string(), app: "svc".to_string() });

        state.trace(5, "m", 1, NO_TAGS).unwrap();
        assert_eq!(state.print_current_buffer(), "put m 5 1 app=svc host=web2\n");

        worker.shutdown();
    }
}
