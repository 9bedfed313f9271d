use std::{net::SocketAddr, sync::Arc, time::Duration};

use thiserror::Error;
use tracing::info;

use crate::{
    buffer::BufferManager,
    client::Client,
    codec::{Codec, ResponseCallback, TraceCodec},
    framer::DatagramFramer,
    point::TimeUnit,
    state::{State, StateConfiguration, StateEvents},
    transport::{self, RemoteAddr, TransportConfiguration},
    util::localhost::Identity,
    validate::{validate_string, ValidationError},
    worker::Worker,
};

const DEFAULT_PORT: u16 = 4242;
const DEFAULT_TRACE_BUFFER_SIZE: usize = 2048;
const DEFAULT_MAX_DATAGRAM_LEN: usize = 2048;
const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_PENDING_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that could occur while building a client.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Failed to parse the remote address.
    #[error("invalid remote address: {reason}")]
    InvalidRemoteAddress {
        /// Details about the parsing failure.
        reason: String,
    },

    /// The codec cannot be carried by the transport.
    #[error("codec '{codec}' cannot be sent over the {transport} transport")]
    IncompatibleCodec {
        /// The configured codec.
        codec: TraceCodec,

        /// Transport ID of the remote address.
        transport: &'static str,
    },

    /// The maximum datagram length is too small to hold any record.
    #[error("maximum datagram length of {len} bytes is too small (minimum is {min} bytes)")]
    InvalidDatagramSize {
        /// The configured length.
        len: usize,

        /// The smallest length allowed.
        min: usize,
    },

    /// The host or app override is not a valid tag value.
    #[error("invalid identity: {0}")]
    InvalidIdentity(#[source] ValidationError),

    /// Failed to connect to the server.
    #[error("failed to connect to {address}: {source}")]
    Connect {
        /// The address that could not be reached.
        address: String,

        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to spawn a background thread.
    #[error("failed to spawn background thread for client")]
    Backend,
}

/// Builder for a [`Client`].
pub struct ClientBuilder {
    remote_addr: RemoteAddr,
    codec: TraceCodec,
    time_unit: TimeUnit,
    buffers: Option<Arc<BufferManager>>,
    pooled: bool,
    trace_buffer_size: usize,
    gzip: bool,
    synchronous: bool,
    flush_timeout: Duration,
    pending_flush_timeout: Duration,
    connect_timeout: Duration,
    max_datagram_len: usize,
    telemetry: bool,
    host: Option<String>,
    app: Option<String>,
}

impl ClientBuilder {
    /// Set the remote address to send data points to.
    ///
    /// A plain `<host>:<port>` address is reached over TCP. Otherwise, the address is in the format of
    /// `<scheme>://<address>`, where the scheme is one of `tcp`, `udp`, or `unix`. For `unix`, the address is the path
    /// to a stream (`SOCK_STREAM`) socket.
    ///
    /// Defaults to `127.0.0.1:4242` over TCP.
    ///
    /// # Errors
    ///
    /// If the given address is not able to be parsed as a valid address, an error will be returned indicating the
    /// reason.
    pub fn with_remote_address<A>(mut self, addr: A) -> Result<Self, BuildError>
    where
        A: AsRef<str>,
    {
        self.remote_addr = RemoteAddr::try_from(addr.as_ref())
            .map_err(|reason| BuildError::InvalidRemoteAddress { reason })?;
        Ok(self)
    }

    /// Set the wire format of data points.
    ///
    /// [`TraceCodec::Json`] is sent as the body of HTTP requests to `/api/put`, so it requires a stream transport. UDP
    /// can only carry [`TraceCodec::Text`] and [`TraceCodec::JsonText`], whose batches start with a command line.
    ///
    /// Defaults to [`TraceCodec::Json`].
    #[must_use]
    pub fn with_codec(mut self, codec: TraceCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Set the unit of timestamps for data points traced without one.
    ///
    /// Defaults to milliseconds.
    #[must_use]
    pub fn with_time_unit(mut self, time_unit: TimeUnit) -> Self {
        self.time_unit = time_unit;
        self
    }

    /// Sets whether or not batch buffers are pooled and reused once sent.
    ///
    /// Defaults to `true`.
    #[must_use]
    pub fn with_pooled_buffers(mut self, pooled: bool) -> Self {
        self.pooled = pooled;
        self
    }

    /// Use the given buffer manager, which may be shared between clients.
    ///
    /// Overrides [`with_pooled_buffers`](Self::with_pooled_buffers).
    #[must_use]
    pub fn with_buffer_manager(mut self, buffers: Arc<BufferManager>) -> Self {
        self.buffers = Some(buffers);
        self
    }

    /// Set the initial size, in bytes, of each batch buffer.
    ///
    /// Buffers grow as needed, so this only avoids reallocations for batches of a predictable size.
    ///
    /// Defaults to 2048 bytes.
    #[must_use]
    pub fn with_trace_buffer_size(mut self, size: usize) -> Self {
        self.trace_buffer_size = size;
        self
    }

    /// Sets whether or not payloads are gzip compressed.
    ///
    /// Over UDP, every datagram is compressed on its own. Over HTTP, the request body is compressed as a whole, and
    /// compressed responses are accepted. The other codecs over TCP or a Unix socket write a single gzip stream per
    /// connection, sync-flushed after every batch so the server can decode each batch as it arrives.
    ///
    /// Defaults to `false`.
    #[must_use]
    pub fn with_gzip(mut self, gzip: bool) -> Self {
        self.gzip = gzip;
        self
    }

    /// Sets whether or not flushes wait for the server to acknowledge the batch.
    ///
    /// Waiting applies backpressure to producers, but each flush costs a round trip.
    ///
    /// Defaults to `true`.
    #[must_use]
    pub fn with_synchronous_flush(mut self, synchronous: bool) -> Self {
        self.synchronous = synchronous;
        self
    }

    /// Set how long a synchronous flush waits for the server to acknowledge the batch.
    ///
    /// Defaults to 5 seconds.
    #[must_use]
    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    /// Set how long a flush waits for an earlier, unacknowledged flush before superseding it.
    ///
    /// Defaults to 2 seconds.
    #[must_use]
    pub fn with_pending_flush_timeout(mut self, timeout: Duration) -> Self {
        self.pending_flush_timeout = timeout;
        self
    }

    /// Set the timeout for connecting to the server over TCP.
    ///
    /// Defaults to 5 seconds.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the maximum length of a single datagram, when sending over UDP.
    ///
    /// Batches are flushed before they would outgrow a datagram, and a single record that cannot fit in a datagram is
    /// dropped. This should be no larger than the path MTU to the server, less IP and UDP headers.
    ///
    /// Defaults to 2048 bytes.
    #[must_use]
    pub fn with_maximum_datagram_length(mut self, max_datagram_len: usize) -> Self {
        self.max_datagram_len = max_datagram_len;
        self
    }

    /// Sets whether or not client telemetry is emitted through the `metrics` facade.
    ///
    /// Client counters are kept either way, and are available from [`Client::stats`].
    ///
    /// Defaults to `false`.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: bool) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Set the `host` tag injected into data points.
    ///
    /// Defaults to the host name of the machine.
    #[must_use]
    pub fn with_host<S: Into<String>>(mut self, host: S) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the `app` tag injected into data points.
    ///
    /// Defaults to the name of the running executable.
    #[must_use]
    pub fn with_app<S: Into<String>>(mut self, app: S) -> Self {
        self.app = Some(app.into());
        self
    }

    fn identity(&self) -> Result<Identity, BuildError> {
        let mut identity = Identity::resolve();
        if let Some(host) = &self.host {
            identity.host = validate_string("host", host).map_err(BuildError::InvalidIdentity)?.to_string();
        }
        if let Some(app) = &self.app {
            identity.app = validate_string("app", app).map_err(BuildError::InvalidIdentity)?.to_string();
        }
        Ok(identity)
    }

    fn validate(&self) -> Result<(), BuildError> {
        let transport = self.remote_addr.transport_id();
        let compatible = if self.remote_addr.is_datagram() {
            self.codec.has_command_header()
        } else {
            true
        };
        if !compatible {
            return Err(BuildError::IncompatibleCodec { codec: self.codec, transport });
        }

        let min = DatagramFramer::smallest_valid_frame();
        if self.remote_addr.is_datagram() && self.max_datagram_len < min {
            return Err(BuildError::InvalidDatagramSize { len: self.max_datagram_len, min });
        }

        Ok(())
    }

    /// Connects to the server and builds the client.
    ///
    /// An I/O thread is spawned to send batches and receive responses, along with a worker thread that handles
    /// responses.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, the server cannot be reached, or the background threads cannot be spawned, an
    /// error will be returned.
    pub fn build(self) -> Result<Client, BuildError> {
        self.validate()?;
        let identity = self.identity()?;

        let datagram = self.remote_addr.is_datagram();
        let transport_config = TransportConfiguration {
            remote_addr: self.remote_addr.clone(),
            connect_timeout: self.connect_timeout,
            compress_stream: self.gzip && !datagram && self.codec != TraceCodec::Json,
        };
        let connection = transport::connect(&transport_config).map_err(|source| BuildError::Connect {
            address: self.remote_addr.to_string(),
            source,
        })?;
        let local_addr = connection.local_addr();

        let worker = Worker::spawn("opentsdb-client-worker").map_err(|_| BuildError::Backend)?;
        let buffers = self.buffers.clone().unwrap_or_else(|| {
            Arc::new(if self.pooled { BufferManager::pooled() } else { BufferManager::unpooled() })
        });

        let state_config = StateConfiguration {
            codec: self.codec,
            time_unit: self.time_unit,
            synchronous: self.synchronous,
            flush_timeout: self.flush_timeout,
            pending_wait: self.pending_flush_timeout,
            trace_buffer_size: self.trace_buffer_size,
            gzip: self.gzip,
            max_datagram_len: datagram.then_some(self.max_datagram_len),
            host_header: self.remote_addr.host_header(),
            transport_id: self.remote_addr.transport_id(),
            telemetry: self.telemetry,
            identity,
        };
        let state = Arc::new(State::new(state_config, Arc::clone(&buffers), worker.handle()));
        let events = Arc::new(StateEvents(Arc::clone(&state)));
        let callback: Arc<dyn ResponseCallback> = events.clone();
        let inbound = Codec::new(self.codec).response_handler(datagram, self.gzip, callback);

        let io = match transport::spawn(transport_config, connection, events, inbound, buffers) {
            Ok(io) => io,
            Err(_) => {
                worker.shutdown();
                return Err(BuildError::Backend);
            }
        };
        state.attach(io.handle());

        info!(
            transport = self.remote_addr.transport_id(),
            codec = %self.codec,
            local_addr = ?local_addr,
            "Connected to server."
        );

        Ok(Client::new(state, io, worker, local_addr))
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        ClientBuilder {
            remote_addr: RemoteAddr::Tcp(vec![SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT))]),
            codec: TraceCodec::Json,
            time_unit: TimeUnit::Milliseconds,
            buffers: None,
            pooled: true,
            trace_buffer_size: DEFAULT_TRACE_BUFFER_SIZE,
            gzip: false,
            synchronous: true,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            pending_flush_timeout: DEFAULT_PENDING_FLUSH_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_datagram_len: DEFAULT_MAX_DATAGRAM_LEN,
            telemetry: false,
            host: None,
            app: None,
        }
    }
}
