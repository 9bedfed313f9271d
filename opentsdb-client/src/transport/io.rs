use std::{
    collections::VecDeque,
    io::{self, Read as _, Write as _},
    net::{self as std_net, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

#[cfg(unix)]
use std::os::unix::net::UnixStream as StdUnixStream;

use bytes::{Buf as _, Bytes};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use flate2::{write::GzEncoder, Compression};
use mio::{
    net::{TcpStream, UdpSocket},
    Events, Interest, Poll, Registry, Token, Waker,
};
use tracing::{debug, error, info, trace, warn};

#[cfg(unix)]
use mio::net::UnixStream;

use super::{RemoteAddr, TransportConfiguration};
use crate::{buffer::BufferManager, codec::InboundHandler, command::ProtocolError};

const WAKER: Token = Token(0);
const CONNECTION: Token = Token(1);

const READ_BUFFER_LEN: usize = 64 * 1024;

// Commands sent outside of a batch are not tracked.
const UNTRACKED: u64 = 0;

/// Work handed to the I/O thread.
pub(crate) enum Outbound {
    /// A flushed batch, already split into the chunks to write.
    ///
    /// On a datagram transport, each chunk is sent as one datagram.
    Batch { chunks: Vec<Bytes>, points: u64 },

    /// A standalone command, such as a stats request.
    Command(Bytes),

    /// Stop the I/O thread.
    Shutdown,
}

/// What was written for a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct WriteReceipt {
    pub points: u64,
    pub bytes: usize,
    pub frames: usize,
}

/// Notifications from the I/O thread.
///
/// These are called on the I/O thread itself, so they must never block.
pub(crate) trait TransportEvents: Send + Sync {
    /// A batch was fully written, or could not be.
    fn on_write_complete(&self, result: io::Result<WriteReceipt>);

    /// The connection to the server was lost.
    fn on_disconnected(&self);

    /// Data from the server could not be decoded.
    fn on_protocol_error(&self, error: &ProtocolError);
}

/// A connection to the server.
pub(crate) enum Connection {
    Tcp(TcpStream),
    Udp(UdpSocket),

    #[cfg(unix)]
    Unix(UnixStream),
}

/// Connects to the configured server.
///
/// Connecting blocks, bounded by the connect timeout for TCP. The resulting connection is non-blocking.
pub(crate) fn connect(config: &TransportConfiguration) -> io::Result<Connection> {
    match &config.remote_addr {
        RemoteAddr::Tcp(addrs) => {
            let stream = connect_tcp(addrs, config.connect_timeout)?;
            stream.set_nodelay(true)?;
            stream.set_nonblocking(true)?;
            Ok(Connection::Tcp(TcpStream::from_std(stream)))
        }
        RemoteAddr::Udp(addrs) => {
            let target = addrs
                .first()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address to connect to"))?;
            let bind_addr = if target.is_ipv4() {
                SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
            } else {
                SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
            };

            let socket = std_net::UdpSocket::bind(bind_addr)?;
            socket.connect(&addrs[..])?;
            socket.set_nonblocking(true)?;
            Ok(Connection::Udp(UdpSocket::from_std(socket)))
        }
        #[cfg(unix)]
        RemoteAddr::Unix(path) => {
            let stream = StdUnixStream::connect(path)?;
            stream.set_nonblocking(true)?;
            Ok(Connection::Unix(UnixStream::from_std(stream)))
        }
    }
}

fn connect_tcp(addrs: &[SocketAddr], timeout: Duration) -> io::Result<std_net::TcpStream> {
    let mut last_error = None;
    for addr in addrs {
        match std_net::TcpStream::connect_timeout(addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }

    Err(last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address to connect to")))
}

impl Connection {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Connection::Tcp(stream) => stream.local_addr().ok(),
            Connection::Udp(socket) => socket.local_addr().ok(),
            #[cfg(unix)]
            Connection::Unix(_) => None,
        }
    }

    const fn is_datagram(&self) -> bool {
        matches!(self, Connection::Udp(_))
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Connection::Tcp(stream) => stream.write(buf),
            Connection::Udp(socket) => socket.send(buf),
            #[cfg(unix)]
            Connection::Unix(stream) => stream.write(buf),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Connection::Tcp(stream) => stream.read(buf),
            Connection::Udp(socket) => socket.recv(buf),
            #[cfg(unix)]
            Connection::Unix(stream) => stream.read(buf),
        }
    }

    fn register(&mut self, registry: &Registry) -> io::Result<()> {
        let interest = Interest::READABLE | Interest::WRITABLE;
        match self {
            Connection::Tcp(stream) => registry.register(stream, CONNECTION, interest),
            Connection::Udp(socket) => registry.register(socket, CONNECTION, interest),
            #[cfg(unix)]
            Connection::Unix(stream) => registry.register(stream, CONNECTION, interest),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Connection::Tcp(stream) => registry.deregister(stream),
            Connection::Udp(socket) => registry.deregister(socket),
            #[cfg(unix)]
            Connection::Unix(stream) => registry.deregister(stream),
        }
    }
}

enum ConnectionState {
    // The connection was lost, and will be re-established on the next write.
    Disconnected,

    // Connected and ready to send.
    Ready(Connection),
}

struct QueuedWrite {
    buf: Bytes,
    batch: u64,
    // Set once `buf` has gone through the connection's gzip stream.
    compressed: bool,
    // Present on the last chunk of a batch.
    receipt: Option<WriteReceipt>,
}

/// Hands work to the I/O thread.
#[derive(Clone)]
pub(crate) struct TransportHandle {
    tx: Sender<Outbound>,
    waker: Arc<Waker>,
}

impl TransportHandle {
    /// Queues `outbound` and wakes the I/O thread.
    ///
    /// # Errors
    ///
    /// If the I/O thread has stopped, an error is returned.
    pub fn send(&self, outbound: Outbound) -> io::Result<()> {
        self.tx
            .send(outbound)
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "transport has shut down"))?;
        self.waker.wake()
    }
}

/// The running I/O thread.
pub(crate) struct IoThread {
    handle: TransportHandle,
    thread: JoinHandle<()>,
}

impl IoThread {
    pub fn handle(&self) -> TransportHandle {
        self.handle.clone()
    }

    /// Stops the I/O thread and waits for it to exit.
    pub fn shutdown(self) {
        if self.handle.send(Outbound::Shutdown).is_err() {
            debug!("I/O thread already stopped.");
        }

        if self.thread.join().is_err() {
            error!("I/O thread panicked.");
        }
    }
}

/// Spawns the I/O thread for an established connection.
pub(crate) fn spawn(
    config: TransportConfiguration,
    mut connection: Connection,
    events: Arc<dyn TransportEvents>,
    inbound: InboundHandler,
    allocator: Arc<BufferManager>,
) -> io::Result<IoThread> {
    let poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
    connection.register(poll.registry())?;

    let (tx, rx) = unbounded();
    let reactor = Reactor {
        poll,
        config,
        rx,
        events,
        inbound,
        allocator,
        state: ConnectionState::Ready(connection),
        queue: VecDeque::new(),
        read_buf: vec![0; READ_BUFFER_LEN],
        encoder: None,
        next_batch: UNTRACKED,
    };

    let thread = thread::Builder::new().name("opentsdb-client-io".to_string()).spawn(move || reactor.run())?;

    Ok(IoThread { handle: TransportHandle { tx, waker }, thread })
}

struct Reactor {
    poll: Poll,
    config: TransportConfiguration,
    rx: Receiver<Outbound>,
    events: Arc<dyn TransportEvents>,
    inbound: InboundHandler,
    allocator: Arc<BufferManager>,
    state: ConnectionState,
    queue: VecDeque<QueuedWrite>,
    read_buf: Vec<u8>,
    encoder: Option<GzEncoder<Vec<u8>>>,
    next_batch: u64,
}

impl Reactor {
    fn run(mut self) {
        let mut events = Events::with_capacity(64);
        loop {
            // All events -- outbound wake-ups and network I/O -- flow through here, so we can block without issue.
            if let Err(e) = self.poll.poll(&mut events, None) {
                if !interrupted(&e) {
                    error!(error = %e, "Error during poll.");
                }
                continue;
            }

            let mut shutdown = false;
            for event in events.iter() {
                match event.token() {
                    WAKER => shutdown |= self.drain_outbound(),
                    CONNECTION => {
                        if event.is_readable() || event.is_read_closed() {
                            self.drive_reads();
                        }
                        if event.is_writable() {
                            self.drive_writes();
                        }
                    }
                    _ => {}
                }
            }

            if shutdown {
                break;
            }
        }

        self.close();
    }

    /// Queues everything waiting on the channel, returning `true` if the thread should stop.
    fn drain_outbound(&mut self) -> bool {
        let mut shutdown = false;
        loop {
            match self.rx.try_recv() {
                Ok(Outbound::Batch { chunks, points }) => self.enqueue_batch(chunks, points),
                Ok(Outbound::Command(buf)) => {
                    self.queue.push_back(QueuedWrite { buf, batch: UNTRACKED, compressed: false, receipt: None });
                }
                Ok(Outbound::Shutdown) | Err(TryRecvError::Disconnected) => {
                    shutdown = true;
                    break;
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        self.drive_writes();
        shutdown
    }

    fn enqueue_batch(&mut self, chunks: Vec<Bytes>, points: u64) {
        let receipt = WriteReceipt { points, bytes: chunks.iter().map(Bytes::len).sum(), frames: chunks.len() };
        if chunks.is_empty() {
            self.events.on_write_complete(Ok(receipt));
            return;
        }

        self.next_batch += 1;
        let batch = self.next_batch;
        let last = chunks.len() - 1;
        for (i, buf) in chunks.into_iter().enumerate() {
            self.queue.push_back(QueuedWrite { buf, batch, compressed: false, receipt: (i == last).then_some(receipt) });
        }
        trace!(batch, points, bytes = receipt.bytes, "Queued batch.");
    }

    /// Reconnects if the connection was lost, returning `true` if it did.
    fn ensure_connected(&mut self) -> io::Result<bool> {
        if let ConnectionState::Disconnected = self.state {
            let mut connection = connect(&self.config)?;
            connection.register(self.poll.registry())?;
            self.inbound.reset();
            info!(transport = self.config.remote_addr.transport_id(), "Reconnected to server.");
            self.state = ConnectionState::Ready(connection);
            return Ok(true);
        }

        Ok(false)
    }

    fn disconnect(&mut self) {
        if let ConnectionState::Ready(mut connection) =
            std::mem::replace(&mut self.state, ConnectionState::Disconnected)
        {
            if let Err(e) = connection.deregister(self.poll.registry()) {
                debug!(error = %e, "Failed to deregister connection.");
            }
            // The next connection starts a new gzip stream.
            self.encoder = None;
            self.events.on_disconnected();
        }
    }

    fn drive_writes(&mut self) {
        while !self.queue.is_empty() {
            match self.ensure_connected() {
                // What is left of it belongs to the gzip stream of the previous connection.
                Ok(true) if self.queue.front().is_some_and(|w| w.compressed) => {
                    warn!("Dropping partially written batch after reconnecting.");
                    self.fail_front(io::ErrorKind::ConnectionReset.into());
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "Failed to reconnect to server.");
                    self.fail_front(e);
                    continue;
                }
            }

            if let Err(e) = self.compress_front() {
                error!(error = %e, "Failed to compress batch.");
                self.fail_front(e);
                continue;
            }

            let ConnectionState::Ready(connection) = &mut self.state else { return };
            let Some(front) = self.queue.front_mut() else { return };

            let datagram = connection.is_datagram();
            match connection.write(&front.buf) {
                // Zero write = server closed the connection.
                Ok(0) if !front.buf.is_empty() => {
                    warn!("Server closed the connection while writing.");
                    self.disconnect();
                    self.fail_front(io::ErrorKind::WriteZero.into());
                }
                Ok(n) if !datagram && n < front.buf.len() => {
                    // Keep the rest of the chunk at the front so batches are never interleaved.
                    front.buf.advance(n);
                    trace!(written = n, remaining = front.buf.len(), "Partial write.");
                }
                Ok(_) => {
                    if let Some(done) = self.queue.pop_front() {
                        self.complete(done);
                    }
                }
                Err(ref e) if would_block(e) => return,
                Err(ref e) if interrupted(e) => {}
                Err(e) => {
                    error!(error = %e, "Failed to write to server.");
                    if !datagram {
                        self.disconnect();
                    }
                    self.fail_front(e);
                }
            }
        }
    }

    /// Runs the write at the front of the queue through the connection's gzip stream, if the stream is compressed.
    ///
    /// Compressing only when a write reaches the front keeps the stream in the order bytes hit the wire.
    fn compress_front(&mut self) -> io::Result<()> {
        if !self.config.compress_stream {
            return Ok(());
        }
        let Some(front) = self.queue.front_mut().filter(|w| !w.compressed) else { return Ok(()) };

        let encoder = self.encoder.get_or_insert_with(|| GzEncoder::new(Vec::new(), Compression::default()));
        encoder.write_all(&front.buf)?;
        // A sync flush ends the batch on a boundary the server can decode up to.
        encoder.flush()?;

        let compressed = Bytes::from(std::mem::take(encoder.get_mut()));
        trace!(batch = front.batch, plain = front.buf.len(), compressed = compressed.len(), "Compressed batch.");
        self.allocator.release(std::mem::replace(&mut front.buf, compressed));
        front.compressed = true;
        Ok(())
    }

    fn complete(&mut self, done: QueuedWrite) {
        self.allocator.release(done.buf);
        if let Some(receipt) = done.receipt {
            trace!(batch = done.batch, bytes = receipt.bytes, "Batch written.");
            self.events.on_write_complete(Ok(receipt));
        }
    }

    /// Drops whatever remains of the batch at the front of the queue.
    fn fail_front(&mut self, error: io::Error) {
        let Some(batch) = self.queue.front().map(|w| w.batch) else { return };

        while self.queue.front().is_some_and(|w| w.batch == batch) {
            if let Some(dropped) = self.queue.pop_front() {
                self.allocator.release(dropped.buf);
            }
            if batch == UNTRACKED {
                break;
            }
        }

        if batch != UNTRACKED {
            self.events.on_write_complete(Err(error));
        }
    }

    fn drive_reads(&mut self) {
        loop {
            let ConnectionState::Ready(connection) = &mut self.state else { return };

            let datagram = connection.is_datagram();
            match connection.read(&mut self.read_buf) {
                Ok(0) if !datagram => {
                    info!("Server closed the connection.");
                    self.disconnect();
                    return;
                }
                Ok(n) => {
                    if let Err(e) = self.inbound.on_read(&self.read_buf[..n]) {
                        warn!(error = %e, "Discarding undecodable response.");
                        self.events.on_protocol_error(&e);
                    }
                }
                Err(ref e) if would_block(e) => return,
                Err(ref e) if interrupted(e) => {}
                Err(e) if datagram => {
                    // Typically a port-unreachable notice for an earlier send.
                    debug!(error = %e, "Datagram receive failed.");
                }
                Err(e) => {
                    error!(error = %e, "Failed to read from server.");
                    self.disconnect();
                    return;
                }
            }
        }
    }

    fn close(&mut self) {
        // Give anything already queued one last chance to go out.
        if matches!(self.state, ConnectionState::Ready(_)) {
            self.drive_writes();
        }

        while !self.queue.is_empty() {
            self.fail_front(io::Error::new(io::ErrorKind::NotConnected, "transport shut down"));
        }

        self.disconnect();
        debug!("I/O thread stopped.");
    }
}

fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

fn interrupted(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Interrupted
}
