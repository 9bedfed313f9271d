//! A client for batching data points and sending them to an [OpenTSDB][otsdb]-compatible server.
//!
//! [otsdb]: http://opentsdb.net/
//!
//! # Usage
//!
//! ```no_run
//! # use opentsdb_client::{ClientBuilder, TraceCodec};
//! // First, create a builder.
//! //
//! // The builder configures where data points go, how they are encoded, and how flushes behave.
//! let client = ClientBuilder::default()
//!     .with_remote_address("tcp://tsdb.local:4242")
//!     .expect("failed to parse remote address")
//!     .with_codec(TraceCodec::Put)
//!     .build()
//!     .expect("failed to connect");
//!
//! // Data points are validated and encoded into the current batch right away, from any thread.
//! client.trace("sys.cpu.user", 42, [("cpu", "0")]).expect("invalid data point");
//! client.trace_at(1_700_000_000_000, "sys.mem.free", 1.5e9, [("host", "web01")]).expect("invalid data point");
//!
//! // Flushing sends the batch, and by default waits for the server to acknowledge it.
//! client.flush().expect("failed to flush");
//! ```
//!
//! # Features
//!
//! ## Codecs
//!
//! Data points can be sent as `put` lines, as a `PUTBATCH` command of plain text records, as a JSON array posted to the
//! HTTP `/api/put` endpoint, or as a `PUTBATCHJSON` command of newline-delimited JSON documents. See [`TraceCodec`].
//!
//! ## Transports
//!
//! TCP, Unix domain sockets in `SOCK_STREAM` mode, and UDP are supported. Over UDP, batches are split into datagrams
//! that each stand on their own, optionally gzip compressed, and batches are flushed before they would outgrow a
//! single datagram.
//!
//! ## Identity
//!
//! Data points that carry neither a `host` nor an `app` tag are tagged with both, using the host name of the machine
//! and the name of the running executable unless configured otherwise.
//!
//! ## Server statistics
//!
//! Over UDP, the client can ask the server for its own statistics, which come back as data points and are traced
//! straight back through the client.
//!
//! ## Telemetry
//!
//! The client keeps counters of its own operation, available from [`Client::stats`]. When enabled, the same events are
//! also emitted through the [`metrics`] facade, under the `opentsdb.client` namespace.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::struct_excessive_bools)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

pub mod buffer;
pub mod codec;
pub mod command;
pub mod point;
pub use self::point::{DataPoint, ParseError, Tags, TimeUnit, Value};

mod builder;
pub use self::builder::{BuildError, ClientBuilder};

mod client;
pub use self::client::Client;

mod framer;
pub use self::framer::{DatagramFramer, Frames};

mod state;
pub use self::state::{FlushError, TraceError};

mod telemetry;
pub use self::telemetry::ClientStats;

mod transport;
pub use self::transport::RemoteAddr;

pub(crate) mod util;
pub use self::util::localhost::Identity;
pub use self::util::spinlock::{RawSpinLock, SpinLock, SpinLockGuard};

mod validate;
pub use self::validate::{validate_string, ValidationError};

mod worker;

pub use self::codec::{CodecError, TraceCodec};
pub use self::command::{Command, ProtocolError};
