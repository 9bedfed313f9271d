//! Wire formats for data points.
//!
//! Every format shares the same contract: an optional batch header written once per buffer, one record per data point,
//! and an optional tailer written when the buffer is retired. Which inbound decoder the transport should use also
//! depends on the format.
use std::{fmt, io, str::FromStr, sync::Arc};

use thiserror::Error;

use crate::{
    buffer::{SinkId, TraceBuffer},
    command::Command,
    point::{Tags, Value},
    validate::{check_encodable, ValidationError},
};

mod json;
mod response;
mod text;

use self::json::GeneratorCache;
pub use self::response::{HttpResponse, InboundHandler, Response, ResponseCallback};

const JSON_TEXT_HEADER: &[u8] = b"putbatchjson\n";
const TEXT_TAILER: &[u8] = b"\n";

/// Errors that could occur while encoding into a buffer.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The data point was rejected before encoding.
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    /// Writing to the buffer failed.
    #[error("failed to write to trace buffer: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization failed.
    #[error("failed to serialize data point: {0}")]
    Json(#[from] serde_json::Error),

    /// The JSON generator for the buffer was not in the state the operation required.
    #[error("JSON generator for sink {sink:?} is not {expected}")]
    GeneratorState {
        /// The buffer whose generator was in the wrong state.
        sink: SinkId,

        /// The state that was expected.
        expected: &'static str,
    },
}

/// Wire format used to encode data points.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TraceCodec {
    /// Telnet-style `put` lines, with no batch header or tailer.
    Put,

    /// Plain lines inside a `PUTBATCH` command.
    Text,

    /// A single JSON array, posted over HTTP.
    Json,

    /// One JSON document per line inside a `putbatchjson` command.
    JsonText,
}

impl TraceCodec {
    /// Returns the name of the codec.
    pub const fn name(self) -> &'static str {
        match self {
            TraceCodec::Put => "put",
            TraceCodec::Text => "text",
            TraceCodec::Json => "json",
            TraceCodec::JsonText => "jsontext",
        }
    }

    /// Returns `true` if the server answers each batch encoded with this codec.
    ///
    /// Telnet `put` lines are only answered on error, so there is nothing to wait for once the batch has been written.
    pub const fn acknowledged(self) -> bool {
        !matches!(self, TraceCodec::Put)
    }

    /// Returns `true` if batches in this codec begin with a command line, which lets them be framed into datagrams.
    pub const fn has_command_header(self) -> bool {
        matches!(self, TraceCodec::Text | TraceCodec::JsonText)
    }
}

impl fmt::Display for TraceCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TraceCodec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "put" | "telnet" => Ok(TraceCodec::Put),
            "text" => Ok(TraceCodec::Text),
            "json" => Ok(TraceCodec::Json),
            "jsontext" => Ok(TraceCodec::JsonText),
            other => Err(format!("unknown codec '{other}' (expected put, text, json, or jsontext)")),
        }
    }
}

/// A codec, along with the per-sink state the JSON formats need.
pub struct Codec {
    kind: TraceCodec,
    generators: GeneratorCache,
}

impl Codec {
    /// Creates a new `Codec` for the given wire format.
    pub fn new(kind: TraceCodec) -> Self {
        Self { kind, generators: GeneratorCache::default() }
    }

    /// Returns the wire format of this codec.
    pub const fn kind(&self) -> TraceCodec {
        self.kind
    }

    /// Writes the batch header.
    pub fn header(&self, sink: &mut TraceBuffer) -> Result<(), CodecError> {
        match self.kind {
            TraceCodec::Put => {}
            TraceCodec::Text => sink.extend_from_slice(Command::PutBatch.request_line()),
            TraceCodec::Json => self.generators.with_generator(sink.id(), |g| g.start_array(sink))?,
            TraceCodec::JsonText => sink.extend_from_slice(JSON_TEXT_HEADER),
        }

        Ok(())
    }

    /// Writes the batch tailer.
    ///
    /// For the JSON array format, this closes the array and marks the sink's generator as finished. The generator is
    /// only forgotten once [`invalidate`](Self::invalidate) is called for the sink.
    pub fn tailer(&self, sink: &mut TraceBuffer) -> Result<(), CodecError> {
        match self.kind {
            TraceCodec::Put | TraceCodec::JsonText => Ok(()),
            TraceCodec::Text => {
                sink.extend_from_slice(TEXT_TAILER);
                Ok(())
            }
            TraceCodec::Json => self.generators.with_generator(sink.id(), |g| g.end_array(sink)),
        }
    }

    /// Encodes a single data point.
    ///
    /// # Errors
    ///
    /// If the metric is empty or the tag set is empty, [`CodecError::Invalid`] is returned and nothing is written.
    pub fn encode<V>(
        &self,
        sink: &mut TraceBuffer,
        timestamp: i64,
        metric: &str,
        value: V,
        tags: &Tags,
    ) -> Result<(), CodecError>
    where
        V: Into<Value>,
    {
        check_encodable(metric, tags)?;

        let value = value.into();
        match self.kind {
            TraceCodec::Put => text::write_record(sink, true, timestamp, metric, value, tags),
            TraceCodec::Text => text::write_record(sink, false, timestamp, metric, value, tags),
            TraceCodec::Json | TraceCodec::JsonText => {
                let point = json::JsonPoint { metric: metric.trim(), timestamp, value, tags };
                self.generators.with_generator(sink.id(), |g| g.write_point(sink, &point))?;
            }
        }

        Ok(())
    }

    /// Forgets any encoder state held for the given sink.
    ///
    /// Must be called once a sink is retired, or its state is kept forever.
    pub fn invalidate(&self, sink: SinkId) {
        self.generators.invalidate(sink);
    }

    /// Returns the number of sinks with live encoder state.
    pub fn live_generators(&self) -> usize {
        self.generators.len()
    }

    /// Creates the inbound decoder appropriate for this codec and transport, wired to `callback`.
    pub fn response_handler(
        &self,
        datagram: bool,
        gzip: bool,
        callback: Arc<dyn ResponseCallback>,
    ) -> InboundHandler {
        if datagram {
            InboundHandler::datagram(callback)
        } else if self.kind == TraceCodec::Json {
            InboundHandler::http(gzip, callback)
        } else {
            InboundHandler::lines(callback)
        }
    }
}
