use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::{command::ProtocolError, transport::http::HttpResponseDecoder};

const MAX_LINE_LEN: usize = 64 * 1024;

/// A decoded HTTP response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,

    /// Reason phrase.
    pub reason: String,

    /// Headers, in the order they were received.
    pub headers: Vec<(String, String)>,

    /// Body, already decompressed if it was gzip-encoded.
    pub body: Bytes,
}

impl HttpResponse {
    /// Returns the value of the first header matching `name`, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }

    /// Returns `true` if the status code is in the 2xx range.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A response received from the server.
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    /// Raw bytes that could not be decoded any further.
    Bytes(Bytes),

    /// One or more complete lines of text, without terminators.
    Lines(Vec<String>),

    /// A complete HTTP response.
    Http(HttpResponse),

    /// A single datagram.
    Datagram(Bytes),
}

/// Receives decoded responses.
///
/// Callbacks run on the I/O thread, so they must hand off anything more expensive than bookkeeping.
pub trait ResponseCallback: Send + Sync {
    /// Handles a decoded response.
    fn on_response(&self, response: Response);
}

enum Decoder {
    Lines(BytesMut),
    Http(HttpResponseDecoder),
    Datagram,
}

/// Turns bytes read from a connection into [`Response`]s and hands them to a callback.
pub struct InboundHandler {
    decoder: Decoder,
    callback: Arc<dyn ResponseCallback>,
}

impl InboundHandler {
    pub(crate) fn lines(callback: Arc<dyn ResponseCallback>) -> Self {
        Self { decoder: Decoder::Lines(BytesMut::new()), callback }
    }

    pub(crate) fn http(gzip: bool, callback: Arc<dyn ResponseCallback>) -> Self {
        Self { decoder: Decoder::Http(HttpResponseDecoder::new(gzip)), callback }
    }

    pub(crate) fn datagram(callback: Arc<dyn ResponseCallback>) -> Self {
        Self { decoder: Decoder::Datagram, callback }
    }

    /// Feeds bytes read from the connection.
    ///
    /// For datagram transports, `data` must be exactly one datagram.
    ///
    /// # Errors
    ///
    /// If the data cannot be framed, an error is returned and any partially-buffered input is discarded.
    pub fn on_read(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        match &mut self.decoder {
            Decoder::Datagram => {
                self.callback.on_response(Response::Datagram(Bytes::copy_from_slice(data)));
                Ok(())
            }
            Decoder::Http(decoder) => {
                let responses = decoder.decode(data)?;
                for response in responses {
                    self.callback.on_response(Response::Http(response));
                }
                Ok(())
            }
            Decoder::Lines(buf) => {
                buf.extend_from_slice(data);

                let mut lines = Vec::new();
                while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let raw = buf.split_to(pos + 1).freeze();
                    match std::str::from_utf8(&raw) {
                        Ok(line) if line.trim().is_empty() => {}
                        Ok(line) => lines.push(line.trim().to_string()),
                        Err(_) => self.callback.on_response(Response::Bytes(raw)),
                    }
                }

                if buf.len() > MAX_LINE_LEN {
                    buf.clear();
                    return Err(ProtocolError::LineTooLong { limit: MAX_LINE_LEN });
                }

                if !lines.is_empty() {
                    self.callback.on_response(Response::Lines(lines));
                }
                Ok(())
            }
        }
    }

    /// Discards any partially-decoded input, such as after a reconnect.
    pub fn reset(&mut self) {
        match &mut self.decoder {
            Decoder::Lines(buf) => buf.clear(),
            Decoder::Http(decoder) => decoder.reset(),
            Decoder::Datagram => {}
        }
    }
}
