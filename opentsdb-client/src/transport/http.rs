//! Just enough HTTP/1.1 to post batches and read back the server's replies.
//!
//! Response heads and chunk sizes are parsed with `httparse`, directly off the bytes the I/O thread reads.
use std::io::{Read as _, Write as _};

use bytes::{Buf as _, Bytes, BytesMut};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use httparse::Status;

use crate::{codec::HttpResponse, command::ProtocolError};

/// Path batches are posted to. `details` asks the server to report per-point errors.
pub const PUT_PATH: &str = "/api/put?details";

const MAX_HEAD_LEN: usize = 16 * 1024;

/// Builds the request head for posting a JSON batch of `content_length` bytes.
///
/// With `gzip`, the body is declared as gzip-encoded and gzip-encoded responses are accepted.
pub fn request_head(host: &str, content_length: usize, gzip: bool) -> Bytes {
    let mut head = BytesMut::with_capacity(192);
    head.extend_from_slice(b"POST ");
    head.extend_from_slice(PUT_PATH.as_bytes());
    head.extend_from_slice(b" HTTP/1.1\r\nHost: ");
    head.extend_from_slice(host.as_bytes());
    head.extend_from_slice(b"\r\nContent-Type: application/json\r\nContent-Length: ");
    head.extend_from_slice(itoa::Buffer::new().format(content_length).as_bytes());
    head.extend_from_slice(b"\r\n");
    if gzip {
        head.extend_from_slice(b"Content-Encoding: gzip\r\nAccept-Encoding: gzip\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head.freeze()
}

/// Largest response body accepted, before or after decompression.
pub const MAX_BODY_LEN: usize = 1024 * 1024;

const MAX_HEADERS: usize = 64;

#[derive(Clone, Copy)]
enum BodyKind {
    Length(usize),
    Chunked,
}

struct Head {
    status: u16,
    reason: String,
    headers: Vec<(String, String)>,
    body: BodyKind,
    gzip_body: bool,
}

/// Compresses a request body.
pub fn gzip_body(body: &[u8]) -> std::io::Result<Bytes> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2 + 32), Compression::default());
    encoder.write_all(body)?;
    encoder.finish().map(Bytes::from)
}

/// Incrementally decodes HTTP responses from a byte stream.
pub struct HttpResponseDecoder {
    buf: BytesMut,
    head: Option<Head>,
    gzip: bool,
}

impl HttpResponseDecoder {
    /// Creates a new `HttpResponseDecoder`.
    ///
    /// When `gzip` is `true`, gzip-encoded bodies are decompressed.
    pub fn new(gzip: bool) -> Self {
        Self { buf: BytesMut::new(), head: None, gzip }
    }

    /// Discards any partially-decoded response.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.head = None;
    }

    /// Feeds bytes from the stream, returning every response completed by them.
    ///
    /// # Errors
    ///
    /// If the stream does not contain a valid response, or a body is larger than [`MAX_BODY_LEN`], an error is
    /// returned and the decoder is reset.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<HttpResponse>, ProtocolError> {
        self.buf.extend_from_slice(data);

        let result = self.drain();
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn drain(&mut self) -> Result<Vec<HttpResponse>, ProtocolError> {
        let mut responses = Vec::new();
        loop {
            if self.head.is_none() {
                let Some((len, head)) = parse_head(&self.buf)? else {
                    if self.buf.len() > MAX_HEAD_LEN {
                        return Err(ProtocolError::MalformedHttp("response head too large".to_string()));
                    }
                    break;
                };

                self.buf.advance(len);
                self.head = Some(head);
            }

            let Some(kind) = self.head.as_ref().map(|head| head.body) else { break };
            let body = match kind {
                BodyKind::Length(len) => {
                    if self.buf.len() < len {
                        break;
                    }
                    self.buf.split_to(len).freeze()
                }
                BodyKind::Chunked => match take_chunked(&mut self.buf)? {
                    Some(body) => body,
                    None => break,
                },
            };

            let Some(head) = self.head.take() else { break };
            let body = if self.gzip && head.gzip_body { gunzip(&body)? } else { body };
            responses.push(HttpResponse { status: head.status, reason: head.reason, headers: head.headers, body });
        }

        Ok(responses)
    }
}

fn malformed(e: &httparse::Error) -> ProtocolError {
    ProtocolError::MalformedHttp(e.to_string())
}

/// Parses a response head off the front of `buf`, returning its length, or `None` if it has not fully arrived yet.
fn parse_head(buf: &[u8]) -> Result<Option<(usize, Head)>, ProtocolError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    let len = match response.parse(buf).map_err(|e| malformed(&e))? {
        Status::Complete(len) => len,
        Status::Partial => return Ok(None),
    };

    let mut body = BodyKind::Length(0);
    let mut gzip_body = false;
    let mut parsed = Vec::with_capacity(response.headers.len());
    for header in response.headers.iter() {
        let value = String::from_utf8_lossy(header.value).trim().to_string();

        if header.name.eq_ignore_ascii_case("content-length") {
            let content_length = value
                .parse::<usize>()
                .map_err(|_| ProtocolError::MalformedHttp(format!("invalid content length '{value}'")))?;
            if content_length > MAX_BODY_LEN {
                return Err(ProtocolError::BodyTooLarge { limit: MAX_BODY_LEN });
            }
            if matches!(body, BodyKind::Length(_)) {
                body = BodyKind::Length(content_length);
            }
        } else if header.name.eq_ignore_ascii_case("transfer-encoding") && value.to_ascii_lowercase().contains("chunked")
        {
            body = BodyKind::Chunked;
        } else if header.name.eq_ignore_ascii_case("content-encoding") {
            gzip_body = value.eq_ignore_ascii_case("gzip");
        }

        parsed.push((header.name.to_string(), value));
    }

    let head = Head {
        status: response.code.unwrap_or_default(),
        reason: response.reason.unwrap_or_default().to_string(),
        headers: parsed,
        body,
        gzip_body,
    };
    Ok(Some((len, head)))
}

/// Takes a complete chunked body off the front of `buf`, or returns `None` if it has not fully arrived yet.
fn take_chunked(buf: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
    let mut pos = 0;
    let mut body = BytesMut::new();
    loop {
        let (line_len, size) = match httparse::parse_chunk_size(&buf[pos..]) {
            Ok(Status::Complete(parsed)) => parsed,
            Ok(Status::Partial) => return Ok(None),
            Err(_) => return Err(ProtocolError::MalformedHttp("invalid chunk size".to_string())),
        };
        pos += line_len;

        let size = usize::try_from(size).unwrap_or(usize::MAX);
        if size > MAX_BODY_LEN - body.len() {
            return Err(ProtocolError::BodyTooLarge { limit: MAX_BODY_LEN });
        }

        if size == 0 {
            // Trailers, if any, end with an empty line.
            let mut trailers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            match httparse::parse_headers(&buf[pos..], &mut trailers).map_err(|e| malformed(&e))? {
                Status::Complete((len, _)) => pos += len,
                Status::Partial => return Ok(None),
            }
            buf.advance(pos);
            return Ok(Some(body.freeze()));
        }

        if buf.len() < pos + size + 2 {
            return Ok(None);
        }
        if &buf[pos + size..pos + size + 2] != b"\r\n" {
            return Err(ProtocolError::MalformedHttp("chunk not terminated by CRLF".to_string()));
        }
        body.extend_from_slice(&buf[pos..pos + size]);
        pos += size + 2;
    }
}

fn gunzip(body: &[u8]) -> Result<Bytes, ProtocolError> {
    let mut decoded = Vec::new();
    GzDecoder::new(body)
        .take(MAX_BODY_LEN as u64 + 1)
        .read_to_end(&mut decoded)
        .map_err(|e| ProtocolError::MalformedHttp(format!("invalid gzip body: {e}")))?;
    if decoded.len() > MAX_BODY_LEN {
        return Err(ProtocolError::BodyTooLarge { limit: MAX_BODY_LEN });
    }
    Ok(decoded.into())
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use flate2::{write::GzEncoder, Compression};

    use super::{request_head, HttpResponseDecoder, MAX_BODY_LEN};
    use crate::command::ProtocolError;

    const SUMMARY: &str = r#"{"success":2,"failed":0,"errors":[]}"#;

    fn gzipped(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn request_heads() {
        let cases = [
            (
                false,
                "POST /api/put?details HTTP/1.1\r\nHost: tsdb:4242\r\nContent-Type: application/json\r\nContent-Length: 17\r\n\r\n",
            ),
            (
                true,
                "POST /api/put?details HTTP/1.1\r\nHost: tsdb:4242\r\nContent-Type: application/json\r\nContent-Length: 17\r\nContent-Encoding: gzip\r\nAccept-Encoding: gzip\r\n\r\n",
            ),
        ];

        for (gzip, expected) in cases {
            assert_eq!(&request_head("tsdb:4242", 17, gzip)[..], expected.as_bytes());
        }
    }

    #[test]
    fn content_length_response_across_reads() {
        let raw = format!("HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{SUMMARY}", SUMMARY.len());
        let (first, second) = raw.as_bytes().split_at(40);

        let mut decoder = HttpResponseDecoder::new(false);
        assert!(decoder.decode(first).unwrap().is_empty());

        let responses = decoder.decode(second).unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status, 200);
        assert_eq!(responses[0].reason, "OK");
        assert!(responses[0].is_success());
        assert_eq!(responses[0].header("content-type"), Some("application/json"));
        assert_eq!(&responses[0].body[..], SUMMARY.as_bytes());
    }

    #[test]
    fn pipelined_responses() {
        let raw = "HTTP/1.1 204 No Content\r\n\r\nHTTP/1.1 400 Bad Request\r\nContent-Length: 2\r\n\r\n{}";

        let mut decoder = HttpResponseDecoder::new(false);
        let responses = decoder.decode(raw.as_bytes()).unwrap();

        assert_eq!(responses.iter().map(|r| r.status).collect::<Vec<_>>(), vec![204, 400]);
        assert!(responses[0].body.is_empty());
        assert!(!responses[1].is_success());
    }

    #[test]
    fn chunked_response() {
        let raw = "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n7;ext=1\r\n, world\r\n0\r\n\r\n";
        let (first, second) = raw.as_bytes().split_at(raw.len() - 3);

        let mut decoder = HttpResponseDecoder::new(false);
        assert!(decoder.decode(first).unwrap().is_empty());

        let responses = decoder.decode(second).unwrap();
        assert_eq!(&responses[0].body[..], b"hello, world");
    }

    #[test]
    fn gzip_bodies() {
        let body = gzipped(SUMMARY.as_bytes());
        let mut raw = format!("HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n", body.len()).into_bytes();
        raw.extend_from_slice(&body);

        let mut decoder = HttpResponseDecoder::new(true);
        let responses = decoder.decode(&raw).unwrap();
        assert_eq!(&responses[0].body[..], SUMMARY.as_bytes());

        let mut decoder = HttpResponseDecoder::new(false);
        let responses = decoder.decode(&raw).unwrap();
        assert_eq!(&responses[0].body[..], &body[..]);
    }

    #[test]
    fn malformed_responses() {
        let cases: [&[u8]; 6] = [
            b"SMTP 220 hello\r\n\r\n",
            b"HTTP/1.1 abc OK\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nno-colon\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nContent-Length: lots\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n",
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nabcd\r\n",
        ];

        for raw in cases {
            let mut decoder = HttpResponseDecoder::new(false);
            assert!(matches!(decoder.decode(raw), Err(ProtocolError::MalformedHttp(_))));
        }
    }

    #[test]
    fn oversized_bodies_are_rejected() {
        let declared = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", MAX_BODY_LEN + 1);
        let chunked = format!("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n{:x}\r\n", MAX_BODY_LEN + 1);
        let too_large = ProtocolError::BodyTooLarge { limit: MAX_BODY_LEN };

        for raw in [declared, chunked] {
            let mut decoder = HttpResponseDecoder::new(false);
            assert_eq!(decoder.decode(raw.as_bytes()).err(), Some(too_large.clone()));

            // The decoder starts over after the failure.
            let responses = decoder.decode(b"HTTP/1.1 204 No Content\r\n\r\n").unwrap();
            assert_eq!(responses[0].status, 204);
        }

        let bomb = gzipped(&vec![b'x'; MAX_BODY_LEN + 1]);
        let mut raw =
            format!("HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n", bomb.len()).into_bytes();
        raw.extend_from_slice(&bomb);
        let mut decoder = HttpResponseDecoder::new(true);
        assert_eq!(decoder.decode(&raw).err(), Some(too_large));
    }

    #[test]
    fn chunked_trailers_are_skipped() {
        let raw = "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\n{}\r\n0\r\nX-Trace: 1\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n";

        let mut decoder = HttpResponseDecoder::new(false);
        let responses = decoder.decode(raw.as_bytes()).unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(&responses[0].body[..], b"{}");
        assert_eq!(responses[1].status, 204);
    }
}
