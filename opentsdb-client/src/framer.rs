use std::io::{self, Write as _};

use bytes::Bytes;
use flate2::{write::GzEncoder, Compression};
use tracing::debug;

// A sync-flushed gzip stream still needs its final empty block and the 8-byte trailer.
const GZIP_FINISH_OVERHEAD: usize = 16;

const SMALLEST_VALID_FRAME: usize = 64;

/// The result of splitting a payload into frames.
#[derive(Debug, Default)]
pub struct Frames {
    frames: Vec<Bytes>,
    records_framed: u64,
    records_dropped: u64,
}

impl Frames {
    /// Returns the frames, in sending order.
    pub fn frames(&self) -> &[Bytes] {
        &self.frames
    }

    /// Consumes the result, returning the frames.
    pub fn into_frames(self) -> Vec<Bytes> {
        self.frames
    }

    /// Returns the number of records that made it into a frame.
    pub const fn records_framed(&self) -> u64 {
        self.records_framed
    }

    /// Returns the number of records that could not fit in a frame on their own, and were dropped.
    pub const fn records_dropped(&self) -> u64 {
        self.records_dropped
    }
}

/// Splits newline-delimited command payloads into bounded datagrams.
///
/// A payload is a command line followed by zero or more records, each terminated by a line feed. Every frame produced
/// starts with the command line and then carries as many whole records as fit under the maximum frame length, so each
/// frame can be interpreted by the server on its own. Records are never split across frames, and a record too large to
/// fit in a frame by itself is dropped.
///
/// When gzip is enabled, each frame is compressed independently, and the length limit applies to the compressed frame.
pub struct DatagramFramer {
    max_frame_len: usize,
    gzip: bool,
}

impl DatagramFramer {
    /// Creates a new `DatagramFramer`.
    ///
    /// # Panics
    ///
    /// Panics if `max_frame_len` is too small to hold any useful frame.
    pub fn new(max_frame_len: usize, gzip: bool) -> Self {
        // NOTE: The builder already rejects these, this just double checks.
        assert!(
            max_frame_len >= SMALLEST_VALID_FRAME,
            "maximum frame length must be {SMALLEST_VALID_FRAME} or greater"
        );

        Self { max_frame_len, gzip }
    }

    /// Returns the smallest maximum frame length that can be configured.
    pub const fn smallest_valid_frame() -> usize {
        SMALLEST_VALID_FRAME
    }

    /// Splits `payload` into frames.
    ///
    /// # Errors
    ///
    /// If compressing a frame fails, an error is returned.
    pub fn frame(&self, payload: &[u8]) -> io::Result<Frames> {
        let prefix_len = payload.iter().position(|&b| b == b'\n').map_or(payload.len(), |i| i + 1);
        let (prefix, body) = payload.split_at(prefix_len);
        let records = body
            .split_inclusive(|&b| b == b'\n')
            .filter(|record| record.iter().any(|b| !b.is_ascii_whitespace()))
            .collect::<Vec<_>>();

        let mut result = Frames::default();
        if records.is_empty() {
            if !prefix.is_empty() {
                result.frames.push(self.build(prefix, &[])?);
            }
            return Ok(result);
        }

        let mut start = 0;
        while start < records.len() {
            let remaining = &records[start..];
            match self.fill(prefix, remaining)? {
                Some((count, frame)) => {
                    result.frames.push(frame);
                    result.records_framed += count as u64;
                    start += count;
                }
                None => {
                    debug!(record_len = remaining[0].len(), "Dropping record too large for a single frame.");
                    result.records_dropped += 1;
                    start += 1;
                }
            }
        }

        Ok(result)
    }

    /// Builds the largest frame that fits, starting at the first record.
    fn fill(&self, prefix: &[u8], records: &[&[u8]]) -> io::Result<Option<(usize, Bytes)>> {
        let mut count = self.estimate(prefix, records)?.max(1);
        while count > 0 {
            let frame = self.build(prefix, &records[..count])?;
            if frame.len() <= self.max_frame_len {
                return Ok(Some((count, frame)));
            }
            count -= 1;
        }

        Ok(None)
    }

    /// Estimates how many records fit in the next frame.
    ///
    /// For plaintext frames this is exact. For compressed frames, a probe stream is flushed after every record, which
    /// slightly overstates the final size.
    fn estimate(&self, prefix: &[u8], records: &[&[u8]]) -> io::Result<usize> {
        if !self.gzip {
            let mut frame_len = prefix.len();
            let mut count = 0;
            for record in records {
                if frame_len + record.len() > self.max_frame_len {
                    break;
                }
                frame_len += record.len();
                count += 1;
            }
            return Ok(count);
        }

        let mut probe = GzEncoder::new(Vec::new(), Compression::default());
        probe.write_all(prefix)?;

        let mut count = 0;
        for record in records {
            probe.write_all(record)?;
            probe.flush()?;
            if probe.get_ref().len() + GZIP_FINISH_OVERHEAD > self.max_frame_len {
                break;
            }
            count += 1;
        }

        Ok(count)
    }

    fn build(&self, prefix: &[u8], records: &[&[u8]]) -> io::Result<Bytes> {
        if !self.gzip {
            let mut frame = Vec::with_capacity(prefix.len() + records.iter().map(|r| r.len()).sum::<usize>());
            frame.extend_from_slice(prefix);
            for record in records {
                frame.extend_from_slice(record);
            }
            return Ok(frame.into());
        }

        let mut encoder = GzEncoder::new(Vec::with_capacity(self.max_frame_len), Compression::default());
        encoder.write_all(prefix)?;
        for record in records {
            encoder.write_all(record)?;
        }
        encoder.finish().map(Bytes::from)
    }
}
