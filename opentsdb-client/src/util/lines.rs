//! Helpers for carving CR/LF-delimited text out of raw byte buffers.

/// Returns the index of the first carriage return or line feed in `buf`, if any.
pub fn find_line_end(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == b'\r' || b == b'\n')
}

/// Iterates over the non-blank lines in `buf`.
///
/// Lines may be terminated by `\n`, `\r\n`, or the end of the buffer. Terminators and surrounding whitespace are not
/// included in the yielded slices.
pub fn records(buf: &[u8]) -> impl Iterator<Item = &[u8]> {
    buf.split(|&b| b == b'\n' || b == b'\r').map(trim).filter(|line| !line.is_empty())
}

/// Strips leading and trailing ASCII whitespace from `line`.
pub fn trim(line: &[u8]) -> &[u8] {
    let start = line.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(line.len());
    let end = line.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &line[start..end]
}

#[cfg(test)]
mod tests {
    use super::{find_line_end, records};

    #[test]
    fn line_end() {
        let cases: [(&[u8], Option<usize>); 5] = [
            (b"", None),
            (b"STATS", None),
            (b"STATS:\nfoo", Some(6)),
            (b"STATS:\r\nfoo", Some(6)),
            (b"\n", Some(0)),
        ];

        for (input, expected) in cases {
            assert_eq!(find_line_end(input), expected);
        }
    }

    #[test]
    fn records_skip_blank_lines_and_terminators() {
        let input = b"a.b 1 2 host=x\r\n\r\n  c.d 3 4 host=y  \nlast 5 6 host=z";
        let lines = records(input).collect::<Vec<_>>();

        assert_eq!(lines, vec![&b"a.b 1 2 host=x"[..], b"c.d 3 4 host=y", b"last 5 6 host=z"]);
    }
}
