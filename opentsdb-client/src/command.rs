//! The command protocol spoken over datagram transports.
//!
//! Every inbound datagram starts with a command line in the form `VERB ...:`, terminated by a line break, and the verb
//! decides how the rest of the datagram is interpreted.
use std::{fmt, str::FromStr};

use thiserror::Error;

use crate::util::lines::find_line_end;

/// Errors that could occur while interpreting data received from the server.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The message had no `:` terminating its command.
    #[error("no command delimiter found in message")]
    MissingCommandDelimiter,

    /// The command verb was not recognized.
    #[error("unrecognized command '{0}'")]
    UnknownCommand(String),

    /// The message had no line break separating the command line from the payload.
    #[error("no payload delimiter found in message")]
    MissingPayloadDelimiter,

    /// An HTTP response could not be parsed.
    #[error("malformed HTTP response: {0}")]
    MalformedHttp(String),

    /// A response line grew past the allowed length without being terminated.
    #[error("response line exceeded {limit} bytes without a terminator")]
    LineTooLong {
        /// The maximum line length.
        limit: usize,
    },

    /// An HTTP response body was larger than the client accepts.
    #[error("response body exceeded {limit} bytes")]
    BodyTooLarge {
        /// The maximum body length.
        limit: usize,
    },
}

/// A command verb.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    /// A batch of data points, or the server's summary of one.
    PutBatch,

    /// A request for, or a report of, the server's operational statistics.
    Stats,
}

impl Command {
    /// All known commands.
    pub const ALL: [Command; 2] = [Command::PutBatch, Command::Stats];

    /// Returns the verb for this command.
    pub const fn verb(self) -> &'static str {
        match self {
            Command::PutBatch => "PUTBATCH",
            Command::Stats => "STATS",
        }
    }

    /// Returns the canonical request line, including its terminating line feed.
    pub const fn request_line(self) -> &'static [u8] {
        match self {
            Command::PutBatch => b"PUTBATCH --send-response\n",
            Command::Stats => b"STATS\n",
        }
    }

    /// Returns the sub-commands the command accepts.
    pub const fn sub_commands(self) -> &'static [&'static str] {
        &[]
    }

    /// Returns the options the command accepts, which take a value.
    pub const fn options(self) -> &'static [&'static str] {
        match self {
            Command::PutBatch => &["--request-id"],
            Command::Stats => &[],
        }
    }

    /// Returns the flags the command accepts.
    pub const fn flags(self) -> &'static [&'static str] {
        match self {
            Command::PutBatch => &["--send-response", "--skip-errors"],
            Command::Stats => &["--canonical"],
        }
    }

    /// Extracts the command from the start of a message.
    ///
    /// The command is everything up to the first `:`, and the verb is its first space-separated word, compared without
    /// regard to case.
    ///
    /// # Errors
    ///
    /// If the message has no `:`, or the verb is not recognized, an error is returned.
    pub fn extract(message: &[u8]) -> Result<Command, ProtocolError> {
        let end = message.iter().position(|&b| b == b':').ok_or(ProtocolError::MissingCommandDelimiter)?;
        let line = String::from_utf8_lossy(&message[..end]);
        let verb = line.trim().split(' ').next().unwrap_or_default();

        verb.parse()
    }

    /// Extracts the payload of a message: everything after the first line break.
    ///
    /// # Errors
    ///
    /// If the message has no line break, an error is returned.
    pub fn extract_payload(message: &[u8]) -> Result<&[u8], ProtocolError> {
        find_line_end(message).map(|end| &message[end + 1..]).ok_or(ProtocolError::MissingPayloadDelimiter)
    }

    /// Returns `true` if `line` consists of nothing but this command's verb, with or without a trailing `:`.
    pub fn is_verb_line(self, line: &[u8]) -> bool {
        let line = line.strip_suffix(b":").unwrap_or(line);
        line.eq_ignore_ascii_case(self.verb().as_bytes())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let verb = s.trim();
        Command::ALL
            .into_iter()
            .find(|command| command.verb().eq_ignore_ascii_case(verb))
            .ok_or_else(|| ProtocolError::UnknownCommand(verb.to_ascii_uppercase()))
    }
}

#[cfg(test)]
mod tests {
    use super::{Command, ProtocolError};

    #[test]
    fn extract_commands() {
        let cases: [(&[u8], Result<Command, ProtocolError>); 7] = [
            (b"STATS:\nfoo 1 2 host=h\r\n", Ok(Command::Stats)),
            (b"stats:\n", Ok(Command::Stats)),
            (b"PUTBATCH --send-response:\n{}", Ok(Command::PutBatch)),
            (b"  putbatch :\n{}", Ok(Command::PutBatch)),
            (b"NOPE:\n", Err(ProtocolError::UnknownCommand("NOPE".to_string()))),
            (b":\n", Err(ProtocolError::UnknownCommand(String::new()))),
            (b"STATS\nfoo", Err(ProtocolError::MissingCommandDelimiter)),
        ];

        for (input, expected) in cases {
            assert_eq!(Command::extract(input), expected, "input: {:?}", String::from_utf8_lossy(input));
        }
    }

    #[test]
    fn extract_payloads() {
        let cases: [(&[u8], Result<&[u8], ProtocolError>); 4] = [
            (b"STATS:\nfoo 1 2 host=h\r\n", Ok(b"foo 1 2 host=h\r\n")),
            (b"STATS:\r\nfoo", Ok(b"\nfoo")),
            (b"STATS:\n", Ok(b"")),
            (b"STATS:", Err(ProtocolError::MissingPayloadDelimiter)),
        ];

        for (input, expected) in cases {
            assert_eq!(Command::extract_payload(input), expected);
        }
    }

    #[test]
    fn verb_lines() {
        assert!(Command::Stats.is_verb_line(b"STATS:"));
        assert!(Command::Stats.is_verb_line(b"stats"));
        assert!(!Command::Stats.is_verb_line(b"STATS: x"));
        assert!(!Command::PutBatch.is_verb_line(b"STATS:"));
    }

    #[test]
    fn request_lines_start_with_verb() {
        for command in Command::ALL {
            let line = std::str::from_utf8(command.request_line()).unwrap();
            assert!(line.starts_with(command.verb()));
            assert!(line.ends_with('\n'));
            assert!(command.sub_commands().is_empty());
            assert!(!command.flags().is_empty());
        }
    }
}
