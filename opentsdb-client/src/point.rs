//! Data points, values, tags, and put-line parsing.
use std::{
    collections::BTreeMap,
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use thiserror::Error;

/// A set of tags attached to a data point.
///
/// Keys are unique and kept in sorted order, so a given tag set always encodes to the same bytes.
pub type Tags = BTreeMap<String, String>;

/// Unit of the timestamps sent to the server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TimeUnit {
    /// Milliseconds since the Unix epoch.
    #[default]
    Milliseconds,

    /// Seconds since the Unix epoch.
    Seconds,
}

impl TimeUnit {
    /// Converts a point in time into a timestamp in this unit.
    ///
    /// Times before the Unix epoch are clamped to zero.
    pub fn timestamp(self, time: SystemTime) -> i64 {
        let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        let value = match self {
            TimeUnit::Milliseconds => since_epoch.as_millis(),
            TimeUnit::Seconds => u128::from(since_epoch.as_secs()),
        };
        i64::try_from(value).unwrap_or(i64::MAX)
    }

    /// Returns the current time in this unit.
    pub fn now(self) -> i64 {
        self.timestamp(SystemTime::now())
    }
}

/// The value of a data point.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// An integer value.
    Integer(i64),

    /// A floating-point value.
    Float(f64),
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value.into())
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Integer(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Float(value.into())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) => f.write_str(itoa::Buffer::new().format(*v)),
            Value::Float(v) => f.write_str(ryu::Buffer::new().format(*v)),
        }
    }
}

/// Errors that could occur while parsing a put-style line into a data point.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The line did not contain a metric, timestamp, value, and at least one tag.
    #[error("expected at least 4 fields (metric, timestamp, value, tags) but found {found}")]
    MissingFields {
        /// Number of whitespace-separated fields found.
        found: usize,
    },

    /// The timestamp was not an integer.
    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),

    /// The value was neither an integer nor a floating-point number.
    #[error("invalid value '{0}'")]
    InvalidValue(String),

    /// A tag was not in `key=value` form.
    #[error("invalid tag '{0}' (expected key=value)")]
    InvalidTag(String),
}

/// A single metric observation.
#[derive(Clone, Debug, PartialEq)]
pub struct DataPoint {
    /// Timestamp, in the unit the client is configured with.
    pub timestamp: i64,

    /// Metric name.
    pub metric: String,

    /// Observed value.
    pub value: Value,

    /// Tags.
    pub tags: Tags,
}

impl DataPoint {
    /// Creates a new `DataPoint`.
    pub fn new<M, V, I, K, T>(metric: M, timestamp: i64, value: V, tags: I) -> Self
    where
        M: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, T)>,
        K: Into<String>,
        T: Into<String>,
    {
        Self {
            timestamp,
            metric: metric.into(),
            value: value.into(),
            tags: tags.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

impl FromStr for DataPoint {
    type Err = ParseError;

    /// Parses a line in the form `<metric> <timestamp> <value> <key>=<value>...`.
    ///
    /// A value containing a decimal point or an exponent is parsed as floating-point, anything else as an integer.
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields = line.split_whitespace().collect::<Vec<_>>();
        if fields.len() < 4 {
            return Err(ParseError::MissingFields { found: fields.len() });
        }

        let timestamp =
            fields[1].parse().map_err(|_| ParseError::InvalidTimestamp(fields[1].to_string()))?;
        let value = parse_value(fields[2])?;

        let mut tags = Tags::new();
        for tag in &fields[3..] {
            match tag.split_once('=') {
                Some((k, v)) => tags.insert(k.to_string(), v.to_string()),
                None => return Err(ParseError::InvalidTag((*tag).to_string())),
            };
        }

        Ok(DataPoint { timestamp, metric: fields[0].to_string(), value, tags })
    }
}

fn parse_value(raw: &str) -> Result<Value, ParseError> {
    let looks_float = raw.contains(['.', 'e', 'E']);
    if !looks_float {
        if let Ok(v) = raw.parse::<i64>() {
            return Ok(Value::Integer(v));
        }
    }

    raw.parse::<f64>().map(Value::Float).map_err(|_| ParseError::InvalidValue(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::{DataPoint, ParseError, TimeUnit, Value};

    #[test]
    fn timestamps() {
        let time = UNIX_EPOCH + Duration::from_millis(1_356_998_400_123);
        assert_eq!(TimeUnit::Milliseconds.timestamp(time), 1_356_998_400_123);
        assert_eq!(TimeUnit::Seconds.timestamp(time), 1_356_998_400);
        assert_eq!(TimeUnit::Seconds.timestamp(UNIX_EPOCH - Duration::from_secs(5)), 0);
    }

    #[test]
    fn parse_lines() {
        let cases = [
            (
                "foo 1 2 host=h",
                Ok(DataPoint::new("foo", 1, 2, [("host", "h")])),
            ),
            (
                "  sys.cpu.user 1356998400 42.5 host=web01 cpu=0  ",
                Ok(DataPoint::new("sys.cpu.user", 1_356_998_400, 42.5, [("host", "web01"), ("cpu", "0")])),
            ),
            (
                "big 1 99999999999999999999 host=h",
                Ok(DataPoint::new("big", 1, 1e20, [("host", "h")])),
            ),
            ("foo 1 2", Err(ParseError::MissingFields { found: 3 })),
            ("foo x 2 host=h", Err(ParseError::InvalidTimestamp("x".to_string()))),
            ("foo 1 two host=h", Err(ParseError::InvalidValue("two".to_string()))),
            ("foo 1 2 host", Err(ParseError::InvalidTag("host".to_string()))),
        ];

        for (input, expected) in cases {
            assert_eq!(input.parse::<DataPoint>(), expected, "input: {input:?}");
        }
    }

    #[test]
    fn value_display() {
        assert_eq!(Value::from(42).to_string(), "42");
        assert_eq!(Value::from(-7_i64).to_string(), "-7");
        assert_eq!(Value::from(0.5).to_string(), "0.5");
        assert_eq!(Value::from(3.0).to_string(), "3.0");
    }
}
