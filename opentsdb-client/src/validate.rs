use thiserror::Error;

use crate::point::{Tags, Value};

/// Errors that could occur while validating a data point.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A metric name, tag key, or tag value was empty after trimming.
    #[error("invalid {what}: empty string")]
    Empty {
        /// What was being validated.
        what: &'static str,
    },

    /// A metric name, tag key, or tag value contained a character outside of `[A-Za-z0-9_./-]`.
    #[error("invalid {what} (\"{value}\"): illegal character: {character:?}")]
    IllegalCharacter {
        /// What was being validated.
        what: &'static str,

        /// The offending string.
        value: String,

        /// The first illegal character found.
        character: char,
    },

    /// The data point had no tags.
    #[error("data point for metric '{metric}' has no tags")]
    EmptyTags {
        /// The metric name.
        metric: String,
    },

    /// The data point value was NaN or infinite.
    #[error("data point for metric '{metric}' has a non-finite value")]
    NonFiniteValue {
        /// The metric name.
        metric: String,
    },
}

const fn is_valid_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/')
}

/// Validates that `raw`, once trimmed, is a non-empty string of `[A-Za-z0-9_./-]` characters.
///
/// Returns the trimmed string.
///
/// # Errors
///
/// If the string is empty or contains an illegal character, an error is returned describing the problem.
pub fn validate_string<'a>(what: &'static str, raw: &'a str) -> Result<&'a str, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty { what });
    }

    match trimmed.chars().find(|c| !is_valid_char(*c)) {
        Some(character) => {
            Err(ValidationError::IllegalCharacter { what, value: trimmed.to_string(), character })
        }
        None => Ok(trimmed),
    }
}

/// Validates a metric name, returning its trimmed, owned form.
pub(crate) fn clean_metric(metric: &str) -> Result<String, ValidationError> {
    validate_string("metric name", metric).map(str::to_string)
}

/// Validates and trims every tag, injecting `host` and `app` when the caller supplied neither.
pub(crate) fn clean_tags<I, K, V>(tags: I, host: &str, app: &str) -> Result<Tags, ValidationError>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut cleaned = Tags::new();
    for (key, value) in tags {
        let key = validate_string("tag key", key.as_ref())?;
        let value = validate_string("tag value", value.as_ref())?;
        cleaned.insert(key.to_string(), value.to_string());
    }

    if !cleaned.contains_key("host") && !cleaned.contains_key("app") {
        cleaned.insert("host".to_string(), host.to_string());
        cleaned.insert("app".to_string(), app.to_string());
    }

    Ok(cleaned)
}

/// Rejects NaN and infinite values, which no wire format can carry.
pub(crate) fn check_value(metric: &str, value: Value) -> Result<Value, ValidationError> {
    match value {
        Value::Float(f) if !f.is_finite() => {
            Err(ValidationError::NonFiniteValue { metric: metric.to_string() })
        }
        value => Ok(value),
    }
}

/// The checks every codec runs before writing a point.
pub(crate) fn check_encodable(metric: &str, tags: &Tags) -> Result<(), ValidationError> {
    if metric.trim().is_empty() {
        return Err(ValidationError::Empty { what: "metric name" });
    }

    if tags.is_empty() {
        return Err(ValidationError::EmptyTags { metric: metric.to_string() });
    }

    Ok(())
}
