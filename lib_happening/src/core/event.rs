//! # Event
//!
//! The immutable value parsed from one record of the ingestion wire.
//!
//! ## Wire record
//! `<from>|<sent_on>|<type>\r\n`: exactly three fields separated by `|` and
//! terminated by the two-byte `\r\n` delimiter. The framing layer strips the
//! delimiter before a record reaches [`Event::from_record`]; the parser puts it
//! back in the retained raw form so audit logs show what was actually sent.
//!
//! An `Event` only exists once all three fields parsed; there is no partially
//! initialised state that could slip into the queue.

use std::fmt;
use std::num::ParseIntError;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;

/// Record terminator and framing delimiter of the ingestion wire.
pub const MSG_DELIMITER: &[u8] = b"\r\n";
/// Separator between the fields of one record.
pub const EVENT_PARAMS_SEPARATOR: char = '|';

const EVENT_FIELDS: usize = 3;

/// Why a record could not become an [`Event`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The record did not split into exactly three fields.
    #[error("incomplete event received ({found} fields instead of 3): {raw:?}")]
    MalformedRecord {
        /// Number of fields actually found.
        found: usize,
        /// The offending record, delimiter stripped.
        raw: String,
    },
    /// The `sent_on` field is not a base-10 integer.
    #[error("couldn't parse timestamp {value:?}: {source}")]
    InvalidTimestamp {
        /// The field as received.
        value: String,
        /// Underlying integer parse failure.
        #[source]
        source: ParseIntError,
    },
    /// The record bytes are not UTF-8.
    #[error("event record is not valid UTF-8")]
    InvalidEncoding,
}

/// # Event
///
/// One parsed record. `received_on` is stamped by the parsing side (Unix
/// seconds); it is monotonic within one connection handler only and carries
/// no ordering meaning across handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    from: String,
    sent_on: i64,
    received_on: i64,
    #[serde(rename = "type")]
    event_type: String,
    raw: String,
}

impl Event {
    /// Builds an event from its components. The raw form is synthesised from
    /// the wire grammar.
    pub fn new(from: &str, sent_on: i64, received_on: i64, event_type: &str) -> Self {
        Self {
            raw: format!("{from}{EVENT_PARAMS_SEPARATOR}{sent_on}{EVENT_PARAMS_SEPARATOR}{event_type}\r\n"),
            from: from.to_string(),
            sent_on,
            received_on,
            event_type: event_type.to_string(),
        }
    }

    /// Parses one framed record (delimiter already removed).
    pub fn from_record(record: &[u8]) -> Result<Self, ParseError> {
        let raw = std::str::from_utf8(record).map_err(|_| ParseError::InvalidEncoding)?;
        Self::from_raw(raw)
    }

    /// Parses the textual form of a record. Stray `\r`/`\n` at either end are
    /// ignored; no other normalisation happens and `from`/`type` are taken
    /// verbatim.
    pub fn from_raw(raw: &str) -> Result<Self, ParseError> {
        let body = raw.trim_matches(|c| c == '\r' || c == '\n');
        let parts: Vec<&str> = body.split(EVENT_PARAMS_SEPARATOR).collect();

        if parts.len() != EVENT_FIELDS {
            return Err(ParseError::MalformedRecord {
                found: parts.len(),
                raw: body.to_string(),
            });
        }

        let sent_on = parts[1]
            .parse::<i64>()
            .map_err(|source| ParseError::InvalidTimestamp {
                value: parts[1].to_string(),
                source,
            })?;

        let mut retained = String::with_capacity(raw.len() + MSG_DELIMITER.len());
        retained.push_str(raw);
        if !raw.ends_with("\r\n") {
            retained.push_str("\r\n");
        }

        Ok(Self {
            from: parts[0].to_string(),
            sent_on,
            received_on: Utc::now().timestamp(),
            event_type: parts[2].to_string(),
            raw: retained,
        })
    }

    /// Sender identity as declared on the wire.
    pub fn from(&self) -> &str {
        &self.from
    }

    /// Sender-declared timestamp.
    pub fn sent_on(&self) -> i64 {
        self.sent_on
    }

    /// Server-side parse time, Unix seconds.
    pub fn received_on(&self) -> i64 {
        self.received_on
    }

    /// Free-form event type.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// The record as it arrived, delimiter included.
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{} (received {})",
            self.from,
            self.sent_on,
            self.event_type,
            self.received_on,
            sep = EVENT_PARAMS_SEPARATOR
        )
    }
}
