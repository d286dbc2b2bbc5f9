//! Captured error records and their fixed-width slot encoding.
//!
//! Every record occupies exactly [`SLOT_SIZE`] bytes inside the ring. The
//! layout is little-endian and identical for every process that attaches to
//! the region:
//!
//! ```text
//! offset  size  field
//!      0     8  captured_at (i64, microseconds since the Unix epoch; 0 = empty)
//!      8     4  origin_id (i32)
//!     12     4  severity (i32)
//!     16     6  status_code (NUL padded)
//!     22     2  query_len (u16)
//!     24     2  message_len (u16)
//!     26     6  reserved
//!     32  8192  query_text
//!   8224  1024  error_message
//! ```

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Maximum stored length of the request text, in bytes.
pub const MAX_QUERY_LEN: usize = 8192;

/// Maximum stored length of the error message, in bytes.
pub const MAX_ERROR_MESSAGE_LEN: usize = 1024;

/// Width of the status code field, in bytes.
pub const STATUS_CODE_LEN: usize = 6;

/// Length of the fixed slot prefix (timestamp, ids, lengths).
pub const SLOT_PREFIX_LEN: usize = 32;

/// Total size of one encoded slot.
pub const SLOT_SIZE: usize = SLOT_PREFIX_LEN + MAX_QUERY_LEN + MAX_ERROR_MESSAGE_LEN;

/// Timestamp value marking an unused slot.
pub const EMPTY_TIMESTAMP: i64 = 0;

const QUERY_OFFSET: usize = SLOT_PREFIX_LEN;
const MESSAGE_OFFSET: usize = QUERY_OFFSET + MAX_QUERY_LEN;

// =============================================================================
// Severity
// =============================================================================

/// Severity of a reported event, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Trace,
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Fatal,
}

impl Severity {
    /// Integer code stored in a record.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Trace => 0,
            Self::Debug => 1,
            Self::Info => 2,
            Self::Notice => 3,
            Self::Warning => 4,
            Self::Error => 5,
            Self::Fatal => 6,
        }
    }

    /// Map a stored code back to a severity. Unknown codes yield `None`.
    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Trace),
            1 => Some(Self::Debug),
            2 => Some(Self::Info),
            3 => Some(Self::Notice),
            4 => Some(Self::Warning),
            5 => Some(Self::Error),
            6 => Some(Self::Fatal),
            _ => None,
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Self::Error
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Notice => "notice",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "notice" => Ok(Self::Notice),
            "warn" | "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "fatal" => Ok(Self::Fatal),
            _ => Err(format!(
                "unknown severity: {s}. Expected one of: trace, debug, info, notice, warning, error, fatal"
            )),
        }
    }
}

impl From<tracing::Level> for Severity {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => Self::Trace,
            tracing::Level::DEBUG => Self::Debug,
            tracing::Level::INFO => Self::Info,
            tracing::Level::WARN => Self::Warning,
            tracing::Level::ERROR => Self::Error,
        }
    }
}

// =============================================================================
// Record
// =============================================================================

/// One captured error event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Identifier of the process that produced the event.
    pub origin_id: i32,
    /// Request text that was executing when the event fired.
    pub query_text: String,
    /// Error message, bounded to [`MAX_ERROR_MESSAGE_LEN`] bytes.
    pub error_message: String,
    /// Short status code, empty if the event carried none.
    pub status_code: String,
    /// Severity code (see [`Severity::code`]).
    pub severity: i32,
    /// Capture time in microseconds since the Unix epoch.
    pub captured_at: i64,
}

impl Record {
    /// Whether this record holds data (non-sentinel timestamp).
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.captured_at != EMPTY_TIMESTAMP
    }

    /// Decoded severity, if the stored code is known.
    #[must_use]
    pub fn severity_level(&self) -> Option<Severity> {
        Severity::from_code(self.severity)
    }

    /// Capture time as a UTC datetime.
    #[must_use]
    pub fn captured_at_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_micros(self.captured_at).single()
    }

    /// Decode a record from one slot. Never fails: lengths are clamped to
    /// their bounds and invalid UTF-8 is replaced.
    #[must_use]
    pub fn decode(slot: &[u8]) -> Self {
        let prefix = SlotPrefix::decode(slot);
        let query_len = usize::from(read_u16(slot, 22)).min(MAX_QUERY_LEN);
        let message_len = usize::from(read_u16(slot, 24)).min(MAX_ERROR_MESSAGE_LEN);

        let status = field(slot, 16, STATUS_CODE_LEN);
        let status_end = status.iter().position(|&b| b == 0).unwrap_or(status.len());

        Self {
            origin_id: prefix.origin_id,
            query_text: lossy(field(slot, QUERY_OFFSET, query_len)),
            error_message: lossy(field(slot, MESSAGE_OFFSET, message_len)),
            status_code: lossy(&status[..status_end]),
            severity: prefix.severity,
            captured_at: prefix.captured_at,
        }
    }
}

/// The fixed leading part of a slot, enough to decide liveness and ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPrefix {
    pub captured_at: i64,
    pub origin_id: i32,
    pub severity: i32,
}

impl SlotPrefix {
    /// Decode the prefix. Short buffers decode as an empty slot.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Self {
        if buf.len() < 16 {
            return Self {
                captured_at: EMPTY_TIMESTAMP,
                origin_id: 0,
                severity: 0,
            };
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&buf[0..8]);
        let mut origin = [0u8; 4];
        origin.copy_from_slice(&buf[8..12]);
        let mut severity = [0u8; 4];
        severity.copy_from_slice(&buf[12..16]);
        Self {
            captured_at: i64::from_le_bytes(ts),
            origin_id: i32::from_le_bytes(origin),
            severity: i32::from_le_bytes(severity),
        }
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.captured_at != EMPTY_TIMESTAMP
    }
}

// =============================================================================
// EncodedSlot
// =============================================================================

/// A record already packed into slot bytes, waiting for its timestamp.
///
/// Encoding happens before the ring lock is taken; only
/// [`EncodedSlot::set_captured_at`] runs while the lock is held.
pub struct EncodedSlot {
    bytes: Box<[u8]>,
}

impl EncodedSlot {
    /// Pack the given fields, truncating text to its bound.
    #[must_use]
    pub fn new(
        origin_id: i32,
        severity: Severity,
        status_code: &str,
        error_message: &str,
        query_text: &str,
    ) -> Self {
        let mut bytes = vec![0u8; SLOT_SIZE].into_boxed_slice();

        bytes[8..12].copy_from_slice(&origin_id.to_le_bytes());
        bytes[12..16].copy_from_slice(&severity.code().to_le_bytes());

        let status = truncate_utf8(status_code, STATUS_CODE_LEN).as_bytes();
        bytes[16..16 + status.len()].copy_from_slice(status);

        let query = truncate_utf8(query_text, MAX_QUERY_LEN).as_bytes();
        let message = truncate_utf8(error_message, MAX_ERROR_MESSAGE_LEN).as_bytes();
        // Both bounds fit in u16.
        bytes[22..24].copy_from_slice(&(query.len() as u16).to_le_bytes());
        bytes[24..26].copy_from_slice(&(message.len() as u16).to_le_bytes());

        bytes[QUERY_OFFSET..QUERY_OFFSET + query.len()].copy_from_slice(query);
        bytes[MESSAGE_OFFSET..MESSAGE_OFFSET + message.len()].copy_from_slice(message);

        Self { bytes }
    }

    /// Stamp the capture time. A zero timestamp is bumped to 1 so a written
    /// slot can never look empty.
    pub fn set_captured_at(&mut self, captured_at: i64) {
        let ts = captured_at.max(1);
        self.bytes[0..8].copy_from_slice(&ts.to_le_bytes());
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Decode back into a record (mainly useful in tests).
    #[must_use]
    pub fn to_record(&self) -> Record {
        Record::decode(&self.bytes)
    }
}

impl std::fmt::Debug for EncodedSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = SlotPrefix::decode(&self.bytes);
        f.debug_struct("EncodedSlot")
            .field("origin_id", &prefix.origin_id)
            .field("severity", &prefix.severity)
            .field("captured_at", &prefix.captured_at)
            .finish()
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Cut `s` to at most `max` bytes, backing off to a character boundary.
#[must_use]
pub fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Current wall-clock time in microseconds since the Unix epoch.
#[must_use]
pub fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    match buf.get(offset..offset + 2) {
        Some(b) => u16::from_le_bytes([b[0], b[1]]),
        None => 0,
    }
}

fn field(buf: &[u8], offset: usize, len: usize) -> &[u8] {
    let start = offset.min(buf.len());
    let end = offset.saturating_add(len).min(buf.len());
    &buf[start..end]
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(origin: i32, message: &str, query: &str) -> EncodedSlot {
        EncodedSlot::new(origin, Severity::Error, "42P01", message, query)
    }

    #[test]
    fn slot_size_is_aligned() {
        assert_eq!(SLOT_SIZE, 9248);
        assert_eq!(SLOT_SIZE % 8, 0);
    }

    #[test]
    fn encode_decode_fields() {
        let mut s = slot(7, "relation does not exist", "SELECT * FROM missing");
        s.set_captured_at(1_700_000_000_000_000);
        let r = s.to_record();
        assert_eq!(r.origin_id, 7);
        assert_eq!(r.error_message, "relation does not exist");
        assert_eq!(r.query_text, "SELECT * FROM missing");
        assert_eq!(r.status_code, "42P01");
        assert_eq!(r.severity, Severity::Error.code());
        assert_eq!(r.captured_at, 1_700_000_000_000_000);
        assert!(r.is_live());
    }

    #[test]
    fn unstamped_slot_is_empty() {
        let r = slot(1, "m", "q").to_record();
        assert!(!r.is_live());
    }

    #[test]
    fn zero_timestamp_is_bumped() {
        let mut s = slot(1, "m", "q");
        s.set_captured_at(0);
        assert_eq!(s.to_record().captured_at, 1);
        s.set_captured_at(-5);
        assert_eq!(s.to_record().captured_at, 1);
    }

    #[test]
    fn long_query_truncated_to_bound() {
        let query = "q".repeat(10_000);
        let r = slot(1, "m", &query).to_record();
        assert_eq!(r.query_text.len(), MAX_QUERY_LEN);
        assert_eq!(r.query_text, query[..MAX_QUERY_LEN]);
    }

    #[test]
    fn long_message_truncated_to_bound() {
        let message = "e".repeat(2_000);
        let r = slot(1, &message, "").to_record();
        assert_eq!(r.error_message.len(), MAX_ERROR_MESSAGE_LEN);
        assert_eq!(r.error_message, message[..MAX_ERROR_MESSAGE_LEN]);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // 'é' is two bytes; 3 bytes cannot hold "éé" so only one survives.
        assert_eq!(truncate_utf8("éé", 3), "é");
        assert_eq!(truncate_utf8("abc", 3), "abc");
        assert_eq!(truncate_utf8("abcd", 0), "");
    }

    #[test]
    fn empty_status_code_roundtrips() {
        let r = EncodedSlot::new(1, Severity::Fatal, "", "m", "").to_record();
        assert_eq!(r.status_code, "");
        assert_eq!(r.severity_level(), Some(Severity::Fatal));
    }

    #[test]
    fn oversized_status_code_truncated() {
        let r = EncodedSlot::new(1, Severity::Error, "ABCDEFGH", "m", "").to_record();
        assert_eq!(r.status_code, "ABCDEF");
    }

    #[test]
    fn decode_tolerates_garbage_lengths() {
        let mut raw = vec![0u8; SLOT_SIZE];
        raw[0] = 1;
        raw[22..24].copy_from_slice(&u16::MAX.to_le_bytes());
        raw[24..26].copy_from_slice(&u16::MAX.to_le_bytes());
        let r = Record::decode(&raw);
        assert_eq!(r.query_text.len(), MAX_QUERY_LEN);
        assert_eq!(r.error_message.len(), MAX_ERROR_MESSAGE_LEN);
    }

    #[test]
    fn decode_short_buffer_is_empty() {
        let r = Record::decode(&[1, 2, 3]);
        assert!(!r.is_live());
        assert!(r.query_text.is_empty());
    }

    #[test]
    fn severity_ordering_and_codes() {
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Fatal);
        for code in 0..=6 {
            let sev = Severity::from_code(code).unwrap();
            assert_eq!(sev.code(), code);
        }
        assert_eq!(Severity::from_code(99), None);
    }

    #[test]
    fn severity_from_str() {
        assert_eq!("warn".parse::<Severity>().unwrap(), Severity::Warning);
        assert_eq!("ERROR".parse::<Severity>().unwrap(), Severity::Error);
        assert!("loud".parse::<Severity>().is_err());
    }

    #[test]
    fn severity_from_tracing_level() {
        assert_eq!(Severity::from(tracing::Level::ERROR), Severity::Error);
        assert_eq!(Severity::from(tracing::Level::WARN), Severity::Warning);
        assert_eq!(Severity::from(tracing::Level::TRACE), Severity::Trace);
    }

    #[test]
    fn captured_at_utc_converts() {
        let mut s = slot(1, "m", "");
        s.set_captured_at(1_000_000);
        let dt = s.to_record().captured_at_utc().unwrap();
        assert_eq!(dt.timestamp(), 1);
    }

    #[test]
    fn record_serde_roundtrip() {
        let mut s = slot(3, "boom", "SELECT 1");
        s.set_captured_at(123);
        let r = s.to_record();
        let json = serde_json::to_string(&r).unwrap();
        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(r, back);
    }
}
