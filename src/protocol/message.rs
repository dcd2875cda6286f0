//! Wire message framing
//!
//! Every message starts with a fixed 48-byte little-endian header:
//!
//! ```text
//! offset  size  field
//!      0     4  kind (i32)
//!      4     4  OS thread id        (IgnoreAutoClear: ignore flag)
//!      8     4  unique thread id
//!     12    16  timestamp: year, month, day-of-week, day,
//!               hour, minute, second, millisecond (u16 each)
//!     28     4  payload size, in characters, terminators included
//!     32     4  message text offset, in characters (wide payloads)
//!     36     4  source line
//!     40     8  high-resolution counter (f64, milliseconds)
//! ```
//!
//! The payload that follows is `payload size` characters of narrow (one byte)
//! or wide (UTF-16LE) text, depending on the kind.

use bytes::{Buf, BufMut, BytesMut};
use std::cmp::Ordering;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};

use super::constants::HEADER_SIZE;
use crate::error::DecodeError;

// Raw kind values
const KIND_INFORMATION: i32 = 0;
const KIND_ERROR: i32 = 1;
const KIND_SET_PROCESS_NAME: i32 = 2;
const KIND_SET_THREAD_NAME: i32 = 3;
const KIND_INFORMATION_W: i32 = 4;
const KIND_ERROR_W: i32 = 5;
const KIND_SET_PROCESS_NAME_W: i32 = 6;
const KIND_SET_THREAD_NAME_W: i32 = 7;
const KIND_IGNORE_AUTO_CLEAR: i32 = 8;

/// Logical message kind, independent of text encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Information,
    Error,
    SetProcessName,
    SetThreadName,
    IgnoreAutoClear,
}

/// Text encoding of a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextEncoding {
    /// One byte per character, NUL-terminated
    #[default]
    Narrow,
    /// UTF-16LE, two bytes per character
    Wide,
}

impl TextEncoding {
    /// Bytes per character
    pub fn unit_size(self) -> usize {
        match self {
            TextEncoding::Narrow => 1,
            TextEncoding::Wide => 2,
        }
    }
}

impl MessageKind {
    /// Split a raw kind value into kind and encoding
    pub fn from_raw(raw: i32) -> Result<(Self, TextEncoding), DecodeError> {
        use TextEncoding::*;
        let decoded = match raw {
            KIND_INFORMATION => (MessageKind::Information, Narrow),
            KIND_ERROR => (MessageKind::Error, Narrow),
            KIND_SET_PROCESS_NAME => (MessageKind::SetProcessName, Narrow),
            KIND_SET_THREAD_NAME => (MessageKind::SetThreadName, Narrow),
            KIND_INFORMATION_W => (MessageKind::Information, Wide),
            KIND_ERROR_W => (MessageKind::Error, Wide),
            KIND_SET_PROCESS_NAME_W => (MessageKind::SetProcessName, Wide),
            KIND_SET_THREAD_NAME_W => (MessageKind::SetThreadName, Wide),
            KIND_IGNORE_AUTO_CLEAR => (MessageKind::IgnoreAutoClear, Narrow),
            other => return Err(DecodeError::UnknownMessageKind(other)),
        };
        Ok(decoded)
    }

    /// Raw kind value for this kind in the given encoding
    pub fn to_raw(self, encoding: TextEncoding) -> i32 {
        let wide = encoding == TextEncoding::Wide;
        match self {
            MessageKind::Information if wide => KIND_INFORMATION_W,
            MessageKind::Information => KIND_INFORMATION,
            MessageKind::Error if wide => KIND_ERROR_W,
            MessageKind::Error => KIND_ERROR,
            MessageKind::SetProcessName if wide => KIND_SET_PROCESS_NAME_W,
            MessageKind::SetProcessName => KIND_SET_PROCESS_NAME,
            MessageKind::SetThreadName if wide => KIND_SET_THREAD_NAME_W,
            MessageKind::SetThreadName => KIND_SET_THREAD_NAME,
            MessageKind::IgnoreAutoClear => KIND_IGNORE_AUTO_CLEAR,
        }
    }
}

/// Wall-clock timestamp as sent by clients
///
/// Equality is field by field. [`Timestamp::chronological_cmp`] orders from
/// year down to millisecond and ignores the day of week.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Timestamp {
    pub year: u16,
    pub month: u16,
    pub day_of_week: u16,
    pub day: u16,
    pub hour: u16,
    pub minute: u16,
    pub second: u16,
    pub millisecond: u16,
}

impl Timestamp {
    /// Current UTC time
    pub fn now() -> Self {
        Self::from_datetime(&Utc::now())
    }

    /// Calendar fields of `time`, milliseconds truncated
    pub fn from_datetime<Tz: TimeZone>(time: &DateTime<Tz>) -> Self {
        Self {
            year: time.year() as u16,
            month: time.month() as u16,
            day_of_week: time.weekday().num_days_from_sunday() as u16,
            day: time.day() as u16,
            hour: time.hour() as u16,
            minute: time.minute() as u16,
            second: time.second() as u16,
            // A leap second reports 1000 or more
            millisecond: time.timestamp_subsec_millis().min(999) as u16,
        }
    }

    /// Compare points in time, ignoring the day of week
    pub fn chronological_cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }

    fn sort_key(&self) -> [u16; 7] {
        [
            self.year,
            self.month,
            self.day,
            self.hour,
            self.minute,
            self.second,
            self.millisecond,
        ]
    }

    fn decode(buf: &mut impl Buf) -> Self {
        Self {
            year: buf.get_u16_le(),
            month: buf.get_u16_le(),
            day_of_week: buf.get_u16_le(),
            day: buf.get_u16_le(),
            hour: buf.get_u16_le(),
            minute: buf.get_u16_le(),
            second: buf.get_u16_le(),
            millisecond: buf.get_u16_le(),
        }
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.year);
        buf.put_u16_le(self.month);
        buf.put_u16_le(self.day_of_week);
        buf.put_u16_le(self.day);
        buf.put_u16_le(self.hour);
        buf.put_u16_le(self.minute);
        buf.put_u16_le(self.second);
        buf.put_u16_le(self.millisecond);
    }
}

/// Fixed message header
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WireHeader {
    /// Raw kind, validated by [`WireHeader::kind`]
    pub raw_kind: i32,
    pub thread_id: u32,
    pub unique_thread_id: u32,
    pub timestamp: Timestamp,
    /// Payload length in characters
    pub payload_size: u32,
    /// Start of the message text inside a wide payload, in characters
    pub text_offset: u32,
    pub source_line: u32,
    pub counter: f64,
}

impl WireHeader {
    /// Decode a header from exactly [`HEADER_SIZE`] bytes
    pub fn decode(raw: &[u8; HEADER_SIZE]) -> Self {
        let mut buf = &raw[..];
        let raw_kind = buf.get_i32_le();
        let thread_id = buf.get_u32_le();
        let unique_thread_id = buf.get_u32_le();
        let timestamp = Timestamp::decode(&mut buf);
        let payload_size = buf.get_u32_le();
        let text_offset = buf.get_u32_le();
        let source_line = buf.get_u32_le();
        let counter = buf.get_f64_le();

        Self {
            raw_kind,
            thread_id,
            unique_thread_id,
            timestamp,
            payload_size,
            text_offset,
            source_line,
            counter,
        }
    }

    /// Encode the header
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_SIZE);
        buf.put_i32_le(self.raw_kind);
        buf.put_u32_le(self.thread_id);
        buf.put_u32_le(self.unique_thread_id);
        self.timestamp.encode(buf);
        buf.put_u32_le(self.payload_size);
        buf.put_u32_le(self.text_offset);
        buf.put_u32_le(self.source_line);
        buf.put_f64_le(self.counter);
    }

    /// Validated kind and encoding
    pub fn kind(&self) -> Result<(MessageKind, TextEncoding), DecodeError> {
        MessageKind::from_raw(self.raw_kind)
    }

    /// Number of payload bytes following this header
    pub fn payload_len(&self) -> Result<usize, DecodeError> {
        let (kind, encoding) = self.kind()?;
        if kind == MessageKind::IgnoreAutoClear {
            return Ok(0);
        }
        (self.payload_size as usize)
            .checked_mul(encoding.unit_size())
            .ok_or(DecodeError::MalformedPayload("payload size overflows"))
    }
}

/// A trace line as decoded from `Information` / `Error` messages
#[derive(Debug, Clone, PartialEq)]
pub struct TraceRecord {
    pub thread_id: u32,
    pub unique_thread_id: u32,
    pub timestamp: Timestamp,
    pub counter: f64,
    pub source_line: u32,
    pub source_file: String,
    pub text: String,
}

/// A decoded wire message
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// Name for the sending connection's surrogate process id
    SetProcessName { name: String },
    /// Name for one of the sending process's threads
    SetThreadName { unique_thread_id: u32, name: String },
    /// Informational trace line
    Information(TraceRecord),
    /// Error trace line
    Error(TraceRecord),
    /// Whether this connection suppresses auto-clear on connect
    IgnoreAutoClear { ignore: bool },
}

impl WireMessage {
    /// Decode a message from its header and payload bytes
    pub fn decode(header: &WireHeader, payload: &[u8]) -> Result<Self, DecodeError> {
        let (kind, encoding) = header.kind()?;

        match kind {
            MessageKind::SetProcessName => Ok(WireMessage::SetProcessName {
                name: decode_text(payload, encoding)?,
            }),
            MessageKind::SetThreadName => Ok(WireMessage::SetThreadName {
                unique_thread_id: header.unique_thread_id,
                name: decode_text(payload, encoding)?,
            }),
            MessageKind::Information | MessageKind::Error => {
                let (source_file, text) = split_trace_text(payload, encoding, header.text_offset)?;
                let record = TraceRecord {
                    thread_id: header.thread_id,
                    unique_thread_id: header.unique_thread_id,
                    timestamp: header.timestamp,
                    counter: header.counter,
                    source_line: header.source_line,
                    source_file,
                    text,
                };
                if kind == MessageKind::Error {
                    Ok(WireMessage::Error(record))
                } else {
                    Ok(WireMessage::Information(record))
                }
            }
            MessageKind::IgnoreAutoClear => Ok(WireMessage::IgnoreAutoClear {
                ignore: header.thread_id != 0,
            }),
        }
    }

    /// Encode header and payload, as a client writes them
    ///
    /// `thread_id` and `unique_thread_id` fill the header for name messages,
    /// which carry no record of their own.
    pub fn encode(&self, encoding: TextEncoding, thread_id: u32, buf: &mut BytesMut) {
        let mut header = WireHeader {
            thread_id,
            unique_thread_id: thread_id,
            ..Default::default()
        };
        let mut payload = BytesMut::new();

        match self {
            WireMessage::SetProcessName { name } => {
                header.raw_kind = MessageKind::SetProcessName.to_raw(encoding);
                header.payload_size = put_text(&mut payload, name, encoding);
            }
            WireMessage::SetThreadName {
                unique_thread_id,
                name,
            } => {
                header.raw_kind = MessageKind::SetThreadName.to_raw(encoding);
                header.unique_thread_id = *unique_thread_id;
                header.payload_size = put_text(&mut payload, name, encoding);
            }
            WireMessage::Information(record) | WireMessage::Error(record) => {
                let kind = if matches!(self, WireMessage::Error(_)) {
                    MessageKind::Error
                } else {
                    MessageKind::Information
                };
                header.raw_kind = kind.to_raw(encoding);
                header.thread_id = record.thread_id;
                header.unique_thread_id = record.unique_thread_id;
                header.timestamp = record.timestamp;
                header.counter = record.counter;
                header.source_line = record.source_line;
                let file_chars = put_text(&mut payload, &record.source_file, encoding);
                let text_chars = put_text(&mut payload, &record.text, encoding);
                header.payload_size = file_chars + text_chars;
                header.text_offset = file_chars;
            }
            WireMessage::IgnoreAutoClear { ignore } => {
                header.raw_kind = MessageKind::IgnoreAutoClear.to_raw(encoding);
                header.thread_id = u32::from(*ignore);
            }
        }

        header.encode(buf);
        buf.extend_from_slice(&payload);
    }
}

/// Append NUL-terminated text, returning its length in characters
fn put_text(buf: &mut BytesMut, text: &str, encoding: TextEncoding) -> u32 {
    match encoding {
        TextEncoding::Narrow => {
            buf.extend_from_slice(text.as_bytes());
            buf.put_u8(0);
            text.len() as u32 + 1
        }
        TextEncoding::Wide => {
            let mut chars = 0u32;
            for unit in text.encode_utf16() {
                buf.put_u16_le(unit);
                chars += 1;
            }
            buf.put_u16_le(0);
            chars + 1
        }
    }
}

fn wide_units(payload: &[u8]) -> Result<Vec<u16>, DecodeError> {
    if payload.len() % 2 != 0 {
        return Err(DecodeError::MalformedPayload("odd length wide payload"));
    }
    Ok(payload
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

fn until_nul<T: PartialEq + Default>(units: &[T]) -> &[T] {
    let zero = T::default();
    match units.iter().position(|u| *u == zero) {
        Some(end) => &units[..end],
        None => units,
    }
}

/// Decode a single NUL-terminated string
fn decode_text(payload: &[u8], encoding: TextEncoding) -> Result<String, DecodeError> {
    match encoding {
        TextEncoding::Narrow => Ok(String::from_utf8_lossy(until_nul(payload)).into_owned()),
        TextEncoding::Wide => {
            let units = wide_units(payload)?;
            Ok(String::from_utf16_lossy(until_nul(&units)))
        }
    }
}

/// Split a trace payload into source file and message text
///
/// Wide payloads locate the text by `text_offset`; narrow payloads by the
/// terminator of the file name.
fn split_trace_text(
    payload: &[u8],
    encoding: TextEncoding,
    text_offset: u32,
) -> Result<(String, String), DecodeError> {
    match encoding {
        TextEncoding::Narrow => {
            let file = until_nul(payload);
            let rest = payload.get(file.len() + 1..).unwrap_or(&[]);
            Ok((
                String::from_utf8_lossy(file).into_owned(),
                String::from_utf8_lossy(until_nul(rest)).into_owned(),
            ))
        }
        TextEncoding::Wide => {
            let units = wide_units(payload)?;
            let offset = text_offset as usize;
            if offset > units.len() {
                return Err(DecodeError::MalformedPayload("text offset past end of payload"));
            }
            let (file, text) = units.split_at(offset);
            Ok((
                String::from_utf16_lossy(until_nul(file)),
                String::from_utf16_lossy(until_nul(text)),
            ))
        }
    }
}
