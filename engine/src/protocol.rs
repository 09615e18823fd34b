//! Binary protocol envelope.
//!
//! An envelope carries a version byte, the owner id, an optional write key
//! (writes only), a list of AEAD-sealed change records, and optional usage
//! accounting. Relays see owner ids and ciphertext, nothing else. All
//! multi-byte integers are big-endian.

use crate::crypto::SymmetricCrypto;
use crate::db::CrdtMessage;
use crate::error::{Error, Result};
use crate::owner::{EncryptionKey, OwnerId, WriteKey, OWNER_ID_LENGTH, WRITE_KEY_LENGTH};
use crate::random::RandomSource;
use crate::schema::Id;
use crate::timestamp::{Timestamp, TIMESTAMP_LENGTH};
use crate::value::Value;

/// Current protocol version. A peer speaking another version is rejected.
pub const PROTOCOL_VERSION: u8 = 1;

const FLAG_WRITE_KEY: u8 = 0b0000_0001;
const FLAG_USAGE: u8 = 0b0000_0010;

const TAG_NULL: u8 = 0;
const TAG_INTEGER: u8 = 1;
const TAG_REAL: u8 = 2;
const TAG_TEXT: u8 = 3;
const TAG_BLOB: u8 = 4;

/// Per-owner usage accounting for relay quota tracking.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Usage {
    pub stored_bytes: u64,
    pub received_bytes: u64,
    pub sent_bytes: u64,
    pub first_timestamp: Option<Timestamp>,
    pub last_timestamp: Option<Timestamp>,
}

impl Usage {
    /// Fold an observed timestamp into the first/last range.
    pub fn observe_timestamp(&mut self, timestamp: Timestamp) {
        match self.first_timestamp {
            Some(first) if first <= timestamp => {}
            _ => self.first_timestamp = Some(timestamp),
        }
        match self.last_timestamp {
            Some(last) if last >= timestamp => {}
            _ => self.last_timestamp = Some(timestamp),
        }
    }
}

/// A decoded envelope; records are still sealed.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub owner_id: OwnerId,
    pub write_key: Option<WriteKey>,
    pub sealed_records: Vec<Vec<u8>>,
    pub usage: Option<Usage>,
}

/// Result of opening an envelope's records: decrypt failures drop the
/// offending record only.
#[derive(Debug, Default)]
pub struct OpenedRecords {
    pub messages: Vec<CrdtMessage>,
    pub dropped: Vec<Error>,
}

/// Seal messages into an envelope for one owner.
pub fn encode_envelope(
    owner_id: OwnerId,
    write_key: Option<WriteKey>,
    messages: &[CrdtMessage],
    encryption_key: &EncryptionKey,
    usage: Option<&Usage>,
    random: &dyn RandomSource,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.push(PROTOCOL_VERSION);

    let mut flags = 0u8;
    if write_key.is_some() {
        flags |= FLAG_WRITE_KEY;
    }
    if usage.is_some() {
        flags |= FLAG_USAGE;
    }
    out.push(flags);
    out.extend_from_slice(&owner_id.0);
    if let Some(key) = write_key {
        out.extend_from_slice(&key.0);
    }

    out.extend_from_slice(&(messages.len() as u32).to_be_bytes());
    for message in messages {
        let plaintext = encode_record(message);
        let sealed = SymmetricCrypto::seal(&encryption_key.0, &plaintext, random)?;
        out.extend_from_slice(&(sealed.len() as u32).to_be_bytes());
        out.extend_from_slice(&sealed);
    }

    if let Some(usage) = usage {
        encode_usage(&mut out, usage);
    }

    Ok(out)
}

/// Parse an envelope without opening its records.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope> {
    let mut reader = Reader::new(bytes);

    let version = reader.u8()?;
    if version != PROTOCOL_VERSION {
        return Err(Error::ProtocolUnsupportedVersion {
            got: version,
            supported: PROTOCOL_VERSION,
        });
    }

    let flags = reader.u8()?;
    let owner_id = OwnerId(reader.array::<OWNER_ID_LENGTH>()?);
    let write_key = if flags & FLAG_WRITE_KEY != 0 {
        Some(WriteKey(reader.array::<WRITE_KEY_LENGTH>()?))
    } else {
        None
    };

    let count = reader.u32()? as usize;
    let mut sealed_records = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let len = reader.u32()? as usize;
        sealed_records.push(reader.bytes(len)?.to_vec());
    }

    let usage = if flags & FLAG_USAGE != 0 {
        Some(decode_usage(&mut reader)?)
    } else {
        None
    };

    if !reader.is_empty() {
        return Err(Error::Protocol("trailing bytes in envelope".into()));
    }

    Ok(Envelope {
        owner_id,
        write_key,
        sealed_records,
        usage,
    })
}

/// Open every sealed record with the owner's encryption key.
///
/// Records that fail to decrypt or parse are dropped and reported; the rest
/// apply normally.
pub fn open_envelope_records(envelope: &Envelope, key: &EncryptionKey) -> OpenedRecords {
    let mut opened = OpenedRecords::default();
    for sealed in &envelope.sealed_records {
        let result = SymmetricCrypto::open(&key.0, sealed)
            .and_then(|plaintext| decode_record(envelope.owner_id, &plaintext));
        match result {
            Ok(message) => opened.messages.push(message),
            Err(err) => {
                tracing::warn!(owner = %envelope.owner_id, %err, "dropped change record");
                opened.dropped.push(err);
            }
        }
    }
    opened
}

fn encode_record(message: &CrdtMessage) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(message.table.len() as u16).to_be_bytes());
    out.extend_from_slice(message.table.as_bytes());
    out.extend_from_slice(&message.id.0);
    out.extend_from_slice(&(message.column.len() as u16).to_be_bytes());
    out.extend_from_slice(message.column.as_bytes());

    match &message.value {
        Value::Null => {
            out.push(TAG_NULL);
            out.extend_from_slice(&0u32.to_be_bytes());
        }
        Value::Integer(i) => {
            out.push(TAG_INTEGER);
            out.extend_from_slice(&8u32.to_be_bytes());
            out.extend_from_slice(&i.to_be_bytes());
        }
        Value::Real(f) => {
            out.push(TAG_REAL);
            out.extend_from_slice(&8u32.to_be_bytes());
            out.extend_from_slice(&f.to_bits().to_be_bytes());
        }
        Value::Text(s) => {
            out.push(TAG_TEXT);
            out.extend_from_slice(&(s.len() as u32).to_be_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        Value::Blob(b) => {
            out.push(TAG_BLOB);
            out.extend_from_slice(&(b.len() as u32).to_be_bytes());
            out.extend_from_slice(b);
        }
        // Json never leaves the query layer; ship its serialized form.
        Value::Json(v) => {
            let s = v.to_string();
            out.push(TAG_TEXT);
            out.extend_from_slice(&(s.len() as u32).to_be_bytes());
            out.extend_from_slice(s.as_bytes());
        }
    }

    out.extend_from_slice(&message.timestamp.encode());
    out
}

fn decode_record(owner_id: OwnerId, plaintext: &[u8]) -> Result<CrdtMessage> {
    let mut reader = Reader::new(plaintext);

    let table_len = reader.u16()? as usize;
    let table = reader.utf8(table_len)?;
    let id = Id(reader.array::<16>()?);
    let column_len = reader.u16()? as usize;
    let column = reader.utf8(column_len)?;

    let tag = reader.u8()?;
    let value_len = reader.u32()? as usize;
    let value = match tag {
        TAG_NULL => {
            if value_len != 0 {
                return Err(Error::Protocol("null value with payload".into()));
            }
            Value::Null
        }
        TAG_INTEGER if value_len == 8 => Value::Integer(i64::from_be_bytes(reader.array::<8>()?)),
        TAG_REAL if value_len == 8 => {
            Value::Real(f64::from_bits(u64::from_be_bytes(reader.array::<8>()?)))
        }
        TAG_TEXT => Value::Text(reader.utf8(value_len)?),
        TAG_BLOB => Value::Blob(reader.bytes(value_len)?.to_vec()),
        other => return Err(Error::Protocol(format!("unknown value tag {other}"))),
    };

    let timestamp = Timestamp::decode(reader.bytes(TIMESTAMP_LENGTH)?)
        .ok_or_else(|| Error::Protocol("bad record timestamp".into()))?;

    if !reader.is_empty() {
        return Err(Error::Protocol("trailing bytes in record".into()));
    }

    Ok(CrdtMessage {
        owner_id,
        table,
        id,
        column,
        value,
        timestamp,
    })
}

fn encode_usage(out: &mut Vec<u8>, usage: &Usage) {
    out.extend_from_slice(&usage.stored_bytes.to_be_bytes());
    out.extend_from_slice(&usage.received_bytes.to_be_bytes());
    out.extend_from_slice(&usage.sent_bytes.to_be_bytes());

    let mut presence = 0u8;
    if usage.first_timestamp.is_some() {
        presence |= 0b01;
    }
    if usage.last_timestamp.is_some() {
        presence |= 0b10;
    }
    out.push(presence);
    if let Some(first) = usage.first_timestamp {
        out.extend_from_slice(&first.encode());
    }
    if let Some(last) = usage.last_timestamp {
        out.extend_from_slice(&last.encode());
    }
}

fn decode_usage(reader: &mut Reader<'_>) -> Result<Usage> {
    let stored_bytes = u64::from_be_bytes(reader.array::<8>()?);
    let received_bytes = u64::from_be_bytes(reader.array::<8>()?);
    let sent_bytes = u64::from_be_bytes(reader.array::<8>()?);

    let presence = reader.u8()?;
    let first_timestamp = if presence & 0b01 != 0 {
        Some(
            Timestamp::decode(reader.bytes(TIMESTAMP_LENGTH)?)
                .ok_or_else(|| Error::Protocol("bad usage timestamp".into()))?,
        )
    } else {
        None
    };
    let last_timestamp = if presence & 0b10 != 0 {
        Some(
            Timestamp::decode(reader.bytes(TIMESTAMP_LENGTH)?)
                .ok_or_else(|| Error::Protocol("bad usage timestamp".into()))?,
        )
    } else {
        None
    };

    Ok(Usage {
        stored_bytes,
        received_bytes,
        sent_bytes,
        first_timestamp,
        last_timestamp,
    })
}

/// A bounds-checked cursor over wire bytes.
struct Reader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    fn is_empty(&self) -> bool {
        self.position == self.bytes.len()
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .position
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| Error::Protocol("unexpected end of message".into()))?;
        let slice = &self.bytes[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array::<2>()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array::<4>()?))
    }

    fn utf8(&mut self, len: usize) -> Result<String> {
        std::str::from_utf8(self.bytes(len)?)
            .map(str::to_string)
            .map_err(|_| Error::Protocol("invalid utf-8".into()))
    }
}
