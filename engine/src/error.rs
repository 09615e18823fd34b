//! Error types for the Evolu engine.

use crate::{ColumnName, TableName};
use thiserror::Error;

/// All possible errors from the engine.
///
/// Every variant is fatal to the operation that produced it; almost none are
/// fatal to the engine. Storage errors bubble up to the host, timestamp
/// errors abort the current mutation, and crypto errors on receive discard
/// the offending message only.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    // Timestamp (HLC) errors
    #[error("timestamp drift exceeded: next {next_millis} is {drift}ms ahead of now {now} (max {max_drift}ms)")]
    TimestampDrift {
        next_millis: u64,
        now: u64,
        drift: u64,
        max_drift: u64,
    },

    #[error("timestamp counter overflow: more than 65535 timestamps in one millisecond")]
    TimestampCounterOverflow,

    #[error("timestamp out of range: {millis} exceeds the 48-bit millisecond bound")]
    TimestampTimeOutOfRange { millis: u64 },

    // Storage errors
    #[error("sqlite error: {0}")]
    Sqlite(String),

    // Protocol errors
    #[error("malformed protocol message: {0}")]
    Protocol(String),

    #[error("unsupported protocol version: got {got}, supported {supported}")]
    ProtocolUnsupportedVersion { got: u8, supported: u8 },

    #[error("symmetric crypto decrypt failed: AEAD tag mismatch")]
    SymmetricCryptoDecrypt,

    // Mutation / schema errors
    #[error("mutation too large: {size} bytes exceeds the {limit} byte limit")]
    InvalidMutationSize { size: usize, limit: usize },

    #[error("mutation for \"{0}\" has no values")]
    EmptyMutation(TableName),

    #[error("table not found in schema: {0}")]
    TableNotFound(TableName),

    #[error("column not found in schema: {table}.{column}")]
    ColumnNotFound {
        table: TableName,
        column: ColumnName,
    },

    #[error("column name is reserved: {0}")]
    ReservedColumn(ColumnName),

    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    // Everything else
    #[error("unknown error: {0}")]
    Unknown(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from the timestamp send/receive rules.
///
/// Kept separate so the HLC module stands on its own; converted into
/// [`Error`] at the engine boundary.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TimestampError {
    #[error("clock drift {drift}ms exceeds maximum {max_drift}ms")]
    Drift {
        next_millis: u64,
        now: u64,
        drift: u64,
        max_drift: u64,
    },

    #[error("counter overflow")]
    CounterOverflow,

    #[error("millis {millis} out of range")]
    TimeOutOfRange { millis: u64 },
}

impl From<TimestampError> for Error {
    fn from(err: TimestampError) -> Self {
        match err {
            TimestampError::Drift {
                next_millis,
                now,
                drift,
                max_drift,
            } => Error::TimestampDrift {
                next_millis,
                now,
                drift,
                max_drift,
            },
            TimestampError::CounterOverflow => Error::TimestampCounterOverflow,
            TimestampError::TimeOutOfRange { millis } => {
                Error::TimestampTimeOutOfRange { millis }
            }
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Sqlite(err.to_string())
    }
}
