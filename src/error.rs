//! Error types for the pipeout crate.
//!
//! Errors are grouped by concern: header/open validation, record-level
//! reads, descriptor-file parsing, and query-time misuse. Everything folds
//! into [`Error`] via `From`, and the crate-wide [`Result`] alias is used
//! throughout.

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Header(#[from] HeaderError),

    #[error(transparent)]
    Read(#[from] ReadError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures while opening or validating a database file.
#[derive(thiserror::Error, Debug)]
pub enum HeaderError {
    #[error("Database file is missing or empty: {0}")]
    MissingOrEmpty(String),

    #[error("Invalid index header: {0:?}")]
    BadIndexHeader(String),

    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u32),

    #[error("Index heartbeat must be nonzero")]
    ZeroHeartbeat,
}

/// Failures while decoding records from the record file.
#[derive(thiserror::Error, Debug)]
pub enum ReadError {
    #[error("Unexpected end of stream at byte offset {1}: {0}")]
    Truncated(std::io::Error, u64),

    #[error("Unknown record type tag {0} at byte offset {1}")]
    UnknownRecordType(u16, u64),
}

/// Failures while parsing the sidecar descriptor files.
#[derive(thiserror::Error, Debug)]
pub enum SchemaError {
    #[error("Malformed descriptor line {line} in {file}")]
    MalformedLine { file: String, line: usize },

    #[error("Location {0} has no pair type mapping")]
    UnknownLocation(u16),

    #[error("Pair type {0} has no schema entry")]
    UnknownPairType(u16),

    #[error("Field `{name}` of pair type {pair_type} is {size} bytes wide (integer fields hold at most 8)")]
    FieldTooWide {
        pair_type: u16,
        name: String,
        size: u16,
    },
}

/// Failures while writing a database.
#[derive(thiserror::Error, Debug)]
pub enum WriteError {
    #[error("Pair record at location {location} carries {got} values, schema declares {expected}")]
    FieldCountMismatch {
        location: u16,
        expected: usize,
        got: usize,
    },

    #[error("Records must be written in non-decreasing end-tick order ({got} after {last})")]
    OutOfOrder { last: u64, got: u64 },

    #[error("Transaction interval is inverted: [{start}, {end})")]
    InvertedInterval { start: u64, end: u64 },
}

/// Query-time misuse of a reader.
#[derive(thiserror::Error, Debug)]
pub enum QueryError {
    #[error("Invalid query range: [{lo}, {hi}]")]
    InvalidRange { lo: u64, hi: u64 },

    #[error("A query is already in progress on this reader")]
    Busy,
}
