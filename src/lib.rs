//! # pipeout
//!
//! Reader and tooling for heartbeat-indexed pipeline transaction databases:
//! time-indexed binary records of hardware-simulation events, reconstructed
//! as typed annotations, instructions, memory operations, and schema-driven
//! pair records.
//!
//! A database lives behind a path prefix and consists of the record file,
//! the heartbeat index, and four colon-delimited descriptor sidecars. The
//! two primary interfaces are:
//!
//! * [`PipeoutReader`] - streaming queries: every record overlapping a tick
//!   range, delivered in file order through a [`RecordVisitor`].
//! * [`WindowedReader`] - a sliding, prefetched cache that answers "what is
//!   active at tick T at each location" per tick, for interactive viewers.
//!
//! The complementary [`PipeoutWriter`] produces databases, and the
//! `pipeout-search` / `pipeout-dump` binaries are thin consumers of the
//! reader.
//!
//! ## Example
//!
//! ```rust,no_run
//! use pipeout::{PipeoutReader, Record, Result};
//!
//! struct Dump;
//! impl pipeout::RecordVisitor for Dump {
//!     fn visit(&mut self, record: &Record) -> Result<()> {
//!         let header = record.header();
//!         println!("[{}, {}) @{}", header.start_tick, header.end_tick, header.location_id);
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let mut reader = PipeoutReader::open("/data/run1_")?;
//!     reader.stream(reader.first_tick(), reader.last_tick(), Dump)?;
//!     Ok(())
//! }
//! ```

pub mod decoder;
pub mod error;
pub mod index;
pub mod reader;
pub mod record;
pub mod schema;
pub mod stream;
pub mod window;
pub mod writer;

pub use decoder::{RecordDecoder, RecordVisitor};
pub use error::{Error, HeaderError, QueryError, ReadError, Result, SchemaError, WriteError};
pub use index::{HeartbeatIndex, INDEX_HEADER_PREFIX, SIZE_INDEX_HEADER};
pub use reader::{PipeoutReader, INDEX_FILE, RECORD_FILE};
pub use record::{
    AnnotationRecord, FieldFormat, InstructionRecord, MemoryOpRecord, PairRecord, Record,
    RecordHeader, RecordKind, FLAG_CONTINUE, INVALID_FIELD_VALUE, MAX_ANNOTATION_LEN,
    NO_TRANSACTION, RECORD_VERSION, SIZE_RECORD_HEADER,
};
pub use schema::{PairSchema, Schema};
pub use stream::RecordStream;
pub use window::{WindowedReader, DEFAULT_WINDOW_CHUNKS};
pub use writer::{PairValue, PipeoutWriter, PipeoutWriterBuilder};
