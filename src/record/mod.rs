//! Typed transaction records.
//!
//! Every record shares the fixed-size [`RecordHeader`]; the four concrete
//! kinds add their own trailing payloads. [`Record`] is the tagged variant
//! handed to consumers during streaming.

mod header;
mod pair;

use std::borrow::Cow;

pub use header::{
    RecordHeader, RecordKind, FLAG_CONTINUE, INVALID_FIELD_VALUE, KIND_MASK, MAX_ANNOTATION_LEN,
    NO_TRANSACTION, RECORD_VERSION, SIZE_RECORD_HEADER,
};
pub use pair::{FieldFormat, PairRecord};

/// An annotation: free-form UTF-8 text attached to a pipeline slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationRecord {
    pub header: RecordHeader,
    pub text: String,
}

/// An instruction record. Its payload fields live in the base struct
/// positions, so this is a typed view over the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstructionRecord {
    pub header: RecordHeader,
}
impl InstructionRecord {
    #[must_use]
    pub fn opcode(&self) -> u32 {
        self.header.opcode
    }
    #[must_use]
    pub fn virtual_addr(&self) -> u64 {
        self.header.virtual_addr
    }
    #[must_use]
    pub fn physical_addr(&self) -> u64 {
        self.header.physical_addr
    }
}

/// A memory-operation record. Like instructions, a typed view over the
/// base struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryOpRecord {
    pub header: RecordHeader,
}
impl MemoryOpRecord {
    #[must_use]
    pub fn virtual_addr(&self) -> u64 {
        self.header.virtual_addr
    }
    #[must_use]
    pub fn physical_addr(&self) -> u64 {
        self.header.physical_addr
    }
}

/// A decoded record of any kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Annotation(AnnotationRecord),
    Instruction(InstructionRecord),
    MemoryOp(MemoryOpRecord),
    Pair(PairRecord),
}
impl Record {
    /// The base struct shared by every kind.
    #[must_use]
    pub fn header(&self) -> &RecordHeader {
        match self {
            Self::Annotation(r) => &r.header,
            Self::Instruction(r) => &r.header,
            Self::MemoryOp(r) => &r.header,
            Self::Pair(r) => &r.header,
        }
    }

    #[must_use]
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Annotation(_) => RecordKind::Annotation,
            Self::Instruction(_) => RecordKind::Instruction,
            Self::MemoryOp(_) => RecordKind::MemoryOp,
            Self::Pair(_) => RecordKind::Pair,
        }
    }

    /// The record's searchable text: annotation bodies and rendered pair
    /// fields. Instruction and memory-op records carry none.
    #[must_use]
    pub fn search_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Self::Annotation(r) => Some(Cow::Borrowed(r.text.as_str())),
            Self::Pair(r) => Some(Cow::Owned(r.render())),
            Self::Instruction(_) | Self::MemoryOp(_) => None,
        }
    }
}
