//! Converts a positioned [`RecordStream`] into typed [`Record`]s.
//!
//! The decoder branches on the in-band type tag in `flags`. Instruction and
//! memory-op payloads already live in the base struct; annotations carry a
//! length-prefixed text trailer; pair records walk their field descriptor
//! and materialize every field.

use std::sync::Arc;

use auto_impl::auto_impl;
use log::warn;

use crate::error::{ReadError, Result};
use crate::record::{
    AnnotationRecord, FieldFormat, InstructionRecord, MemoryOpRecord, PairRecord, Record,
    RecordHeader, RecordKind, INVALID_FIELD_VALUE, MAX_ANNOTATION_LEN, SIZE_RECORD_HEADER,
};
use crate::schema::{Schema, FIELD_TYPE_INT, FIELD_TYPE_STRING};
use crate::stream::RecordStream;

/// Consumer seam for streaming queries.
///
/// Records borrow the decoder's buffers only for the duration of the call;
/// copy what you need to keep.
#[auto_impl(&mut, Box)]
pub trait RecordVisitor {
    fn visit(&mut self, record: &Record) -> Result<()>;
}

/// Decodes records one at a time from a positioned stream.
pub struct RecordDecoder {
    schema: Arc<Schema>,
    /// Reusable annotation payload buffer, capped at [`MAX_ANNOTATION_LEN`].
    abuf: Vec<u8>,
}
impl RecordDecoder {
    #[must_use]
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            abuf: Vec::new(),
        }
    }

    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Decodes the record at the stream's current position, consuming
    /// exactly its bytes.
    pub fn decode_one(&mut self, stream: &mut RecordStream) -> Result<Record> {
        let start_offset = stream.tell();
        let mut buffer = [0u8; SIZE_RECORD_HEADER];
        stream.read_exact_buf(&mut buffer)?;
        let header = RecordHeader::from_bytes(&buffer);

        let Some(kind) = header.kind() else {
            return Err(ReadError::UnknownRecordType(header.flags & crate::record::KIND_MASK, start_offset).into());
        };
        match kind {
            RecordKind::Annotation => {
                let text = self.read_annotation_text(stream, &header)?;
                Ok(Record::Annotation(AnnotationRecord { header, text }))
            }
            RecordKind::Instruction => Ok(Record::Instruction(InstructionRecord { header })),
            RecordKind::MemoryOp => Ok(Record::MemoryOp(MemoryOpRecord { header })),
            RecordKind::Pair => Ok(Record::Pair(self.decode_pair(stream, header)?)),
        }
    }

    fn read_annotation_text(
        &mut self,
        stream: &mut RecordStream,
        header: &RecordHeader,
    ) -> Result<String> {
        let length = stream.read_u16()? as usize;
        let kept = length.min(MAX_ANNOTATION_LEN);
        self.abuf.resize(kept, 0);
        stream.read_exact_buf(&mut self.abuf)?;
        if length > kept {
            warn!(
                "annotation on transaction {} truncated from {} to {} bytes",
                header.transaction_id, length, kept
            );
            stream.skip((length - kept) as i64)?;
        }
        Ok(String::from_utf8_lossy(&self.abuf).into_owned())
    }

    fn decode_pair(&mut self, stream: &mut RecordStream, header: RecordHeader) -> Result<PairRecord> {
        let pair_type_id = self.schema.pair_type_of(header.location_id)?;
        let pair_schema = self.schema.pair_schema(pair_type_id)?.clone();
        let n = pair_schema.num_fields();

        let mut values = Vec::with_capacity(n);
        let mut strings = Vec::with_capacity(n);

        // Field 0 is the synthetic pairid.
        values.push((u64::from(pair_type_id), false));
        strings.push(FieldFormat::Decimal.render(u64::from(pair_type_id)));

        for i in 1..n {
            match pair_schema.types[i] {
                FIELD_TYPE_INT => {
                    let size = pair_schema.sizes[i] as usize;
                    let mut raw = [0u8; 8];
                    stream.read_exact_buf(&mut raw[..size])?;
                    let value = u64::from_le_bytes(raw);

                    // The string map indexes the user-declared field list,
                    // i.e. without the synthetic pairid at 0.
                    let ordinal = (i - 1) as u16;
                    if let Some(named) = self.schema.lookup_string(pair_type_id, ordinal, value) {
                        values.push((value, false));
                        strings.push(named.to_owned());
                    } else if value == INVALID_FIELD_VALUE {
                        values.push((value, true));
                        strings.push(String::new());
                    } else {
                        values.push((value, true));
                        strings.push(pair_schema.formats[i].render(value));
                    }
                }
                FIELD_TYPE_STRING => {
                    let length = stream.read_u16()? as usize;
                    let mut raw = vec![0u8; length];
                    stream.read_exact_buf(&mut raw)?;
                    // Some producers NUL-terminate embedded strings; the
                    // length prefix is authoritative either way.
                    if raw.last() == Some(&0) {
                        raw.pop();
                    }
                    values.push((INVALID_FIELD_VALUE, true));
                    strings.push(String::from_utf8_lossy(&raw).into_owned());
                }
                _ => {
                    // Reserved null field.
                    values.push((0, false));
                    strings.push("none".to_owned());
                }
            }
        }

        Ok(PairRecord {
            header,
            pair_type_id,
            field_names: pair_schema.names,
            field_sizes: pair_schema.sizes,
            field_values: values,
            field_strings: strings,
            field_formats: pair_schema.formats,
        })
    }
}
