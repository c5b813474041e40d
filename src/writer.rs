//! The database writer: the complementary side of the reader.
//!
//! Produces all six files behind a path prefix - the record file, the
//! heartbeat index, and the four descriptor sidecars. Schema entries are
//! registered up front, records are appended in non-decreasing end-tick
//! order, and [`finish`] commits the index and sidecars.
//!
//! [`finish`]: PipeoutWriter::finish

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};

use byteorder::{LittleEndian, WriteBytesExt};

use crate::error::{HeaderError, Result, SchemaError, WriteError};
use crate::index::INDEX_HEADER_PREFIX;
use crate::reader::{INDEX_FILE, RECORD_FILE};
use crate::record::{
    FieldFormat, RecordHeader, RecordKind, KIND_MASK, RECORD_VERSION, SIZE_RECORD_HEADER,
};
use crate::schema::{
    DATA_FILE, DISPLAY_FORMAT_FILE, FIELD_TYPE_INT, FIELD_TYPE_STRING, MAP_FILE, STRING_MAP_FILE,
};

/// One user-supplied pair field value.
#[derive(Debug, Clone, Copy)]
pub enum PairValue<'a> {
    Int(u64),
    Str(&'a str),
}

#[derive(Debug, Clone, Default)]
struct PairTypeDecl {
    names: Vec<String>,
    sizes: Vec<u16>,
    types: Vec<u16>,
    formats: Vec<FieldFormat>,
}

/// Builder for [`PipeoutWriter`].
///
/// ```rust,no_run
/// use pipeout::{PipeoutWriterBuilder, Result};
///
/// fn main() -> Result<()> {
///     let mut writer = PipeoutWriterBuilder::default()
///         .heartbeat(1000)
///         .build("/tmp/db_")?;
///     writer.finish()
/// }
/// ```
#[derive(Debug, Default)]
pub struct PipeoutWriterBuilder {
    heartbeat: Option<u64>,
    version: Option<u32>,
}
impl PipeoutWriterBuilder {
    /// Ticks per heartbeat bucket. Required, must be nonzero.
    #[must_use]
    pub fn heartbeat(mut self, heartbeat: u64) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    /// Format version stamped into the index header. Defaults to
    /// [`RECORD_VERSION`].
    #[must_use]
    pub fn version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    /// Creates the record file and the writer for the database at `prefix`.
    pub fn build(self, prefix: &str) -> Result<PipeoutWriter> {
        let heartbeat = self.heartbeat.unwrap_or(0);
        if heartbeat == 0 {
            return Err(HeaderError::ZeroHeartbeat.into());
        }
        let out = File::create(format!("{prefix}{RECORD_FILE}")).map(BufWriter::new)?;
        Ok(PipeoutWriter {
            prefix: prefix.to_owned(),
            version: self.version.unwrap_or(RECORD_VERSION),
            heartbeat,
            out,
            offset: 0,
            bucket_offsets: Vec::new(),
            last_record_offset: 0,
            last_end_tick: 0,
            locations: BTreeMap::new(),
            pair_types: BTreeMap::new(),
            strings: BTreeMap::new(),
        })
    }
}

/// Writes one pipeline transaction database.
pub struct PipeoutWriter {
    prefix: String,
    version: u32,
    heartbeat: u64,
    out: BufWriter<File>,
    offset: u64,
    bucket_offsets: Vec<u64>,
    last_record_offset: u64,
    last_end_tick: u64,
    locations: BTreeMap<u16, u16>,
    pair_types: BTreeMap<u16, PairTypeDecl>,
    strings: BTreeMap<(u16, u16, u64), String>,
}
impl PipeoutWriter {
    /// Maps a location id to its pair type.
    pub fn map_location(&mut self, location_id: u16, pair_type_id: u16) {
        self.locations.insert(location_id, pair_type_id);
    }

    /// Declares a pair type's user fields as `(name, size, type)` triples.
    /// Display formats default to decimal; see [`set_formats`].
    ///
    /// [`set_formats`]: PipeoutWriter::set_formats
    pub fn declare_pair_type(
        &mut self,
        pair_type_id: u16,
        fields: &[(&str, u16, u16)],
    ) -> Result<()> {
        let mut decl = PairTypeDecl::default();
        for &(name, size, ty) in fields {
            if ty == FIELD_TYPE_INT && size > 8 {
                return Err(SchemaError::FieldTooWide {
                    pair_type: pair_type_id,
                    name: name.to_owned(),
                    size,
                }
                .into());
            }
            decl.names.push(name.to_owned());
            decl.sizes.push(size);
            decl.types.push(ty);
            decl.formats.push(FieldFormat::Decimal);
        }
        self.pair_types.insert(pair_type_id, decl);
        Ok(())
    }

    /// Sets the display formats for a declared pair type's user fields.
    pub fn set_formats(&mut self, pair_type_id: u16, formats: &[FieldFormat]) -> Result<()> {
        let decl = self
            .pair_types
            .get_mut(&pair_type_id)
            .ok_or(SchemaError::UnknownPairType(pair_type_id))?;
        for (slot, format) in decl.formats.iter_mut().zip(formats) {
            *slot = *format;
        }
        Ok(())
    }

    /// Adds a string-map entry. `ordinal` indexes the user-declared field
    /// list.
    pub fn map_string(&mut self, pair_type_id: u16, ordinal: u16, value: u64, display: &str) {
        self.strings
            .insert((pair_type_id, ordinal, value), display.to_owned());
    }

    /// Stamps the kind tag, validates ordering, and tracks the heartbeat
    /// bucket table.
    fn begin_record(&mut self, header: &mut RecordHeader, kind: RecordKind) -> Result<()> {
        if header.start_tick > header.end_tick {
            return Err(WriteError::InvertedInterval {
                start: header.start_tick,
                end: header.end_tick,
            }
            .into());
        }
        if header.end_tick < self.last_end_tick {
            return Err(WriteError::OutOfOrder {
                last: self.last_end_tick,
                got: header.end_tick,
            }
            .into());
        }
        header.flags = (header.flags & !KIND_MASK) | kind.tag();
        let bucket = (header.end_tick / self.heartbeat) as usize;
        while self.bucket_offsets.len() <= bucket {
            self.bucket_offsets.push(self.offset);
        }
        self.last_record_offset = self.offset;
        self.last_end_tick = header.end_tick;
        Ok(())
    }

    /// Appends an annotation record.
    pub fn write_annotation(&mut self, mut header: RecordHeader, text: &str) -> Result<()> {
        self.begin_record(&mut header, RecordKind::Annotation)?;
        header.write_bytes(&mut self.out)?;
        self.out.write_u16::<LittleEndian>(text.len() as u16)?;
        self.out.write_all(text.as_bytes())?;
        self.offset += (SIZE_RECORD_HEADER + 2 + text.len()) as u64;
        Ok(())
    }

    /// Appends an instruction record; its payload fields ride in the base
    /// struct positions.
    pub fn write_instruction(&mut self, mut header: RecordHeader) -> Result<()> {
        self.begin_record(&mut header, RecordKind::Instruction)?;
        header.write_bytes(&mut self.out)?;
        self.offset += SIZE_RECORD_HEADER as u64;
        Ok(())
    }

    /// Appends a memory-operation record.
    pub fn write_memory_op(&mut self, mut header: RecordHeader) -> Result<()> {
        self.begin_record(&mut header, RecordKind::MemoryOp)?;
        header.write_bytes(&mut self.out)?;
        self.offset += SIZE_RECORD_HEADER as u64;
        Ok(())
    }

    /// Appends a pair record. `values` covers the user-declared fields, in
    /// declaration order; the synthetic `pairid` is not supplied. The pair
    /// type is resolved through the location map.
    pub fn write_pair(&mut self, mut header: RecordHeader, values: &[PairValue]) -> Result<()> {
        let pair_type_id = self
            .locations
            .get(&header.location_id)
            .copied()
            .ok_or(SchemaError::UnknownLocation(header.location_id))?;
        let decl = self
            .pair_types
            .get(&pair_type_id)
            .ok_or(SchemaError::UnknownPairType(pair_type_id))?
            .clone();
        if values.len() != decl.names.len() {
            return Err(WriteError::FieldCountMismatch {
                location: header.location_id,
                expected: decl.names.len(),
                got: values.len(),
            }
            .into());
        }

        header.pair_type_id = pair_type_id;
        self.begin_record(&mut header, RecordKind::Pair)?;
        header.write_bytes(&mut self.out)?;
        let mut written = SIZE_RECORD_HEADER;
        for (value, (&size, &ty)) in values.iter().zip(decl.sizes.iter().zip(&decl.types)) {
            match (value, ty) {
                (PairValue::Int(v), FIELD_TYPE_INT) => {
                    self.out.write_all(&v.to_le_bytes()[..size as usize])?;
                    written += size as usize;
                }
                (PairValue::Str(s), FIELD_TYPE_STRING) => {
                    self.out.write_u16::<LittleEndian>(s.len() as u16)?;
                    self.out.write_all(s.as_bytes())?;
                    written += 2 + s.len();
                }
                // Reserved null fields carry no payload; a mismatched value
                // kind is written as its declared type's empty form.
                (_, FIELD_TYPE_INT) => {
                    self.out.write_all(&[0u8; 8][..size as usize])?;
                    written += size as usize;
                }
                (_, FIELD_TYPE_STRING) => {
                    self.out.write_u16::<LittleEndian>(0)?;
                    written += 2;
                }
                _ => {}
            }
        }
        self.offset += written as u64;
        Ok(())
    }

    /// Commits the heartbeat index and the four descriptor sidecars.
    pub fn finish(&mut self) -> Result<()> {
        self.out.flush()?;

        let mut index = File::create(format!("{}{INDEX_FILE}", self.prefix)).map(BufWriter::new)?;
        index.write_all(format!("{INDEX_HEADER_PREFIX}{:04}\n", self.version).as_bytes())?;
        index.write_u64::<LittleEndian>(self.heartbeat)?;
        for &offset in &self.bucket_offsets {
            index.write_u64::<LittleEndian>(offset)?;
        }
        index.write_u64::<LittleEndian>(self.last_record_offset)?;
        index.flush()?;

        let mut map = String::new();
        for (&location, &pair_type) in &self.locations {
            map.push_str(&format!("{location}:{pair_type}\n"));
        }
        Self::write_sidecar(&self.prefix, MAP_FILE, map)?;

        let mut data = String::new();
        let mut formats = String::new();
        for (&pair_type_id, decl) in &self.pair_types {
            data.push_str(&format!("{pair_type_id}:{}", decl.names.len()));
            for i in 0..decl.names.len() {
                data.push_str(&format!(
                    ":{}:{}:{}",
                    decl.names[i], decl.sizes[i], decl.types[i]
                ));
            }
            data.push('\n');

            formats.push_str(itoa::Buffer::new().format(pair_type_id));
            for format in &decl.formats {
                formats.push(':');
                formats.push_str(format.token());
            }
            formats.push('\n');
        }
        Self::write_sidecar(&self.prefix, DATA_FILE, data)?;
        Self::write_sidecar(&self.prefix, DISPLAY_FORMAT_FILE, formats)?;

        let mut strings = String::new();
        for (&(pair_type_id, ordinal, value), display) in &self.strings {
            strings.push_str(&format!("{pair_type_id}:{ordinal}:{value}:{display}\n"));
        }
        Self::write_sidecar(&self.prefix, STRING_MAP_FILE, strings)?;
        Ok(())
    }

    /// Sidecars must never be zero-size: readers treat an empty file as
    /// corrupt, so an empty table is written as a single blank line.
    fn write_sidecar(prefix: &str, name: &str, contents: String) -> Result<()> {
        let contents = if contents.is_empty() {
            "\n".to_owned()
        } else {
            contents
        };
        std::fs::write(format!("{prefix}{name}"), contents)?;
        Ok(())
    }
}
