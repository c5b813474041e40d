//! Fixed-size record header shared by every transaction kind.
//!
//! Every record in the record file starts with the same packed, little-endian
//! base struct. Field order matters and is part of the writer/reader pact:
//!
//! | bytes  | field                |
//! |--------|----------------------|
//! | 0..8   | `start_tick`         |
//! | 8..16  | `end_tick`           |
//! | 16..24 | `parent_id`          |
//! | 24..32 | `transaction_id`     |
//! | 32..40 | `display_id`         |
//! | 40..48 | `virtual_addr`       |
//! | 48..56 | `physical_addr`      |
//! | 56..60 | `opcode`             |
//! | 60..62 | `control_process_id` |
//! | 62..64 | `pair_type_id`       |
//! | 64..66 | `location_id`        |
//! | 66..68 | `flags`              |

use std::io::Write;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::Result;

/// The supported format generation. Databases written by other generations
/// are refused at open.
pub const RECORD_VERSION: u32 = 2;

/// Byte size of the packed base struct.
pub const SIZE_RECORD_HEADER: usize = 68;

/// Sentinel for "invalid integer" in pair field values.
pub const INVALID_FIELD_VALUE: u64 = u64::MAX;

/// Sentinel for an empty slot in the windowed cache's location arrays.
pub const NO_TRANSACTION: u32 = u32::MAX;

/// Upper bound on annotation payloads. Longer annotations are truncated to
/// this size and the remainder is skipped.
pub const MAX_ANNOTATION_LEN: usize = 16 * 1024;

/// Mask for the 3-bit type tag in `flags`.
pub const KIND_MASK: u16 = 0b111;

/// Head of a logical transaction split across a heartbeat boundary.
pub const FLAG_CONTINUE: u16 = 1 << 4;

/// The four record kinds, as encoded in the low bits of `flags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Instruction = 1,
    MemoryOp = 2,
    Annotation = 3,
    Pair = 4,
}
impl RecordKind {
    /// Decodes the type tag from a `flags` bitfield. Returns `None` for
    /// tags outside the known range.
    #[must_use]
    pub fn from_flags(flags: u16) -> Option<Self> {
        match flags & KIND_MASK {
            1 => Some(Self::Instruction),
            2 => Some(Self::MemoryOp),
            3 => Some(Self::Annotation),
            4 => Some(Self::Pair),
            _ => None,
        }
    }

    /// The tag value as stored in the low bits of `flags`.
    #[must_use]
    pub fn tag(self) -> u16 {
        self as u16
    }
}

/// The base struct common to every record.
///
/// Tick endpoints are `[start_tick, end_tick)` with `end_tick` stored
/// end-exclusive. `start_tick == end_tick` is a legal zero-length record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordHeader {
    pub start_tick: u64,
    pub end_tick: u64,
    pub parent_id: u64,
    pub transaction_id: u64,
    pub display_id: u64,
    pub virtual_addr: u64,
    pub physical_addr: u64,
    pub opcode: u32,
    pub control_process_id: u16,
    pub pair_type_id: u16,
    pub location_id: u16,
    pub flags: u16,
}
impl RecordHeader {
    /// Deserializes a header from a packed 68-byte buffer.
    #[must_use]
    pub fn from_bytes(buffer: &[u8; SIZE_RECORD_HEADER]) -> Self {
        Self {
            start_tick: LittleEndian::read_u64(&buffer[0..8]),
            end_tick: LittleEndian::read_u64(&buffer[8..16]),
            parent_id: LittleEndian::read_u64(&buffer[16..24]),
            transaction_id: LittleEndian::read_u64(&buffer[24..32]),
            display_id: LittleEndian::read_u64(&buffer[32..40]),
            virtual_addr: LittleEndian::read_u64(&buffer[40..48]),
            physical_addr: LittleEndian::read_u64(&buffer[48..56]),
            opcode: LittleEndian::read_u32(&buffer[56..60]),
            control_process_id: LittleEndian::read_u16(&buffer[60..62]),
            pair_type_id: LittleEndian::read_u16(&buffer[62..64]),
            location_id: LittleEndian::read_u16(&buffer[64..66]),
            flags: LittleEndian::read_u16(&buffer[66..68]),
        }
    }

    /// Serializes the header into its packed 68-byte form.
    pub fn write_bytes<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut buffer = [0u8; SIZE_RECORD_HEADER];
        LittleEndian::write_u64(&mut buffer[0..8], self.start_tick);
        LittleEndian::write_u64(&mut buffer[8..16], self.end_tick);
        LittleEndian::write_u64(&mut buffer[16..24], self.parent_id);
        LittleEndian::write_u64(&mut buffer[24..32], self.transaction_id);
        LittleEndian::write_u64(&mut buffer[32..40], self.display_id);
        LittleEndian::write_u64(&mut buffer[40..48], self.virtual_addr);
        LittleEndian::write_u64(&mut buffer[48..56], self.physical_addr);
        LittleEndian::write_u32(&mut buffer[56..60], self.opcode);
        LittleEndian::write_u16(&mut buffer[60..62], self.control_process_id);
        LittleEndian::write_u16(&mut buffer[62..64], self.pair_type_id);
        LittleEndian::write_u16(&mut buffer[64..66], self.location_id);
        LittleEndian::write_u16(&mut buffer[66..68], self.flags);
        writer.write_all(&buffer)?;
        Ok(())
    }

    /// The type tag encoded in `flags`, if it is a known kind.
    #[must_use]
    pub fn kind(&self) -> Option<RecordKind> {
        RecordKind::from_flags(self.flags)
    }

    /// Whether this record is the head of a transaction split across a
    /// heartbeat boundary.
    #[must_use]
    pub fn is_continued(&self) -> bool {
        self.flags & FLAG_CONTINUE != 0
    }

    /// Whether `[start_tick, end_tick)` intersects the query `[lo, hi]`.
    ///
    /// A record ending exactly at `lo` still counts as in range; viewers
    /// draw transactions that close on the query edge.
    #[must_use]
    pub fn overlaps(&self, lo: u64, hi: u64) -> bool {
        !(self.end_tick < lo || self.start_tick > hi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RecordHeader {
        RecordHeader {
            start_tick: 100,
            end_tick: 250,
            parent_id: 7,
            transaction_id: 99,
            display_id: 3,
            virtual_addr: 0xdead_beef,
            physical_addr: 0x1000,
            opcode: 0x1234_5678,
            control_process_id: 2,
            pair_type_id: 11,
            location_id: 5,
            flags: RecordKind::Annotation.tag() | FLAG_CONTINUE,
        }
    }

    #[test]
    fn round_trip_is_byte_identical() -> Result<()> {
        let header = sample();
        let mut buffer = Vec::new();
        header.write_bytes(&mut buffer)?;
        assert_eq!(buffer.len(), SIZE_RECORD_HEADER);

        let mut fixed = [0u8; SIZE_RECORD_HEADER];
        fixed.copy_from_slice(&buffer);
        assert_eq!(RecordHeader::from_bytes(&fixed), header);
        Ok(())
    }

    #[test]
    fn field_order_is_stable() -> Result<()> {
        let header = sample();
        let mut buffer = Vec::new();
        header.write_bytes(&mut buffer)?;
        // Spot-check positions of the first, a middle, and the last field.
        assert_eq!(&buffer[0..8], &100u64.to_le_bytes());
        assert_eq!(&buffer[56..60], &0x1234_5678u32.to_le_bytes());
        assert_eq!(
            &buffer[66..68],
            &(RecordKind::Annotation.tag() | FLAG_CONTINUE).to_le_bytes()
        );
        Ok(())
    }

    #[test]
    fn kind_decoding() {
        assert_eq!(RecordKind::from_flags(1), Some(RecordKind::Instruction));
        assert_eq!(RecordKind::from_flags(2), Some(RecordKind::MemoryOp));
        assert_eq!(RecordKind::from_flags(3), Some(RecordKind::Annotation));
        assert_eq!(RecordKind::from_flags(4 | FLAG_CONTINUE), Some(RecordKind::Pair));
        assert_eq!(RecordKind::from_flags(0), None);
        assert_eq!(RecordKind::from_flags(5), None);
    }

    #[test]
    fn overlap_semantics() {
        let mut header = sample();
        header.start_tick = 100;
        header.end_tick = 200;
        assert!(header.overlaps(150, 160));
        assert!(header.overlaps(0, 100));
        assert!(header.overlaps(200, 300));
        assert!(!header.overlaps(201, 300));
        assert!(!header.overlaps(0, 99));

        // Zero-length records are legal and intersect nothing but their own tick.
        header.end_tick = 100;
        assert!(header.overlaps(100, 100));
        assert!(!header.overlaps(101, 200));
    }
}
