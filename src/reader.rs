//! The streaming reader: opens a database by path prefix and delivers
//! decoded records for tick-range queries.
//!
//! A database lives behind a path prefix `P` as `P + "record.bin"`,
//! `P + "index.bin"`, and the four descriptor sidecars consumed by
//! [`Schema`]. The reader keeps the record and index files open for its
//! lifetime and reopens them (preserving position) when the upstream
//! writer has appended.

use std::sync::Arc;

use log::debug;

use crate::decoder::{RecordDecoder, RecordVisitor};
use crate::error::{QueryError, Result};
use crate::index::{HeartbeatIndex, SIZE_INDEX_PREAMBLE};
use crate::record::Record;
use crate::schema::Schema;
use crate::stream::RecordStream;

pub const RECORD_FILE: &str = "record.bin";
pub const INDEX_FILE: &str = "index.bin";

/// A reader over one pipeline transaction database.
///
/// Not thread-safe: one query at a time per reader. Schema tables are
/// immutable after open and may be shared freely via [`schema`].
///
/// [`schema`]: PipeoutReader::schema
pub struct PipeoutReader {
    prefix: String,
    stream: RecordStream,
    index: HeartbeatIndex,
    decoder: RecordDecoder,
    first_tick: u64,
    last_tick: u64,
    /// Byte length of the heartbeat-covered prefix of the record file.
    /// Growth past this is invisible until the index catches up.
    visible_len: u64,
    in_query: bool,
    update_enabled: bool,
    updated: bool,
    known_index_len: u64,
    known_record_len: u64,
}
impl PipeoutReader {
    /// Opens the database at `prefix`.
    ///
    /// # Errors
    ///
    /// `HeaderError::MissingOrEmpty` when any of the six files is absent or
    /// zero-size; `HeaderError::UnsupportedVersion` for a foreign format
    /// generation; schema errors for mangled descriptors.
    pub fn open(prefix: &str) -> Result<Self> {
        let stream = RecordStream::open(format!("{prefix}{RECORD_FILE}"))?;
        let index = HeartbeatIndex::open(format!("{prefix}{INDEX_FILE}"))?;
        let schema = Arc::new(Schema::load(prefix)?);
        let decoder = RecordDecoder::new(schema);

        let known_index_len = std::fs::metadata(format!("{prefix}{INDEX_FILE}"))?.len();
        let known_record_len = stream.byte_len()?;

        let mut reader = Self {
            prefix: prefix.to_owned(),
            stream,
            index,
            decoder,
            first_tick: 0,
            last_tick: 0,
            visible_len: 0,
            in_query: false,
            update_enabled: true,
            updated: false,
            known_index_len,
            known_record_len,
        };
        reader.resolve_ticks()?;
        Ok(reader)
    }

    /// Re-derives `first_tick`, `last_tick`, and the visible byte length
    /// from the current index entries.
    fn resolve_ticks(&mut self) -> Result<()> {
        self.stream.seek_to(self.index.bucket_offset(0, 0))?;
        let mut buffer = [0u8; crate::record::SIZE_RECORD_HEADER];
        self.stream.read_exact_buf(&mut buffer)?;
        self.first_tick = crate::record::RecordHeader::from_bytes(&buffer).start_tick;

        // Decode the record at the sentinel in full: its end tick is the
        // database's last tick, and the stream position afterwards bounds
        // the heartbeat-covered prefix.
        self.stream.seek_to(self.index.sentinel_offset())?;
        let last = self.decoder.decode_one(&mut self.stream)?;
        self.last_tick = last.header().end_tick.saturating_sub(1);
        self.visible_len = self.stream.tell();
        Ok(())
    }

    /// Start tick of the first record.
    #[must_use]
    pub fn first_tick(&self) -> u64 {
        self.first_tick
    }

    /// Last covered tick (`end_tick − 1` of the final record).
    #[must_use]
    pub fn last_tick(&self) -> u64 {
        self.last_tick
    }

    #[must_use]
    pub fn heartbeat(&self) -> u64 {
        self.index.heartbeat()
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.index.version()
    }

    /// Width of the location space (one past the highest mapped id).
    #[must_use]
    pub fn num_locations(&self) -> usize {
        self.decoder.schema().num_locations()
    }

    /// The shared schema tables.
    #[must_use]
    pub fn schema(&self) -> Arc<Schema> {
        Arc::clone(self.decoder.schema())
    }

    /// Decodes and delivers every record whose `[start, end)` interval
    /// overlaps `[q_lo, q_hi]`, in file order. Returns the number of
    /// records delivered.
    ///
    /// Records are skipped silently (bytes consumed, no visit) when they
    /// fall outside the range; partial deliveries before a mid-query error
    /// are not rolled back.
    pub fn stream<V: RecordVisitor>(&mut self, q_lo: u64, q_hi: u64, mut visitor: V) -> Result<usize> {
        if q_hi < q_lo {
            return Err(QueryError::InvalidRange { lo: q_lo, hi: q_hi }.into());
        }
        if self.in_query {
            return Err(QueryError::Busy.into());
        }
        self.in_query = true;
        let result = self.stream_inner(q_lo, q_hi, &mut visitor);
        self.in_query = false;
        result
    }

    fn stream_inner<V: RecordVisitor>(
        &mut self,
        q_lo: u64,
        q_hi: u64,
        visitor: &mut V,
    ) -> Result<usize> {
        let lo_off = self.index.offset_for(q_lo, self.visible_len);
        let hi_off = self.index.end_offset_for(q_hi, self.visible_len);
        let mut delivered = 0;
        self.scan_bytes(lo_off, hi_off, |record| {
            if record.header().overlaps(q_lo, q_hi) {
                delivered += 1;
                visitor.visit(record)?;
            }
            Ok(())
        })?;
        Ok(delivered)
    }

    /// Decodes every record in `[lo_off, hi_off)`, clamped to the visible
    /// prefix, handing each to `f` without range filtering.
    pub(crate) fn scan_bytes<F>(&mut self, lo_off: u64, hi_off: u64, mut f: F) -> Result<()>
    where
        F: FnMut(&Record) -> Result<()>,
    {
        let hi_off = hi_off.min(self.visible_len);
        if lo_off >= hi_off {
            return Ok(());
        }
        self.stream.seek_to(lo_off)?;
        while self.stream.tell() < hi_off {
            let record = self.decoder.decode_one(&mut self.stream)?;
            f(&record)?;
        }
        Ok(())
    }

    /// Decodes every record stored in heartbeat buckets
    /// `[bucket_lo, bucket_hi]`.
    pub(crate) fn scan_buckets<F>(&mut self, bucket_lo: u64, bucket_hi: u64, f: F) -> Result<()>
    where
        F: FnMut(&Record) -> Result<()>,
    {
        let lo_off = self.index.bucket_offset(bucket_lo, self.visible_len);
        let hi_off = self.index.bucket_offset(bucket_hi + 1, self.visible_len);
        self.scan_bytes(lo_off, hi_off, f)
    }

    pub(crate) fn last_bucket(&self) -> u64 {
        self.last_tick / self.heartbeat()
    }

    /// Whether the database grew behind this reader. Stats the index and
    /// record files; when the index gained at least one complete entry and
    /// the record file grew, handles are reopened, the index is reloaded,
    /// and `last_tick` extends. Stays set until [`ack_updated`].
    ///
    /// [`ack_updated`]: PipeoutReader::ack_updated
    pub fn is_updated(&mut self) -> Result<bool> {
        if self.update_enabled {
            self.check_update()?;
        }
        Ok(self.updated)
    }

    /// Clears the update flag.
    pub fn ack_updated(&mut self) {
        self.updated = false;
    }

    /// Runs the growth check regardless of whether updates are enabled.
    pub fn force_update(&mut self) -> Result<()> {
        self.check_update()
    }

    pub fn enable_update(&mut self) {
        self.update_enabled = true;
    }

    pub fn disable_update(&mut self) {
        self.update_enabled = false;
    }

    fn check_update(&mut self) -> Result<()> {
        let index_len = std::fs::metadata(format!("{}{INDEX_FILE}", self.prefix))?.len();
        let record_len = self.stream.byte_len()?;

        // Only whole index entries count: growth inside a heartbeat stays
        // invisible until the writer commits the bucket.
        let known_entries = self.known_index_len.saturating_sub(SIZE_INDEX_PREAMBLE) / 8;
        let new_entries = index_len.saturating_sub(SIZE_INDEX_PREAMBLE) / 8;
        if new_entries > known_entries && record_len > self.known_record_len {
            self.stream.reopen()?;
            self.index.reload()?;
            self.known_index_len = index_len;
            self.known_record_len = record_len;
            self.resolve_ticks()?;
            self.updated = true;
            debug!(
                "database {} grew: last tick now {}",
                self.prefix, self.last_tick
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;
    use crate::record::{
        FieldFormat, RecordHeader, RecordKind, FLAG_CONTINUE, INVALID_FIELD_VALUE,
        SIZE_RECORD_HEADER,
    };
    use crate::writer::{PairValue, PipeoutWriter, PipeoutWriterBuilder};

    struct Collect(Vec<Record>);
    impl RecordVisitor for Collect {
        fn visit(&mut self, record: &Record) -> Result<()> {
            self.0.push(record.clone());
            Ok(())
        }
    }

    fn annotation(start: u64, end: u64, location: u16) -> RecordHeader {
        RecordHeader {
            start_tick: start,
            end_tick: end,
            location_id: location,
            ..RecordHeader::default()
        }
    }

    fn temp_prefix(dir: &tempfile::TempDir) -> String {
        format!("{}/db_", dir.path().display())
    }

    fn writer(prefix: &str, heartbeat: u64) -> PipeoutWriter {
        PipeoutWriterBuilder::default()
            .heartbeat(heartbeat)
            .build(prefix)
            .unwrap()
    }

    #[test]
    fn single_annotation_round_trip() -> Result<()> {
        // One annotation {0, 10, loc 3, "hello"} under a 1000-tick heartbeat.
        let dir = tempfile::tempdir().unwrap();
        let prefix = temp_prefix(&dir);
        let mut w = writer(&prefix, 1000);
        w.write_annotation(annotation(0, 10, 3), "hello")?;
        w.finish()?;

        let mut reader = PipeoutReader::open(&prefix)?;
        assert_eq!(reader.first_tick(), 0);
        assert_eq!(reader.last_tick(), 9);
        assert_eq!(reader.heartbeat(), 1000);
        assert_eq!(reader.version(), 2);

        let mut out = Collect(Vec::new());
        assert_eq!(reader.stream(0, 1000, &mut out)?, 1);
        let Record::Annotation(record) = &out.0[0] else {
            panic!("expected annotation");
        };
        assert_eq!(record.text, "hello");
        assert_eq!(record.header.location_id, 3);
        Ok(())
    }

    #[test]
    fn all_record_kinds_round_trip_in_file_order() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let prefix = temp_prefix(&dir);
        let mut w = writer(&prefix, 100);
        w.map_location(1, 7);
        w.declare_pair_type(7, &[("uop", 2, 0), ("mnemonic", 8, 1)])?;

        w.write_annotation(annotation(0, 10, 0), "note")?;
        let mut inst = annotation(5, 20, 2);
        inst.opcode = 0xfeed_f00d;
        inst.virtual_addr = 0x8000_0000;
        inst.physical_addr = 0x1234;
        inst.transaction_id = 11;
        w.write_instruction(inst)?;
        let mut mem = annotation(10, 30, 3);
        mem.virtual_addr = 0xcafe;
        mem.physical_addr = 0xbeef;
        w.write_memory_op(mem)?;
        w.write_pair(annotation(20, 40, 1), &[PairValue::Int(9), PairValue::Str("r1,r2")])?;
        w.finish()?;

        let mut reader = PipeoutReader::open(&prefix)?;
        let mut out = Collect(Vec::new());
        assert_eq!(reader.stream(0, 100, &mut out)?, 4);

        assert_eq!(out.0[0].kind(), RecordKind::Annotation);
        let Record::Instruction(i) = &out.0[1] else {
            panic!("expected instruction")
        };
        assert_eq!(i.opcode(), 0xfeed_f00d);
        assert_eq!(i.virtual_addr(), 0x8000_0000);
        assert_eq!(i.physical_addr(), 0x1234);
        assert_eq!(i.header.transaction_id, 11);
        let Record::MemoryOp(m) = &out.0[2] else {
            panic!("expected memory op")
        };
        assert_eq!(m.virtual_addr(), 0xcafe);
        assert_eq!(m.physical_addr(), 0xbeef);
        let Record::Pair(p) = &out.0[3] else { panic!("expected pair") };
        assert_eq!(p.field_names, vec!["pairid", "uop", "mnemonic"]);
        assert_eq!(p.field_strings, vec!["7", "9", "r1,r2"]);
        Ok(())
    }

    #[test]
    fn boundary_spanner_is_delivered() -> Result<()> {
        // Two annotations; the second spans the heartbeat boundary. A query
        // inside the second's interval delivers only it.
        let dir = tempfile::tempdir().unwrap();
        let prefix = temp_prefix(&dir);
        let mut w = writer(&prefix, 1000);
        w.write_annotation(annotation(0, 500, 1), "a")?;
        let mut spanner = annotation(500, 1500, 1);
        spanner.flags = FLAG_CONTINUE;
        w.write_annotation(spanner, "b")?;
        w.finish()?;

        let mut reader = PipeoutReader::open(&prefix)?;
        let mut out = Collect(Vec::new());
        assert_eq!(reader.stream(600, 700, &mut out)?, 1);
        let Record::Annotation(record) = &out.0[0] else {
            panic!("expected annotation")
        };
        assert_eq!(record.text, "b");
        assert!(record.header.is_continued());
        Ok(())
    }

    #[test]
    fn pair_string_map_precedence() -> Result<()> {
        // Schema {uop:2:int, mnemonic:8:string} on pair type 7 with a
        // string-map entry for (7, 0, 42); a second all-integer type checks
        // formatting of unmapped and invalid values.
        let dir = tempfile::tempdir().unwrap();
        let prefix = temp_prefix(&dir);
        let mut w = writer(&prefix, 1000);
        w.map_location(3, 7);
        w.map_location(4, 8);
        w.declare_pair_type(7, &[("uop", 2, 0), ("mnemonic", 8, 1)])?;
        w.declare_pair_type(8, &[("a", 2, 0), ("b", 8, 0)])?;
        w.set_formats(8, &[FieldFormat::Hex, FieldFormat::Decimal])?;
        w.map_string(7, 0, 42, "add");

        w.write_pair(annotation(0, 10, 3), &[PairValue::Int(42), PairValue::Str("r1,r2")])?;
        w.write_pair(
            annotation(5, 15, 4),
            &[PairValue::Int(43), PairValue::Int(INVALID_FIELD_VALUE)],
        )?;
        w.finish()?;

        let mut reader = PipeoutReader::open(&prefix)?;
        let mut out = Collect(Vec::new());
        assert_eq!(reader.stream(0, 100, &mut out)?, 2);

        let Record::Pair(p) = &out.0[0] else { panic!("expected pair") };
        assert_eq!(p.pair_type_id, 7);
        assert_eq!(p.field_names, vec!["pairid", "uop", "mnemonic"]);
        assert_eq!(p.field_strings, vec!["7", "add", "r1,r2"]);
        assert_eq!(
            p.field_values,
            vec![(7, false), (42, false), (INVALID_FIELD_VALUE, true)]
        );

        let Record::Pair(p) = &out.0[1] else { panic!("expected pair") };
        // Unmapped values format under the declared radix; the invalid
        // sentinel renders as the empty string.
        assert_eq!(p.field_strings, vec!["8", "0x2b", ""]);
        assert_eq!(
            p.field_values,
            vec![(8, false), (43, true), (INVALID_FIELD_VALUE, true)]
        );
        Ok(())
    }

    #[test]
    fn query_past_index_coverage_is_empty() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let prefix = temp_prefix(&dir);
        let mut w = writer(&prefix, 1000);
        for k in 0..10u64 {
            w.write_annotation(annotation(k * 1000, k * 1000 + 500, 0), "x")?;
        }
        w.finish()?;

        let mut reader = PipeoutReader::open(&prefix)?;
        let mut out = Collect(Vec::new());
        assert_eq!(reader.stream(50_000, 51_000, &mut out)?, 0);
        Ok(())
    }

    #[test]
    fn invalid_range_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let prefix = temp_prefix(&dir);
        let mut w = writer(&prefix, 1000);
        w.write_annotation(annotation(0, 10, 0), "x")?;
        w.finish()?;

        let mut reader = PipeoutReader::open(&prefix)?;
        let mut out = Collect(Vec::new());
        assert!(matches!(
            reader.stream(10, 5, &mut out),
            Err(crate::error::Error::Query(QueryError::InvalidRange { lo: 10, hi: 5 }))
        ));
        Ok(())
    }

    #[test]
    fn open_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let prefix = temp_prefix(&dir);
        let mut w = writer(&prefix, 250);
        w.write_annotation(annotation(3, 900, 0), "x")?;
        w.finish()?;

        let a = PipeoutReader::open(&prefix)?;
        let b = PipeoutReader::open(&prefix)?;
        assert_eq!(a.first_tick(), b.first_tick());
        assert_eq!(a.last_tick(), b.last_tick());
        assert_eq!(a.heartbeat(), b.heartbeat());
        assert_eq!(a.version(), b.version());
        Ok(())
    }

    #[test]
    fn missing_sidecar_fails_open() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let prefix = temp_prefix(&dir);
        let mut w = writer(&prefix, 1000);
        w.write_annotation(annotation(0, 10, 0), "x")?;
        w.finish()?;
        std::fs::remove_file(format!("{prefix}{}", crate::schema::MAP_FILE))?;
        assert!(matches!(
            PipeoutReader::open(&prefix),
            Err(crate::error::Error::Header(
                crate::error::HeaderError::MissingOrEmpty(_)
            ))
        ));
        Ok(())
    }

    #[test]
    fn append_visibility_tracks_whole_heartbeats() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let prefix = temp_prefix(&dir);

        // Generation 1: one heartbeat of records.
        let mut w = writer(&prefix, 100);
        w.write_annotation(annotation(0, 10, 0), "a")?;
        w.write_annotation(annotation(20, 30, 0), "b")?;
        w.finish()?;

        let mut reader = PipeoutReader::open(&prefix)?;
        assert_eq!(reader.last_tick(), 29);
        assert!(!reader.is_updated()?);

        // Generation 2 replays the same records and commits one more
        // heartbeat; from the reader's side both files simply grew.
        let mut w = writer(&prefix, 100);
        w.write_annotation(annotation(0, 10, 0), "a")?;
        w.write_annotation(annotation(20, 30, 0), "b")?;
        w.write_annotation(annotation(110, 150, 0), "c")?;
        w.finish()?;

        assert!(reader.is_updated()?);
        assert_eq!(reader.last_tick(), 149);
        reader.ack_updated();
        assert!(!reader.is_updated()?);

        let mut out = Collect(Vec::new());
        assert_eq!(reader.stream(0, 200, &mut out)?, 3);

        // A record landing in an uncommitted heartbeat stays invisible:
        // the record file grows but the index holds no new entry.
        let mut raw = Vec::new();
        let mut header = annotation(700, 705, 0);
        header.flags = RecordKind::Annotation.tag();
        header.write_bytes(&mut raw)?;
        raw.extend_from_slice(&1u16.to_le_bytes());
        raw.push(b'z');
        let mut handle = std::fs::OpenOptions::new()
            .append(true)
            .open(format!("{prefix}{RECORD_FILE}"))?;
        handle.write_all(&raw)?;
        handle.flush()?;

        assert!(!reader.is_updated()?);
        let mut out = Collect(Vec::new());
        assert_eq!(reader.stream(0, 1000, &mut out)?, 3);
        Ok(())
    }

    #[test]
    fn disable_update_suppresses_growth_checks() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let prefix = temp_prefix(&dir);
        let mut w = writer(&prefix, 100);
        w.write_annotation(annotation(0, 10, 0), "a")?;
        w.finish()?;

        let mut reader = PipeoutReader::open(&prefix)?;
        reader.disable_update();

        let mut w = writer(&prefix, 100);
        w.write_annotation(annotation(0, 10, 0), "a")?;
        w.write_annotation(annotation(120, 130, 0), "b")?;
        w.finish()?;

        assert!(!reader.is_updated()?);
        reader.force_update()?;
        assert!(reader.is_updated()?);
        assert_eq!(reader.last_tick(), 129);
        Ok(())
    }

    #[test]
    fn random_queries_match_brute_force() -> Result<()> {
        use rand::rngs::SmallRng;
        use rand::{Rng, SeedableRng};

        // The delivered multiset for any query must equal the on-disk
        // records whose intervals intersect it.
        let mut rng = SmallRng::seed_from_u64(7);
        let mut ends: Vec<u64> = (0..200).map(|_| rng.random_range(1..2000)).collect();
        ends.sort_unstable();
        let planned: Vec<(u64, u64, u16)> = ends
            .iter()
            .map(|&end| {
                let len = rng.random_range(0..30).min(end);
                (end - len, end, rng.random_range(0..4u16))
            })
            .collect();

        let dir = tempfile::tempdir().unwrap();
        let prefix = temp_prefix(&dir);
        let mut w = writer(&prefix, 100);
        for &(start, end, location) in &planned {
            w.write_annotation(annotation(start, end, location), "x")?;
        }
        w.finish()?;

        let mut reader = PipeoutReader::open(&prefix)?;
        for _ in 0..50 {
            let lo = rng.random_range(0..2100);
            let hi = rng.random_range(lo..2200);

            let mut expected: Vec<(u64, u64, u16)> = planned
                .iter()
                .copied()
                .filter(|&(start, end, _)| !(end < lo || start > hi))
                .collect();
            expected.sort_unstable();

            let mut out = Collect(Vec::new());
            reader.stream(lo, hi, &mut out)?;
            let mut got: Vec<(u64, u64, u16)> = out
                .0
                .iter()
                .map(|r| {
                    let h = r.header();
                    (h.start_tick, h.end_tick, h.location_id)
                })
                .collect();
            got.sort_unstable();
            assert_eq!(got, expected, "query [{lo}, {hi}]");
        }
        Ok(())
    }

    #[test]
    fn header_layout_matches_on_disk_record() -> Result<()> {
        // The writer/reader packing pact: the first record's base struct
        // occupies exactly SIZE_RECORD_HEADER bytes at offset 0.
        let dir = tempfile::tempdir().unwrap();
        let prefix = temp_prefix(&dir);
        let mut w = writer(&prefix, 1000);
        let mut header = annotation(1, 2, 9);
        header.transaction_id = 77;
        w.write_annotation(header, "")?;
        w.finish()?;

        let bytes = std::fs::read(format!("{prefix}{RECORD_FILE}"))?;
        assert_eq!(bytes.len(), SIZE_RECORD_HEADER + 2);
        let mut fixed = [0u8; SIZE_RECORD_HEADER];
        fixed.copy_from_slice(&bytes[..SIZE_RECORD_HEADER]);
        let parsed = RecordHeader::from_bytes(&fixed);
        assert_eq!(parsed.start_tick, 1);
        assert_eq!(parsed.end_tick, 2);
        assert_eq!(parsed.location_id, 9);
        assert_eq!(parsed.transaction_id, 77);
        assert_eq!(parsed.kind(), Some(RecordKind::Annotation));
        Ok(())
    }
}
