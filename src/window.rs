//! The windowed transaction cache: a sliding, prefetched, per-tick
//! active-location view over decoded records.
//!
//! The cache keeps a contiguous run of heartbeat-aligned chunks. Each chunk
//! owns the records intersecting its tick range and a dense
//! `heartbeat × num_locations` slot table mapping every (tick, location)
//! to a record index, or [`NO_TRANSACTION`] when the slot is idle. Queries
//! slide the window by whole chunks and answer "what is active at tick T
//! at each location" in constant time per location.

use std::collections::VecDeque;

use log::debug;

use crate::decoder::RecordVisitor;
use crate::error::{QueryError, Result};
use crate::record::{Record, NO_TRANSACTION};
use crate::reader::PipeoutReader;

/// Default bound on the number of loaded heartbeat chunks.
pub const DEFAULT_WINDOW_CHUNKS: usize = 16;

/// One heartbeat bucket's worth of cache: record storage plus the per-tick
/// slot table. Slot rows are `num_locations` wide; entries index into
/// `records`.
struct Chunk {
    bucket: u64,
    start_tick: u64,
    ticks: usize,
    num_locations: usize,
    records: Vec<Record>,
    slots: Vec<u32>,
}
impl Chunk {
    fn new(bucket: u64, heartbeat: u64, num_locations: usize) -> Self {
        let ticks = usize::try_from(heartbeat).unwrap_or(usize::MAX);
        Self {
            bucket,
            start_tick: bucket * heartbeat,
            ticks,
            num_locations,
            records: Vec::new(),
            slots: vec![NO_TRANSACTION; ticks * num_locations],
        }
    }

    fn end_tick(&self) -> u64 {
        self.start_tick + self.ticks as u64
    }

    /// Folds one decoded record into the slot table, clamped to this
    /// chunk's tick range. Zero-length records occupy no tick.
    fn insert(&mut self, record: &Record) {
        let header = record.header();
        let lo = header.start_tick.max(self.start_tick);
        let hi = header.end_tick.min(self.end_tick());
        let loc = header.location_id as usize;
        if lo >= hi || loc >= self.num_locations {
            return;
        }
        let index = self.records.len() as u32;
        self.records.push(record.clone());
        for tick in lo..hi {
            let row = (tick - self.start_tick) as usize;
            self.slots[row * self.num_locations + loc] = index;
        }
    }

    fn slot_row(&self, tick: u64) -> &[u32] {
        let row = (tick - self.start_tick) as usize;
        &self.slots[row * self.num_locations..(row + 1) * self.num_locations]
    }
}

/// A windowed reader: wraps the streaming reader with the sliding chunk
/// cache and the per-tick callback API.
///
/// Slot rows and record storage handed to the callback stay valid only for
/// the duration of the call; any later query may slide the window and drop
/// them.
pub struct WindowedReader {
    inner: PipeoutReader,
    chunks: VecDeque<Chunk>,
    max_chunks: usize,
    last_query_lo: Option<u64>,
    direction: i8,
    in_query: bool,
}
impl WindowedReader {
    /// Opens the database at `prefix` with the default chunk budget.
    pub fn open(prefix: &str) -> Result<Self> {
        Self::with_capacity(prefix, DEFAULT_WINDOW_CHUNKS)
    }

    /// Opens the database at `prefix` keeping at most `max_chunks` loaded
    /// heartbeat chunks (minimum 3: a query chunk and its two neighbors).
    pub fn with_capacity(prefix: &str, max_chunks: usize) -> Result<Self> {
        Ok(Self {
            inner: PipeoutReader::open(prefix)?,
            chunks: VecDeque::new(),
            max_chunks: max_chunks.max(3),
            last_query_lo: None,
            direction: 0,
            in_query: false,
        })
    }

    #[must_use]
    pub fn first_tick(&self) -> u64 {
        self.inner.first_tick()
    }
    #[must_use]
    pub fn last_tick(&self) -> u64 {
        self.inner.last_tick()
    }
    #[must_use]
    pub fn heartbeat(&self) -> u64 {
        self.inner.heartbeat()
    }
    #[must_use]
    pub fn version(&self) -> u32 {
        self.inner.version()
    }
    #[must_use]
    pub fn num_locations(&self) -> usize {
        self.inner.num_locations()
    }

    /// The buckets currently loaded, in window order. Mainly useful for
    /// observing slide and prefetch behavior.
    #[must_use]
    pub fn loaded_buckets(&self) -> Vec<u64> {
        self.chunks.iter().map(|c| c.bucket).collect()
    }

    /// Streams records through the inner reader (search/dump mode), without
    /// touching the window.
    pub fn stream<V: RecordVisitor>(&mut self, q_lo: u64, q_hi: u64, visitor: V) -> Result<usize> {
        self.inner.stream(q_lo, q_hi, visitor)
    }

    /// Delivers the active-location view for every tick in `[q_lo, q_hi]`,
    /// ascending. The callback receives the tick, the location→record-index
    /// row (`NO_TRANSACTION` for idle slots), the chunk's record storage,
    /// and the number of locations.
    ///
    /// `tracking` lets this query update the scroll-direction predictor and
    /// trigger prefetch; pass `false` for small look-aheads that should not
    /// disturb it.
    pub fn query<F>(&mut self, q_lo: u64, q_hi: u64, tracking: bool, mut callback: F) -> Result<()>
    where
        F: FnMut(u64, &[u32], &[Record], usize) -> Result<()>,
    {
        if q_hi < q_lo {
            return Err(QueryError::InvalidRange { lo: q_lo, hi: q_hi }.into());
        }
        if self.in_query {
            return Err(QueryError::Busy.into());
        }
        self.in_query = true;
        let result = self.query_inner(q_lo, q_hi, tracking, &mut callback);
        self.in_query = false;
        result
    }

    fn query_inner<F>(&mut self, q_lo: u64, q_hi: u64, tracking: bool, callback: &mut F) -> Result<()>
    where
        F: FnMut(u64, &[u32], &[Record], usize) -> Result<()>,
    {
        let heartbeat = self.heartbeat();
        let bucket_lo = q_lo / heartbeat;
        let bucket_hi = q_hi / heartbeat;

        if tracking {
            if let Some(last) = self.last_query_lo {
                self.direction = match q_lo.cmp(&last) {
                    std::cmp::Ordering::Greater => 1,
                    std::cmp::Ordering::Less => -1,
                    std::cmp::Ordering::Equal => self.direction,
                };
            }
            self.last_query_lo = Some(q_lo);
        }

        self.ensure_window(bucket_lo, bucket_hi)?;
        if tracking {
            self.prefetch(bucket_lo, bucket_hi)?;
        }

        let front = self.chunks.front().map_or(0, |c| c.bucket);
        let num_locations = self.num_locations();
        for tick in q_lo..=q_hi {
            let chunk = &self.chunks[(tick / heartbeat - front) as usize];
            callback(tick, chunk.slot_row(tick), &chunk.records, num_locations)?;
        }
        Ok(())
    }

    /// Makes `[bucket_lo, bucket_hi]` resident, sliding by whole chunks.
    /// Eviction takes the chunk farthest from the requested range and never
    /// removes a requested chunk.
    fn ensure_window(&mut self, bucket_lo: u64, bucket_hi: u64) -> Result<()> {
        let needed = (bucket_hi - bucket_lo + 1) as usize;
        let budget = self.max_chunks.max(needed);

        let loaded = self
            .chunks
            .front()
            .map(|front| (front.bucket, self.chunks.back().unwrap().bucket));
        // Adjacent ranges slide; only a gap forces a rebuild.
        let disjoint = match loaded {
            None => true,
            Some((lo, hi)) => bucket_hi + 1 < lo || bucket_lo > hi + 1,
        };
        if disjoint {
            if loaded.is_some() {
                debug!("window jump to buckets [{bucket_lo}, {bucket_hi}]");
                self.chunks.clear();
            }
            for bucket in bucket_lo..=bucket_hi {
                let chunk = self.load_chunk(bucket)?;
                self.chunks.push_back(chunk);
            }
            return Ok(());
        }

        while self.chunks.front().is_some_and(|c| c.bucket > bucket_lo) {
            let bucket = self.chunks.front().unwrap().bucket - 1;
            let chunk = self.load_chunk(bucket)?;
            self.chunks.push_front(chunk);
        }
        while self.chunks.back().is_some_and(|c| c.bucket < bucket_hi) {
            let bucket = self.chunks.back().unwrap().bucket + 1;
            let chunk = self.load_chunk(bucket)?;
            self.chunks.push_back(chunk);
        }

        while self.chunks.len() > budget {
            let front_dist = bucket_lo.saturating_sub(self.chunks.front().unwrap().bucket);
            let back_dist = self.chunks.back().unwrap().bucket.saturating_sub(bucket_hi);
            let evicted = if front_dist >= back_dist {
                self.chunks.pop_front()
            } else {
                self.chunks.pop_back()
            };
            if let Some(chunk) = evicted {
                debug!("evicted bucket {}", chunk.bucket);
            }
        }
        Ok(())
    }

    /// Loads one chunk ahead of the window in the predicted direction.
    fn prefetch(&mut self, bucket_lo: u64, bucket_hi: u64) -> Result<()> {
        if self.chunks.len() >= self.max_chunks {
            return Ok(());
        }
        let target = match self.direction {
            1 => {
                let back = self.chunks.back().map_or(bucket_hi, |c| c.bucket);
                if back >= self.inner.last_bucket() {
                    return Ok(());
                }
                Some((back + 1, false))
            }
            -1 => {
                let front = self.chunks.front().map_or(bucket_lo, |c| c.bucket);
                (front > 0).then_some((front - 1, true))
            }
            _ => None,
        };
        if let Some((bucket, at_front)) = target {
            let chunk = self.load_chunk(bucket)?;
            if at_front {
                self.chunks.push_front(chunk);
            } else {
                self.chunks.push_back(chunk);
            }
        }
        Ok(())
    }

    /// Builds the cache chunk for one heartbeat bucket. The scan covers the
    /// adjacent buckets too: records are indexed by the bucket their end
    /// tick falls in, so boundary-spanners and `CONTINUE` heads that cover
    /// this chunk's ticks live one bucket away.
    fn load_chunk(&mut self, bucket: u64) -> Result<Chunk> {
        let mut chunk = Chunk::new(bucket, self.heartbeat(), self.num_locations());
        self.inner
            .scan_buckets(bucket.saturating_sub(1), bucket + 1, |record| {
                chunk.insert(record);
                Ok(())
            })?;
        debug!(
            "loaded bucket {bucket}: {} records",
            chunk.records.len()
        );
        Ok(chunk)
    }

    /// Growth check; a detected update drops all loaded chunks (edge chunks
    /// may have been built against the shorter file).
    pub fn is_updated(&mut self) -> Result<bool> {
        let before = self.inner.last_tick();
        let updated = self.inner.is_updated()?;
        if self.inner.last_tick() != before {
            self.chunks.clear();
        }
        Ok(updated)
    }

    pub fn ack_updated(&mut self) {
        self.inner.ack_updated();
    }

    pub fn force_update(&mut self) -> Result<()> {
        let before = self.inner.last_tick();
        self.inner.force_update()?;
        if self.inner.last_tick() != before {
            self.chunks.clear();
        }
        Ok(())
    }

    pub fn enable_update(&mut self) {
        self.inner.enable_update();
    }

    pub fn disable_update(&mut self) {
        self.inner.disable_update();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordHeader;
    use crate::writer::{PipeoutWriter, PipeoutWriterBuilder};

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

    /// Writer with three locations mapped so the slot arrays are 3 wide.
    fn writer(prefix: &str, heartbeat: u64) -> PipeoutWriter {
        let mut w = PipeoutWriterBuilder::default()
            .heartbeat(heartbeat)
            .build(prefix)
            .unwrap();
        for location in 0..3 {
            w.map_location(location, 1);
        }
        w.declare_pair_type(1, &[]).unwrap();
        w
    }

    #[test]
    fn active_slots_resolve_to_covering_records() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let prefix = temp_prefix(&dir);
        let mut w = writer(&prefix, 10);
        w.write_annotation(annotation(0, 5, 0), "a")?;
        // Spans the first heartbeat boundary.
        w.write_annotation(annotation(3, 12, 1), "b")?;
        w.write_annotation(annotation(12, 13, 2), "c")?;
        // Zero-length records occupy no tick.
        w.write_annotation(annotation(15, 15, 0), "d")?;
        w.finish()?;

        let intervals: &[(u64, u64, u16)] = &[(0, 5, 0), (3, 12, 1), (12, 13, 2)];

        let mut cache = WindowedReader::open(&prefix)?;
        assert_eq!(cache.num_locations(), 3);

        let mut ticks_seen = Vec::new();
        cache.query(0, 19, false, |tick, row, records, num_locations| {
            ticks_seen.push(tick);
            assert_eq!(row.len(), num_locations);
            for (location, &slot) in row.iter().enumerate() {
                let expected = intervals
                    .iter()
                    .find(|&&(lo, hi, loc)| loc as usize == location && lo <= tick && tick < hi);
                match expected {
                    Some(&(lo, hi, loc)) => {
                        let header = records[slot as usize].header();
                        assert_eq!(header.start_tick, lo);
                        assert_eq!(header.end_tick, hi);
                        assert_eq!(header.location_id, loc);
                    }
                    None => assert_eq!(slot, NO_TRANSACTION, "tick {tick} loc {location}"),
                }
            }
            Ok(())
        })?;
        assert_eq!(ticks_seen, (0..=19).collect::<Vec<_>>());
        Ok(())
    }

    fn spread_db(prefix: &str) {
        let mut w = writer(prefix, 10);
        for k in 0..11u64 {
            w.write_annotation(annotation(k * 10, k * 10 + 5, 0), "x").unwrap();
        }
        w.finish().unwrap();
    }

    #[test]
    fn window_slides_by_whole_chunks() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let prefix = temp_prefix(&dir);
        spread_db(&prefix);

        let mut cache = WindowedReader::with_capacity(&prefix, 4)?;
        cache.query(0, 29, false, |_, _, _, _| Ok(()))?;
        assert_eq!(cache.loaded_buckets(), vec![0, 1, 2]);

        cache.query(10, 39, false, |_, _, _, _| Ok(()))?;
        assert_eq!(cache.loaded_buckets(), vec![0, 1, 2, 3]);

        // Over budget: the chunk farthest from the request goes first.
        cache.query(20, 49, false, |_, _, _, _| Ok(()))?;
        assert_eq!(cache.loaded_buckets(), vec![1, 2, 3, 4]);

        // Sliding backward onto the adjacent chunk evicts from the far end.
        cache.query(0, 9, false, |_, _, _, _| Ok(()))?;
        assert_eq!(cache.loaded_buckets(), vec![0, 1, 2, 3]);

        // A disjoint jump rebuilds the window outright.
        cache.query(60, 69, false, |_, _, _, _| Ok(()))?;
        assert_eq!(cache.loaded_buckets(), vec![6]);
        Ok(())
    }

    #[test]
    fn tracking_prefetches_in_scroll_direction() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let prefix = temp_prefix(&dir);
        spread_db(&prefix);

        let mut cache = WindowedReader::with_capacity(&prefix, 8)?;
        cache.query(0, 9, true, |_, _, _, _| Ok(()))?;
        assert_eq!(cache.loaded_buckets(), vec![0]);

        // Forward motion detected: the next chunk is fetched ahead of use.
        cache.query(10, 19, true, |_, _, _, _| Ok(()))?;
        assert_eq!(cache.loaded_buckets(), vec![0, 1, 2]);

        // Suppressed tracking leaves the window untouched by prediction.
        let mut cold = WindowedReader::with_capacity(&prefix, 8)?;
        cold.query(0, 9, false, |_, _, _, _| Ok(()))?;
        cold.query(10, 19, false, |_, _, _, _| Ok(()))?;
        assert_eq!(cold.loaded_buckets(), vec![0, 1]);
        Ok(())
    }

    #[test]
    fn ticks_past_coverage_read_as_idle() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let prefix = temp_prefix(&dir);
        let mut w = writer(&prefix, 10);
        w.write_annotation(annotation(0, 8, 0), "only")?;
        w.finish()?;

        let mut cache = WindowedReader::open(&prefix)?;
        let mut idle = 0;
        cache.query(90, 109, false, |_, row, _, _| {
            idle += row.iter().filter(|&&s| s == NO_TRANSACTION).count();
            Ok(())
        })?;
        assert_eq!(idle, 20 * 3);
        Ok(())
    }

    #[test]
    fn invalid_range_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let prefix = temp_prefix(&dir);
        spread_db(&prefix);
        let mut cache = WindowedReader::open(&prefix)?;
        assert!(matches!(
            cache.query(10, 5, false, |_, _, _, _| Ok(())),
            Err(crate::error::Error::Query(QueryError::InvalidRange { lo: 10, hi: 5 }))
        ));
        Ok(())
    }

    #[test]
    fn update_drops_stale_window() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let prefix = temp_prefix(&dir);
        let mut w = writer(&prefix, 10);
        w.write_annotation(annotation(0, 5, 0), "a")?;
        w.finish()?;

        let mut cache = WindowedReader::open(&prefix)?;
        cache.query(0, 9, false, |_, _, _, _| Ok(()))?;
        assert_eq!(cache.loaded_buckets(), vec![0]);

        let mut w = writer(&prefix, 10);
        w.write_annotation(annotation(0, 5, 0), "a")?;
        w.write_annotation(annotation(12, 18, 1), "b")?;
        w.finish()?;

        assert!(cache.is_updated()?);
        assert!(cache.loaded_buckets().is_empty());
        cache.ack_updated();

        // The new record is now queryable.
        let mut active = 0;
        cache.query(12, 17, false, |_, row, records, _| {
            if row[1] != NO_TRANSACTION {
                assert_eq!(records[row[1] as usize].header().end_tick, 18);
                active += 1;
            }
            Ok(())
        })?;
        assert_eq!(active, 6);
        Ok(())
    }
}
