//! Database dumper.
//!
//! Prints every record in file order, one line each. `-m` stitches logical
//! transactions split across heartbeat boundaries back together; `-s` sorts
//! the dump by end tick.

use std::collections::HashMap;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use pipeout::{PipeoutReader, Record, RecordVisitor, Result};

#[derive(Parser, Debug)]
#[command(name = "pipeout-dump", about = "Dump a pipeline transaction database")]
struct Args {
    /// Merge transactions split across heartbeat boundaries.
    #[arg(short = 'm')]
    merge: bool,

    /// Sort output by end tick.
    #[arg(short = 's')]
    sort: bool,

    /// Database path prefix.
    db_prefix: String,
}

fn payload(record: &Record) -> String {
    match record {
        Record::Annotation(r) => r.text.clone(),
        Record::Instruction(r) => format!(
            "inst opcode=0x{:08x} va=0x{:x} pa=0x{:x}",
            r.opcode(),
            r.virtual_addr(),
            r.physical_addr()
        ),
        Record::MemoryOp(r) => {
            format!("mem va=0x{:x} pa=0x{:x}", r.virtual_addr(), r.physical_addr())
        }
        Record::Pair(r) => r.render(),
    }
}

/// Collects dump lines, optionally stitching continuation chains. Pieces of
/// a split transaction share a location and transaction id; the head piece
/// carries the CONTINUE flag.
struct DumpVisitor {
    merge: bool,
    lines: Vec<(u64, String)>,
    pending: HashMap<(u16, u64), (u64, u64, String)>,
}
impl DumpVisitor {
    fn new(merge: bool) -> Self {
        Self {
            merge,
            lines: Vec::new(),
            pending: HashMap::new(),
        }
    }

    fn emit(&mut self, start: u64, end: u64, location: u16, text: &str) {
        self.lines
            .push((end, format!("{start},{end}@{location}: {text}")));
    }

    fn flush(&mut self) {
        let mut leftovers: Vec<_> = self.pending.drain().collect();
        leftovers.sort_by_key(|&(_, (_, end, _))| end);
        for ((location, _), (start, end, text)) in leftovers {
            self.emit(start, end, location, &text);
        }
    }
}
impl RecordVisitor for DumpVisitor {
    fn visit(&mut self, record: &Record) -> Result<()> {
        let header = record.header();
        let key = (header.location_id, header.transaction_id);
        if self.merge {
            if header.is_continued() {
                // Head or middle piece: hold it open.
                let entry = self
                    .pending
                    .entry(key)
                    .or_insert_with(|| (header.start_tick, header.end_tick, payload(record)));
                entry.1 = header.end_tick;
                return Ok(());
            }
            if let Some((start, _, text)) = self.pending.remove(&key) {
                // Tail piece closes the chain.
                self.emit(start, header.end_tick, header.location_id, &text);
                return Ok(());
            }
        }
        self.emit(
            header.start_tick,
            header.end_tick,
            header.location_id,
            &payload(record),
        );
        Ok(())
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let mut reader = PipeoutReader::open(&args.db_prefix)
        .with_context(|| format!("cannot open database {:?}", args.db_prefix))?;

    let mut visitor = DumpVisitor::new(args.merge);
    reader.stream(reader.first_tick(), reader.last_tick(), &mut visitor)?;
    visitor.flush();

    if args.sort {
        visitor.lines.sort_by_key(|&(end, _)| end);
    }
    for (_, line) in &visitor.lines {
        println!("{line}");
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
