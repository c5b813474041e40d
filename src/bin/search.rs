//! Transaction search CLI.
//!
//! Streams a tick range out of a database and matches record text against a
//! substring or regular expression. Output is line-oriented for driving
//! from a viewer process:
//!
//! * `i<text>` - informational messages
//! * `p<fraction>` - progress in `[0, 1]`
//! * `r<start>,<end>@<location>:<text>` - one result, newlines escaped

use std::collections::HashSet;
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use memchr::memmem;
use regex::Regex;

use pipeout::{PipeoutReader, Record, RecordVisitor, Result};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Plain substring match.
    String,
    /// Rust regular expression match.
    Regex,
}

#[derive(Parser, Debug)]
#[command(name = "pipeout-search", about = "Search transaction text in a pipeline database")]
struct Args {
    /// Database path prefix.
    db_prefix: String,

    /// Match mode.
    #[arg(value_enum)]
    mode: Mode,

    /// Search pattern.
    query: String,

    /// Report non-matching records instead (0 or 1).
    invert: u8,

    /// First tick, or -1 for the database start.
    #[arg(allow_hyphen_values = true)]
    start_tick: i64,

    /// Last tick, or -1 for the database end.
    #[arg(allow_hyphen_values = true)]
    end_tick: i64,

    /// Comma-separated location ids to search; empty for all.
    locations: String,
}

enum Matcher {
    Substring(memmem::Finder<'static>),
    Regex(Regex),
}
impl Matcher {
    fn matches(&self, text: &str) -> bool {
        match self {
            Self::Substring(finder) => finder.find(text.as_bytes()).is_some(),
            Self::Regex(re) => re.is_match(text),
        }
    }
}

struct SearchVisitor {
    matcher: Matcher,
    invert: bool,
    locations: Option<HashSet<u16>>,
    q_lo: u64,
    span: u64,
    last_progress: f64,
    hits: u64,
}
impl RecordVisitor for SearchVisitor {
    fn visit(&mut self, record: &Record) -> Result<()> {
        let header = record.header();
        let progress = (header.start_tick.saturating_sub(self.q_lo)) as f64 / self.span as f64;
        if progress - self.last_progress >= 0.05 {
            self.last_progress = progress;
            println!("p{progress:.3}");
        }
        if let Some(locations) = &self.locations {
            if !locations.contains(&header.location_id) {
                return Ok(());
            }
        }
        let Some(text) = record.search_text() else {
            return Ok(());
        };
        if self.matcher.matches(&text) != self.invert {
            self.hits += 1;
            println!(
                "r{},{}@{}:{}",
                header.start_tick,
                header.end_tick,
                header.location_id,
                text.replace('\n', "\\n")
            );
        }
        Ok(())
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let matcher = match args.mode {
        Mode::String => Matcher::Substring(memmem::Finder::new(args.query.as_bytes()).into_owned()),
        Mode::Regex => Regex::new(&args.query)
            .with_context(|| format!("invalid regex {:?}", args.query))
            .map(Matcher::Regex)?,
    };
    if args.invert > 1 {
        bail!("invert must be 0 or 1");
    }
    let locations = if args.locations.is_empty() {
        None
    } else {
        let parsed: std::result::Result<HashSet<u16>, _> =
            args.locations.split(',').map(str::parse).collect();
        Some(parsed.with_context(|| format!("invalid location list {:?}", args.locations))?)
    };

    let mut reader = PipeoutReader::open(&args.db_prefix)
        .with_context(|| format!("cannot open database {:?}", args.db_prefix))?;
    let q_lo = match args.start_tick {
        -1 => reader.first_tick(),
        t if t >= 0 => t as u64,
        t => bail!("invalid start tick {t}"),
    };
    let q_hi = match args.end_tick {
        -1 => reader.last_tick(),
        t if t >= 0 => t as u64,
        t => bail!("invalid end tick {t}"),
    };

    println!(
        "iSearching [{q_lo}, {q_hi}] of {:?} (heartbeat {})",
        args.db_prefix,
        reader.heartbeat()
    );
    println!("p0.000");

    let mut visitor = SearchVisitor {
        matcher,
        invert: args.invert != 0,
        locations,
        q_lo,
        span: (q_hi - q_lo).max(1),
        last_progress: 0.0,
        hits: 0,
    };
    reader.stream(q_lo, q_hi, &mut visitor)?;

    println!("p1.000");
    println!("iNumber of hits: {}", visitor.hits);
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
