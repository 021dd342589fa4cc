pub mod args;
pub mod capture;
pub mod class_db;
pub mod classifier;
pub mod errors;
pub mod heap_set;
pub mod instance;
pub mod parser;
pub mod render;
pub mod slurp;
pub mod source;
pub mod trace_log;
pub mod utils;

use std::time::{Duration, Instant};

use crate::args::Args;
use crate::capture::live::LiveAllocationCapture;
use crate::capture::{CaptureConfig, CaptureObject};
use crate::classifier::filter::Filter;
use crate::errors::HeapSiftError;
use crate::render::render_capture;
use crate::slurp::slurp_file;
use crate::source::AllocationEventSource;

// generous, a trace file never reports missing data
const LOAD_WAIT: Duration = Duration::from_secs(300);

/// Loads the trace, replays the requested window and prints the heaps.
pub fn run(args: Args) -> Result<(), HeapSiftError> {
    let now = Instant::now();
    let trace = slurp_file(&args.file_path, !args.debug)?;
    println!("{}", trace.render_summary());

    // whole trace by default, the window end being exclusive
    let latest_us = trace
        .latest_timestamp()
        .ok()
        .flatten()
        .map_or(0, |latest_ns| latest_ns / 1000 + 1);
    let end_us = args.end_us.unwrap_or(latest_us.max(args.start_us));

    let config = CaptureConfig {
        track_jni_references: args.track_jni,
        ..CaptureConfig::default()
    };
    let mut capture = LiveAllocationCapture::new(&args.file_path, trace, config)?;
    capture.set_class_grouping(args.grouping);
    if let Some(text) = &args.filter {
        capture.select_filter(Filter::new(text, args.match_case, args.regex)?);
    }
    capture.load(args.start_us, end_us)?;
    capture.wait_for_load(LOAD_WAIT)?;

    let range = capture.loaded_range();
    println!("{}", render_capture(&mut capture, range, args.depth, args.heap)?);
    println!("heap-sift took {:?}", now.elapsed());
    Ok(())
}
