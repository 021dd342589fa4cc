use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crossbeam_channel::{Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};

use crate::errors::HeapSiftError;
use crate::parser::record_stream_parser::TraceRecordStreamParser;
use crate::parser::trace_record::TraceRecord;
use crate::trace_log::{TraceLog, TraceLogRecorder};
use crate::utils::pretty_bytes_size;

// 8 MB read buffer, trace lines are short
pub const READ_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Loads a trace file into memory, parsing and recording on dedicated threads.
pub fn slurp_file(file_path: &str, show_progress: bool) -> Result<TraceLog, HeapSiftError> {
    if !Path::new(file_path).is_file() {
        return Err(HeapSiftError::InputFileNotFound {
            name: file_path.to_string(),
        });
    }
    let file = File::open(file_path)?;
    let file_len = file.metadata()?.len() as usize;
    let reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);
    log::info!(
        "processing {} trace file '{}'",
        pretty_bytes_size(file_len as u64),
        file_path
    );

    // Communication channel from parser to recorder
    let (send_records, receive_records): (Sender<Vec<TraceRecord>>, Receiver<Vec<TraceRecord>>) =
        crossbeam_channel::unbounded();

    // Communication channel from recorder to parser (pooled record buffers)
    let (send_pooled_vec, receive_pooled_vec): (Sender<Vec<TraceRecord>>, Receiver<Vec<TraceRecord>>) =
        crossbeam_channel::unbounded();

    // Communication channel from recorder to main
    let (send_result, receive_result): (Sender<TraceLog>, Receiver<TraceLog>) = crossbeam_channel::unbounded();

    // Communication channel from parser to main
    let (send_progress, receive_progress): (Sender<usize>, Receiver<usize>) = crossbeam_channel::unbounded();

    // Init pooled result vec, the receiver is owned by the parser not started yet
    send_pooled_vec.send(Vec::new()).unwrap_or_default();

    // Start stream parser
    let stream_parser = TraceRecordStreamParser::new(file_len);
    let parser_thread = stream_parser.start(reader, send_progress, receive_pooled_vec, send_records)?;

    // Start recorder
    let recorder_thread = TraceLogRecorder::new().start(receive_records, send_result, send_pooled_vec)?;

    // Init progress bar
    let pb = if show_progress {
        ProgressBar::new(file_len as u64)
    } else {
        ProgressBar::hidden()
    };
    if let Ok(style) = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} (speed:{bytes_per_sec}) (eta:{eta})")
    {
        pb.set_style(style.progress_chars("#>-"));
    }

    // Feed progress bar
    while let Ok(processed) = receive_progress.recv() {
        pb.set_position(processed as u64)
    }

    // Finish and remove progress bar
    pb.finish_and_clear();

    // Blocks until parser is done, a parse failure wins over the partial result
    parser_thread
        .join()
        .map_err(|e| HeapSiftError::StdThreadError { e })??;

    // Wait for final result
    let result = receive_result.recv().map_err(|_| HeapSiftError::WorkerDisconnected)?;

    // Blocks until recorder is done
    recorder_thread
        .join()
        .map_err(|e| HeapSiftError::StdThreadError { e })?;

    Ok(result)
}
