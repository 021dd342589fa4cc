use std::io::BufRead;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};

use crate::errors::HeapSiftError;
use crate::parser::trace_parser::parse_trace_line;
use crate::parser::trace_record::TraceRecord;

// records sent to the recorder per batch
const RECORD_BATCH_SIZE: usize = 4096;

/// Line parser turning a trace file into batches of records.
pub struct TraceRecordStreamParser {
    file_len: usize,
    processed_len: usize,
}

impl TraceRecordStreamParser {
    pub fn new(file_len: usize) -> Self {
        TraceRecordStreamParser {
            file_len,
            processed_len: 0,
        }
    }

    pub fn start<R: BufRead + Send + 'static>(
        mut self,
        reader: R,
        send_progress: Sender<usize>,
        receive_pooled_vec: Receiver<Vec<TraceRecord>>,
        send_records: Sender<Vec<TraceRecord>>,
    ) -> std::io::Result<JoinHandle<Result<(), HeapSiftError>>> {
        thread::Builder::new()
            .name("trace-parser".to_string())
            .spawn(move || self.parse_lines(reader, send_progress, receive_pooled_vec, send_records))
    }

    fn parse_lines<R: BufRead>(
        &mut self,
        reader: R,
        send_progress: Sender<usize>,
        receive_pooled_vec: Receiver<Vec<TraceRecord>>,
        send_records: Sender<Vec<TraceRecord>>,
    ) -> Result<(), HeapSiftError> {
        // reuse the vectors handed back by the recorder when available
        let pooled = || receive_pooled_vec.try_recv().unwrap_or_default();
        let mut batch = pooled();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            self.processed_len += line.len() + 1;
            match parse_trace_line(&line) {
                Ok(Some(record)) => batch.push(record),
                Ok(None) => (),
                Err(message) => {
                    return Err(HeapSiftError::InvalidTraceFile {
                        line: index + 1,
                        message,
                    })
                }
            }
            if batch.len() >= RECORD_BATCH_SIZE {
                let full = std::mem::replace(&mut batch, pooled());
                if send_records.send(full).is_err() {
                    return Err(HeapSiftError::WorkerDisconnected);
                }
                // progress is best effort, the receiver may be gone
                send_progress
                    .send(self.processed_len.min(self.file_len))
                    .unwrap_or_default();
            }
        }
        if !batch.is_empty() && send_records.send(batch).is_err() {
            return Err(HeapSiftError::WorkerDisconnected);
        }
        send_progress.send(self.file_len).unwrap_or_default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn batches_records_and_reports_progress() {
        let content = "# header\nclass 0 1 - a.B\nalloc 5 1 1 16 -1 0 - -\n\nfree 6 1\n";
        let (send_progress, receive_progress) = crossbeam_channel::unbounded();
        let (send_pooled_vec, receive_pooled_vec) = crossbeam_channel::unbounded();
        let (send_records, receive_records) = crossbeam_channel::unbounded();
        send_pooled_vec.send(Vec::new()).unwrap();

        let parser = TraceRecordStreamParser::new(content.len());
        let handle = parser
            .start(Cursor::new(content.to_string()), send_progress, receive_pooled_vec, send_records)
            .unwrap();
        handle.join().unwrap().unwrap();

        let records: Vec<TraceRecord> = receive_records.iter().flatten().collect();
        assert_eq!(records.len(), 3);
        assert_eq!(receive_progress.iter().last(), Some(content.len()));
    }

    #[test]
    fn reports_failing_line() {
        let content = "class 0 1 - a.B\nalloc oops\n";
        let (send_progress, _receive_progress) = crossbeam_channel::unbounded();
        let (_send_pooled_vec, receive_pooled_vec) = crossbeam_channel::unbounded();
        let (send_records, _receive_records) = crossbeam_channel::unbounded();

        let parser = TraceRecordStreamParser::new(content.len());
        let handle = parser
            .start(Cursor::new(content.to_string()), send_progress, receive_pooled_vec, send_records)
            .unwrap();
        match handle.join().unwrap() {
            Err(HeapSiftError::InvalidTraceFile { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected result {:?}", other),
        }
    }
}
