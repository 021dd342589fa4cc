use std::thread::{self, JoinHandle};

use ahash::{AHashMap, RandomState};
use crossbeam_channel::{Receiver, Sender};
use indexmap::IndexMap;
use indoc::formatdoc;
use rayon::prelude::ParallelSliceMut;

use crate::errors::SourceError;
use crate::parser::trace_record::TraceRecord;
use crate::source::{
    AllocatedClass, AllocationContexts, AllocationData, AllocationEvent, AllocationEventKind,
    AllocationEventSource, AllocationMethod, AllocationStack, JniReferenceEvent, JniReferenceEventKind,
    ThreadDescriptor, TimeRange,
};

/// Allocation tracking data recorded from a trace, indexed by time.
#[derive(Debug, Default)]
pub struct TraceLog {
    classes: Vec<(i64, AllocatedClass)>,
    methods: Vec<(i64, AllocationMethod)>,
    stacks: Vec<(i64, AllocationStack)>,
    threads: Vec<(i64, ThreadDescriptor)>,
    allocation_events: Vec<AllocationEvent>,
    jni_events: Vec<JniReferenceEvent>,
    latest_timestamp: Option<i64>,
    // counters
    allocations: usize,
    deallocations: usize,
    orphan_deallocations: usize,
}

impl TraceLog {
    /// Log built synchronously from in memory records.
    pub fn from_records(records: Vec<TraceRecord>) -> TraceLog {
        let mut recorder = TraceLogRecorder::new();
        recorder.record_records(records);
        recorder.finish()
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations
    }

    pub fn deallocation_count(&self) -> usize {
        self.deallocations
    }

    pub fn render_summary(&self) -> String {
        formatdoc!(
            "\nTrace content summary:\n
            Classes: {}
            Methods: {}
            Stacks: {}
            Threads: {}
            Allocations: {}
            Deallocations: {}
            ..without matching allocation: {}
            JNI reference events: {}
            Latest timestamp: {}",
            self.classes.len(),
            self.methods.len(),
            self.stacks.len(),
            self.threads.len(),
            self.allocations,
            self.deallocations,
            self.orphan_deallocations,
            self.jni_events.len(),
            self.latest_timestamp
                .map_or_else(|| "none".to_string(), |ts| format!("{}ns", ts)),
        )
    }
}

fn in_range<T: Clone>(records: &[(i64, T)], range: TimeRange) -> Vec<T> {
    records
        .iter()
        .filter(|(timestamp, _)| range.contains(*timestamp))
        .map(|(_, record)| record.clone())
        .collect()
}

/// Events of a timestamp sorted slice falling in `range`.
fn sorted_range<T: Clone>(events: &[T], range: TimeRange, timestamp: impl Fn(&T) -> i64) -> Vec<T> {
    let from = events.partition_point(|event| timestamp(event) < range.start);
    let to = events.partition_point(|event| timestamp(event) < range.end);
    events[from..to.max(from)].to_vec()
}

impl AllocationEventSource for TraceLog {
    fn latest_timestamp(&self) -> Result<Option<i64>, SourceError> {
        Ok(self.latest_timestamp)
    }

    fn allocation_contexts(&self, range: TimeRange) -> Result<AllocationContexts, SourceError> {
        Ok(AllocationContexts {
            classes: in_range(&self.classes, range),
            methods: in_range(&self.methods, range),
            stacks: in_range(&self.stacks, range),
            threads: in_range(&self.threads, range),
        })
    }

    fn allocation_snapshot(&self, at: i64) -> Result<Vec<AllocationData>, SourceError> {
        let mut alive: IndexMap<u64, &AllocationData, RandomState> = IndexMap::default();
        for event in self.allocation_events.iter().take_while(|event| event.timestamp < at) {
            match &event.kind {
                AllocationEventKind::Allocation(data) => {
                    alive.insert(data.tag, data);
                }
                AllocationEventKind::Deallocation(data) => {
                    alive.shift_remove(&data.tag);
                }
            }
        }
        Ok(alive.into_values().cloned().collect())
    }

    fn allocation_events(&self, range: TimeRange) -> Result<Vec<AllocationEvent>, SourceError> {
        Ok(sorted_range(&self.allocation_events, range, |event| event.timestamp))
    }

    fn jni_reference_snapshot(&self, at: i64) -> Result<Vec<JniReferenceEvent>, SourceError> {
        let mut alive: IndexMap<(u64, u64), &JniReferenceEvent, RandomState> = IndexMap::default();
        for event in self.jni_events.iter().take_while(|event| event.timestamp < at) {
            match event.kind {
                JniReferenceEventKind::Create => {
                    alive.insert((event.tag, event.ref_value), event);
                }
                JniReferenceEventKind::Delete => {
                    alive.shift_remove(&(event.tag, event.ref_value));
                }
            }
        }
        Ok(alive.into_values().cloned().collect())
    }

    fn jni_reference_events(&self, range: TimeRange) -> Result<Vec<JniReferenceEvent>, SourceError> {
        Ok(sorted_range(&self.jni_events, range, |event| event.timestamp))
    }
}

/// Accumulates parsed records into a [`TraceLog`].
#[derive(Debug, Default)]
pub struct TraceLogRecorder {
    log: TraceLog,
    // allocation data of objects not freed yet, by tag
    live_objects: AHashMap<u64, AllocationData>,
}

impl TraceLogRecorder {
    pub fn new() -> Self {
        TraceLogRecorder::default()
    }

    pub fn start(
        mut self,
        receive_records: Receiver<Vec<TraceRecord>>,
        send_result: Sender<TraceLog>,
        send_pooled_vec: Sender<Vec<TraceRecord>>,
    ) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("trace-recorder".to_string())
            .spawn(move || {
                for mut records in receive_records {
                    self.record_records(records.drain(..));
                    // send back pooled vec (swallow errors as it is possible the receiver was already dropped)
                    send_pooled_vec.send(records).unwrap_or_default();
                }
                // no more records to pull, hand over the result
                send_result.send(self.finish()).unwrap_or_default();
            })
    }

    pub fn record_records(&mut self, records: impl IntoIterator<Item = TraceRecord>) {
        for record in records {
            let timestamp = record.timestamp();
            self.log.latest_timestamp = Some(self.log.latest_timestamp.map_or(timestamp, |ts| ts.max(timestamp)));
            match record {
                TraceRecord::Class { timestamp, class } => self.log.classes.push((timestamp, class)),
                TraceRecord::Method { timestamp, method } => self.log.methods.push((timestamp, method)),
                TraceRecord::Stack { timestamp, stack } => self.log.stacks.push((timestamp, stack)),
                TraceRecord::Thread { timestamp, thread } => self.log.threads.push((timestamp, thread)),
                TraceRecord::Alloc { timestamp, data } => {
                    self.log.allocations += 1;
                    self.live_objects.insert(data.tag, data.clone());
                    self.log.allocation_events.push(AllocationEvent {
                        timestamp,
                        kind: AllocationEventKind::Allocation(data),
                    });
                }
                TraceRecord::Free { timestamp, tag } => match self.live_objects.remove(&tag) {
                    Some(data) => {
                        self.log.deallocations += 1;
                        self.log.allocation_events.push(AllocationEvent {
                            timestamp,
                            kind: AllocationEventKind::Deallocation(data),
                        });
                    }
                    None => {
                        log::warn!("free of unknown object @{} at {}ns ignored", tag, timestamp);
                        self.log.orphan_deallocations += 1;
                    }
                },
                TraceRecord::Jni(event) => self.log.jni_events.push(event),
            }
        }
    }

    /// Sorts the event indexes, records are not required to come in order.
    pub fn finish(mut self) -> TraceLog {
        self.log.allocation_events.par_sort_by_key(|event| event.timestamp);
        self.log.jni_events.par_sort_by_key(|event| event.timestamp);
        self.log.classes.par_sort_by_key(|(timestamp, _)| *timestamp);
        self.log.methods.par_sort_by_key(|(timestamp, _)| *timestamp);
        self.log.stacks.par_sort_by_key(|(timestamp, _)| *timestamp);
        self.log.threads.par_sort_by_key(|(timestamp, _)| *timestamp);
        log::info!(
            "recorded {} allocations and {} deallocations",
            self.log.allocations,
            self.log.deallocations
        );
        self.log
    }
}
