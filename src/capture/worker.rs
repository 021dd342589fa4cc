use std::thread::{self, JoinHandle};
use std::time::Instant;

use ahash::RandomState;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use indexmap::{IndexMap, IndexSet};
use rayon::prelude::ParallelSliceMut;

use crate::capture::context::ContextIndex;
use crate::capture::{CaptureConfig, DeltaBatch};
use crate::errors::{LoadError, SourceError};
use crate::heap_set::HeapDelta;
use crate::instance::{InstanceId, InstanceObject, ThreadInfo};
use crate::source::{
    AllocationEvent, AllocationEventKind, AllocationEventSource, JniReferenceEvent, JniReferenceEventKind,
    TimeRange,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct LoadRequest {
    pub generation: u64,
    pub range: TimeRange,
}

#[derive(Debug)]
pub(crate) enum Control {
    Load(LoadRequest),
    Shutdown,
}

#[derive(Debug)]
pub(crate) enum WorkerMessage {
    Loaded { generation: u64, batch: DeltaBatch },
    Failed { generation: u64, error: LoadError },
}

/// Roles reported to the heaps for one instance.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
struct Presence {
    snapshot: bool,
    allocated: bool,
    freed: bool,
}

/// What the loader knows about one instance.
///
/// `alloc_time` is `None` when the allocation happened before every range
/// queried so far, `free_time` is `None` when no deallocation was seen.
#[derive(Debug)]
struct Tracked {
    template: InstanceObject,
    alloc_time: Option<i64>,
    free_time: Option<i64>,
    free_thread: Option<ThreadInfo>,
    reported: Presence,
}

impl Tracked {
    fn new(template: InstanceObject) -> Self {
        Tracked {
            template,
            alloc_time: None,
            free_time: None,
            free_thread: None,
            reported: Presence::default(),
        }
    }

    fn presence(&self, window: TimeRange) -> Presence {
        let allocated_before = self.alloc_time.map_or(true, |at| at < window.start);
        let freed_before = self.free_time.is_some_and(|at| at < window.start);
        Presence {
            snapshot: allocated_before && !freed_before,
            allocated: self.alloc_time.is_some_and(|at| window.contains(at)),
            freed: self.free_time.is_some_and(|at| window.contains(at)),
        }
    }

    fn allocation(&self) -> InstanceObject {
        let mut instance = self.template.clone();
        if let Some(alloc_time) = self.alloc_time {
            instance.alloc_time = alloc_time;
        }
        instance
    }

    fn deallocation(&self) -> InstanceObject {
        let mut instance = self.template.clone();
        if let Some(free_time) = self.free_time {
            instance.dealloc_time = free_time;
        }
        instance.dealloc_thread = self.free_thread.clone();
        instance
    }

    /// Appends the changes bringing the heaps from `reported` to `target`.
    /// Additions come first so an instance keeping one role never leaves its set.
    fn report(&mut self, id: InstanceId, target: Presence, batch: &mut DeltaBatch) {
        let from = self.reported;
        let heap_id = self.template.heap_id;
        if target.snapshot && !from.snapshot {
            batch.deltas.push((heap_id, HeapDelta::AddSnapshot(self.template.clone())));
        }
        if target.allocated && !from.allocated {
            batch.deltas.push((heap_id, HeapDelta::AddAllocation(self.allocation())));
        }
        if target.freed && !from.freed {
            batch.deltas.push((heap_id, HeapDelta::AddDeallocation(self.deallocation())));
        }
        if from.snapshot && !target.snapshot {
            batch.deltas.push((heap_id, HeapDelta::RemoveSnapshot(id)));
        }
        if from.allocated && !target.allocated {
            batch.deltas.push((heap_id, HeapDelta::RemoveAllocation(id)));
        }
        if from.freed && !target.freed {
            batch.deltas.push((heap_id, HeapDelta::RemoveDeallocation(id)));
        }
        self.reported = target;
    }
}

/// Orders events by timestamp then by content so repeated events end up
/// next to each other, and drops the repeats.
fn sort_and_dedup<T: Ord + Send>(events: &mut Vec<T>, timestamp: impl Fn(&T) -> i64 + Sync) {
    events.par_sort_by(|a, b| timestamp(a).cmp(&timestamp(b)).then_with(|| a.cmp(b)));
    events.dedup();
}

/// Window reconciliation state, owned by the loader thread.
struct WindowLoader<S> {
    source: S,
    config: CaptureConfig,
    control_rx: Receiver<Control>,
    pending: Option<LoadRequest>,
    contexts: ContextIndex,
    contexts_end: i64,
    tracked: IndexMap<InstanceId, Tracked, RandomState>,
    window: Option<TimeRange>,
}

pub(crate) fn start<S: AllocationEventSource>(
    source: S,
    config: CaptureConfig,
    control_rx: Receiver<Control>,
    send_updates: Sender<WorkerMessage>,
) -> std::io::Result<JoinHandle<()>> {
    let loader = WindowLoader {
        source,
        config,
        control_rx,
        pending: None,
        contexts: ContextIndex::new(),
        contexts_end: i64::MIN,
        tracked: IndexMap::default(),
        window: None,
    };
    thread::Builder::new()
        .name("live-allocation-loader".to_string())
        .spawn(move || loader.run(send_updates))
}

impl<S: AllocationEventSource> WindowLoader<S> {
    fn run(mut self, send_updates: Sender<WorkerMessage>) {
        while let Some(request) = self.next_request() {
            let started = Instant::now();
            let message = match self.load(request.range) {
                Ok(batch) => {
                    log::debug!(
                        "window {} loaded in {:?} with {} changes (reset: {})",
                        batch.range,
                        started.elapsed(),
                        batch.deltas.len(),
                        batch.reset
                    );
                    WorkerMessage::Loaded {
                        generation: request.generation,
                        batch,
                    }
                }
                Err(error) => {
                    log::error!("loading window {} failed: {}", request.range, error);
                    WorkerMessage::Failed {
                        generation: request.generation,
                        error,
                    }
                }
            };
            let failed = matches!(message, WorkerMessage::Failed { .. });
            // the capture may be gone already
            if send_updates.send(message).is_err() || failed {
                break;
            }
        }
        log::debug!("live allocation loader stopped");
    }

    /// Latest queued request, older unstarted ones are dropped.
    fn next_request(&mut self) -> Option<LoadRequest> {
        let mut request = match self.pending.take() {
            Some(request) => request,
            None => match self.control_rx.recv() {
                Ok(Control::Load(request)) => request,
                Ok(Control::Shutdown) | Err(_) => return None,
            },
        };
        for control in self.control_rx.try_iter() {
            match control {
                Control::Load(newer) => {
                    log::debug!("window {} superseded by {}", request.range, newer.range);
                    request = newer;
                }
                Control::Shutdown => return None,
            }
        }
        Some(request)
    }

    /// Runs `query` until the source has the data, waiting on the control
    /// channel between attempts.
    fn fetch<T>(
        &mut self,
        what: &'static str,
        query: impl Fn(&S) -> Result<T, SourceError>,
    ) -> Result<T, LoadError> {
        let started = Instant::now();
        loop {
            match query(&self.source) {
                Ok(value) => return Ok(value),
                Err(SourceError::NotReady) => {
                    let waited = started.elapsed();
                    if waited >= self.config.load_timeout {
                        return Err(LoadError::Timeout {
                            what,
                            waited_ms: waited.as_millis(),
                        });
                    }
                    log::debug!("{} not ready, retrying in {:?}", what, self.config.retry_interval);
                    match self.control_rx.recv_timeout(self.config.retry_interval) {
                        Ok(Control::Load(request)) => self.pending = Some(request),
                        Ok(Control::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                            return Err(LoadError::Interrupted { what });
                        }
                        Err(RecvTimeoutError::Timeout) => (),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn load(&mut self, requested: TimeRange) -> Result<DeltaBatch, LoadError> {
        let last_seen = self.fetch("latest timestamp", |source| source.latest_timestamp())?;
        // the tail past the last seen event may still be in flight
        let end = match last_seen {
            Some(last_seen) => requested.end.min(last_seen.saturating_add(1)),
            None => requested.start,
        };
        let window = TimeRange::new(requested.start, end.max(requested.start));
        if let Some(last_seen) = last_seen {
            self.refresh_contexts(window.end, last_seen)?;
        }

        let mut batch = DeltaBatch::new(window);
        match self.window {
            Some(previous) if previous.overlaps(&window) => self.reconcile(previous, window, &mut batch)?,
            _ => self.rebuild(window, &mut batch)?,
        }
        self.window = Some(window);
        Ok(batch)
    }

    /// Registers the contexts up to the padded window end, never past what
    /// the source has flushed: later contexts are fetched by a later load.
    fn refresh_contexts(&mut self, end: i64, last_seen: i64) -> Result<(), LoadError> {
        let target = end
            .saturating_add(self.config.load_buffer_ns)
            .min(last_seen.saturating_add(1));
        if target <= self.contexts_end {
            return Ok(());
        }
        let range = TimeRange::new(self.contexts_end, target);
        let contexts = self.fetch("allocation contexts", |source| source.allocation_contexts(range))?;
        if !contexts.is_empty() {
            log::debug!(
                "registering {} classes, {} methods, {} stacks and {} threads",
                contexts.classes.len(),
                contexts.methods.len(),
                contexts.stacks.len(),
                contexts.threads.len()
            );
        }
        self.contexts.register(contexts);
        self.contexts_end = target;
        Ok(())
    }

    /// Events in `range`, queried with padding then clipped, sorted and deduplicated.
    fn allocation_events(&mut self, range: TimeRange) -> Result<Vec<AllocationEvent>, LoadError> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let padded = range.padded(self.config.load_buffer_ns);
        let mut events = self.fetch("allocation events", |source| source.allocation_events(padded))?;
        events.retain(|event| range.contains(event.timestamp));
        sort_and_dedup(&mut events, |event| event.timestamp);
        Ok(events)
    }

    fn jni_reference_events(&mut self, range: TimeRange) -> Result<Vec<JniReferenceEvent>, LoadError> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let padded = range.padded(self.config.load_buffer_ns);
        let mut events = self.fetch("JNI reference events", |source| source.jni_reference_events(padded))?;
        events.retain(|event| range.contains(event.timestamp));
        sort_and_dedup(&mut events, |event| event.timestamp);
        Ok(events)
    }

    /// Forgets everything and reports the window from scratch.
    fn rebuild(&mut self, window: TimeRange, batch: &mut DeltaBatch) -> Result<(), LoadError> {
        log::debug!("rebuilding window {}", window);
        batch.reset = true;
        self.tracked.clear();

        let snapshot = self.fetch("allocation snapshot", |source| source.allocation_snapshot(window.start))?;
        for data in &snapshot {
            let id = InstanceId::Object(data.tag);
            if !self.tracked.contains_key(&id) {
                if let Some(template) = self.contexts.object_template(data) {
                    self.tracked.insert(id, Tracked::new(template));
                }
            }
        }
        for event in self.allocation_events(window)? {
            self.fold_allocation_event(&event);
        }

        if self.config.track_jni_references {
            let references = self.fetch("JNI reference snapshot", |source| {
                source.jni_reference_snapshot(window.start)
            })?;
            for event in &references {
                self.track_jni_reference(event);
            }
            for event in self.jni_reference_events(window)? {
                self.fold_jni_event(&event);
            }
        }

        for (id, tracked) in self.tracked.iter_mut() {
            let target = tracked.presence(window);
            tracked.report(*id, target, batch);
        }
        Ok(())
    }

    /// Re-reads the regions between the old and new boundaries and reports
    /// the instances whose roles changed.
    fn reconcile(&mut self, previous: TimeRange, window: TimeRange, batch: &mut DeltaBatch) -> Result<(), LoadError> {
        let left = TimeRange::new(previous.start.min(window.start), previous.start.max(window.start));
        let right = TimeRange::new(previous.end.min(window.end), previous.end.max(window.end));
        log::debug!("moving window {} to {}", previous, window);

        let mut affected: IndexSet<InstanceId, RandomState> = IndexSet::default();
        for region in [left, right] {
            for event in self.allocation_events(region)? {
                affected.extend(self.fold_allocation_event(&event));
            }
            if self.config.track_jni_references {
                for event in self.jni_reference_events(region)? {
                    affected.extend(self.fold_jni_event(&event));
                }
            }
        }

        for id in affected {
            if let Some(tracked) = self.tracked.get_mut(&id) {
                let target = tracked.presence(window);
                tracked.report(id, target, batch);
            }
        }
        Ok(())
    }

    fn fold_allocation_event(&mut self, event: &AllocationEvent) -> Option<InstanceId> {
        let data = event.data();
        let id = InstanceId::Object(data.tag);
        if !self.tracked.contains_key(&id) {
            let template = self.contexts.object_template(data)?;
            self.tracked.insert(id, Tracked::new(template));
        }
        let tracked = self.tracked.get_mut(&id)?;
        match &event.kind {
            AllocationEventKind::Allocation(_) => tracked.alloc_time = Some(event.timestamp),
            AllocationEventKind::Deallocation(_) => tracked.free_time = Some(event.timestamp),
        }
        Some(id)
    }

    /// Ensures the reference of `event` is tracked, `None` when its object
    /// was never observed.
    fn track_jni_reference(&mut self, event: &JniReferenceEvent) -> Option<InstanceId> {
        let id = InstanceId::JniReference {
            tag: event.tag,
            ref_value: event.ref_value,
        };
        if self.tracked.contains_key(&id) {
            return Some(id);
        }
        let Some(referent) = self.tracked.get(&InstanceId::Object(event.tag)) else {
            log::debug!("JNI reference 0x{:x} to unknown object @{} dropped", event.ref_value, event.tag);
            return None;
        };
        let template = self.contexts.jni_template(event, &referent.template);
        self.tracked.insert(id, Tracked::new(template));
        Some(id)
    }

    fn fold_jni_event(&mut self, event: &JniReferenceEvent) -> Option<InstanceId> {
        let id = self.track_jni_reference(event)?;
        let free_thread = event.thread_id.map(|thread_id| self.contexts.thread(thread_id));
        let tracked = self.tracked.get_mut(&id)?;
        match event.kind {
            JniReferenceEventKind::Create => tracked.alloc_time = Some(event.timestamp),
            JniReferenceEventKind::Delete => {
                tracked.free_time = Some(event.timestamp);
                tracked.free_thread = free_thread;
            }
        }
        Some(id)
    }
}
