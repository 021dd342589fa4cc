use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::capture::worker::{self, Control, LoadRequest, WorkerMessage};
use crate::capture::{
    CaptureAspect, CaptureConfig, CaptureObject, DeltaBatch, APP_HEAP_ID, APP_HEAP_NAME, DEFAULT_HEAP_ID,
    DEFAULT_HEAP_NAME, IMAGE_HEAP_ID, IMAGE_HEAP_NAME, JNI_HEAP_ID, JNI_HEAP_NAME, ZYGOTE_HEAP_ID,
    ZYGOTE_HEAP_NAME,
};
use crate::errors::{HeapSiftError, LoadError};
use crate::heap_set::HeapSet;
use crate::source::{AllocationEventSource, TimeRange};

type Listener = Box<dyn FnMut(CaptureAspect)>;

/// Capture over a continuously growing allocation log, viewed through a
/// movable time window.
///
/// Window loads are computed on a background thread and handed back as
/// [`DeltaBatch`]es. Heaps only change inside [`apply_pending`] and
/// [`wait_for_load`], on the thread owning the capture.
///
/// [`apply_pending`]: LiveAllocationCapture::apply_pending
/// [`wait_for_load`]: LiveAllocationCapture::wait_for_load
pub struct LiveAllocationCapture {
    name: String,
    heap_sets: Vec<HeapSet>,
    control_tx: Sender<Control>,
    receive_updates: Receiver<WorkerMessage>,
    worker: Option<JoinHandle<()>>,
    requested_generation: u64,
    applied_generation: u64,
    loaded_range: Option<TimeRange>,
    error: Option<LoadError>,
    listeners: Vec<Listener>,
}

impl LiveAllocationCapture {
    pub fn new<S: AllocationEventSource>(
        name: &str,
        source: S,
        config: CaptureConfig,
    ) -> Result<Self, HeapSiftError> {
        let mut heap_sets = vec![
            HeapSet::new(DEFAULT_HEAP_ID, DEFAULT_HEAP_NAME),
            HeapSet::new(IMAGE_HEAP_ID, IMAGE_HEAP_NAME),
            HeapSet::new(ZYGOTE_HEAP_ID, ZYGOTE_HEAP_NAME),
            HeapSet::new(APP_HEAP_ID, APP_HEAP_NAME),
        ];
        if config.track_jni_references {
            heap_sets.push(HeapSet::new(JNI_HEAP_ID, JNI_HEAP_NAME));
        }

        // Communication channel from capture to loader
        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        // Communication channel from loader to capture
        let (send_updates, receive_updates) = crossbeam_channel::unbounded();
        let worker = worker::start(source, config, control_rx, send_updates)?;

        Ok(LiveAllocationCapture {
            name: name.to_string(),
            heap_sets,
            control_tx,
            receive_updates,
            worker: Some(worker),
            requested_generation: 0,
            applied_generation: 0,
            loaded_range: None,
            error: None,
            listeners: Vec::new(),
        })
    }

    pub fn add_listener(&mut self, listener: impl FnMut(CaptureAspect) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Schedules loading the `[start_us, end_us)` window, in microseconds.
    ///
    /// A load scheduled while others are still queued replaces them.
    pub fn load(&mut self, start_us: i64, end_us: i64) -> Result<(), HeapSiftError> {
        if let Some(error) = &self.error {
            return Err(HeapSiftError::CaptureLoadError {
                message: error.to_string(),
            });
        }
        self.requested_generation += 1;
        let request = LoadRequest {
            generation: self.requested_generation,
            range: TimeRange::from_micros(start_us, end_us),
        };
        log::debug!("capture `{}` requests window {}", self.name, request.range);
        self.control_tx
            .send(Control::Load(request))
            .map_err(|_| HeapSiftError::WorkerDisconnected)
    }

    /// Applies every batch already computed, returns how many were applied.
    pub fn apply_pending(&mut self) -> usize {
        let mut applied = 0;
        loop {
            match self.receive_updates.try_recv() {
                Ok(message) => {
                    if self.handle(message) {
                        applied += 1;
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return applied,
            }
        }
    }

    /// Blocks until the latest scheduled load is applied.
    pub fn wait_for_load(&mut self, timeout: Duration) -> Result<(), HeapSiftError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(error) = &self.error {
                return Err(HeapSiftError::CaptureLoadError {
                    message: error.to_string(),
                });
            }
            if self.applied_generation >= self.requested_generation {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.receive_updates.recv_timeout(remaining) {
                Ok(message) => {
                    self.handle(message);
                }
                Err(RecvTimeoutError::Timeout) => return Err(HeapSiftError::WaitTimeout),
                Err(RecvTimeoutError::Disconnected) => return Err(HeapSiftError::WorkerDisconnected),
            }
        }
    }

    fn handle(&mut self, message: WorkerMessage) -> bool {
        match message {
            WorkerMessage::Loaded { generation, batch } => {
                self.apply_batch(generation, batch);
                true
            }
            WorkerMessage::Failed { generation, error } => {
                log::error!("capture `{}` failed loading request {}: {}", self.name, generation, error);
                self.error = Some(error);
                self.notify(CaptureAspect::LoadError);
                false
            }
        }
    }

    fn apply_batch(&mut self, generation: u64, batch: DeltaBatch) {
        self.notify(CaptureAspect::HeapUpdating);
        let range = batch.range;
        batch.apply_to(&mut self.heap_sets);
        self.loaded_range = Some(range);
        self.applied_generation = self.applied_generation.max(generation);
        self.notify(CaptureAspect::HeapUpdated);
    }

    fn notify(&mut self, aspect: CaptureAspect) {
        for listener in &mut self.listeners {
            listener(aspect);
        }
    }

    /// Window of the last applied load, in nanoseconds. Its end may be
    /// short of the requested one while the source catches up.
    pub fn loaded_range(&self) -> Option<TimeRange> {
        self.loaded_range
    }

    pub fn error(&self) -> Option<&LoadError> {
        self.error.as_ref()
    }
}

impl CaptureObject for LiveAllocationCapture {
    fn name(&self) -> &str {
        &self.name
    }

    fn heap_sets(&self) -> &[HeapSet] {
        &self.heap_sets
    }

    fn heap_sets_mut(&mut self) -> &mut [HeapSet] {
        &mut self.heap_sets
    }

    fn is_done_loading(&self) -> bool {
        self.error.is_none() && self.applied_generation >= self.requested_generation
    }

    fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

impl Drop for LiveAllocationCapture {
    fn drop(&mut self) {
        // the loader may have stopped on its own after a failure
        self.control_tx.send(Control::Shutdown).unwrap_or_default();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("live allocation loader of `{}` panicked", self.name);
            }
        }
    }
}
