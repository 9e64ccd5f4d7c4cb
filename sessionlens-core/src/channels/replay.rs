//! Replay channel
//!
//! Wraps the start/stop lifecycle of an external [`ReplayRecorder`] and
//! buffers the frames it emits. Unlike the other time-windowed channels the
//! buffer is pruned after every frame, since frames can arrive at a high rate.

use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::bus::EventBus;
use crate::clock::{SharedClock, new_id};
use crate::config::ReplayOptions;
use crate::retention::{RetentionWindow, prune_by_time};
use crate::types::{FeatureFlags, LogLevel, ReplayFrameEntry, ReplayOrigin, SharedFlags};

/// Receives every frame the recorder emits
pub type FrameCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// Stops an active recording
pub type StopHandle = Box<dyn FnOnce() + Send>;

/// External screen-recording capability
pub trait ReplayRecorder: Send + Sync {
    /// Begin recording, sending frames to `on_frame`.
    ///
    /// Returns `None` when recording could not start.
    fn start(&self, on_frame: FrameCallback, options: &ReplayOptions) -> Option<StopHandle>;
}

const NAMESPACE: &str = "rrweb";

enum RecorderState {
    Idle,
    /// `ReplayRecorder::start` is in progress
    Starting,
    Running(StopHandle),
}

pub struct ReplayChannel {
    me: Weak<ReplayChannel>,
    buffer: Mutex<VecDeque<ReplayFrameEntry>>,
    retention: RwLock<RetentionWindow>,
    flags: RwLock<SharedFlags>,
    recorder: RwLock<Option<Arc<dyn ReplayRecorder>>>,
    options: RwLock<ReplayOptions>,
    state: Mutex<RecorderState>,
    bus: Arc<EventBus>,
    clock: SharedClock,
}

impl ReplayChannel {
    pub fn new(bus: Arc<EventBus>, clock: SharedClock) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            buffer: Mutex::new(VecDeque::new()),
            retention: RwLock::new(RetentionWindow::default()),
            flags: RwLock::new(Arc::new(RwLock::new(FeatureFlags::default()))),
            recorder: RwLock::new(None),
            options: RwLock::new(ReplayOptions::default()),
            state: Mutex::new(RecorderState::Idle),
            bus,
            clock,
        })
    }

    pub fn configure(&self, flags: SharedFlags) {
        *self.flags.write() = flags;
    }

    pub fn set_recorder(&self, recorder: Arc<dyn ReplayRecorder>) {
        *self.recorder.write() = Some(recorder);
    }

    pub fn has_recorder(&self) -> bool {
        self.recorder.read().is_some()
    }

    /// Options handed to the recorder on the next start
    pub fn set_options(&self, options: ReplayOptions) {
        *self.options.write() = options;
    }

    pub fn set_retention(&self, minutes: u64) {
        *self.retention.write() = RetentionWindow::from_minutes(minutes);
    }

    pub fn retention(&self) -> RetentionWindow {
        *self.retention.read()
    }

    pub fn get_all(&self) -> Vec<ReplayFrameEntry> {
        self.buffer.lock().iter().cloned().collect()
    }

    pub fn cleanup(&self) -> usize {
        let window = self.retention();
        let now = self.clock.now();
        prune_by_time(&mut self.buffer.lock(), window, now)
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    /// Whether a recording is active or being started
    pub fn is_running(&self) -> bool {
        !matches!(*self.state.lock(), RecorderState::Idle)
    }

    /// Start the recorder.
    ///
    /// No-op while already running, while `capture_rrweb` is off, or when no
    /// recorder is set. Returns whether a recording was started by this call.
    ///
    /// The recorder may emit frames before `start` returns, so it is called
    /// without holding the state lock.
    pub fn start(&self) -> bool {
        let recorder = {
            let mut state = self.state.lock();
            if !matches!(*state, RecorderState::Idle) {
                return false;
            }
            if !self.flags.read().read().rrweb_enabled() {
                debug!(channel = NAMESPACE, "capture disabled by flag; not starting");
                return false;
            }
            let Some(recorder) = self.recorder.read().clone() else {
                debug!(channel = NAMESPACE, "no recorder available; not starting");
                return false;
            };
            *state = RecorderState::Starting;
            recorder
        };

        let channel = self.me.clone();
        let on_frame: FrameCallback = Arc::new(move |frame| {
            if let Some(channel) = channel.upgrade() {
                channel.record_frame(frame);
            }
        });
        let options = self.options.read().clone();
        let started = recorder.start(on_frame, &options);

        let mut state = self.state.lock();
        let Some(handle) = started else {
            if matches!(*state, RecorderState::Starting) {
                *state = RecorderState::Idle;
            }
            debug!(channel = NAMESPACE, "recorder declined to start");
            return false;
        };
        if !matches!(*state, RecorderState::Starting) {
            // stopped while starting
            drop(state);
            handle();
            debug!(channel = NAMESPACE, "recorder stopped during start");
            return false;
        }
        *state = RecorderState::Running(handle);
        drop(state);

        debug!(channel = NAMESPACE, "recorder started");
        self.bus.publish(
            NAMESPACE,
            LogLevel::Info,
            &ReplayFrameEntry {
                id: new_id(),
                timestamp: self.clock.now(),
                event: json!({"type": "init"}),
                origin: ReplayOrigin::Rrweb,
            },
        );
        true
    }

    /// Stop the recorder if one is running. Returns whether one was stopped.
    ///
    /// Stopping during a start makes that start stop the recording as soon
    /// as the recorder hands back its handle.
    pub fn stop(&self) -> bool {
        let previous = std::mem::replace(&mut *self.state.lock(), RecorderState::Idle);
        match previous {
            RecorderState::Running(stop) => {
                stop();
                debug!(channel = NAMESPACE, "recorder stopped");
                true
            }
            RecorderState::Starting => true,
            RecorderState::Idle => false,
        }
    }

    fn record_frame(&self, frame: Value) {
        let entry = ReplayFrameEntry {
            id: new_id(),
            timestamp: self.clock.now(),
            event: frame,
            origin: ReplayOrigin::Rrweb,
        };
        self.buffer.lock().push_back(entry.clone());
        self.bus.publish(NAMESPACE, LogLevel::Info, &entry);
        self.cleanup();
    }
}

impl std::fmt::Debug for ReplayChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayChannel")
            .field("entries", &self.len())
            .field("running", &self.is_running())
            .field("has_recorder", &self.has_recorder())
            .field("retention", &self.retention())
            .finish()
    }
}
