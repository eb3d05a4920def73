//! User activity tracking

use chrono::{DateTime, Utc};
use log::{debug, trace, warn};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use storefront_broadcast::{Broadcaster, LocalBroadcast, Signal};
use tokio::task::JoinHandle;

use crate::monitor::ActivityProbe;

/// Interaction and environment signals fed in by the embedding UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivitySignal {
    Pointer,
    Key,
    Scroll,
    Touch,
    VisibilityChanged { visible: bool },
    Connectivity { online: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityRecord {
    pub last_activity: DateTime<Utc>,
    /// Whether the context is in the foreground
    pub is_active: bool,
}

type SharedRecord = Arc<RwLock<Option<ActivityRecord>>>;

pub struct ActivityTracker {
    record: SharedRecord,
    inputs: LocalBroadcast<ActivitySignal>,
    signals: Arc<dyn Broadcaster<Signal>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ActivityTracker {
    pub fn new(signals: Arc<dyn Broadcaster<Signal>>) -> Self {
        Self {
            record: Arc::new(RwLock::new(None)),
            inputs: LocalBroadcast::new(),
            signals,
            task: Mutex::new(None),
        }
    }

    /// Entry point for the embedder's event listeners. Signals sent while
    /// tracking is stopped are dropped.
    pub fn notify(&self, signal: ActivitySignal) {
        if let Err(err) = self.inputs.publish(signal) {
            warn!("Failed to deliver activity signal: {}", err);
        }
    }

    pub fn start_activity_tracking(&self) {
        let mut lock = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if lock.as_ref().map_or(false, |handle| !handle.is_finished()) {
            trace!("Activity tracking already running");
            return;
        }

        let mut inputs = self.inputs.subscribe();
        let record = Arc::clone(&self.record);
        let signals = Arc::clone(&self.signals);
        touch(&record, true);

        *lock = Some(tokio::spawn(async move {
            while let Some(signal) = inputs.recv().await {
                apply(&record, signals.as_ref(), signal);
            }
        }));
        debug!("Activity tracking started");
    }

    pub fn is_tracking(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Processes one signal synchronously.
    pub fn handle_signal(&self, signal: ActivitySignal) {
        apply(&self.record, self.signals.as_ref(), signal);
    }

    pub fn record_activity(&self) {
        touch(&self.record, true);
    }

    pub fn record(&self) -> Option<ActivityRecord> {
        *self.record.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the last recorded activity lies within `idle_threshold`.
    pub fn is_user_active(&self, idle_threshold: Duration) -> bool {
        let Some(record) = self.record() else {
            return false;
        };
        match (Utc::now() - record.last_activity).to_std() {
            Ok(elapsed) => elapsed <= idle_threshold,
            // Recorded in the future; the clock moved backwards.
            Err(_) => true,
        }
    }

    pub fn stop_activity_tracking(&self) {
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            debug!("Activity tracking stopped");
        }
    }

    /// Stops tracking and erases the record.
    pub fn clear_session(&self) {
        self.stop_activity_tracking();
        *self.record.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl ActivityProbe for ActivityTracker {
    fn is_user_active(&self, idle_threshold: Duration) -> bool {
        ActivityTracker::is_user_active(self, idle_threshold)
    }
}

impl Drop for ActivityTracker {
    fn drop(&mut self) {
        self.stop_activity_tracking();
    }
}

fn apply(record: &SharedRecord, signals: &dyn Broadcaster<Signal>, signal: ActivitySignal) {
    trace!("Activity signal {:?}", signal);
    match signal {
        ActivitySignal::Pointer
        | ActivitySignal::Key
        | ActivitySignal::Scroll
        | ActivitySignal::Touch => touch(record, true),
        ActivitySignal::VisibilityChanged { visible: true } => {
            touch(record, true);
            request_check(signals);
        }
        ActivitySignal::VisibilityChanged { visible: false } => {
            let mut record = record.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(record) = record.as_mut() {
                record.is_active = false;
            }
        }
        ActivitySignal::Connectivity { online: true } => request_check(signals),
        ActivitySignal::Connectivity { online: false } => debug!("Connection lost"),
    }
}

/// Timestamps only move forward.
fn touch(record: &SharedRecord, is_active: bool) {
    let now = Utc::now();
    let mut record = record.write().unwrap_or_else(PoisonError::into_inner);
    let last_activity = match record.as_ref() {
        Some(previous) if previous.last_activity > now => previous.last_activity,
        _ => now,
    };
    *record = Some(ActivityRecord {
        last_activity,
        is_active,
    });
}

fn request_check(signals: &dyn Broadcaster<Signal>) {
    if let Err(err) = signals.publish(Signal::CheckTokenNow) {
        warn!("Failed to request token check: {}", err);
    }
}
