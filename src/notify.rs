//! Notifications: a single event of topic `blindscan` is emitted on a
//! worker's terminal transition. The actual pub/sub fabric is an external
//! collaborator (the control surface); this module only defines the event
//! payload and a trait the session manager pushes through, with a no-op
//! default for hosts that have not wired one up.

use {
    crate::model::{SessionHandle, SessionState},
    serde::{Deserialize, Serialize},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlindscanEvent {
    pub uuid: SessionHandle,
    pub state: SessionState,
    pub peaks: u32,
    pub duration_ms: u64,
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: BlindscanEvent);
}

pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: BlindscanEvent) {}
}

pub struct LoggingSink;

impl EventSink for LoggingSink {
    fn emit(&self, event: BlindscanEvent) {
        log::info!(
            "blindscan: session {} -> {:?} ({} peaks, {}ms)",
            event.uuid,
            event.state,
            event.peaks,
            event.duration_ms
        );
    }
}
