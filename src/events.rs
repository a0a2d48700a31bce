//! Operational event stream with dedup keys, so a stuck pod or a blocked
//! disruption doesn't flood the log on every reconcile tick.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

const DEDUP_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Severity {
    Normal,
    Warning,
}

/// Deduplicating sink: an event with the same key is emitted at most once
/// per TTL window.
#[derive(Default)]
pub struct EventSink {
    seen: Mutex<HashMap<String, Instant>>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the event was actually emitted.
    pub fn emit(&self, severity: Severity, reason: &str, key: &str, message: &str) -> bool {
        let dedup_key = format!("{reason}/{key}");
        let now = Instant::now();
        {
            let mut seen = self.seen.lock().unwrap();
            if let Some(last) = seen.get(&dedup_key)
                && now.duration_since(*last) < DEDUP_TTL
            {
                return false;
            }
            seen.insert(dedup_key, now);
            seen.retain(|_, at| now.duration_since(*at) < DEDUP_TTL);
        }
        match severity {
            Severity::Normal => info!(reason, key, "{message}"),
            Severity::Warning => warn!(reason, key, "{message}"),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_events_are_suppressed() {
        let sink = EventSink::new();
        assert!(sink.emit(Severity::Warning, "FailedScheduling", "default/pod-a", "no capacity"));
        assert!(!sink.emit(Severity::Warning, "FailedScheduling", "default/pod-a", "no capacity"));
        // A different key still goes through.
        assert!(sink.emit(Severity::Warning, "FailedScheduling", "default/pod-b", "no capacity"));
        // As does the same key under another reason.
        assert!(sink.emit(Severity::Normal, "Nominated", "default/pod-a", "node-1"));
    }
}
