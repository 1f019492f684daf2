//! Session state for the UI
//!
//! Two views of the same snapshots: a `watch` cell holding the latest value,
//! for late subscribers, and a `broadcast` stream carrying every change, for
//! UIs that animate transitions. Only the session supervisor publishes.

use tokio::sync::{broadcast, watch};

use super::SessionSnapshot;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

pub struct StateStream {
    current: watch::Sender<SessionSnapshot>,
    changes: broadcast::Sender<SessionSnapshot>,
}

impl StateStream {
    pub fn new() -> Self {
        let (current, _) = watch::channel(SessionSnapshot::default());
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { current, changes }
    }

    /// Apply `update` to the current snapshot and announce it if it changed.
    ///
    /// Returns whether anything changed.
    pub fn publish(&self, update: impl FnOnce(&mut SessionSnapshot)) -> bool {
        let changed = self.current.send_if_modified(|snapshot| {
            let before = snapshot.clone();
            update(snapshot);
            *snapshot != before
        });
        if changed {
            // No subscribers is fine
            let _ = self.changes.send(self.snapshot());
        }
        changed
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.current.borrow().clone()
    }

    /// Every change from now on. Slow readers see `Lagged` and skip ahead.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionSnapshot> {
        self.changes.subscribe()
    }

    /// Latest snapshot, with change notification
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.current.subscribe()
    }
}

impl Default for StateStream {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use crate::state_machine::TurnState;

    #[test]
    fn test_publish_reaches_both_views() {
        let stream = StateStream::new();
        let mut changes = stream.subscribe();
        let watcher = stream.watch();

        assert!(stream.publish(|s| s.session = SessionState::Connecting));
        assert!(stream.publish(|s| s.turn = TurnState::UserSpeaking));

        assert_eq!(changes.try_recv().unwrap().session, SessionState::Connecting);
        let latest = changes.try_recv().unwrap();
        assert_eq!(latest.turn, TurnState::UserSpeaking);
        assert_eq!(*watcher.borrow(), latest);
    }

    #[test]
    fn test_unchanged_snapshot_is_not_announced() {
        let stream = StateStream::new();
        let mut changes = stream.subscribe();

        assert!(!stream.publish(|s| s.session = SessionState::Idle));
        assert!(changes.try_recv().is_err());
    }
}
