//! Single-writer-wakes-one-reader signals used to glue the router,
//! dispatcher and connector threads together.
//!
//! These are thin wrappers around `crossbeam_channel` rather than raw
//! eventfds: a push is a non-blocking `try_send` on a capacity-1 channel (so
//! repeated pushes before a drain collapse into one pending wakeup, matching
//! "readable when at least one push has occurred"), and waiting for it is
//! just another arm in a `crossbeam_channel::Select`.

use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;

/// A capacity-1 "something happened" signal. Any number of pushes before the
/// next drain collapse into a single pending wakeup.
#[derive(Clone)]
pub struct PushButton {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl PushButton {
    pub fn new() -> PushButton {
        let (tx, rx) = crossbeam_channel::bounded(1);
        PushButton { tx, rx }
    }

    /// Record that an event occurred. Never blocks; a pending, undrained
    /// push makes this a no-op.
    pub fn push(&self) {
        let _ = self.tx.try_send(());
    }

    /// The receiving end, for use in a `Select`.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }

    /// Non-blocking check for whether the button has been pushed.
    pub fn is_pushed(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Drain a single pending push, if any.
    pub fn drain_one(&self) {
        let _ = self.rx.try_recv();
    }
}

impl Default for PushButton {
    fn default() -> PushButton {
        PushButton::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_repeated_pushes() {
        let button = PushButton::new();
        assert!(!button.is_pushed());
        button.push();
        button.push();
        button.push();
        assert!(button.is_pushed());
        button.drain_one();
        assert!(!button.is_pushed());
    }
}
