// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicI32, AtomicU8, Ordering};

use crate::error::Errno;

/// What the caller of [`ReadOnlyNotifier::record`] must do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordOutcome {
    /// This caller won the race: schedule listener notification now.
    NotifyNow,
    /// This caller won, but notifications are held; the notification is
    /// parked and must be re-scheduled when they are re-allowed.
    Deferred,
    /// Some earlier caller already put the device in read-only mode.
    AlreadyReadOnly,
}

const STATE_MAY_NOTIFY: u8 = 0;
const STATE_NOTIFYING: u8 = 1;
const STATE_MAY_NOT_NOTIFY: u8 = 2;

/// The process-wide read-only latch.
///
/// The error word and the state word are the only atomic cells the zones
/// share; everything else about read-only entry travels as messages. A
/// zone's cached `is_read_only` bit may lag this word briefly; the cost
/// is at most one extra journal write that the journal thread discards.
pub struct ReadOnlyNotifier {
    /// Zero while healthy; the first escalating error code afterwards.
    error: AtomicI32,
    state: AtomicU8,
    /// Set when an entry arrived while notifications were held.
    deferred: AtomicU8,
}

fn errno_code(errno: Errno) -> i32 {
    // Stable numeric codes for the shared error word.
    -(errno as i32 + 1)
}

impl ReadOnlyNotifier {
    pub fn new() -> Self {
        Self {
            error: AtomicI32::new(0),
            state: AtomicU8::new(STATE_MAY_NOTIFY),
            deferred: AtomicU8::new(0),
        }
    }

    /// Returns whether the device has entered read-only mode.
    pub fn is_read_only(&self) -> bool {
        self.error.load(Ordering::Acquire) != 0
    }

    /// Requests read-only entry for `errno`. Only the first caller wins;
    /// the winner is told whether to notify listeners now or later.
    pub fn record(&self, errno: Errno) -> RecordOutcome {
        let won = self
            .error
            .compare_exchange(0, errno_code(errno), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !won {
            return RecordOutcome::AlreadyReadOnly;
        }
        match self.state.compare_exchange(
            STATE_MAY_NOTIFY,
            STATE_NOTIFYING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => RecordOutcome::NotifyNow,
            Err(_) => {
                self.deferred.store(1, Ordering::Release);
                RecordOutcome::Deferred
            }
        }
    }

    /// Marks the notification walk complete.
    pub fn finish_notifying(&self) {
        self.state.store(STATE_MAY_NOTIFY, Ordering::Release);
    }

    /// Holds notifications (suspend does this while writing the super
    /// block).
    pub fn set_may_not_notify(&self) {
        self.state.store(STATE_MAY_NOT_NOTIFY, Ordering::Release);
    }

    /// Re-allows notifications; returns whether a deferred entry is
    /// waiting and must be scheduled by the caller.
    pub fn allow_notifications(&self) -> bool {
        self.state.store(STATE_MAY_NOTIFY, Ordering::Release);
        self.deferred.swap(0, Ordering::AcqRel) != 0
    }
}

impl Default for ReadOnlyNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{ReadOnlyNotifier, RecordOutcome};
    use crate::error::Errno;

    #[test]
    fn first_recorder_wins_exactly_once() {
        let notifier = ReadOnlyNotifier::new();
        assert!(!notifier.is_read_only());
        assert_eq!(notifier.record(Errno::IoFailed), RecordOutcome::NotifyNow);
        assert!(notifier.is_read_only());
        assert_eq!(
            notifier.record(Errno::CorruptJournal),
            RecordOutcome::AlreadyReadOnly
        );
    }

    #[test]
    fn held_notifications_defer_and_replay() {
        let notifier = ReadOnlyNotifier::new();
        notifier.set_may_not_notify();
        assert_eq!(notifier.record(Errno::IoFailed), RecordOutcome::Deferred);
        assert!(notifier.is_read_only());

        // Re-allowing surfaces the parked notification exactly once.
        assert!(notifier.allow_notifications());
        assert!(!notifier.allow_notifications());
    }
}
