// SPDX-License-Identifier: MPL-2.0

use std::collections::VecDeque;

/// The admin state of a slab scrubber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScrubberState {
    /// No scrubbing in progress and none requested.
    Idle,
    /// Slabs are being scrubbed one at a time.
    Scrubbing,
    /// Scrubbing is suspended; the current slab was finished first.
    Suspended,
}

/// Schedules the replay of dirty slabs, one slab in flight at a time.
///
/// Two queues feed the scrubber: slabs needed to satisfy allocation
/// pressure go to the high-priority list, the rest wait on the normal
/// list. During recovery `high_priority_only` suppresses the normal list
/// so the device can come online before every slab is clean.
pub struct Scrubber {
    high_priority: VecDeque<u64>,
    normal: VecDeque<u64>,
    in_flight: Option<u64>,
    high_priority_only: bool,
    state: ScrubberState,
    slabs_scrubbed: u64,
}

impl Scrubber {
    pub fn new() -> Self {
        Self {
            high_priority: VecDeque::new(),
            normal: VecDeque::new(),
            in_flight: None,
            high_priority_only: false,
            state: ScrubberState::Idle,
            slabs_scrubbed: 0,
        }
    }

    /// Returns the scrubber's admin state.
    pub fn state(&self) -> ScrubberState {
        self.state
    }

    /// Returns how many slabs have been scrubbed since startup.
    pub fn slabs_scrubbed(&self) -> u64 {
        self.slabs_scrubbed
    }

    /// Queues a slab for scrubbing.
    pub fn register_slab(&mut self, slab_index: u64, high_priority: bool) {
        if high_priority {
            self.high_priority.push_back(slab_index);
        } else {
            self.normal.push_back(slab_index);
        }
    }

    /// Promotes a queued slab to the high-priority list (an allocator is
    /// waiting on it).
    pub fn promote_slab(&mut self, slab_index: u64) {
        if let Some(position) = self.normal.iter().position(|&index| index == slab_index) {
            self.normal.remove(position);
            self.high_priority.push_back(slab_index);
        }
    }

    /// Suppresses (or re-enables) low-priority scrubbing.
    pub fn set_high_priority_only(&mut self, high_priority_only: bool) {
        self.high_priority_only = high_priority_only;
    }

    /// Returns whether any slab is queued or in flight.
    pub fn has_work(&self) -> bool {
        self.in_flight.is_some()
            || !self.high_priority.is_empty()
            || (!self.high_priority_only && !self.normal.is_empty())
    }

    /// Takes the next slab to scrub, priority list first. Returns `None`
    /// when suspended, already busy, or out of eligible work.
    pub fn next_slab(&mut self) -> Option<u64> {
        if self.state == ScrubberState::Suspended || self.in_flight.is_some() {
            return None;
        }
        let next = self.high_priority.pop_front().or_else(|| {
            if self.high_priority_only {
                None
            } else {
                self.normal.pop_front()
            }
        })?;
        self.in_flight = Some(next);
        self.state = ScrubberState::Scrubbing;
        Some(next)
    }

    /// Records that the in-flight slab finished scrubbing.
    pub fn finish_slab(&mut self, slab_index: u64) {
        debug_assert_eq!(self.in_flight, Some(slab_index));
        self.in_flight = None;
        self.slabs_scrubbed += 1;
        if !self.has_work() && self.state == ScrubberState::Scrubbing {
            self.state = ScrubberState::Idle;
        }
    }

    /// Suspends scrubbing. The caller finishes the in-flight slab before
    /// honoring the suspension; no new slab will be handed out.
    pub fn stop_scrubbing(&mut self) {
        self.state = ScrubberState::Suspended;
    }

    /// Resumes scrubbing; a no-op when no work remains.
    pub fn resume_scrubbing(&mut self) {
        if self.state != ScrubberState::Suspended {
            return;
        }
        self.state = if self.has_work() {
            ScrubberState::Scrubbing
        } else {
            ScrubberState::Idle
        };
    }
}

impl Default for Scrubber {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{Scrubber, ScrubberState};

    #[test]
    fn priority_first_one_in_flight() {
        let mut scrubber = Scrubber::new();
        scrubber.register_slab(1, false);
        scrubber.register_slab(2, true);
        scrubber.register_slab(3, false);

        assert_eq!(scrubber.next_slab(), Some(2));
        // Only one slab in flight at a time.
        assert_eq!(scrubber.next_slab(), None);
        scrubber.finish_slab(2);

        assert_eq!(scrubber.next_slab(), Some(1));
        scrubber.finish_slab(1);
        assert_eq!(scrubber.next_slab(), Some(3));
        scrubber.finish_slab(3);
        assert_eq!(scrubber.state(), ScrubberState::Idle);
        assert_eq!(scrubber.slabs_scrubbed(), 3);
    }

    #[test]
    fn high_priority_only_suppresses_normal_work() {
        let mut scrubber = Scrubber::new();
        scrubber.set_high_priority_only(true);
        scrubber.register_slab(1, false);
        assert!(!scrubber.has_work());
        assert_eq!(scrubber.next_slab(), None);

        scrubber.promote_slab(1);
        assert!(scrubber.has_work());
        assert_eq!(scrubber.next_slab(), Some(1));
    }

    #[test]
    fn suspend_and_resume() {
        let mut scrubber = Scrubber::new();
        scrubber.register_slab(1, false);
        scrubber.stop_scrubbing();
        assert_eq!(scrubber.next_slab(), None);

        scrubber.resume_scrubbing();
        assert_eq!(scrubber.state(), ScrubberState::Scrubbing);
        assert_eq!(scrubber.next_slab(), Some(1));
        scrubber.finish_slab(1);

        // Resuming with no work is a no-op.
        scrubber.stop_scrubbing();
        scrubber.resume_scrubbing();
        assert_eq!(scrubber.state(), ScrubberState::Idle);
    }
}
