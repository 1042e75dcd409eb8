// SPDX-License-Identifier: MPL-2.0

use crate::prelude::*;

/// The device-wide admin state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdminState {
    /// Normal operation.
    Operating,
    /// A suspend is stepping through its phases.
    Suspending,
    /// Drained and saved; no data-plane work is admitted.
    Suspended,
    /// A resume is in progress.
    Resuming,
}

/// The phases of a suspend, in execution order. Each phase either
/// initiates a drain on some set of zones and resumes in the next phase
/// when the last callee responds, or transitions synchronously.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuspendPhase {
    Start,
    DrainPacker,
    DrainDataVios,
    DrainFlusher,
    DrainLogicalZones,
    DrainBlockMap,
    DrainJournal,
    DrainDepot,
    WaitReadOnly,
    WriteSuperBlock,
    End,
}

impl SuspendPhase {
    /// The phase following this one, if any.
    pub fn next(self) -> Option<SuspendPhase> {
        use SuspendPhase::*;
        Some(match self {
            Start => DrainPacker,
            DrainPacker => DrainDataVios,
            DrainDataVios => DrainFlusher,
            DrainFlusher => DrainLogicalZones,
            DrainLogicalZones => DrainBlockMap,
            DrainBlockMap => DrainJournal,
            DrainJournal => DrainDepot,
            DrainDepot => WaitReadOnly,
            WaitReadOnly => WriteSuperBlock,
            WriteSuperBlock => End,
            End => return None,
        })
    }
}

/// Tracks the admin state and rejects conflicting operations.
pub struct AdminStateMachine {
    state: AdminState,
}

impl AdminStateMachine {
    pub fn new() -> Self {
        Self {
            state: AdminState::Operating,
        }
    }

    pub fn state(&self) -> AdminState {
        self.state
    }

    pub fn is_suspended(&self) -> bool {
        self.state == AdminState::Suspended
    }

    /// Begins a suspend.
    pub fn start_suspending(&mut self) -> Result<()> {
        match self.state {
            AdminState::Operating => {
                self.state = AdminState::Suspending;
                Ok(())
            }
            AdminState::Suspended => Err(Error::with_msg(
                InvalidAdminState,
                "device is already suspended",
            )),
            _ => Err(Error::with_msg(
                InvalidAdminState,
                "conflicting admin operation in progress",
            )),
        }
    }

    /// Completes a suspend.
    pub fn finish_suspending(&mut self) {
        debug_assert_eq!(self.state, AdminState::Suspending);
        self.state = AdminState::Suspended;
    }

    /// Begins a resume.
    pub fn start_resuming(&mut self) -> Result<()> {
        match self.state {
            AdminState::Suspended => {
                self.state = AdminState::Resuming;
                Ok(())
            }
            _ => Err(Error::with_msg(
                InvalidAdminState,
                "resume requires a suspended device",
            )),
        }
    }

    /// Completes a resume.
    pub fn finish_resuming(&mut self) {
        debug_assert_eq!(self.state, AdminState::Resuming);
        self.state = AdminState::Operating;
    }
}

impl Default for AdminStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{AdminState, AdminStateMachine, SuspendPhase};

    #[test]
    fn phases_run_in_documented_order() {
        let mut phase = SuspendPhase::Start;
        let mut order = vec![phase];
        while let Some(next) = phase.next() {
            order.push(next);
            phase = next;
        }
        assert_eq!(
            order,
            [
                SuspendPhase::Start,
                SuspendPhase::DrainPacker,
                SuspendPhase::DrainDataVios,
                SuspendPhase::DrainFlusher,
                SuspendPhase::DrainLogicalZones,
                SuspendPhase::DrainBlockMap,
                SuspendPhase::DrainJournal,
                SuspendPhase::DrainDepot,
                SuspendPhase::WaitReadOnly,
                SuspendPhase::WriteSuperBlock,
                SuspendPhase::End,
            ]
        );
    }

    #[test]
    fn conflicting_operations_rejected() {
        let mut machine = AdminStateMachine::new();
        assert!(machine.start_resuming().is_err());
        machine.start_suspending().unwrap();
        assert!(machine.start_suspending().is_err());
        machine.finish_suspending();
        assert!(machine.is_suspended());
        assert!(machine.start_suspending().is_err());
        machine.start_resuming().unwrap();
        machine.finish_resuming();
        assert_eq!(machine.state(), AdminState::Operating);
    }
}
