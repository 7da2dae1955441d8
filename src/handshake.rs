//! Flash write coordination between the gate loop and the bot loop.
//!
//! Protocol for safe dual-core flash writes:
//! 1. Core 1 sets state to `Requested`
//! 2. Core 0 sees `Requested` at the top of its loop, sets state to `Safe`
//! 3. Core 1 sees `Safe`, performs the write or erase, sets state to `Done`
//! 4. Core 0 sees `Done`, resumes the gate loop, sets state to `Idle`
//!
//! Core 1 gives up on a request that core 0 has not parked for in time. Core
//! 0 only waits after winning the `Requested` → `Safe` transition, and stops
//! waiting as soon as the state leaves `Safe`, so neither side can be left
//! waiting on the other.

use core::sync::atomic::{AtomicU8, Ordering};

use crate::gate::Clock;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlashState {
    Idle = 0,
    Requested = 1,
    Safe = 2,
    Done = 3,
}

impl From<u8> for FlashState {
    fn from(v: u8) -> Self {
        match v {
            1 => FlashState::Requested,
            2 => FlashState::Safe,
            3 => FlashState::Done,
            _ => FlashState::Idle,
        }
    }
}

pub struct FlashHandshake {
    state: AtomicU8,
}

impl FlashHandshake {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(FlashState::Idle as u8),
        }
    }

    #[inline]
    pub fn state(&self) -> FlashState {
        FlashState::from(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: FlashState, to: FlashState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Request a flash operation (core 1).
    /// Returns false if one is already in progress.
    pub fn request(&self) -> bool {
        self.transition(FlashState::Idle, FlashState::Requested)
    }

    /// Core 0 is parked and holds no locks. Returns false when there is no
    /// pending request to park for, e.g. core 1 already gave up on it.
    pub fn signal_safe(&self) -> bool {
        self.transition(FlashState::Requested, FlashState::Safe)
    }

    pub fn signal_done(&self) {
        self.state.store(FlashState::Done as u8, Ordering::Release);
    }

    pub fn acknowledge_done(&self) -> bool {
        self.transition(FlashState::Done, FlashState::Idle)
    }

    #[inline]
    pub fn is_requested(&self) -> bool {
        self.state() == FlashState::Requested
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.state() == FlashState::Done
    }

    /// Wait for core 0 to park (core 1).
    /// Returns true once it has, false on timeout.
    pub fn wait_for_safe<C: Clock + ?Sized>(&self, clock: &C, timeout_ms: u32) -> bool {
        let start = clock.now();
        loop {
            let state = self.state();
            if state == FlashState::Safe {
                return true;
            }
            if state != FlashState::Requested {
                log::warn!("flash: unexpected state {:?} while waiting for Safe", state);
                return false;
            }
            if clock.now().wrapping_sub(start) > timeout_ms {
                if self.transition(FlashState::Requested, FlashState::Idle) {
                    log::error!("flash: timeout waiting for core 0 safe state");
                    return false;
                }
                // Core 0 parked just as the wait ran out.
                return self.state() == FlashState::Safe;
            }
            clock.pause_ms(1);
        }
    }

    /// Park core 0 for a pending flash operation (core 0).
    ///
    /// `spin` runs between polls and must not take any lock. Returns whether
    /// core 0 parked.
    pub fn park_if_requested(&self, mut spin: impl FnMut()) -> bool {
        if !self.is_requested() || !self.signal_safe() {
            return false;
        }
        while self.state() == FlashState::Safe {
            spin();
        }
        self.acknowledge_done();
        true
    }
}

impl Default for FlashHandshake {
    fn default() -> Self {
        Self::new()
    }
}
