//! Gate timing state machine.
//!
//! Turns open/lock/unlock requests into pulse trains on the gate outputs.
//! Each cycle the controller works out which gates should still be open,
//! then rotates a single output slot through `2 × GATE_COUNT` positions:
//! even slot `2g` drives gate `g`, odd slots drive nothing. At most one gate
//! is energised at any instant, and every pulse is followed by a gap.
//!
//! All time comparisons go through [`crate::ticks`], so the controller keeps
//! working when the tick counter wraps.

use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embedded_hal::digital::{OutputPin, PinState};

use crate::ticks::{self, Tick};

pub const GATE_COUNT: usize = 2;

/// Number of positions the output multiplexer rotates through.
pub const SLOT_COUNT: usize = 2 * GATE_COUNT;

/// Slot that drives no gate; the multiplexer parks here while nothing is open.
pub const DISABLE_ALL: usize = SLOT_COUNT - 1;

/// Capacity of the request queue between the bot and the gate loop.
pub const REQUEST_QUEUE_LEN: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Gate {
    Upper = 0,
    Lower = 1,
}

/// Gate whose remaining open time is published as status.
pub const STATUS_GATE: Gate = Gate::Lower;

impl Gate {
    pub const ALL: [Gate; GATE_COUNT] = [Gate::Upper, Gate::Lower];

    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Keep `gate` open for `delay` ms from now, or release it when `delay < 0`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GateRequest {
    pub gate: Gate,
    pub delay: i32,
}

impl GateRequest {
    pub fn open(gate: Gate, duration_ms: u32) -> Self {
        Self {
            gate,
            delay: duration_ms.min(i32::MAX as u32) as i32,
        }
    }

    pub fn unlock(gate: Gate) -> Self {
        Self { gate, delay: -1 }
    }

    pub fn is_unlock(&self) -> bool {
        self.delay < 0
    }
}

/// Per-cycle timing inputs, re-read from settings every cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GateTiming {
    pub pulse_ms: u32,
    /// Output level that energises a gate (`true` = high).
    pub open_level: bool,
}

/// What the outputs should look like after one cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GateOutputs {
    /// Bit `g` set when gate `g` wants to be open.
    pub active: u8,
    /// Bit `g` set when gate `g` is energised this cycle.
    pub driven: u8,
    /// Pin level per gate.
    pub levels: [bool; GATE_COUNT],
    pub led: bool,
    /// `diff(now, close_at[STATUS_GATE])`: negative while open.
    pub status: i32,
}

impl GateOutputs {
    pub fn is_driven(&self, gate: Gate) -> bool {
        self.driven & (1 << gate.index()) != 0
    }
}

pub struct GateController {
    close_at: [Tick; GATE_COUNT],
    change_level_at: Tick,
    slot: usize,
}

impl GateController {
    /// All gates start closed.
    pub fn new(now: Tick) -> Self {
        Self {
            close_at: [ticks::add(now, -1); GATE_COUNT],
            change_level_at: ticks::add(now, 1),
            slot: DISABLE_ALL,
        }
    }

    pub fn close_at(&self, gate: Gate) -> Tick {
        self.close_at[gate.index()]
    }

    /// Current multiplexer slot.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Run one cycle at `now`, applying at most one request.
    pub fn step(
        &mut self,
        now: Tick,
        request: Option<GateRequest>,
        timing: &GateTiming,
    ) -> GateOutputs {
        if let Some(request) = request {
            self.apply(now, request);
        }

        let mut active = 0u8;
        for gate in Gate::ALL {
            let close_at = &mut self.close_at[gate.index()];
            if ticks::diff(now, *close_at) <= 0 {
                active |= 1 << gate.index();
            } else {
                *close_at = now;
            }
        }

        if active == 0 {
            self.slot = DISABLE_ALL;
            self.change_level_at = ticks::add(now, 1);
        }

        if ticks::is_after(now, self.change_level_at) {
            self.change_level_at = ticks::add(now, timing.pulse_ms as i32);
            self.slot = (self.slot + 1) % SLOT_COUNT;
        }

        let slot_mask = if self.slot % 2 == 0 { 1u8 << (self.slot / 2) } else { 0 };
        let driven = active & slot_mask;

        let mut levels = [!timing.open_level; GATE_COUNT];
        for gate in Gate::ALL {
            if driven & (1 << gate.index()) != 0 {
                levels[gate.index()] = timing.open_level;
            }
        }

        GateOutputs {
            active,
            driven,
            levels,
            led: driven != 0,
            status: ticks::diff(now, self.close_at[STATUS_GATE.index()]),
        }
    }

    fn apply(&mut self, now: Tick, request: GateRequest) {
        let close_at = &mut self.close_at[request.gate.index()];
        if request.is_unlock() {
            *close_at = ticks::add(now, -1);
            self.change_level_at = ticks::add(now, 1);
            log::info!("gate: {:?} released", request.gate);
            return;
        }

        let new_close = ticks::add(now, request.delay);
        if ticks::is_after(new_close, *close_at) {
            *close_at = new_close;
            log::info!("gate: {:?} open for {} ms", request.gate, request.delay);
        } else {
            log::debug!("gate: {:?} already open past requested {} ms", request.gate, request.delay);
        }
    }
}

/// Time source and sleep for the bounded waits below.
pub trait Clock {
    fn now(&self) -> Tick;
    fn pause_ms(&self, ms: u32);
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> Tick {
        (**self).now()
    }

    fn pause_ms(&self, ms: u32) {
        (**self).pause_ms(ms)
    }
}

/// The request queue is full.
#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
#[error("gate request queue is full")]
pub struct GateBusy;

/// Request queue and status slot shared by the gate loop and the bot loop.
///
/// Requests are many-producer/single-consumer with [`REQUEST_QUEUE_LEN`]
/// capacity. Status is a single overwrite slot that readers only peek.
pub struct GateQueue {
    requests: Channel<CriticalSectionRawMutex, GateRequest, REQUEST_QUEUE_LEN>,
    status: AtomicI32,
    published: AtomicBool,
}

impl GateQueue {
    pub const fn new() -> Self {
        Self {
            requests: Channel::new(),
            status: AtomicI32::new(0),
            published: AtomicBool::new(false),
        }
    }

    /// Enqueue a request, waiting at most `timeout_ms` for a free slot.
    pub fn submit<C: Clock + ?Sized>(
        &self,
        clock: &C,
        request: GateRequest,
        timeout_ms: u32,
    ) -> Result<(), GateBusy> {
        let deadline = ticks::add(clock.now(), timeout_ms as i32);
        loop {
            if self.requests.try_send(request).is_ok() {
                return Ok(());
            }
            if !ticks::is_after(deadline, clock.now()) {
                log::warn!("gate: request queue full, dropping {:?}", request);
                return Err(GateBusy);
            }
            clock.pause_ms(1);
        }
    }

    /// Take the next request, waiting at most `wait_ms` for one.
    pub fn receive<C: Clock + ?Sized>(&self, clock: &C, wait_ms: u32) -> Option<GateRequest> {
        let deadline = ticks::add(clock.now(), wait_ms as i32);
        loop {
            if let Ok(request) = self.requests.try_receive() {
                return Some(request);
            }
            if !ticks::is_after(deadline, clock.now()) {
                return None;
            }
            clock.pause_ms(1);
        }
    }

    pub fn publish_status(&self, status: i32) {
        self.status.store(status, Ordering::Relaxed);
        self.published.store(true, Ordering::Release);
    }

    /// Read the last published status without consuming it, waiting at most
    /// `wait_ms` for the gate loop to publish a first value.
    pub fn peek_status<C: Clock + ?Sized>(&self, clock: &C, wait_ms: u32) -> Option<i32> {
        let deadline = ticks::add(clock.now(), wait_ms as i32);
        loop {
            if self.published.load(Ordering::Acquire) {
                return Some(self.status.load(Ordering::Relaxed));
            }
            if !ticks::is_after(deadline, clock.now()) {
                return None;
            }
            clock.pause_ms(1);
        }
    }

    pub fn pending(&self) -> usize {
        self.requests.len()
    }
}

impl Default for GateQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Applies [`GateOutputs`] to the gate relays and the indicator LED.
pub struct GateDriver<P> {
    gates: [P; GATE_COUNT],
    led: P,
}

impl<P: OutputPin> GateDriver<P> {
    pub fn new(gates: [P; GATE_COUNT], led: P) -> Self {
        Self { gates, led }
    }

    pub fn apply(&mut self, outputs: &GateOutputs) -> Result<(), P::Error> {
        for (pin, &level) in self.gates.iter_mut().zip(outputs.levels.iter()) {
            pin.set_state(PinState::from(level))?;
        }
        self.led.set_state(PinState::from(outputs.led))
    }

    /// Put every gate at its closed level.
    pub fn release_all(&mut self, open_level: bool) -> Result<(), P::Error> {
        for pin in self.gates.iter_mut() {
            pin.set_state(PinState::from(!open_level))?;
        }
        self.led.set_low()
    }
}
