use esp_hal::delay::Delay;
use gatekeeper::config::Settings;
use gatekeeper::gate::{Clock, GateQueue};
use gatekeeper::handshake::FlashHandshake;
use gatekeeper::ticks::Tick;

/// Milliseconds since boot.
pub fn uptime_ms() -> u64 {
    esp_hal::time::Instant::now().duration_since_epoch().as_millis()
}

/// Wrapping millisecond tick from the system timer.
#[derive(Clone, Copy)]
pub struct HalClock;

impl Clock for HalClock {
    fn now(&self) -> Tick {
        uptime_ms() as Tick
    }

    fn pause_ms(&self, ms: u32) {
        Delay::new().delay_millis(ms);
    }
}

pub static FLASH: FlashHandshake = FlashHandshake::new();

/// Gate requests (core 1 → core 0) and lower gate status (core 0 → core 1).
pub static GATES: GateQueue = GateQueue::new();

/// Written by the dispatcher on core 1, read every cycle by core 0.
pub static SETTINGS: Settings = Settings::new();
