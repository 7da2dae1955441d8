//! Core 0: real-time gate control.
//!
//! This core handles time-critical operations:
//! - Taking gate requests from the shared queue
//! - Stepping the gate timing state machine and driving the relays and LED
//! - Publishing the lower gate status for the bot loop
//! - Feeding the watchdog timer
//! - Cooperating with Core 1 for safe flash writes

use esp_hal::gpio::Output;
use gatekeeper::gate::{Clock, GateController, GateDriver};

use crate::feed_watchdog;
use crate::shared::{HalClock, FLASH, GATES, SETTINGS};

const WATCHDOG_FEED_MS: u32 = 10_000;

/// Core 0 main loop.
pub fn run(mut driver: GateDriver<Output<'static>>) -> ! {
    let clock = HalClock;
    let mut controller = GateController::new(clock.now());
    let mut last_watchdog_feed = clock.now();

    loop {
        // Flash coordination comes first, before any critical section.
        // The flash cache is off while core 1 writes, so the spin takes no locks.
        let parked = FLASH.park_if_requested(|| {
            for _ in 0..100 {
                core::hint::spin_loop();
            }
        });
        if parked {
            log::debug!("core0: flash write complete, resuming");
        }

        let request = GATES.receive(&clock, SETTINGS.gate_poll_ms());
        let now = clock.now();
        let outputs = controller.step(now, request, &SETTINGS.timing());
        if driver.apply(&outputs).is_err() {
            log::error!("gate: failed to drive outputs");
        }
        GATES.publish_status(outputs.status);

        if now.wrapping_sub(last_watchdog_feed) >= WATCHDOG_FEED_MS {
            last_watchdog_feed = now;
            feed_watchdog();
        }
    }
}
