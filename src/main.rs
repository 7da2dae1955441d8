//! Gatekeeper - ESP32 dual-core firmware for a chat-operated building gate.
//!
//! Architecture:
//! - Core 0 (`core0`): gate timing loop driving the gate relays and the LED
//! - Core 1 (`core1`): WiFi, DHCP, bot long-polling and command dispatch
//!
//! Cross-core communication goes through the `shared` module: a bounded
//! request queue, a status slot, atomic settings and the flash handshake.

#![no_std]
#![no_main]

use esp_bootloader_esp_idf::esp_app_desc;
esp_app_desc!();

mod core0;
mod core1;
mod flash;
mod heap;
mod shared;
mod telegram;

extern crate alloc;

use core::cell::RefCell;
use core::mem::MaybeUninit;
use critical_section::Mutex;
use esp_alloc as _;
use esp_hal::{
    clock::CpuClock,
    gpio::{Level, Output, OutputConfig},
    interrupt::software::SoftwareInterruptControl,
    main,
    system::Stack,
    time::Duration,
    timer::timg::{TimerGroup, Wdt},
};
use esp_println::logger::init_logger;
use esp_radio::wifi::{Config as WifiConfig, WifiController, WifiDevice};
use gatekeeper::gate::GateDriver;
use static_cell::StaticCell;

// Core 1 stack: WiFi + smoltcp + dispatcher replies (2KB each) live here.
static mut CORE1_STACK: Stack<32768> = Stack::new();

static RADIO: StaticCell<esp_radio::Controller<'static>> = StaticCell::new();

// WiFi handles passed from Core 0 to Core 1
pub(crate) static WIFI_DEVICE: Mutex<RefCell<Option<WifiDevice<'static>>>> =
    Mutex::new(RefCell::new(None));
pub(crate) static WIFI_CONTROLLER: Mutex<RefCell<Option<WifiController<'static>>>> =
    Mutex::new(RefCell::new(None));

// Watchdog timer (shared between cores)
pub(crate) static WATCHDOG: Mutex<RefCell<Option<Wdt<esp_hal::peripherals::TIMG1<'static>>>>> =
    Mutex::new(RefCell::new(None));

/// Feed the watchdog timer. Safe to call from any core.
pub fn feed_watchdog() {
    critical_section::with(|cs| {
        if let Some(ref mut wdt) = *WATCHDOG.borrow_ref_mut(cs) {
            wdt.feed();
        }
    });
}

/// Disable the watchdog timer around operations that stall both cores.
/// Must be paired with `enable_watchdog()`.
pub fn disable_watchdog() {
    critical_section::with(|cs| {
        if let Some(ref mut wdt) = *WATCHDOG.borrow_ref_mut(cs) {
            wdt.disable();
        }
    });
}

/// Re-enable the watchdog timer after `disable_watchdog()`.
pub fn enable_watchdog() {
    critical_section::with(|cs| {
        if let Some(ref mut wdt) = *WATCHDOG.borrow_ref_mut(cs) {
            wdt.enable();
        }
    });
}

#[main]
fn main() -> ! {
    init_logger(log::LevelFilter::Info);
    log::info!("Gatekeeper starting...");

    // Heap for the radio stack
    const HEAP_SIZE: usize = 72 * 1024;
    static mut HEAP: MaybeUninit<[u8; HEAP_SIZE]> = MaybeUninit::uninit();
    unsafe {
        esp_alloc::HEAP.add_region(esp_alloc::HeapRegion::new(
            core::ptr::addr_of_mut!(HEAP) as *mut u8,
            HEAP_SIZE,
            esp_alloc::MemoryCapability::Internal.into(),
        ));
    }

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    // esp-rtos scheduler must run before esp_radio::init
    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    let radio = RADIO.init(esp_radio::init().expect("radio init failed"));
    let (wifi_controller, interfaces) =
        esp_radio::wifi::new(radio, peripherals.WIFI, WifiConfig::default())
            .expect("wifi init failed");

    critical_section::with(|cs| {
        WIFI_DEVICE.borrow_ref_mut(cs).replace(interfaces.sta);
        WIFI_CONTROLLER.borrow_ref_mut(cs).replace(wifi_controller);
    });

    // Watchdog on TIMG1 (TIMG0 drives the scheduler)
    let timg1 = TimerGroup::new(peripherals.TIMG1);
    let mut wdt = timg1.wdt;
    wdt.enable();
    wdt.set_timeout(
        esp_hal::timer::timg::MwdtStage::Stage0,
        Duration::from_secs(30),
    );
    critical_section::with(|cs| {
        WATCHDOG.borrow_ref_mut(cs).replace(wdt);
    });

    // Gate relays start at the closed level of the default polarity.
    let closed = if shared::SETTINGS.open_level() { Level::Low } else { Level::High };
    let upper = Output::new(peripherals.GPIO25, closed, OutputConfig::default());
    let lower = Output::new(peripherals.GPIO26, closed, OutputConfig::default());
    let led = Output::new(peripherals.GPIO2, Level::Low, OutputConfig::default());
    let driver = GateDriver::new([upper, lower], led);

    let sw_ints = SoftwareInterruptControl::new(peripherals.SW_INTERRUPT);
    esp_rtos::start_second_core(
        peripherals.CPU_CTRL,
        sw_ints.software_interrupt0,
        sw_ints.software_interrupt1,
        unsafe { &mut *core::ptr::addr_of_mut!(CORE1_STACK) },
        || {
            core1::run();
        },
    );

    core0::run(driver);
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    critical_section::with(|_| {
        log::error!("PANIC: {}", info);
    });

    // Spin without feeding watchdog. The 30s timeout will trigger a full system reset.
    loop {
        core::hint::spin_loop();
    }
}
