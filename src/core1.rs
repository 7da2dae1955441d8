//! Core 1: WiFi, bot polling and command dispatch.
//!
//! This core handles network operations:
//! - WiFi connection management with automatic reconnection
//! - DHCP client for IP address acquisition
//! - Loading settings and the registry from flash at boot
//! - Long-polling the bot relay and answering commands

use core::ops::Range;

use esp_radio::wifi::{ClientConfig, ModeConfig, WifiController};
use gatekeeper::bot::UpdateOffset;
use gatekeeper::config::{parse_admin_ids, NetConfig};
use gatekeeper::dispatch::{Dispatcher, QueueLink};
use gatekeeper::gate::Clock;
use gatekeeper::registry::{Registry, Table};
use gatekeeper::storage::FlashStore;
use smoltcp::iface::{Config, Interface, SocketSet, SocketStorage};
use smoltcp::socket::dhcpv4::{Event as DhcpEvent, Socket as DhcpSocket};
use smoltcp::time::Instant as SmoltcpInstant;
use smoltcp::wire::{HardwareAddress, IpCidr};
use static_cell::ConstStaticCell;

use crate::flash::SharedFlash;
use crate::shared::{uptime_ms, HalClock, GATES, SETTINGS};
use crate::telegram::{poll_updates, Link, Relay};
use crate::{WIFI_CONTROLLER, WIFI_DEVICE};

/// Flash region holding the registry and settings map.
const STORAGE_RANGE: Range<u32> = 0x3D_0000..0x3E_0000;

// Timing constants
const BOT_POLL_INTERVAL_MS: u64 = 1_000;
const STATUS_LOG_MS: u64 = 30_000;
const LOW_HEAP_KB: usize = 8;

// WiFi connection constants
const WIFI_CONNECT_TIMEOUT_MS: u64 = 10_000;
const WIFI_MAX_RETRIES_BEFORE_RESET: u8 = 3;
const WIFI_RESET_COOLDOWN_MS: u64 = 5_000;

static REGISTRY: ConstStaticCell<Registry> = ConstStaticCell::new(Registry::new());

/// Core 1 main loop: WiFi and the bot.
pub fn run() -> ! {
    log::info!("Core 1 started (network tasks)");
    let clock = HalClock;

    // Give Core 0 time to finish setup
    clock.pause_ms(100);

    let (mut wifi_device, mut wifi_controller) = critical_section::with(|cs| {
        let device = WIFI_DEVICE.borrow_ref_mut(cs).take().expect("wifi device missing");
        let controller = WIFI_CONTROLLER
            .borrow_ref_mut(cs)
            .take()
            .expect("wifi controller missing");
        (device, controller)
    });

    let config = NetConfig::get();
    log::info!(
        "config: ssid={}, relay={}:{}",
        config.ssid,
        config.relay_host,
        config.relay_port
    );
    let relay = Relay::new(&config);
    if relay.is_none() {
        log::error!("config: relay host {} is not an IPv4 address, bot disabled", config.relay_host);
    }

    // Restore persisted state
    let mut store = FlashStore::new(SharedFlash::new(), STORAGE_RANGE);
    let restored = SETTINGS.load(&mut store);
    log::info!("storage: restored {} settings", restored);

    let registry = REGISTRY.take();
    registry.load(&mut store);
    let seeded = registry.seed_admins(&mut store, parse_admin_ids(config.admins));
    if seeded > 0 {
        log::info!("registry: seeded {} admins from config", seeded);
    }
    if registry.count(Table::Admins) == 0 {
        log::warn!("registry: no admins, nobody can manage the bot");
    }

    crate::heap::log_stats("core1:after_storage_init");

    let mut gate_link = QueueLink::new(&GATES, clock);
    let mut dispatcher = Dispatcher {
        registry,
        settings: &SETTINGS,
        store: &mut store,
        gate: &mut gate_link,
    };
    let mut offset = UpdateOffset::new();

    let mut wifi_state = WifiState::new();

    // Create smoltcp interface
    let mac = esp_radio::wifi::sta_mac();
    let hw_addr = HardwareAddress::Ethernet(smoltcp::wire::EthernetAddress(mac));
    let iface_config = Config::new(hw_addr);
    let mut iface = Interface::new(iface_config, &mut wifi_device, SmoltcpInstant::ZERO);

    // Socket storage for DHCP and the relay client
    let mut socket_storage: [SocketStorage; 4] = Default::default();
    let mut sockets = SocketSet::new(&mut socket_storage[..]);

    let dhcp_socket = DhcpSocket::new();
    let dhcp_handle = sockets.add(dhcp_socket);

    // Timing state
    let mut last_poll: u64 = 0;
    let mut last_log: u64 = 0;
    let mut last_wdt_feed: u64 = 0;
    let mut ip_configured = false;

    loop {
        let now_ms = uptime_ms();
        let smoltcp_now = SmoltcpInstant::from_millis(now_ms as i64);

        // 1. Maintain WiFi connection
        wifi_state.maintain(&mut wifi_controller, &config, now_ms, &mut ip_configured);

        if wifi_state.connected {
            iface.poll(smoltcp_now, &mut wifi_device, &mut sockets);

            let dhcp_socket = sockets.get_mut::<DhcpSocket>(dhcp_handle);
            if let Some(event) = dhcp_socket.poll() {
                match event {
                    DhcpEvent::Configured(dhcp_config) => {
                        let addr = dhcp_config.address;
                        iface.update_ip_addrs(|addrs| {
                            addrs.clear();
                            addrs.push(IpCidr::Ipv4(addr)).ok();
                        });
                        if let Some(router) = dhcp_config.router {
                            iface.routes_mut().add_default_ipv4_route(router).ok();
                        }
                        log::info!("dhcp: IP={}", addr);
                        crate::heap::log_stats("core1:dhcp_configured");
                        ip_configured = true;
                    }
                    DhcpEvent::Deconfigured => {
                        log::warn!("dhcp: deconfigured");
                        iface.update_ip_addrs(|addrs| addrs.clear());
                        ip_configured = false;
                    }
                }
            }

            // 2. Poll the bot once we have an IP
            if ip_configured && now_ms - last_poll >= BOT_POLL_INTERVAL_MS {
                last_poll = now_ms;
                if let Some(relay) = relay.as_ref() {
                    let mut link = Link {
                        iface: &mut iface,
                        device: &mut wifi_device,
                        sockets: &mut sockets,
                    };
                    poll_updates(&mut link, relay, &mut dispatcher, &mut offset);
                }
            }
        }

        // 3. Status logging
        if now_ms - last_log > STATUS_LOG_MS {
            last_log = now_ms;
            log::info!(
                "status: {} users, {} admins, {} gate requests queued, offset={}, wifi={}",
                dispatcher.registry.count(Table::Users),
                dispatcher.registry.count(Table::Admins),
                GATES.pending(),
                offset.get(),
                if wifi_state.connected { "up" } else { "down" }
            );
            crate::heap::warn_if_low(LOW_HEAP_KB, "core1");
        }

        // 4. Feed watchdog from Core 1 as backup to Core 0
        if now_ms - last_wdt_feed >= 5000 {
            last_wdt_feed = now_ms;
            crate::feed_watchdog();
        }

        clock.pause_ms(10);
    }
}

/// WiFi connection state machine.
struct WifiState {
    connected: bool,
    connecting: bool,
    connect_started: u64,
    retry_count: u8,
    cooldown_until: u64,
}

impl WifiState {
    fn new() -> Self {
        Self {
            connected: false,
            connecting: false,
            connect_started: 0,
            retry_count: 0,
            cooldown_until: 0,
        }
    }

    fn maintain(
        &mut self,
        controller: &mut WifiController<'_>,
        config: &NetConfig,
        now_ms: u64,
        ip_configured: &mut bool,
    ) {
        use alloc::string::ToString;

        let clock = HalClock;
        if !self.connected {
            if now_ms < self.cooldown_until {
                // Still cooling down after a radio reset
            } else if !self.connecting {
                log::info!("wifi: connecting to {}", config.ssid);

                // Stop before (re)configuring to avoid ESP-IDF errors
                let _ = controller.stop();
                clock.pause_ms(10);

                let client_config = ClientConfig::default()
                    .with_ssid(config.ssid.to_string())
                    .with_password(config.password.to_string());
                if let Err(e) = controller.set_config(&ModeConfig::Client(client_config)) {
                    log::error!("wifi: set_config failed: {:?}", e);
                }
                if let Err(e) = controller.start() {
                    log::error!("wifi: start failed: {:?}", e);
                }
                if let Err(e) = controller.connect() {
                    log::error!("wifi: connect failed: {:?}", e);
                }
                self.connecting = true;
                self.connect_started = now_ms;
            } else if controller.is_connected().unwrap_or(false) {
                log::info!("wifi: connected");
                self.connected = true;
                self.connecting = false;
                self.retry_count = 0;
            } else if now_ms - self.connect_started > WIFI_CONNECT_TIMEOUT_MS {
                self.retry_count = self.retry_count.saturating_add(1);
                log::warn!(
                    "wifi: connection timeout (attempt {}/{})",
                    self.retry_count,
                    WIFI_MAX_RETRIES_BEFORE_RESET
                );

                if self.retry_count >= WIFI_MAX_RETRIES_BEFORE_RESET {
                    log::warn!("wifi: power-cycling radio after {} failures", self.retry_count);
                    self.power_cycle(controller, now_ms);
                    self.retry_count = 0;
                }

                self.connecting = false;
            }
        } else if !controller.is_connected().unwrap_or(false) {
            log::warn!("wifi: disconnected, will power-cycle radio");
            self.connected = false;
            self.connecting = false;
            *ip_configured = false;
            self.power_cycle(controller, now_ms);
        }
    }

    fn power_cycle(&mut self, controller: &mut WifiController<'_>, now_ms: u64) {
        if let Err(e) = controller.disconnect() {
            log::warn!("wifi: disconnect failed: {:?}", e);
        }
        if let Err(e) = controller.stop() {
            log::warn!("wifi: stop failed: {:?}", e);
        }
        crate::feed_watchdog();
        HalClock.pause_ms(100);
        self.cooldown_until = now_ms + WIFI_RESET_COOLDOWN_MS;
    }
}
