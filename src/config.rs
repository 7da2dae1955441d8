//! Compile-time network configuration and runtime-tunable gate settings.
//!
//! Network credentials are embedded at build time (see `build.rs`). Gate
//! timing lives in [`Settings`], a block of atomics read by the gate loop every
//! cycle and written by admin commands on the network core. Each write is
//! persisted through a [`Store`] before the atomic changes.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::gate::GateTiming;
use crate::storage::{Store, StoreError};

/// Minimum number of admins the registry keeps.
pub const MIN_ADMINS: usize = 1;

/// Bot relay and Wi-Fi configuration, embedded at compile time.
#[derive(Clone)]
pub struct NetConfig {
    pub ssid: &'static str,
    pub password: &'static str,
    pub relay_host: &'static str,
    pub relay_port: u16,
    pub bot_token: &'static str,
    pub admins: &'static str,
}

impl NetConfig {
    /// Get the compile-time configuration.
    pub fn get() -> Self {
        Self {
            ssid: option_env!("GATEKEEPER_SSID").unwrap_or("unconfigured"),
            password: option_env!("GATEKEEPER_PASSWORD").unwrap_or(""),
            relay_host: option_env!("GATEKEEPER_RELAY_HOST").unwrap_or("192.168.1.1"),
            relay_port: match option_env!("GATEKEEPER_RELAY_PORT") {
                Some(s) => parse_port(s),
                None => 8080,
            },
            bot_token: option_env!("GATEKEEPER_BOT_TOKEN").unwrap_or(""),
            admins: option_env!("GATEKEEPER_ADMINS").unwrap_or(""),
        }
    }
}

/// Parse port at compile time (const fn compatible). Non-digits are ignored;
/// an empty or zero result falls back to 8080.
pub const fn parse_port(s: &str) -> u16 {
    let bytes = s.as_bytes();
    let mut result: u16 = 0;
    let mut i = 0;
    while i < bytes.len() {
        let digit = bytes[i];
        if digit >= b'0' && digit <= b'9' {
            result = result.wrapping_mul(10).wrapping_add((digit - b'0') as u16);
        }
        i += 1;
    }
    if result == 0 {
        8080
    } else {
        result
    }
}

/// Iterate the ids of a comma-separated admin list, skipping junk entries.
pub fn parse_admin_ids(list: &str) -> impl Iterator<Item = i64> + '_ {
    list.split(',')
        .filter_map(|part| part.trim().parse::<i64>().ok())
        .filter(|&id| id != 0)
}

/// Runtime-tunable gate parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Setting {
    GatePoll = 0,
    OpenPulseDuration = 1,
    OpenDuration = 2,
    LockDuration = 3,
    OpenLevel = 4,
}

impl Setting {
    pub const ALL: [Setting; 5] = [
        Setting::GatePoll,
        Setting::OpenPulseDuration,
        Setting::OpenDuration,
        Setting::LockDuration,
        Setting::OpenLevel,
    ];

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }

    pub const fn default_value(self) -> u32 {
        match self {
            Setting::GatePoll => 20,
            Setting::OpenPulseDuration => 500,
            Setting::OpenDuration => 1_500,
            Setting::LockDuration => 3_600_000,
            Setting::OpenLevel => 0,
        }
    }

    /// Inclusive range of accepted values.
    pub const fn range(self) -> (u32, u32) {
        match self {
            Setting::GatePoll => (5, 250),
            Setting::OpenPulseDuration => (50, 10_000),
            Setting::OpenDuration => (100, 600_000),
            Setting::LockDuration => (60_000, 86_400_000),
            Setting::OpenLevel => (0, 1),
        }
    }

    pub fn accepts(self, value: u32) -> bool {
        let (min, max) = self.range();
        (min..=max).contains(&value)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SettingError {
    #[error("{setting:?} value {value} is out of range")]
    OutOfRange { setting: Setting, value: u32 },
    #[error("storage: {0}")]
    Storage(#[from] StoreError),
}

/// Live gate settings shared between the cores.
pub struct Settings {
    gate_poll_ms: AtomicU32,
    open_pulse_ms: AtomicU32,
    open_ms: AtomicU32,
    lock_ms: AtomicU32,
    open_level: AtomicBool,
}

impl Settings {
    pub const fn new() -> Self {
        Self {
            gate_poll_ms: AtomicU32::new(Setting::GatePoll.default_value()),
            open_pulse_ms: AtomicU32::new(Setting::OpenPulseDuration.default_value()),
            open_ms: AtomicU32::new(Setting::OpenDuration.default_value()),
            lock_ms: AtomicU32::new(Setting::LockDuration.default_value()),
            open_level: AtomicBool::new(Setting::OpenLevel.default_value() != 0),
        }
    }

    pub fn get(&self, setting: Setting) -> u32 {
        match setting {
            Setting::GatePoll => self.gate_poll_ms.load(Ordering::Relaxed),
            Setting::OpenPulseDuration => self.open_pulse_ms.load(Ordering::Relaxed),
            Setting::OpenDuration => self.open_ms.load(Ordering::Relaxed),
            Setting::LockDuration => self.lock_ms.load(Ordering::Relaxed),
            Setting::OpenLevel => self.open_level.load(Ordering::Relaxed) as u32,
        }
    }

    pub fn gate_poll_ms(&self) -> u32 {
        self.get(Setting::GatePoll)
    }

    pub fn open_ms(&self) -> u32 {
        self.get(Setting::OpenDuration)
    }

    pub fn lock_ms(&self) -> u32 {
        self.get(Setting::LockDuration)
    }

    pub fn open_level(&self) -> bool {
        self.open_level.load(Ordering::Relaxed)
    }

    /// Snapshot of the values the gate state machine needs for one cycle.
    pub fn timing(&self) -> GateTiming {
        GateTiming {
            pulse_ms: self.get(Setting::OpenPulseDuration),
            open_level: self.open_level(),
        }
    }

    /// Validate, persist, then publish a new value.
    pub fn set<S: Store + ?Sized>(
        &self,
        store: &mut S,
        setting: Setting,
        value: u32,
    ) -> Result<(), SettingError> {
        let value = match setting {
            Setting::OpenLevel => (value > 0) as u32,
            _ => value,
        };
        if !setting.accepts(value) {
            return Err(SettingError::OutOfRange { setting, value });
        }
        store.store_setting(setting, value)?;
        self.apply(setting, value);
        log::info!("config: {:?} set to {}", setting, value);
        Ok(())
    }

    /// Restore persisted values. Missing or out-of-range entries keep their
    /// defaults. Returns the number of values restored.
    pub fn load<S: Store + ?Sized>(&self, store: &mut S) -> usize {
        let mut restored = 0;
        for setting in Setting::ALL {
            match store.load_setting(setting) {
                Ok(Some(value)) if setting.accepts(value) => {
                    self.apply(setting, value);
                    restored += 1;
                }
                Ok(Some(value)) => {
                    log::warn!("config: ignoring stored {:?}={} (out of range)", setting, value);
                }
                Ok(None) => {}
                Err(e) => log::error!("config: failed to load {:?}: {}", setting, e),
            }
        }
        restored
    }

    fn apply(&self, setting: Setting, value: u32) {
        match setting {
            Setting::GatePoll => self.gate_poll_ms.store(value, Ordering::Relaxed),
            Setting::OpenPulseDuration => self.open_pulse_ms.store(value, Ordering::Relaxed),
            Setting::OpenDuration => self.open_ms.store(value, Ordering::Relaxed),
            Setting::LockDuration => self.lock_ms.store(value, Ordering::Relaxed),
            Setting::OpenLevel => self.open_level.store(value != 0, Ordering::Relaxed),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new()
    }
}
