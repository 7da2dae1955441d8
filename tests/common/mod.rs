//! Host-side fakes shared by the integration tests.

#![allow(dead_code)]

use std::cell::Cell;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::rc::Rc;

use embedded_storage_async::nor_flash::{
    ErrorType, MultiwriteNorFlash, NorFlash, NorFlashErrorKind, ReadNorFlash,
};
use gatekeeper::config::Setting;
use gatekeeper::dispatch::GateLink;
use gatekeeper::gate::{Clock, GateBusy, GateRequest};
use gatekeeper::registry::{Table, UserRecord};
use gatekeeper::storage::{Store, StoreError};
use gatekeeper::ticks::Tick;

// ============================================================================
// Store
// ============================================================================

fn table_tag(table: Table) -> u8 {
    match table {
        Table::Users => 0,
        Table::Admins => 1,
    }
}

/// In-memory [`Store`] that can be told to fail every write.
#[derive(Default)]
pub struct MemStore {
    pub users: BTreeMap<(u8, usize), UserRecord>,
    pub settings: BTreeMap<u8, u32>,
    pub fail_writes: bool,
    pub writes: usize,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(&self, table: Table, index: usize) -> Option<&UserRecord> {
        self.users.get(&(table_tag(table), index))
    }

    pub fn put_user(&mut self, table: Table, index: usize, record: UserRecord) {
        self.users.insert((table_tag(table), index), record);
    }

    pub fn setting(&self, setting: Setting) -> Option<u32> {
        self.settings.get(&(setting as u8)).copied()
    }

    fn check_write(&mut self) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::Flash);
        }
        self.writes += 1;
        Ok(())
    }
}

impl Store for MemStore {
    fn load_user(&mut self, table: Table, index: usize) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.user(table, index).cloned())
    }

    fn store_user(
        &mut self,
        table: Table,
        index: usize,
        record: &UserRecord,
    ) -> Result<(), StoreError> {
        self.check_write()?;
        self.put_user(table, index, record.clone());
        Ok(())
    }

    fn erase_user(&mut self, table: Table, index: usize) -> Result<(), StoreError> {
        self.check_write()?;
        self.users.remove(&(table_tag(table), index));
        Ok(())
    }

    fn load_setting(&mut self, setting: Setting) -> Result<Option<u32>, StoreError> {
        Ok(self.setting(setting))
    }

    fn store_setting(&mut self, setting: Setting, value: u32) -> Result<(), StoreError> {
        self.check_write()?;
        self.settings.insert(setting as u8, value);
        Ok(())
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Manual clock: `pause_ms` advances time instead of sleeping.
pub struct FakeClock {
    now: Cell<Tick>,
}

impl FakeClock {
    pub fn new(now: Tick) -> Self {
        Self { now: Cell::new(now) }
    }

    pub fn set(&self, now: Tick) {
        self.now.set(now);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Tick {
        self.now.get()
    }

    fn pause_ms(&self, ms: u32) {
        self.now.set(self.now.get().wrapping_add(ms));
    }
}

// ============================================================================
// Gate link
// ============================================================================

/// Records requests and answers status from a fixed value.
#[derive(Default)]
pub struct FakeGate {
    pub requests: Vec<GateRequest>,
    pub busy: bool,
    pub status: Option<i32>,
}

impl GateLink for FakeGate {
    fn request(&mut self, request: GateRequest) -> Result<(), GateBusy> {
        if self.busy {
            return Err(GateBusy);
        }
        self.requests.push(request);
        Ok(())
    }

    fn status(&mut self) -> Option<i32> {
        self.status
    }
}

// ============================================================================
// Output pin
// ============================================================================

/// Output pin whose level stays observable after the pin is moved.
#[derive(Clone, Default)]
pub struct FakePin {
    pub high: Rc<Cell<bool>>,
}

impl FakePin {
    pub fn is_high(&self) -> bool {
        self.high.get()
    }
}

impl embedded_hal::digital::ErrorType for FakePin {
    type Error = Infallible;
}

impl embedded_hal::digital::OutputPin for FakePin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.high.set(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.high.set(true);
        Ok(())
    }
}

// ============================================================================
// NOR flash
// ============================================================================

pub const PAGE_SIZE: usize = 4096;

/// RAM-backed NOR flash: erase sets bytes to 0xFF, writes can only clear bits.
pub struct RamFlash {
    pub data: Vec<u8>,
    pub writes: usize,
}

impl RamFlash {
    pub fn new(pages: usize) -> Self {
        Self {
            data: vec![0xFF; pages * PAGE_SIZE],
            writes: 0,
        }
    }

    fn check(&self, offset: u32, len: usize, align: usize) -> Result<(), NorFlashErrorKind> {
        let offset = offset as usize;
        if offset % align != 0 || len % align != 0 {
            return Err(NorFlashErrorKind::NotAligned);
        }
        if offset + len > self.data.len() {
            return Err(NorFlashErrorKind::OutOfBounds);
        }
        Ok(())
    }
}

impl ErrorType for RamFlash {
    type Error = NorFlashErrorKind;
}

impl ReadNorFlash for RamFlash {
    const READ_SIZE: usize = 1;

    async fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.check(offset, bytes.len(), Self::READ_SIZE)?;
        let start = offset as usize;
        bytes.copy_from_slice(&self.data[start..start + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl NorFlash for RamFlash {
    const WRITE_SIZE: usize = 4;
    const ERASE_SIZE: usize = PAGE_SIZE;

    async fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        self.check(from, (to - from) as usize, Self::ERASE_SIZE)?;
        self.data[from as usize..to as usize].fill(0xFF);
        Ok(())
    }

    async fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        self.check(offset, bytes.len(), Self::WRITE_SIZE)?;
        let start = offset as usize;
        for (cell, byte) in self.data[start..start + bytes.len()].iter_mut().zip(bytes) {
            *cell &= *byte;
        }
        self.writes += 1;
        Ok(())
    }
}

impl MultiwriteNorFlash for RamFlash {}
