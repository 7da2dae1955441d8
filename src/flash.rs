//! Internal flash with the cross-core write handshake.
//!
//! Writes and erases stall the flash cache on both cores, so every mutating
//! call first parks core 0 through [`FLASH`] and pauses the watchdog around
//! the operation. Reads go straight through.

use embedded_storage::nor_flash::{
    ErrorType, NorFlash as BlockingNorFlash, NorFlashError, NorFlashErrorKind,
    ReadNorFlash as BlockingReadNorFlash,
};
use esp_storage::FlashStorage;

use crate::shared::{HalClock, FLASH};
use crate::{disable_watchdog, enable_watchdog, feed_watchdog};

/// How long core 1 waits for core 0 to park before giving up on a write.
const SAFE_TIMEOUT_MS: u32 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    /// Core 0 did not park in time, or another operation is in flight.
    Busy,
    Driver(NorFlashErrorKind),
}

impl NorFlashError for FlashError {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            FlashError::Busy => NorFlashErrorKind::Other,
            FlashError::Driver(kind) => *kind,
        }
    }
}

pub struct SharedFlash {
    inner: FlashStorage,
}

impl SharedFlash {
    pub fn new() -> Self {
        Self {
            inner: FlashStorage::new(),
        }
    }

    fn exclusive<T, E: NorFlashError>(
        &mut self,
        op: impl FnOnce(&mut FlashStorage) -> Result<T, E>,
    ) -> Result<T, FlashError> {
        if !FLASH.request() {
            log::warn!("flash: operation already in progress");
            return Err(FlashError::Busy);
        }
        if !FLASH.wait_for_safe(&HalClock, SAFE_TIMEOUT_MS) {
            return Err(FlashError::Busy);
        }

        feed_watchdog();
        disable_watchdog();
        let result = op(&mut self.inner);
        enable_watchdog();
        feed_watchdog();

        FLASH.signal_done();
        result.map_err(|e| FlashError::Driver(e.kind()))
    }
}

impl ErrorType for SharedFlash {
    type Error = FlashError;
}

impl embedded_storage_async::nor_flash::ReadNorFlash for SharedFlash {
    const READ_SIZE: usize = <FlashStorage as BlockingReadNorFlash>::READ_SIZE;

    async fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.inner
            .read(offset, bytes)
            .map_err(|e| FlashError::Driver(e.kind()))
    }

    fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}

impl embedded_storage_async::nor_flash::NorFlash for SharedFlash {
    const WRITE_SIZE: usize = <FlashStorage as BlockingNorFlash>::WRITE_SIZE;
    const ERASE_SIZE: usize = <FlashStorage as BlockingNorFlash>::ERASE_SIZE;

    async fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        self.exclusive(|flash| flash.erase(from, to))
    }

    async fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        self.exclusive(|flash| flash.write(offset, bytes))
    }
}

impl embedded_storage_async::nor_flash::MultiwriteNorFlash for SharedFlash {}

