//! Persistent key-value storage for registry slots and gate settings.
//!
//! Records live in a `sequential-storage` map on a NOR flash range. Each
//! registry slot and each setting has its own key, so changing one entry
//! rewrites only that entry:
//!
//!   key   = [tag, index]    tag 0 = users, 1 = admins, 2 = settings
//!   value = registry record (see [`UserRecord`]) or a little-endian `u32`
//!
//! The flash driver is async (`embedded-storage-async`), but the firmware's
//! driver finishes every operation before returning, so each call here
//! completes on the first poll and `block_on` never spins.

use core::ops::Range;

use embassy_futures::block_on;
use embedded_storage_async::nor_flash::MultiwriteNorFlash;
use heapless::String;
use sequential_storage::cache::NoCache;
use sequential_storage::map::{self, Key, SerializationError, Value};

use crate::config::Setting;
use crate::registry::{Table, UserRecord, NAME_LEN};

/// Largest serialized [`UserRecord`]: id plus three length-prefixed names.
pub const RECORD_MAX_LEN: usize = 8 + 3 * (1 + NAME_LEN);

/// Scratch buffer size handed to `sequential-storage` (key + value + header).
const DATA_BUFFER_LEN: usize = 128;
const _: () = assert!(RECORD_MAX_LEN + 2 <= DATA_BUFFER_LEN);

#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("flash is full")]
    Full,
    #[error("stored data is corrupted")]
    Corrupted,
    #[error("record does not fit the storage buffer")]
    Serialization,
    #[error("flash driver error")]
    Flash,
}

/// Persistence primitives used by the registry and settings.
///
/// `load_*` returns `Ok(None)` when nothing was ever stored under the key.
pub trait Store {
    fn load_user(&mut self, table: Table, index: usize) -> Result<Option<UserRecord>, StoreError>;
    fn store_user(&mut self, table: Table, index: usize, record: &UserRecord)
        -> Result<(), StoreError>;
    fn erase_user(&mut self, table: Table, index: usize) -> Result<(), StoreError>;
    fn load_setting(&mut self, setting: Setting) -> Result<Option<u32>, StoreError>;
    fn store_setting(&mut self, setting: Setting, value: u32) -> Result<(), StoreError>;
}

/// Storage map key.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StorageKey {
    User { table: Table, index: u8 },
    Setting(Setting),
}

const TAG_USERS: u8 = 0;
const TAG_ADMINS: u8 = 1;
const TAG_SETTING: u8 = 2;

impl StorageKey {
    pub fn user(table: Table, index: usize) -> Self {
        StorageKey::User {
            table,
            index: index as u8,
        }
    }
}

impl Key for StorageKey {
    fn serialize_into(&self, buffer: &mut [u8]) -> Result<usize, SerializationError> {
        let bytes = match *self {
            StorageKey::User {
                table: Table::Users,
                index,
            } => [TAG_USERS, index],
            StorageKey::User {
                table: Table::Admins,
                index,
            } => [TAG_ADMINS, index],
            StorageKey::Setting(setting) => [TAG_SETTING, setting as u8],
        };
        buffer
            .get_mut(..2)
            .ok_or(SerializationError::BufferTooSmall)?
            .copy_from_slice(&bytes);
        Ok(2)
    }

    fn deserialize_from(buffer: &[u8]) -> Result<(Self, usize), SerializationError> {
        let (tag, index) = match buffer {
            [tag, index, ..] => (*tag, *index),
            _ => return Err(SerializationError::BufferTooSmall),
        };
        let key = match tag {
            TAG_USERS if (index as usize) < Table::Users.capacity() => StorageKey::User {
                table: Table::Users,
                index,
            },
            TAG_ADMINS if (index as usize) < Table::Admins.capacity() => StorageKey::User {
                table: Table::Admins,
                index,
            },
            TAG_SETTING => StorageKey::Setting(
                Setting::from_tag(index).ok_or(SerializationError::InvalidFormat)?,
            ),
            _ => return Err(SerializationError::InvalidFormat),
        };
        Ok((key, 2))
    }
}

impl<'a> Value<'a> for UserRecord {
    fn serialize_into(&self, buffer: &mut [u8]) -> Result<usize, SerializationError> {
        let mut len = 0;
        buffer
            .get_mut(..8)
            .ok_or(SerializationError::BufferTooSmall)?
            .copy_from_slice(&self.id.to_le_bytes());
        len += 8;
        for name in [&self.username, &self.first_name, &self.last_name] {
            let bytes = name.as_bytes();
            let slot = buffer
                .get_mut(len..len + 1 + bytes.len())
                .ok_or(SerializationError::BufferTooSmall)?;
            slot[0] = bytes.len() as u8;
            slot[1..].copy_from_slice(bytes);
            len += 1 + bytes.len();
        }
        Ok(len)
    }

    fn deserialize_from(buffer: &'a [u8]) -> Result<Self, SerializationError> {
        let id = i64::from_le_bytes(
            buffer
                .get(..8)
                .and_then(|b| b.try_into().ok())
                .ok_or(SerializationError::BufferTooSmall)?,
        );
        let mut offset = 8;
        let mut names: [String<NAME_LEN>; 3] = Default::default();
        for name in names.iter_mut() {
            let len = *buffer.get(offset).ok_or(SerializationError::BufferTooSmall)? as usize;
            if len > NAME_LEN {
                return Err(SerializationError::InvalidFormat);
            }
            let bytes = buffer
                .get(offset + 1..offset + 1 + len)
                .ok_or(SerializationError::BufferTooSmall)?;
            let text = core::str::from_utf8(bytes).map_err(|_| SerializationError::InvalidFormat)?;
            name.push_str(text).map_err(|_| SerializationError::InvalidFormat)?;
            offset += 1 + len;
        }
        let [username, first_name, last_name] = names;
        Ok(UserRecord {
            id,
            username,
            first_name,
            last_name,
        })
    }
}

/// [`Store`] backed by a `sequential-storage` map on NOR flash.
pub struct FlashStore<F> {
    flash: F,
    range: Range<u32>,
    buf: [u8; DATA_BUFFER_LEN],
}

impl<F: MultiwriteNorFlash> FlashStore<F> {
    pub fn new(flash: F, range: Range<u32>) -> Self {
        Self {
            flash,
            range,
            buf: [0; DATA_BUFFER_LEN],
        }
    }

    pub fn into_inner(self) -> F {
        self.flash
    }

    fn fetch<V>(&mut self, key: &StorageKey) -> Result<Option<V>, StoreError>
    where
        V: for<'d> Value<'d>,
    {
        block_on(map::fetch_item(
            &mut self.flash,
            self.range.clone(),
            &mut NoCache::new(),
            &mut self.buf,
            key,
        ))
        .map_err(|e| classify(key, e))
    }

    fn store<V>(&mut self, key: &StorageKey, value: &V) -> Result<(), StoreError>
    where
        V: for<'d> Value<'d>,
    {
        block_on(map::store_item(
            &mut self.flash,
            self.range.clone(),
            &mut NoCache::new(),
            &mut self.buf,
            key,
            value,
        ))
        .map_err(|e| classify(key, e))
    }

    fn remove(&mut self, key: &StorageKey) -> Result<(), StoreError> {
        block_on(map::remove_item(
            &mut self.flash,
            self.range.clone(),
            &mut NoCache::new(),
            &mut self.buf,
            key,
        ))
        .map_err(|e| classify(key, e))
    }
}

fn classify<E: core::fmt::Debug>(key: &StorageKey, e: sequential_storage::Error<E>) -> StoreError {
    log::error!("storage: {:?} failed: {:?}", key, e);
    match e {
        sequential_storage::Error::FullStorage => StoreError::Full,
        sequential_storage::Error::Corrupted { .. } => StoreError::Corrupted,
        sequential_storage::Error::Storage { .. } => StoreError::Flash,
        _ => StoreError::Serialization,
    }
}

impl<F: MultiwriteNorFlash> Store for FlashStore<F> {
    fn load_user(&mut self, table: Table, index: usize) -> Result<Option<UserRecord>, StoreError> {
        self.fetch(&StorageKey::user(table, index))
    }

    fn store_user(
        &mut self,
        table: Table,
        index: usize,
        record: &UserRecord,
    ) -> Result<(), StoreError> {
        self.store(&StorageKey::user(table, index), record)
    }

    fn erase_user(&mut self, table: Table, index: usize) -> Result<(), StoreError> {
        self.remove(&StorageKey::user(table, index))
    }

    fn load_setting(&mut self, setting: Setting) -> Result<Option<u32>, StoreError> {
        self.fetch(&StorageKey::Setting(setting))
    }

    fn store_setting(&mut self, setting: Setting, value: u32) -> Result<(), StoreError> {
        self.store(&StorageKey::Setting(setting), &value)
    }
}
