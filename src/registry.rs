//! Resident and admin registry.
//!
//! Two fixed tables of [`UserRecord`] slots. A slot with `id == 0` is empty;
//! a non-zero id appears at most once per table. Every change is written
//! through the [`Store`] first and applied in memory only after the write
//! succeeds, so a failed write leaves the table exactly as it was.

use core::fmt::Write as _;

use heapless::String;

use crate::config::MIN_ADMINS;
use crate::parser::{unescape_into, ParsedUser};
use crate::storage::{Store, StoreError};

pub const MAX_USERS: usize = 100;
pub const MAX_ADMINS: usize = 10;

/// Longest stored name, in bytes.
pub const NAME_LEN: usize = 31;

/// Ids must fit in 52 bits (the precision chat ids are guaranteed to have).
pub const ID_LIMIT: i64 = 1 << 52;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Table {
    Users,
    Admins,
}

impl Table {
    pub const fn capacity(self) -> usize {
        match self {
            Table::Users => MAX_USERS,
            Table::Admins => MAX_ADMINS,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserRecord {
    pub id: i64,
    pub username: String<NAME_LEN>,
    pub first_name: String<NAME_LEN>,
    pub last_name: String<NAME_LEN>,
}

impl UserRecord {
    pub const EMPTY: UserRecord = UserRecord {
        id: 0,
        username: String::new(),
        first_name: String::new(),
        last_name: String::new(),
    };

    pub fn new(id: i64) -> Self {
        Self {
            id,
            ..Self::EMPTY
        }
    }

    pub fn is_empty(&self) -> bool {
        self.id == 0
    }
}

#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("wrong id")]
    WrongId,
    #[error("already exists")]
    AlreadyExists,
    #[error("no free slot")]
    NoSpace,
    #[error("not found")]
    NotFound,
    #[error("at least {} admin(s) must remain", MIN_ADMINS)]
    AdminFloor,
    #[error("storage: {0}")]
    Storage(#[from] StoreError),
}

/// Result of rendering a table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Listing {
    Empty,
    /// `shown` whole lines fit the output out of `total` entries.
    Entries { shown: usize, total: usize },
}

pub fn is_valid_id(id: i64) -> bool {
    id != 0 && id > -ID_LIMIT && id < ID_LIMIT
}

pub struct Registry {
    users: [UserRecord; MAX_USERS],
    admins: [UserRecord; MAX_ADMINS],
}

impl Registry {
    pub const fn new() -> Self {
        Self {
            users: [UserRecord::EMPTY; MAX_USERS],
            admins: [UserRecord::EMPTY; MAX_ADMINS],
        }
    }

    pub fn slots(&self, table: Table) -> &[UserRecord] {
        match table {
            Table::Users => &self.users,
            Table::Admins => &self.admins,
        }
    }

    fn slots_mut(&mut self, table: Table) -> &mut [UserRecord] {
        match table {
            Table::Users => &mut self.users,
            Table::Admins => &mut self.admins,
        }
    }

    fn find(&self, table: Table, id: i64) -> Option<usize> {
        if id == 0 {
            return None;
        }
        self.slots(table).iter().position(|r| r.id == id)
    }

    pub fn contains(&self, table: Table, id: i64) -> bool {
        self.find(table, id).is_some()
    }

    pub fn count(&self, table: Table) -> usize {
        self.slots(table).iter().filter(|r| !r.is_empty()).count()
    }

    pub fn is_admin(&self, id: i64) -> bool {
        self.contains(Table::Admins, id)
    }

    /// Users and admins may operate the gates.
    pub fn is_authorized(&self, id: i64) -> bool {
        self.contains(Table::Users, id) || self.is_admin(id)
    }

    /// Add `id` to `table`, returning the slot it landed in.
    pub fn add<S: Store + ?Sized>(
        &mut self,
        store: &mut S,
        table: Table,
        id: i64,
    ) -> Result<usize, RegistryError> {
        if !is_valid_id(id) {
            return Err(RegistryError::WrongId);
        }

        let mut free = None;
        for (slot, record) in self.slots(table).iter().enumerate() {
            if record.id == id {
                return Err(RegistryError::AlreadyExists);
            }
            if free.is_none() && record.is_empty() {
                free = Some(slot);
            }
        }
        let slot = free.ok_or(RegistryError::NoSpace)?;

        let record = UserRecord::new(id);
        store.store_user(table, slot, &record)?;
        self.slots_mut(table)[slot] = record;
        log::info!("registry: added {} to {:?} slot {}", id, table, slot);
        Ok(slot)
    }

    /// Remove `id` from `table`. Admins are never dropped below [`MIN_ADMINS`].
    pub fn drop<S: Store + ?Sized>(
        &mut self,
        store: &mut S,
        table: Table,
        id: i64,
    ) -> Result<(), RegistryError> {
        if table == Table::Admins && self.count(Table::Admins) <= MIN_ADMINS {
            return Err(RegistryError::AdminFloor);
        }
        let slot = self.find(table, id).ok_or(RegistryError::NotFound)?;

        store.erase_user(table, slot)?;
        self.slots_mut(table)[slot] = UserRecord::EMPTY;
        log::info!("registry: dropped {} from {:?} slot {}", id, table, slot);
        Ok(())
    }

    /// Render one line per entry into `out`. Lines that would not fit are
    /// left out whole.
    pub fn list<const N: usize>(&self, table: Table, out: &mut String<N>) -> Listing {
        let mut shown = 0;
        let mut total = 0;
        for record in self.slots(table).iter().filter(|r| !r.is_empty()) {
            total += 1;
            let mut line: String<160> = String::new();
            let rendered = write!(
                line,
                "id: {}, username: {}, first name: {}, last name: {}\n",
                record.id, record.username, record.first_name, record.last_name
            );
            if rendered.is_ok() && out.len() + line.len() <= N && out.push_str(&line).is_ok() {
                shown += 1;
            }
        }
        if total == 0 {
            Listing::Empty
        } else {
            Listing::Entries { shown, total }
        }
    }

    /// Fill the tables from `store`. Missing slots stay empty; unreadable or
    /// duplicate records are logged and ignored. Returns the number loaded.
    pub fn load<S: Store + ?Sized>(&mut self, store: &mut S) -> usize {
        let mut loaded = 0;
        for table in [Table::Users, Table::Admins] {
            for slot in 0..table.capacity() {
                let record = match store.load_user(table, slot) {
                    Ok(Some(record)) => record,
                    Ok(None) => continue,
                    Err(e) => {
                        log::error!("registry: {:?} slot {} unreadable: {}", table, slot, e);
                        continue;
                    }
                };
                if !is_valid_id(record.id) || self.contains(table, record.id) {
                    log::warn!("registry: ignoring {:?} slot {} (id {})", table, slot, record.id);
                    continue;
                }
                self.slots_mut(table)[slot] = record;
                loaded += 1;
            }
        }
        log::info!(
            "registry: loaded {} users, {} admins",
            self.count(Table::Users),
            self.count(Table::Admins)
        );
        loaded
    }

    /// Add `ids` as admins when no admin exists yet.
    pub fn seed_admins<S, I>(&mut self, store: &mut S, ids: I) -> usize
    where
        S: Store + ?Sized,
        I: IntoIterator<Item = i64>,
    {
        if self.count(Table::Admins) > 0 {
            return 0;
        }
        let mut seeded = 0;
        for id in ids {
            match self.add(store, Table::Admins, id) {
                Ok(_) => seeded += 1,
                Err(e) => log::warn!("registry: cannot seed admin {}: {}", id, e),
            }
        }
        seeded
    }

    /// Refresh stored names of `user` from a message it sent. Returns whether
    /// anything changed.
    pub fn update_profile<S: Store + ?Sized>(
        &mut self,
        store: &mut S,
        user: &ParsedUser<'_>,
    ) -> Result<bool, RegistryError> {
        let Some(id) = user.id_value() else {
            return Ok(false);
        };

        let mut fresh = UserRecord::new(id);
        if let Some(span) = user.username {
            unescape_into(span, &mut fresh.username);
        }
        if let Some(span) = user.first_name {
            unescape_into(span, &mut fresh.first_name);
        }
        if let Some(span) = user.last_name {
            unescape_into(span, &mut fresh.last_name);
        }

        let mut changed = false;
        for table in [Table::Users, Table::Admins] {
            let Some(slot) = self.find(table, id) else {
                continue;
            };
            if self.slots(table)[slot] == fresh {
                continue;
            }
            store.store_user(table, slot, &fresh)?;
            self.slots_mut(table)[slot] = fresh.clone();
            changed = true;
        }
        Ok(changed)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
