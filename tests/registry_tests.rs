//! Tests for the user/admin registry.

mod common;

use common::MemStore;
use gatekeeper::parser::ParsedUser;
use gatekeeper::registry::{
    is_valid_id, Listing, Registry, RegistryError, Table, UserRecord, ID_LIMIT, MAX_ADMINS,
    MAX_USERS,
};
use gatekeeper::storage::StoreError;
use heapless::String;

fn named(id: i64, username: &str) -> UserRecord {
    let mut record = UserRecord::new(id);
    record.username.push_str(username).unwrap();
    record
}

// ============================================================================
// Ids
// ============================================================================

#[test]
fn test_id_validity() {
    assert!(is_valid_id(1));
    assert!(is_valid_id(-1_001_234_567_890));
    assert!(is_valid_id(ID_LIMIT - 1));
    assert!(!is_valid_id(0));
    assert!(!is_valid_id(ID_LIMIT));
    assert!(!is_valid_id(-ID_LIMIT));
}

// ============================================================================
// add
// ============================================================================

#[test]
fn test_add_persists_then_applies() {
    let mut registry = Registry::new();
    let mut store = MemStore::new();

    let slot = registry.add(&mut store, Table::Users, 123).unwrap();
    assert_eq!(slot, 0);
    assert!(registry.contains(Table::Users, 123));
    assert!(registry.is_authorized(123));
    assert!(!registry.is_admin(123));
    assert_eq!(store.user(Table::Users, 0).map(|r| r.id), Some(123));
}

#[test]
fn test_add_uses_first_free_slot() {
    let mut registry = Registry::new();
    let mut store = MemStore::new();

    registry.add(&mut store, Table::Users, 1).unwrap();
    registry.add(&mut store, Table::Users, 2).unwrap();
    registry.add(&mut store, Table::Users, 3).unwrap();
    registry.drop(&mut store, Table::Users, 2).unwrap();

    assert_eq!(registry.add(&mut store, Table::Users, 4), Ok(1));
}

#[test]
fn test_add_rejects_bad_and_duplicate_ids() {
    let mut registry = Registry::new();
    let mut store = MemStore::new();

    assert_eq!(registry.add(&mut store, Table::Users, 0), Err(RegistryError::WrongId));
    assert_eq!(
        registry.add(&mut store, Table::Users, ID_LIMIT),
        Err(RegistryError::WrongId)
    );

    registry.add(&mut store, Table::Users, 7).unwrap();
    assert_eq!(
        registry.add(&mut store, Table::Users, 7),
        Err(RegistryError::AlreadyExists)
    );
    assert_eq!(registry.count(Table::Users), 1);
}

#[test]
fn test_tables_are_independent() {
    let mut registry = Registry::new();
    let mut store = MemStore::new();

    registry.add(&mut store, Table::Users, 7).unwrap();
    registry.add(&mut store, Table::Admins, 7).unwrap();

    assert!(registry.is_admin(7));
    assert_eq!(registry.count(Table::Users), 1);
    assert_eq!(registry.count(Table::Admins), 1);
}

#[test]
fn test_add_to_full_table() {
    let mut registry = Registry::new();
    let mut store = MemStore::new();

    for id in 1..=MAX_ADMINS as i64 {
        registry.add(&mut store, Table::Admins, id).unwrap();
    }
    assert_eq!(
        registry.add(&mut store, Table::Admins, 999),
        Err(RegistryError::NoSpace)
    );

    for id in 1..=MAX_USERS as i64 {
        registry.add(&mut store, Table::Users, id).unwrap();
    }
    assert_eq!(
        registry.add(&mut store, Table::Users, 999),
        Err(RegistryError::NoSpace)
    );
}

#[test]
fn test_failed_write_leaves_table_unchanged() {
    let mut registry = Registry::new();
    let mut store = MemStore::new();
    store.fail_writes = true;

    assert_eq!(
        registry.add(&mut store, Table::Users, 5),
        Err(RegistryError::Storage(StoreError::Flash))
    );
    assert!(!registry.contains(Table::Users, 5));
    assert_eq!(registry.count(Table::Users), 0);
}

// ============================================================================
// drop
// ============================================================================

#[test]
fn test_drop_user() {
    let mut registry = Registry::new();
    let mut store = MemStore::new();
    registry.add(&mut store, Table::Users, 5).unwrap();

    registry.drop(&mut store, Table::Users, 5).unwrap();
    assert!(!registry.contains(Table::Users, 5));
    assert!(store.user(Table::Users, 0).is_none());

    assert_eq!(
        registry.drop(&mut store, Table::Users, 5),
        Err(RegistryError::NotFound)
    );
}

#[test]
fn test_last_admin_cannot_be_dropped() {
    let mut registry = Registry::new();
    let mut store = MemStore::new();
    registry.add(&mut store, Table::Admins, 1).unwrap();

    assert_eq!(
        registry.drop(&mut store, Table::Admins, 1),
        Err(RegistryError::AdminFloor)
    );
    // The floor is checked before the lookup.
    assert_eq!(
        registry.drop(&mut store, Table::Admins, 42),
        Err(RegistryError::AdminFloor)
    );
    assert!(registry.is_admin(1));

    registry.add(&mut store, Table::Admins, 2).unwrap();
    registry.drop(&mut store, Table::Admins, 1).unwrap();
    assert!(!registry.is_admin(1));
    assert!(registry.is_admin(2));
}

#[test]
fn test_failed_erase_keeps_entry() {
    let mut registry = Registry::new();
    let mut store = MemStore::new();
    registry.add(&mut store, Table::Users, 5).unwrap();
    store.fail_writes = true;

    assert!(matches!(
        registry.drop(&mut store, Table::Users, 5),
        Err(RegistryError::Storage(_))
    ));
    assert!(registry.contains(Table::Users, 5));
}

// ============================================================================
// list
// ============================================================================

#[test]
fn test_list_empty() {
    let registry = Registry::new();
    let mut out: String<256> = String::new();
    assert_eq!(registry.list(Table::Users, &mut out), Listing::Empty);
    assert!(out.is_empty());
}

#[test]
fn test_list_lines() {
    let mut registry = Registry::new();
    let mut store = MemStore::new();
    registry.add(&mut store, Table::Users, 11).unwrap();
    registry.add(&mut store, Table::Users, 22).unwrap();

    let mut out: String<256> = String::new();
    assert_eq!(
        registry.list(Table::Users, &mut out),
        Listing::Entries { shown: 2, total: 2 }
    );
    assert_eq!(
        out.as_str(),
        "id: 11, username: , first name: , last name: \n\
         id: 22, username: , first name: , last name: \n"
    );
}

#[test]
fn test_list_truncates_whole_lines() {
    let mut registry = Registry::new();
    let mut store = MemStore::new();
    for id in 1..=5 {
        registry.add(&mut store, Table::Users, id).unwrap();
    }

    // Each line is 45 bytes; room for two.
    let mut out: String<100> = String::new();
    assert_eq!(
        registry.list(Table::Users, &mut out),
        Listing::Entries { shown: 2, total: 5 }
    );
    assert!(out.ends_with('\n'));
    assert_eq!(out.lines().count(), 2);
}

// ============================================================================
// load / seed
// ============================================================================

#[test]
fn test_load_restores_slots() {
    let mut store = MemStore::new();
    store.put_user(Table::Users, 3, named(30, "carol"));
    store.put_user(Table::Users, 7, named(70, "dave"));
    store.put_user(Table::Admins, 0, named(1, "root"));

    let mut registry = Registry::new();
    assert_eq!(registry.load(&mut store), 3);

    assert_eq!(registry.slots(Table::Users)[3].username.as_str(), "carol");
    assert_eq!(registry.slots(Table::Users)[7].id, 70);
    assert!(registry.is_admin(1));
}

#[test]
fn test_load_ignores_invalid_and_duplicate_records() {
    let mut store = MemStore::new();
    store.put_user(Table::Users, 0, named(30, "a"));
    store.put_user(Table::Users, 1, named(30, "dup"));
    store.put_user(Table::Users, 2, named(ID_LIMIT, "huge"));

    let mut registry = Registry::new();
    assert_eq!(registry.load(&mut store), 1);
    assert_eq!(registry.count(Table::Users), 1);
    assert_eq!(registry.slots(Table::Users)[0].username.as_str(), "a");
}

#[test]
fn test_seed_admins_only_when_empty() {
    let mut registry = Registry::new();
    let mut store = MemStore::new();

    assert_eq!(registry.seed_admins(&mut store, [10, 0, 20]), 2);
    assert!(registry.is_admin(10));
    assert!(registry.is_admin(20));

    assert_eq!(registry.seed_admins(&mut store, [30]), 0);
    assert!(!registry.is_admin(30));
}

// ============================================================================
// update_profile
// ============================================================================

#[test]
fn test_profile_refresh_stores_names() {
    let mut registry = Registry::new();
    let mut store = MemStore::new();
    registry.add(&mut store, Table::Users, 42).unwrap();
    registry.add(&mut store, Table::Admins, 42).unwrap();

    let user = ParsedUser {
        id: Some(b"42"),
        first_name: Some(b"Jos\\u00e9"),
        username: Some(b"jose"),
        ..Default::default()
    };
    assert_eq!(registry.update_profile(&mut store, &user), Ok(true));

    let stored = store.user(Table::Users, 0).unwrap();
    assert_eq!(stored.first_name.as_str(), "José");
    assert_eq!(stored.username.as_str(), "jose");
    assert_eq!(store.user(Table::Admins, 0).unwrap().username.as_str(), "jose");

    // Same names again: nothing to write.
    let writes = store.writes;
    assert_eq!(registry.update_profile(&mut store, &user), Ok(false));
    assert_eq!(store.writes, writes);
}

#[test]
fn test_profile_refresh_truncates_long_names() {
    let mut registry = Registry::new();
    let mut store = MemStore::new();
    registry.add(&mut store, Table::Users, 42).unwrap();

    let user = ParsedUser {
        id: Some(b"42"),
        last_name: Some(b"abcdefghijklmnopqrstuvwxyz0123456789"),
        ..Default::default()
    };
    registry.update_profile(&mut store, &user).unwrap();

    assert_eq!(
        registry.slots(Table::Users)[0].last_name.as_str(),
        "abcdefghijklmnopqrstuvwxyz01234"
    );
}

#[test]
fn test_profile_refresh_ignores_strangers() {
    let mut registry = Registry::new();
    let mut store = MemStore::new();

    let user = ParsedUser {
        id: Some(b"99"),
        first_name: Some(b"Eve"),
        ..Default::default()
    };
    assert_eq!(registry.update_profile(&mut store, &user), Ok(false));
    assert_eq!(store.writes, 0);
}
