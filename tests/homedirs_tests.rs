//! Integration tests for key slot management and disk space reclamation.

mod common;

use std::fs;

use common::{create_user, read_slot, set_timestamp, Fixture, PASSWORD};
use homevault::credentials::Credentials;
use homevault::crypto::UnwrapError;
use homevault::errors::{HomeVaultError, MountError};
use homevault::mount::MountEngine;

// ---------------------------------------------------------------------------
// Slot enumeration
// ---------------------------------------------------------------------------

#[test]
fn keysets_are_listed_in_numeric_order() {
    let fx = Fixture::new();
    let obf = create_user(&fx.homedirs, "alice", PASSWORD);
    let slot0 = fx.homedirs.keyset_path(&obf, 0);

    for index in [10, 2, 1] {
        fs::copy(&slot0, fx.homedirs.keyset_path(&obf, index)).unwrap();
    }
    let dir = fx.homedirs.user_directory(&obf);
    for junk in ["key.01", "key.abc", "key.100", "key.3.salt", "key.0.bak", "notes"] {
        fs::write(dir.join(junk), b"junk").unwrap();
    }

    assert_eq!(fx.homedirs.get_vault_keysets(&obf).unwrap(), vec![0, 1, 2, 10]);
}

#[test]
fn add_keyset_claims_lowest_free_index() {
    let fx = Fixture::new();
    let obf = create_user(&fx.homedirs, "alice", PASSWORD);
    let slot0 = fx.homedirs.keyset_path(&obf, 0);
    fs::copy(&slot0, fx.homedirs.keyset_path(&obf, 1)).unwrap();
    fs::copy(&slot0, fx.homedirs.keyset_path(&obf, 3)).unwrap();

    let creds = Credentials::new("alice", PASSWORD);
    let index = fx.homedirs.add_keyset(&creds, b"second secret", None).unwrap();

    assert_eq!(index, 2);
    assert!(fx
        .homedirs
        .are_credentials_valid(&Credentials::new("alice", b"second secret")));
}

#[test]
fn failed_add_keyset_releases_the_claimed_slot() {
    let fx = Fixture::new();
    let obf = create_user(&fx.homedirs, "alice", PASSWORD);

    fx.engine.fail_wraps(true);
    let result = fx
        .homedirs
        .add_keyset(&Credentials::new("alice", PASSWORD), b"second", Some("pin"));

    assert!(matches!(result, Err(HomeVaultError::WrapFailed(_))));
    assert!(!fx.homedirs.keyset_path(&obf, 1).exists());
    assert_eq!(fx.homedirs.get_vault_keysets(&obf).unwrap(), vec![0]);

    fx.engine.fail_wraps(false);
    let index = fx
        .homedirs
        .add_keyset(&Credentials::new("alice", PASSWORD), b"second", Some("pin"))
        .unwrap();
    assert_eq!(index, 1);
}

#[test]
fn add_keyset_requires_valid_credentials() {
    let fx = Fixture::new();
    create_user(&fx.homedirs, "alice", PASSWORD);

    let result = fx
        .homedirs
        .add_keyset(&Credentials::new("alice", b"wrong"), b"new", None);
    assert!(matches!(
        result,
        Err(HomeVaultError::AuthorizationFailed(MountError::KeyFailure))
    ));
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

#[test]
fn labels_default_to_legacy_names() {
    let fx = Fixture::new();
    let obf = create_user(&fx.homedirs, "alice", PASSWORD);
    let creds = Credentials::new("alice", PASSWORD);
    fx.homedirs.add_keyset(&creds, b"1234", Some("pin")).unwrap();

    assert_eq!(
        fx.homedirs.list_keyset_labels(&obf).unwrap(),
        vec!["legacy-0".to_string(), "pin".to_string()]
    );
}

#[test]
fn duplicate_label_is_rejected() {
    let fx = Fixture::new();
    create_user(&fx.homedirs, "alice", PASSWORD);
    let creds = Credentials::new("alice", PASSWORD);

    fx.homedirs.add_keyset(&creds, b"1234", Some("pin")).unwrap();
    let err = fx.homedirs.add_keyset(&creds, b"5678", Some("pin")).unwrap_err();
    assert!(matches!(err, HomeVaultError::KeysetLabelExists(ref l) if l == "pin"));
}

#[test]
fn key_label_restricts_which_slot_is_tried() {
    let fx = Fixture::new();
    create_user(&fx.homedirs, "alice", PASSWORD);
    let creds = Credentials::new("alice", PASSWORD);
    fx.homedirs.add_keyset(&creds, b"1234", Some("pin")).unwrap();

    let pin = Credentials::new("alice", b"1234").with_key_label("pin");
    assert_eq!(fx.homedirs.get_valid_keyset(&pin).unwrap().index, 1);

    let password_on_pin_slot = Credentials::new("alice", PASSWORD).with_key_label("pin");
    assert_eq!(
        fx.homedirs.get_valid_keyset(&password_on_pin_slot).unwrap_err(),
        MountError::KeyFailure
    );

    let unknown = Credentials::new("alice", PASSWORD).with_key_label("nope");
    assert_eq!(
        fx.homedirs.get_valid_keyset(&unknown).unwrap_err(),
        MountError::KeyFailure
    );
}

#[test]
fn remove_keyset_by_label() {
    let fx = Fixture::new();
    let obf = create_user(&fx.homedirs, "alice", PASSWORD);
    let creds = Credentials::new("alice", PASSWORD);
    fx.homedirs.add_keyset(&creds, b"1234", Some("pin")).unwrap();

    fx.homedirs.remove_keyset(&creds, "pin").unwrap();
    assert_eq!(fx.homedirs.get_vault_keysets(&obf).unwrap(), vec![0]);

    let err = fx.homedirs.remove_keyset(&creds, "pin").unwrap_err();
    assert!(matches!(err, HomeVaultError::KeysetLabelNotFound(_)));
}

#[test]
fn last_keyset_cannot_be_removed() {
    let fx = Fixture::new();
    let obf = create_user(&fx.homedirs, "alice", PASSWORD);
    let creds = Credentials::new("alice", PASSWORD);

    let err = fx.homedirs.remove_keyset(&creds, "legacy-0").unwrap_err();
    assert!(matches!(err, HomeVaultError::LastKeyset(_)));
    assert!(fx.homedirs.keyset_path(&obf, 0).exists());
}

#[test]
fn out_of_range_slot_is_not_found() {
    let fx = Fixture::new();
    let obf = create_user(&fx.homedirs, "alice", PASSWORD);

    assert!(matches!(
        fx.homedirs.force_remove_keyset(&obf, 100),
        Err(HomeVaultError::KeysetNotFound(_))
    ));
    assert_eq!(fx.homedirs.get_vault_keysets(&obf).unwrap(), vec![0]);
}

#[test]
fn failed_move_releases_the_destination() {
    let fx = Fixture::new();
    let obf = create_user(&fx.homedirs, "alice", PASSWORD);
    // A directory cannot be renamed over the claimed file.
    fs::create_dir(fx.homedirs.keyset_path(&obf, 5)).unwrap();

    assert!(fx.homedirs.move_keyset(&obf, 5, 6).is_err());
    assert!(!fx.homedirs.keyset_path(&obf, 6).exists());
}

#[test]
fn listing_unknown_user_fails() {
    let fx = Fixture::new();
    let obf = fx.obfuscate("nobody");
    assert!(matches!(
        fx.homedirs.list_keyset_labels(&obf),
        Err(HomeVaultError::Mount(MountError::UserDoesNotExist))
    ));
}

// ---------------------------------------------------------------------------
// Scan behaviour
// ---------------------------------------------------------------------------

#[test]
fn hardware_condition_stops_the_scan() {
    let fx = Fixture::new();
    create_user(&fx.homedirs, "alice", PASSWORD);
    let creds = Credentials::new("alice", PASSWORD);
    fx.homedirs.add_keyset(&creds, b"1234", None).unwrap();

    fx.engine.reset_calls();
    fx.engine
        .queue_unwrap_errors(&[UnwrapError::HardwareDefensiveLock]);

    assert_eq!(
        fx.homedirs.get_valid_keyset(&creds).unwrap_err(),
        MountError::HardwareDefensiveLock
    );
    assert_eq!(fx.engine.calls(), 1);
}

#[test]
fn wrong_secret_on_first_slot_moves_on() {
    let fx = Fixture::new();
    create_user(&fx.homedirs, "alice", PASSWORD);
    let creds = Credentials::new("alice", PASSWORD);
    fx.homedirs.add_keyset(&creds, b"1234", None).unwrap();

    let valid = fx
        .homedirs
        .get_valid_keyset(&Credentials::new("alice", b"1234"))
        .unwrap();
    assert_eq!(valid.index, 1);
}

#[test]
fn corrupt_slot_falls_back_to_backup() {
    let fx = Fixture::new();
    let obf = create_user(&fx.homedirs, "alice", PASSWORD);
    let path = fx.homedirs.keyset_path(&obf, 0);

    fs::copy(&path, homevault::vault::format::backup_path(&path)).unwrap();
    fs::write(&path, b"garbage").unwrap();

    assert!(fx
        .homedirs
        .are_credentials_valid(&Credentials::new("alice", PASSWORD)));
}

// ---------------------------------------------------------------------------
// Migration
// ---------------------------------------------------------------------------

#[test]
fn migrate_leaves_single_slot_at_original_index() {
    let fx = Fixture::new();
    let obf = create_user(&fx.homedirs, "alice", PASSWORD);
    fx.homedirs
        .add_keyset(&Credentials::new("alice", PASSWORD), b"second", Some("second"))
        .unwrap();

    let mut engine = MountEngine::new(fx.homedirs.clone());
    fx.homedirs
        .migrate(&mut engine, &Credentials::new("alice", b"fresh"), b"second")
        .unwrap();

    assert!(!engine.is_mounted());
    assert_eq!(fx.homedirs.get_vault_keysets(&obf).unwrap(), vec![1]);
    assert_eq!(read_slot(&fx.homedirs, &obf, 1).label.as_deref(), Some("second"));

    assert!(fx
        .homedirs
        .are_credentials_valid(&Credentials::new("alice", b"fresh")));
    assert!(!fx
        .homedirs
        .are_credentials_valid(&Credentials::new("alice", b"second")));
    assert!(!fx
        .homedirs
        .are_credentials_valid(&Credentials::new("alice", PASSWORD)));
}

#[test]
fn migrate_with_wrong_old_passkey_changes_nothing() {
    let fx = Fixture::new();
    let obf = create_user(&fx.homedirs, "alice", PASSWORD);
    let before = fs::read(fx.homedirs.keyset_path(&obf, 0)).unwrap();

    let mut engine = MountEngine::new(fx.homedirs.clone());
    let err = fx
        .homedirs
        .migrate(&mut engine, &Credentials::new("alice", b"fresh"), b"wrong")
        .unwrap_err();

    assert!(matches!(
        err,
        HomeVaultError::AuthorizationFailed(MountError::KeyFailure)
    ));
    assert_eq!(fs::read(fx.homedirs.keyset_path(&obf, 0)).unwrap(), before);
}

#[test]
fn migrate_never_rebuilds_an_unreadable_vault() {
    let fx = Fixture::new();
    let obf = create_user(&fx.homedirs, "alice", PASSWORD);
    let marker = fx.homedirs.vault_path(&obf).join("user/precious");
    fs::create_dir_all(marker.parent().unwrap()).unwrap();
    fs::write(&marker, b"data").unwrap();
    let path = fx.homedirs.keyset_path(&obf, 0);
    fs::write(&path, b"torn").unwrap();

    let mut engine = MountEngine::new(fx.homedirs.clone());
    let err = fx
        .homedirs
        .migrate(&mut engine, &Credentials::new("alice", b"fresh"), b"anything-at-all")
        .unwrap_err();

    assert!(matches!(err, HomeVaultError::AuthorizationFailed(_)));
    assert!(marker.exists());
    assert_eq!(fs::read(&path).unwrap(), b"torn");
    assert!(!engine.is_mounted());
}

#[test]
fn migrate_of_unknown_user_fails() {
    let fx = Fixture::new();
    let mut engine = MountEngine::new(fx.homedirs.clone());

    let err = fx
        .homedirs
        .migrate(&mut engine, &Credentials::new("nobody", b"fresh"), PASSWORD)
        .unwrap_err();

    assert!(matches!(
        err,
        HomeVaultError::AuthorizationFailed(MountError::UserDoesNotExist)
    ));
    assert!(!fx.homedirs.exists(&fx.obfuscate("nobody")));
}

#[test]
fn migrate_while_mounted_keeps_the_session() {
    let fx = Fixture::new();
    let obf = create_user(&fx.homedirs, "alice", PASSWORD);

    let mut engine = MountEngine::new(fx.homedirs.clone());
    engine
        .mount_cryptohome(&Credentials::new("alice", PASSWORD), &Default::default())
        .unwrap();

    fx.homedirs
        .migrate(&mut engine, &Credentials::new("alice", b"fresh"), PASSWORD)
        .unwrap();

    assert!(engine.is_mounted_for(&obf));
    assert_eq!(engine.current_key_index(), Some(0));
    assert!(engine.check_key(&Credentials::new("alice", b"fresh")));
    assert!(!engine.check_key(&Credentials::new("alice", PASSWORD)));
}

// ---------------------------------------------------------------------------
// Disk space
// ---------------------------------------------------------------------------

/// Free space is plentiful once at most `keep` identities remain.
fn space_after_evictions(fx: &Fixture, keep: usize) {
    fx.platform.set_free_space(move |shadow| {
        let identities = fs::read_dir(shadow)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| e.path().is_dir())
                    .count()
            })
            .unwrap_or(0);
        if identities <= keep {
            u64::MAX
        } else {
            0
        }
    });
}

#[test]
fn enough_space_does_nothing() {
    let fx = Fixture::new();
    let obf = create_user(&fx.homedirs, "alice", PASSWORD);

    assert!(fx.homedirs.free_disk_space().unwrap());
    assert!(fx.homedirs.exists(&obf));
}

#[test]
fn caches_are_cleared_before_anyone_is_evicted() {
    let fx = Fixture::new();
    let obf = create_user(&fx.homedirs, "alice", PASSWORD);
    let user = fx.homedirs.vault_path(&obf).join("user");
    let cached = user.join("Cache").join("blob");
    let temp = user.join("GCache/v1/tmp").join("scratch");
    fs::write(&cached, b"x").unwrap();
    fs::write(&temp, b"y").unwrap();

    let probe = cached.clone();
    fx.platform
        .set_free_space(move |_| if probe.exists() { 0 } else { u64::MAX });

    assert!(fx.homedirs.free_disk_space().unwrap());
    assert!(!cached.exists());
    assert!(user.join("Cache").is_dir());
    assert!(temp.exists());
    assert!(fx.homedirs.exists(&obf));
}

#[test]
fn eviction_skips_the_owner_and_goes_oldest_first() {
    let fx = Fixture::new();
    let alice = create_user(&fx.homedirs, "alice", PASSWORD);
    let bob = create_user(&fx.homedirs, "bob", PASSWORD);
    let carol = create_user(&fx.homedirs, "carol", PASSWORD);
    set_timestamp(&fx.homedirs, &alice, 0, 100);
    set_timestamp(&fx.homedirs, &bob, 0, 200);
    set_timestamp(&fx.homedirs, &carol, 0, 300);
    fx.set_owner(Some("alice"));

    space_after_evictions(&fx, 2);

    assert!(fx.homedirs.free_disk_space().unwrap());
    assert!(fx.homedirs.exists(&alice));
    assert!(!fx.homedirs.exists(&bob));
    assert!(fx.homedirs.exists(&carol));
}

#[test]
fn eviction_skips_mounted_identities() {
    let fx = Fixture::new();
    let alice = create_user(&fx.homedirs, "alice", PASSWORD);
    let bob = create_user(&fx.homedirs, "bob", PASSWORD);
    set_timestamp(&fx.homedirs, &alice, 0, 100);
    set_timestamp(&fx.homedirs, &bob, 0, 200);
    fx.platform.mark_mounted(&fx.homedirs.mount_path(&alice));

    space_after_evictions(&fx, 0);

    assert!(!fx.homedirs.free_disk_space().unwrap());
    assert!(fx.homedirs.exists(&alice));
    assert!(!fx.homedirs.exists(&bob));
}

#[test]
fn enterprise_devices_may_evict_the_owner() {
    let fx = Fixture::new();
    let alice = create_user(&fx.homedirs, "alice", PASSWORD);
    fx.set_owner(Some("alice"));
    fx.set_enterprise_owned(true);

    space_after_evictions(&fx, 0);

    assert!(fx.homedirs.free_disk_space().unwrap());
    assert!(!fx.homedirs.exists(&alice));
}

#[test]
fn ephemeral_policy_removes_every_non_owner() {
    let fx = Fixture::new();
    let alice = create_user(&fx.homedirs, "alice", PASSWORD);
    let bob = create_user(&fx.homedirs, "bob", PASSWORD);
    let carol = create_user(&fx.homedirs, "carol", PASSWORD);
    fx.platform.mark_mounted(&fx.homedirs.mount_path(&carol));
    fx.set_owner(Some("alice"));
    fx.set_ephemeral_users(true);

    assert!(fx.homedirs.free_disk_space().unwrap());
    assert!(fx.homedirs.exists(&alice));
    assert!(!fx.homedirs.exists(&bob));
    assert!(fx.homedirs.exists(&carol));
}

#[test]
fn no_owner_on_consumer_device_keeps_everyone() {
    let fx = Fixture::new();
    let alice = create_user(&fx.homedirs, "alice", PASSWORD);
    fx.set_ephemeral_users(true);

    fx.homedirs.remove_non_owner_cryptohomes().unwrap();
    assert!(fx.homedirs.exists(&alice));
}
