mod fixtures;

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use fixtures::{id, pool, pool_with, write_data, RecordingListener};
use spool_rs::{
    EntryError, PoolConfig, PrimaryState, Repository, RepositoryError, SpaceMonitor,
    StorageMetadata,
};

#[test]
fn create_then_first_transition() {
    let fx = pool(1_000);
    let listener = Arc::new(RecordingListener::default());
    fx.repo.add_listener(listener.clone());

    let entry = fx.repo.create(id(1)).expect("create");
    assert_eq!(entry.state(), None);
    assert_eq!(listener.count("created"), 0);

    entry.set_receiving_from_client().expect("receiving");
    assert_eq!(entry.state(), Some(PrimaryState::ReceivingFromClient));
    assert_eq!(listener.count("created"), 1);

    let control = fs::read_to_string(fx.layout().control_path(&id(1))).expect("control");
    assert!(control.starts_with("receiving.client"));
}

#[test]
fn duplicate_create_rejected() {
    let fx = pool(1_000);
    fx.repo.create(id(2)).expect("create");
    assert!(matches!(
        fx.repo.create(id(2)),
        Err(RepositoryError::AlreadyExists { .. })
    ));
}

#[test]
fn stale_control_file_counts_as_existing() {
    let fx = pool(1_000);
    fs::write(fx.layout().control_path(&id(3)), "cached\n").expect("seed control");
    assert!(matches!(
        fx.repo.create(id(3)),
        Err(RepositoryError::AlreadyExists { .. })
    ));
}

#[test]
fn single_primary_state_is_enforced() {
    let fx = pool(1_000);
    let entry = fx.repo.create(id(4)).expect("create");
    entry.set_receiving_from_client().expect("receiving");
    assert!(matches!(
        entry.set_receiving_from_store(),
        Err(EntryError::IllegalTransition { .. })
    ));
}

#[test]
fn precious_space_tracks_transitions() {
    let fx = pool(1_000);
    let a = fx.repo.create(id(10)).expect("create");
    a.set_receiving_from_client().expect("receiving");
    write_data(&fx, &id(10), &[0u8; 100]);
    a.set_precious(false).expect("precious");
    assert_eq!(fx.repo.precious_space(), 100);

    let b = fx.repo.create(id(11)).expect("create");
    b.set_receiving_from_client().expect("receiving");
    write_data(&fx, &id(11), &[0u8; 200]);
    b.set_precious(false).expect("precious");
    assert_eq!(fx.repo.precious_space(), 300);

    // precious -> cached releases the precious share
    a.set_cached(false).expect("cached");
    assert_eq!(fx.repo.precious_space(), 200);

    // idempotent repetition must not double-count
    b.set_precious(false).expect("precious again");
    assert_eq!(fx.repo.precious_space(), 200);
}

#[test]
fn guarded_transitions_reject_without_force() {
    let fx = pool(1_000);
    let entry = fx.repo.create(id(12)).expect("create");
    assert!(matches!(
        entry.set_precious(false),
        Err(EntryError::IllegalTransition { .. })
    ));
    assert!(matches!(
        entry.set_cached(false),
        Err(EntryError::IllegalTransition { .. })
    ));
    // force overrides the guard
    entry.set_precious(true).expect("forced precious");
    assert_eq!(entry.state(), Some(PrimaryState::Precious));
}

#[test]
fn sticky_is_idempotent_with_single_event() {
    let fx = pool(1_000);
    let listener = Arc::new(RecordingListener::default());
    fx.repo.add_listener(listener.clone());

    let entry = fx.repo.create(id(13)).expect("create");
    entry.set_receiving_from_client().expect("receiving");
    entry.set_cached(true).expect("cached");

    entry.set_sticky(true).expect("sticky");

    // push the mtime back; a rewrite on the repeated call would reset it
    let control_path = fx.layout().control_path(&id(13));
    let then = std::time::SystemTime::now() - Duration::from_secs(300);
    fs::OpenOptions::new()
        .append(true)
        .open(&control_path)
        .expect("open control")
        .set_modified(then)
        .expect("set mtime");

    entry.set_sticky(true).expect("sticky repeat");
    assert_eq!(listener.count("sticky"), 1);
    let modified = fs::metadata(&control_path)
        .expect("stat control")
        .modified()
        .expect("mtime");
    assert!(
        modified < std::time::SystemTime::now() - Duration::from_secs(200),
        "control file was rewritten by the repeated call"
    );
    let control = fs::read_to_string(&control_path).expect("control");
    assert!(control.contains("sticky"));

    entry.set_sticky(false).expect("unsticky");
    assert_eq!(listener.count("sticky"), 2);
    let control = fs::read_to_string(fx.layout().control_path(&id(13))).expect("control");
    assert!(!control.contains("sticky"));
}

#[test]
fn remove_respects_locks_and_links() {
    let fx = pool(1_000);
    let listener = Arc::new(RecordingListener::default());
    fx.repo.add_listener(listener.clone());

    let entry = fx.repo.create(id(20)).expect("create");
    entry.set_receiving_from_client().expect("receiving");
    write_data(&fx, &id(20), &[0u8; 50]);
    entry.set_precious(false).expect("precious");
    assert_eq!(fx.monitor.used(), 50);

    entry.lock(true);
    assert_eq!(fx.repo.remove(&entry).expect("remove attempt"), false);
    entry.lock(false);

    entry.increment_link_count().expect("link");
    assert_eq!(fx.repo.remove(&entry).expect("remove"), true);
    assert!(entry.is_removed());
    assert!(!entry.is_destroyed());
    assert_eq!(listener.count("removed"), 1);

    // still reachable through the removed map while a link is open
    assert!(fx.repo.get(&id(20)).is_err());
    fx.repo
        .get_including_removed(&id(20))
        .expect("removed entry still addressable");
    assert!(fx.layout().data_path(&id(20)).exists());

    assert!(matches!(
        fx.repo.remove(&entry),
        Err(RepositoryError::AlreadyRemoved { .. })
    ));

    // last link gone: artifacts deleted, space and precious share freed
    entry.decrement_link_count().expect("unlink");
    assert!(entry.is_destroyed());
    assert_eq!(listener.count("destroyed"), 1);
    assert!(!fx.layout().data_path(&id(20)).exists());
    assert!(!fx.layout().control_path(&id(20)).exists());
    assert!(!fx.layout().metadata_path(&id(20)).exists());
    assert_eq!(fx.monitor.used(), 0);
    assert_eq!(fx.repo.precious_space(), 0);
    assert!(fx.repo.get_including_removed(&id(20)).is_err());
}

#[test]
fn remove_without_links_destroys_immediately() {
    let fx = pool(1_000);
    let listener = Arc::new(RecordingListener::default());
    fx.repo.add_listener(listener.clone());

    let entry = fx.repo.create(id(21)).expect("create");
    entry.set_receiving_from_client().expect("receiving");
    write_data(&fx, &id(21), &[0u8; 30]);
    entry.set_cached(true).expect("cached");

    assert_eq!(fx.repo.remove(&entry).expect("remove"), true);
    assert!(entry.is_destroyed());
    assert_eq!(listener.count("removed"), 1);
    assert_eq!(listener.count("destroyed"), 1);
    assert!(!fx.layout().data_path(&id(21)).exists());
    assert_eq!(fx.monitor.used(), 0);
}

#[test]
fn removed_entry_stays_addressable_while_links_open() {
    let fx = pool(1_000);
    let ids: Vec<_> = (0..50).map(|n| id(100 + n)).collect();
    for rid in &ids {
        let entry = fx.repo.create(rid.clone()).expect("create");
        entry.set_receiving_from_client().expect("receiving");
        entry.increment_link_count().expect("link");
    }

    std::thread::scope(|scope| {
        let repo = &fx.repo;
        let remover = scope.spawn(move || {
            for rid in &ids {
                let entry = repo.get(rid).expect("get");
                assert!(repo.remove(&entry).expect("remove"));
            }
        });
        // open links keep every entry alive, so each one must remain
        // reachable throughout its move between the maps
        while !remover.is_finished() {
            for n in 0..50 {
                repo.get_including_removed(&id(100 + n))
                    .expect("entry reachable during removal");
            }
        }
        remover.join().expect("join remover");
    });
}

#[test]
fn destroyed_entry_rejects_operations() {
    let fx = pool(1_000);
    let entry = fx.repo.create(id(22)).expect("create");
    entry.set_receiving_from_client().expect("receiving");
    fx.repo.remove(&entry).expect("remove");
    assert!(entry.is_destroyed());
    assert!(matches!(
        entry.set_sticky(true),
        Err(EntryError::Destroyed { .. })
    ));
    assert!(matches!(
        entry.increment_link_count(),
        Err(EntryError::Destroyed { .. })
    ));
}

#[test]
fn restored_replica_gets_grace_lock() {
    let fx = pool_with(1_000, |c| c.grace_lock_ms = 80);
    let listener = Arc::new(RecordingListener::default());
    fx.repo.add_listener(listener.clone());

    let entry = fx.repo.create(id(23)).expect("create");
    entry.set_receiving_from_store().expect("receiving");
    write_data(&fx, &id(23), &[0u8; 10]);
    entry.set_cached(false).expect("cached");

    // a restore becomes available before it is announced as cached
    let names: Vec<_> = listener.events().into_iter().map(|(e, _)| e).collect();
    assert_eq!(names, vec!["created", "available", "cached"]);
    assert!(entry.is_locked());
    assert_eq!(fx.repo.remove(&entry).expect("remove attempt"), false);

    std::thread::sleep(Duration::from_millis(120));
    assert!(!entry.is_locked());
    assert_eq!(fx.repo.remove(&entry).expect("remove"), true);
}

#[test]
fn timed_lock_only_extends() {
    let fx = pool(1_000);
    let entry = fx.repo.create(id(24)).expect("create");
    entry.lock_for(Duration::from_secs(60));
    // a shorter request must not cut the deadline
    entry.lock_for(Duration::from_millis(1));
    std::thread::sleep(Duration::from_millis(20));
    assert!(entry.is_locked());
}

#[test]
fn sending_to_store_requires_precious() {
    let fx = pool(1_000);
    let entry = fx.repo.create(id(25)).expect("create");
    entry.set_receiving_from_client().expect("receiving");
    assert!(entry.set_sending_to_store(true).is_err());

    entry.set_precious(false).expect("precious");
    entry.set_sending_to_store(true).expect("to_store");
    assert!(entry.is_sending_to_store());

    // commit to cached clears the transfer marker
    entry.set_cached(false).expect("cached");
    assert!(!entry.is_sending_to_store());
}

#[test]
fn reservation_counter_is_durable() {
    let fx = pool(1_000);
    fx.repo.reserve_space(100, None).expect("reserve");
    assert_eq!(fx.repo.reserved_space(), 100);
    assert_eq!(fx.monitor.used(), 100);
    let on_disk = fs::read_to_string(fx.layout().reserved_space_path()).expect("read");
    assert_eq!(on_disk.trim(), "100");

    fx.repo.free_reserved_space(60).expect("release");
    assert_eq!(fx.repo.reserved_space(), 40);
    assert_eq!(fx.monitor.used(), 40);

    // applying keeps the space in use, only the counter drops
    fx.repo.apply_reserved_space(40).expect("apply");
    assert_eq!(fx.repo.reserved_space(), 0);
    assert_eq!(fx.monitor.used(), 40);
    let on_disk = fs::read_to_string(fx.layout().reserved_space_path()).expect("read");
    assert_eq!(on_disk.trim(), "0");

    assert!(matches!(
        fx.repo.free_reserved_space(1),
        Err(RepositoryError::ReservationUnderflow { .. })
    ));
}

#[test]
fn reservation_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = PoolConfig::new(dir.path(), 1_000);

    let first = Repository::open(
        &config,
        Arc::new(spool_rs::FairQueueAllocation::new(0)),
    )
    .expect("open");
    first.reserve_space(70, None).expect("reserve");
    drop(first);

    let second = Repository::open(
        &config,
        Arc::new(spool_rs::FairQueueAllocation::new(0)),
    )
    .expect("reopen");
    assert_eq!(second.reserved_space(), 70);
}

#[test]
fn metadata_roundtrips_through_entry() {
    let fx = pool(1_000);
    let entry = fx.repo.create(id(26)).expect("create");
    entry.set_receiving_from_client().expect("receiving");

    assert_eq!(entry.storage_metadata().expect("read"), None);
    let meta = StorageMetadata {
        size: Some(64),
        hsm_stored: false,
        payload: serde_json::json!({"storage_class": "tape:default"}),
    };
    entry.set_storage_metadata(meta.clone()).expect("set");
    assert!(fx.layout().metadata_path(&id(26)).exists());
    assert_eq!(entry.storage_metadata().expect("read"), Some(meta));
}

#[test]
fn touch_creates_data_file() {
    let fx = pool(1_000);
    let entry = fx.repo.create(id(27)).expect("create");
    entry.set_receiving_from_client().expect("receiving");
    assert!(!fx.layout().data_path(&id(27)).exists());
    entry.touch().expect("touch");
    assert!(fx.layout().data_path(&id(27)).exists());
    assert_eq!(entry.size(), 0);
}

#[test]
fn committed_ids_listing() {
    let fx = pool(1_000);
    let a = fx.repo.create(id(30)).expect("create");
    a.set_receiving_from_client().expect("receiving");
    a.set_precious(false).expect("precious");

    let b = fx.repo.create(id(31)).expect("create");
    b.set_receiving_from_client().expect("receiving");

    let active = fx.repo.active_ids();
    assert_eq!(active, vec![id(30)]);
    let mut all = fx.repo.replica_ids();
    all.sort();
    assert_eq!(all, vec![id(30), id(31)]);
}
