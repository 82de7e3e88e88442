use modreg::core::config::{BackendKind, CONFIG_FILE_NAME, RegistryConfig};
use modreg::core::counters::CounterName;
use modreg::core::error::RegistryError;
use modreg::core::lock::{self, LockOptions};
use modreg::core::persist::{Mutation, Persistence};
use modreg::core::time;
use modreg::store::{FileStore, RegistryStore, SqliteStore};
use std::collections::BTreeMap;
use std::fs;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

fn fast_lock() -> LockOptions {
    LockOptions {
        timeout: Duration::from_millis(5_000),
        retry: Duration::from_millis(1),
    }
}

#[test]
fn lock_holder_metadata_is_readable_while_held() {
    let tmp = tempdir().expect("tempdir");
    let lease = lock::acquire(tmp.path(), "models", fast_lock()).expect("acquire");
    let holder = lock::read_holder(tmp.path(), "models")
        .expect("read holder")
        .expect("holder present");
    assert_eq!(holder.pid, std::process::id());
    assert_eq!(&holder, lease.holder());
    drop(lease);
    assert!(lock::read_holder(tmp.path(), "models").expect("read").is_none());
    assert!(!lock::lock_path(tmp.path(), "models").exists());
}

#[test]
fn locked_updates_from_many_threads_are_never_lost() {
    let tmp = tempdir().expect("tempdir");
    let threads = 8;
    let per_thread = 25;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let dir = tmp.path().to_path_buf();
            let barrier = barrier.clone();
            thread::spawn(move || {
                // separate handles stand in for separate processes
                let p = Persistence::new(&dir, fast_lock()).expect("persistence");
                barrier.wait();
                for _ in 0..per_thread {
                    p.update_json("tally", |doc: &mut BTreeMap<String, u64>| {
                        *doc.entry("n".into()).or_default() += 1;
                        Ok(Mutation::Write(()))
                    })
                    .expect("update");
                }
            })
        })
        .collect();
    for h in handles {
        h.join().expect("thread");
    }

    let p = Persistence::new(tmp.path(), fast_lock()).expect("persistence");
    let doc: BTreeMap<String, u64> = p.read_json("tally").expect("read").expect("doc");
    assert_eq!(doc["n"], (threads * per_thread) as u64);
}

fn assert_monotonic_under_contention(stores: Vec<Arc<dyn RegistryStore>>) {
    let threads = stores.len();
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = stores
        .into_iter()
        .enumerate()
        .map(|(i, store)| {
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let mut committed = Vec::new();
                // interleaved, partly descending sequences per thread
                for step in 0..20u64 {
                    let incoming = if step % 3 == 0 { step } else { step * threads as u64 + i as u64 };
                    match store.enforce_and_bump_max_seen_version("t1:m1", incoming) {
                        Ok(v) => {
                            assert!(v >= incoming, "committed {} below incoming {}", v, incoming);
                            committed.push(v);
                        }
                        Err(RegistryError::AntiRollbackViolation { incoming: inc, current, .. }) => {
                            assert!(inc < current);
                        }
                        Err(e) => panic!("unexpected error: {}", e),
                    }
                }
                committed
            })
        })
        .collect();

    for h in handles {
        let committed = h.join().expect("thread");
        assert!(committed.windows(2).all(|w| w[0] <= w[1]), "per-thread commits regressed");
    }
}

#[test]
fn file_backend_enforcement_is_linearizable_across_handles() {
    let tmp = tempdir().expect("tempdir");
    let stores: Vec<Arc<dyn RegistryStore>> = (0..6)
        .map(|_| {
            let p = Persistence::new(tmp.path(), fast_lock()).expect("persistence");
            Arc::new(FileStore::new(p, Duration::from_millis(10))) as Arc<dyn RegistryStore>
        })
        .collect();
    assert_monotonic_under_contention(stores);

    let check = FileStore::new(
        Persistence::new(tmp.path(), fast_lock()).expect("persistence"),
        Duration::from_millis(10),
    );
    let state = check.get_update_state("t1:m1").expect("state").expect("present");
    // the highest incoming any thread can send is step 19 on thread 5
    assert_eq!(state.max_seen_version, 19 * 6 + 5);
}

#[test]
fn sqlite_backend_enforcement_is_linearizable_across_handles() {
    let tmp = tempdir().expect("tempdir");
    let stores: Vec<Arc<dyn RegistryStore>> = (0..4)
        .map(|_| {
            Arc::new(SqliteStore::new(tmp.path(), Duration::from_secs(5)).expect("sqlite"))
                as Arc<dyn RegistryStore>
        })
        .collect();
    assert_monotonic_under_contention(stores);

    let check = SqliteStore::new(tmp.path(), Duration::from_secs(5)).expect("sqlite");
    let state = check.get_update_state("t1:m1").expect("state").expect("present");
    assert_eq!(state.max_seen_version, 19 * 4 + 3);
}

#[test]
fn lock_timeout_is_counted_and_surfaced() {
    let tmp = tempdir().expect("tempdir");
    let held = lock::acquire(tmp.path(), "update_states", fast_lock()).expect("acquire");
    let p = Persistence::new(
        tmp.path(),
        LockOptions {
            timeout: Duration::from_millis(30),
            retry: Duration::from_millis(5),
        },
    )
    .expect("persistence");
    let store = FileStore::new(p.clone(), Duration::from_millis(10));
    let err = store
        .enforce_and_bump_max_seen_version("t1:m1", 1)
        .expect_err("must time out");
    assert!(matches!(err, RegistryError::LockTimeout { .. }));
    drop(held);

    let counts = p.counters().counts_24h(time::now_ms());
    assert_eq!(counts[&CounterName::LockTimeout], 1);
    assert_eq!(store.enforce_and_bump_max_seen_version("t1:m1", 1).expect("after release"), 1);
}

#[test]
fn config_file_is_read_from_data_dir() {
    let tmp = tempdir().expect("tempdir");
    fs::write(
        tmp.path().join(CONFIG_FILE_NAME),
        "backend = \"sqlite\"\nlock_timeout_ms = 750\naudit_retain_days = 3\n",
    )
    .expect("write config");
    let config = RegistryConfig::load(tmp.path()).expect("load");
    assert_eq!(config.backend, BackendKind::Sqlite);
    assert_eq!(config.lock_timeout(), Duration::from_millis(750));
    assert_eq!(config.audit_retain_days, 3);
    assert_eq!(config.data_dir, tmp.path());
    assert_eq!(config.flush_debounce_ms, 50);
}

#[test]
fn malformed_config_is_rejected() {
    let tmp = tempdir().expect("tempdir");
    fs::write(tmp.path().join(CONFIG_FILE_NAME), "backend = 7").expect("write config");
    assert!(matches!(
        RegistryConfig::load(tmp.path()),
        Err(RegistryError::Config(_))
    ));
}
