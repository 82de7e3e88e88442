use modreg::core::audit::{AuditResult, AuditTrail};
use modreg::core::canonical::Operation;
use modreg::core::counters::CounterName;
use modreg::core::error::{ReasonCode, RegistryError};
use modreg::core::gateway::{ApplyBody, DeliveryTarget, sign_request};
use modreg::core::keys::{KeyRing, KeyState};
use modreg::core::lock::{self, LockHolder, LockOptions};
use modreg::core::persist::{self, Persistence};
use modreg::core::signing;
use modreg::core::time::{self, FixedClock};
use modreg::registry::{ApplyRequest, Registry};
use modreg::store::{FileStore, RegistryStore};
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

fn short_lock() -> LockOptions {
    LockOptions {
        timeout: Duration::from_millis(40),
        retry: Duration::from_millis(5),
    }
}

#[test]
fn readers_never_observe_a_partial_document() {
    let tmp = tempdir().expect("tempdir");
    let target = persist::document_path(tmp.path(), "models");
    persist::write_atomic(&target, b"{\"n\":0}").expect("seed");

    let stop = Arc::new(AtomicBool::new(false));
    let reader = {
        let target = target.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            let mut reads = 0u64;
            loop {
                let bytes = fs::read(&target).expect("read");
                let doc: serde_json::Value = serde_json::from_slice(&bytes).expect("whole document");
                assert!(doc["n"].is_u64());
                reads += 1;
                if stop.load(Ordering::Relaxed) {
                    return reads;
                }
            }
        })
    };

    for n in 1..200u64 {
        // large enough that a torn write would be visible
        let padding = "x".repeat(8 * 1024);
        let doc = serde_json::json!({ "n": n, "padding": padding });
        persist::write_atomic(&target, &serde_json::to_vec(&doc).expect("json")).expect("write");
    }
    stop.store(true, Ordering::Relaxed);
    assert!(reader.join().expect("reader") > 0);
}

#[test]
fn crashed_writer_temp_file_is_ignored() {
    let tmp = tempdir().expect("tempdir");
    let p = Persistence::new(tmp.path(), short_lock()).expect("persistence");
    let mut doc = BTreeMap::new();
    doc.insert("k".to_string(), 1u64);
    p.write_json("update_states", &doc).expect("write");

    // a writer died after writing half its temp file
    fs::write(
        tmp.path().join(".update_states.json.tmp-999-01HZZZZZZZZZZZZZZZZZZZZZZZ"),
        b"{\"k\":",
    )
    .expect("temp");

    let back: BTreeMap<String, u64> = p.read_json("update_states").expect("read").expect("doc");
    assert_eq!(back["k"], 1);
    doc.insert("k".to_string(), 2);
    p.write_json("update_states", &doc).expect("write again");
    let back: BTreeMap<String, u64> = p.read_json("update_states").expect("read").expect("doc");
    assert_eq!(back["k"], 2);
}

#[test]
fn truncated_entity_document_fails_closed() {
    let tmp = tempdir().expect("tempdir");
    let full = br#"{"m1":{"id":"m1","tenant_id":"t1","name":"n","status":"draft","created_at":1,"updated_at":1}}"#;
    fs::write(tmp.path().join("models.json"), &full[..full.len() / 2]).expect("truncated");

    let p = Persistence::new(tmp.path(), short_lock()).expect("persistence");
    let store = FileStore::new(p.clone(), Duration::from_millis(10));
    assert!(matches!(
        store.get_model("m1"),
        Err(RegistryError::PersistCorrupted { .. })
    ));
    assert!(matches!(
        store.list_models(),
        Err(RegistryError::PersistCorrupted { .. })
    ));
    // the corrupt bytes are left for inspection, not overwritten with an empty map
    assert_eq!(
        fs::read(tmp.path().join("models.json")).expect("read").len(),
        full.len() / 2
    );
    let counts = p.counters().counts_24h(time::now_ms());
    assert!(counts[&CounterName::PersistCorrupted] >= 1);
}

#[test]
fn stale_lock_from_dead_process_times_out_instead_of_being_stolen() {
    let tmp = tempdir().expect("tempdir");
    let stale = LockHolder {
        pid: 999_999,
        host: "gone".into(),
        acquired_at_ms: 1,
    };
    fs::write(
        lock::lock_path(tmp.path(), "models"),
        serde_json::to_vec(&stale).expect("json"),
    )
    .expect("stale lock");

    assert_eq!(
        lock::read_holder(tmp.path(), "models").expect("holder"),
        Some(stale)
    );
    let p = Persistence::new(tmp.path(), short_lock()).expect("persistence");
    let err = p
        .write_json("models", &BTreeMap::<String, u64>::new())
        .expect_err("must time out");
    assert!(matches!(err, RegistryError::LockTimeout { .. }));
    assert!(!tmp.path().join("models.json").exists());
}

#[test]
fn panic_inside_critical_section_releases_the_lock() {
    let tmp = tempdir().expect("tempdir");
    let p = Persistence::new(tmp.path(), short_lock()).expect("persistence");
    let p2 = p.clone();
    let result = thread::spawn(move || {
        let _: Result<(), RegistryError> = p2.with_lock("models", || panic!("simulated crash"));
    })
    .join();
    assert!(result.is_err());
    assert!(!lock::lock_path(tmp.path(), "models").exists());
    p.write_json("models", &BTreeMap::<String, u64>::new())
        .expect("lock is free again");
}

#[test]
fn corrupted_update_state_denies_apply_and_is_audited() {
    const NOW: u64 = 1_800_000_000_000;
    let tmp = tempdir().expect("tempdir");
    let p = Persistence::new(tmp.path(), short_lock()).expect("persistence");

    let keys = Arc::new(KeyRing::new());
    keys.rotate(NOW, 0).expect("server key");
    let signer = signing::generate_keypair();
    keys.register_public("signer", &signer.public_key, KeyState::Active, NOW)
        .expect("signer");

    let store = Arc::new(FileStore::new(p.clone(), Duration::from_millis(10)));
    let registry = Registry::new(
        store.clone(),
        keys,
        AuditTrail::new(p.clone(), 1_000_000, 14),
        Arc::new(FixedClock::new(NOW)),
    );

    let model = registry.create_model("t1", "m").expect("model");
    let version = registry.create_version("t1", &model.id, "1.0.0").expect("version");
    let register = modreg::core::gateway::RegisterBody {
        model_id: model.id.clone(),
        version_id: version.id.clone(),
        platform: "android".into(),
        runtime: "tflite".into(),
        sha256: "11".repeat(32),
        size_bytes: 1,
        storage_ref: "blob://x".into(),
    };
    let sig = sign_request(Operation::ArtifactRegister, "t1", NOW, &register, "signer", &signer.private_key)
        .expect("sign");
    let artifact = registry
        .register_artifact(&modreg::registry::RegisterArtifactRequest {
            tenant_id: "t1".into(),
            body: register,
            sig,
        })
        .expect("artifact");

    fs::write(p.document_path("update_states"), b"{ torn").expect("corrupt");

    let body = ApplyBody {
        model_id: model.id.clone(),
        version_id: version.id.clone(),
        artifact_id: artifact.id.clone(),
        sha256: "11".repeat(32),
        target: DeliveryTarget::default(),
        update_version: 1,
    };
    let sig = sign_request(Operation::DeliveryApply, "t1", NOW, &body, "signer", &signer.private_key)
        .expect("sign");
    let err = registry
        .apply_delivery(&ApplyRequest {
            tenant_id: "t1".into(),
            body,
            sig,
            expires_at: None,
        })
        .expect_err("corrupted state must not read as zero");
    assert_eq!(err.reason_code(), ReasonCode::PersistCorrupted);

    let events = registry.audit().read_day(&time::day_key(NOW)).expect("audit");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].result, AuditResult::Deny);
    assert_eq!(events[0].reason_code, Some(ReasonCode::PersistCorrupted));
    assert_eq!(
        fs::read(p.document_path("update_states")).expect("read"),
        b"{ torn"
    );
}
