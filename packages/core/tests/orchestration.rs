// ABOUTME: Orchestration integration tests over the scripted backend world
// ABOUTME: Lazy start, self-heal, rollback, concurrency, GC and capability routing

mod common;

use bay_core::CoreError;
use bay_storage::{SandboxStatus, SessionState};
use chrono::{Duration as ChronoDuration, Utc};
use common::Harness;

const OWNER: &str = "acme";

#[tokio::test]
async fn test_lazy_start_then_exec_then_delete() {
    let h = Harness::new().await;

    let sandbox = h
        .sandbox_mgr
        .create(OWNER, "python-default", None, None)
        .await
        .unwrap();

    // Creation allocates no compute.
    assert!(sandbox.current_session_id.is_none());
    assert_eq!(h.world.container_count(), 0);
    let view = h.sandbox_mgr.get_view(&sandbox.id, OWNER).await.unwrap();
    assert_eq!(view.status, SandboxStatus::Idle);

    // First exec converges to running and returns the result in one call.
    let outcome = h
        .router
        .exec_python(OWNER, &sandbox.id, "print(2*21)", None)
        .await
        .unwrap();
    assert!(outcome.success);
    assert!(outcome.output.contains("42"));
    assert_eq!(h.world.container_count(), 1);

    let view = h.sandbox_mgr.get_view(&sandbox.id, OWNER).await.unwrap();
    assert_eq!(view.status, SandboxStatus::Ready);

    h.sandbox_mgr.delete(&sandbox.id, OWNER).await.unwrap();
    assert_eq!(h.world.container_count(), 0);
    assert!(matches!(
        h.sandbox_mgr.get(&sandbox.id, OWNER).await,
        Err(CoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_volume_survives_stop_but_session_does_not() {
    let h = Harness::new().await;
    let sandbox = h
        .sandbox_mgr
        .create(OWNER, "python-default", None, None)
        .await
        .unwrap();

    h.router
        .write_file(OWNER, &sandbox.id, "a.txt", "hello")
        .await
        .unwrap();

    let first_session = h
        .sandbox_mgr
        .get(&sandbox.id, OWNER)
        .await
        .unwrap()
        .current_session_id
        .unwrap();
    let first_container = h.world.running_container_ids();

    h.sandbox_mgr.stop(&sandbox.id, OWNER).await.unwrap();
    assert_eq!(h.world.container_count(), 0);
    let view = h.sandbox_mgr.get_view(&sandbox.id, OWNER).await.unwrap();
    assert_eq!(view.status, SandboxStatus::Idle);

    // Next call builds a fresh session; the volume still has the file.
    let outcome = h
        .router
        .exec_shell(OWNER, &sandbox.id, "cat a.txt", None, None)
        .await
        .unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.output, "hello");

    let second_session = h
        .sandbox_mgr
        .get(&sandbox.id, OWNER)
        .await
        .unwrap()
        .current_session_id
        .unwrap();
    assert_ne!(first_session, second_session);
    assert_ne!(first_container, h.world.running_container_ids());
}

#[tokio::test]
async fn test_externally_killed_container_heals_on_next_request() {
    let h = Harness::new().await;
    let sandbox = h
        .sandbox_mgr
        .create(OWNER, "python-default", None, None)
        .await
        .unwrap();

    h.router
        .exec_python(OWNER, &sandbox.id, "x = 1", None)
        .await
        .unwrap();
    let original = h.world.running_container_ids();
    assert_eq!(original.len(), 1);

    // Kill behind Bay's back.
    h.world.kill_container(&original[0]);

    // The next call heals invisibly and succeeds.
    let outcome = h
        .router
        .exec_python(OWNER, &sandbox.id, "print(2*21)", None)
        .await
        .unwrap();
    assert!(outcome.success);

    let replaced = h.world.running_container_ids();
    assert_eq!(replaced.len(), 1);
    assert_ne!(original[0], replaced[0]);
}

#[tokio::test]
async fn test_multi_container_start_failure_rolls_back_everything() {
    let h = Harness::new().await;
    h.world.state.lock().unwrap().fail_start_marker = Some("browser".to_string());

    let sandbox = h
        .sandbox_mgr
        .create(OWNER, "python-browser", None, None)
        .await
        .unwrap();

    let err = h.sandbox_mgr.ensure_running(&sandbox.id, OWNER).await;
    assert!(err.is_err());

    // Full rollback: no containers, no session network.
    assert_eq!(h.world.container_count(), 0);
    assert_eq!(h.world.network_count(), 0);

    let failed_session = h
        .session_store()
        .list_for_sandbox(&sandbox.id)
        .await
        .unwrap()
        .pop()
        .unwrap();
    assert_eq!(failed_session.observed_state, SessionState::Failed);
    assert!(failed_session.failed_reason.is_some());

    // A later attempt builds a fresh session rather than resuming the failed one.
    h.world.state.lock().unwrap().fail_start_marker = None;
    let ready = h.sandbox_mgr.ensure_running(&sandbox.id, OWNER).await.unwrap();
    assert_ne!(ready.session.id, failed_session.id);
    assert_eq!(ready.session.observed_state, SessionState::Running);
    assert_eq!(h.world.container_count(), 2);
    assert_eq!(h.world.network_count(), 1);
}

#[tokio::test]
async fn test_concurrent_ensure_running_creates_one_container() {
    let h = Harness::new().await;
    let sandbox = h
        .sandbox_mgr
        .create(OWNER, "python-default", None, None)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let router = h.router.clone();
        let sandbox_id = sandbox.id.clone();
        handles.push(tokio::spawn(async move {
            router.exec_python(OWNER, &sandbox_id, "print(2*21)", None).await
        }));
    }
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert!(outcome.success);
    }

    // Exactly one container-creation sequence ran.
    assert_eq!(h.world.create_calls(), 1);
    assert_eq!(h.world.container_count(), 1);
}

#[tokio::test]
async fn test_capability_and_path_contract_checks() {
    let h = Harness::new().await;
    let sandbox = h
        .sandbox_mgr
        .create(OWNER, "python-default", None, None)
        .await
        .unwrap();

    // Undeclared capability fails before any compute starts.
    let err = h
        .router
        .exec_browser(OWNER, &sandbox.id, "open http://example.com", None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::CapabilityNotSupported(_)));
    assert_eq!(h.world.container_count(), 0);

    let err = h
        .router
        .read_file(OWNER, &sandbox.id, "/etc/passwd")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidPath(_)));

    let err = h
        .router
        .read_file(OWNER, &sandbox.id, "../outside")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidPath(_)));
}

#[tokio::test]
async fn test_fs_round_trips() {
    let h = Harness::new().await;
    let sandbox = h
        .sandbox_mgr
        .create(OWNER, "python-default", None, None)
        .await
        .unwrap();

    h.router
        .write_file(OWNER, &sandbox.id, "notes/data.txt", "payload")
        .await
        .unwrap();
    let content = h
        .router
        .read_file(OWNER, &sandbox.id, "notes/data.txt")
        .await
        .unwrap();
    assert_eq!(content, "payload");

    let bytes = vec![0u8, 159, 146, 150];
    h.router
        .upload_file(OWNER, &sandbox.id, "blob.bin", &bytes)
        .await
        .unwrap();
    let downloaded = h
        .router
        .download_file(OWNER, &sandbox.id, "blob.bin")
        .await
        .unwrap();
    assert_eq!(downloaded, bytes);

    let err = h
        .router
        .read_file(OWNER, &sandbox.id, "missing.txt")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::FileNotFound(_)));
}

#[tokio::test]
async fn test_ttl_boundaries() {
    let h = Harness::new().await;

    // ttl = 0 is rejected, not aliased to infinite.
    let err = h
        .sandbox_mgr
        .create(OWNER, "python-default", None, Some(0))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));

    // Infinite TTL cannot be extended.
    let infinite = h
        .sandbox_mgr
        .create(OWNER, "python-default", None, None)
        .await
        .unwrap();
    assert!(matches!(
        h.sandbox_mgr.extend_ttl(&infinite.id, OWNER, 60).await,
        Err(CoreError::SandboxTtlInfinite(_))
    ));

    // A live TTL extends from max(old, now).
    let bounded = h
        .sandbox_mgr
        .create(OWNER, "python-default", None, Some(3600))
        .await
        .unwrap();
    let old_expiry = bounded.expires_at.unwrap();
    let extended = h
        .sandbox_mgr
        .extend_ttl(&bounded.id, OWNER, 600)
        .await
        .unwrap();
    assert_eq!(extended.expires_at.unwrap(), old_expiry + ChronoDuration::seconds(600));

    // An expired sandbox cannot be extended or started.
    let store = h.sandbox_store();
    let mut row = store.get(&bounded.id, OWNER).await.unwrap().unwrap();
    row.expires_at = Some(Utc::now() - ChronoDuration::seconds(5));
    store.save(&mut row).await.unwrap();

    assert!(matches!(
        h.sandbox_mgr.extend_ttl(&bounded.id, OWNER, 60).await,
        Err(CoreError::SandboxExpired(_))
    ));
    assert!(matches!(
        h.sandbox_mgr.ensure_running(&bounded.id, OWNER).await,
        Err(CoreError::SandboxExpired(_))
    ));
    let view = h.sandbox_mgr.get_view(&bounded.id, OWNER).await.unwrap();
    assert_eq!(view.status, SandboxStatus::Expired);
}

#[tokio::test]
async fn test_stop_and_delete_are_idempotent() {
    let h = Harness::new().await;
    let sandbox = h
        .sandbox_mgr
        .create(OWNER, "python-default", None, None)
        .await
        .unwrap();
    h.router
        .exec_python(OWNER, &sandbox.id, "pass", None)
        .await
        .unwrap();

    h.sandbox_mgr.stop(&sandbox.id, OWNER).await.unwrap();
    h.sandbox_mgr.stop(&sandbox.id, OWNER).await.unwrap();

    h.sandbox_mgr.delete(&sandbox.id, OWNER).await.unwrap();
    h.sandbox_mgr.delete(&sandbox.id, OWNER).await.unwrap();
    assert!(h.locks.is_empty());
}

#[tokio::test]
async fn test_cargo_reference_counting_and_cascade() {
    let h = Harness::new().await;

    // Managed cargos refuse direct deletion.
    let sandbox = h
        .sandbox_mgr
        .create(OWNER, "python-default", None, None)
        .await
        .unwrap();
    let err = h
        .cargo_mgr
        .delete(&sandbox.cargo_id, OWNER, false)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    // Deleting the sandbox cascades its managed cargo and volume.
    assert_eq!(h.world.volume_count(), 1);
    h.sandbox_mgr.delete(&sandbox.id, OWNER).await.unwrap();
    assert_eq!(h.world.volume_count(), 0);
    assert!(h.cargo_mgr.get(&sandbox.cargo_id, OWNER).await.is_err());

    // External cargo with live references conflicts on delete.
    let external = h
        .cargo_mgr
        .create(OWNER, bay_storage::CargoKind::External, None)
        .await
        .unwrap();
    let user = h
        .sandbox_mgr
        .create(OWNER, "python-default", Some(&external.id), None)
        .await
        .unwrap();

    let err = h.cargo_mgr.delete(&external.id, OWNER, false).await.unwrap_err();
    match err {
        CoreError::Conflict(message) => assert!(message.contains(&user.id)),
        other => panic!("expected conflict, got {other:?}"),
    }

    // Deleting the referencing sandbox leaves the external cargo alive.
    h.sandbox_mgr.delete(&user.id, OWNER).await.unwrap();
    assert!(h.cargo_mgr.get(&external.id, OWNER).await.is_ok());
    h.cargo_mgr.delete(&external.id, OWNER, false).await.unwrap();
}

#[tokio::test]
async fn test_readiness_polls_through_slow_boot() {
    let h = Harness::new().await;
    h.world
        .state
        .lock()
        .unwrap()
        .meta_failures_left
        .insert("mock://ctr-1".to_string(), 3);

    let sandbox = h
        .sandbox_mgr
        .create(OWNER, "python-default", None, None)
        .await
        .unwrap();

    let outcome = h
        .router
        .exec_python(OWNER, &sandbox.id, "print(2*21)", None)
        .await
        .unwrap();
    assert!(outcome.success);
}

#[tokio::test]
async fn test_readiness_deadline_leaves_session_starting() {
    let h = Harness::new().await;
    // More failures than the shrunk deadline allows.
    h.world
        .state
        .lock()
        .unwrap()
        .meta_failures_left
        .insert("mock://ctr-1".to_string(), 100_000);

    let sandbox = h
        .sandbox_mgr
        .create(OWNER, "python-default", None, None)
        .await
        .unwrap();

    let err = h.sandbox_mgr.ensure_running(&sandbox.id, OWNER).await.unwrap_err();
    match err {
        CoreError::SessionNotReady { retry_after_ms, .. } => assert!(retry_after_ms > 0),
        other => panic!("expected session_not_ready, got {other:?}"),
    }

    let session = h
        .session_store()
        .list_for_sandbox(&sandbox.id)
        .await
        .unwrap()
        .pop()
        .unwrap();
    assert_eq!(session.observed_state, SessionState::Starting);
    assert!(session.endpoint.is_some());

    // Once the runtime comes up, the same session finishes starting.
    h.world.state.lock().unwrap().meta_failures_left.clear();
    let ready = h.sandbox_mgr.ensure_running(&sandbox.id, OWNER).await.unwrap();
    assert_eq!(ready.session.id, session.id);
    assert_eq!(ready.session.observed_state, SessionState::Running);
}

#[tokio::test]
async fn test_degraded_sidecar_recovers_on_next_browser_request() {
    let h = Harness::new().await;
    let sandbox = h
        .sandbox_mgr
        .create(OWNER, "python-browser", None, None)
        .await
        .unwrap();

    h.router
        .exec_browser(OWNER, &sandbox.id, "open http://example.com", None)
        .await
        .unwrap();
    assert_eq!(h.world.container_count(), 2);

    // Kill the sidecar; python keeps working, browser degrades.
    let session = h
        .sandbox_mgr
        .get(&sandbox.id, OWNER)
        .await
        .unwrap()
        .current_session_id
        .unwrap();
    let roster = h.session_store().containers(&session).await.unwrap();
    let browser_ctr = roster
        .iter()
        .find(|c| c.name == "browser")
        .and_then(|c| c.container_id.clone())
        .unwrap();
    h.world.kill_container(&browser_ctr);

    let outcome = h
        .router
        .exec_python(OWNER, &sandbox.id, "print(2*21)", None)
        .await
        .unwrap();
    assert!(outcome.success);

    let err = h
        .router
        .exec_browser(OWNER, &sandbox.id, "snapshot -i", None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::SessionNotReady { .. }));

    // The next browser request finds the session degraded and recovers it.
    let step = h
        .router
        .exec_browser(OWNER, &sandbox.id, "snapshot -i", None)
        .await
        .unwrap();
    assert!(step.success);

    let session_row = h.session_store().get(&session).await.unwrap().unwrap();
    assert_eq!(session_row.observed_state, SessionState::Running);
}

#[tokio::test]
async fn test_browser_batch_stop_on_error_records_single_row() {
    let h = Harness::new().await;
    let sandbox = h
        .sandbox_mgr
        .create(OWNER, "python-browser", None, None)
        .await
        .unwrap();

    let commands = vec![
        "open http://example.com".to_string(),
        "bad-subcommand".to_string(),
        "snapshot -i".to_string(),
    ];
    let outcome = h
        .router
        .exec_browser_batch(OWNER, &sandbox.id, &commands, None, true)
        .await
        .unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.steps.len(), 2);
    assert_eq!(outcome.steps[1].command, "bad-subcommand");

    let records = h
        .history
        .list(
            OWNER,
            &bay_storage::ExecutionFilter {
                sandbox_id: Some(sandbox.id.clone()),
                exec_type: Some(bay_storage::ExecType::BrowserBatch),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert!(!records[0].success);
}

#[tokio::test]
async fn test_history_records_and_annotations() {
    let h = Harness::new().await;
    let sandbox = h
        .sandbox_mgr
        .create(OWNER, "python-default", None, None)
        .await
        .unwrap();

    let before = h.sandbox_mgr.get(&sandbox.id, OWNER).await.unwrap().last_activity;
    h.router
        .exec_python(OWNER, &sandbox.id, "print(2*21)", None)
        .await
        .unwrap();
    let after = h.sandbox_mgr.get(&sandbox.id, OWNER).await.unwrap().last_activity;
    assert!(after > before);

    let last = h.history.last_for_sandbox(&sandbox.id, OWNER).await.unwrap();
    assert_eq!(last.exec_type, bay_storage::ExecType::Python);
    assert!(last.success);

    let annotated = h
        .history
        .annotate(&last.id, OWNER, Some("smoke"), None, Some("first run"))
        .await
        .unwrap();
    assert_eq!(annotated.description.as_deref(), Some("smoke"));

    // Other owners see nothing.
    assert!(h.history.get(&last.id, "intruder").await.is_err());
}

#[tokio::test]
async fn test_gc_idle_sessions_respects_late_keepalive() {
    let h = Harness::new().await;
    let sandbox = h
        .sandbox_mgr
        .create(OWNER, "python-default", None, None)
        .await
        .unwrap();
    h.router
        .exec_python(OWNER, &sandbox.id, "pass", None)
        .await
        .unwrap();

    // Age the session past its idle deadline.
    let store = h.session_store();
    let session_id = h
        .sandbox_mgr
        .get(&sandbox.id, OWNER)
        .await
        .unwrap()
        .current_session_id
        .unwrap();
    let mut session = store.get(&session_id).await.unwrap().unwrap();
    session.last_activity = Utc::now() - ChronoDuration::seconds(7200);
    store.save(&mut session).await.unwrap();

    // A keepalive that lands before the reaper wins: the re-read under the
    // lock sees the fresh activity.
    h.sandbox_mgr.keepalive(&sandbox.id, OWNER).await.unwrap();
    let reclaimed = h
        .sandbox_mgr
        .stop_if_idle(&sandbox.id, Utc::now())
        .await
        .unwrap();
    assert!(!reclaimed);
    assert_eq!(h.world.container_count(), 1);

    // Without the keepalive, the reaper stops the session but keeps the cargo.
    let mut session = store.get(&session_id).await.unwrap().unwrap();
    session.last_activity = Utc::now() - ChronoDuration::seconds(7200);
    store.save(&mut session).await.unwrap();

    let gc = h.gc();
    let stopped = gc.run_idle_sessions().await.unwrap();
    assert_eq!(stopped, 1);
    assert_eq!(h.world.container_count(), 0);
    assert_eq!(h.world.volume_count(), 1);
    let view = h.sandbox_mgr.get_view(&sandbox.id, OWNER).await.unwrap();
    assert_eq!(view.status, SandboxStatus::Idle);
}

#[tokio::test]
async fn test_gc_expired_sandboxes_cascade() {
    let h = Harness::new().await;
    let sandbox = h
        .sandbox_mgr
        .create(OWNER, "python-default", None, Some(3600))
        .await
        .unwrap();
    h.router
        .exec_python(OWNER, &sandbox.id, "pass", None)
        .await
        .unwrap();

    let store = h.sandbox_store();
    let mut row = store.get(&sandbox.id, OWNER).await.unwrap().unwrap();
    row.expires_at = Some(Utc::now() - ChronoDuration::seconds(1));
    store.save(&mut row).await.unwrap();

    let gc = h.gc();
    let deleted = gc.run_expired_sandboxes().await.unwrap();
    assert_eq!(deleted, 1);

    assert!(h.sandbox_mgr.get(&sandbox.id, OWNER).await.is_err());
    assert_eq!(h.world.container_count(), 0);
    assert_eq!(h.world.volume_count(), 0);
}

#[tokio::test]
async fn test_gc_orphan_containers_and_cargos() {
    let h = Harness::new().await;

    // A container from a crashed instance: labeled, but its session is unknown.
    let spec = bay_driver::LaunchSpec {
        name: "bay-sess-ghost-main".to_string(),
        image: "ship:latest".to_string(),
        env: Default::default(),
        cpus: 1.0,
        memory_mb: 512,
        runtime_port: 8000,
        volume: bay_driver::VolumeMount {
            handle: "bay-cargo-ghost".to_string(),
            mount_path: "/workspace".to_string(),
        },
        network: None,
        labels: [
            (bay_driver::LABEL_MANAGED.to_string(), "true".to_string()),
            (bay_driver::LABEL_SANDBOX_ID.to_string(), "sandbox-ghost".to_string()),
            (bay_driver::LABEL_SESSION_ID.to_string(), "sess-ghost".to_string()),
        ]
        .into_iter()
        .collect(),
    };
    let ghost = h.driver.create_container(&spec).await.unwrap();
    h.driver.start_container(&ghost).await.unwrap();

    // A managed cargo whose sandbox row never made it.
    let now = Utc::now();
    h.cargo_store()
        .create(&bay_storage::Cargo {
            id: "cargo-ghost".to_string(),
            owner: OWNER.to_string(),
            backend_handle: "bay-cargo-ghost".to_string(),
            kind: bay_storage::CargoKind::Managed,
            mount_path: "/workspace".to_string(),
            managed_by_sandbox_id: Some("sandbox-ghost".to_string()),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            version: 0,
        })
        .await
        .unwrap();
    h.driver
        .create_volume(&bay_driver::VolumeSpec {
            name: "bay-cargo-ghost".to_string(),
            labels: Default::default(),
        })
        .await
        .unwrap();

    // A healthy sandbox must be untouched by the sweeps.
    let healthy = h
        .sandbox_mgr
        .create(OWNER, "python-default", None, None)
        .await
        .unwrap();
    h.router
        .exec_python(OWNER, &healthy.id, "pass", None)
        .await
        .unwrap();

    let gc = h.gc();
    assert_eq!(gc.run_orphan_containers().await.unwrap(), 1);
    assert_eq!(gc.run_orphan_cargos().await.unwrap(), 1);

    assert_eq!(h.world.container_count(), 1);
    assert!(h
        .router
        .exec_python(OWNER, &healthy.id, "pass", None)
        .await
        .is_ok());
}
