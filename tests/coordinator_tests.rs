//! End-to-end tests for the redundancy coordinator against scripted
//! schedulers and workers on loopback TCP.


use std::sync::Arc;
use std::time::Duration;

use fleetcc::config::EnvironmentConfig;
use fleetcc::error::BuildError;
use fleetcc::job::{CompileJob, Language};
use fleetcc::protocol::{Message, MessageKind};
use fleetcc::remote::RedundancyCoordinator;
use tempfile::TempDir;
use test_harness::{
    dead_port, endless_toolchain, failing_toolchain, local_diagnostic, object_for,
    spawn_scheduler, spawn_scheduler_with_version, test_config, write_source, CapturedOutput,
    FakeLocalCompiler, TestWorker, WorkerScript, TEST_ENVIRONMENT,
};

fn coordinator(
    config: &fleetcc::config::ClientConfig,
) -> (RedundancyCoordinator, Arc<FakeLocalCompiler>, Arc<CapturedOutput>) {
    let local = Arc::new(FakeLocalCompiler::default());
    let relay = Arc::new(CapturedOutput::default());
    let coordinator = RedundancyCoordinator::new(config, local.clone()).with_relay(relay.clone());
    (coordinator, local, relay)
}

fn job_in(dir: &TempDir, source_len: usize) -> CompileJob {
    let input = write_source(dir.path(), "unit.c", source_len);
    CompileJob::new(input, dir.path().join("unit.o"), Language::C)
}

#[tokio::test]
async fn test_single_copy_with_cached_environment() {
    let dir = TempDir::new().unwrap();
    let job = job_in(&dir, 5000);
    let source = std::fs::read(&job.input_file).unwrap();

    let worker = TestWorker::spawn(WorkerScript::compile(0).with_output("", "warning: x")).await;
    let (mut scheduler, sched_handle) = spawn_scheduler(vec![(worker.port, true)]);
    let (coordinator, local, relay) = coordinator(&test_config(1));

    let report = coordinator
        .build_remote(&mut scheduler, job.clone())
        .await
        .unwrap();
    drop(scheduler);

    assert_eq!(report.status, 0);
    assert_eq!(report.copies.len(), 1);
    assert_eq!(report.copies[0].job_id, Some(100));
    assert_eq!(report.copies[0].task_id, None);
    assert_eq!(std::fs::read(&job.output_file).unwrap(), object_for(&source));
    assert_eq!(local.calls(), 0);
    assert_eq!(
        relay.entries(),
        vec![(String::new(), "warning: x".to_string())]
    );

    let log = worker.log().await;
    assert_eq!(log.kinds.first(), Some(&MessageKind::CompileJob));
    assert!(!log.kinds.contains(&MessageKind::EnvironmentTransfer));
    assert_eq!(log.kinds.last(), Some(&MessageKind::End));
    assert_eq!(log.source, source);

    match sched_handle.await.unwrap() {
        Some(Message::RequestAssignment {
            input_path,
            language,
            copies,
            ..
        }) => {
            assert_eq!(input_path, job.input_file.to_string_lossy());
            assert_eq!(language, Language::C);
            assert_eq!(copies, 1);
        }
        other => panic!("expected assignment request, got {other:?}"),
    }
}

#[tokio::test]
async fn test_environment_is_shipped_when_missing() {
    let dir = TempDir::new().unwrap();
    let job = job_in(&dir, 100);
    let archive = dir.path().join("toolchain.tar.bz2");
    let archive_bytes: Vec<u8> = (0..3000u32).map(|i| (i % 253) as u8).collect();
    std::fs::write(&archive, &archive_bytes).unwrap();

    let worker = TestWorker::spawn(WorkerScript::compile(0)).await;
    let (mut scheduler, _sched) = spawn_scheduler(vec![(worker.port, false)]);
    let config = test_config(1).with_environment(EnvironmentConfig::from_archive(&archive));
    let (coordinator, _local, _relay) = coordinator(&config);

    let report = coordinator.build_remote(&mut scheduler, job).await.unwrap();
    assert_eq!(report.status, 0);

    let log = worker.log().await;
    assert_eq!(log.kinds[0], MessageKind::EnvironmentTransfer);
    assert_eq!(log.environment.as_deref(), Some(TEST_ENVIRONMENT));
    assert_eq!(log.environment_bytes, archive_bytes);
}

#[tokio::test]
async fn test_preprocessor_failure_is_the_result() {
    let dir = TempDir::new().unwrap();
    let job = job_in(&dir, 100);

    let worker = TestWorker::spawn(WorkerScript::compile(0)).await;
    let (mut scheduler, _sched) = spawn_scheduler(vec![(worker.port, true)]);
    let config = test_config(1).with_toolchain(failing_toolchain(3));
    let (coordinator, local, _relay) = coordinator(&config);

    let report = coordinator
        .build_remote(&mut scheduler, job.clone())
        .await
        .unwrap();
    assert_eq!(report.status, 3);
    assert!(!job.output_file.exists());
    assert_eq!(local.calls(), 0);

    let log = worker.log().await;
    assert!(!log.source_complete);
    assert!(!log.kinds.contains(&MessageKind::End));
}

#[tokio::test]
async fn test_remote_compile_error_is_relayed() {
    let dir = TempDir::new().unwrap();
    let job = job_in(&dir, 100);

    let worker =
        TestWorker::spawn(WorkerScript::compile(1).with_output("", "unit.c:1: error")).await;
    let (mut scheduler, _sched) = spawn_scheduler(vec![(worker.port, true)]);
    let (coordinator, local, relay) = coordinator(&test_config(1));

    let report = coordinator
        .build_remote(&mut scheduler, job.clone())
        .await
        .unwrap();
    assert_eq!(report.status, 1);
    assert!(!job.output_file.exists());
    assert_eq!(local.calls(), 0);
    assert_eq!(relay.entries()[0].1, "unit.c:1: error");
}

#[tokio::test]
async fn test_single_copy_failure_surfaces_without_fallback() {
    let dir = TempDir::new().unwrap();
    let job = job_in(&dir, 100);

    let worker = TestWorker::spawn(WorkerScript::hang_up()).await;
    let (mut scheduler, _sched) = spawn_scheduler(vec![(worker.port, true)]);
    let (coordinator, local, _relay) = coordinator(&test_config(1));

    let err = coordinator
        .build_remote(&mut scheduler, job.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, BuildError::ProtocolViolation(_)));
    assert_eq!(local.calls(), 0);
    assert!(!job.output_file.exists());
}

#[tokio::test]
async fn test_wrong_scheduler_reply_is_protocol_violation() {
    let dir = TempDir::new().unwrap();
    let (client, mut sched) = fleetcc::transport::duplex_pair(64 * 1024);
    let mut scheduler = client;
    tokio::spawn(async move {
        use fleetcc::transport::MsgChannel;
        let _ = sched.receive().await;
        let _ = sched.send(&Message::End).await;
        while let Ok(Some(_)) = sched.receive().await {}
    });

    let (coordinator, _local, _relay) = coordinator(&test_config(1));
    let err = coordinator
        .build_remote(&mut scheduler, job_in(&dir, 10))
        .await
        .unwrap_err();
    assert!(matches!(err, BuildError::ProtocolViolation(_)));
}

#[tokio::test]
async fn test_redundant_copies_only_primary_is_visible() {
    let dir = TempDir::new().unwrap();
    let job = job_in(&dir, 20_000);
    let source = std::fs::read(&job.input_file).unwrap();

    let mut workers = Vec::new();
    for i in 0..3 {
        let out = format!("worker {i}");
        workers.push(TestWorker::spawn(WorkerScript::compile(0).with_output(&out, "")).await);
    }
    let (mut scheduler, _sched) =
        spawn_scheduler(workers.iter().map(|w| (w.port, true)).collect());
    let (coordinator, local, relay) = coordinator(&test_config(3));

    let report = coordinator
        .build_remote(&mut scheduler, job.clone())
        .await
        .unwrap();

    assert_eq!(report.status, 0);
    assert_eq!(report.copies.len(), 3);
    for (i, copy) in report.copies.iter().enumerate() {
        assert_eq!(copy.index, i);
        assert_eq!(copy.status, Some(0));
        assert_eq!(copy.fallback, None);
        assert!(copy.task_id.is_some());
    }
    assert_ne!(report.copies[0].task_id, report.copies[1].task_id);
    assert_ne!(report.copies[1].task_id, report.copies[2].task_id);
    assert_eq!(report.copies[0].output, job.output_file);
    assert_ne!(report.copies[1].output, job.output_file);
    assert_ne!(report.copies[1].output, report.copies[2].output);
    // Private copies are discarded after aggregation
    assert!(!report.copies[1].output.exists());
    assert!(!report.copies[2].output.exists());

    assert_eq!(std::fs::read(&job.output_file).unwrap(), object_for(&source));
    assert_eq!(relay.entries(), vec![("worker 0".to_string(), String::new())]);
    assert_eq!(local.calls(), 0);

    for worker in workers {
        assert_eq!(worker.log().await.source, source);
    }
}

#[tokio::test]
async fn test_failed_primary_falls_back_to_identical_local_build() {
    let dir = TempDir::new().unwrap();
    let job = job_in(&dir, 4000);
    let source = std::fs::read(&job.input_file).unwrap();

    let primary = TestWorker::spawn(WorkerScript::hang_up()).await;
    let shadow = TestWorker::spawn(WorkerScript::compile(0)).await;
    let (mut scheduler, _sched) =
        spawn_scheduler(vec![(primary.port, true), (shadow.port, true)]);
    let (coordinator, local, relay) = coordinator(&test_config(2));

    let report = coordinator
        .build_remote(&mut scheduler, job.clone())
        .await
        .unwrap();

    assert_eq!(report.status, 0);
    assert_eq!(report.copies[0].fallback.as_deref(), Some("protocol_violation"));
    assert_eq!(report.copies[1].fallback, None);
    assert_eq!(local.calls(), 1);
    assert_eq!(local.outputs(), vec![job.output_file.clone()]);
    assert_eq!(std::fs::read(&job.output_file).unwrap(), object_for(&source));
    // The primary's local build is the one the user sees
    assert_eq!(relay.entries(), vec![(String::new(), local_diagnostic(&job))]);
}

#[tokio::test]
async fn test_failed_shadow_does_not_touch_primary_output() {
    let dir = TempDir::new().unwrap();
    let job = job_in(&dir, 300);
    let source = std::fs::read(&job.input_file).unwrap();

    let primary = TestWorker::spawn(WorkerScript::compile(0)).await;
    let shadow = TestWorker::spawn(WorkerScript::wrong_reply()).await;
    let (mut scheduler, _sched) =
        spawn_scheduler(vec![(primary.port, true), (shadow.port, true)]);
    let (coordinator, local, _relay) = coordinator(&test_config(2));

    let report = coordinator
        .build_remote(&mut scheduler, job.clone())
        .await
        .unwrap();

    assert_eq!(report.status, 0);
    assert_eq!(report.copies[1].fallback.as_deref(), Some("protocol_violation"));
    assert_eq!(local.calls(), 1);
    assert_ne!(local.outputs()[0], job.output_file);
    assert_eq!(std::fs::read(&job.output_file).unwrap(), object_for(&source));
}

#[tokio::test]
async fn test_primary_status_wins_over_shadows() {
    let dir = TempDir::new().unwrap();
    let job = job_in(&dir, 300);

    let primary = TestWorker::spawn(WorkerScript::compile(2)).await;
    let shadow = TestWorker::spawn(WorkerScript::compile(0)).await;
    let (mut scheduler, _sched) =
        spawn_scheduler(vec![(primary.port, true), (shadow.port, true)]);
    let (coordinator, _local, _relay) = coordinator(&test_config(2));

    let report = coordinator
        .build_remote(&mut scheduler, job.clone())
        .await
        .unwrap();

    assert_eq!(report.status, 2);
    assert_eq!(report.copies[1].status, Some(0));
    assert!(!job.output_file.exists());
}

#[tokio::test]
async fn test_unreachable_worker_aborts_negotiation() {
    let dir = TempDir::new().unwrap();
    let job = job_in(&dir, 300);

    let primary = TestWorker::spawn(WorkerScript::compile(0)).await;
    let dead = dead_port().await;
    let (mut scheduler, _sched) = spawn_scheduler(vec![(primary.port, true), (dead, true)]);
    let (coordinator, local, _relay) = coordinator(&test_config(2));

    let err = coordinator
        .build_remote(&mut scheduler, job.clone())
        .await
        .unwrap_err();

    assert!(matches!(err, BuildError::WorkerUnreachable { port, .. } if port == dead));
    assert_eq!(local.calls(), 0);
    assert!(!job.output_file.exists());
    // No copy started, so the primary's worker never saw a job
    assert!(primary.log().await.kinds.is_empty());
}

#[tokio::test]
async fn test_shadow_fallback_relays_nothing() {
    let dir = TempDir::new().unwrap();
    let job = job_in(&dir, 300);

    let primary = TestWorker::spawn(WorkerScript::compile(0).with_output("primary", "")).await;
    let shadow = TestWorker::spawn(WorkerScript::hang_up()).await;
    let (mut scheduler, _sched) =
        spawn_scheduler(vec![(primary.port, true), (shadow.port, true)]);
    let (coordinator, local, relay) = coordinator(&test_config(2));

    let report = coordinator
        .build_remote(&mut scheduler, job.clone())
        .await
        .unwrap();

    assert_eq!(report.copies[1].fallback.as_deref(), Some("protocol_violation"));
    assert_eq!(local.calls(), 1);
    assert_eq!(relay.entries(), vec![("primary".to_string(), String::new())]);
}

#[tokio::test]
async fn test_shadow_without_environment_falls_back() {
    let dir = TempDir::new().unwrap();
    let job = job_in(&dir, 2000);
    let source = std::fs::read(&job.input_file).unwrap();

    let primary = TestWorker::spawn(WorkerScript::compile(0)).await;
    let shadow = TestWorker::spawn(WorkerScript::compile(0)).await;
    // No archive is configured, so the shadow cannot be provisioned
    let (mut scheduler, _sched) =
        spawn_scheduler(vec![(primary.port, true), (shadow.port, false)]);
    let (coordinator, local, _relay) = coordinator(&test_config(2));

    let report = coordinator
        .build_remote(&mut scheduler, job.clone())
        .await
        .unwrap();

    assert_eq!(report.status, 0);
    assert_eq!(report.copies[0].fallback, None);
    assert_eq!(
        report.copies[1].fallback.as_deref(),
        Some("environment_unavailable")
    );
    assert_eq!(report.copies[1].status, Some(0));
    assert_eq!(local.calls(), 1);
    assert_eq!(local.outputs(), vec![report.copies[1].output.clone()]);
    assert_eq!(std::fs::read(&job.output_file).unwrap(), object_for(&source));

    // Nothing was sent to the shadow's worker
    assert!(shadow.log().await.kinds.is_empty());
}

#[tokio::test]
async fn test_worker_lost_mid_source_falls_back() {
    let dir = TempDir::new().unwrap();
    let job = job_in(&dir, 700);
    let source = std::fs::read(&job.input_file).unwrap();

    let primary = TestWorker::spawn(WorkerScript::drop_after_job()).await;
    let shadow = TestWorker::spawn(WorkerScript::drop_after_job()).await;
    let (mut scheduler, _sched) =
        spawn_scheduler(vec![(primary.port, true), (shadow.port, true)]);
    let config = test_config(2).with_toolchain(endless_toolchain());
    let (coordinator, local, _relay) = coordinator(&config);

    // The preprocessor never finishes, so returning at all means it was abandoned
    let report = tokio::time::timeout(
        Duration::from_secs(30),
        coordinator.build_remote(&mut scheduler, job.clone()),
    )
    .await
    .expect("source stage did not give up on a lost worker")
    .unwrap();

    assert_eq!(report.status, 0);
    for copy in &report.copies {
        assert_eq!(copy.fallback.as_deref(), Some("transport_failure"));
        assert_eq!(copy.status, Some(0));
    }
    assert_eq!(local.calls(), 2);
    assert_eq!(std::fs::read(&job.output_file).unwrap(), object_for(&source));

    let log = primary.log().await;
    assert_eq!(log.kinds, vec![MessageKind::CompileJob]);
    assert!(!log.source_complete);
}

#[tokio::test]
async fn test_old_scheduler_gets_a_single_copy() {
    let dir = TempDir::new().unwrap();
    let job = job_in(&dir, 300);
    let source = std::fs::read(&job.input_file).unwrap();

    let worker = TestWorker::spawn(WorkerScript::compile(0)).await;
    // A v4 scheduler answers a multi-copy request with a single assignment
    let (mut scheduler, sched_handle) = spawn_scheduler_with_version(vec![(worker.port, true)], 4);
    let (coordinator, local, _relay) = coordinator(&test_config(3));

    let report = tokio::time::timeout(
        Duration::from_secs(10),
        coordinator.build_remote(&mut scheduler, job.clone()),
    )
    .await
    .expect("waited for assignments an old scheduler never sends")
    .unwrap();
    drop(scheduler);

    assert_eq!(report.status, 0);
    assert_eq!(report.copies.len(), 1);
    assert_eq!(report.copies[0].job_id, Some(100));
    assert_eq!(std::fs::read(&job.output_file).unwrap(), object_for(&source));
    assert_eq!(local.calls(), 0);
    match sched_handle.await.unwrap() {
        Some(Message::RequestAssignment { copies, .. }) => assert_eq!(copies, 3),
        other => panic!("expected assignment request, got {other:?}"),
    }
}
