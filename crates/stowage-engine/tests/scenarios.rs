//! End-to-end backup and restore scenarios driven through the manager.

mod common;

use common::{single_worker, stored_objects, write_tree, Harness};
use std::collections::HashSet;
use std::time::Duration;
use stowage_engine::discovery::walk;
use stowage_engine::{
    ComponentSpec, EngineConfig, ErrorKind, Event, JobDefinition, JobKind, JobState, Options,
    OutcomeState, PathSpec,
};
use tokio_util::sync::CancellationToken;

fn local(dir: &std::path::Path) -> ComponentSpec {
    ComponentSpec::with_options("local", Options::new().with("path", dir.to_string_lossy()))
}

#[tokio::test]
async fn test_backup_twenty_files_to_log_and_local() {
    let source = tempfile::tempdir().unwrap();
    let store = tempfile::tempdir().unwrap();
    write_tree(source.path(), 20);

    let mut harness = Harness::new(single_worker());
    let def = JobDefinition {
        to: vec![ComponentSpec::named("log"), local(store.path())],
        paths: vec![PathSpec::new(source.path())],
        ..Default::default()
    };
    let handle = harness.manager.submit(JobKind::Backup, def, None).unwrap();
    let id = handle.id().clone();
    let (outcomes, finished) = harness.outcomes_until_finished(&id).await;
    let status = handle.wait().await.unwrap();

    assert_eq!(status, finished);
    assert_eq!(status.state, JobState::Finished);
    assert_eq!(status.total, 20);
    assert_eq!(status.complete, 20);
    assert!(status.is_balanced());
    assert_eq!(outcomes.len(), 20);
    assert!(outcomes.iter().all(|o| o.state == OutcomeState::Complete));

    assert_eq!(harness.book.len(), 20);
    let objects = stored_objects(store.path());
    assert_eq!(objects.len(), 20);
    let keys: HashSet<String> = outcomes.iter().map(|o| o.signature.storage_key()).collect();
    for object in &objects {
        let name = object.file_name().unwrap().to_string_lossy().into_owned();
        assert!(keys.contains(&name), "unexpected object {name}");
    }
}

#[tokio::test]
async fn test_second_backup_skips_stored_items() {
    let source = tempfile::tempdir().unwrap();
    let store = tempfile::tempdir().unwrap();
    write_tree(source.path(), 6);

    let mut harness = Harness::new(EngineConfig::default());
    let def = JobDefinition {
        to: vec![local(store.path())],
        paths: vec![PathSpec::new(source.path())],
        ..Default::default()
    };
    let first = harness.manager.submit(JobKind::Backup, def.clone(), None).unwrap();
    let first = first.wait().await.unwrap();
    assert_eq!(first.complete, 6);

    let second = harness.manager.submit(JobKind::Backup, def, None).unwrap();
    let id = second.id().clone();
    let (outcomes, _) = harness.outcomes_until_finished(&id).await;
    let second = second.wait().await.unwrap();
    assert_eq!(second.skipped, 6);
    assert_eq!(second.complete, 0);
    assert!(outcomes.iter().all(|o| o.state == OutcomeState::Skipped));
}

#[tokio::test]
async fn test_restore_decompresses_stored_item() {
    let source = tempfile::tempdir().unwrap();
    let store = tempfile::tempdir().unwrap();
    let original = "compressible line of text\n".repeat(4000);
    let file = source.path().join("notes.txt");
    std::fs::write(&file, &original).unwrap();

    let mut harness = Harness::new(EngineConfig::default());
    let compress = vec![ComponentSpec::with_options(
        "compress",
        Options::new().with("level", "6"),
    )];

    let backup = JobDefinition {
        to: vec![local(store.path())],
        modifications: compress.clone(),
        paths: vec![PathSpec::new(&file)],
        ..Default::default()
    };
    let handle = harness.manager.submit(JobKind::Backup, backup, None).unwrap();
    let id = handle.id().clone();
    let (stored, _) = harness.outcomes_until_finished(&id).await;
    handle.wait().await.unwrap();
    assert_eq!(stored.len(), 1);
    let signature = stored[0].signature.clone();
    assert_eq!(signature.applied_transforms, vec!["compress".to_string()]);

    let object = store.path().join(signature.storage_key());
    let stored_len = std::fs::metadata(&object).unwrap().len();
    assert!(stored_len < original.len() as u64);

    let restore = JobDefinition {
        to: vec![ComponentSpec::named("log")],
        from: Some(local(store.path())),
        modifications: compress,
        files: vec![signature.clone()],
        ..Default::default()
    };
    let handle = harness.manager.submit(JobKind::Restore, restore, None).unwrap();
    let id = handle.id().clone();
    let (restored, _) = harness.outcomes_until_finished(&id).await;
    let status = handle.wait().await.unwrap();

    assert_eq!(status.state, JobState::Finished);
    assert_eq!(status.complete, 1);
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].state, OutcomeState::Complete);
    let entries = harness.book.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].bytes, original.len() as u64);
    assert_eq!(entries[0].content_hash, signature.content_hash);
}

#[tokio::test]
async fn test_cancel_stops_discovery_walk() {
    let source = tempfile::tempdir().unwrap();
    write_tree(source.path(), 20);

    let cancel = CancellationToken::new();
    let (mut paths, walker) = walk(vec![PathSpec::new(source.path())], 1, cancel.clone());
    for _ in 0..10 {
        paths.recv().await.unwrap();
    }
    cancel.cancel();
    drop(paths);

    let report = tokio::time::timeout(Duration::from_secs(5), walker)
        .await
        .expect("walk terminates after cancel")
        .unwrap();
    assert!(report.interrupted);
    assert!(report.emitted < 20);
}

#[tokio::test]
async fn test_cancel_running_backup_keeps_counters_balanced() {
    let source = tempfile::tempdir().unwrap();
    write_tree(source.path(), 200);

    let config = EngineConfig {
        workers: 1,
        queue_capacity: 1,
        result_capacity: 1,
        ..Default::default()
    };
    let mut harness = Harness::new(config);
    let def = JobDefinition {
        to: vec![ComponentSpec::named("log")],
        paths: vec![PathSpec::new(source.path())],
        ..Default::default()
    };
    let handle = harness.manager.submit(JobKind::Backup, def, None).unwrap();
    let id = handle.id().clone();

    loop {
        match harness.events.recv().await {
            Some(Event::FileResult { .. }) => break,
            Some(_) => continue,
            None => panic!("no outcome before the channel closed"),
        }
    }
    harness.manager.cancel(&id).unwrap();
    harness.manager.cancel(&id).unwrap();

    let status = tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .expect("cancelled job terminates")
        .unwrap();
    assert_eq!(status.state, JobState::Canceled);
    assert!(status.is_balanced());
    assert!(status.total < 200);
    assert!(status.total + status.abandoned <= 200);
    assert!(status.end.is_some());
}

#[tokio::test]
async fn test_participation_error_fails_item_not_job() {
    let source = tempfile::tempdir().unwrap();
    let store = tempfile::tempdir().unwrap();
    write_tree(source.path(), 1);

    let mut harness = Harness::new(EngineConfig::default());
    let def = JobDefinition {
        to: vec![
            ComponentSpec::named("log"),
            ComponentSpec::named("unavailable"),
            local(store.path()),
        ],
        paths: vec![PathSpec::new(source.path())],
        ..Default::default()
    };
    let handle = harness.manager.submit(JobKind::Backup, def, None).unwrap();
    let id = handle.id().clone();
    let (outcomes, _) = harness.outcomes_until_finished(&id).await;
    let status = handle.wait().await.unwrap();

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].state, OutcomeState::Errors);
    assert_eq!(outcomes[0].error.as_ref().unwrap().kind, ErrorKind::Participation);
    assert!(harness.book.is_empty());
    assert!(stored_objects(store.path()).is_empty());

    assert_eq!(status.state, JobState::Finished);
    assert_eq!(status.errors, 1);
    assert!(status.is_balanced());
}

#[tokio::test]
async fn test_unreadable_root_fails_job_after_processing_the_rest() {
    let source = tempfile::tempdir().unwrap();
    write_tree(source.path(), 3);

    let mut harness = Harness::new(EngineConfig::default());
    let def = JobDefinition {
        to: vec![ComponentSpec::named("log")],
        paths: vec![
            PathSpec::new(source.path().join("missing")),
            PathSpec::new(source.path()),
        ],
        ..Default::default()
    };
    let handle = harness.manager.submit(JobKind::Backup, def, None).unwrap();
    let id = handle.id().clone();
    let (outcomes, _) = harness.outcomes_until_finished(&id).await;
    let status = handle.wait().await.unwrap();

    assert_eq!(outcomes.len(), 3);
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.discovery_errors, 1);
    assert_eq!(status.complete, 3);
    assert!(status.message.unwrap().contains("missing"));
}

#[tokio::test]
async fn test_bad_transform_rejected_at_submission() {
    let harness = Harness::new(EngineConfig::default());
    let def = JobDefinition {
        to: vec![ComponentSpec::named("log")],
        modifications: vec![ComponentSpec::with_options(
            "compress",
            Options::new().with("method", "lzma"),
        )],
        paths: vec![PathSpec::new("/")],
        ..Default::default()
    };
    assert!(harness.manager.submit(JobKind::Backup, def, None).is_err());
    assert!(harness.manager.active().is_empty());
}
