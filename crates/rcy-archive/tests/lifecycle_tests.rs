use pretty_assertions::assert_eq;
use rcy_archive::{
    ArchiveConfig, ArchiveEvent, ArchiveState, CommittedManifest, ExtractorEvent, FileSystem,
    LocalFileSystem, ResultArchiveManager, ScenarioId, TaskPath,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn manager(root: &Path) -> ResultArchiveManager {
    ResultArchiveManager::new(
        ArchiveConfig::default().with_rdb_root(root),
        Arc::new(LocalFileSystem),
    )
}

fn write_result(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"#FEDEM response data\n").unwrap();
    path
}

fn tp(s: &str) -> TaskPath {
    s.parse().unwrap()
}

fn listing(root: &Path) -> Vec<PathBuf> {
    LocalFileSystem.list_files(root).unwrap()
}

#[test]
fn increment_then_close_discards_unsaved_results() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("model_RDB");
    let archives = manager(&root);

    let prim = archives
        .ensure_sub_task_dir(ScenarioId::Master, &tp("timehist_prim"))
        .unwrap();
    let saved = write_result(&prim, "th_p_001.frs");
    archives.sync(ScenarioId::Master).unwrap();
    archives.save(false).unwrap();

    let unsaved = write_result(&prim, "th_p_002.frs");
    archives.sync(ScenarioId::Master).unwrap();
    archives.increment(true).unwrap();

    let prim_v2 = archives
        .ensure_sub_task_dir(ScenarioId::Master, &tp("timehist_prim"))
        .unwrap();
    assert!(prim_v2.starts_with(root.join("response_0002")));
    write_result(&prim_v2, "th_p_001.frs");
    archives.sync(ScenarioId::Master).unwrap();

    archives.close(true).unwrap();
    assert!(saved.is_file());
    assert!(!unsaved.exists());
    assert!(!root.join("response_0002").exists());
    assert_eq!(archives.state(ScenarioId::Master).unwrap(), ArchiveState::Closed);
    assert_eq!(
        archives.snapshot(ScenarioId::Master).unwrap(),
        archives.committed(ScenarioId::Master).unwrap()
    );

    let after_first = listing(&root);
    archives.close(true).unwrap();
    assert_eq!(listing(&root), after_first);
}

#[test]
fn close_without_prune_keeps_files_in_committed_dir() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("model_RDB");
    let archives = manager(&root);

    let prim = archives
        .ensure_sub_task_dir(ScenarioId::Master, &tp("timehist_prim"))
        .unwrap();
    let unsaved = write_result(&prim, "th_p_001.frs");
    archives.sync(ScenarioId::Master).unwrap();

    archives.close(false).unwrap();
    assert!(unsaved.is_file());
    assert!(archives.snapshot(ScenarioId::Master).unwrap().is_empty());
}

#[test]
fn save_removes_superseded_task_versions() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("model_RDB");
    let archives = manager(&root);

    let prim = archives
        .ensure_sub_task_dir(ScenarioId::Master, &tp("timehist_prim"))
        .unwrap();
    write_result(&prim, "th_p_001.frs");
    archives.sync(ScenarioId::Master).unwrap();
    archives.save(true).unwrap();

    archives.increment(true).unwrap();
    let prim_v2 = archives
        .ensure_sub_task_dir(ScenarioId::Master, &tp("timehist_prim"))
        .unwrap();
    let kept = write_result(&prim_v2, "th_p_001.frs");
    archives.save(true).unwrap();

    assert!(!root.join("response_0001").exists());
    assert!(kept.is_file());
    let committed = archives.committed(ScenarioId::Master).unwrap();
    assert_eq!(committed.version(), 2);
    assert_eq!(committed.root().file_count(), 1);
    assert_eq!(archives.state(ScenarioId::Master).unwrap(), ArchiveState::Saved);
}

#[test]
fn save_as_then_open_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let old_root = dir.path().join("old_RDB");
    let new_root = dir.path().join("new_RDB");
    let archives = manager(&old_root);
    archives.add_scenario(ScenarioId::Event(1), 0.3).unwrap();

    for scenario in [ScenarioId::Master, ScenarioId::Event(1)] {
        let task = archives
            .ensure_sub_task_dir(scenario, &TaskPath::root())
            .unwrap();
        write_result(&task, "fedem_solver.fsi");
        let prim = archives
            .ensure_sub_task_dir(scenario, &tp("timehist_prim"))
            .unwrap();
        write_result(&prim, "th_p_001.frs");
        let rcy = archives
            .ensure_sub_task_dir(scenario, &tp("timehist_gage_rcy/part1"))
            .unwrap();
        write_result(&rcy, "part1_001.frs");
        archives.sync(scenario).unwrap();
    }
    let before_master = archives.snapshot(ScenarioId::Master).unwrap();
    let before_event = archives.snapshot(ScenarioId::Event(1)).unwrap();

    archives.save_as(&new_root, false).unwrap();
    assert_eq!(archives.rdb_root(), new_root);
    assert!(!old_root.join("response_0001/timehist_prim_0001/th_p_001.frs").exists());

    let reopened = manager(&new_root);
    reopened.add_scenario(ScenarioId::Event(1), 0.3).unwrap();
    let master = reopened.open(ScenarioId::Master).unwrap();
    let event = reopened.open(ScenarioId::Event(1)).unwrap();

    assert_eq!(master.root(), before_master.root());
    assert_eq!(event.root(), before_event.root());
    assert_eq!(event.root_path(), new_root.join("event_001"));
    assert_eq!(
        archives.snapshot(ScenarioId::Master).unwrap().relative_files(),
        master.relative_files()
    );
}

#[test]
fn save_as_with_discard_carries_nothing_over() {
    let dir = tempfile::tempdir().unwrap();
    let old_root = dir.path().join("old_RDB");
    let new_root = dir.path().join("new_RDB");
    let archives = manager(&old_root);

    let prim = archives
        .ensure_sub_task_dir(ScenarioId::Master, &tp("timehist_prim"))
        .unwrap();
    write_result(&prim, "th_p_001.frs");
    archives.sync(ScenarioId::Master).unwrap();

    archives.save_as(&new_root, true).unwrap();
    assert!(listing(&new_root).is_empty());
    assert!(archives.snapshot(ScenarioId::Master).unwrap().is_empty());
}

#[test]
fn first_activation_reads_disk_and_sets_baseline() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("model_RDB");
    let prim = root.join("event_001/response_0001/timehist_prim_0001");
    std::fs::create_dir_all(&prim).unwrap();
    let frs = write_result(&prim, "th_p_001.frs");

    let archives = manager(&root);
    archives.add_scenario(ScenarioId::Event(1), 1.0).unwrap();
    let mut events = archives.subscribe();

    assert!(archives.activate(ScenarioId::Event(1), true, true).unwrap());
    assert_eq!(archives.active(), ScenarioId::Event(1));
    assert_eq!(
        archives.committed(ScenarioId::Event(1)).unwrap(),
        archives.snapshot(ScenarioId::Event(1)).unwrap()
    );
    assert!(archives.with_extractors(|x| x.model().is_some_and(|m| m.contains(&frs))));
    assert_eq!(
        events.try_recv().unwrap(),
        ArchiveEvent::Activated {
            scenario: ScenarioId::Event(1)
        }
    );

    let mut extractor_events = archives.subscribe_extractors();
    assert!(!archives.activate(ScenarioId::Event(1), true, true).unwrap());
    assert!(events.try_recv().is_err());
    assert!(extractor_events.try_recv().is_err());
}

#[test]
fn sync_feeds_active_extractor_only() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("model_RDB");
    let archives = manager(&root);
    archives.add_scenario(ScenarioId::Event(1), 1.0).unwrap();
    let mut extractor_events = archives.subscribe_extractors();

    let prim = archives
        .ensure_sub_task_dir(ScenarioId::Event(1), &tp("timehist_prim"))
        .unwrap();
    write_result(&prim, "th_p_001.frs");
    archives.sync(ScenarioId::Event(1)).unwrap();
    assert!(extractor_events.try_recv().is_err());

    let master_prim = archives
        .ensure_sub_task_dir(ScenarioId::Master, &tp("timehist_prim"))
        .unwrap();
    let frs = write_result(&master_prim, "th_p_001.frs");
    archives.sync(ScenarioId::Master).unwrap();

    let mut saw_header = false;
    while let Ok(event) = extractor_events.try_recv() {
        if let ExtractorEvent::HeaderChanged { files, .. } = event {
            saw_header = files == vec![frs.clone()];
        }
    }
    assert!(saw_header);
    assert!(archives.results_flag().is_set());
}

#[test]
fn close_releases_extractors_before_deleting() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("model_RDB");
    let archives = manager(&root);

    let prim = archives
        .ensure_sub_task_dir(ScenarioId::Master, &tp("timehist_prim"))
        .unwrap();
    write_result(&prim, "th_p_001.frs");
    archives.sync(ScenarioId::Master).unwrap();
    assert_eq!(archives.with_extractors(|x| x.open_handles()), 1);

    archives.close(true).unwrap();
    assert_eq!(archives.with_extractors(|x| x.open_handles()), 0);
    assert!(listing(&root).is_empty());
}

fn saved_master_result(root: &Path, task_dir: &str) -> PathBuf {
    let prim = root.join(task_dir).join("timehist_prim_0001");
    std::fs::create_dir_all(&prim).unwrap();
    write_result(&prim, "th_p_001.frs")
}

#[test]
fn save_leaves_unopened_scenarios_alone() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("model_RDB");
    let master_frs = saved_master_result(&root, "response_0002");

    let archives = manager(&root);
    archives.add_scenario(ScenarioId::Event(1), 1.0).unwrap();
    archives.open(ScenarioId::Event(1)).unwrap();
    let prim = archives
        .ensure_sub_task_dir(ScenarioId::Event(1), &tp("timehist_prim"))
        .unwrap();
    let event_frs = write_result(&prim, "th_p_001.frs");
    archives.sync(ScenarioId::Event(1)).unwrap();

    archives.save(true).unwrap();
    assert!(master_frs.is_file());
    assert!(event_frs.is_file());
    assert_eq!(archives.state(ScenarioId::Master).unwrap(), ArchiveState::Empty);
    assert_eq!(archives.state(ScenarioId::Event(1)).unwrap(), ArchiveState::Saved);
    assert!(!CommittedManifest::path(&root).exists());

    archives.close(true).unwrap();
    assert!(master_frs.is_file());
    assert!(event_frs.is_file());
}

#[test]
fn close_leaves_unopened_master_alone() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("model_RDB");
    let master_frs = saved_master_result(&root, "response_0001");

    let archives = manager(&root);
    archives.add_scenario(ScenarioId::Event(1), 1.0).unwrap();
    let prim = archives
        .ensure_sub_task_dir(ScenarioId::Event(1), &tp("timehist_prim"))
        .unwrap();
    let event_frs = write_result(&prim, "th_p_001.frs");
    archives.sync(ScenarioId::Event(1)).unwrap();

    archives.close(true).unwrap();
    assert!(master_frs.is_file());
    assert!(!event_frs.exists());
}

#[test]
fn first_use_continues_the_saved_version() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("model_RDB");
    let master_frs = saved_master_result(&root, "response_0002");

    let archives = manager(&root);
    let prim = archives
        .ensure_sub_task_dir(ScenarioId::Master, &tp("timehist_prim"))
        .unwrap();
    assert_eq!(prim, root.join("response_0002/timehist_prim_0001"));
    let snapshot = archives.snapshot(ScenarioId::Master).unwrap();
    assert!(snapshot.root().child("timehist_prim").unwrap().contains("th_p_001.frs"));

    archives.save(true).unwrap();
    assert!(master_frs.is_file());
}

#[test]
fn reopen_after_crash_restores_the_saved_version() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("model_RDB");
    let saved = {
        let archives = manager(&root);
        let prim = archives
            .ensure_sub_task_dir(ScenarioId::Master, &tp("timehist_prim"))
            .unwrap();
        let saved = write_result(&prim, "th_p_001.frs");
        archives.sync(ScenarioId::Master).unwrap();
        archives.save(true).unwrap();

        archives.increment(true).unwrap();
        let prim_v2 = archives
            .ensure_sub_task_dir(ScenarioId::Master, &tp("timehist_prim"))
            .unwrap();
        write_result(&prim_v2, "th_p_001.frs");
        archives.sync(ScenarioId::Master).unwrap();
        write_result(&prim, "th_p_002.frs");
        saved
    };
    assert!(root.join("response_0002/timehist_prim_0001/th_p_001.frs").is_file());

    let archives = manager(&root);
    let reopened = archives.open(ScenarioId::Master).unwrap();
    assert_eq!(reopened.version(), 1);
    assert_eq!(
        reopened.relative_files().into_iter().collect::<Vec<_>>(),
        vec![PathBuf::from("timehist_prim_0001/th_p_001.frs")]
    );
    assert_eq!(archives.committed(ScenarioId::Master).unwrap(), reopened);

    archives.close(true).unwrap();
    assert!(saved.is_file());
    assert!(!root.join("response_0002").exists());
    assert!(!root.join("response_0001/timehist_prim_0001/th_p_002.frs").exists());
}

#[test]
fn reset_version_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("model_RDB");
    let archives = manager(&root);
    let prim = archives
        .ensure_sub_task_dir(ScenarioId::Master, &tp("timehist_prim"))
        .unwrap();
    write_result(&prim, "th_p_001.frs");
    archives.sync(ScenarioId::Master).unwrap();
    archives.save(true).unwrap();

    archives.increment(true).unwrap();
    archives.save(true).unwrap();
    assert!(!root.join("response_0001").exists());

    let reopened = manager(&root);
    let archive = reopened.open(ScenarioId::Master).unwrap();
    assert_eq!(archive.version(), 2);
    assert!(archive.is_empty());
    let prim_v2 = reopened
        .ensure_sub_task_dir(ScenarioId::Master, &tp("timehist_prim"))
        .unwrap();
    assert!(prim_v2.starts_with(root.join("response_0002")));
}
