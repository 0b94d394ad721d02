//! Scheduling behavior of the process group manager against scripted solvers

use rcy_archive::ScenarioId;
use rcy_core::{
    GageStage, KillScope, PartId, RecoveryBatch, RecoveryConfig, RecoveryError, SolverStage,
    StageEvent, StageKind, StaticModel, StressOptions, VtfExport,
};
use rcy_test_utils::{part, Harness, ProgramScript, ScriptedLauncher};
use std::path::PathBuf;
use std::time::Duration;

const SOLVER: &str = "fedem_solver";
const GAGE: &str = "fedem_gage";

fn model() -> StaticModel {
    StaticModel::default()
        .with_part(part("part1", 1, 2))
        .with_part(part("part2", 2, 1))
        .with_part(part("part3", 3, 1))
        .with_part(part("part4", 4, 1))
}

fn concurrent(max: usize) -> RecoveryConfig {
    RecoveryConfig::new().with_max_concurrent_processes(max)
}

async fn next_waiting(h: &mut Harness, ticket: rcy_core::StageTicket) -> u32 {
    let wait = async {
        loop {
            if let StageEvent::Waiting { ticket: t, attempt, .. } = h.events.recv().await.unwrap() {
                if t == ticket {
                    return attempt;
                }
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait).await.unwrap()
}

#[tokio::test]
async fn gage_waits_for_running_solver_then_runs() {
    let launcher = ScriptedLauncher::new().with_script(SOLVER, ProgramScript::new().writes("part1_001.frs"));
    let mut h = Harness::new(model(), concurrent(2), launcher);
    let event = h.add_event(1, 0.3);

    let solve = h.manager.submit(Box::new(SolverStage::new(event)));
    h.launcher.wait_for_live(1).await;
    assert!(h.manager.is_group_running(StageKind::Solver, event));
    assert!(!h.manager.is_group_running(StageKind::Solver, ScenarioId::Master));

    let gage = h.manager.submit(Box::new(GageStage::new(event, PartId::new("part1"))));
    assert_eq!(next_waiting(&mut h, gage).await, 1);
    assert_eq!(h.launcher.launched_programs(), vec![SOLVER]);

    assert!(h.launcher.finish(SOLVER, 0));
    assert!(matches!(h.terminal_event(solve).await, StageEvent::Finished { exit_code: 0, .. }));

    h.launcher.wait_for_launches(2).await;
    let request = &h.launcher.launched()[1];
    assert_eq!(request.program, GAGE);
    let run_dir = request.working_dir.clone().unwrap();
    assert!(run_dir.ends_with("event_001/response_0001/timehist_gage_rcy_0001/part1_0001"));

    let fco = std::fs::read_to_string(run_dir.join("fedem_gage.fco")).unwrap();
    assert!(fco.contains("../../timehist_prim_0001/part1_001.frs"), "{fco}");
    assert!(fco.contains("-fsifile \"../../fedem_solver.fsi\""), "{fco}");
    assert!(run_dir.join("fedem_gage.fsi").is_file());
    assert!(h.fs.was_written(&run_dir.join("fedem_gage.fsi")));
    assert!(h.fs.was_written(&run_dir.join("fedem_gage.fco")));

    assert!(h.launcher.finish(GAGE, 0));
    assert!(matches!(h.terminal_event(gage).await, StageEvent::Finished { .. }));
    assert_eq!(h.progress.depth(), 0);
}

#[tokio::test]
async fn gage_is_not_executable_after_failed_solve() {
    let launcher = ScriptedLauncher::new();
    let mut h = Harness::new(model(), concurrent(2), launcher);
    let event = h.add_event(1, 0.3);

    let solve = h.manager.submit(Box::new(SolverStage::new(event)));
    h.launcher.wait_for_live(1).await;
    let gage = h.manager.submit(Box::new(GageStage::new(event, PartId::new("part1"))));
    next_waiting(&mut h, gage).await;

    assert!(h.launcher.finish(SOLVER, 1));
    assert!(matches!(h.terminal_event(solve).await, StageEvent::Finished { exit_code: 1, .. }));

    match h.terminal_event(gage).await {
        StageEvent::Failed { reason, .. } => assert!(reason.contains("No solver results"), "{reason}"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.launcher.launched_programs(), vec![SOLVER]);
}

#[tokio::test]
async fn gage_without_any_solve_fails_at_once() {
    let mut h = Harness::new(model(), concurrent(1), ScriptedLauncher::new());
    let gage = h
        .manager
        .submit(Box::new(GageStage::new(ScenarioId::Master, PartId::new("part1"))));
    match h.terminal_event(gage).await {
        StageEvent::Failed { reason, .. } => {
            assert!(reason.contains("Run the dynamics solver first"), "{reason}");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(h.launcher.launched().is_empty());
}

#[tokio::test]
async fn part_without_rosettes_is_skipped() {
    let model = StaticModel::default().with_part(part("plate", 7, 0));
    let mut h = Harness::new(model, concurrent(1), ScriptedLauncher::new());
    let gage = h
        .manager
        .submit(Box::new(GageStage::new(ScenarioId::Master, PartId::new("plate"))));
    assert!(matches!(h.terminal_event(gage).await, StageEvent::Skipped { .. }));
}

#[tokio::test]
async fn concurrency_ceiling_holds() {
    let launcher = ScriptedLauncher::new()
        .with_script(SOLVER, ProgramScript::new().writes("th_p_001.frs").exits_after(Duration::from_millis(10), 0))
        .with_script(GAGE, ProgramScript::new().exits_after(Duration::from_millis(30), 0));
    let mut h = Harness::new(model(), concurrent(2), launcher);

    let solve = h.manager.submit(Box::new(SolverStage::new(ScenarioId::Master)));
    h.terminal_event(solve).await;

    let parts: Vec<PartId> = ["part1", "part2", "part3", "part4"].into_iter().map(PartId::new).collect();
    let batch = RecoveryBatch::per_part(StageKind::Gage, &[ScenarioId::Master], &parts).unwrap();
    let tickets = h.manager.submit_batch(batch).unwrap();
    assert_eq!(tickets.len(), 4);
    assert!(h.manager.stats().queued >= 2);

    tokio::time::timeout(Duration::from_secs(10), h.manager.wait_idle())
        .await
        .unwrap();
    assert_eq!(h.launcher.launched().len(), 5);
    assert_eq!(h.launcher.max_live(), 2);
    assert_eq!(h.manager.stats().total_finished, 5);
}

#[tokio::test]
async fn kill_all_leaves_other_scenarios_alone() {
    let mut h = Harness::new(model(), concurrent(3), ScriptedLauncher::new());
    let first = h.add_event(1, 0.5);
    let second = h.add_event(2, 0.5);

    let doomed = h.manager.submit(Box::new(SolverStage::new(first)));
    let survivor = h.manager.submit(Box::new(SolverStage::new(second)));
    h.launcher.wait_for_live(2).await;

    assert_eq!(h.manager.kill_all(KillScope::Scenario(first), true), 1);
    assert!(matches!(h.terminal_event(doomed).await, StageEvent::Cancelled { .. }));
    h.launcher.wait_for_live(1).await;

    assert!(!h.manager.is_scenario_running(first));
    assert!(h.manager.is_scenario_running(second));
    assert_eq!(h.progress.depth(), 1);

    assert!(h.launcher.finish(SOLVER, 0));
    assert!(matches!(h.terminal_event(survivor).await, StageEvent::Finished { exit_code: 0, .. }));
    tokio::time::timeout(Duration::from_secs(10), h.manager.wait_idle())
        .await
        .unwrap();
    assert_eq!(h.progress.depth(), 0);
}

#[tokio::test]
async fn kill_without_cascade_keeps_running_processes() {
    let mut h = Harness::new(model(), concurrent(2), ScriptedLauncher::new());
    let solve = h.manager.submit(Box::new(SolverStage::new(ScenarioId::Master)));
    h.launcher.wait_for_live(1).await;
    let gage = h
        .manager
        .submit(Box::new(GageStage::new(ScenarioId::Master, PartId::new("part1"))));
    next_waiting(&mut h, gage).await;

    assert_eq!(h.manager.kill_all(KillScope::All, false), 1);
    assert!(matches!(h.terminal_event(gage).await, StageEvent::Cancelled { .. }));
    assert_eq!(h.launcher.live_count(), 1);

    assert!(h.launcher.finish(SOLVER, 0));
    assert!(matches!(h.terminal_event(solve).await, StageEvent::Finished { .. }));
}

#[tokio::test]
async fn shared_vtf_output_is_rejected_when_concurrent() {
    let mut h = Harness::new(model(), concurrent(2), ScriptedLauncher::new());
    let solve = h.manager.submit(Box::new(SolverStage::new(ScenarioId::Master)));
    h.launcher.wait_for_live(1).await;
    let gage = h
        .manager
        .submit(Box::new(GageStage::new(ScenarioId::Master, PartId::new("part1"))));
    next_waiting(&mut h, gage).await;

    let options = StressOptions {
        vtf: Some(VtfExport {
            file: PathBuf::from("stress.vtf"),
            express: false,
            expected_steps: 100,
        }),
        ..StressOptions::default()
    };
    let parts = [PartId::new("part1"), PartId::new("part2")];
    let batch = RecoveryBatch::stress_recovery(&[ScenarioId::Master], &parts, &options);

    let err = h.manager.submit_batch(batch).unwrap_err();
    assert!(matches!(err, RecoveryError::SharedOutputConflict { parts: 2, .. }));
    assert!(matches!(h.terminal_event(gage).await, StageEvent::Cancelled { .. }));
    assert_eq!(h.launcher.launched_programs(), vec![SOLVER]);

    h.launcher.finish(SOLVER, 0);
    h.terminal_event(solve).await;
}

#[tokio::test]
async fn shared_vtf_output_is_fine_when_sequential() {
    let options = StressOptions {
        vtf: Some(VtfExport {
            file: PathBuf::from("stress.vtf"),
            express: false,
            expected_steps: 100,
        }),
        ..StressOptions::default()
    };
    let h = Harness::new(model(), concurrent(1), ScriptedLauncher::new());
    let parts = [PartId::new("part1"), PartId::new("part2")];
    let batch = RecoveryBatch::stress_recovery(&[ScenarioId::Master], &parts, &options);
    assert_eq!(h.manager.submit_batch(batch).unwrap().len(), 2);
}

#[tokio::test]
async fn duplicate_submission_is_dropped() {
    let mut h = Harness::new(model(), concurrent(2), ScriptedLauncher::new());
    let first = h.manager.submit(Box::new(SolverStage::new(ScenarioId::Master)));
    h.launcher.wait_for_live(1).await;
    let second = h.manager.submit(Box::new(SolverStage::new(ScenarioId::Master)));

    match h.terminal_event(second).await {
        StageEvent::Skipped { key, .. } => assert_eq!(key.kind, StageKind::Solver),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.launcher.launched().len(), 1);

    h.launcher.finish(SOLVER, 0);
    h.terminal_event(first).await;
}

#[tokio::test]
async fn resubmission_waits_until_killed_process_is_reaped() {
    let mut h = Harness::new(model(), concurrent(2), ScriptedLauncher::new());
    let doomed = h.manager.submit(Box::new(SolverStage::new(ScenarioId::Master)));
    h.launcher.wait_for_live(1).await;

    assert_eq!(h.manager.kill_all(KillScope::All, true), 1);
    let early = h.manager.submit(Box::new(SolverStage::new(ScenarioId::Master)));
    assert!(matches!(h.terminal_event(doomed).await, StageEvent::Cancelled { .. }));
    assert!(matches!(h.terminal_event(early).await, StageEvent::Skipped { .. }));
    assert_eq!(h.launcher.launched().len(), 1);

    tokio::time::timeout(Duration::from_secs(10), h.manager.wait_idle())
        .await
        .unwrap();
    let retry = h.manager.submit(Box::new(SolverStage::new(ScenarioId::Master)));
    h.launcher.wait_for_live(1).await;
    assert_eq!(h.launcher.launched().len(), 2);
    assert!(h.launcher.finish(SOLVER, 0));
    assert!(matches!(h.terminal_event(retry).await, StageEvent::Finished { exit_code: 0, .. }));
}

#[tokio::test]
async fn dependency_retries_are_bounded_when_configured() {
    let config = concurrent(2).with_max_dependency_retries(2);
    let mut h = Harness::new(model(), config, ScriptedLauncher::new());
    let solve = h.manager.submit(Box::new(SolverStage::new(ScenarioId::Master)));
    h.launcher.wait_for_live(1).await;

    let gage = h
        .manager
        .submit(Box::new(GageStage::new(ScenarioId::Master, PartId::new("part1"))));
    match h.terminal_event(gage).await {
        StageEvent::Failed { reason, .. } => assert!(reason.contains("gave up waiting"), "{reason}"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(h.manager.is_group_running(StageKind::Solver, ScenarioId::Master));

    h.launcher.finish(SOLVER, 0);
    h.terminal_event(solve).await;
}

#[tokio::test]
async fn spawn_failure_is_reported_with_command_line() {
    let launcher = ScriptedLauncher::new().with_script(SOLVER, ProgramScript::fails_to_spawn());
    let mut h = Harness::new(model(), concurrent(1), launcher);
    let solve = h.manager.submit(Box::new(SolverStage::new(ScenarioId::Master)));
    match h.terminal_event(solve).await {
        StageEvent::Failed { reason, .. } => {
            assert!(reason.contains("fedem_solver -fco fedem_solver.fco"), "{reason}");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(h.progress.listed().iter().any(|line| line.contains("Could not start")));
    assert_eq!(h.progress.depth(), 0);
}

#[tokio::test]
async fn unknown_scenario_fails() {
    let mut h = Harness::new(model(), concurrent(1), ScriptedLauncher::new());
    let solve = h.manager.submit(Box::new(SolverStage::new(ScenarioId::Event(9))));
    assert!(matches!(h.terminal_event(solve).await, StageEvent::Failed { .. }));
    assert!(h.manager.is_idle());
}
