mod common;

use std::cell::RefCell;
use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use common::{FakeHost, existing_image, fresh_target};
use imgseed_core::error::BuildError;
use imgseed_core::orchestrator::{self, BuildRequest, Orchestrator};
use imgseed_core::resources::Resources;
use imgseed_core::stage::StageRegistry;
use imgseed_core::target::{BuildTarget, BuildTargetOptions, MIN_SIZE_MB};
use tempfile::TempDir;

const NAMES: [&str; 8] = [
    "create_image",
    "partition_image",
    "create_filesystems",
    "bootstrap_first_stage",
    "configure_rootfs",
    "install_kernel",
    "copy_overlay",
    "generate_checksum",
];

type Log = Rc<RefCell<Vec<u32>>>;

/// Eight stages that log their level. The first one creates the image file;
/// the one at `fail_at` fails instead.
fn registry(
    log: &Log,
    fail_at: Option<u32>,
    on_run: Option<(u32, Arc<AtomicBool>)>,
) -> StageRegistry {
    let mut reg = StageRegistry::new();
    for (i, name) in NAMES.into_iter().enumerate() {
        let level = i as u32 + 1;
        let log = Rc::clone(log);
        let on_run = on_run.clone();
        reg = reg.stage(name, "test stage", move |target| {
            if fail_at == Some(level) {
                return Err(anyhow::Error::new(BuildError::StageFailure {
                    command: "apt-get -y install tor".into(),
                    status: ExitStatus::from_raw(100 << 8),
                    output: "E: Unable to locate package tor".into(),
                })
                .context("installing packages"));
            }
            if level == 1 {
                fs::File::create(target.image())?.set_len(MIN_SIZE_MB * 1024 * 1024)?;
            }
            if let Some((at, flag)) = &on_run {
                if *at == level {
                    flag.store(true, Ordering::SeqCst);
                }
            }
            log.borrow_mut().push(level);
            Ok(())
        });
    }
    reg
}

fn resources() -> Resources {
    Resources::new(FakeHost::new())
}

fn status_of(target: &BuildTarget) -> String {
    fs::read_to_string(target.status_path()).unwrap()
}

fn run(
    reg: &StageRegistry,
    res: &Resources,
    target: &BuildTarget,
    request: BuildRequest,
) -> imgseed_core::Result<imgseed_core::orchestrator::BuildReport> {
    Orchestrator::new(reg, res).run(target, &request, |_| {}, |_, _| {})
}

#[test]
fn never_built_image_is_at_level_zero_and_builds_fully() {
    let temp = TempDir::new().unwrap();
    let target = fresh_target(temp.path());
    let log = Log::default();
    let reg = registry(&log, None, None);
    let res = resources();
    let orch = Orchestrator::new(&reg, &res);

    assert_eq!(orch.status().read(&target).unwrap(), 0);
    let report = orch
        .run(&target, &BuildRequest::default(), |_| {}, |_, _| {})
        .unwrap();

    assert_eq!(*log.borrow(), (1..=8).collect::<Vec<_>>());
    assert_eq!(report.start_level, 0);
    assert_eq!(report.finish_level, 8);
    assert_eq!(report.stages.len(), 8);
    assert_eq!(status_of(&target), "8\n");
}

#[test]
fn resumes_after_the_recorded_level() {
    let temp = TempDir::new().unwrap();
    let target = existing_image(temp.path(), Some("3\n"));
    let log = Log::default();
    let reg = registry(&log, None, None);
    let res = resources();

    let report = run(&reg, &res, &target, BuildRequest::default()).unwrap();

    assert_eq!(*log.borrow(), [4, 5, 6, 7, 8]);
    assert_eq!(report.stages[0], (4, "bootstrap_first_stage"));
    assert_eq!(status_of(&target), "8\n");
}

#[test]
fn out_of_range_status_is_invalid_state() {
    let temp = TempDir::new().unwrap();
    let target = existing_image(temp.path(), Some("99\n"));
    let log = Log::default();
    let reg = registry(&log, None, None);
    let res = resources();

    let err = run(&reg, &res, &target, BuildRequest::default()).unwrap_err();

    assert!(matches!(err, BuildError::InvalidState { .. }));
    assert!(log.borrow().is_empty());
    assert_eq!(status_of(&target), "99\n");
}

#[test]
fn completed_level_runs_nothing() {
    let temp = TempDir::new().unwrap();
    let target = existing_image(temp.path(), Some("8\n"));
    let log = Log::default();
    let reg = registry(&log, None, None);
    let res = resources();

    let report = run(&reg, &res, &target, BuildRequest::default()).unwrap();

    assert!(report.stages.is_empty());
    assert!(log.borrow().is_empty());
    assert_eq!(status_of(&target), "8\n");
}

#[test]
fn finish_below_current_level_leaves_status_alone() {
    let temp = TempDir::new().unwrap();
    let target = existing_image(temp.path(), Some("5\n"));
    let log = Log::default();
    let reg = registry(&log, None, None);
    let res = resources();

    let request = BuildRequest {
        finish_level: Some(2),
        ..BuildRequest::default()
    };
    let report = run(&reg, &res, &target, request).unwrap();

    assert!(report.stages.is_empty());
    assert!(log.borrow().is_empty());
    assert_eq!(status_of(&target), "5\n");
}

#[test]
fn stops_at_requested_level() {
    let temp = TempDir::new().unwrap();
    let target = fresh_target(temp.path());
    let log = Log::default();
    let reg = registry(&log, None, None);
    let res = resources();

    let request = BuildRequest {
        finish_level: Some(3),
        ..BuildRequest::default()
    };
    run(&reg, &res, &target, request).unwrap();

    assert_eq!(*log.borrow(), [1, 2, 3]);
    assert_eq!(status_of(&target), "3\n");
}

#[test]
fn finish_level_beyond_last_stage_is_rejected_up_front() {
    let temp = TempDir::new().unwrap();
    let target = fresh_target(temp.path());
    let log = Log::default();
    let reg = registry(&log, None, None);
    let res = resources();

    let request = BuildRequest {
        finish_level: Some(9),
        ..BuildRequest::default()
    };
    let err = run(&reg, &res, &target, request).unwrap_err();

    assert!(matches!(err, BuildError::Precondition(_)));
    assert!(log.borrow().is_empty());
    assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
}

#[test]
fn failing_stage_halts_with_status_at_last_success() {
    let temp = TempDir::new().unwrap();
    let target = fresh_target(temp.path());
    let log = Log::default();
    let reg = registry(&log, Some(5), None);
    let res = resources();

    let err = run(&reg, &res, &target, BuildRequest::default()).unwrap_err();

    match &err {
        BuildError::Stage { level, name, .. } => {
            assert_eq!(*level, 5);
            assert_eq!(*name, "configure_rootfs");
        }
        other => panic!("unexpected error: {other}"),
    }
    let (command, output) = BuildError::find_command_failure(&err).unwrap();
    assert_eq!(command, "apt-get -y install tor");
    assert!(output.contains("Unable to locate"));
    assert_eq!(*log.borrow(), [1, 2, 3, 4]);
    assert_eq!(status_of(&target), "4\n");
}

#[test]
fn rerun_after_failure_picks_up_at_the_failed_stage() {
    let temp = TempDir::new().unwrap();
    let target = fresh_target(temp.path());
    let res = resources();

    let first = Log::default();
    let failing = registry(&first, Some(6), None);
    run(&failing, &res, &target, BuildRequest::default()).unwrap_err();

    let second = Log::default();
    let fixed = registry(&second, None, None);
    run(&fixed, &res, &target, BuildRequest::default()).unwrap();

    assert_eq!(*first.borrow(), [1, 2, 3, 4, 5]);
    assert_eq!(*second.borrow(), [6, 7, 8]);
}

#[test]
fn dry_run_plans_without_touching_anything() {
    let temp = TempDir::new().unwrap();
    let target = existing_image(temp.path(), Some("2\n"));
    let log = Log::default();
    let reg = registry(&log, None, None);
    let host = FakeHost::new();
    let res = Resources::new(host.clone());
    let mut callbacks = 0;

    let report = Orchestrator::new(&reg, &res)
        .run(
            &target,
            &BuildRequest {
                dry_run: true,
                ..BuildRequest::default()
            },
            |_| callbacks += 1,
            |_, _| {},
        )
        .unwrap();

    assert!(report.dry_run);
    assert_eq!(report.start_level, 2);
    let levels: Vec<u32> = report.stages.iter().map(|(l, _)| *l).collect();
    assert_eq!(levels, [3, 4, 5, 6, 7, 8]);
    assert!(log.borrow().is_empty());
    assert_eq!(callbacks, 0);
    assert!(host.events().is_empty(), "no loop device or mount was touched");
    assert_eq!(status_of(&target), "2\n");
}

#[test]
fn overwrite_starts_over_from_scratch() {
    let temp = TempDir::new().unwrap();
    let target = existing_image(temp.path(), Some("5\n"));
    let log = Log::default();
    let reg = registry(&log, None, None);
    let host = FakeHost::new();
    host.add_stale_loop(target.image());
    let res = Resources::new(host.clone());

    let report = run(
        &reg,
        &res,
        &target,
        BuildRequest {
            overwrite: true,
            ..BuildRequest::default()
        },
    )
    .unwrap();

    assert_eq!(report.start_level, 0);
    assert_eq!(*log.borrow(), (1..=8).collect::<Vec<_>>());
    assert!(host.loops_for(target.image()).is_empty());
    assert_eq!(status_of(&target), "8\n");
}

#[test]
fn overwrite_recovers_from_a_corrupt_marker() {
    let temp = TempDir::new().unwrap();
    let target = existing_image(temp.path(), Some("garbage\n"));
    let log = Log::default();
    let reg = registry(&log, None, None);
    let res = resources();

    let request = BuildRequest {
        overwrite: true,
        finish_level: Some(1),
        ..BuildRequest::default()
    };
    run(&reg, &res, &target, request).unwrap();

    assert_eq!(*log.borrow(), [1]);
    assert_eq!(status_of(&target), "1\n");
}

#[test]
fn dry_run_overwrite_deletes_nothing() {
    let temp = TempDir::new().unwrap();
    let target = existing_image(temp.path(), Some("5\n"));
    let log = Log::default();
    let reg = registry(&log, None, None);
    let res = resources();

    let report = run(
        &reg,
        &res,
        &target,
        BuildRequest {
            overwrite: true,
            dry_run: true,
            ..BuildRequest::default()
        },
    )
    .unwrap();

    assert_eq!(report.start_level, 0);
    assert_eq!(report.stages.len(), 8);
    assert!(target.image().exists());
    assert_eq!(status_of(&target), "5\n");
}

#[test]
fn interrupt_stops_between_stages() {
    let temp = TempDir::new().unwrap();
    let target = fresh_target(temp.path());
    let log = Log::default();
    let flag = Arc::new(AtomicBool::new(false));
    let reg = registry(&log, None, Some((2, flag.clone())));
    let res = resources();

    let err = Orchestrator::new(&reg, &res)
        .with_interrupt(flag)
        .run(&target, &BuildRequest::default(), |_| {}, |_, _| {})
        .unwrap_err();

    assert!(matches!(err, BuildError::Interrupted { level: 2 }));
    assert_eq!(*log.borrow(), [1, 2], "the running stage is not cancelled");
    assert_eq!(status_of(&target), "2\n");
}

#[test]
fn progress_callbacks_bracket_each_stage() {
    let temp = TempDir::new().unwrap();
    let target = existing_image(temp.path(), Some("6\n"));
    let log = Log::default();
    let reg = registry(&log, None, None);
    let res = resources();
    let events = RefCell::new(Vec::new());

    Orchestrator::new(&reg, &res)
        .run(
            &target,
            &BuildRequest::default(),
            |s| events.borrow_mut().push(format!("start {}", s.name)),
            |s, _| events.borrow_mut().push(format!("done {}", s.name)),
        )
        .unwrap();

    assert_eq!(
        events.into_inner(),
        [
            "start copy_overlay",
            "done copy_overlay",
            "start generate_checksum",
            "done generate_checksum",
        ]
    );
}

/// An image cut short while stage 1 was still writing it: too small and
/// without a marker.
fn half_written_image(dir: &std::path::Path) -> BuildTarget {
    let image = dir.join("seed.img");
    fs::File::create(&image)
        .unwrap()
        .set_len(300 * 1024 * 1024)
        .unwrap();
    BuildTarget::new(BuildTargetOptions::new(&image)).unwrap()
}

#[test]
fn half_written_image_can_be_purged() {
    let temp = TempDir::new().unwrap();
    let target = half_written_image(temp.path());
    let host = FakeHost::new();
    host.add_stale_loop(target.image());
    let res = Resources::new(host.clone());

    orchestrator::purge(&res, &target).unwrap();

    assert!(!target.image().exists());
    assert!(host.loops_for(target.image()).is_empty());
}

#[test]
fn half_written_image_is_rebuilt_with_overwrite() {
    let temp = TempDir::new().unwrap();
    let target = half_written_image(temp.path());
    let log = Log::default();
    let reg = registry(&log, None, None);
    let res = resources();

    let request = BuildRequest {
        overwrite: true,
        finish_level: Some(2),
        ..BuildRequest::default()
    };
    run(&reg, &res, &target, request).unwrap();

    assert_eq!(*log.borrow(), [1, 2]);
    assert_eq!(status_of(&target), "2\n");
}

#[test]
fn undersized_image_is_not_resumed() {
    let temp = TempDir::new().unwrap();
    let target = half_written_image(temp.path());
    fs::write(target.status_path(), "1\n").unwrap();
    let log = Log::default();
    let reg = registry(&log, None, None);
    let res = resources();

    let err = run(&reg, &res, &target, BuildRequest::default()).unwrap_err();

    assert!(matches!(err, BuildError::Precondition(_)));
    assert!(log.borrow().is_empty());
    assert_eq!(status_of(&target), "1\n");
}
