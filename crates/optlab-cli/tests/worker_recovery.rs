use chrono::Utc;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use optlab_core::{ensure_dir, job_file_path, load_job, Experiment, JobId, JobStatus, Variable};
use optlab_runner::{
    all_ids, attempt_dispatch, check_experiment_dirs, DispatchOptions, DriverConfig,
    FileGridStore, GridStore, LocalDriver, SequentialChooser,
};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

// Job 0 hangs on its first attempt and records its pid so it can be killed;
// every other evaluation prints `<id>.5`.
const OBJECTIVE: &str = r#"#!/bin/sh
cat > /dev/null
if [ "$OPTLAB_JOB_ID" = "0" ] && [ ! -e attempted-0 ]; then
  touch attempted-0
  echo $$ > objective-0.pid
  exec sleep 30
fi
echo "$OPTLAB_JOB_ID.5"
"#;

fn temp_expt(tag: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!(
        "optlab_worker_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    ensure_dir(&root).expect("temp dir");
    check_experiment_dirs(&root).expect("experiment dirs");
    let script = root.join("objective.sh");
    fs::write(&script, OBJECTIVE).expect("objective");
    let mut perms = fs::metadata(&script).expect("meta").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script, perms).expect("chmod");
    root
}

fn experiment() -> Experiment {
    Experiment {
        name: "recovery".into(),
        main_file: "objective.sh".into(),
        variables: vec![Variable::Float {
            name: "x".into(),
            size: 1,
            min: 0.0,
            max: 1.0,
        }],
    }
}

fn assert_partition(store: &FileGridStore, grid_size: usize) {
    let state = store.load_state().expect("state");
    assert_eq!(
        all_ids(&state),
        (0..grid_size as JobId).collect::<Vec<_>>(),
        "each id must be in exactly one set: {:?}",
        state
    );
}

fn wait_for(path: &Path, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

fn kill_pid(pid: i32) {
    let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
}

#[test]
fn killed_worker_is_recovered_and_job_completes_on_resubmission() {
    let root = temp_expt("killed");
    let expt = experiment();
    let grid_size = 3;
    let store = FileGridStore::create_or_open(&root, &expt.variables, grid_size, 9).expect("grid");
    // Long enough that quick workers finish and report before the dispatcher
    // records their handle.
    let config = DriverConfig::new(env!("CARGO_BIN_EXE_optlab"), vec!["run-job".to_string()])
        .with_startup_grace(Duration::from_millis(300));
    let driver = LocalDriver::new(&config);
    let mut chooser = SequentialChooser;
    let options = DispatchOptions {
        max_concurrent: 1,
        ..Default::default()
    };

    // First submission of job 0 hangs inside the objective.
    assert!(attempt_dispatch(&expt, &root, &mut chooser, &driver, &store, &options).expect("dispatch"));
    assert_partition(&store, grid_size);
    assert!(
        wait_for(&root.join("objective-0.pid"), Duration::from_secs(10)),
        "objective for job 0 never started"
    );
    let state = store.load_state().expect("state");
    assert_eq!(state.pending, vec![0]);
    let worker = state.handles.get(&0).copied().expect("handle for job 0");
    assert_eq!(
        load_job(&job_file_path(&root, 0)).expect("record").status,
        JobStatus::Running
    );

    // Back-pressure while job 0 is in flight.
    assert!(attempt_dispatch(&expt, &root, &mut chooser, &driver, &store, &options).expect("dispatch"));
    assert_eq!(store.get_pending().expect("pending"), vec![0]);
    assert_partition(&store, grid_size);

    let objective_pid: i32 = fs::read_to_string(root.join("objective-0.pid"))
        .expect("pid file")
        .trim()
        .parse()
        .expect("pid");
    kill_pid(worker.0 as i32);
    kill_pid(objective_pid);

    let deadline = Instant::now() + Duration::from_secs(60);
    let mut iterations = 0;
    loop {
        assert!(Instant::now() < deadline, "dispatch did not finish");
        let keep_going =
            attempt_dispatch(&expt, &root, &mut chooser, &driver, &store, &options).expect("dispatch");
        iterations += 1;
        assert_partition(&store, grid_size);
        let state = store.load_state().expect("state");
        assert!(state.broken.is_empty(), "lost job must never become broken");
        if !keep_going {
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }
    assert!(iterations >= 3);

    let state = store.load_state().expect("state");
    assert_eq!(state.complete, vec![0, 1, 2]);
    assert!(state.candidates.is_empty());
    assert!(state.pending.is_empty());
    for id in 0..grid_size as JobId {
        assert_eq!(state.snapshot.values[id as usize], id as f64 + 0.5);
        let record = load_job(&job_file_path(&root, id)).expect("record");
        assert_eq!(record.status, JobStatus::Complete);
        assert_eq!(record.value, Some(id as f64 + 0.5));
        assert!(record.end_t.expect("end") > record.start_t.expect("start"));
    }
    let _ = fs::remove_dir_all(root);
}

#[test]
fn worker_that_finishes_before_handle_is_recorded_stays_complete() {
    let root = temp_expt("quick");
    let expt = experiment();
    let store = FileGridStore::create_or_open(&root, &expt.variables, 2, 4).expect("grid");
    // Skip the hanging first attempt of job 0.
    fs::write(root.join("attempted-0"), "").expect("marker");
    let config = DriverConfig::new(env!("CARGO_BIN_EXE_optlab"), vec!["run-job".to_string()])
        .with_startup_grace(Duration::from_millis(2000));
    let driver = LocalDriver::new(&config);
    let options = DispatchOptions::default();

    assert!(
        attempt_dispatch(&expt, &root, &mut SequentialChooser, &driver, &store, &options).expect("dispatch")
    );
    let state = store.load_state().expect("state");
    assert_eq!(state.complete, vec![0], "worker reported before set_submitted");
    assert!(state.handles.contains_key(&0));
    assert_partition(&store, 2);

    // The next iteration dispatches job 1 and leaves job 0 complete.
    assert!(
        attempt_dispatch(&expt, &root, &mut SequentialChooser, &driver, &store, &options).expect("dispatch")
    );
    let state = store.load_state().expect("state");
    assert!(state.complete.contains(&0));
    assert_partition(&store, 2);
    let _ = fs::remove_dir_all(root);
}
