//! Dispatches submissions to a pool of threads or worker processes.
//!
//! The coordinator owns the summary file and writes every result file, so
//! workers only ever touch their own working tree and output directory.

use itertools::Itertools;
use std::{
    collections::VecDeque,
    ffi::OsString,
    io::Write,
    path::{Path, PathBuf},
    sync::{mpsc, Mutex, PoisonError},
    time::Duration,
};
use subprocess::{ExitStatus, Popen, PopenConfig};

use crate::builder;
use crate::error::Error;
use crate::logging::SubmissionLog;
use crate::report;
use crate::settings::{LogOptions, Settings};
use crate::submission::{discover, prepare_and_test, Submission, SubmissionOutcome};
use crate::suite::{guarded, Suite};
use crate::utils::create_dir_if_not_exists;
use crate::vm::VmBackend;

/// File a worker process leaves its outcome in, inside the submission's
/// output directory.
pub const OUTCOME_FILE: &str = "outcome.json";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Directory holding the suite file, handed to worker processes.
    pub suite_path: PathBuf,
    /// Directory containing one subdirectory per submission.
    pub target_path: PathBuf,
    /// Glob selecting submission directory names.
    pub pattern: String,
    pub threaded: bool,
    pub jobs: usize,
    pub log: LogOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSummary {
    pub graded: usize,
    pub failed: usize,
}

/// Working tree of one pool slot.
pub fn slot_workspace(settings: &Settings, slot: usize, slots: usize) -> PathBuf {
    if slots <= 1 {
        PathBuf::from(&settings.build.destination)
    } else {
        PathBuf::from(format!("{}-{slot}", settings.build.destination))
    }
}

/// Builds the framework when the suite file asks for it.
fn build_framework(settings: &Settings) -> Result<(), Error> {
    let b = &settings.build;
    let Some(src) = b.framework_src.as_ref().or(b.framework_bin.as_ref()) else {
        return Ok(());
    };
    if !b.has_commands() {
        return Ok(());
    }
    log::info!("Building framework in {src}...");
    builder::build(Path::new(src), b.framework_bin.as_deref().map(Path::new), b)
        .map_err(|e| Error::from(format!("Could not build the framework: {e}")))
}

/// Grades every submission under the target directory.
///
/// Framework build and initialization errors are returned before any
/// submission is touched. Everything that goes wrong afterwards is recorded
/// in the submission's results and the run continues.
pub fn run<S: Suite>(suite: &S, settings: &Settings, opts: &RunOptions) -> Result<RunSummary, Error> {
    let submissions = discover(&opts.target_path, &opts.pattern)
        .inspect_err(|e| log::error!("Could not list submissions in {:?}: {e}", opts.target_path))?;
    log::info!("Found {} submission(s)", submissions.len());
    log::debug!("Submissions: {}", submissions.iter().map(|s| &s.name).join(", "));

    create_dir_if_not_exists(settings.result_path())?;
    if let Err(e) = report::init_summary(settings.summary_path()) {
        log::warn!("Could not create the summary file: {e}");
    }

    build_framework(settings)?;
    let framework = guarded(|| suite.initialize_framework(settings))
        .map_err(|e| Error::from(format!("Could not initialize the framework: {e}")))?;

    let jobs = opts.jobs.max(1).min(submissions.len().max(1));
    let vm = settings.vm.as_ref().map(VmBackend::from_settings);
    let summary = if opts.threaded || vm.is_some() {
        if !opts.threaded {
            log::info!("A remote machine is configured, grading on threads");
        }
        Ok(thread_pool(suite, &framework, settings, opts, submissions, jobs, vm))
    } else {
        save_framework::<S>(&framework)
            .map(|state| process_pool(settings, opts, state.path(), submissions, jobs))
    };

    if let Err(e) = guarded(|| {
        suite.shutdown_framework(framework);
        Ok(())
    }) {
        log::error!("Error shutting down the framework: {e}");
    }
    let summary = summary?;
    log::info!(
        "Graded {} submission(s), {} could not be graded",
        summary.graded,
        summary.failed
    );
    Ok(summary)
}

/// Writes the framework context to a temporary file for the worker
/// processes. The file is removed when the returned handle is dropped.
fn save_framework<S: Suite>(framework: &S::Framework) -> Result<tempfile::NamedTempFile, Error> {
    let mut state = tempfile::Builder::new()
        .prefix("framework-")
        .suffix(".json")
        .tempfile()?;
    serde_json::to_writer(state.as_file_mut(), framework)?;
    state.as_file_mut().flush()?;
    log::debug!("Framework state saved to {:?}", state.path());
    Ok(state)
}

/// Reads back the framework context saved by the coordinator.
fn load_framework<S: Suite>(path: &Path) -> Result<S::Framework, Error> {
    let contents = std::fs::read_to_string(path)
        .inspect_err(|e| log::error!("Could not read the framework state {path:?}: {e}"))?;
    Ok(serde_json::from_str(&contents)?)
}

/// Creates the output directory and an empty error log for a submission.
fn prepare_output(settings: &Settings, submission: &Submission) -> PathBuf {
    let dir = settings.output_dir(&submission.name);
    if let Err(e) = create_dir_if_not_exists(&dir) {
        log::error!("Could not create {dir:?}: {e}");
    }
    let log_path = dir.join(&settings.general.error_log);
    if let Err(e) = std::fs::File::create(&log_path) {
        log::warn!("Could not create {log_path:?}: {e}");
    }
    log_path
}

/// Writes the result file and the summary row of a finished submission.
fn record(settings: &Settings, submission: &Submission, outcome: &SubmissionOutcome, summary: &mut RunSummary) {
    let result_file = settings
        .output_dir(&submission.name)
        .join(&settings.general.result_file);
    if let Err(e) = report::write_result(&result_file, submission, outcome) {
        log::warn!("Could not write {result_file:?}: {e}");
    }
    if let Err(e) = report::append_summary(settings.summary_path(), submission, outcome) {
        log::warn!("Could not add {} to the summary: {e}", submission.name);
    }
    if outcome.failure.is_some() {
        summary.failed += 1;
    }
    summary.graded += 1;
    log::info!("Finished {} with score {:.2}", submission.name, outcome.total());
}

/// Grades one submission on the current thread, logging into its error log.
pub fn grade_submission<S: Suite>(
    suite: &S,
    submission: &Submission,
    framework: &S::Framework,
    settings: &Settings,
    debug: bool,
    vm: Option<&mut VmBackend>,
) -> SubmissionOutcome {
    let log_path = settings
        .output_dir(&submission.name)
        .join(&settings.general.error_log);
    let _log = SubmissionLog::append(&log_path, debug)
        .inspect_err(|e| log::warn!("Could not open {log_path:?}: {e}"))
        .ok();
    log::info!("Grading {}...", submission.name);
    prepare_and_test(suite, submission, framework, settings, vm)
}

fn thread_pool<S: Suite>(
    suite: &S,
    framework: &S::Framework,
    settings: &Settings,
    opts: &RunOptions,
    submissions: Vec<Submission>,
    jobs: usize,
    vm: Option<VmBackend>,
) -> RunSummary {
    // Output directories are prepared ahead of dispatch so that logs
    // written by the workers are never truncated.
    for submission in submissions.iter() {
        prepare_output(settings, submission);
    }
    let queue: Mutex<VecDeque<Submission>> = Mutex::new(submissions.into());
    let vm = vm.map(Mutex::new);
    let mut summary = RunSummary::default();

    std::thread::scope(|sc| {
        let (done_send, done_recv) = mpsc::channel::<(Submission, SubmissionOutcome)>();
        for slot in 0..jobs {
            let done_send = done_send.clone();
            let queue = &queue;
            let vm = vm.as_ref();
            let slot_settings = settings.for_workspace(slot_workspace(settings, slot, jobs));
            sc.spawn(move || loop {
                let next = queue
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pop_front();
                let Some(submission) = next else {
                    break;
                };
                let outcome = match vm {
                    Some(vm) => {
                        let mut backend = vm.lock().unwrap_or_else(PoisonError::into_inner);
                        grade_submission(
                            suite,
                            &submission,
                            framework,
                            &slot_settings,
                            opts.log.debug,
                            Some(&mut backend),
                        )
                    }
                    None => grade_submission(
                        suite,
                        &submission,
                        framework,
                        &slot_settings,
                        opts.log.debug,
                        None,
                    ),
                };
                if done_send.send((submission, outcome)).is_err() {
                    log::error!("Coordinator stopped listening (slot {slot})");
                    break;
                }
            });
        }
        drop(done_send);

        for (submission, outcome) in done_recv {
            record(settings, &submission, &outcome, &mut summary);
        }
    });
    summary
}

/// Command line of a worker process grading `submission` in `workspace`.
fn worker_command(
    exe: &Path,
    opts: &RunOptions,
    submission: &Submission,
    workspace: &Path,
    framework: &Path,
) -> Vec<OsString> {
    let mut cmd: Vec<OsString> = vec![
        exe.into(),
        opts.suite_path.clone().into(),
        opts.target_path.clone().into(),
        "--worker".into(),
        submission.path.clone().into(),
        "--workspace".into(),
        workspace.into(),
        "--framework".into(),
        framework.into(),
    ];
    for (enabled, flag) in [
        (opts.log.quiet, "--quiet"),
        (opts.log.warn, "--warn"),
        (opts.log.debug, "--debug"),
    ] {
        if enabled {
            cmd.push(flag.into());
        }
    }
    cmd
}

/// Reads back the outcome a worker process left behind.
fn collect_outcome(settings: &Settings, submission: &Submission, status: ExitStatus) -> SubmissionOutcome {
    let path = settings.output_dir(&submission.name).join(OUTCOME_FILE);
    if !status.success() {
        log::error!("Worker for {} ended with {status:?}", submission.name);
    }
    let outcome = std::fs::read_to_string(&path)
        .map_err(Error::from)
        .and_then(|s| serde_json::from_str::<SubmissionOutcome>(&s).map_err(Error::from));
    match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            log::error!("No outcome from the worker for {}: {e}", submission.name);
            SubmissionOutcome::failed(format!("worker ended with {status:?}"))
        }
    }
}

fn process_pool(
    settings: &Settings,
    opts: &RunOptions,
    framework: &Path,
    submissions: Vec<Submission>,
    jobs: usize,
) -> RunSummary {
    let mut summary = RunSummary::default();
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            log::error!("Could not locate the grader binary: {e}");
            for submission in submissions.iter() {
                prepare_output(settings, submission);
                let outcome = SubmissionOutcome::failed("could not start a worker process");
                record(settings, submission, &outcome, &mut summary);
            }
            return summary;
        }
    };

    let mut queue: VecDeque<Submission> = submissions.into();
    // Using .take() to free a slot once its worker has been collected
    let mut slots: Vec<Option<(Submission, Popen)>> = (0..jobs).map(|_| None).collect();

    while !queue.is_empty() || slots.iter().any(Option::is_some) {
        for (slot, handle) in slots.iter_mut().enumerate() {
            if let Some((submission, proc)) = handle.as_mut() {
                if let Some(status) = proc.poll() {
                    let outcome = collect_outcome(settings, submission, status);
                    record(settings, submission, &outcome, &mut summary);
                    handle.take();
                }
            }
            if handle.is_some() {
                continue;
            }
            let Some(submission) = queue.pop_front() else {
                continue;
            };

            prepare_output(settings, &submission);
            let stale = settings.output_dir(&submission.name).join(OUTCOME_FILE);
            if stale.exists() {
                if let Err(e) = std::fs::remove_file(&stale) {
                    log::warn!("Could not remove {stale:?}: {e}");
                }
            }

            let workspace = slot_workspace(settings, slot, jobs);
            let cmd = worker_command(&exe, opts, &submission, &workspace, framework);
            log::debug!("Spawning worker {slot} for {}", submission.name);
            match Popen::create(cmd.as_slice(), PopenConfig::default()) {
                Ok(proc) => {
                    *handle = Some((submission, proc));
                }
                Err(e) => {
                    log::error!("Could not start a worker for {}: {e}", submission.name);
                    let outcome = SubmissionOutcome::failed(format!("could not start worker: {e}"));
                    record(settings, &submission, &outcome, &mut summary);
                }
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    summary
}

/// Entry point of a worker process: grades a single submission in the given
/// working tree and leaves the outcome in the submission's output directory.
///
/// The framework context comes from the file the coordinator saved; the
/// coordinator also shuts it down.
pub fn run_worker<S: Suite>(
    suite: &S,
    settings: &Settings,
    submission: &Path,
    workspace: &Path,
    framework: &Path,
    debug: bool,
) -> Result<(), Error> {
    let submission = Submission::new(submission)?;
    let settings = settings.for_workspace(workspace);
    let framework = load_framework::<S>(framework)?;

    let outcome = grade_submission(suite, &submission, &framework, &settings, debug, None);

    let path = settings.output_dir(&submission.name).join(OUTCOME_FILE);
    std::fs::write(&path, serde_json::to_string(&outcome)?)
        .inspect_err(|e| log::error!("Could not write {path:?}: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::tests::FakeSuite;
    use crate::suite::{TestCount, TestSet, Verdict};
    use asserting::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn suite() -> FakeSuite {
        let set = TestSet::<FakeSuite>::builder("Files", "files", TestCount::Fixed(2), |i, scope| {
            let root = Path::new(&scope.settings.build.destination);
            Ok(Verdict::from(root.join(["main.c", "README"][i]).exists()))
        })
        .max_score(10.0)
        .build()
        .unwrap();
        FakeSuite {
            sets: vec![set],
            fail_subject: false,
        }
    }

    fn layout(names: &[&str]) -> (tempfile::TempDir, Settings, RunOptions) {
        let d = tempfile::tempdir().unwrap();
        let target = d.path().join("Projects");
        for name in names {
            let sub = target.join(name);
            std::fs::create_dir_all(&sub).unwrap();
            std::fs::write(sub.join("main.c"), *name).unwrap();
        }
        let mut settings = Settings::default();
        settings.general.result_path = d.path().join("Results").display().to_string();
        settings.build.destination = d.path().join("Build").display().to_string();
        let opts = RunOptions {
            suite_path: d.path().to_path_buf(),
            target_path: target,
            pattern: "*".to_string(),
            threaded: true,
            jobs: 3,
            log: LogOptions::default(),
        };
        (d, settings, opts)
    }

    #[test]
    fn test_slot_workspace() {
        let mut settings = Settings::default();
        settings.build.destination = "/work/Build".to_string();
        assert_that!(slot_workspace(&settings, 0, 1)).is_equal_to(PathBuf::from("/work/Build"));
        assert_that!(slot_workspace(&settings, 2, 4)).is_equal_to(PathBuf::from("/work/Build-2"));
    }

    #[test]
    fn test_thread_pool_writes_every_result() {
        let names = ["alice_1", "bob_2", "carol_3", "dave", "erin_5"];
        let (d, settings, opts) = layout(&names);
        let summary = run(&suite(), &settings, &opts).unwrap();
        assert_that!(summary).is_equal_to(RunSummary {
            graded: 5,
            failed: 0,
        });

        for name in names {
            let result = d.path().join("Results").join(name).join("result.csv");
            assert_that!(result.exists()).is_true();
        }
        let contents = std::fs::read_to_string(d.path().join("Results/summary.csv")).unwrap();
        let mut rows: Vec<&str> = contents.lines().collect();
        assert_that!(rows.remove(0)).is_equal_to("Student,LMS ID,Score");
        rows.sort();
        assert_that!(rows).is_equal_to(vec![
            "alice,1,5.00",
            "bob,2,5.00",
            "carol,3,5.00",
            "dave,NONE,5.00",
            "erin,5,5.00",
        ]);
    }

    #[test]
    fn test_pattern_selects_submissions() {
        let (d, settings, mut opts) = layout(&["alice_1", "bob_2_LATE"]);
        opts.pattern = "*_LATE".to_string();
        let summary = run(&suite(), &settings, &opts).unwrap();
        assert_that!(summary.graded).is_equal_to(1);
        assert_that!(d.path().join("Results/alice_1").exists()).is_false();
    }

    #[test]
    fn test_framework_build_failure_is_fatal() {
        let (d, mut settings, opts) = layout(&["alice_1"]);
        settings.build.framework_src = Some(d.path().display().to_string());
        settings.build.compile_cmd = vec![vec!["false".to_string()]];
        assert_that!(run(&suite(), &settings, &opts)).is_err();
        assert_that!(d.path().join("Results/alice_1").exists()).is_false();
    }

    #[test]
    fn test_worker_command_line() {
        let (_d, _settings, mut opts) = layout(&[]);
        opts.log.debug = true;
        let sub = Submission::new("/tmp/Projects/alice_1").unwrap();
        let cmd = worker_command(
            Path::new("/usr/bin/grader"),
            &opts,
            &sub,
            Path::new("/w/Build-1"),
            Path::new("/tmp/framework-1.json"),
        );
        assert_that!(cmd[3..9].to_vec()).is_equal_to(
            [
                "--worker",
                "/tmp/Projects/alice_1",
                "--workspace",
                "/w/Build-1",
                "--framework",
                "/tmp/framework-1.json",
            ]
            .map(OsString::from)
            .to_vec(),
        );
        assert_that!(cmd.last().cloned()).is_equal_to(Some(OsString::from("--debug")));
    }

    #[test]
    fn test_worker_leaves_outcome() {
        let (d, settings, _opts) = layout(&["alice_1"]);
        let sub = d.path().join("Projects/alice_1");
        std::fs::create_dir_all(d.path().join("Results/alice_1")).unwrap();
        let state = save_framework::<FakeSuite>(&()).unwrap();
        run_worker(&suite(), &settings, &sub, &d.path().join("Build-0"), state.path(), false).unwrap();

        let submission = Submission::new(&sub).unwrap();
        let outcome = collect_outcome(&settings, &submission, ExitStatus::Exited(0));
        assert_that!(outcome.total()).is_equal_to(5.0);
        assert_that!(d.path().join("Build-0/main.c").exists()).is_true();
    }

    /// Counts framework initializations; its single set passes when the
    /// framework context holds the expected value.
    #[derive(Default)]
    struct CountingSuite {
        sets: Vec<TestSet<CountingSuite>>,
        inits: AtomicUsize,
    }

    impl Suite for CountingSuite {
        type Framework = String;
        type Subject = ();
        type SetContext = ();

        fn test_sets(&self) -> &[TestSet<Self>] {
            &self.sets
        }

        fn initialize_framework(&self, _settings: &Settings) -> Result<String, Error> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok("linker-v2".to_string())
        }

        fn initialize_subject(
            &self,
            _submission: &Path,
            _framework: &String,
            _settings: &Settings,
        ) -> Result<(), Error> {
            Ok(())
        }

        fn initialize_test_set(
            &self,
            _set: &TestSet<Self>,
            _subject: &(),
            _framework: &String,
            _settings: &Settings,
        ) -> Result<(), Error> {
            Ok(())
        }
    }

    fn counting_suite() -> CountingSuite {
        let set = TestSet::<CountingSuite>::builder("Framework", "framework", TestCount::Fixed(1), |_, scope| {
            Ok(Verdict::from(scope.framework == "linker-v2"))
        })
        .build()
        .unwrap();
        CountingSuite {
            sets: vec![set],
            ..Default::default()
        }
    }

    #[test]
    fn test_framework_initialized_once_per_run() {
        let (_d, settings, opts) = layout(&["alice_1", "bob_2", "carol_3", "dave_4"]);
        let suite = counting_suite();
        let summary = run(&suite, &settings, &opts).unwrap();
        assert_that!(summary.graded).is_equal_to(4);
        assert_that!(suite.inits.load(Ordering::SeqCst)).is_equal_to(1);
    }

    #[test]
    fn test_worker_reuses_saved_framework() {
        let (d, settings, _opts) = layout(&["alice_1"]);
        let sub = d.path().join("Projects/alice_1");
        std::fs::create_dir_all(d.path().join("Results/alice_1")).unwrap();
        let suite = counting_suite();
        let state = save_framework::<CountingSuite>(&"linker-v2".to_string()).unwrap();

        run_worker(&suite, &settings, &sub, &d.path().join("Build-0"), state.path(), false).unwrap();

        assert_that!(suite.inits.load(Ordering::SeqCst)).is_equal_to(0);
        let submission = Submission::new(&sub).unwrap();
        let outcome = collect_outcome(&settings, &submission, ExitStatus::Exited(0));
        assert_that!(outcome.total()).is_equal_to(100.0);
    }

    #[test]
    fn test_worker_without_framework_state_fails() {
        let (d, settings, _opts) = layout(&["alice_1"]);
        let sub = d.path().join("Projects/alice_1");
        let missing = d.path().join("framework.json");
        let workspace = d.path().join("Build-0");
        assert_that!(run_worker(&counting_suite(), &settings, &sub, &workspace, &missing, false)).is_err();
    }
}
