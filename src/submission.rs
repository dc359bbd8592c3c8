use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::builder;
use crate::error::Error;
use crate::scoring::{grade_test_set, Environment, SetResult};
use crate::settings::Settings;
use crate::suite::{guarded, Suite};
use crate::utils::{copy_tree, recreate_dir};
use crate::vm::{CycleOutcome, VmBackend};

/// LMS id used when the directory name carries none.
pub const NO_LMS_ID: &str = "NONE";

#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub path: PathBuf,
    /// Directory name, also used for the output directory.
    pub name: String,
    pub student: String,
    pub lms_id: String,
}

/// Splits `student_lmsid` on the first underscore.
pub fn parse_name(name: &str) -> (String, String) {
    match name.split_once('_') {
        Some((student, lms_id)) => (student.to_string(), lms_id.to_string()),
        None => (name.to_string(), NO_LMS_ID.to_string()),
    }
}

impl Submission {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(String::from)
            .ok_or_else(|| Error::from(format!("Invalid submission directory {path:?}")))?;
        let (student, lms_id) = parse_name(&name);
        Ok(Submission {
            path,
            name,
            student,
            lms_id,
        })
    }
}

/// Lists the submission directories under `target` whose names match the
/// glob `pattern`, sorted by name.
pub fn discover<P: AsRef<Path>>(target: P, pattern: &str) -> Result<Vec<Submission>, Error> {
    let matcher = globset::Glob::new(pattern)?.compile_matcher();
    let mut paths = vec![];
    for entry in std::fs::read_dir(target.as_ref())? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if matcher.is_match(entry.file_name()) {
            paths.push(entry.path());
        }
    }
    paths.sort();
    paths.into_iter().map(Submission::new).collect()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct SubmissionOutcome {
    pub sets: Vec<SetResult>,
    /// Non-fatal problems: build failures, subject start-up errors.
    pub diagnostics: Vec<String>,
    /// Set when the submission could not be graded at all.
    pub failure: Option<String>,
}

impl SubmissionOutcome {
    pub fn failed<S: Into<String>>(reason: S) -> Self {
        SubmissionOutcome {
            failure: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn total(&self) -> f64 {
        self.sets.iter().fold(0.0, |acc, s| acc + s.score)
    }
}

/// Copies the base files and then the submission into a fresh working tree.
pub fn materialize(submission: &Submission, settings: &Settings) -> Result<(), Error> {
    let root = &settings.build.destination;
    recreate_dir(root)?;
    if let Some(base) = &settings.build.base {
        copy_tree(base, root)?;
    }
    copy_tree(&submission.path, root)
}

/// Builds and grades one submission. `settings` must point at the working
/// tree reserved for this submission.
pub fn prepare_and_test<S: Suite>(
    suite: &S,
    submission: &Submission,
    framework: &S::Framework,
    settings: &Settings,
    vm: Option<&mut VmBackend>,
) -> SubmissionOutcome {
    let mut outcome = SubmissionOutcome::default();

    if let Err(e) = materialize(submission, settings) {
        log::error!("Could not prepare the working tree for {}: {e}", submission.name);
        return SubmissionOutcome::failed(format!("could not prepare working tree: {e}"));
    }

    log::info!("Prepping / building project(s) for {}...", submission.name);
    let output_dir = settings.output_dir(&submission.name);
    let mut artifacts = None;
    let build_failure = match vm {
        Some(vm) => match vm.run_cycle(Path::new(&settings.build.destination), &output_dir) {
            CycleOutcome::Completed => {
                artifacts = Some(output_dir.as_path());
                None
            }
            CycleOutcome::BuildFailed(reason) => {
                artifacts = Some(output_dir.as_path());
                Some(reason)
            }
            CycleOutcome::RunFailed(reason) => {
                log::error!("Test run failed on the remote machine for {}: {reason}", submission.name);
                outcome.diagnostics.push(format!("run: {reason}"));
                artifacts = Some(output_dir.as_path());
                None
            }
            CycleOutcome::Unreachable(reason) => {
                log::error!("Remote machine unavailable for {}: {reason}", submission.name);
                return SubmissionOutcome::failed(reason);
            }
        },
        None => {
            let dest = PathBuf::from(&settings.build.destination);
            let src = settings
                .build
                .subject_src
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or(dest);
            let bin = settings.build.subject_bin.as_ref().map(PathBuf::from);
            builder::build(&src, bin.as_deref(), &settings.build)
                .err()
                .map(|e| e.to_string())
        }
    };
    if let Some(reason) = &build_failure {
        log::error!("Error prepping/building {}: {reason}", submission.name);
        outcome.diagnostics.push(format!("build: {reason}"));
    }

    log::info!("Initializing {}...", submission.name);
    let subject = match guarded(|| suite.initialize_subject(&submission.path, framework, settings)) {
        Ok(s) => Some(s),
        Err(e) => {
            log::error!("Error initializing subject {}: {e}", submission.name);
            outcome.diagnostics.push(format!("initialize_subject: {e}"));
            None
        }
    };

    let env = Environment {
        suite,
        subject: subject.as_ref(),
        framework,
        settings,
        artifacts,
        build_failure,
    };
    for set in suite.test_sets() {
        log::info!("Running test set {} for {}", set.name, submission.name);
        outcome.sets.push(grade_test_set(set, &env));
    }
    drop(env);

    if let Some(subject) = subject {
        if let Err(e) = guarded(|| {
            suite.shutdown_subject(subject);
            Ok(())
        }) {
            log::error!("Error shutting down subject {}: {e}", submission.name);
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::TestSetOutcome;
    use crate::suite::tests::FakeSuite;
    use crate::suite::{TestCount, TestSet, Verdict};
    use asserting::prelude::*;

    #[test]
    fn test_parse_name() {
        assert_that!(parse_name("alice_12345"))
            .is_equal_to(("alice".to_string(), "12345".to_string()));
        assert_that!(parse_name("bob")).is_equal_to(("bob".to_string(), "NONE".to_string()));
        assert_that!(parse_name("carol_987_LATE"))
            .is_equal_to(("carol".to_string(), "987_LATE".to_string()));
    }

    #[test]
    fn test_total_without_sets_is_positive_zero() {
        let total = SubmissionOutcome::failed("unreachable").total();
        assert_that!(total.is_sign_positive()).is_true();
        assert_that!(format!("{total:.2}")).is_equal_to("0.00".to_string());
    }

    #[test]
    fn test_discover_filters_and_sorts() {
        let d = tempfile::tempdir().unwrap();
        for name in ["zed_3", "alice_1", "bob_2_LATE"] {
            std::fs::create_dir_all(d.path().join(name)).unwrap();
        }
        std::fs::write(d.path().join("notes.txt"), "").unwrap();

        let all = discover(d.path(), "*").unwrap();
        let names: Vec<_> = all.iter().map(|s| s.name.as_str()).collect();
        assert_that!(names).is_equal_to(vec!["alice_1", "bob_2_LATE", "zed_3"]);

        let late = discover(d.path(), "*_LATE*").unwrap();
        assert_that!(late.len()).is_equal_to(1);
        assert_that!(late[0].student.as_str()).is_equal_to("bob");
    }

    #[test]
    fn test_discover_invalid_pattern() {
        let d = tempfile::tempdir().unwrap();
        assert_that!(discover(d.path(), "[")).is_err();
    }

    fn layout() -> (tempfile::TempDir, Settings, Submission) {
        let d = tempfile::tempdir().unwrap();
        let base = d.path().join("base");
        let sub = d.path().join("Projects/alice_12345");
        std::fs::create_dir_all(&base).unwrap();
        std::fs::create_dir_all(&sub).unwrap();
        std::fs::write(base.join("main.c"), "stub").unwrap();
        std::fs::write(base.join("tests.h"), "base").unwrap();
        std::fs::write(sub.join("main.c"), "solution").unwrap();

        let mut settings = Settings::default();
        settings.general.result_path = d.path().join("Results").display().to_string();
        settings.build.base = Some(base.display().to_string());
        settings.build.destination = d.path().join("work").display().to_string();
        let submission = Submission::new(&sub).unwrap();
        (d, settings, submission)
    }

    #[test]
    fn test_materialize_submission_wins() {
        let (d, settings, submission) = layout();
        std::fs::create_dir_all(d.path().join("work/leftover")).unwrap();
        materialize(&submission, &settings).unwrap();
        let work = d.path().join("work");
        assert_that!(std::fs::read_to_string(work.join("main.c")).unwrap())
            .is_equal_to("solution".to_string());
        assert_that!(work.join("tests.h").exists()).is_true();
        assert_that!(work.join("leftover").exists()).is_false();
    }

    fn file_check_suite() -> FakeSuite {
        let set = TestSet::<FakeSuite>::builder("Files", "files", TestCount::Fixed(2), |i, scope| {
            let root = Path::new(&scope.settings.build.destination);
            let name = ["main.c", "built"][i];
            Ok(Verdict::from(root.join(name).exists()))
        })
        .max_score(10.0)
        .build()
        .unwrap();
        FakeSuite {
            sets: vec![set],
            fail_subject: false,
        }
    }

    #[test]
    fn test_prepare_and_test_builds_and_scores() {
        let (_d, mut settings, submission) = layout();
        settings.build.compile_cmd = vec![vec!["touch".into(), "built".into()]];
        let suite = file_check_suite();
        let outcome = prepare_and_test(&suite, &submission, &(), &settings, None);
        assert_that!(outcome.failure.is_none()).is_true();
        assert_that!(outcome.diagnostics.is_empty()).is_true();
        assert_that!(outcome.total()).is_equal_to(10.0);
    }

    #[test]
    fn test_build_failure_does_not_abort() {
        let (_d, mut settings, submission) = layout();
        settings.build.compile_cmd = vec![vec!["false".into()]];
        let suite = file_check_suite();
        let outcome = prepare_and_test(&suite, &submission, &(), &settings, None);
        assert_that!(outcome.diagnostics.len()).is_equal_to(1);
        assert_that!(outcome.sets.len()).is_equal_to(1);
        // The subject still starts, so the set runs and finds only main.c.
        assert_that!(outcome.total()).is_equal_to(5.0);
    }

    #[test]
    fn test_subject_failure_degrades_every_set() {
        let (_d, settings, submission) = layout();
        let mut suite = file_check_suite();
        suite.fail_subject = true;
        let outcome = prepare_and_test(&suite, &submission, &(), &settings, None);
        assert_that!(outcome.total()).is_equal_to(0.0);
        assert_that!(matches!(
            outcome.sets[0].outcome,
            TestSetOutcome::RuntimeFailed(_)
        ))
        .is_true();
    }
}
