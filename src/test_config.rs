//! A ready-made [`Suite`] whose test sets are declared in the suite file.
//!
//! Every case runs a command in the subject's binary directory and compares
//! its exit code and standard output against the declared expectations:
//!
//! ```toml
//! [case_defaults]
//! timeout = 5
//!
//! [[sets]]
//! name = "Basics"
//! id = "basics"
//! max_score = 10
//! max_penalty = 0.5
//!
//! [[sets.cases]]
//! cmd = ["${subject_bin}/hello", "world"]
//! stdout = "hello world"
//! description = "Greets its argument"
//!
//! [[sets.case_penalties]]
//! kind = "slow"
//! name = "Speed"
//! magnitude = 0.2
//! threshold_ms = 500
//!
//! [[sets.set_penalties]]
//! kind = "command"
//! name = "Style"
//! magnitude = 0.1
//! cmd = ["${framework_bin}/lint", "${destination}"]
//! ```

use serde::Deserialize;
use std::{
    cell::RefCell,
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use crate::error::Error;
use crate::settings::{Settings, SUITE_FILE};
use crate::suite::{Scope, Suite, TestCount, TestSet, Verdict};
use crate::template::substitute_all;
use crate::utils::{path_join, single_linefeed_to_space, syscommand_timeout, SyscommandSettings};

const DEFAULT_CASE_TIMEOUT: u64 = 10;
const MAX_CASE_OUTPUT: usize = 1024 * 1024;

/// Characters of unexpected output quoted in a failure message.
const MESSAGE_EXCERPT: usize = 60;

#[derive(Debug, Clone, PartialEq)]
pub struct CaseConfig {
    pub cmd: Vec<String>,
    pub stdin: Option<String>,
    /// Expected standard output. Not checked when absent.
    pub stdout: Option<String>,
    /// Expected exit code. Not checked when absent.
    pub code: Option<i32>,
    /// Compare outputs with surrounding whitespace removed.
    pub trim: bool,
    pub timeout: u64,
    pub description: Option<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CasePenaltyConfig {
    /// Applies when the case wrote anything to stderr.
    Stderr { name: String, magnitude: f64 },
    /// Applies when the case ran longer than `threshold_ms`.
    Slow {
        name: String,
        magnitude: f64,
        threshold_ms: u64,
    },
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SetPenaltyConfig {
    /// Applies when the command exits with a non-zero code.
    Command {
        name: String,
        magnitude: f64,
        cmd: Vec<String>,
        #[serde(default = "default_check_timeout")]
        timeout: u64,
    },
}

fn default_check_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetConfig {
    pub name: String,
    pub id: String,
    pub max_score: f64,
    pub max_penalty: f64,
    pub cases: Vec<CaseConfig>,
    pub case_penalties: Vec<CasePenaltyConfig>,
    pub set_penalties: Vec<SetPenaltyConfig>,
}

/// Case defaults that `[[sets.cases]]` entries override field by field.
#[derive(Deserialize, Debug, Clone, Default)]
struct _UntreatedCase {
    pub cmd: Option<Vec<String>>,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub code: Option<i32>,
    pub trim: Option<bool>,
    pub timeout: Option<u64>,
    pub description: Option<String>,
}

impl _UntreatedCase {
    fn merge(&self, ut: &_UntreatedCase) -> _UntreatedCase {
        _UntreatedCase {
            cmd: ut.cmd.clone().or(self.cmd.clone()),
            stdin: ut.stdin.clone().or(self.stdin.clone()),
            stdout: ut.stdout.clone().or(self.stdout.clone()),
            code: ut.code.or(self.code),
            trim: ut.trim.or(self.trim),
            timeout: ut.timeout.or(self.timeout),
            description: ut.description.clone().or(self.description.clone()),
        }
    }

    fn to_case(&self, set_name: &str, index: usize) -> Result<CaseConfig, Error> {
        let cmd = self.cmd.clone().unwrap_or_default();
        if cmd.is_empty() {
            return Error::config(format!("Test set {set_name}: case {index} has no command"));
        }
        let timeout = self.timeout.unwrap_or(DEFAULT_CASE_TIMEOUT);
        if timeout == 0 {
            return Error::config(format!("Test set {set_name}: case {index} has a zero timeout"));
        }
        Ok(CaseConfig {
            cmd,
            stdin: self.stdin.clone(),
            stdout: self.stdout.clone(),
            code: self.code,
            trim: self.trim.unwrap_or(true),
            timeout,
            description: self.description.clone().map(single_linefeed_to_space),
        })
    }
}

/// Measurements of one case, read back by the case penalties.
#[derive(Debug, Clone, Default)]
pub struct CaseRun {
    pub stderr: String,
    pub elapsed: Duration,
}

/// Per-set state: what each case did when it ran.
#[derive(Debug, Default)]
pub struct CaseLog {
    runs: RefCell<BTreeMap<usize, CaseRun>>,
}

impl CaseLog {
    fn record(&self, index: usize, run: CaseRun) {
        self.runs.borrow_mut().insert(index, run);
    }

    pub fn get(&self, index: usize) -> Option<CaseRun> {
        self.runs.borrow().get(&index).cloned()
    }
}

pub struct DeclarativeSuite {
    sets: Vec<TestSet<DeclarativeSuite>>,
}

impl DeclarativeSuite {
    /// Loads the `[[sets]]` of the suite file in `suite_path`.
    pub fn load<P: AsRef<Path>>(suite_path: P) -> Result<Self, Error> {
        let path = path_join(suite_path.as_ref(), SUITE_FILE)?;
        log::debug!("Loading test sets from {path}");
        let contents: String = std::fs::read_to_string(&path)
            .inspect_err(|e| log::error!("Could not load {path}: {e}"))?;
        let configs = parse_sets(&contents)
            .inspect_err(|e| log::error!("Error reading test sets from {path}: {e}"))?;
        Self::from_configs(configs)
    }

    pub fn from_configs(configs: Vec<SetConfig>) -> Result<Self, Error> {
        let sets = configs
            .into_iter()
            .map(instantiate)
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(DeclarativeSuite { sets })
    }
}

/// Parses the declarative test sets of a suite file. Other sections are
/// ignored here.
pub fn parse_sets(contents: &str) -> Result<Vec<SetConfig>, Error> {
    #[derive(Deserialize, Debug)]
    struct _UntreatedSet {
        pub name: String,
        pub id: Option<String>,
        pub max_score: Option<f64>,
        pub max_penalty: Option<f64>,
        pub cases: Option<Vec<_UntreatedCase>>,
        pub case_penalties: Option<Vec<CasePenaltyConfig>>,
        pub set_penalties: Option<Vec<SetPenaltyConfig>>,
    }

    #[derive(Deserialize, Debug)]
    struct _UntreatedSuite {
        pub case_defaults: Option<_UntreatedCase>,
        pub sets: Option<Vec<_UntreatedSet>>,
    }

    let us: _UntreatedSuite = toml::from_str(contents)?;
    let defaults = us.case_defaults.unwrap_or_default();

    let mut configs = vec![];
    for ut in us.sets.unwrap_or_default() {
        log::debug!("Reading test set \"{}\"", ut.name);
        let cases = ut
            .cases
            .unwrap_or_default()
            .iter()
            .enumerate()
            .map(|(i, c)| defaults.merge(c).to_case(&ut.name, i))
            .collect::<Result<Vec<_>, Error>>()?;
        if cases.is_empty() {
            log::warn!("Test set \"{}\" declares no cases", ut.name);
        }
        configs.push(SetConfig {
            id: ut.id.unwrap_or_else(|| ut.name.to_lowercase().replace(' ', "_")),
            name: ut.name,
            max_score: ut.max_score.unwrap_or(100.0),
            max_penalty: ut.max_penalty.unwrap_or(0.0),
            cases,
            case_penalties: ut.case_penalties.unwrap_or_default(),
            set_penalties: ut.set_penalties.unwrap_or_default(),
        });
    }
    Ok(configs)
}

/// Placeholder values for case and check commands.
fn command_values(scope: &Scope<DeclarativeSuite>) -> BTreeMap<String, String> {
    let mut values = scope.settings.build.template_values();
    values.insert(
        "subject_bin".to_string(),
        scope.subject.to_string_lossy().into_owned(),
    );
    if let Some(fw) = scope.framework {
        values.insert("framework_bin".to_string(), fw.to_string_lossy().into_owned());
    }
    values.insert("suite_dir".to_string(), scope.settings.reldir.clone());
    if let Some(artifacts) = scope.artifacts {
        values.insert("artifacts".to_string(), artifacts.to_string_lossy().into_owned());
    }
    values
}

fn excerpt(s: &str) -> String {
    let line = single_linefeed_to_space(s.trim());
    if line.chars().count() > MESSAGE_EXCERPT {
        let cut: String = line.chars().take(MESSAGE_EXCERPT).collect();
        format!("{cut}...")
    } else {
        line
    }
}

fn run_case(case: &CaseConfig, index: usize, scope: &Scope<DeclarativeSuite>) -> Result<Verdict, Error> {
    let cmd = substitute_all(&case.cmd, &command_values(scope)).map_err(|e| Error::from(e.to_string()))?;
    log::debug!("Running case {index}: {}", cmd.join(" "));

    let started = Instant::now();
    let res = syscommand_timeout(
        &cmd,
        SyscommandSettings {
            timeout: Duration::from_secs(case.timeout),
            stdin: case.stdin.clone(),
            max_stdout_length: Some(MAX_CASE_OUTPUT),
            max_stderr_length: Some(MAX_CASE_OUTPUT),
            cwd: Some(scope.subject.clone()),
            ..Default::default()
        },
    );
    let elapsed = started.elapsed();

    let output = match res {
        Ok(output) => output,
        Err(Error::SyscommandTimeoutError { stderr, .. }) => {
            scope.context.record(
                index,
                CaseRun {
                    stderr: stderr.unwrap_or_default(),
                    elapsed,
                },
            );
            return Ok(Verdict::Message(format!("timed out after {}s", case.timeout)));
        }
        Err(Error::SyscommandOutputLimitExceededError(limit)) => {
            return Ok(Verdict::Message(format!("output exceeded {limit} bytes")));
        }
        Err(e) => return Err(e),
    };
    scope.context.record(
        index,
        CaseRun {
            stderr: output.stderr.clone(),
            elapsed,
        },
    );

    if let Some(code) = case.code {
        if code != output.code {
            return Ok(Verdict::Message(format!(
                "expected exit code {code}, got {}",
                output.code
            )));
        }
    }
    if let Some(expected) = &case.stdout {
        let (got, want) = if case.trim {
            (output.stdout.trim(), expected.trim())
        } else {
            (output.stdout.as_str(), expected.as_str())
        };
        if got != want {
            return Ok(Verdict::Message(format!(
                "expected \"{}\", got \"{}\"",
                excerpt(want),
                excerpt(got)
            )));
        }
    }
    Ok(Verdict::Score(1.0))
}

fn run_check(cmd: &[String], timeout: u64, scope: &Scope<DeclarativeSuite>) -> Result<f64, Error> {
    let cmd = substitute_all(cmd, &command_values(scope)).map_err(|e| Error::from(e.to_string()))?;
    log::debug!("Running check: {}", cmd.join(" "));
    let output = syscommand_timeout(
        &cmd,
        SyscommandSettings {
            timeout: Duration::from_secs(timeout),
            max_stdout_length: Some(MAX_CASE_OUTPUT),
            max_stderr_length: Some(MAX_CASE_OUTPUT),
            cwd: Some(PathBuf::from(&scope.settings.build.destination)),
            ..Default::default()
        },
    )?;
    Ok(if output.code == 0 { 0.0 } else { 1.0 })
}

fn instantiate(config: SetConfig) -> Result<TestSet<DeclarativeSuite>, Error> {
    log::debug!("Instantiating test set \"{}\"", config.name);
    let cases = Arc::new(config.cases);

    let runner_cases = Arc::clone(&cases);
    let description_cases = Arc::clone(&cases);
    let mut builder = TestSet::<DeclarativeSuite>::builder(
        &config.name,
        &config.id,
        TestCount::Fixed(cases.len()),
        move |i, scope| match runner_cases.get(i) {
            Some(case) => run_case(case, i, scope),
            None => Error::err_string(format!("No case with index {i}")),
        },
    )
    .max_score(config.max_score)
    .max_penalty(config.max_penalty)
    .description(move |i, _| {
        description_cases
            .get(i)
            .and_then(|c| c.description.clone())
            .unwrap_or_else(|| format!("Test #{i}"))
    });

    for p in config.case_penalties {
        builder = match p {
            CasePenaltyConfig::Stderr { name, magnitude } => {
                builder.case_penalty(&name, magnitude, |_, i, scope| {
                    let run = scope.context.get(i).unwrap_or_default();
                    Ok(if run.stderr.trim().is_empty() { 0.0 } else { 1.0 })
                })
            }
            CasePenaltyConfig::Slow {
                name,
                magnitude,
                threshold_ms,
            } => builder.case_penalty(&name, magnitude, move |_, i, scope| {
                let run = scope.context.get(i).unwrap_or_default();
                Ok(if run.elapsed > Duration::from_millis(threshold_ms) {
                    1.0
                } else {
                    0.0
                })
            }),
        };
    }
    for p in config.set_penalties {
        builder = match p {
            SetPenaltyConfig::Command {
                name,
                magnitude,
                cmd,
                timeout,
            } => builder.set_penalty(&name, magnitude, move |_, scope| {
                run_check(&cmd, timeout, scope)
            }),
        };
    }
    builder.build()
}

impl Suite for DeclarativeSuite {
    /// Framework binary directory, when one is configured.
    type Framework = Option<PathBuf>;
    /// Subject binary directory.
    type Subject = PathBuf;
    type SetContext = CaseLog;

    fn test_sets(&self) -> &[TestSet<Self>] {
        &self.sets
    }

    fn initialize_framework(&self, settings: &Settings) -> Result<Option<PathBuf>, Error> {
        Ok(settings.build.framework_bin.as_ref().map(PathBuf::from))
    }

    fn initialize_subject(
        &self,
        _submission: &Path,
        _framework: &Option<PathBuf>,
        settings: &Settings,
    ) -> Result<PathBuf, Error> {
        let dir = PathBuf::from(
            settings
                .build
                .subject_bin
                .as_ref()
                .unwrap_or(&settings.build.destination),
        );
        if !dir.is_dir() {
            return Error::err_string(format!("Subject directory {} does not exist", dir.display()));
        }
        Ok(dir)
    }

    fn initialize_test_set(
        &self,
        _set: &TestSet<Self>,
        _subject: &PathBuf,
        _framework: &Option<PathBuf>,
        _settings: &Settings,
    ) -> Result<CaseLog, Error> {
        Ok(CaseLog::default())
    }
}
