use serde::{Deserialize, Deserializer};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};
use toml;

use crate::error::Error;
use crate::logging;
use crate::utils::{path_absolute_join, path_join};

/// Name of the suite configuration file inside the suite directory.
pub const SUITE_FILE: &str = "suite.toml";

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub general: GeneralSettings,

    #[serde(default)]
    pub build: BuildSettings,

    #[serde(default)]
    pub runtime: RuntimeSettings,

    /// Remote machine used for building and testing. Absent for local runs.
    #[serde(default)]
    pub vm: Option<VmSettings>,

    /// Directory containing the suite file.
    #[serde(skip)]
    pub reldir: String,
}

/// Output locations. File names are relative to `result_path`.
#[derive(Deserialize, Debug, Clone)]
pub struct GeneralSettings {
    #[serde(default = "default_result_path")]
    pub result_path: String,
    #[serde(default = "default_result_file")]
    pub result_file: String,
    #[serde(default = "default_error_log")]
    pub error_log: String,
    #[serde(default = "default_summary_file")]
    pub summary_file: String,
}

fn default_result_path() -> String {
    "Results".to_string()
}
fn default_result_file() -> String {
    "result.csv".to_string()
}
fn default_error_log() -> String {
    "error.log".to_string()
}
fn default_summary_file() -> String {
    "summary.csv".to_string()
}

impl Default for GeneralSettings {
    fn default() -> Self {
        GeneralSettings {
            result_path: default_result_path(),
            result_file: default_result_file(),
            error_log: default_error_log(),
            summary_file: default_summary_file(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct BuildSettings {
    /// Files copied into the working tree before each submission.
    #[serde(default)]
    pub base: Option<String>,

    /// The working tree that every submission is materialized into.
    #[serde(default = "default_destination")]
    pub destination: String,

    /// Extra resources made available to build commands and test sets.
    #[serde(default)]
    pub resources: Option<String>,

    #[serde(default)]
    pub subject_src: Option<String>,
    #[serde(default)]
    pub subject_bin: Option<String>,
    #[serde(default)]
    pub framework_src: Option<String>,
    #[serde(default)]
    pub framework_bin: Option<String>,

    /// Commands are given either as a single argument list or as a list of
    /// argument lists, all run in order.
    #[serde(default, deserialize_with = "deserialize_commands")]
    pub prep_cmd: Vec<Vec<String>>,
    #[serde(default, deserialize_with = "deserialize_commands")]
    pub compile_cmd: Vec<Vec<String>>,
    #[serde(default, deserialize_with = "deserialize_commands")]
    pub post_cmd: Vec<Vec<String>>,

    /// Timeout in seconds for each build command.
    #[serde(default = "default_build_timeout")]
    pub timeout: u64,

    /// Maximum number of bytes captured from each stream of a build command.
    #[serde(default = "default_max_output")]
    pub max_output: usize,

    /// Free-form values available to the command templates.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

fn default_destination() -> String {
    "Build".to_string()
}
fn default_build_timeout() -> u64 {
    600
}
fn default_max_output() -> usize {
    1024 * 1024
}

impl Default for BuildSettings {
    fn default() -> Self {
        BuildSettings {
            base: None,
            destination: default_destination(),
            resources: None,
            subject_src: None,
            subject_bin: None,
            framework_src: None,
            framework_bin: None,
            prep_cmd: vec![],
            compile_cmd: vec![],
            post_cmd: vec![],
            timeout: default_build_timeout(),
            max_output: default_max_output(),
            vars: BTreeMap::new(),
        }
    }
}

impl BuildSettings {
    pub fn has_commands(&self) -> bool {
        !(self.prep_cmd.is_empty() && self.compile_cmd.is_empty() && self.post_cmd.is_empty())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Values substituted into the command templates, without the two
    /// synthesized directories.
    pub fn template_values(&self) -> BTreeMap<String, String> {
        let mut values = self.vars.clone();
        let optional = [
            ("base", &self.base),
            ("resources", &self.resources),
            ("subject_src", &self.subject_src),
            ("subject_bin", &self.subject_bin),
            ("framework_src", &self.framework_src),
            ("framework_bin", &self.framework_bin),
        ];
        for (key, value) in optional {
            if let Some(v) = value {
                values.insert(key.to_string(), v.clone());
            }
        }
        values.insert("destination".to_string(), self.destination.clone());
        values.insert("timeout".to_string(), self.timeout.to_string());
        values.insert("max_output".to_string(), self.max_output.to_string());
        values
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CommandSpec {
    Single(Vec<String>),
    Many(Vec<Vec<String>>),
}

fn deserialize_commands<'de, D>(deserializer: D) -> Result<Vec<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match CommandSpec::deserialize(deserializer)? {
        CommandSpec::Single(cmd) if cmd.is_empty() => vec![],
        CommandSpec::Single(cmd) => vec![cmd],
        CommandSpec::Many(cmds) => cmds.into_iter().filter(|c| !c.is_empty()).collect(),
    })
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct RuntimeSettings {
    /// Use the thread pool instead of the process pool.
    #[serde(default)]
    pub threaded: bool,

    /// Number of submissions graded at the same time.
    #[serde(default)]
    pub jobs: Option<usize>,
}

/// Remote machine settings. Timeouts are in seconds.
#[derive(Deserialize, Debug, Clone)]
pub struct VmSettings {
    pub name: String,
    #[serde(default)]
    pub snapshot: Option<String>,

    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub identity_file: Option<String>,

    /// Seconds to wait after powering on or rebooting before connecting.
    #[serde(default = "default_boot_time")]
    pub boot_time: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Local directory holding the staging files.
    pub staging_dir: String,
    #[serde(default)]
    pub staging_files: Vec<String>,
    /// Files pushed from the working tree.
    #[serde(default)]
    pub payload_files: Vec<String>,
    /// Files fetched into the submission's output directory after testing.
    #[serde(default)]
    pub result_files: Vec<String>,

    pub stage_cmd: String,
    pub build_cmd: String,
    #[serde(default = "default_reboot_cmd")]
    pub reboot_cmd: String,
    #[serde(default = "default_run_cmd")]
    pub run_cmd: String,

    pub remote_staging_dir: String,
    pub remote_payload_dir: String,
    pub remote_result_dir: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout: u64,
    #[serde(default = "default_vm_build_timeout")]
    pub build_timeout: u64,
    #[serde(default = "default_stage_timeout")]
    pub reboot_timeout: u64,
    #[serde(default = "default_stage_timeout")]
    pub run_timeout: u64,
    #[serde(default = "default_stage_timeout")]
    pub transfer_timeout: u64,

    pub hypervisor: HypervisorSettings,
}

/// Command templates driving the hypervisor. `${vm_name}` and `${snapshot}`
/// are substituted before running.
#[derive(Deserialize, Debug, Clone)]
pub struct HypervisorSettings {
    #[serde(default)]
    pub revert: Vec<String>,
    pub power_on: Vec<String>,
    pub power_off: Vec<String>,
    #[serde(default = "default_hypervisor_timeout")]
    pub timeout: u64,
}

fn default_ssh_port() -> u16 {
    22
}
fn default_boot_time() -> u64 {
    10
}
fn default_max_retries() -> u32 {
    10
}
fn default_reboot_cmd() -> String {
    "reboot.sh".to_string()
}
fn default_run_cmd() -> String {
    "run.sh".to_string()
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_stage_timeout() -> u64 {
    120
}
fn default_vm_build_timeout() -> u64 {
    1200
}
fn default_hypervisor_timeout() -> u64 {
    300
}

/// Console and log file verbosity, given on the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOptions {
    pub quiet: bool,
    pub warn: bool,
    pub debug: bool,
}

impl Settings {
    /// Loads settings from `suite.toml` in the suite directory.
    pub fn load<P: AsRef<Path>>(suite_path: P) -> Result<Self, Error> {
        let path = path_join(suite_path.as_ref(), SUITE_FILE)?;
        let contents: String = std::fs::read_to_string(&path)
            .inspect_err(|e| eprintln!("Could not load settings from \"{path}\": {e}"))?;
        let mut s: Settings = toml::from_str(&contents)
            .inspect_err(|e| eprintln!("Error parsing settings from \"{path}\": {e}"))?;

        s.reldir = path_absolute_join(suite_path.as_ref(), "")?;
        s.make_paths_absolute()?;

        if let Ok(result_path) = std::env::var("GRADER_RESULT_PATH") {
            s.general.result_path = path_absolute_join(&s.reldir, result_path)?;
        }
        if let Ok(destination) = std::env::var("GRADER_DESTINATION") {
            s.build.destination = path_absolute_join(&s.reldir, destination)?;
        }
        if let Ok(jobs) = std::env::var("GRADER_JOBS") {
            s.runtime.jobs = Some(
                jobs.parse()
                    .map_err(|e| Error::from(format!("Invalid jobs value \"{jobs}\": {e}")))?,
            );
        }
        if let Ok(truth_value) = std::env::var("GRADER_THREADED") {
            s.runtime.threaded = match truth_value.to_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => true,
                _ => false,
            };
        }

        s.validate()?;
        Ok(s)
    }

    fn make_paths_absolute(&mut self) -> Result<(), Error> {
        let reldir = self.reldir.clone();
        let abs = |p: &mut String| -> Result<(), Error> {
            *p = path_absolute_join(&reldir, &*p)?;
            Ok(())
        };

        abs(&mut self.general.result_path)?;
        abs(&mut self.build.destination)?;
        for p in [
            &mut self.build.base,
            &mut self.build.resources,
            &mut self.build.subject_src,
            &mut self.build.subject_bin,
            &mut self.build.framework_src,
            &mut self.build.framework_bin,
        ] {
            if let Some(p) = p.as_mut() {
                abs(p)?;
            }
        }
        if let Some(vm) = self.vm.as_mut() {
            abs(&mut vm.staging_dir)?;
            if let Some(p) = vm.identity_file.as_mut() {
                abs(p)?;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), Error> {
        if self.general.result_file.is_empty() || self.general.summary_file.is_empty() {
            return Error::config("general.result_file and general.summary_file must be set");
        }
        if self.build.timeout == 0 {
            return Error::config("build.timeout must be positive");
        }
        if self.runtime.jobs == Some(0) {
            return Error::config("runtime.jobs must be positive");
        }
        if let Some(vm) = &self.vm {
            if vm.hypervisor.power_on.is_empty() || vm.hypervisor.power_off.is_empty() {
                return Error::config("vm.hypervisor needs both power_on and power_off commands");
            }
            if vm.max_retries == 0 {
                return Error::config("vm.max_retries must be positive");
            }
        }
        Ok(())
    }

    pub fn result_path(&self) -> PathBuf {
        PathBuf::from(&self.general.result_path)
    }

    pub fn summary_path(&self) -> PathBuf {
        self.result_path().join(&self.general.summary_file)
    }

    /// Output directory of a single submission.
    pub fn output_dir(&self, submission_name: &str) -> PathBuf {
        self.result_path().join(submission_name)
    }

    /// Returns a copy of these settings where the working tree is `root`.
    /// Build paths inside the configured destination move along with it.
    pub fn for_workspace<P: AsRef<Path>>(&self, root: P) -> Settings {
        let root = root.as_ref();
        let mut s = self.clone();
        let dest = PathBuf::from(&self.build.destination);
        let rebase = |p: &mut Option<String>| {
            if let Some(path) = p.as_mut() {
                if let Ok(rest) = Path::new(path.as_str()).strip_prefix(&dest) {
                    *path = root.join(rest).to_string_lossy().into_owned();
                }
            }
        };
        rebase(&mut s.build.subject_src);
        rebase(&mut s.build.subject_bin);
        s.build.destination = root.to_string_lossy().into_owned();
        s
    }

    /// Sets up logging for the current process.
    pub fn setup_logging(self: &Self, prockind: &str, opts: LogOptions) -> Result<(), Error> {
        use log::Level;
        use log::LevelFilter::{Debug, Info, Warn};

        std::fs::create_dir_all(&self.general.result_path).map_err(|e| {
            eprintln!(
                "Error creating directory {} for the log file: {}",
                &self.general.result_path, e
            );
            e.to_string()
        })?;

        let path_logfile = path_join(&self.general.result_path, &self.general.error_log)?;
        let prockind = prockind.to_string();
        let LogOptions { quiet, warn, debug } = opts;

        let console = fern::Dispatch::new()
            .filter(move |md| match md.level() {
                Level::Error => true,
                Level::Warn => warn,
                Level::Info => !quiet,
                _ => false,
            })
            .chain(std::io::stderr());

        let runlog = fern::Dispatch::new()
            .level(if debug { Debug } else { Warn })
            .chain(
                fern::log_file(&path_logfile).inspect_err(|e| {
                    eprintln!("Error setting up log file {}: {}", &path_logfile, e)
                })?,
            );

        fern::Dispatch::new()
            .format(move |out, message, record| {
                out.finish(format_args!(
                    "[{0} {1} ({4}-{5}) {2}:{3}] {6}",
                    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.target(),
                    record.line().unwrap_or(0),
                    prockind,
                    std::process::id(),
                    message
                ))
            })
            .level(if debug { Debug } else { Info })
            .chain(console)
            .chain(runlog)
            .chain(fern::Output::call(logging::forward_to_submission_log))
            .apply()?;
        Ok(())
    }
}
