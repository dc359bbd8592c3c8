//! Command line front end shared by every grader binary.

use clap::Parser;
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

use crate::error::Error;
use crate::scheduler::{self, RunOptions};
use crate::settings::{LogOptions, Settings};
use crate::suite::Suite;
use crate::utils::path_absolute_join;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Directory containing suite.toml
    #[arg(default_value = "./")]
    pub suite_path: String,

    /// Directory with one subdirectory per submission, relative to the suite
    #[arg(default_value = "Projects")]
    pub target_path: String,

    /// Grade on threads instead of worker processes
    #[arg(short = 't', long = "threads", default_value_t = false)]
    pub threads: bool,

    /// Only print errors (and warnings with -w)
    #[arg(short, long, default_value_t = false)]
    pub quiet: bool,

    /// Print warnings
    #[arg(short, long, default_value_t = false)]
    pub warn: bool,

    /// Write debug information to the log files
    #[arg(short, long, default_value_t = false)]
    pub debug: bool,

    /// Only grade submissions whose directory name matches this glob
    #[arg(short = 's', long = "set", default_value = "*")]
    pub pattern: String,

    /// Number of submissions graded at the same time
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Grade a single submission (used by the process pool)
    #[arg(long, hide = true, requires = "workspace")]
    pub worker: Option<PathBuf>,

    /// Working tree of a worker
    #[arg(long, hide = true, requires = "framework")]
    pub workspace: Option<PathBuf>,

    /// Framework context saved by the coordinator
    #[arg(long, hide = true)]
    pub framework: Option<PathBuf>,
}

impl Args {
    pub fn log_options(&self) -> LogOptions {
        LogOptions {
            quiet: self.quiet,
            warn: self.warn,
            debug: self.debug,
        }
    }
}

fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Resolves the run options from the command line and the suite file.
pub fn run_options(args: &Args, settings: &mut Settings) -> Result<RunOptions, Error> {
    if args.threads {
        if settings.runtime.threaded {
            log::warn!("Threading is set in both the suite file and the command line");
        }
        settings.runtime.threaded = true;
    }
    Ok(RunOptions {
        suite_path: PathBuf::from(path_absolute_join(&args.suite_path, "")?),
        target_path: PathBuf::from(path_absolute_join(&args.suite_path, &args.target_path)?),
        pattern: args.pattern.clone(),
        threaded: settings.runtime.threaded,
        jobs: args.jobs.or(settings.runtime.jobs).unwrap_or_else(default_jobs),
        log: args.log_options(),
    })
}

fn execute<S, F>(args: &Args, make_suite: F) -> Result<(), Error>
where
    S: Suite,
    F: FnOnce(&Path) -> Result<S, Error>,
{
    let mut settings = Settings::load(&args.suite_path)?;

    if let (Some(submission), Some(workspace), Some(framework)) =
        (&args.worker, &args.workspace, &args.framework)
    {
        settings.setup_logging("worker", args.log_options())?;
        let suite = make_suite(Path::new(&args.suite_path))?;
        return scheduler::run_worker(&suite, &settings, submission, workspace, framework, args.debug);
    }

    settings.setup_logging("grader", args.log_options())?;
    let opts = run_options(args, &mut settings)?;
    let suite = make_suite(Path::new(&args.suite_path))?;
    log::info!("Grading submissions in {}", opts.target_path.display());
    scheduler::run(&suite, &settings, &opts)?;
    Ok(())
}

/// Parses the command line and grades with the suite built by `make_suite`.
/// Fatal errors are printed to stderr and turn into a failing exit code.
pub fn main_with<S, F>(make_suite: F) -> ExitCode
where
    S: Suite,
    F: FnOnce(&Path) -> Result<S, Error>,
{
    let args = Args::parse();
    match execute(&args, make_suite) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Fatal: {e}");
            eprintln!("Fatal: {e}");
            ExitCode::FAILURE
        }
    }
}
