use derive_more::derive::{Display, Error};
use std::path::{Path, PathBuf};

use crate::error::Error as GraderError;
use crate::settings::BuildSettings;
use crate::template::{self, TemplateError};
use crate::utils::{path_to_string, syscommand_timeout, SyscommandSettings};

/// Why a build did not produce a usable result.
#[derive(Debug, Display, Error)]
pub enum BuildFailure {
    #[display("could not start \"{command}\": {message}")]
    Spawn { command: String, message: String },
    #[display("\"{command}\" exited with code {code}")]
    ExitCode {
        command: String,
        code: i32,
        captured_stdout: String,
        captured_stderr: String,
    },
    #[display("\"{command}\" did not finish within {timeout} seconds")]
    Timeout {
        command: String,
        timeout: u64,
        captured_stdout: Option<String>,
        captured_stderr: Option<String>,
    },
    #[display("\"{command}\" exceeded the output limit of {limit} bytes")]
    OutputLimitExceeded { command: String, limit: usize },
    #[display("\"{command}\" failed: {message}")]
    Failed { command: String, message: String },
    #[display("{source}")]
    Template { source: TemplateError },
    #[display("could not prepare {path}: {message}")]
    Filesystem { path: String, message: String },
}

impl BuildFailure {
    /// Output captured from the failing command, if any.
    pub fn captured_output(&self) -> Option<(&str, &str)> {
        match self {
            BuildFailure::ExitCode {
                captured_stdout,
                captured_stderr,
                ..
            } => Some((captured_stdout, captured_stderr)),
            BuildFailure::Timeout {
                captured_stdout,
                captured_stderr,
                ..
            } => Some((
                captured_stdout.as_deref().unwrap_or(""),
                captured_stderr.as_deref().unwrap_or(""),
            )),
            _ => None,
        }
    }
}

impl From<TemplateError> for BuildFailure {
    fn from(source: TemplateError) -> Self {
        BuildFailure::Template { source }
    }
}

fn fs_failure(path: &Path) -> impl Fn(std::io::Error) -> BuildFailure + '_ {
    move |e| BuildFailure::Filesystem {
        path: path.display().to_string(),
        message: e.to_string(),
    }
}

/// Runs the prepare, compile and post commands of `cfg`, in that order.
///
/// Commands run with the build root as their working directory. A missing or
/// empty build root means an in-place build in `source_root`. A separate
/// build root is deleted and recreated first.
pub fn build(
    source_root: &Path,
    build_root: Option<&Path>,
    cfg: &BuildSettings,
) -> Result<(), BuildFailure> {
    let build_root: PathBuf = match build_root {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => source_root.to_path_buf(),
    };

    if build_root != source_root && build_root.is_dir() {
        log::debug!("Removing old build directory {}", build_root.display());
        std::fs::remove_dir_all(&build_root).map_err(fs_failure(&build_root))?;
    }
    std::fs::create_dir_all(&build_root).map_err(fs_failure(&build_root))?;

    let mut values = cfg.template_values();
    let to_string = |p: &Path| {
        path_to_string(p).map_err(|e| BuildFailure::Filesystem {
            path: p.display().to_string(),
            message: e.to_string(),
        })
    };
    values.insert("source_dir".to_string(), to_string(source_root)?);
    values.insert("build_dir".to_string(), to_string(&build_root)?);

    for cmd in cfg
        .prep_cmd
        .iter()
        .chain(cfg.compile_cmd.iter())
        .chain(cfg.post_cmd.iter())
    {
        let args = template::substitute_all(cmd, &values)?;
        run_build_command(&args, &build_root, cfg)?;
    }
    Ok(())
}

fn run_build_command(args: &[String], cwd: &Path, cfg: &BuildSettings) -> Result<(), BuildFailure> {
    let command = args.join(" ");
    log::info!("Running build command: {command}");

    match syscommand_timeout(
        args,
        SyscommandSettings {
            timeout: cfg.command_timeout(),
            max_stdout_length: Some(cfg.max_output),
            max_stderr_length: Some(cfg.max_output),
            cwd: Some(cwd.to_path_buf()),
            ..Default::default()
        },
    ) {
        Ok(output) if output.code == 0 => {
            log::debug!("Build command output:\n{}{}", output.stdout, output.stderr);
            Ok(())
        }
        Ok(output) => Err(BuildFailure::ExitCode {
            command,
            code: output.code,
            captured_stdout: output.stdout,
            captured_stderr: output.stderr,
        }),
        Err(GraderError::SyscommandTimeoutError { stdout, stderr }) => {
            Err(BuildFailure::Timeout {
                command,
                timeout: cfg.timeout,
                captured_stdout: stdout,
                captured_stderr: stderr,
            })
        }
        Err(GraderError::SyscommandOutputLimitExceededError(limit)) => {
            Err(BuildFailure::OutputLimitExceeded { command, limit })
        }
        Err(GraderError::PopenError(e)) => Err(BuildFailure::Spawn {
            command,
            message: e.to_string(),
        }),
        Err(e) => Err(BuildFailure::Failed {
            command,
            message: e.to_string(),
        }),
    }
}
