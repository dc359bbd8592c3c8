use crate::error::Error;
use std::{
    ffi::OsString,
    fs::File,
    io::{Read, Write},
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use subprocess::{ExitStatus, Popen, PopenConfig, Redirection};

/// Trims single newlines from the input string, returning a new string with
/// single newlines converted to spaces.
pub fn single_linefeed_to_space<S: AsRef<str>>(s: S) -> String {
    let s = s.as_ref().trim();
    if let (Some(offset_1), Some(offset_2), Some(lst)) = (
        s.split_at_checked(1),
        s.split_at_checked(2),
        s.chars().last(),
    ) {
        let mut ret = String::new();
        ret.extend(offset_1.0.chars());
        ret.extend(
            s.chars()
                .zip(offset_1.1.chars())
                .zip(offset_2.1.chars())
                .map(|((c_prev, c_mid), c_next)| {
                    if c_mid == '\n' && c_prev != '\n' && c_next != '\n' {
                        ' '
                    } else {
                        c_mid
                    }
                }),
        );
        ret.push(lst);
        ret
    } else {
        s.to_string()
    }
}

/// Joins two file system paths together.
pub fn path_join<A: AsRef<Path>, B: AsRef<Path>>(a: A, b: B) -> Result<String, Error> {
    a.as_ref()
        .join(b.as_ref())
        .to_str()
        .map(String::from)
        .ok_or(Error::from("Could not convert path to a string."))
}

/// Joins two file system paths together and returns the absolute path of the
/// result.
pub fn path_absolute_join<A: AsRef<Path>, B: AsRef<Path>>(a: A, b: B) -> Result<String, Error> {
    std::path::absolute(a.as_ref().join(b.as_ref()))?
        .to_str()
        .map(String::from)
        .ok_or(Error::from("Could not convert path to a string."))
}

/// Converts a path to an owned string, failing on non-UTF-8 paths.
pub fn path_to_string<P: AsRef<Path>>(path: P) -> Result<String, Error> {
    path.as_ref()
        .to_str()
        .map(String::from)
        .ok_or_else(|| Error::from(format!("Invalid UTF-8 path {:?}", path.as_ref())))
}

/// Creates a directory if it does not already exist.
pub fn create_dir_if_not_exists<P: AsRef<Path>>(path: P) -> Result<(), Error> {
    if !std::fs::exists(path.as_ref())? {
        std::fs::create_dir_all(path.as_ref())?;
    }
    Ok(())
}

/// Removes the directory (if present) and creates it again, empty.
pub fn recreate_dir<P: AsRef<Path>>(path: P) -> Result<(), Error> {
    if std::fs::exists(path.as_ref())? {
        std::fs::remove_dir_all(path.as_ref())?;
    }
    std::fs::create_dir_all(path.as_ref())?;
    Ok(())
}

/// Copies the contents of `src` into `dst`, overwriting files that already
/// exist in `dst`.
pub fn copy_tree<A: AsRef<Path>, B: AsRef<Path>>(src: A, dst: B) -> Result<(), Error> {
    dircpy::CopyBuilder::new(src.as_ref(), dst.as_ref())
        .overwrite(true)
        .run()
        .map_err(|e| {
            Error::from(format!(
                "Could not copy {:?} to {:?}: {e}",
                src.as_ref(),
                dst.as_ref()
            ))
        })
}

#[derive(Debug, Clone)]
pub struct SyscommandSettings {
    pub timeout: Duration,
    /// Any other exit code is an error. Every code is accepted when unset.
    pub expected_code: Option<i32>,
    pub stdin: Option<String>,
    /// Captures stdout, failing once more than this many bytes arrive.
    /// Stdout is inherited when unset.
    pub max_stdout_length: Option<usize>,
    /// Same as `max_stdout_length`, for stderr.
    pub max_stderr_length: Option<usize>,
    /// Working directory of the child. The parent's working directory is
    /// never changed.
    pub cwd: Option<PathBuf>,
}

impl Default for SyscommandSettings {
    fn default() -> Self {
        SyscommandSettings {
            timeout: Duration::from_secs(60),
            expected_code: None,
            stdin: None,
            max_stdout_length: None,
            max_stderr_length: None,
            cwd: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyscommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

const STDOUT: mio::Token = mio::Token(1);
const STDERR: mio::Token = mio::Token(2);

/// One pipe's worth of read size, so a readable event empties the pipe.
const READ_CHUNK: usize = 64 * 1024;

/// Bytes collected from one output stream of the child.
struct Capture {
    buf: Vec<u8>,
    limit: usize,
}

impl Capture {
    fn new(limit: Option<usize>) -> Self {
        Capture {
            buf: vec![],
            limit: limit.unwrap_or(0),
        }
    }

    /// Reads once from `pipe`. Returns the number of bytes read.
    fn read_from(&mut self, pipe: &mut File, chunk: &mut [u8]) -> Result<usize, Error> {
        let n = pipe.read(chunk)?;
        self.buf.extend_from_slice(&chunk[..n]);
        if self.buf.len() > self.limit {
            return Err(Error::SyscommandOutputLimitExceededError(self.limit));
        }
        Ok(n)
    }

    /// Reads until end of file. Only safe once the child has exited.
    fn drain(&mut self, pipe: Option<&mut File>, chunk: &mut [u8]) -> Result<(), Error> {
        if let Some(pipe) = pipe {
            while self.read_from(pipe, chunk)? > 0 {}
        }
        Ok(())
    }

    fn into_string(self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

fn redirection(limit: Option<usize>) -> Redirection {
    match limit {
        Some(_) => Redirection::Pipe,
        None => Redirection::None,
    }
}

/// Reads the child's output until it exits or `deadline` passes. Returns
/// `None` on timeout.
fn wait_capturing(
    handle: &mut Popen,
    out: &mut Capture,
    err: &mut Capture,
    deadline: Option<Instant>,
) -> Result<Option<ExitStatus>, Error> {
    let mut poll = mio::Poll::new()?;
    let mut events = mio::Events::with_capacity(16);
    for (pipe, token) in [(&handle.stdout, STDOUT), (&handle.stderr, STDERR)] {
        if let Some(f) = pipe {
            poll.registry().register(
                &mut mio::unix::SourceFd(&f.as_raw_fd()),
                token,
                mio::Interest::READABLE,
            )?;
        }
    }

    let mut chunk = vec![0u8; READ_CHUNK];
    let mut status = None;
    while status.is_none() && deadline.map_or(true, |d| Instant::now() < d) {
        poll.poll(&mut events, Some(Duration::from_millis(100)))?;
        for event in events.iter() {
            match event.token() {
                STDOUT => {
                    if let Some(f) = handle.stdout.as_mut() {
                        out.read_from(f, &mut chunk)?;
                    }
                }
                STDERR => {
                    if let Some(f) = handle.stderr.as_mut() {
                        err.read_from(f, &mut chunk)?;
                    }
                }
                _ => {}
            }
        }
        status = handle.poll();
    }

    if status.is_some() {
        out.drain(handle.stdout.as_mut(), &mut chunk)?;
        err.drain(handle.stderr.as_mut(), &mut chunk)?;
    }
    Ok(status)
}

fn exit_code(status: ExitStatus, expected: Option<i32>) -> Result<i32, Error> {
    match status {
        ExitStatus::Exited(code) => {
            let code = code as i32;
            match expected {
                Some(e) if e != code => Err(format!("Exited with unexpected code {code}").into()),
                _ => Ok(code),
            }
        }
        ExitStatus::Signaled(sig) => Err(format!("Terminated by signal {sig}").into()),
        ExitStatus::Other(v) => Err(format!("Unknown exit status {v}").into()),
        ExitStatus::Undetermined => Err("Undetermined error".into()),
    }
}

/// Runs a command with a timeout, in `cwd` when one is given.
///
/// Streams with a length limit are captured; a stream that grows past its
/// limit kills the child and fails with
/// `Error::SyscommandOutputLimitExceededError`. A timeout kills the child
/// and returns what was captured in `Error::SyscommandTimeoutError`.
///
/// ```
/// use batch_grader::utils::{syscommand_timeout, SyscommandSettings};
///
/// let ret = syscommand_timeout(
///     ["echo", "foo"],
///     SyscommandSettings {
///         max_stdout_length: Some(16),
///         ..Default::default()
///     },
/// )
/// .unwrap();
/// assert_eq!(ret.stdout, "foo\n");
/// ```
pub fn syscommand_timeout<S: AsRef<str>, CmdList: AsRef<[S]>>(
    cmd: CmdList,
    cmd_settings: SyscommandSettings,
) -> Result<SyscommandOutput, Error> {
    let args: Vec<OsString> = cmd
        .as_ref()
        .iter()
        .map(|s| OsString::from(s.as_ref()))
        .collect();
    if args.is_empty() {
        return Error::err_str("Cannot run an empty command");
    }

    // Removed when dropped, after the child is gone.
    let stdin_file = match &cmd_settings.stdin {
        Some(s) => {
            let mut f = tempfile::NamedTempFile::new()?;
            f.write_all(s.as_bytes())?;
            f.flush()?;
            Some(f)
        }
        None => None,
    };

    let mut handle = Popen::create(
        &args,
        PopenConfig {
            stdin: match &stdin_file {
                Some(f) => Redirection::File(f.reopen()?),
                None => Redirection::None,
            },
            stdout: redirection(cmd_settings.max_stdout_length),
            stderr: redirection(cmd_settings.max_stderr_length),
            cwd: cmd_settings.cwd.as_ref().map(|p| p.as_os_str().to_owned()),
            ..Default::default()
        },
    )?;

    let mut out = Capture::new(cmd_settings.max_stdout_length);
    let mut err = Capture::new(cmd_settings.max_stderr_length);
    let deadline = Instant::now().checked_add(cmd_settings.timeout);

    let status = wait_capturing(&mut handle, &mut out, &mut err, deadline).inspect_err(|e| {
        log::warn!("Killing {:?} after an error while waiting for it: {e}", args[0]);
        handle
            .kill()
            .unwrap_or_else(|e| log::error!("Could not kill process: {e}"));
    })?;

    match status {
        Some(status) => Ok(SyscommandOutput {
            code: exit_code(status, cmd_settings.expected_code)?,
            stdout: out.into_string(),
            stderr: err.into_string(),
        }),
        None => {
            handle
                .kill()
                .unwrap_or_else(|e| log::warn!("Could not kill timed out process: {e}"));
            Err(Error::SyscommandTimeoutError {
                stdout: Some(out.into_string()),
                stderr: Some(err.into_string()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asserting::prelude::*;

    #[test]
    fn test_path_join() {
        assert_that!(path_join("foo", "bar")).has_value("foo/bar");
        assert_that!(path_join("/foo", "bar")).has_value("/foo/bar");
        assert_that!(path_join("/foo", "/bar")).has_value("/bar");
        assert_that!(path_join("foo/bar", "babar.txt")).has_value("foo/bar/babar.txt");
    }

    #[test]
    fn test_single_linefeed_to_space() {
        assert_that!(single_linefeed_to_space("bla bla")).is_equal_to("bla bla");
        assert_that!(single_linefeed_to_space(" ")).is_equal_to("");
        assert_that!(single_linefeed_to_space("a")).is_equal_to("a");
        assert_that!(single_linefeed_to_space("   foo\nbar  ")).is_equal_to("foo bar");
        assert_that!(single_linefeed_to_space("\n\nfoo\nbar\n\nbabar"))
            .is_equal_to("foo bar\n\nbabar");
    }

    #[test]
    fn test_copy_tree_overwrites() {
        let base = tempfile::tempdir().unwrap();
        let over = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        std::fs::write(base.path().join("main.c"), "stub").unwrap();
        std::fs::write(base.path().join("Makefile"), "all:").unwrap();
        std::fs::write(over.path().join("main.c"), "student").unwrap();

        copy_tree(base.path(), dest.path()).unwrap();
        copy_tree(over.path(), dest.path()).unwrap();

        assert_that!(std::fs::read_to_string(dest.path().join("main.c")).unwrap())
            .is_equal_to("student".to_string());
        assert_that!(std::fs::read_to_string(dest.path().join("Makefile")).unwrap())
            .is_equal_to("all:".to_string());
    }

    #[test]
    fn test_recreate_dir_empties() {
        let d = tempfile::tempdir().unwrap();
        let target = d.path().join("work");
        std::fs::create_dir_all(target.join("old")).unwrap();
        recreate_dir(&target).unwrap();
        assert_that!(target.exists()).is_true();
        assert_that!(target.join("old").exists()).is_false();
    }

    #[test]
    fn test_syscommand_simple() {
        let ret = syscommand_timeout(
            ["echo", "foo"],
            SyscommandSettings {
                max_stdout_length: Some(10),
                ..Default::default()
            },
        );
        assert_that!(&ret).is_ok();
        assert_that!(&ret)
            .ok()
            .mapping(|s| &s.stdout)
            .is_equal_to("foo\n");
    }

    #[test]
    fn test_syscommand_cwd() {
        let d = tempfile::tempdir().unwrap();
        std::fs::write(d.path().join("marker.txt"), "here").unwrap();
        let ret = syscommand_timeout(
            ["cat", "marker.txt"],
            SyscommandSettings {
                max_stdout_length: Some(64),
                cwd: Some(d.path().to_path_buf()),
                ..Default::default()
            },
        );
        assert_that!(ret.unwrap().stdout).is_equal_to("here".to_string());
    }

    #[test]
    fn test_syscommand_stdin() {
        let example_stdin = "0123456789qwertyFOO_BAR".repeat(400);
        let ret = syscommand_timeout(
            ["cat"],
            SyscommandSettings {
                max_stdout_length: Some(1024 * 1024),
                stdin: Some(example_stdin.clone()),
                ..Default::default()
            },
        );
        assert_that!(&ret).is_ok();
        assert_that!(&ret)
            .ok()
            .mapping(|s| &s.stdout)
            .is_equal_to(&example_stdin);
    }

    #[test]
    fn test_syscommand_with_timeout() {
        let ret = syscommand_timeout(
            ["sleep", "2"],
            SyscommandSettings {
                timeout: Duration::from_secs(1),
                ..Default::default()
            },
        );
        assert_that!(&ret).is_err();
        assert_that!(&ret).err().satisfies(|e| match e {
            Error::SyscommandTimeoutError { .. } => true,
            _ => false,
        });
    }

    #[test]
    fn test_syscommand_output_limit() {
        let ret = syscommand_timeout(
            ["sh", "-c", "yes | head -c 100000"],
            SyscommandSettings {
                max_stdout_length: Some(1000),
                ..Default::default()
            },
        );
        assert_that!(&ret).err().satisfies(|e| {
            matches!(e, Error::SyscommandOutputLimitExceededError(1000))
        });
    }

    #[test]
    fn test_syscommand_expected_code() {
        let ok = syscommand_timeout(
            ["sh", "-c", "echo oops >&2; exit 3"],
            SyscommandSettings {
                max_stderr_length: Some(64),
                ..Default::default()
            },
        )
        .unwrap();
        assert_that!(ok.code).is_equal_to(3);
        assert_that!(ok.stderr).is_equal_to("oops\n".to_string());

        let strict = syscommand_timeout(
            ["false"],
            SyscommandSettings {
                expected_code: Some(0),
                ..Default::default()
            },
        );
        assert_that!(strict).is_err();
    }

    #[test]
    fn test_syscommand_missing_executable() {
        let ret = syscommand_timeout(
            ["definitely-not-a-real-binary-4711"],
            SyscommandSettings::default(),
        );
        assert_that!(&ret).is_err();
    }
}
