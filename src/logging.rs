//! Per-submission log files.
//!
//! Every worker thread may attach one log file at a time. Records emitted by
//! that thread while the file is attached are copied into it, so submissions
//! graded on different threads never share a log file.

use std::{
    cell::RefCell,
    fs::File,
    io::Write,
    path::Path,
};

use crate::error::Error;

struct Sink {
    out: Box<dyn Write>,
    level: log::LevelFilter,
}

thread_local! {
    static SINK: RefCell<Option<Sink>> = const { RefCell::new(None) };
}

/// Detaches the submission log of the current thread when dropped.
#[must_use]
pub struct SubmissionLog {
    _private: (),
}

impl SubmissionLog {
    /// Truncates the file at `path` and starts routing the records of the
    /// current thread into it. Errors are always written, everything down to
    /// debug when `debug` is set.
    pub fn attach<P: AsRef<Path>>(path: P, debug: bool) -> Result<Self, Error> {
        let file = File::create(path.as_ref())?;
        Ok(Self::install(Box::new(file), debug))
    }

    /// Like `attach`, but appends to an existing log.
    pub fn append<P: AsRef<Path>>(path: P, debug: bool) -> Result<Self, Error> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self::install(Box::new(file), debug))
    }

    fn install(out: Box<dyn Write>, debug: bool) -> Self {
        let level = if debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Error
        };
        SINK.with(|s| *s.borrow_mut() = Some(Sink { out, level }));
        SubmissionLog { _private: () }
    }
}

impl Drop for SubmissionLog {
    fn drop(&mut self) {
        SINK.with(|s| {
            if let Some(mut sink) = s.borrow_mut().take() {
                if let Err(e) = sink.out.flush() {
                    eprintln!("Error flushing the submission log: {e}");
                }
            }
        });
    }
}

/// Output hook for the global logger. Receives already formatted records.
///
/// Write errors go to stderr; logging them would re-enter this hook.
pub fn forward_to_submission_log(record: &log::Record) {
    SINK.with(|s| {
        if let Ok(mut guard) = s.try_borrow_mut() {
            if let Some(sink) = guard.as_mut() {
                if record.level() <= sink.level {
                    if let Err(e) = writeln!(sink.out, "{}", record.args()) {
                        eprintln!("Error writing to the submission log: {e}");
                    }
                }
            }
        }
    });
}

/// Appends a transcript to a log file, creating it if needed.
pub fn write_transcript<P: AsRef<Path>>(path: P, lines: &str) -> Result<(), Error> {
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path.as_ref())?;
    f.write_all(lines.as_bytes())?;
    if !lines.is_empty() && !lines.ends_with('\n') {
        f.write_all(b"\n")?;
    }
    Ok(())
}
