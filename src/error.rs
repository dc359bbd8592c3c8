use std::convert::From;
use toml;

#[derive(Debug)]
pub enum Error {
    IOError(std::io::Error),
    SetLoggerError(log::SetLoggerError),
    TOMLDeError(toml::de::Error),
    JSONError(serde_json::Error),
    CSVError(csv::Error),
    GlobError(globset::Error),
    PopenError(subprocess::PopenError),
    SyscommandTimeoutError {
        stdout: Option<String>,
        stderr: Option<String>,
    },
    SyscommandOutputLimitExceededError(usize),
    /// Invalid suite configuration. These are fatal and reported before any
    /// submission is processed.
    ConfigError(String),
    RawError(String),
}

impl std::error::Error for Error {}
impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IOError(e) => {
                write!(f, "[IOError] {e}")
            }
            Error::SetLoggerError(e) => {
                write!(f, "[SetLoggerError] {e}")
            }
            Error::TOMLDeError(e) => {
                write!(f, "[TOMLDeError] {e}")
            }
            Error::JSONError(e) => {
                write!(f, "[JSONError] {e}")
            }
            Error::CSVError(e) => {
                write!(f, "[CSVError] {e}")
            }
            Error::GlobError(e) => {
                write!(f, "[GlobError] {e}")
            }
            Error::PopenError(e) => {
                write!(f, "[PopenError] {e}")
            }
            Error::SyscommandTimeoutError { .. } => {
                write!(f, "[SyscommandTimeoutError]")
            }
            Error::SyscommandOutputLimitExceededError(s) => {
                write!(f, "[SyscommandOutputLimitExceededError] limit: {s}")
            }
            Error::ConfigError(s) => {
                write!(f, "[ConfigError] {s}")
            }
            Error::RawError(s) => {
                write!(f, "{s}")
            }
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IOError(e)
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(e: log::SetLoggerError) -> Self {
        Error::SetLoggerError(e)
    }
}

impl From<fern::InitError> for Error {
    fn from(e: fern::InitError) -> Self {
        match e {
            fern::InitError::Io(e) => Self::from(e),
            fern::InitError::SetLoggerError(e) => Self::from(e),
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::TOMLDeError(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::JSONError(e)
    }
}

impl From<csv::Error> for Error {
    fn from(e: csv::Error) -> Self {
        Error::CSVError(e)
    }
}

impl From<globset::Error> for Error {
    fn from(e: globset::Error) -> Self {
        Error::GlobError(e)
    }
}

impl From<subprocess::PopenError> for Error {
    fn from(e: subprocess::PopenError) -> Self {
        Error::PopenError(e)
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::RawError(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::RawError(String::from(s))
    }
}

impl Error {
    pub fn err_string<T>(s: String) -> Result<T, Self> {
        Err(Self::from(s))
    }
    pub fn err_str<T>(s: &str) -> Result<T, Self> {
        Err(Self::from(s))
    }
    pub fn config<T, S: Into<String>>(s: S) -> Result<T, Self> {
        Err(Error::ConfigError(s.into()))
    }

    /// Returns true if this error should abort the whole run rather than a
    /// single submission.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ConfigError(_) | Error::TOMLDeError(_))
    }
}
