use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    MissingInput,
    Filesystem,
    Config,
    Other,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::MissingInput => "missing-input",
            ErrorKind::Filesystem => "filesystem",
            ErrorKind::Config => "config",
            ErrorKind::Other => "other",
        }
    }
}

#[derive(Debug)]
pub enum Error {
    Transport(String),
    MissingInput(PathBuf),
    Filesystem(String),
    Config(String),
    Other(String),
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::Other(msg.into())
    }

    pub fn transport<M: Into<String>>(msg: M) -> Self {
        Self::Transport(msg.into())
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::Config(msg.into())
    }

    /// Filesystem error with the offending path and operation in the message.
    pub fn io(op: &str, path: &Path, err: std::io::Error) -> Self {
        Self::Filesystem(format!("failed to {op} {}: {err}", path.display()))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(_) => ErrorKind::Transport,
            Error::MissingInput(_) => ErrorKind::MissingInput,
            Error::Filesystem(_) => ErrorKind::Filesystem,
            Error::Config(_) => ErrorKind::Config,
            Error::Other(_) => ErrorKind::Other,
        }
    }

    // Prefix the message while keeping the variant intact.
    pub fn context(self, prefix: &str) -> Self {
        match self {
            Error::Transport(m) => Error::Transport(format!("{prefix}: {m}")),
            Error::Filesystem(m) => Error::Filesystem(format!("{prefix}: {m}")),
            Error::Config(m) => Error::Config(format!("{prefix}: {m}")),
            Error::Other(m) => Error::Other(format!("{prefix}: {m}")),
            missing @ Error::MissingInput(_) => missing,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport(m) => write!(f, "transport error: {m}"),
            Error::MissingInput(p) => write!(
                f,
                "required input {} is missing; ensure it is in the workspace root",
                p.display()
            ),
            Error::Filesystem(m) => write!(f, "{m}"),
            Error::Config(m) => write!(f, "config error: {m}"),
            Error::Other(m) => write!(f, "{m}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Filesystem(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<walkdir::Error> for Error {
    fn from(err: walkdir::Error) -> Self {
        Self::Filesystem(err.to_string())
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Filesystem(format!("container error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keeps_variant() {
        let e = Error::transport("status 404").context("task 'layout.payload' failed");
        assert_eq!(e.kind(), ErrorKind::Transport);
        assert_eq!(
            e.to_string(),
            "transport error: task 'layout.payload' failed: status 404"
        );

        let missing = Error::MissingInput(PathBuf::from("config.json")).context("ignored");
        assert_eq!(missing.kind(), ErrorKind::MissingInput);
    }
}
