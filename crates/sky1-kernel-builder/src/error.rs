use std::fmt;

/// Failure categories the pipeline distinguishes.
///
/// Every kind is fatal to the running stage; the kind only exists so callers
/// (and tests) can tell a guard rejection apart from an ordinary failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Other,
    /// A directory or file the stage needs is absent (config, patch set,
    /// prepared source, repository).
    MissingPrerequisite,
    /// One or more patches did not apply.
    PatchFailed,
    /// The prepared source no longer matches the patch set on disk.
    Stale,
    /// The upload would publish a lower revision than the repository holds.
    Downgrade,
    /// No build artifact matched the variant's patterns.
    NoArtifacts,
    /// An external command exited unsuccessfully.
    ToolFailed,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Other, msg)
    }

    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn missing<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::MissingPrerequisite, msg)
    }

    pub fn stale<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Stale, msg)
    }

    pub fn downgrade<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Downgrade, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Prefix the message while keeping the kind.
    pub fn context<C: fmt::Display>(self, ctx: C) -> Self {
        Self {
            kind: self.kind,
            msg: format!("{ctx}: {}", self.msg),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<globset::Error> for Error {
    fn from(err: globset::Error) -> Self {
        Self::msg(format!("invalid artifact pattern: {err}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::msg(format!("HTTP error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
