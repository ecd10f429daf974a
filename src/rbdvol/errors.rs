// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{error::Error, fmt, io, process::ExitStatus};

use strum_macros::{AsRefStr, Display};

pub type RbdVolResult<T> = Result<T, RbdVolError>;

/// The failure kinds a volume lifecycle operation can report.
#[derive(Debug, Clone, Copy, Eq, PartialEq, AsRefStr, Display)]
#[cfg_attr(test, derive(strum_macros::EnumIter))]
pub enum ErrorEnum {
    #[strum(serialize = "ParseError")]
    Parse,
    #[strum(serialize = "BackendError")]
    Backend,
    #[strum(serialize = "ProvisionError")]
    Provision,
    #[strum(serialize = "LockError")]
    Lock,
    #[strum(serialize = "AttachError")]
    Attach,
    #[strum(serialize = "FormatError")]
    Format,
    #[strum(serialize = "MountError")]
    Mount,
    #[strum(serialize = "StateNotFoundError")]
    StateNotFound,
}

#[derive(Debug)]
pub enum RbdVolError {
    Msg(String),
    Engine(ErrorEnum, String),
    Chained(String, Box<RbdVolError>),
    BinariesNotFound {
        names: Vec<String>,
        locations: Vec<String>,
    },
    CommandExecutionFailure {
        cmd: String,
        err: io::Error,
    },
    CommandFailure {
        cmd: String,
        status: ExitStatus,
        stderr: String,
    },
    Io(io::Error),
    Nix(nix::Error),
    Serde(serde_json::error::Error),
    Join(tokio::task::JoinError),
    Hyper(hyper::Error),
}

impl RbdVolError {
    /// Classify a lower level failure as a lifecycle error of the given
    /// kind. The cause is folded into the message, since the caller only
    /// ever sees a single string.
    pub fn engine<D>(kind: ErrorEnum, context: D, cause: &RbdVolError) -> RbdVolError
    where
        D: fmt::Display,
    {
        RbdVolError::Engine(kind, format!("{context}: {cause}"))
    }

    /// The lifecycle kind of the outermost engine error, if any.
    pub fn kind(&self) -> Option<ErrorEnum> {
        match self {
            RbdVolError::Engine(kind, _) => Some(*kind),
            RbdVolError::Chained(_, cause) => cause.kind(),
            _ => None,
        }
    }
}

impl fmt::Display for RbdVolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RbdVolError::Msg(s) => write!(f, "{s}"),
            RbdVolError::Engine(kind, msg) => write!(f, "{kind}: {msg}"),
            RbdVolError::Chained(msg, chained) => write!(f, "{msg}; {chained}"),
            RbdVolError::BinariesNotFound { names, locations } => write!(
                f,
                "Executables {} could not be found in any of {}",
                names.join(", "),
                locations.join(", ")
            ),
            RbdVolError::CommandExecutionFailure { cmd, err } => {
                write!(f, "Failed to execute command {cmd}: {err}")
            }
            RbdVolError::CommandFailure {
                cmd,
                status,
                stderr,
            } => {
                let stderr = stderr.trim();
                if stderr.is_empty() {
                    write!(f, "Command {cmd} failed with {status}")
                } else {
                    write!(f, "Command {cmd} failed with {status}: {stderr}")
                }
            }
            RbdVolError::Io(err) => write!(f, "IO error: {err}"),
            RbdVolError::Nix(err) => write!(f, "Nix error: {err}"),
            RbdVolError::Serde(err) => write!(f, "Serde error: {err}"),
            RbdVolError::Join(err) => write!(f, "Thread joining error: {err}"),
            RbdVolError::Hyper(err) => write!(f, "HTTP error: {err}"),
        }
    }
}

impl Error for RbdVolError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RbdVolError::Msg(_)
            | RbdVolError::Engine(_, _)
            | RbdVolError::BinariesNotFound { .. }
            | RbdVolError::CommandFailure { .. } => None,
            RbdVolError::Chained(_, err) => Some(err),
            RbdVolError::CommandExecutionFailure { err, .. } | RbdVolError::Io(err) => Some(err),
            RbdVolError::Nix(err) => Some(err),
            RbdVolError::Serde(err) => Some(err),
            RbdVolError::Join(err) => Some(err),
            RbdVolError::Hyper(err) => Some(err),
        }
    }
}

impl From<io::Error> for RbdVolError {
    fn from(err: io::Error) -> RbdVolError {
        RbdVolError::Io(err)
    }
}

impl From<nix::Error> for RbdVolError {
    fn from(err: nix::Error) -> RbdVolError {
        RbdVolError::Nix(err)
    }
}

impl From<serde_json::error::Error> for RbdVolError {
    fn from(err: serde_json::error::Error) -> RbdVolError {
        RbdVolError::Serde(err)
    }
}

impl From<tokio::task::JoinError> for RbdVolError {
    fn from(err: tokio::task::JoinError) -> RbdVolError {
        RbdVolError::Join(err)
    }
}

impl From<hyper::Error> for RbdVolError {
    fn from(err: hyper::Error) -> RbdVolError {
        RbdVolError::Hyper(err)
    }
}
