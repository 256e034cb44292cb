use std::{error::Error, fmt::Display};

/// A malformed changeset or resource, or a mutation the ledger refuses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
}
impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        ValidationError {
            message: message.into(),
        }
    }
}
impl Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "validation failed: {}", self.message)
    }
}
impl Error for ValidationError {}

/// A status transition that the transition table does not allow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FsmError {
    pub from: String,
    pub to: String,
}
impl Display for FsmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "status transition from {} to {} is not allowed",
            self.from, self.to
        )
    }
}
impl Error for FsmError {}

/// An external command exited with a nonzero status.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskFailed {
    pub command: String,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stderr: String,
}
impl Display for TaskFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "command `{}' exited with {}", self.command, code)?,
            None => write!(f, "command `{}' was terminated by a signal", self.command)?,
        }
        let stderr = self.stderr.trim_end();
        if !stderr.is_empty() {
            write!(f, ": {}", stderr)?;
        }
        Ok(())
    }
}
impl Error for TaskFailed {}

/// Polling `rctl -u` for a jail failed.
#[derive(Clone, Debug)]
pub struct RctlUpdateFailed(pub TaskFailed);
impl Display for RctlUpdateFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "could not update rctl usage")
    }
}
impl Error for RctlUpdateFailed {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.0)
    }
}

/// Polling `zfs list` failed.
#[derive(Clone, Debug)]
pub struct ZfsStatUpdateFailed(pub TaskFailed);
impl Display for ZfsStatUpdateFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "could not update zfs statistics")
    }
}
impl Error for ZfsStatUpdateFailed {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.0)
    }
}

/// A jail refused an operation in its current state.
#[derive(Clone, Debug)]
pub struct JailError {
    pub jail: String,
    pub message: String,
}
impl Display for JailError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "jail {}: {}", self.jail, self.message)
    }
}
impl Error for JailError {}

/// A world rebuild step could not proceed.
#[derive(Clone, Debug)]
pub struct WorldError {
    pub world: String,
    pub message: String,
}
impl Display for WorldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "world {}: {}", self.world, self.message)
    }
}
impl Error for WorldError {}
