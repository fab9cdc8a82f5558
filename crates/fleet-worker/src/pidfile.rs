//! Process-id file used by `start` and `stop`.

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PidFileError {
    #[error("Could not access pid file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Pid file {0} does not contain a process id")]
    Invalid(PathBuf),

    #[error("Could not signal process {pid}: {reason}")]
    Signal { pid: i32, reason: String },
}

#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record the current process.
    pub fn write_current(&self) -> Result<(), PidFileError> {
        self.write(std::process::id())
    }

    pub fn write(&self, pid: u32) -> Result<(), PidFileError> {
        std::fs::write(&self.path, pid.to_string()).map_err(|source| self.io(source))
    }

    pub fn read(&self) -> Result<i32, PidFileError> {
        let content = std::fs::read_to_string(&self.path).map_err(|source| self.io(source))?;
        content
            .trim()
            .parse::<i32>()
            .ok()
            .filter(|pid| *pid > 0)
            .ok_or_else(|| PidFileError::Invalid(self.path.clone()))
    }

    /// Remove the file. A file that is already gone is not an error.
    pub fn remove(&self) -> Result<(), PidFileError> {
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(self.io(e)),
            _ => Ok(()),
        }
    }

    /// Interrupt the recorded process, then remove the file.
    pub fn stop(&self) -> Result<i32, PidFileError> {
        let pid = self.read()?;
        interrupt(pid)?;
        self.remove()?;
        Ok(pid)
    }

    fn io(&self, source: io::Error) -> PidFileError {
        PidFileError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(unix)]
fn interrupt(pid: i32) -> Result<(), PidFileError> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid), Signal::SIGINT).map_err(|e| PidFileError::Signal {
        pid,
        reason: e.to_string(),
    })
}

#[cfg(not(unix))]
fn interrupt(pid: i32) -> Result<(), PidFileError> {
    Err(PidFileError::Signal {
        pid,
        reason: "signalling processes is only supported on unix".to_string(),
    })
}
