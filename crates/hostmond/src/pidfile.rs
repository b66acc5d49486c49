//! Pid-file handling.
//!
//! The pid-file records the agent's process id for service managers. A
//! file naming a live process blocks startup; a stale one is replaced.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;

use tracing::{debug, warn};

/// An owned pid-file, removed exactly once.
///
/// Removal happens on [`PidFile::remove`] or, failing that, on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    armed: bool,
}

impl PidFile {
    /// Writes the current process id to `path`.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, PidFileError> {
        let path = path.into();

        if let Some(pid) = read_pid(&path) {
            if is_process_running(pid) {
                return Err(PidFileError::AlreadyRunning { pid, path });
            }
            warn!(path = %path.display(), pid, "Replacing stale pid-file");
        }

        let write_error = |e: std::io::Error| PidFileError::Write {
            path: path.clone(),
            error: e.to_string(),
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_error)?;
        }
        let mut file = fs::File::create(&path).map_err(write_error)?;
        writeln!(file, "{}", process::id()).map_err(write_error)?;

        debug!(path = %path.display(), pid = process::id(), "Pid-file written");
        Ok(Self { path, armed: true })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the file now.
    pub fn remove(mut self) {
        self.remove_once();
    }

    fn remove_once(&mut self) {
        if !std::mem::replace(&mut self.armed, false) {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Pid-file removed"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Cannot remove pid-file"),
        }
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        self.remove_once();
    }
}

/// Reads the pid recorded in `path`, if any.
pub fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Checks if a process with the given pid exists.
pub fn is_process_running(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

/// Errors that can occur while creating the pid-file.
#[derive(Debug, thiserror::Error)]
pub enum PidFileError {
    #[error("Agent already running (pid {pid}, pid-file {})", path.display())]
    AlreadyRunning { pid: u32, path: PathBuf },

    #[error("Cannot write pid-file {}: {error}", path.display())]
    Write { path: PathBuf, error: String },
}
