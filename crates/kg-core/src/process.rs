//! OS process table access
//!
//! Tunnel sessions are not recorded anywhere; they are whatever the process
//! table says at the moment of the query. Callers take a snapshot and act on
//! it immediately. A process listed in a snapshot may be gone by the time it
//! is signalled, which [`ProcessTable::terminate`] reports as `Ok(false)`.

use std::io;

/// One row of a process table snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    /// Full argv, program first
    pub args: Vec<String>,
}

impl ProcessEntry {
    pub fn new<I, S>(pid: u32, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pid,
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Read-live view of running processes
pub trait ProcessTable: Send + Sync {
    /// All processes visible to the current user, excluding this one
    fn snapshot(&self) -> Vec<ProcessEntry>;

    /// Ask `pid` to terminate
    ///
    /// Returns `Ok(false)` when the process no longer exists.
    fn terminate(&self, pid: u32) -> io::Result<bool>;
}

/// Process table of the running system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessTable;

impl ProcessTable for SystemProcessTable {
    fn snapshot(&self) -> Vec<ProcessEntry> {
        let system = sysinfo::System::new_all();
        let own_pid = std::process::id();

        system
            .processes()
            .iter()
            // Linux threads show up as tasks sharing the parent's argv
            .filter(|(_, process)| process.thread_kind().is_none())
            .map(|(pid, process)| ProcessEntry {
                pid: pid.as_u32(),
                args: process.cmd().iter().map(arg_to_string).collect(),
            })
            .filter(|entry| entry.pid != own_pid)
            .collect()
    }

    fn terminate(&self, pid: u32) -> io::Result<bool> {
        terminate_process(pid)
    }
}

fn arg_to_string(arg: impl AsRef<std::ffi::OsStr>) -> String {
    arg.as_ref().to_string_lossy().into_owned()
}

/// Send SIGTERM to `pid`; `Ok(false)` if it already exited
#[cfg(unix)]
pub fn terminate_process(pid: u32) -> io::Result<bool> {
    let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if result == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
pub fn terminate_process(pid: u32) -> io::Result<bool> {
    let system = sysinfo::System::new_all();
    match system.process(sysinfo::Pid::from_u32(pid)) {
        Some(process) => Ok(process.kill()),
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminate_vanished_process_is_benign() {
        assert!(!terminate_process(999_999_999).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_snapshot_sees_child_and_terminate_stops_it() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();

        let table = SystemProcessTable;
        let entry = table
            .snapshot()
            .into_iter()
            .find(|e| e.pid == pid)
            .expect("child in snapshot");
        assert_eq!(entry.args, vec!["sleep".to_string(), "30".to_string()]);
        assert!(table.snapshot().iter().all(|e| e.pid != std::process::id()));

        assert!(table.terminate(pid).unwrap());
        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
