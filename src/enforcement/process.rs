//! Process enumeration and termination.

use parking_lot::Mutex;
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    /// Seconds since the Unix epoch.
    pub start_time: u64,
}

/// Why a termination request failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TerminateError {
    /// The process exited before it could be killed.
    #[error("process not found")]
    NotFound,
    #[error("access denied: {0}")]
    AccessDenied(String),
}

impl TerminateError {
    pub fn into_engine_error(self, pid: u32) -> EngineError {
        EngineError::ProcessAccess {
            pid,
            reason: self.to_string(),
        }
    }
}

pub trait ProcessTable: Send + Sync {
    fn list_processes(&self) -> Vec<ProcessInfo>;

    fn terminate(&self, pid: u32) -> Result<(), TerminateError>;
}

/// Process table backed by `sysinfo`.
pub struct SystemProcessTable {
    system: Mutex<System>,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SystemProcessTable {
    fn list_processes(&self) -> Vec<ProcessInfo> {
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::All, true);

        system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessInfo {
                pid: pid.as_u32(),
                name: process.name().to_string_lossy().into_owned(),
                start_time: process.start_time(),
            })
            .collect()
    }

    fn terminate(&self, pid: u32) -> Result<(), TerminateError> {
        let mut system = self.system.lock();
        let pid = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

        let Some(process) = system.process(pid) else {
            return Err(TerminateError::NotFound);
        };

        if process.kill() {
            Ok(())
        } else {
            Err(TerminateError::AccessDenied(format!(
                "kill signal to pid {} was refused",
                pid.as_u32()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_current_process() {
        let table = SystemProcessTable::new();
        let me = std::process::id();
        assert!(table.list_processes().iter().any(|p| p.pid == me));
    }

    #[test]
    fn terminate_missing_pid_is_not_found() {
        let table = SystemProcessTable::new();
        assert_eq!(table.terminate(u32::MAX - 7), Err(TerminateError::NotFound));
    }

    #[test]
    fn terminate_error_maps_to_process_access() {
        let err = TerminateError::AccessDenied("nope".into()).into_engine_error(42);
        assert_eq!(err.kind(), "ProcessAccess");
        assert!(err.to_string().contains("42"));
    }
}
