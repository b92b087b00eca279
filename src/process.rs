use std::{
    fs,
    path::{Path, PathBuf},
};

use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

#[cfg(test)]
use mockall::automock;

use crate::{
    error::NetCtrlError,
    exec::{CommandLine, CommandRunner, SystemRunner},
};

/// One running process as reported by the OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
}

/// Read-only view of the host's processes and interfaces
#[cfg_attr(test, automock)]
pub trait ProcessProbe: Send + Sync {
    /// Running processes in enumeration order
    fn list_processes(&self) -> Vec<ProcessEntry>;

    /// Full image path of a process
    fn executable_path(&self, pid: u32) -> Result<PathBuf, NetCtrlError>;

    /// First pid whose name matches exactly
    fn find_pid_by_exact_name(&self, name: &str) -> Option<u32>;

    /// Contents of the process's control-group membership file
    fn read_cgroup(&self, pid: u32) -> Result<String, NetCtrlError>;

    /// Whether a network interface with this name exists
    fn interface_exists(&self, name: &str) -> bool;
}

/// Probe backed by `sysinfo`, `pgrep` and procfs/sysfs
pub struct SystemProcessProbe;

impl ProcessProbe for SystemProcessProbe {
    fn list_processes(&self) -> Vec<ProcessEntry> {
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new(),
        );

        let mut entries: Vec<ProcessEntry> = system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessEntry {
                pid: pid.as_u32(),
                name: process.name().to_string_lossy().into_owned(),
            })
            .collect();
        entries.sort_by_key(|entry| entry.pid);
        entries
    }

    fn executable_path(&self, pid: u32) -> Result<PathBuf, NetCtrlError> {
        let pid = sysinfo::Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new().with_exe(UpdateKind::OnlyIfNotSet),
        );

        system
            .process(pid)
            .and_then(|process| process.exe())
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                NetCtrlError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("image path of pid {pid} is not available"),
                ))
            })
    }

    fn find_pid_by_exact_name(&self, name: &str) -> Option<u32> {
        let line = SystemRunner
            .first_line(&exact_name_query(name))
            .map_err(|err| log::warn!("failed to run pgrep: {err}"))
            .ok()??;
        parse_first_pid(&line)
    }

    fn read_cgroup(&self, pid: u32) -> Result<String, NetCtrlError> {
        Ok(fs::read_to_string(format!("/proc/{pid}/cgroup"))?)
    }

    fn interface_exists(&self, name: &str) -> bool {
        Path::new("/sys/class/net").join(name).exists()
    }
}

/// `pgrep -x -- <name>`; the name is never taken for an option
fn exact_name_query(name: &str) -> CommandLine {
    CommandLine::new("pgrep").args(["-x", "--", name])
}

/// First line of `pgrep` output as a positive pid
fn parse_first_pid(output: &str) -> Option<u32> {
    output
        .lines()
        .next()?
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|pid| *pid > 0)
}
