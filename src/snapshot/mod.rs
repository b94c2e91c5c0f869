/// Point-in-time view of listening sockets and process metadata
///
/// A snapshot is built fresh for every logical operation and thrown away afterwards.
/// Records for processes that vanish mid-enumeration, or that we are not allowed to
/// inspect, are left out; nothing in here is ever fabricated.
pub mod sockets;

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessStatus, RefreshKind, System};
use tracing::{debug, warn};

use crate::error::RecoverableError;

/// A TCP endpoint in LISTEN state; the owner is unknown when we can't read its fd table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ListeningSocket {
    pub port: u16,
    pub pid: Option<u32>,
}

/// Everything we could learn about one process; each field individually optional
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub name: Option<String>,
    pub cmdline: Option<String>,
    pub cwd: Option<String>,
    pub memory_bytes: Option<u64>,
}

impl ProcessRecord {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_cmdline(mut self, cmdline: impl Into<String>) -> Self {
        self.cmdline = Some(cmdline.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_memory(mut self, bytes: u64) -> Self {
        self.memory_bytes = Some(bytes);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessSnapshot {
    sockets: Vec<ListeningSocket>,
    processes: HashMap<u32, ProcessRecord>,
}

impl ProcessSnapshot {
    pub fn new(sockets: Vec<ListeningSocket>, processes: impl IntoIterator<Item = ProcessRecord>) -> Self {
        let mut sockets = sockets;
        sockets.sort();
        sockets.dedup();
        Self {
            sockets,
            processes: processes.into_iter().map(|record| (record.pid, record)).collect(),
        }
    }

    pub fn with_socket(mut self, port: u16, pid: Option<u32>) -> Self {
        let socket = ListeningSocket { port, pid };
        if !self.sockets.contains(&socket) {
            self.sockets.push(socket);
            self.sockets.sort();
        }
        self
    }

    pub fn with_process(mut self, record: ProcessRecord) -> Self {
        self.processes.insert(record.pid, record);
        self
    }

    pub fn sockets(&self) -> &[ListeningSocket] {
        &self.sockets
    }

    pub fn process(&self, pid: u32) -> Option<&ProcessRecord> {
        self.processes.get(&pid)
    }

    pub fn processes(&self) -> impl Iterator<Item = &ProcessRecord> {
        self.processes.values()
    }

    /// Every port something is listening on
    pub fn listening_ports(&self) -> BTreeSet<u16> {
        self.sockets.iter().map(|socket| socket.port).collect()
    }
}

/// Source of snapshots; the seam tests use to inject a fixed OS view
pub trait SnapshotSource: Send + Sync {
    /// Never fails: whatever could not be read is simply absent
    fn capture(&self) -> ProcessSnapshot;
}

/// Reads the live OS state
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSnapshotSource;

impl SnapshotSource for SystemSnapshotSource {
    fn capture(&self) -> ProcessSnapshot {
        let sockets = match sockets::listening_sockets() {
            Ok(sockets) => sockets,
            Err(e) => {
                warn!("{}; treating as no listening sockets", e);
                Vec::new()
            }
        };

        let sys = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::everything()),
        );

        let mut records = Vec::with_capacity(sys.processes().len());
        for (pid, process) in sys.processes() {
            // Linux tasks show up next to their process and carry its whole RSS
            if process.thread_kind().is_some() {
                continue;
            }
            match inspect(*pid, process) {
                Ok(record) => records.push(record),
                Err(e) => debug!("Omitting process: {}", e),
            }
        }

        debug!(
            "Captured {} listening sockets and {} processes",
            sockets.len(),
            records.len()
        );
        ProcessSnapshot::new(sockets, records)
    }
}

/// Zombies still have a PID but nothing left to attribute
fn has_exited(status: ProcessStatus) -> bool {
    matches!(status, ProcessStatus::Zombie | ProcessStatus::Dead)
}

fn inspect(pid: Pid, process: &Process) -> Result<ProcessRecord, RecoverableError> {
    let pid = pid.as_u32();
    if has_exited(process.status()) {
        return Err(RecoverableError::ProcessGone { pid });
    }

    let cmd = process.cmd();
    let name = process.name();
    Ok(ProcessRecord {
        pid,
        name: (!name.is_empty()).then(|| name.to_string()),
        // An empty argv means we weren't allowed to read it, not that it is empty
        cmdline: (!cmd.is_empty()).then(|| cmd.join(" ")),
        cwd: process.cwd().map(|cwd| cwd.to_string_lossy().into_owned()),
        memory_bytes: Some(process.memory()),
    })
}
