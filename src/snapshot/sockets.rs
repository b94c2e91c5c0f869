/// Listening TCP socket enumeration
///
/// On Linux we read the kernel's tcp/tcp6 tables through `procfs` and map socket inodes
/// back to PIDs through each process's fd table. Elsewhere we ask `lsof`. Either way a
/// socket whose owner we can't read is still reported, just without a PID.
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};

use super::ListeningSocket;
use crate::error::RecoverableError;

// `n*:8080`, `n127.0.0.1:5432`, `n[::1]:3000`
static LSOF_NAME: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^n.*:(\d+)$").ok());

pub fn listening_sockets() -> Result<Vec<ListeningSocket>, RecoverableError> {
    #[cfg(target_os = "linux")]
    {
        procfs_listening_sockets()
    }
    #[cfg(not(target_os = "linux"))]
    {
        lsof_listening_sockets()
    }
}

#[cfg(target_os = "linux")]
fn procfs_listening_sockets() -> Result<Vec<ListeningSocket>, RecoverableError> {
    use procfs::net::TcpState;
    use tracing::debug;

    let mut listeners: Vec<(u64, u16)> = Vec::new();
    let mut read_any = false;
    for (table, entries) in [("tcp", procfs::net::tcp()), ("tcp6", procfs::net::tcp6())] {
        match entries {
            Ok(entries) => {
                read_any = true;
                listeners.extend(
                    entries
                        .into_iter()
                        .filter(|entry| matches!(entry.state, TcpState::Listen) && entry.inode != 0)
                        .map(|entry| (entry.inode, entry.local_address.port())),
                );
            }
            // tcp6 is absent on kernels without IPv6
            Err(e) => debug!("Skipping {} table: {}", table, e),
        }
    }
    if !read_any {
        return Err(RecoverableError::SocketTable("no readable tcp table".to_string()));
    }

    let wanted: BTreeSet<u64> = listeners.iter().map(|(inode, _)| *inode).collect();
    let mut owners: HashMap<u64, u32> = HashMap::new();
    let processes = procfs::process::all_processes()
        .map_err(|e| RecoverableError::SocketTable(format!("/proc: {}", e)))?;
    // Entries that fail here vanished between the directory read and the open
    for process in processes.flatten() {
        match socket_inodes_of(&process) {
            Ok(inodes) => {
                for inode in inodes.into_iter().filter(|inode| wanted.contains(inode)) {
                    owners.entry(inode).or_insert(process.pid() as u32);
                }
            }
            Err(e) => debug!("Socket owner lookup skipped: {}", e),
        }
    }

    Ok(attach_owners(listeners, &owners))
}

#[cfg(target_os = "linux")]
fn socket_inodes_of(process: &procfs::process::Process) -> Result<Vec<u64>, RecoverableError> {
    use procfs::process::FDTarget;
    use procfs::ProcError;

    let pid = process.pid() as u32;
    let fds = process.fd().map_err(|e| match e {
        ProcError::PermissionDenied(_) => RecoverableError::PermissionDenied { pid },
        _ => RecoverableError::ProcessGone { pid },
    })?;

    Ok(fds
        .flatten()
        .filter_map(|fd| match fd.target {
            FDTarget::Socket(inode) => Some(inode),
            _ => None,
        })
        .collect())
}

/// Pair each listening (inode, port) with its owning PID, when we found one
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn attach_owners(listeners: Vec<(u64, u16)>, owners: &HashMap<u64, u32>) -> Vec<ListeningSocket> {
    let sockets: BTreeSet<ListeningSocket> = listeners
        .into_iter()
        .map(|(inode, port)| ListeningSocket {
            port,
            pid: owners.get(&inode).copied(),
        })
        .collect();
    sockets.into_iter().collect()
}

#[cfg(not(target_os = "linux"))]
fn lsof_listening_sockets() -> Result<Vec<ListeningSocket>, RecoverableError> {
    let output = std::process::Command::new("lsof")
        .args(["-nP", "-iTCP", "-sTCP:LISTEN", "-F", "pn"])
        .output()
        .map_err(|e| RecoverableError::SocketTable(format!("lsof: {}", e)))?;

    // lsof exits 1 both when nothing matches and on partial warnings
    if !output.status.success() && output.stdout.is_empty() && !output.stderr.is_empty() {
        return Err(RecoverableError::SocketTable(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(parse_lsof_output(&String::from_utf8_lossy(&output.stdout)))
}

/// Parses `lsof -F pn` field output: `p<pid>` lines followed by `n<addr>:<port>` lines
pub fn parse_lsof_output(output: &str) -> Vec<ListeningSocket> {
    let Some(name_re) = LSOF_NAME.as_ref() else {
        return Vec::new();
    };
    let mut current_pid = None;
    let mut sockets = BTreeSet::new();

    for line in output.lines() {
        if let Some(pid) = line.strip_prefix('p') {
            current_pid = pid.trim().parse::<u32>().ok();
        } else if let Some(caps) = name_re.captures(line.trim()) {
            if let Ok(port) = caps[1].parse::<u16>() {
                sockets.insert(ListeningSocket { port, pid: current_pid });
            }
        }
    }
    sockets.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_owners() {
        let owners = HashMap::from([(41233, 501)]);
        let sockets = attach_owners(vec![(41233, 8080), (41300, 3000), (41233, 8080)], &owners);
        assert_eq!(
            sockets,
            vec![
                ListeningSocket { port: 3000, pid: None },
                ListeningSocket { port: 8080, pid: Some(501) },
            ]
        );
    }

    #[test]
    fn test_parse_lsof_output() {
        let output = "p501\nn*:8080\nn[::1]:8080\np77\nn127.0.0.1:5432\nnlocalhost:notaport\n";
        let sockets = parse_lsof_output(output);
        assert_eq!(
            sockets,
            vec![
                ListeningSocket { port: 5432, pid: Some(77) },
                ListeningSocket { port: 8080, pid: Some(501) },
            ]
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_live_listener_is_owned_by_us() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let sockets = listening_sockets().unwrap();
        assert!(sockets.contains(&ListeningSocket {
            port,
            pid: Some(std::process::id()),
        }));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_connected_socket_is_not_listening() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let client_port = client.local_addr().unwrap().port();

        let sockets = listening_sockets().unwrap();
        assert!(sockets.iter().all(|socket| socket.port != client_port));
    }
}
