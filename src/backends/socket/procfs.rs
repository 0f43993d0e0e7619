// Linux procfs-based socket source

use super::{ProcessIdentity, SocketEntry, SocketSource};
use crate::packet::Transport;
use ::procfs::process::{FDTarget, Process, all_processes};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

/// Socket source using the Linux /proc filesystem
///
/// This backend reads socket information from:
/// - /proc/[pid]/fd/ - for socket inodes
/// - /proc/net/{tcp,tcp6,udp,udp6} - for connection endpoints
/// - /proc/[pid]/comm and /proc/[pid]/cmdline - for process identity
pub struct ProcfsSocketSource;

impl ProcfsSocketSource {
    pub fn new() -> Result<Self> {
        if !Self::is_available() {
            anyhow::bail!("procfs not available (is /proc mounted?)");
        }
        Ok(Self)
    }

    pub fn is_available() -> bool {
        std::path::Path::new("/proc/net/tcp").exists()
    }

    /// Socket inode -> owning PID, by scanning every process's file descriptors
    fn socket_owners() -> Result<HashMap<u64, i32>> {
        let mut owners = HashMap::new();

        for process in all_processes().context("Failed to list processes")?.flatten() {
            let pid = process.pid();
            // Processes we may not inspect (or that just exited) are skipped
            let Ok(fds) = process.fd() else {
                continue;
            };
            for fd in fds.flatten() {
                if let FDTarget::Socket(inode) = fd.target {
                    owners.insert(inode, pid);
                }
            }
        }

        Ok(owners)
    }
}

fn remote_endpoint(addr: SocketAddr) -> Option<SocketAddr> {
    if addr.ip().is_unspecified() && addr.port() == 0 {
        None
    } else {
        Some(addr)
    }
}

impl SocketSource for ProcfsSocketSource {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn local_addresses(&self) -> Result<Vec<IpAddr>> {
        Ok(::pnet::datalink::interfaces()
            .into_iter()
            .flat_map(|iface| iface.ips.into_iter().map(|net| net.ip()))
            .collect())
    }

    fn sockets(&self) -> Result<Vec<SocketEntry>> {
        let owners = Self::socket_owners()?;
        let mut entries = Vec::new();

        let mut push = |inode: u64,
                        local: SocketAddr,
                        remote: SocketAddr,
                        transport: Transport,
                        status: String| {
            if let Some(&pid) = owners.get(&inode) {
                entries.push(SocketEntry {
                    pid,
                    local,
                    remote: remote_endpoint(remote),
                    transport,
                    status,
                });
            }
        };

        // A table we can't read this cycle contributes nothing
        for entry in ::procfs::net::tcp().into_iter().flatten() {
            push(
                entry.inode,
                entry.local_address,
                entry.remote_address,
                Transport::Tcp,
                format!("{:?}", entry.state),
            );
        }
        for entry in ::procfs::net::tcp6().into_iter().flatten() {
            push(
                entry.inode,
                entry.local_address,
                entry.remote_address,
                Transport::Tcp,
                format!("{:?}", entry.state),
            );
        }
        for entry in ::procfs::net::udp().into_iter().flatten() {
            push(
                entry.inode,
                entry.local_address,
                entry.remote_address,
                Transport::Udp,
                format!("{:?}", entry.state),
            );
        }
        for entry in ::procfs::net::udp6().into_iter().flatten() {
            push(
                entry.inode,
                entry.local_address,
                entry.remote_address,
                Transport::Udp,
                format!("{:?}", entry.state),
            );
        }

        Ok(entries)
    }

    fn process_identity(&self, pid: i32) -> Result<ProcessIdentity> {
        let process = Process::new(pid).with_context(|| format!("PID {} not found", pid))?;
        let name = process
            .stat()
            .with_context(|| format!("Failed to read stat for PID {}", pid))?
            .comm;
        let command_line = match process.cmdline() {
            Ok(args) if !args.is_empty() => args.join(" "),
            _ => name.clone(),
        };

        Ok(ProcessIdentity {
            pid,
            name,
            command_line,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconnected_remote_is_none() {
        assert_eq!(remote_endpoint("0.0.0.0:0".parse().unwrap()), None);
        assert_eq!(remote_endpoint("[::]:0".parse().unwrap()), None);
        assert!(remote_endpoint("8.8.8.8:443".parse().unwrap()).is_some());
    }

    #[test]
    fn test_own_process_identity() {
        if !ProcfsSocketSource::is_available() {
            return;
        }
        let source = ProcfsSocketSource::new().unwrap();
        let me = std::process::id() as i32;
        let identity = source.process_identity(me).unwrap();
        assert_eq!(identity.pid, me);
        assert!(!identity.name.is_empty());
    }

    #[test]
    fn test_vanished_process_is_error() {
        if !ProcfsSocketSource::is_available() {
            return;
        }
        let source = ProcfsSocketSource::new().unwrap();
        assert!(source.process_identity(i32::MAX).is_err());
    }
}
