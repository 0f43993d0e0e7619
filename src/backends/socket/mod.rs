// Socket enumeration backend trait
//
// Provides a platform-agnostic view of the OS socket table:
// - which sockets exist and which PID owns each
// - which addresses belong to this host
// - what a PID's process is called

use crate::packet::Transport;
use anyhow::Result;
use std::net::{IpAddr, SocketAddr};

#[cfg(target_os = "linux")]
pub mod procfs;

/// One OS-visible inet socket with a known owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEntry {
    pub pid: i32,
    pub local: SocketAddr,
    /// None for listening / unconnected sockets
    pub remote: Option<SocketAddr>,
    pub transport: Transport,
    pub status: String,
}

/// Name and command line of a running process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub pid: i32,
    pub name: String,
    pub command_line: String,
}

/// Socket table backend trait
pub trait SocketSource: Send + Sync {
    /// Backend name (e.g., "procfs")
    fn name(&self) -> &'static str;

    /// Addresses assigned to local interfaces
    fn local_addresses(&self) -> Result<Vec<IpAddr>>;

    /// Every inet socket that has an owning PID
    fn sockets(&self) -> Result<Vec<SocketEntry>>;

    /// Resolve a PID to its process identity.
    ///
    /// Errors (process exited, access denied) mean "no information" to callers.
    fn process_identity(&self, pid: i32) -> Result<ProcessIdentity>;
}

/// Create the socket source for the current platform
pub fn default_source() -> Result<Box<dyn SocketSource>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(procfs::ProcfsSocketSource::new()?))
    }

    #[cfg(not(target_os = "linux"))]
    {
        Err(anyhow::anyhow!(
            "No socket source available on this platform (only Linux /proc is supported)"
        ))
    }
}
