// Live socket table: maps connection 5-tuples to owning processes

use crate::backends::socket::SocketSource;
pub use crate::backends::socket::{ProcessIdentity, SocketEntry};
use crate::packet::Transport;
use crate::worker::{Job, StopSignal, Worker};
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

/// Default interval between socket table refreshes
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Addresses always treated as local, whatever the interfaces report
const LOCAL_SENTINELS: [IpAddr; 4] = [
    IpAddr::V4(Ipv4Addr::LOCALHOST),
    IpAddr::V6(Ipv6Addr::LOCALHOST),
    IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    IpAddr::V6(Ipv6Addr::UNSPECIFIED),
];

/// Canonical connection identifier: (local addr, local port, remote addr, remote port, transport)
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub struct ConnectionKey {
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub remote_addr: IpAddr,
    pub remote_port: u16,
    pub transport: Transport,
}

impl ConnectionKey {
    /// IPv4-mapped IPv6 addresses (dual-stack sockets) are folded to IPv4 so
    /// they match the IPv4 packets actually seen on the wire.
    pub fn new(
        local_addr: IpAddr,
        local_port: u16,
        remote_addr: IpAddr,
        remote_port: u16,
        transport: Transport,
    ) -> Self {
        Self {
            local_addr: local_addr.to_canonical(),
            local_port,
            remote_addr: remote_addr.to_canonical(),
            remote_port,
            transport,
        }
    }

    /// Key for a socket. Unconnected sockets use the unspecified address and port 0.
    pub fn for_socket(
        local: SocketAddr,
        remote: Option<SocketAddr>,
        transport: Transport,
    ) -> Self {
        let (remote_addr, remote_port) = match remote {
            Some(addr) => (addr.ip(), addr.port()),
            None => (unspecified_like(local.ip()), 0),
        };
        Self::new(local.ip(), local.port(), remote_addr, remote_port, transport)
    }

    /// Same connection seen from the other endpoint
    pub fn reversed(&self) -> Self {
        Self {
            local_addr: self.remote_addr,
            local_port: self.remote_port,
            remote_addr: self.local_addr,
            remote_port: self.local_port,
            transport: self.transport,
        }
    }
}

fn unspecified_like(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

/// A socket and the process that owns it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub owning_pid: i32,
    pub process_name: String,
    pub local: SocketAddr,
    pub remote: Option<SocketAddr>,
    pub transport: Transport,
    pub status: String,
}

pub type ConnectionTable = HashMap<ConnectionKey, ConnectionRecord>;

/// Look `key` up in a table snapshot, falling back to the reversed orientation
pub fn find_connection<'a>(
    connections: &'a ConnectionTable,
    key: &ConnectionKey,
) -> Option<&'a ConnectionRecord> {
    connections
        .get(key)
        .or_else(|| connections.get(&key.reversed()))
}

struct TableState {
    // Both snapshots are replaced wholesale; readers clone the Arc and never see a partial table
    connections: Arc<ConnectionTable>,
    local_addrs: Arc<HashSet<IpAddr>>,
    // PID -> identity, populated lazily and pruned to the PIDs in `connections`
    names: HashMap<i32, ProcessIdentity>,
}

struct TableShared {
    source: Box<dyn SocketSource>,
    state: RwLock<TableState>,
}

impl TableShared {
    fn read(&self) -> RwLockReadGuard<'_, TableState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, TableState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn refresh_local_addrs(&self) {
        let mut addrs: HashSet<IpAddr> = match self.source.local_addresses() {
            Ok(addrs) => addrs.into_iter().map(|a| a.to_canonical()).collect(),
            Err(e) => {
                // Keep the sentinels so loopback classification still works
                log::debug!("Failed to enumerate local addresses: {:#}", e);
                HashSet::new()
            }
        };
        addrs.extend(LOCAL_SENTINELS);

        self.write().local_addrs = Arc::new(addrs);
    }

    fn process_identity(&self, pid: i32) -> Option<ProcessIdentity> {
        if let Some(identity) = self.read().names.get(&pid) {
            return Some(identity.clone());
        }

        // Query the OS without holding the lock
        match self.source.process_identity(pid) {
            Ok(identity) => {
                self.write().names.insert(pid, identity.clone());
                Some(identity)
            }
            Err(e) => {
                log::trace!("No process info for PID {}: {:#}", pid, e);
                None
            }
        }
    }

    fn refresh_connections(&self) {
        let started = Instant::now();
        let entries = match self.source.sockets() {
            Ok(entries) => entries,
            Err(e) => {
                log::debug!("Socket enumeration failed: {:#}", e);
                Vec::new()
            }
        };

        // Build the new table without holding the lock
        let mut table = ConnectionTable::with_capacity(entries.len());
        for entry in entries {
            let Some(identity) = self.process_identity(entry.pid) else {
                continue;
            };
            let key = ConnectionKey::for_socket(entry.local, entry.remote, entry.transport);
            table.insert(
                key,
                ConnectionRecord {
                    owning_pid: entry.pid,
                    process_name: identity.name,
                    local: entry.local,
                    remote: entry.remote,
                    transport: entry.transport,
                    status: entry.status,
                },
            );
        }

        let active: HashSet<i32> = table.values().map(|c| c.owning_pid).collect();
        let connection_count = table.len();

        let mut state = self.write();
        state.connections = Arc::new(table);
        let before = state.names.len();
        state.names.retain(|pid, _| active.contains(pid));

        log::debug!(
            "Socket table refreshed: {} connections, {} processes cached ({} evicted) in {:?}",
            connection_count,
            state.names.len(),
            before - state.names.len(),
            started.elapsed()
        );
    }

    fn refresh(&self) {
        self.refresh_local_addrs();
        self.refresh_connections();
    }
}

/// Periodically rebuilt lookup table from connection 5-tuple to owning process.
///
/// Lookups never block on a refresh in progress: the refresh builds the next
/// table off to the side and swaps it in under a short write lock.
pub struct SocketTable {
    shared: Arc<TableShared>,
    interval: Duration,
    worker: Worker,
}

impl SocketTable {
    pub fn new(source: Box<dyn SocketSource>, interval: Duration) -> Self {
        Self::with_stop_timeout(source, interval, crate::worker::DEFAULT_STOP_TIMEOUT)
    }

    pub fn with_stop_timeout(
        source: Box<dyn SocketSource>,
        interval: Duration,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(TableShared {
                source,
                state: RwLock::new(TableState {
                    connections: Arc::new(ConnectionTable::new()),
                    local_addrs: Arc::new(HashSet::new()),
                    names: HashMap::new(),
                }),
            }),
            interval,
            worker: Worker::with_stop_timeout("socket-table", stop_timeout),
        }
    }

    /// Start the background refresh loop. The table is populated once before
    /// this returns so that packets captured right after startup can be matched.
    pub fn start(&self) -> Result<()> {
        self.worker.start(|| {
            log::info!(
                "Starting socket table ({} backend, refresh every {:?})",
                self.shared.source.name(),
                self.interval
            );
            self.shared.refresh();

            let shared = Arc::clone(&self.shared);
            let interval = self.interval;
            Ok(vec![Job::new("xnettop-sockets", move |signal: StopSignal| {
                while !signal.wait(interval) {
                    shared.refresh();
                }
            })])
        })?;
        Ok(())
    }

    pub fn stop(&self) {
        self.worker.stop();
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Run one refresh cycle on the calling thread
    pub fn refresh(&self) {
        self.shared.refresh();
    }

    /// Re-enumerate local interface addresses only
    pub fn refresh_local_addrs(&self) {
        self.shared.refresh_local_addrs();
    }

    /// Find the connection for a 5-tuple, trying the reversed orientation if the forward one is absent
    pub fn lookup(
        &self,
        local_addr: IpAddr,
        local_port: u16,
        remote_addr: IpAddr,
        remote_port: u16,
        transport: Transport,
    ) -> Option<ConnectionRecord> {
        let key = ConnectionKey::new(local_addr, local_port, remote_addr, remote_port, transport);
        find_connection(&self.connections(), &key).cloned()
    }

    pub fn is_local(&self, addr: IpAddr) -> bool {
        self.shared.read().local_addrs.contains(&addr.to_canonical())
    }

    /// Point-in-time local address set
    pub fn local_addrs(&self) -> Arc<HashSet<IpAddr>> {
        Arc::clone(&self.shared.read().local_addrs)
    }

    /// Point-in-time connection table
    pub fn connections(&self) -> Arc<ConnectionTable> {
        Arc::clone(&self.shared.read().connections)
    }

    pub fn all_connections(&self) -> Vec<ConnectionRecord> {
        self.connections().values().cloned().collect()
    }

    pub fn for_each_connection(&self, mut f: impl FnMut(&ConnectionRecord)) {
        for record in self.connections().values() {
            f(record);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.shared.read().connections.len()
    }

    /// Cached identity for a PID, querying the OS on a cache miss
    pub fn process_identity(&self, pid: i32) -> Option<ProcessIdentity> {
        self.shared.process_identity(pid)
    }

    pub fn cached_process_count(&self) -> usize {
        self.shared.read().names.len()
    }
}
