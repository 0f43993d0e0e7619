// Attribution engine: drains captured packets, maps them to processes and keeps per-process stats

use crate::capture::PacketCapture;
use crate::packet::PacketRecord;
use crate::sockets::{ConnectionKey, ConnectionTable, SocketTable, find_connection};
use crate::stats::{ProcessStats, UNKNOWN_PID, UNKNOWN_PROCESS_NAME};
use crate::worker::{Job, StopSignal, Worker};
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Default interval between attribution cycles
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_millis(500);

/// Which way a packet crossed this host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

/// Why a packet was not attributed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    /// Both endpoints are local
    Loopback,
    /// Neither endpoint is local (routed or forwarded)
    Foreign,
}

/// Classify a packet given a local-address predicate
pub fn classify(
    record: &PacketRecord,
    is_local: impl Fn(IpAddr) -> bool,
) -> std::result::Result<Direction, Skip> {
    match (is_local(record.src_addr), is_local(record.dst_addr)) {
        (true, true) => Err(Skip::Loopback),
        (true, false) => Ok(Direction::Upload),
        (false, true) => Ok(Direction::Download),
        (false, false) => Err(Skip::Foreign),
    }
}

/// Attribution outcome for one packet, resolved before the stats lock is taken.
/// Borrows the owner's name from the connection table snapshot held for the cycle.
struct Attribution<'a> {
    pid: i32,
    name: &'a str,
    direction: Direction,
    bytes: u64,
}

struct AggregatorShared {
    capture: Arc<PacketCapture>,
    sockets: Arc<SocketTable>,
    stats: Mutex<HashMap<i32, ProcessStats>>,
    rate_window: Duration,
    sample_capacity: usize,
    loopback_skipped: AtomicU64,
}

impl AggregatorShared {
    fn stats(&self) -> MutexGuard<'_, HashMap<i32, ProcessStats>> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn attribute<'a>(
        &self,
        record: &PacketRecord,
        local_addrs: &HashSet<IpAddr>,
        connections: &'a ConnectionTable,
    ) -> Option<Attribution<'a>> {
        let is_local = |addr: IpAddr| local_addrs.contains(&addr.to_canonical());
        let direction = match classify(record, is_local) {
            Ok(direction) => direction,
            Err(Skip::Loopback) => {
                self.loopback_skipped.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(Skip::Foreign) => return None,
        };

        let key = match direction {
            Direction::Upload => ConnectionKey::new(
                record.src_addr,
                record.src_port,
                record.dst_addr,
                record.dst_port,
                record.transport,
            ),
            Direction::Download => ConnectionKey::new(
                record.dst_addr,
                record.dst_port,
                record.src_addr,
                record.src_port,
                record.transport,
            ),
        };

        let (pid, name) = match find_connection(connections, &key) {
            Some(connection) => (connection.owning_pid, connection.process_name.as_str()),
            None => (UNKNOWN_PID, UNKNOWN_PROCESS_NAME),
        };

        Some(Attribution {
            pid,
            name,
            direction,
            bytes: record.byte_length as u64,
        })
    }

    fn run_cycle(&self) -> usize {
        let records = self.capture.drain();
        let timestamp = Instant::now();

        // One snapshot of the socket table per batch; our own lock is not held yet
        let local_addrs = self.sockets.local_addrs();
        let connections = self.sockets.connections();
        let attributions: Vec<Attribution<'_>> = records
            .iter()
            .filter_map(|r| self.attribute(r, &local_addrs, &connections))
            .collect();

        let mut stats = self.stats();
        for attribution in &attributions {
            let entry = stats.entry(attribution.pid).or_insert_with(|| {
                ProcessStats::with_capacity(attribution.pid, attribution.name, self.sample_capacity)
            });
            // A reused PID takes the name of its current owner
            if entry.name != attribution.name {
                entry.name = attribution.name.to_string();
            }
            match attribution.direction {
                Direction::Upload => entry.add_traffic(attribution.bytes, 0, timestamp),
                Direction::Download => entry.add_traffic(0, attribution.bytes, timestamp),
            }
        }

        // Rates are measured up to the batch timestamp, so a lone sample from this batch yields 0
        for process in stats.values_mut() {
            process.calculate_rate_at(timestamp, self.rate_window);
        }

        log::debug!(
            "Attribution cycle: {} packets drained, {} attributed, {} processes tracked",
            records.len(),
            attributions.len(),
            stats.len()
        );
        attributions.len()
    }
}

/// Periodically attributes captured traffic to processes
pub struct TrafficAggregator {
    shared: Arc<AggregatorShared>,
    interval: Duration,
    worker: Worker,
}

impl TrafficAggregator {
    pub fn new(
        capture: Arc<PacketCapture>,
        sockets: Arc<SocketTable>,
        interval: Duration,
        rate_window: Duration,
        sample_capacity: usize,
    ) -> Self {
        Self {
            shared: Arc::new(AggregatorShared {
                capture,
                sockets,
                stats: Mutex::new(HashMap::new()),
                rate_window,
                sample_capacity,
                loopback_skipped: AtomicU64::new(0),
            }),
            interval,
            worker: Worker::new("traffic-aggregator"),
        }
    }

    pub fn with_stop_timeout(self, stop_timeout: Duration) -> Self {
        Self {
            worker: Worker::with_stop_timeout("traffic-aggregator", stop_timeout),
            ..self
        }
    }

    pub fn start(&self) -> Result<()> {
        self.worker.start(|| {
            log::info!(
                "Starting traffic aggregator (cycle {:?}, rate window {:?})",
                self.interval,
                self.shared.rate_window
            );
            let shared = Arc::clone(&self.shared);
            let interval = self.interval;
            Ok(vec![Job::new("xnettop-aggregator", move |signal: StopSignal| {
                while !signal.wait(interval) {
                    shared.run_cycle();
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

    /// Run one attribution cycle on the calling thread. Returns the number of packets attributed.
    pub fn run_cycle(&self) -> usize {
        self.shared.run_cycle()
    }

    /// Copies of every tracked process, busiest first
    pub fn snapshot(&self) -> Vec<ProcessStats> {
        let mut snapshot: Vec<ProcessStats> = self.shared.stats().values().cloned().collect();
        snapshot.sort_by(|a, b| {
            b.total_rate()
                .total_cmp(&a.total_rate())
                .then_with(|| a.pid.cmp(&b.pid))
        });
        snapshot
    }

    pub fn stats_for(&self, pid: i32) -> Option<ProcessStats> {
        self.shared.stats().get(&pid).cloned()
    }

    /// Forget all accumulated traffic. The pipeline keeps running.
    pub fn reset(&self) {
        self.shared.stats().clear();
        log::info!("Traffic statistics cleared");
    }

    /// Packets dropped because both endpoints were local
    pub fn loopback_skipped(&self) -> u64 {
        self.shared.loopback_skipped.load(Ordering::Relaxed)
    }
}
