//! Per-process network bandwidth attribution.
//!
//! Three background loops cooperate through shared state:
//! [`capture::PacketCapture`] feeds a bounded queue of parsed packets,
//! [`sockets::SocketTable`] keeps a 5-tuple to process table fresh, and
//! [`aggregator::TrafficAggregator`] drains the queue, attributes each packet
//! and maintains per-process counters and rates. [`monitor::NetworkMonitor`]
//! wires them together.

pub mod aggregator;
pub mod backends;
pub mod capture;
pub mod config;
pub mod monitor;
pub mod packet;
pub mod queue;
pub mod sockets;
pub mod stats;
pub mod worker;

pub use config::MonitorConfig;
pub use monitor::NetworkMonitor;
pub use stats::ProcessStats;
