// Network monitor facade: wires capture, socket table and aggregator together

use crate::aggregator::TrafficAggregator;
use crate::backends::capture::{self, CaptureBackend};
use crate::backends::socket::{self, SocketSource};
use crate::capture::PacketCapture;
use crate::config::MonitorConfig;
use crate::sockets::SocketTable;
use crate::stats::ProcessStats;
use anyhow::{Context, Result};
use std::sync::Arc;

/// Tracks network activity per process.
///
/// Owns the three background components and exposes the operations a UI
/// needs: start, stop, snapshot and clear.
pub struct NetworkMonitor {
    config: MonitorConfig,
    capture: Arc<PacketCapture>,
    sockets: Arc<SocketTable>,
    aggregator: TrafficAggregator,
}

impl NetworkMonitor {
    pub fn new(
        config: MonitorConfig,
        capture_backend: Box<dyn CaptureBackend>,
        socket_source: Box<dyn SocketSource>,
    ) -> Result<Self> {
        config.validate().context("Invalid monitor configuration")?;
        let stop_timeout = config.stop_timeout();

        let capture = Arc::new(PacketCapture::with_stop_timeout(
            capture_backend,
            config.interface.clone(),
            config.queue_capacity,
            stop_timeout,
        ));
        let sockets = Arc::new(SocketTable::with_stop_timeout(
            socket_source,
            config.socket_refresh(),
            stop_timeout,
        ));
        let aggregator = TrafficAggregator::new(
            Arc::clone(&capture),
            Arc::clone(&sockets),
            config.aggregate_interval(),
            config.rate_window(),
            config.sample_capacity,
        )
        .with_stop_timeout(stop_timeout);

        Ok(Self {
            config,
            capture,
            sockets,
            aggregator,
        })
    }

    /// Monitor using the platform's capture backend and socket source
    pub fn with_default_backends(config: MonitorConfig) -> Result<Self> {
        let source = socket::default_source().context("Failed to initialize socket table")?;
        Self::new(config, capture::default_backend(), source)
    }

    /// Start the socket table, then capture, then attribution.
    ///
    /// The socket table is populated before capture begins so early packets
    /// can be attributed. If capture cannot start, everything already started
    /// is stopped again and the error is returned.
    pub fn start_all(&self) -> Result<()> {
        log::info!(
            "Starting network monitor on {}",
            self.config.interface.as_deref().unwrap_or("all interfaces")
        );

        self.sockets.start()?;
        if let Err(e) = self.capture.start() {
            self.sockets.stop();
            return Err(e);
        }
        if let Err(e) = self.aggregator.start() {
            self.capture.stop();
            self.sockets.stop();
            return Err(e);
        }
        Ok(())
    }

    /// Stop attribution first so nothing consumes a half-stopped pipeline,
    /// then capture, then the socket table.
    pub fn stop_all(&self) {
        self.aggregator.stop();
        self.capture.stop();
        self.sockets.stop();
        log::info!("Network monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.aggregator.is_running() || self.capture.is_running() || self.sockets.is_running()
    }

    /// Copies of every tracked process, busiest first
    pub fn get_snapshot(&self) -> Vec<ProcessStats> {
        self.aggregator.snapshot()
    }

    pub fn stats_for(&self, pid: i32) -> Option<ProcessStats> {
        self.aggregator.stats_for(pid)
    }

    /// Zero all counters without stopping the pipeline
    pub fn clear(&self) {
        self.aggregator.reset();
    }

    pub fn dropped_packets(&self) -> u64 {
        self.capture.dropped()
    }

    pub fn loopback_skipped(&self) -> u64 {
        self.aggregator.loopback_skipped()
    }

    pub fn connection_count(&self) -> usize {
        self.sockets.connection_count()
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn sockets(&self) -> &SocketTable {
        &self.sockets
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::tests::ScriptedBackend;
    use crate::sockets::tests::FakeSource;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = MonitorConfig {
            queue_capacity: 0,
            ..Default::default()
        };
        let result = NetworkMonitor::new(
            config,
            Box::new(Arc::new(ScriptedBackend::default())),
            Box::new(Arc::new(FakeSource::default())),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_capture_failure_stops_socket_table() {
        let backend = Arc::new(ScriptedBackend {
            fail: true,
            ..Default::default()
        });
        let monitor = NetworkMonitor::new(
            MonitorConfig::default(),
            Box::new(Arc::clone(&backend)),
            Box::new(Arc::new(FakeSource::default())),
        )
        .unwrap();

        assert!(monitor.start_all().is_err());
        assert!(!monitor.is_running());
        assert!(!monitor.sockets().is_running());
    }

    #[test]
    fn test_start_and_stop_all_are_idempotent() {
        let backend = Arc::new(ScriptedBackend::default());
        let monitor = NetworkMonitor::new(
            MonitorConfig::default(),
            Box::new(Arc::clone(&backend)),
            Box::new(Arc::new(FakeSource::default())),
        )
        .unwrap();

        monitor.start_all().unwrap();
        monitor.start_all().unwrap();
        assert!(monitor.is_running());
        assert_eq!(backend.opens.load(Ordering::SeqCst), 1);

        monitor.stop_all();
        monitor.stop_all();
        assert!(!monitor.is_running());
        assert!(monitor.get_snapshot().is_empty());
    }
}
