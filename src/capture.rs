// Packet capture: one thread per interface feeding the shared packet queue

use crate::backends::capture::{CaptureBackend, CaptureChannel};
use crate::packet::{PacketRecord, parse_frame};
use crate::queue::PacketQueue;
use crate::worker::{Job, StopSignal, Worker};
use anyhow::{Context, Result};
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Pause after a receive error before retrying the interface
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Asynchronous TCP/UDP capture into a bounded drop-oldest queue
pub struct PacketCapture {
    backend: Box<dyn CaptureBackend>,
    interface: Option<String>,
    queue: Arc<PacketQueue>,
    worker: Worker,
}

impl PacketCapture {
    pub fn new(
        backend: Box<dyn CaptureBackend>,
        interface: Option<String>,
        queue_capacity: usize,
    ) -> Self {
        Self::with_stop_timeout(
            backend,
            interface,
            queue_capacity,
            crate::worker::DEFAULT_STOP_TIMEOUT,
        )
    }

    pub fn with_stop_timeout(
        backend: Box<dyn CaptureBackend>,
        interface: Option<String>,
        queue_capacity: usize,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            interface,
            queue: Arc::new(PacketQueue::new(queue_capacity)),
            worker: Worker::with_stop_timeout("packet-capture", stop_timeout),
        }
    }

    /// Open the capture channels and start one capture thread per channel.
    ///
    /// Failing to open capture (missing privilege, unknown interface) is
    /// returned here and no thread is started.
    pub fn start(&self) -> Result<()> {
        self.worker.start(|| {
            let selector = self.interface.as_deref();
            let channels = self.backend.open(selector).with_context(|| {
                format!(
                    "Failed to start {} capture on {}",
                    self.backend.name(),
                    selector.unwrap_or("all interfaces")
                )
            })?;
            if channels.is_empty() {
                anyhow::bail!("{} backend opened no capture channels", self.backend.name());
            }

            Ok(channels
                .into_iter()
                .map(|channel| {
                    let queue = Arc::clone(&self.queue);
                    let name = format!("xnettop-capture-{}", channel.interface);
                    Job::new(name, move |signal| capture_loop(channel, &queue, &signal))
                })
                .collect())
        })?;
        Ok(())
    }

    pub fn stop(&self) {
        self.worker.stop();
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Take every queued record. Never blocks.
    pub fn drain(&self) -> Vec<PacketRecord> {
        self.queue.drain()
    }

    pub fn queue(&self) -> &PacketQueue {
        &self.queue
    }

    /// Records discarded because the queue was full
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }
}

fn capture_loop(mut channel: CaptureChannel, queue: &PacketQueue, signal: &StopSignal) {
    log::debug!("Capturing on {} ({:?})", channel.interface, channel.link);
    let mut captured = 0u64;

    while !signal.is_stopped() {
        match channel.receiver.next_frame() {
            Ok(frame) => {
                match parse_frame(frame, channel.link) {
                    Some(record) => {
                        queue.push(record);
                        captured += 1;
                    }
                    None => log::trace!(
                        "Skipped {}-byte frame on {}: not TCP/UDP over IP",
                        frame.len(),
                        channel.interface
                    ),
                }
            }
            // Idle link: the read timeout lets us re-check for stop
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                log::warn!("Capture error on {}: {}", channel.interface, e);
                if signal.wait(ERROR_BACKOFF) {
                    break;
                }
            }
        }
    }

    log::debug!(
        "Capture on {} stopped after {} packets",
        channel.interface,
        captured
    );
}
