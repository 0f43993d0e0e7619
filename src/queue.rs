// Bounded packet queue that evicts the oldest record on overflow

use crate::packet::PacketRecord;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use std::sync::atomic::{AtomicU64, Ordering};

/// Default number of records buffered between capture and attribution
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Single-producer/single-consumer queue between the capture threads and the aggregator.
///
/// Pushing never blocks: when the queue is full the oldest queued record is
/// discarded to make room, favouring recent traffic over complete traffic.
/// Every discarded record is counted.
pub struct PacketQueue {
    tx: Sender<PacketRecord>,
    rx: Receiver<PacketRecord>,
    capacity: usize,
    dropped: AtomicU64,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, record: PacketRecord) {
        let mut record = record;
        loop {
            match self.tx.try_send(record) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    // Make room by evicting the head. The consumer may have drained
                    // in the meantime, in which case there is nothing to evict.
                    if self.rx.try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    record = rejected;
                }
                // Both ends live in self, so the channel can't disconnect
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Remove and return everything currently queued, oldest first. Never blocks.
    pub fn drain(&self) -> Vec<PacketRecord> {
        self.rx.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total records evicted by overflow since creation
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Transport;
    use std::net::{IpAddr, Ipv4Addr};

    fn record(src_port: u16) -> PacketRecord {
        PacketRecord {
            src_addr: IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
            dst_addr: IpAddr::V4(Ipv4Addr::new(2, 2, 2, 2)),
            src_port,
            dst_port: 80,
            transport: Transport::Tcp,
            byte_length: 100,
            is_v6: false,
        }
    }

    #[test]
    fn test_drain_returns_all_in_order() {
        let queue = PacketQueue::new(8);
        queue.push(record(1));
        queue.push(record(2));

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].src_port, 1);
        assert_eq!(drained[1].src_port, 2);
    }

    #[test]
    fn test_drain_clears_queue() {
        let queue = PacketQueue::new(8);
        queue.push(record(1));
        queue.drain();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_empty_queue() {
        let queue = PacketQueue::new(8);
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = PacketQueue::new(2);
        queue.push(record(1));
        queue.push(record(2));
        queue.push(record(3));

        let ports: Vec<u16> = queue.drain().iter().map(|r| r.src_port).collect();
        assert_eq!(ports, vec![2, 3]);
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn test_overflow_keeps_most_recent_k() {
        let capacity = 5;
        let queue = PacketQueue::new(capacity);
        for port in 0..(capacity as u16 + 7) {
            queue.push(record(port));
        }

        assert_eq!(queue.len(), capacity);
        let ports: Vec<u16> = queue.drain().iter().map(|r| r.src_port).collect();
        assert_eq!(ports, vec![7, 8, 9, 10, 11]);
        assert_eq!(queue.dropped(), 7);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let queue = PacketQueue::new(0);
        queue.push(record(1));
        queue.push(record(2));
        assert_eq!(queue.capacity(), 1);
        assert_eq!(queue.drain()[0].src_port, 2);
    }
}
