// Per-process traffic counters and sliding-window rates

use serde::Serialize;
use std::time::{Duration, Instant};

/// PID used for traffic that matches no known socket
pub const UNKNOWN_PID: i32 = -1;
pub const UNKNOWN_PROCESS_NAME: &str = "(unknown)";

/// Number of samples kept per process
pub const DEFAULT_SAMPLE_CAPACITY: usize = 60;

/// Default look-back for rate calculation
pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(2);

/// Bytes attributed to a process at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficSample {
    pub timestamp: Instant,
    pub upload_bytes: u64,
    pub download_bytes: u64,
}

/// Fixed-capacity circular buffer of samples. Once full, each push overwrites the oldest.
#[derive(Debug, Clone)]
pub struct SampleRing {
    slots: Vec<TrafficSample>,
    capacity: usize,
    // Index of the next slot to overwrite once the ring is full
    cursor: usize,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            cursor: 0,
        }
    }

    pub fn push(&mut self, sample: TrafficSample) {
        // Samples from the same instant share one slot
        if let Some(last) = self.last_mut() {
            if last.timestamp == sample.timestamp {
                last.upload_bytes += sample.upload_bytes;
                last.download_bytes += sample.download_bytes;
                return;
            }
        }

        if self.slots.len() < self.capacity {
            self.slots.push(sample);
        } else {
            self.slots[self.cursor] = sample;
            self.cursor = (self.cursor + 1) % self.capacity;
        }
    }

    fn last_mut(&mut self) -> Option<&mut TrafficSample> {
        if self.slots.len() < self.capacity {
            self.slots.last_mut()
        } else {
            let index = (self.cursor + self.capacity - 1) % self.capacity;
            self.slots.get_mut(index)
        }
    }

    /// Samples from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &TrafficSample> {
        let (newer, older) = self.slots.split_at(self.cursor.min(self.slots.len()));
        older.iter().chain(newer.iter())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.cursor = 0;
    }
}

/// Accumulated traffic for one process
#[derive(Debug, Clone, Serialize)]
pub struct ProcessStats {
    pub pid: i32,
    pub name: String,
    pub upload_bytes: u64,
    pub download_bytes: u64,
    /// Bytes per second over the rate window
    pub upload_rate: f64,
    pub download_rate: f64,
    #[serde(skip)]
    samples: SampleRing,
}

impl ProcessStats {
    pub fn new(pid: i32, name: impl Into<String>) -> Self {
        Self::with_capacity(pid, name, DEFAULT_SAMPLE_CAPACITY)
    }

    pub fn with_capacity(pid: i32, name: impl Into<String>, sample_capacity: usize) -> Self {
        Self {
            pid,
            name: name.into(),
            upload_bytes: 0,
            download_bytes: 0,
            upload_rate: 0.0,
            download_rate: 0.0,
            samples: SampleRing::new(sample_capacity),
        }
    }

    pub fn unknown(sample_capacity: usize) -> Self {
        Self::with_capacity(UNKNOWN_PID, UNKNOWN_PROCESS_NAME, sample_capacity)
    }

    pub fn is_unknown(&self) -> bool {
        self.pid == UNKNOWN_PID
    }

    pub fn add_traffic(&mut self, upload: u64, download: u64, timestamp: Instant) {
        self.upload_bytes = self.upload_bytes.saturating_add(upload);
        self.download_bytes = self.download_bytes.saturating_add(download);
        self.samples.push(TrafficSample {
            timestamp,
            upload_bytes: upload,
            download_bytes: download,
        });
    }

    /// Recompute rates from the samples no older than `window` before `now`.
    ///
    /// The rate is the in-window byte sum divided by the time since the
    /// earliest in-window sample. A zero duration yields a rate of 0.
    pub fn calculate_rate_at(&mut self, now: Instant, window: Duration) {
        let cutoff = now.checked_sub(window);
        let mut upload_sum = 0u64;
        let mut download_sum = 0u64;
        let mut earliest = now;

        for sample in self.samples.iter() {
            if cutoff.is_some_and(|cutoff| sample.timestamp < cutoff) {
                continue;
            }
            upload_sum += sample.upload_bytes;
            download_sum += sample.download_bytes;
            earliest = earliest.min(sample.timestamp);
        }

        let duration = now.saturating_duration_since(earliest).as_secs_f64();
        if duration > 0.0 {
            self.upload_rate = upload_sum as f64 / duration;
            self.download_rate = download_sum as f64 / duration;
        } else {
            self.upload_rate = 0.0;
            self.download_rate = 0.0;
        }
    }

    pub fn calculate_rate(&mut self, window: Duration) {
        self.calculate_rate_at(Instant::now(), window);
    }

    pub fn total_rate(&self) -> f64 {
        self.upload_rate + self.download_rate
    }

    pub fn total_bytes(&self) -> u64 {
        self.upload_bytes.saturating_add(self.download_bytes)
    }

    pub fn samples(&self) -> &SampleRing {
        &self.samples
    }

    pub fn format_rate(bytes_per_sec: f64) -> String {
        let rate = bytes_per_sec.max(0.0);
        if rate < 1024.0 {
            format!("{:.0} B/s", rate)
        } else if rate < 1024.0 * 1024.0 {
            format!("{:.1} KB/s", rate / 1024.0)
        } else if rate < 1024.0 * 1024.0 * 1024.0 {
            format!("{:.1} MB/s", rate / (1024.0 * 1024.0))
        } else {
            format!("{:.1} GB/s", rate / (1024.0 * 1024.0 * 1024.0))
        }
    }

    pub fn format_bytes(bytes: u64) -> String {
        if bytes < 1024 {
            format!("{} B", bytes)
        } else if bytes < 1024 * 1024 {
            format!("{:.1} KB", bytes as f64 / 1024.0)
        } else if bytes < 1024 * 1024 * 1024 {
            format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
        } else {
            format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
        }
    }
}
