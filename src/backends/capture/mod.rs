// Packet capture backend trait and implementations

use crate::packet::LinkType;
use anyhow::Result;
use std::io;

pub mod pnet;

/// Blocking source of raw frames for one interface.
///
/// Implementations must return within a bounded time even when the link is
/// idle, reporting `io::ErrorKind::TimedOut`, so the capture loop can observe
/// stop requests.
pub trait FrameReceiver: Send {
    fn next_frame(&mut self) -> io::Result<&[u8]>;
}

/// An opened capture channel on one interface
pub struct CaptureChannel {
    pub interface: String,
    pub link: LinkType,
    pub receiver: Box<dyn FrameReceiver>,
}

/// Packet capture backend trait
pub trait CaptureBackend: Send + Sync {
    /// Backend name (e.g., "pnet")
    fn name(&self) -> &'static str;

    /// Open capture channels. `interface = None` means every usable interface.
    ///
    /// Failing to open anything at all is fatal and reported to the caller.
    fn open(&self, interface: Option<&str>) -> Result<Vec<CaptureChannel>>;
}

/// Create the default capture backend for this platform
pub fn default_backend() -> Box<dyn CaptureBackend> {
    Box::new(pnet::PnetCapture::new())
}
