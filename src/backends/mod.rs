// Backend trait definitions and selection
//
// Capture backends produce raw frames; socket backends enumerate the OS socket
// table and resolve process identities. Both are traits so the pipeline can
// run against in-memory sources in tests.

pub mod capture;
pub mod socket;

/// Backend metadata for `--list-backends`
#[derive(Debug, Clone)]
pub struct BackendInfo {
    pub kind: &'static str,
    pub name: &'static str,
    pub available: bool,
}

/// Detect every compiled-in backend and whether it works on this system
pub fn detect_backends() -> Vec<BackendInfo> {
    let mut backends = vec![BackendInfo {
        kind: "capture",
        name: "pnet",
        available: capture::pnet::PnetCapture::is_available(),
    }];

    #[cfg(target_os = "linux")]
    backends.push(BackendInfo {
        kind: "socket",
        name: "procfs",
        available: socket::procfs::ProcfsSocketSource::is_available(),
    });

    backends
}
