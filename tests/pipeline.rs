// End-to-end attribution through NetworkMonitor with in-memory backends

use anyhow::Result;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use xnettop::backends::capture::{CaptureBackend, CaptureChannel, FrameReceiver};
use xnettop::backends::socket::{ProcessIdentity, SocketEntry, SocketSource};
use xnettop::packet::testing::{ipv4_frame, ipv6_frame};
use xnettop::packet::{LinkType, Transport};
use xnettop::stats::{UNKNOWN_PID, UNKNOWN_PROCESS_NAME};
use xnettop::{MonitorConfig, NetworkMonitor};

const HOST: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 100);
const SERVER: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

/// Frames handed to the capture thread through a channel, so tests can inject after start
struct ChannelReceiver {
    rx: crossbeam_channel::Receiver<Vec<u8>>,
    current: Vec<u8>,
}

impl FrameReceiver for ChannelReceiver {
    fn next_frame(&mut self) -> io::Result<&[u8]> {
        match self.rx.recv_timeout(Duration::from_millis(20)) {
            Ok(frame) => {
                self.current = frame;
                Ok(self.current.as_slice())
            }
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "idle")),
        }
    }
}

struct InjectingBackend {
    rx: Mutex<Option<crossbeam_channel::Receiver<Vec<u8>>>>,
    link: LinkType,
}

impl CaptureBackend for InjectingBackend {
    fn name(&self) -> &'static str {
        "injecting"
    }

    fn open(&self, interface: Option<&str>) -> Result<Vec<CaptureChannel>> {
        if interface == Some("missing0") {
            anyhow::bail!("No such network interface: missing0");
        }
        let rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow::anyhow!("already opened"))?;
        Ok(vec![CaptureChannel {
            interface: interface.unwrap_or("test0").to_string(),
            link: self.link,
            receiver: Box::new(ChannelReceiver {
                rx,
                current: Vec::new(),
            }),
        }])
    }
}

#[derive(Default)]
struct StaticSource {
    sockets: Mutex<Vec<SocketEntry>>,
    names: Mutex<HashMap<i32, String>>,
    identity_queries: Mutex<HashMap<i32, usize>>,
    socket_queries: AtomicUsize,
}

/// Local wrapper so the shared source can implement the crate's trait (orphan rule)
struct SharedSource(Arc<StaticSource>);

impl std::ops::Deref for SharedSource {
    type Target = StaticSource;
    fn deref(&self) -> &StaticSource {
        &self.0
    }
}

impl SocketSource for SharedSource {
    fn name(&self) -> &'static str {
        "static"
    }

    fn local_addresses(&self) -> Result<Vec<IpAddr>> {
        Ok(vec![HOST.into(), "2001:db8::100".parse()?])
    }

    fn sockets(&self) -> Result<Vec<SocketEntry>> {
        self.socket_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.sockets.lock().unwrap().clone())
    }

    fn process_identity(&self, pid: i32) -> Result<ProcessIdentity> {
        *self.identity_queries.lock().unwrap().entry(pid).or_default() += 1;
        let name = self
            .names
            .lock()
            .unwrap()
            .get(&pid)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("process {} exited", pid))?;
        Ok(ProcessIdentity {
            pid,
            command_line: name.clone(),
            name,
        })
    }
}

fn socket(pid: i32, transport: Transport, local: &str, remote: Option<&str>) -> SocketEntry {
    SocketEntry {
        pid,
        local: local.parse::<SocketAddr>().unwrap(),
        remote: remote.map(|r| r.parse::<SocketAddr>().unwrap()),
        transport,
        status: "Established".to_string(),
    }
}

struct Fixture {
    monitor: NetworkMonitor,
    frames: crossbeam_channel::Sender<Vec<u8>>,
    source: Arc<StaticSource>,
}

fn fixture(link: LinkType, interface: Option<&str>) -> Fixture {
    let (tx, rx) = crossbeam_channel::unbounded();
    let source = Arc::new(StaticSource::default());
    {
        let mut sockets = source.sockets.lock().unwrap();
        sockets.push(socket(
            1234,
            Transport::Tcp,
            "192.168.1.100:50000",
            Some("93.184.216.34:443"),
        ));
        sockets.push(socket(
            4321,
            Transport::Udp,
            "[2001:db8::100]:5353",
            None,
        ));
        sockets.push(socket(999, Transport::Tcp, "192.168.1.100:6000", Some("1.1.1.1:80")));
    }
    {
        let mut names = source.names.lock().unwrap();
        names.insert(1234, "curl".to_string());
        names.insert(4321, "resolver".to_string());
        // 999 has no identity: it exited between enumeration and lookup
    }

    let config = MonitorConfig {
        interface: interface.map(str::to_string),
        socket_refresh_secs: 0.05,
        aggregate_interval_secs: 0.02,
        ..Default::default()
    };
    let backend = InjectingBackend {
        rx: Mutex::new(Some(rx)),
        link,
    };
    let monitor =
        NetworkMonitor::new(config, Box::new(backend), Box::new(SharedSource(Arc::clone(&source)))).unwrap();

    Fixture {
        monitor,
        frames: tx,
        source,
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn test_upload_and_download_attributed() {
    let fx = fixture(LinkType::Ethernet, None);
    fx.monitor.start_all().unwrap();

    let upload = ipv4_frame(HOST, 50000, SERVER, 443, Transport::Tcp, 1446, true);
    let download = ipv4_frame(SERVER, 443, HOST, 50000, Transport::Tcp, 946, true);
    assert_eq!(upload.len(), 1500);
    assert_eq!(download.len(), 1000);
    fx.frames.send(upload).unwrap();
    fx.frames.send(download).unwrap();

    assert!(wait_until(|| {
        fx.monitor
            .stats_for(1234)
            .is_some_and(|s| s.upload_bytes == 1500 && s.download_bytes == 1000)
    }));

    let snapshot = fx.monitor.get_snapshot();
    let curl = snapshot.iter().find(|s| s.pid == 1234).unwrap();
    assert_eq!(curl.name, "curl");

    fx.monitor.stop_all();
    assert!(!fx.monitor.is_running());
}

#[test]
fn test_unconnected_udp_over_ipv6() {
    let fx = fixture(LinkType::Ethernet, None);
    fx.monitor.start_all().unwrap();

    let query = ipv6_frame(
        "2001:db8::100".parse().unwrap(),
        5353,
        "2001:db8::1".parse().unwrap(),
        53,
        Transport::Udp,
        40,
    );
    let len = query.len() as u64;
    fx.frames.send(query).unwrap();

    // The socket has no peer, so the packet matches neither orientation and is unknown
    assert!(wait_until(|| fx.monitor.stats_for(UNKNOWN_PID).is_some()));
    let unknown = fx.monitor.stats_for(UNKNOWN_PID).unwrap();
    assert_eq!(unknown.name, UNKNOWN_PROCESS_NAME);
    assert_eq!(unknown.upload_bytes, len);

    fx.monitor.stop_all();
}

#[test]
fn test_vanished_process_traffic_is_unknown() {
    let fx = fixture(LinkType::Ethernet, None);
    fx.monitor.start_all().unwrap();

    fx.frames
        .send(ipv4_frame(
            HOST,
            6000,
            Ipv4Addr::new(1, 1, 1, 1),
            80,
            Transport::Tcp,
            100,
            true,
        ))
        .unwrap();

    assert!(wait_until(|| fx.monitor.stats_for(UNKNOWN_PID).is_some()));
    assert!(fx.monitor.stats_for(999).is_none());
    fx.monitor.stop_all();
}

#[test]
fn test_raw_ip_link() {
    let fx = fixture(LinkType::RawIp, Some("tun0"));
    fx.monitor.start_all().unwrap();

    fx.frames
        .send(ipv4_frame(SERVER, 443, HOST, 50000, Transport::Tcp, 60, false))
        .unwrap();

    assert!(wait_until(|| {
        fx.monitor
            .stats_for(1234)
            .is_some_and(|s| s.download_bytes == 100)
    }));
    fx.monitor.stop_all();
}

#[test]
fn test_loopback_traffic_is_not_attributed() {
    let fx = fixture(LinkType::Ethernet, None);
    fx.monitor.start_all().unwrap();

    fx.frames
        .send(ipv4_frame(
            Ipv4Addr::LOCALHOST,
            8080,
            Ipv4Addr::LOCALHOST,
            40000,
            Transport::Tcp,
            10,
            true,
        ))
        .unwrap();

    assert!(wait_until(|| fx.monitor.loopback_skipped() == 1));
    assert!(fx.monitor.get_snapshot().is_empty());
    fx.monitor.stop_all();
}

#[test]
fn test_clear_keeps_pipeline_running() {
    let fx = fixture(LinkType::Ethernet, None);
    fx.monitor.start_all().unwrap();

    let frame = ipv4_frame(HOST, 50000, SERVER, 443, Transport::Tcp, 100, true);
    fx.frames.send(frame.clone()).unwrap();
    assert!(wait_until(|| fx.monitor.stats_for(1234).is_some()));

    fx.monitor.clear();
    assert!(fx.monitor.get_snapshot().is_empty());
    assert!(fx.monitor.is_running());

    fx.frames.send(frame.clone()).unwrap();
    assert!(wait_until(|| {
        fx.monitor
            .stats_for(1234)
            .is_some_and(|s| s.upload_bytes == frame.len() as u64)
    }));
    fx.monitor.stop_all();
}

#[test]
fn test_unknown_interface_fails_start() {
    let fx = fixture(LinkType::Ethernet, Some("missing0"));

    let err = fx.monitor.start_all().unwrap_err();
    assert!(format!("{:#}", err).contains("missing0"));
    assert!(!fx.monitor.is_running());
    // The socket table was populated before capture failed; the vanished PID is skipped
    assert_eq!(fx.monitor.connection_count(), 2);
}

#[test]
fn test_name_cache_hits_across_refreshes() {
    let fx = fixture(LinkType::Ethernet, None);
    fx.monitor.start_all().unwrap();

    assert!(wait_until(|| fx.source.socket_queries.load(Ordering::SeqCst) >= 4));
    fx.monitor.stop_all();

    let queries = fx.source.identity_queries.lock().unwrap().clone();
    // Live processes are resolved once and then served from the cache
    assert_eq!(queries.get(&1234), Some(&1));
    assert_eq!(queries.get(&4321), Some(&1));
    // A PID that could not be resolved is never cached, so it is retried each refresh
    assert!(queries.get(&999).is_some_and(|&n| n >= 4));
    assert_eq!(fx.monitor.sockets().cached_process_count(), 2);
}

#[test]
fn test_snapshot_serializes_without_samples() {
    let fx = fixture(LinkType::Ethernet, None);
    fx.monitor.start_all().unwrap();
    fx.frames
        .send(ipv4_frame(HOST, 50000, SERVER, 443, Transport::Tcp, 100, true))
        .unwrap();
    assert!(wait_until(|| fx.monitor.stats_for(1234).is_some()));
    fx.monitor.stop_all();

    let json = serde_json::to_value(fx.monitor.get_snapshot()).unwrap();
    let entry = &json[0];
    assert_eq!(entry["pid"], 1234);
    assert_eq!(entry["name"], "curl");
    assert!(entry.get("samples").is_none());
    assert!(entry["upload_rate"].is_number());
}
