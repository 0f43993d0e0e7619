// pnet datalink capture backend

use super::{CaptureBackend, CaptureChannel, FrameReceiver};
use crate::packet::LinkType;
use ::pnet::datalink::{self, Channel, DataLinkReceiver, NetworkInterface};
use anyhow::{Context, Result};
use std::io;
use std::time::Duration;

/// Upper bound on how long a capture thread blocks before re-checking for stop
const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Raw-socket capture on one or all interfaces via pnet
pub struct PnetCapture;

impl PnetCapture {
    pub fn new() -> Self {
        Self
    }

    pub fn is_available() -> bool {
        // pnet works on Linux and BSD with raw sockets, and Windows with Npcap
        cfg!(target_os = "linux")
            || cfg!(target_os = "freebsd")
            || cfg!(target_os = "openbsd")
            || cfg!(target_os = "netbsd")
            || cfg!(target_os = "windows")
    }

    fn find_interfaces(selector: Option<&str>) -> Result<Vec<NetworkInterface>> {
        let interfaces = datalink::interfaces();

        match selector {
            Some(name) => interfaces
                .into_iter()
                .find(|iface| iface.name == name)
                .map(|iface| vec![iface])
                .ok_or_else(|| anyhow::anyhow!("No such network interface: {}", name)),
            // Every interface that is up and has an address, loopback included
            None => Ok(interfaces
                .into_iter()
                .filter(|iface| iface.is_up() && !iface.ips.is_empty())
                .collect()),
        }
    }

    fn link_type(interface: &NetworkInterface) -> LinkType {
        // tun devices have neither a MAC address nor an Ethernet header
        if interface.mac.is_none() && !interface.is_loopback() {
            LinkType::RawIp
        } else {
            LinkType::Ethernet
        }
    }

    fn open_interface(interface: &NetworkInterface) -> Result<CaptureChannel> {
        let config = datalink::Config {
            read_timeout: Some(READ_TIMEOUT),
            ..Default::default()
        };

        match datalink::channel(interface, config) {
            Ok(Channel::Ethernet(_tx, rx)) => Ok(CaptureChannel {
                interface: interface.name.clone(),
                link: Self::link_type(interface),
                receiver: Box::new(PnetReceiver { rx }),
            }),
            Ok(_) => Err(anyhow::anyhow!(
                "Unsupported channel type for {}",
                interface.name
            )),
            Err(e) => Err(e).with_context(|| {
                format!(
                    "Failed to open capture channel on {} (are you root?)",
                    interface.name
                )
            }),
        }
    }
}

impl Default for PnetCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend for PnetCapture {
    fn name(&self) -> &'static str {
        "pnet"
    }

    fn open(&self, interface: Option<&str>) -> Result<Vec<CaptureChannel>> {
        let interfaces = Self::find_interfaces(interface)?;
        if interfaces.is_empty() {
            anyhow::bail!("No network interfaces available for capture");
        }

        // An explicitly requested interface must open; with "all interfaces"
        // a single unusable one is skipped as long as at least one opens
        if interface.is_some() {
            return interfaces.iter().map(Self::open_interface).collect();
        }

        let mut channels = Vec::new();
        let mut last_error = None;
        for iface in &interfaces {
            match Self::open_interface(iface) {
                Ok(channel) => channels.push(channel),
                Err(e) => {
                    log::debug!("Skipping interface {}: {:#}", iface.name, e);
                    last_error = Some(e);
                }
            }
        }

        match (channels.is_empty(), last_error) {
            (true, Some(e)) => Err(e),
            _ => {
                log::info!(
                    "Opened packet capture on {} of {} interface(s)",
                    channels.len(),
                    interfaces.len()
                );
                Ok(channels)
            }
        }
    }
}

struct PnetReceiver {
    rx: Box<dyn DataLinkReceiver>,
}

impl FrameReceiver for PnetReceiver {
    fn next_frame(&mut self) -> io::Result<&[u8]> {
        self.rx.next()
    }
}
