use std::{io, time::Duration};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info};
use netlog_common::Packet;
use pnet::{
    datalink::{self, Channel, DataLinkReceiver},
    packet::{
        ethernet::{EtherTypes, EthernetPacket},
        ip::IpNextHeaderProtocols,
        ipv4::Ipv4Packet,
        tcp::TcpPacket,
        udp::UdpPacket,
        Packet as _,
    },
};
use tokio::{
    sync::{mpsc, watch},
    task,
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Clone, Debug)]
pub struct CaptureOptions {
    pub interface: String,
    pub read_buffer_size: usize,
    /// Upper bound on how long a read blocks before shutdown is rechecked.
    pub poll_interval: Duration,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub decoded: u64,
    pub skipped: u64,
}

/// Opens a promiscuous datalink channel on the named interface.
pub fn open(opts: &CaptureOptions) -> Result<Box<dyn DataLinkReceiver>> {
    let interface = datalink::interfaces()
        .into_iter()
        .find(|iface| iface.name == opts.interface)
        .ok_or_else(|| anyhow!("no such interface: {}", opts.interface))?;

    let config = datalink::Config {
        read_buffer_size: opts.read_buffer_size,
        read_timeout: Some(opts.poll_interval),
        promiscuous: true,
        ..Default::default()
    };
    match datalink::channel(&interface, config)
        .with_context(|| format!("failed to open capture on {}", opts.interface))?
    {
        Channel::Ethernet(_, rx) => Ok(rx),
        _ => Err(anyhow!("unsupported channel type on {}", opts.interface)),
    }
}

/// Pumps decoded packets from `rx` into `tx` on a blocking thread until
/// shutdown fires or the receiving side goes away.
pub fn spawn(
    mut rx: Box<dyn DataLinkReceiver>,
    tx: mpsc::Sender<Packet>,
    shutdown: watch::Receiver<bool>,
) -> task::JoinHandle<Result<CaptureStats>> {
    task::spawn_blocking(move || {
        let mut stats = CaptureStats::default();
        while !*shutdown.borrow() {
            match rx.next() {
                Ok(frame) => match decode_frame(frame, Utc::now()) {
                    Some(packet) => {
                        stats.decoded += 1;
                        if tx.blocking_send(packet).is_err() {
                            break;
                        }
                    }
                    None => stats.skipped += 1,
                },
                Err(err) if is_retryable(&err) => continue,
                Err(err) => return Err(err).context("packet capture failed"),
            }
        }
        info!(
            "capture stopped: {} packets decoded, {} skipped",
            stats.decoded, stats.skipped
        );
        Ok(stats)
    })
}

fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Decodes an Ethernet frame carrying IPv4 with a TCP or UDP header.
pub fn decode_frame(frame: &[u8], timestamp: DateTime<Utc>) -> Option<Packet> {
    let ethernet = EthernetPacket::new(frame)?;
    if ethernet.get_ethertype() != EtherTypes::Ipv4 {
        return None;
    }
    let ipv4 = Ipv4Packet::new(ethernet.payload())?;
    if ipv4.get_version() != 4 {
        return None;
    }

    let protocol = ipv4.get_next_level_protocol();
    let (src_port, dst_port) = match protocol {
        IpNextHeaderProtocols::Tcp => {
            let tcp = TcpPacket::new(ipv4.payload())?;
            (tcp.get_source(), tcp.get_destination())
        }
        IpNextHeaderProtocols::Udp => {
            let udp = UdpPacket::new(ipv4.payload())?;
            (udp.get_source(), udp.get_destination())
        }
        other => {
            debug!("skipping IP protocol {}", other.0);
            return None;
        }
    };

    Some(Packet {
        timestamp,
        src: ipv4.get_source(),
        dst: ipv4.get_destination(),
        l3_protocol: protocol.0,
        src_port,
        dst_port,
        byte_length: frame.len(),
    })
}
