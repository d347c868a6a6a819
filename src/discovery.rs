//! Discover devices on the local network
//!
//! One encrypted query is broadcast and every reply that arrives within the
//! discovery window is collected, at most one per source address.
use std::{
    collections::HashSet,
    io,
    net::{SocketAddr, UdpSocket},
    thread,
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use socket2::{Domain, Protocol, Socket, Type};

use crate::{
    datatypes::DeviceResponse,
    error::{Error, Result},
    protocol,
    query::DeviceQuery,
};

pub const DEVICE_PORT: u16 = 9999;
pub const BROADCAST: &str = "255.255.255.255:9999";

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// How long to collect replies after sending the query.
    pub window: Duration,
    /// Longest reply accepted from a device.
    pub max_reply_bytes: usize,
    /// Where the query is sent, normally the broadcast address.
    pub target: SocketAddr,
    /// Sleep between receive attempts while nothing is waiting.
    pub poll_interval: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        DiscoveryOptions {
            window: Duration::from_secs(3),
            max_reply_bytes: 4096,
            target: SocketAddr::from(([255, 255, 255, 255], DEVICE_PORT)),
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// An ephemeral UDP socket that may broadcast and reuse its address, set to
/// non-blocking.
pub fn broadcast_socket() -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from(([0, 0, 0, 0], 0)).into())?;
    Ok(socket.into())
}

/// Decrypt and parse one datagram.
pub fn decode_reply(datagram: &[u8]) -> Result<DeviceResponse> {
    let plain = protocol::decrypt(datagram);
    let text = std::str::from_utf8(&plain)
        .map_err(|err| Error::Malformed(format!("reply is not utf-8: {}", err)))?;
    debug!("{}", text);
    DeviceResponse::parse(text)
}

/// Broadcast `query` and collect the replies arriving within the window.
///
/// Returns when the window has elapsed, however many devices answered.
pub fn discover(
    query: &DeviceQuery,
    options: &DiscoveryOptions,
) -> Result<Vec<(SocketAddr, DeviceResponse)>> {
    let socket = broadcast_socket()?;

    let req = query.to_json();
    debug!("{}", req);
    info!("sending broadcast to {}", options.target);
    socket.send_to(&protocol::encrypt(req.as_bytes()), options.target)?;
    let deadline = Instant::now() + options.window;

    let mut buf = vec![0u8; options.max_reply_bytes];
    let mut seen = HashSet::new();
    let mut devices = Vec::new();

    while Instant::now() < deadline {
        let (size, addr) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(options.poll_interval.min(remaining(deadline)));
                continue;
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!("receive failed, skipping: {}", err);
                continue;
            }
        };

        if !seen.insert(addr) {
            debug!("ignoring repeated reply from {}", addr);
            continue;
        }

        match decode_reply(&buf[..size]) {
            Ok(response) => devices.push((addr, response)),
            Err(err) => {
                warn!("skipping malformed reply from {}: {}", addr, err);
                seen.remove(&addr);
            }
        }
    }

    debug!("closing udp socket, {} replies", devices.len());
    Ok(devices)
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatypes::tests::{HS100_JSON, HS110_JSON};

    fn fake_device(reply: Vec<u8>) -> (SocketAddr, thread::JoinHandle<String>) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 4096];
            let (size, from) = socket.recv_from(&mut buf).unwrap();
            socket.send_to(&reply, from).unwrap();
            String::from_utf8(protocol::decrypt(&buf[..size])).unwrap()
        });
        (addr, handle)
    }

    fn options(target: SocketAddr, window: Duration) -> DiscoveryOptions {
        DiscoveryOptions {
            window,
            target,
            ..Default::default()
        }
    }

    #[test]
    fn decodes_encrypted_reply() {
        let response = decode_reply(&protocol::encrypt(HS100_JSON.as_bytes())).unwrap();
        assert_eq!(response.sysinfo().unwrap().alias, "Switch Two");
    }

    #[test]
    fn socket_reuses_address_and_broadcasts() {
        let socket = broadcast_socket().unwrap();
        let options = socket2::SockRef::from(&socket);

        assert!(options.reuse_address().unwrap());
        assert!(socket.broadcast().unwrap());
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn garbage_reply_is_malformed() {
        assert!(decode_reply(&[0x00, 0x01, 0x02]).is_err());
        assert!(decode_reply(&protocol::encrypt(b"{\"system\":")).is_err());
    }

    #[test]
    fn returns_after_window_with_no_replies() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let window = Duration::from_millis(300);

        let start = Instant::now();
        let devices = discover(
            &DeviceQuery::discovery(),
            &options(silent.local_addr().unwrap(), window),
        )
        .unwrap();
        let elapsed = start.elapsed();

        assert!(devices.is_empty());
        assert!(elapsed >= window);
        assert!(elapsed < window + Duration::from_millis(500));
    }

    #[test]
    fn reply_is_collected_and_query_is_encrypted() {
        let (addr, device) = fake_device(protocol::encrypt(HS110_JSON.as_bytes()));

        let devices = discover(
            &DeviceQuery::discovery(),
            &options(addr, Duration::from_millis(500)),
        )
        .unwrap();

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].0, addr);
        assert_eq!(devices[0].1.sysinfo().unwrap().alias, "Switch One");
        assert_eq!(device.join().unwrap(), DeviceQuery::discovery().to_json());
    }

    #[test]
    fn malformed_reply_is_skipped() {
        let (addr, device) = fake_device(b"not encrypted json".to_vec());

        let devices = discover(
            &DeviceQuery::discovery(),
            &options(addr, Duration::from_millis(300)),
        )
        .unwrap();

        device.join().unwrap();
        assert!(devices.is_empty());
    }

    #[test]
    fn replies_from_distinct_sources_are_independent() {
        // One relay listens for the query and fans it out to two devices,
        // each answering from its own socket.
        let relay = UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = relay.local_addr().unwrap();
        let first = UdpSocket::bind("127.0.0.1:0").unwrap();
        let second = UdpSocket::bind("127.0.0.1:0").unwrap();
        let sources = vec![first.local_addr().unwrap(), second.local_addr().unwrap()];

        let handle = thread::spawn(move || {
            let mut buf = [0u8; 4096];
            let (_, from) = relay.recv_from(&mut buf).unwrap();
            second
                .send_to(&protocol::encrypt(HS110_JSON.as_bytes()), from)
                .unwrap();
            first
                .send_to(&protocol::encrypt(HS100_JSON.as_bytes()), from)
                .unwrap();
            // a repeat from the same source is dropped
            first
                .send_to(&protocol::encrypt(HS110_JSON.as_bytes()), from)
                .unwrap();
        });

        let devices = discover(
            &DeviceQuery::discovery(),
            &options(target, Duration::from_millis(500)),
        )
        .unwrap();
        handle.join().unwrap();

        assert_eq!(devices.len(), 2);
        let mut found: Vec<SocketAddr> = devices.iter().map(|(addr, _)| *addr).collect();
        found.sort();
        let mut expected = sources;
        expected.sort();
        assert_eq!(found, expected);

        let aliases: HashSet<String> = devices
            .iter()
            .map(|(_, r)| r.sysinfo().unwrap().alias.clone())
            .collect();
        assert!(aliases.contains("Switch One"));
        assert!(aliases.contains("Switch Two"));
    }
}
