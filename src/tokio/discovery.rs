//! Discover devices on the local network asynchronously
//!
use std::{collections::HashSet, net::SocketAddr};

use log::{debug, warn};
use tokio::{
    net::UdpSocket,
    time::{timeout_at, Instant},
};

use crate::{
    datatypes::DeviceResponse,
    discovery::{self, decode_reply, DiscoveryOptions},
    error::Result,
    protocol,
    query::DeviceQuery,
};

/// Broadcast `query` and collect replies until the window closes.
pub async fn with_window(
    query: &DeviceQuery,
    options: &DiscoveryOptions,
) -> Result<Vec<(SocketAddr, DeviceResponse)>> {
    let socket = UdpSocket::from_std(discovery::broadcast_socket()?)?;

    let req = protocol::encrypt(query.to_json().as_bytes());
    socket.send_to(&req, options.target).await?;
    let deadline = Instant::now() + options.window;

    let mut buf = vec![0_u8; options.max_reply_bytes];
    let mut seen = HashSet::new();
    let mut devices = Vec::new();

    while let Ok(received) = timeout_at(deadline, socket.recv_from(&mut buf)).await {
        let (size, addr) = match received {
            Ok(received) => received,
            Err(err) => {
                warn!("receive failed, skipping: {}", err);
                continue;
            }
        };
        if seen.contains(&addr) {
            debug!("ignoring repeated reply from {}", addr);
            continue;
        }
        match decode_reply(&buf[..size]) {
            Ok(response) => {
                seen.insert(addr);
                devices.push((addr, response));
            }
            Err(err) => warn!("skipping malformed reply from {}: {}", addr, err),
        }
    }

    Ok(devices)
}

/// Discover devices with the default window of 3 seconds.
pub async fn discover() -> Result<Vec<(SocketAddr, DeviceResponse)>> {
    with_window(&DeviceQuery::discovery(), &DiscoveryOptions::default()).await
}
