//! Where devices and their readings come from
use std::net::SocketAddr;

use log::{info, warn};

use crate::{
    datatypes::DeviceResponse,
    discovery::{self, DiscoveryOptions},
    error::Result,
    metrics::{self, DeviceIdentity},
    protocol::{Protocol, TcpProtocol},
    query::DeviceQuery,
};

/// A device reply and the collector clock when it was requested.
#[derive(Debug, Clone)]
pub struct Reading {
    pub response: DeviceResponse,
    pub observed_at: i64,
}

/// A device found by a source. `reading` is set when finding the device
/// already produced its state.
#[derive(Debug, Clone)]
pub struct Discovered<H> {
    pub identity: DeviceIdentity,
    pub handle: H,
    pub reading: Option<Reading>,
}

pub trait DeviceSource {
    /// What the source needs to address one device again.
    type Handle;

    fn devices(&mut self) -> Result<Vec<Discovered<Self::Handle>>>;

    fn query(&mut self, handle: &Self::Handle, query: &DeviceQuery) -> Result<DeviceResponse>;

    /// Whether points should reach the sink after every device rather than
    /// once at the end of the run.
    fn flush_per_device(&self) -> bool {
        false
    }
}

/// Devices on the local network: everything answering the broadcast, plus
/// fixed hosts asked directly over TCP.
pub struct LocalSource {
    options: DiscoveryOptions,
    hosts: Vec<SocketAddr>,
    protocol: Box<dyn Protocol>,
}

impl LocalSource {
    pub fn new(options: DiscoveryOptions) -> Self {
        LocalSource {
            options,
            hosts: Vec::new(),
            protocol: Box::new(TcpProtocol::new()),
        }
    }

    pub fn with_hosts(mut self, hosts: Vec<SocketAddr>) -> Self {
        self.hosts = hosts;
        self
    }

    pub fn with_protocol(mut self, protocol: Box<dyn Protocol>) -> Self {
        self.protocol = protocol;
        self
    }

    fn ask_host(&self, addr: SocketAddr, query: &DeviceQuery) -> Result<DeviceResponse> {
        DeviceResponse::parse(&self.protocol.send(addr, &query.to_json())?)
    }
}

fn identity_of(response: &DeviceResponse) -> DeviceIdentity {
    response
        .sysinfo()
        .map(|sysinfo| DeviceIdentity::new(&sysinfo.alias))
        .unwrap_or_default()
}

impl DeviceSource for LocalSource {
    type Handle = SocketAddr;

    fn devices(&mut self) -> Result<Vec<Discovered<SocketAddr>>> {
        let query = DeviceQuery::discovery();
        let observed_at = metrics::now();

        let mut found: Vec<Discovered<SocketAddr>> = discovery::discover(&query, &self.options)?
            .into_iter()
            .map(|(addr, response)| Discovered {
                identity: identity_of(&response),
                handle: addr,
                reading: Some(Reading {
                    response,
                    observed_at,
                }),
            })
            .collect();
        info!("{} devices answered the broadcast", found.len());

        for &addr in &self.hosts {
            if found.iter().any(|d| d.handle == addr) {
                continue;
            }
            let observed_at = metrics::now();
            match self.ask_host(addr, &query) {
                Ok(response) => found.push(Discovered {
                    identity: identity_of(&response),
                    handle: addr,
                    reading: Some(Reading {
                        response,
                        observed_at,
                    }),
                }),
                Err(err) => warn!("skipping host {}: {}", addr, err),
            }
        }

        Ok(found)
    }

    fn query(&mut self, handle: &SocketAddr, query: &DeviceQuery) -> Result<DeviceResponse> {
        self.ask_host(*handle, query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatypes::tests::{HS100_JSON, HS110_JSON};
    use crate::protocol::ProtocolMock;
    use std::{net::UdpSocket, time::Duration};

    fn silent_network() -> (UdpSocket, DiscoveryOptions) {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let options = DiscoveryOptions {
            window: Duration::from_millis(100),
            target: silent.local_addr().unwrap(),
            ..Default::default()
        };
        (silent, options)
    }

    #[test]
    fn static_hosts_are_asked_directly() {
        let (_silent, options) = silent_network();
        let protocol = ProtocolMock::new();
        protocol.set_send_return_value(Ok(String::from(HS110_JSON)));
        let host: SocketAddr = "192.0.2.10:9999".parse().unwrap();

        let mut source = LocalSource::new(options)
            .with_hosts(vec![host])
            .with_protocol(Box::new(protocol));
        let devices = source.devices().unwrap();

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].handle, host);
        assert_eq!(devices[0].identity.alias, "Switch One");
        assert!(devices[0].reading.is_some());
    }

    #[test]
    fn failing_host_is_skipped() {
        let (_silent, options) = silent_network();
        let protocol = ProtocolMock::new();
        protocol.set_send_return_value(Ok(String::from("invalid")));

        let mut source = LocalSource::new(options)
            .with_hosts(vec!["192.0.2.11:9999".parse().unwrap()])
            .with_protocol(Box::new(protocol));

        assert!(source.devices().unwrap().is_empty());
    }

    #[test]
    fn query_goes_to_the_device_address() {
        let (_silent, options) = silent_network();
        let protocol = ProtocolMock::new();
        protocol.set_send_return_value(Ok(String::from(HS100_JSON)));
        let mut source = LocalSource::new(options).with_protocol(Box::new(protocol));

        let response = source
            .query(&"192.0.2.12:9999".parse().unwrap(), &DeviceQuery::sysinfo())
            .unwrap();

        assert_eq!(response.sysinfo().unwrap().alias, "Switch Two");
    }
}
