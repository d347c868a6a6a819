use std::{
    convert::TryFrom,
    io::{Read, Write},
    net::{SocketAddr, TcpStream},
    time::Duration,
};

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use log::debug;

use crate::error::{Error, Result};

/// Seed of the running key, for both directions.
pub const INITIALIZATION_VECTOR: u8 = 171;

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest reply a device may announce over TCP.
pub const MAX_REPLY_BYTES: usize = 64 * 1024;

// Each output byte is the key XOR the input byte; the key then becomes the
// byte just emitted.
// see: https://www.softscheck.com/en/reverse-engineering-tp-link-hs110/
pub fn encrypt(plain: &[u8]) -> Vec<u8> {
    let mut key = INITIALIZATION_VECTOR;
    let mut cipher = Vec::with_capacity(plain.len());

    for byte in plain {
        key ^= byte;
        cipher.push(key);
    }

    cipher
}

// Each output byte is the key XOR the input byte; the key then becomes the
// ciphertext byte just consumed.
pub fn decrypt(cipher: &[u8]) -> Vec<u8> {
    let mut key = INITIALIZATION_VECTOR;
    let mut plain = Vec::with_capacity(cipher.len());

    for &byte in cipher {
        plain.push(key ^ byte);
        key = byte;
    }

    plain
}

/// Encrypt `plain` and prefix it with its big endian length, as the TCP
/// transport expects.
pub fn frame(plain: &[u8]) -> Result<Vec<u8>> {
    let payload = encrypt(plain);
    let mut framed = Vec::with_capacity(payload.len() + 4);
    let length = u32::try_from(payload.len()).map_err(|_| {
        Error::Malformed(format!("{} byte message is too long to frame", payload.len()))
    })?;
    framed.write_u32::<BigEndian>(length)?;
    framed.extend_from_slice(&payload);
    Ok(framed)
}

pub trait Protocol {
    /// Send one request and return the decrypted reply.
    fn send(&self, addr: SocketAddr, msg: &str) -> Result<String>;
}

pub struct TcpProtocol {
    read_timeout: Duration,
}

impl TcpProtocol {
    pub fn new() -> TcpProtocol {
        TcpProtocol {
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn with_timeout(read_timeout: Duration) -> TcpProtocol {
        TcpProtocol { read_timeout }
    }
}

impl Default for TcpProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol for TcpProtocol {
    fn send(&self, addr: SocketAddr, msg: &str) -> Result<String> {
        let payload = frame(msg.as_bytes())?;
        let mut stream = TcpStream::connect_timeout(&addr, self.read_timeout)?;

        stream.set_read_timeout(Some(self.read_timeout))?;
        stream.write_all(&payload)?;

        let mut header = [0u8; 4];
        stream.read_exact(&mut header)?;
        let length = BigEndian::read_u32(&header) as usize;
        debug!("{} announced a {} byte reply", addr, length);
        if length > MAX_REPLY_BYTES {
            return Err(Error::Malformed(format!(
                "{} announced a {} byte reply, more than {} allowed",
                addr, length, MAX_REPLY_BYTES
            )));
        }

        let mut resp = vec![0u8; length];
        stream.read_exact(&mut resp)?;

        String::from_utf8(decrypt(&resp))
            .map_err(|err| Error::Malformed(format!("reply from {} is not utf-8: {}", addr, err)))
    }
}

#[cfg(test)]
pub struct ProtocolMock {
    pub requests: std::cell::RefCell<Vec<(SocketAddr, String)>>,
    resp: std::cell::RefCell<Option<Result<String>>>,
}

#[cfg(test)]
impl ProtocolMock {
    pub fn new() -> ProtocolMock {
        ProtocolMock {
            requests: std::cell::RefCell::new(Vec::new()),
            resp: std::cell::RefCell::new(None),
        }
    }

    pub fn set_send_return_value(&self, resp: Result<String>) {
        self.resp.replace(Some(resp));
    }
}

#[cfg(test)]
impl Protocol for ProtocolMock {
    fn send(&self, addr: SocketAddr, msg: &str) -> Result<String> {
        self.requests.borrow_mut().push((addr, msg.to_string()));
        self.resp
            .borrow_mut()
            .take()
            .unwrap_or_else(|| Ok(String::from("{}")))
    }
}
