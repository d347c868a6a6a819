//! Error types
use std::{fmt, io, result};

use thiserror::Error;

use crate::retry::Classify;

#[derive(Debug, Error)]
pub enum Error {
    #[error("error connecting to the device: {0}")]
    IO(#[from] io::Error),
    #[error("could not parse the response received from the device: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("response data error: {0}")]
    TPLink(#[from] SectionError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("cloud returned error ({code}): {msg}")]
    Cloud { code: i64, msg: String, transient: bool },
    #[error("device '{0}' is offline")]
    DeviceOffline(String),
    #[error("device '{device}' unreachable: {source}")]
    Unreachable {
        device: String,
        #[source]
        source: Box<Error>,
    },
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("malformed reply: {0}")]
    Malformed(String),
    #[error("sink write failed: {0}")]
    Sink(String),
    #[error("configuration error: {0}")]
    Config(#[from] config_sys::ConfigError),
    #[error("{0}")]
    Other(String),
}

/// Coarse classification used to decide retry and containment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    TransientCloud,
    DeviceOffline,
    Unreachable,
    Authentication,
    Malformed,
    Sink,
    Config,
    Other,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::IO(_) => ErrorKind::Connection,
            Error::Serde(_) | Error::TPLink(_) | Error::Malformed(_) => ErrorKind::Malformed,
            Error::Http(err) => {
                if err.is_connect() || err.is_timeout() {
                    ErrorKind::Connection
                } else if err
                    .status()
                    .map(|s| s.is_server_error() || s.as_u16() == 429)
                    .unwrap_or(false)
                {
                    ErrorKind::TransientCloud
                } else {
                    ErrorKind::Other
                }
            }
            Error::Cloud { transient, .. } => {
                if *transient {
                    ErrorKind::TransientCloud
                } else {
                    ErrorKind::Other
                }
            }
            Error::DeviceOffline(_) => ErrorKind::DeviceOffline,
            Error::Unreachable { .. } => ErrorKind::Unreachable,
            Error::Authentication(_) => ErrorKind::Authentication,
            Error::Sink(_) => ErrorKind::Sink,
            Error::Config(_) => ErrorKind::Config,
            Error::Other(_) => ErrorKind::Other,
        }
    }
}

impl Classify for Error {
    type Kind = ErrorKind;

    fn kind(&self) -> ErrorKind {
        Error::kind(self)
    }
}

pub type Result<T> = result::Result<T, Error>;

/// Error object a device puts in place of a command group or command result.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SectionError {
    pub err_code: i16,
    #[serde(default)]
    pub err_msg: String,
}

impl fmt::Display for SectionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.err_code, self.err_msg)
    }
}

impl std::error::Error for SectionError {}
