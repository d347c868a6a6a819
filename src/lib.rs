//! Record the state and power draw of TPLink Kasa smart plugs.
//!
//! Devices are found by UDP broadcast on the local network or listed by the
//! TPLink cloud; their replies become `status` and `power` points for a
//! time-series store.
extern crate byteorder;

#[macro_use]
extern crate serde_derive;

pub mod cloud;
pub mod collector;
pub mod config;
pub mod datatypes;
pub mod discovery;
pub mod error;
pub mod logger;
pub mod metrics;
pub mod protocol;
pub mod query;
pub mod retry;
pub mod sink;
pub mod source;
#[cfg(feature = "async")]
pub mod tokio;

pub use crate::discovery::discover;
