//! Settings loaded from `./config/kasa.toml`, an optional extra file and
//! `KASA_*` environment variables.
use std::{
    net::{IpAddr, SocketAddr},
    path::Path,
    time::Duration,
};

use config_sys::{Config, ConfigError, Environment, File};

use crate::{
    discovery::{DiscoveryOptions, BROADCAST, DEVICE_PORT},
    error::Result,
    metrics::DeviceClock,
    retry::RetryPolicy,
};

const CONFIG_FILE_DEFAULT: &str = "./config/kasa";
const CONFIG_ENV_PREFIX: &str = "KASA";
const CONFIG_ENV_PREFIX_SEPARATOR: &str = "_";
// KASA_CLOUD__USERNAME overrides cloud.username
const CONFIG_ENV_SEPARATOR: &str = "__";

pub const DEFAULT_CLOUD_URL: &str = "https://wap.tplinkcloud.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Local,
    Cloud,
}

impl Default for Transport {
    fn default() -> Self {
        Transport::Local
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log_level: String,
    pub transport: Transport,
    pub local: LocalSettings,
    pub cloud: CloudSettings,
    pub influx: InfluxSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            log_level: String::from("info"),
            transport: Transport::default(),
            local: LocalSettings::default(),
            cloud: CloudSettings::default(),
            influx: InfluxSettings::default(),
        }
    }
}

impl Settings {
    pub fn load(extra_path: Option<&Path>) -> Result<Settings> {
        let mut builder = Config::builder()
            .add_source(File::with_name(CONFIG_FILE_DEFAULT).required(false))
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator(CONFIG_ENV_PREFIX_SEPARATOR)
                    .separator(CONFIG_ENV_SEPARATOR)
                    .try_parsing(true),
            );

        if let Some(path) = extra_path {
            builder = builder.add_source(File::from(path));
        }

        Ok(builder.build()?.try_deserialize::<Settings>()?)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalSettings {
    pub window_secs: f64,
    pub max_reply_bytes: usize,
    pub broadcast: String,
    /// Devices outside broadcast reach, as `ip` or `ip:port`.
    pub hosts: Vec<String>,
    pub tcp_timeout_secs: u64,
    pub device_clock: DeviceClock,
}

impl Default for LocalSettings {
    fn default() -> Self {
        LocalSettings {
            window_secs: 3.0,
            max_reply_bytes: 4096,
            broadcast: String::from(BROADCAST),
            hosts: Vec::new(),
            tcp_timeout_secs: 5,
            device_clock: DeviceClock::default(),
        }
    }
}

impl LocalSettings {
    pub fn discovery_options(&self) -> Result<DiscoveryOptions> {
        if !(self.window_secs > 0.0) {
            return Err(invalid(format!(
                "local.window_secs must be positive, got {}",
                self.window_secs
            )));
        }
        let window = Duration::try_from_secs_f64(self.window_secs).map_err(|err| {
            invalid(format!("local.window_secs = {}: {}", self.window_secs, err))
        })?;
        Ok(DiscoveryOptions {
            window,
            max_reply_bytes: self.max_reply_bytes,
            target: parse_host(&self.broadcast)?,
            ..Default::default()
        })
    }

    pub fn host_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.hosts.iter().map(|host| parse_host(host)).collect()
    }

    pub fn tcp_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_timeout_secs)
    }
}

fn parse_host(host: &str) -> Result<SocketAddr> {
    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Ok(addr);
    }
    host.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DEVICE_PORT))
        .map_err(|_| invalid(format!("'{}' is not an address", host)))
}

fn invalid(message: String) -> crate::error::Error {
    crate::error::Error::Config(ConfigError::Message(message))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CloudSettings {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Stable client id presented at login; generated when unset.
    pub terminal_uuid: Option<String>,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub timeout_secs: u64,
}

impl Default for CloudSettings {
    fn default() -> Self {
        CloudSettings {
            url: String::from(DEFAULT_CLOUD_URL),
            username: None,
            password: None,
            terminal_uuid: None,
            max_retries: 3,
            retry_delay_ms: 0,
            timeout_secs: 10,
        }
    }
}

impl CloudSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries).with_delay(Duration::from_millis(self.retry_delay_ms))
    }

    pub fn credentials(&self) -> Result<Credentials> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) if !username.is_empty() => Ok(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => Err(invalid(String::from(
                "cloud.username and cloud.password are required for the cloud transport",
            ))),
        }
    }
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InfluxSettings {
    pub url: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: u64,
}

impl Default for InfluxSettings {
    fn default() -> Self {
        InfluxSettings {
            url: String::from("http://localhost:8086"),
            database: String::from("kasa"),
            username: None,
            password: None,
            timeout_secs: 10,
        }
    }
}
