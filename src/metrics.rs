//! Metric points and their extraction from device replies
use std::fmt;

use chrono::{Local, Utc};
use log::{info, warn};

use crate::{
    datatypes::DeviceResponse,
    error::{Error, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Series {
    Status,
    Power,
}

impl Series {
    pub fn as_str(&self) -> &'static str {
        match self {
            Series::Status => "status",
            Series::Power => "power",
        }
    }
}

impl fmt::Display for Series {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointValue {
    Int(i64),
    Float(f64),
}

/// Display name of a device and, for an outlet of a multi-outlet device,
/// the id used to scope commands to it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceIdentity {
    pub alias: String,
    pub id: Option<String>,
}

impl DeviceIdentity {
    pub fn new(alias: &str) -> Self {
        DeviceIdentity {
            alias: alias.to_string(),
            id: None,
        }
    }

    pub fn child(alias: &str, id: &str) -> Self {
        DeviceIdentity {
            alias: alias.to_string(),
            id: Some(id.to_string()),
        }
    }
}

/// One timestamped value of a series, tagged with the device alias.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    series: Series,
    value: PointValue,
    alias: String,
    timestamp: i64,
}

impl MetricPoint {
    fn new(series: Series, value: PointValue, alias: &str, timestamp: i64) -> Result<Self> {
        if alias.is_empty() {
            return Err(Error::Malformed(format!(
                "{} point without a device alias",
                series
            )));
        }
        Ok(MetricPoint {
            series,
            value,
            alias: alias.to_string(),
            timestamp,
        })
    }

    pub fn status(alias: &str, state: u8, timestamp: i64) -> Result<Self> {
        Self::new(
            Series::Status,
            PointValue::Int(i64::from(state)),
            alias,
            timestamp,
        )
    }

    pub fn power(alias: &str, watts: f64, timestamp: i64) -> Result<Self> {
        Self::new(Series::Power, PointValue::Float(watts), alias, timestamp)
    }

    pub fn series(&self) -> Series {
        self.series
    }

    pub fn value(&self) -> PointValue {
        self.value
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

/// Zone in which device-reported wall clocks are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClock {
    Local,
    Utc,
}

impl Default for DeviceClock {
    fn default() -> Self {
        DeviceClock::Local
    }
}

/// Device-reported time when the reply has one, `observed_at` otherwise.
pub fn resolve_timestamp(response: &DeviceResponse, observed_at: i64, clock: DeviceClock) -> i64 {
    let device_time = match response.device_time() {
        Some(time) => time,
        None => return observed_at,
    };
    let converted = match clock {
        DeviceClock::Local => device_time.to_epoch_seconds(&Local),
        DeviceClock::Utc => device_time.to_epoch_seconds(&Utc),
    };
    converted.unwrap_or_else(|err| {
        warn!("falling back to collector clock: {}", err);
        observed_at
    })
}

pub fn now() -> i64 {
    Utc::now().timestamp()
}

/// Turn one device reply into status and power points.
///
/// Multi-outlet devices get one status point per outlet and no power point,
/// even when the parent reports a meter reading.
pub fn extract(
    response: &DeviceResponse,
    identity: &DeviceIdentity,
    timestamp: i64,
) -> Result<Vec<MetricPoint>> {
    let sysinfo = response.sysinfo()?;
    let mut points = Vec::new();

    if let Some(children) = &sysinfo.children {
        for child in children {
            let outlet = child.identity();
            info!("device '{}' state = {}", outlet.alias, child.state);
            points.push(MetricPoint::status(&outlet.alias, child.state, timestamp)?);
        }
        return Ok(points);
    }

    let alias = if sysinfo.alias.is_empty() {
        identity.alias.as_str()
    } else {
        sysinfo.alias.as_str()
    };
    let state = sysinfo
        .relay_state
        .ok_or_else(|| Error::Malformed(format!("device '{}' reports no relay state", alias)))?;
    info!("device '{}' state = {}", alias, state);
    points.push(MetricPoint::status(alias, state, timestamp)?);

    if let Some(realtime) = response.emeter_realtime() {
        if realtime.is_ok() {
            match realtime.watts() {
                Some(power) => {
                    info!("device '{}' power = {}", alias, power);
                    points.push(MetricPoint::power(alias, power, timestamp)?);
                }
                None => warn!("device '{}' meter reading has no power value", alias),
            }
        }
    }

    Ok(points)
}
