use chrono::{LocalResult, NaiveDate, TimeZone};

use crate::{
    error::{Error, Result, SectionError},
    metrics::DeviceIdentity,
};

type ErrCode = i16;

/// Decoded reply to a [`DeviceQuery`](crate::query::DeviceQuery).
///
/// Groups the query did not ask for are absent; groups the device does not
/// support come back as a [`SectionError`].
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DeviceResponse {
    pub system: Option<SectionResult<System>>,
    pub time: Option<SectionResult<Time>>,
    pub emeter: Option<SectionResult<Emeter>>,
}

impl DeviceResponse {
    pub fn parse(data: &str) -> Result<DeviceResponse> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn sysinfo(&self) -> Result<&SysInfo> {
        match &self.system {
            Some(SectionResult::Ok(system)) => system.sysinfo.result(),
            Some(SectionResult::Err(err)) => Err(Error::from(err.clone())),
            None => Err(Error::Malformed(String::from("no system section"))),
        }
    }

    /// The device clock, when the reply carries a readable one.
    pub fn device_time(&self) -> Option<&DeviceTime> {
        match &self.time {
            Some(SectionResult::Ok(time)) => time.time.ok(),
            _ => None,
        }
    }

    /// The realtime meter reading, when the reply carries one.
    pub fn emeter_realtime(&self) -> Option<&EmeterRealtime> {
        match &self.emeter {
            Some(SectionResult::Ok(emeter)) => emeter.realtime.ok(),
            _ => None,
        }
    }

    /// Fill groups missing here from a later reply by the same device.
    pub fn merge(&mut self, other: DeviceResponse) {
        if self.system.is_none() {
            self.system = other.system;
        }
        if self.time.is_none() {
            self.time = other.time;
        }
        if self.emeter.is_none() {
            self.emeter = other.emeter;
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum SectionResult<T> {
    Ok(T),
    Err(SectionError),
}

impl<T> SectionResult<T> {
    pub fn ok(&self) -> Option<&T> {
        match self {
            Self::Ok(section) => Some(section),
            Self::Err(_) => None,
        }
    }

    pub fn result(&self) -> Result<&T> {
        match self {
            Self::Ok(section) => Ok(section),
            Self::Err(err) => Err(Error::from(err.clone())),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct System {
    #[serde(rename = "get_sysinfo")]
    pub sysinfo: SectionResult<SysInfo>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SysInfo {
    pub alias: String,
    pub model: Option<String>,
    #[serde(alias = "type")]
    #[serde(alias = "mic_type")]
    pub hw_type: Option<String>,
    #[serde(rename = "deviceId")]
    pub device_id: Option<String>,
    pub relay_state: Option<u8>,
    pub feature: Option<String>,
    pub children: Option<Vec<ChildInfo>>,
}

impl SysInfo {
    /// Whether the feature flags (e.g. `TIM:ENE`) advertise an energy meter.
    pub fn has_emeter(&self) -> bool {
        self.feature
            .as_deref()
            .map(|f| f.split(':').any(|flag| flag == "ENE"))
            .unwrap_or(false)
    }

    pub fn is_multi_outlet(&self) -> bool {
        self.children.is_some()
    }
}

/// One outlet of a multi-outlet device such as a KP303 or HS300.
#[derive(Debug, Deserialize, Clone)]
pub struct ChildInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub alias: String,
    pub state: u8,
}

impl ChildInfo {
    /// Identity that scopes commands to this outlet.
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::child(&self.alias, &self.id)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Time {
    #[serde(rename = "get_time")]
    pub time: SectionResult<DeviceTime>,
}

/// Wall clock as reported by the device, in the device's own zone.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DeviceTime {
    pub year: i32,
    pub month: u32,
    pub mday: u32,
    pub hour: u32,
    pub min: u32,
    pub sec: u32,
}

impl DeviceTime {
    /// Seconds since the epoch, reading the wall clock in `zone`.
    pub fn to_epoch_seconds<Tz: TimeZone>(&self, zone: &Tz) -> Result<i64> {
        let naive = NaiveDate::from_ymd_opt(self.year, self.month, self.mday)
            .and_then(|date| date.and_hms_opt(self.hour, self.min, self.sec))
            .ok_or_else(|| Error::Malformed(format!("invalid device time {:?}", self)))?;

        match zone.from_local_datetime(&naive) {
            LocalResult::Single(at) => Ok(at.timestamp()),
            // Clocks going back: take the first occurrence.
            LocalResult::Ambiguous(earliest, _) => Ok(earliest.timestamp()),
            LocalResult::None => Err(Error::Malformed(format!(
                "device time {:?} does not exist in the local zone",
                self
            ))),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Emeter {
    #[serde(rename = "get_realtime")]
    pub realtime: SectionResult<EmeterRealtime>,
}

/// Realtime meter reading. Hardware version 1 reports watts, later versions
/// report milliwatts.
#[derive(Debug, Deserialize, Clone)]
pub struct EmeterRealtime {
    pub power: Option<f64>,
    pub power_mw: Option<f64>,
    pub err_code: Option<ErrCode>,
}

impl EmeterRealtime {
    pub fn is_ok(&self) -> bool {
        self.err_code == Some(0)
    }

    /// Power draw in watts.
    pub fn watts(&self) -> Option<f64> {
        self.power.or_else(|| self.power_mw.map(|mw| mw / 1000.0))
    }
}
