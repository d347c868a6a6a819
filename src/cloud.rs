//! Devices reached through the TPLink cloud relay
//!
//! Requests are `{"method": ..., "params": ...}` posts; every reply carries an
//! `error_code`, zero on success, and a `result`.
use std::time::Duration;

use log::{debug, info};
use reqwest::blocking::Client;
use serde_json::{json, Value};

use crate::{
    config::{CloudSettings, Credentials},
    datatypes::DeviceResponse,
    error::{Error, ErrorKind, Result},
    metrics::DeviceIdentity,
    query::DeviceQuery,
    retry::RetryPolicy,
    source::{DeviceSource, Discovered},
};

const APP_TYPE: &str = "Kasa_Android";

const DEVICE_OFFLINE: i64 = -20571;
const REQUEST_TIMEOUT: i64 = -20002;
const SERVICE_BUSY: i64 = -20003;

const RETRYABLE: &[ErrorKind] = &[ErrorKind::Connection, ErrorKind::TransientCloud];

pub trait CloudTransport {
    /// Post `body` to `url`, authenticated with `token` when given, and
    /// return the decoded reply.
    fn post(&self, url: &str, token: Option<&str>, body: &Value) -> Result<Value>;
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(HttpTransport {
            client: Client::builder().timeout(timeout).build()?,
        })
    }
}

impl CloudTransport for HttpTransport {
    fn post(&self, url: &str, token: Option<&str>, body: &Value) -> Result<Value> {
        let mut request = self.client.post(url).json(body);
        if let Some(token) = token {
            request = request.query(&[("token", token)]);
        }
        Ok(request.send()?.error_for_status()?.json::<Value>()?)
    }
}

/// Token obtained at login, valid for the rest of the run.
#[derive(Debug, Clone)]
pub struct CloudSession {
    token: String,
}

#[derive(Debug, Clone)]
pub struct CloudDevice {
    pub identity: DeviceIdentity,
    pub device_id: String,
    /// Relay server that owns this device's connection.
    pub server_url: String,
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceListEntry {
    alias: String,
    #[serde(rename = "deviceId")]
    device_id: String,
    #[serde(rename = "appServerUrl")]
    app_server_url: String,
    #[serde(rename = "deviceModel")]
    device_model: Option<String>,
}

pub struct CloudClient<T = HttpTransport> {
    transport: T,
    url: String,
    retry: RetryPolicy,
    terminal_uuid: String,
}

impl CloudClient<HttpTransport> {
    pub fn from_settings(settings: &CloudSettings) -> Result<Self> {
        let transport = HttpTransport::new(Duration::from_secs(settings.timeout_secs))?;
        Ok(CloudClient::new(transport, settings))
    }
}

impl<T: CloudTransport> CloudClient<T> {
    pub fn new(transport: T, settings: &CloudSettings) -> Self {
        CloudClient {
            transport,
            url: settings.url.clone(),
            retry: settings.retry_policy(),
            terminal_uuid: settings
                .terminal_uuid
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        }
    }

    fn call(&self, url: &str, token: Option<&str>, method: &str, params: Value) -> Result<Value> {
        let body = json!({ "method": method, "params": params });
        self.retry.run(method, RETRYABLE, || {
            check_reply(self.transport.post(url, token, &body)?)
        })
    }

    pub fn authenticate(&self, credentials: &Credentials) -> Result<CloudSession> {
        let params = json!({
            "appType": APP_TYPE,
            "cloudUserName": credentials.username,
            "cloudPassword": credentials.password,
            "terminalUUID": self.terminal_uuid,
        });
        let result = self.call(&self.url, None, "login", params).map_err(|err| match err {
            Error::Cloud { code, msg, .. } => {
                Error::Authentication(format!("({}) {}", code, msg))
            }
            other => other,
        })?;

        let token = result["token"]
            .as_str()
            .ok_or_else(|| Error::Authentication(String::from("login reply has no token")))?;
        info!("logged in to {} as {}", self.url, credentials.username);
        Ok(CloudSession {
            token: token.to_string(),
        })
    }

    pub fn list_devices(&self, session: &CloudSession) -> Result<Vec<CloudDevice>> {
        let result = self.call(&self.url, Some(&session.token), "getDeviceList", json!({}))?;
        let entries: Vec<DeviceListEntry> =
            serde_json::from_value(result["deviceList"].clone())?;

        Ok(entries
            .into_iter()
            .map(|entry| CloudDevice {
                identity: DeviceIdentity::new(&entry.alias),
                device_id: entry.device_id,
                server_url: entry.app_server_url,
                model: entry.device_model,
            })
            .collect())
    }

    pub fn query(
        &self,
        session: &CloudSession,
        device: &CloudDevice,
        query: &DeviceQuery,
    ) -> Result<DeviceResponse> {
        let params = json!({
            "deviceId": device.device_id,
            "requestData": query.to_json(),
        });
        let alias = &device.identity.alias;
        let result = self
            .call(&device.server_url, Some(&session.token), "passthrough", params)
            .map_err(|err| match err.kind() {
                ErrorKind::DeviceOffline => Error::DeviceOffline(alias.clone()),
                ErrorKind::Connection | ErrorKind::TransientCloud => Error::Unreachable {
                    device: alias.clone(),
                    source: Box::new(err),
                },
                _ => err,
            })?;

        match &result["responseData"] {
            Value::String(data) => {
                debug!("{}", data);
                DeviceResponse::parse(data)
            }
            Value::Null => Err(Error::Malformed(format!(
                "passthrough reply for '{}' has no responseData",
                alias
            ))),
            data => Ok(serde_json::from_value(data.clone())?),
        }
    }
}

/// Turn a cloud reply into its `result`, or the error it reports.
fn check_reply(reply: Value) -> Result<Value> {
    let code = reply["error_code"].as_i64().unwrap_or(0);
    if code == 0 {
        return Ok(reply["result"].clone());
    }
    let msg = reply["msg"].as_str().unwrap_or("").to_string();
    match code {
        DEVICE_OFFLINE => Err(Error::DeviceOffline(msg)),
        REQUEST_TIMEOUT | SERVICE_BUSY => Err(Error::Cloud {
            code,
            msg,
            transient: true,
        }),
        _ => Err(Error::Cloud {
            code,
            msg,
            transient: false,
        }),
    }
}

/// Cloud devices as a [`DeviceSource`]. Logs in on first use.
pub struct CloudSource<T = HttpTransport> {
    client: CloudClient<T>,
    credentials: Credentials,
    session: Option<CloudSession>,
}

impl CloudSource<HttpTransport> {
    pub fn from_settings(settings: &CloudSettings) -> Result<Self> {
        let credentials = settings.credentials()?;
        Ok(CloudSource::new(CloudClient::from_settings(settings)?, credentials))
    }
}

impl<T: CloudTransport> CloudSource<T> {
    pub fn new(client: CloudClient<T>, credentials: Credentials) -> Self {
        CloudSource {
            client,
            credentials,
            session: None,
        }
    }

    fn session(&mut self) -> Result<CloudSession> {
        if let Some(session) = &self.session {
            return Ok(session.clone());
        }
        let session = self.client.authenticate(&self.credentials)?;
        self.session = Some(session.clone());
        Ok(session)
    }
}

impl<T: CloudTransport> DeviceSource for CloudSource<T> {
    type Handle = CloudDevice;

    fn devices(&mut self) -> Result<Vec<Discovered<CloudDevice>>> {
        let session = self.session()?;
        let devices = self.client.list_devices(&session)?;
        info!("{} devices registered with the cloud", devices.len());

        Ok(devices
            .into_iter()
            .map(|device| Discovered {
                identity: device.identity.clone(),
                handle: device,
                reading: None,
            })
            .collect())
    }

    fn query(&mut self, handle: &CloudDevice, query: &DeviceQuery) -> Result<DeviceResponse> {
        let session = self.session()?;
        debug!("querying '{}' through the cloud", handle.identity.alias);
        self.client.query(&session, handle, query)
    }

    fn flush_per_device(&self) -> bool {
        true
    }
}
