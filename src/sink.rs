//! Destinations for collected metric points
use std::time::Duration;

use log::{debug, info};
use reqwest::blocking::Client;

use crate::{
    config::InfluxSettings,
    error::{Error, Result},
    metrics::{MetricPoint, PointValue},
};

pub trait MetricSink {
    /// Write a batch of points in one request.
    fn write_points(&mut self, points: &[MetricPoint]) -> Result<()>;
}

/// Writes points to an InfluxDB 1.x `/write` endpoint.
pub struct InfluxSink {
    client: Client,
    settings: InfluxSettings,
}

impl InfluxSink {
    pub fn new(settings: InfluxSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(InfluxSink { client, settings })
    }
}

impl MetricSink for InfluxSink {
    fn write_points(&mut self, points: &[MetricPoint]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let body = points
            .iter()
            .map(line_protocol)
            .collect::<Vec<_>>()
            .join("\n");
        debug!("{}", body);

        let url = format!("{}/write", self.settings.url.trim_end_matches('/'));
        let mut request = self
            .client
            .post(&url)
            .query(&[("db", self.settings.database.as_str()), ("precision", "s")])
            .body(body);
        if let Some(username) = &self.settings.username {
            request = request.basic_auth(username, self.settings.password.as_ref());
        }

        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Sink(format!(
                "{} answered {}: {}",
                url,
                status,
                response.text().unwrap_or_default()
            )));
        }
        info!("wrote {} points to {}", points.len(), self.settings.database);
        Ok(())
    }
}

/// Format a point as one InfluxDB line, e.g. `status,alias=Lamp value=1i 1682935200`.
pub fn line_protocol(point: &MetricPoint) -> String {
    let value = match point.value() {
        PointValue::Int(value) => format!("{}i", value),
        PointValue::Float(value) => format!("{:?}", value),
    };
    format!(
        "{},alias={} value={} {}",
        point.series(),
        escape_tag(point.alias()),
        value,
        point.timestamp()
    )
}

fn escape_tag(tag: &str) -> String {
    let mut escaped = String::with_capacity(tag.len());
    for c in tag.chars() {
        // a raw newline would end the line
        let c = if c.is_control() { ' ' } else { c };
        if c == ',' || c == '=' || c == ' ' || c == '\\' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
pub struct MemorySink {
    pub batches: Vec<Vec<MetricPoint>>,
    pub fail: bool,
}

#[cfg(test)]
impl MemorySink {
    pub fn new() -> Self {
        MemorySink {
            batches: Vec::new(),
            fail: false,
        }
    }

    pub fn points(&self) -> Vec<MetricPoint> {
        self.batches.iter().flatten().cloned().collect()
    }
}

#[cfg(test)]
impl MetricSink for MemorySink {
    fn write_points(&mut self, points: &[MetricPoint]) -> Result<()> {
        if self.fail {
            return Err(Error::Sink(String::from("store unavailable")));
        }
        self.batches.push(points.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_points_are_integers() {
        let point = MetricPoint::status("Lamp", 1, 1_682_935_200).unwrap();
        assert_eq!(line_protocol(&point), "status,alias=Lamp value=1i 1682935200");
    }

    #[test]
    fn power_points_are_floats() {
        let point = MetricPoint::power("Plug", 12.5, 10).unwrap();
        assert_eq!(line_protocol(&point), "power,alias=Plug value=12.5 10");

        let whole = MetricPoint::power("Plug", 3.0, 10).unwrap();
        assert_eq!(line_protocol(&whole), "power,alias=Plug value=3.0 10");
    }

    #[test]
    fn tag_values_are_escaped() {
        let point = MetricPoint::status("Desk lamp, left=1", 0, 10).unwrap();
        assert_eq!(
            line_protocol(&point),
            r"status,alias=Desk\ lamp\,\ left\=1 value=0i 10"
        );
    }

    #[test]
    fn control_characters_do_not_split_lines() {
        let point = MetricPoint::status("Hall\nlight\t2", 1, 10).unwrap();
        let line = line_protocol(&point);

        assert_eq!(line.lines().count(), 1);
        assert_eq!(line, r"status,alias=Hall\ light\ 2 value=1i 10");
    }

    #[test]
    fn unreachable_store_is_an_error() {
        let mut sink = InfluxSink::new(InfluxSettings {
            url: String::from("http://127.0.0.1:9"),
            timeout_secs: 1,
            ..Default::default()
        })
        .unwrap();
        let point = MetricPoint::status("Lamp", 1, 10).unwrap();
        assert!(sink.write_points(&[point]).is_err());
        assert!(sink.write_points(&[]).is_ok());
    }
}
