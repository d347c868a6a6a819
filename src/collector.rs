//! One collection run: find devices, read them, extract points, write them.
use log::{error, info, warn};

use crate::{
    error::Result,
    metrics::{self, DeviceClock, MetricPoint},
    query::DeviceQuery,
    sink::MetricSink,
    source::{DeviceSource, Discovered, Reading},
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub devices: usize,
    pub failed: usize,
    pub points: usize,
    pub written: usize,
}

pub struct Collector {
    dry_run: bool,
    clock: DeviceClock,
}

impl Collector {
    pub fn new(dry_run: bool, clock: DeviceClock) -> Self {
        Collector { dry_run, clock }
    }

    /// Collect every device of `source` into `sink`.
    ///
    /// Only failing to find devices ends the run early; a device that cannot
    /// be read is logged and skipped.
    pub fn run<S: DeviceSource>(
        &self,
        source: &mut S,
        sink: &mut dyn MetricSink,
    ) -> Result<RunSummary> {
        let devices = source.devices()?;
        let per_device = source.flush_per_device();
        let mut summary = RunSummary {
            devices: devices.len(),
            ..Default::default()
        };
        let mut batch: Vec<MetricPoint> = Vec::new();

        for device in devices {
            let alias = device.identity.alias.clone();
            let points = match self.collect_device(source, device) {
                Ok(points) => points,
                Err(err) => {
                    warn!("skipping device '{}': {}", alias, err);
                    summary.failed += 1;
                    continue;
                }
            };
            summary.points += points.len();
            batch.extend(points);

            if per_device {
                summary.written += self.flush(sink, &batch);
                batch.clear();
            }
        }

        if !batch.is_empty() {
            summary.written += self.flush(sink, &batch);
        }

        info!(
            "run complete: {} devices, {} failed, {} points, {} written",
            summary.devices, summary.failed, summary.points, summary.written
        );
        Ok(summary)
    }

    fn collect_device<S: DeviceSource>(
        &self,
        source: &mut S,
        device: Discovered<S::Handle>,
    ) -> Result<Vec<MetricPoint>> {
        let reading = match device.reading {
            Some(reading) => reading,
            None => read(source, &device.handle)?,
        };
        let timestamp =
            metrics::resolve_timestamp(&reading.response, reading.observed_at, self.clock);
        metrics::extract(&reading.response, &device.identity, timestamp)
    }

    fn flush(&self, sink: &mut dyn MetricSink, points: &[MetricPoint]) -> usize {
        if points.is_empty() {
            return 0;
        }
        if self.dry_run {
            info!("dry run, not writing {} points", points.len());
            return 0;
        }
        match sink.write_points(points) {
            Ok(()) => points.len(),
            Err(err) => {
                error!("failed to write {} points: {}", points.len(), err);
                0
            }
        }
    }
}

/// Ask a device for its sysinfo and, for metered single-relay devices, its
/// meter reading.
fn read<S: DeviceSource>(source: &mut S, handle: &S::Handle) -> Result<Reading> {
    let observed_at = metrics::now();
    let mut response = source.query(handle, &DeviceQuery::sysinfo())?;

    let metered = response
        .sysinfo()
        .map(|sysinfo| sysinfo.has_emeter() && !sysinfo.is_multi_outlet())
        .unwrap_or(false);
    if metered {
        match source.query(handle, &DeviceQuery::emeter_realtime()) {
            Ok(emeter) => response.merge(emeter),
            Err(err) => warn!("no meter reading: {}", err),
        }
    }

    Ok(Reading {
        response,
        observed_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{
        tests::{cloud_error, device_list, login_ok, passthrough, settings, ScriptedTransport},
        CloudClient, CloudSource,
    };
    use crate::datatypes::{tests::HS110_JSON, DeviceResponse};
    use crate::error::{Error, ErrorKind};
    use crate::metrics::{DeviceIdentity, PointValue, Series};
    use crate::sink::MemorySink;

    /// A source whose devices are all found with their readings attached.
    struct StaticSource {
        devices: Vec<(&'static str, &'static str)>,
        fail: bool,
    }

    impl DeviceSource for StaticSource {
        type Handle = usize;

        fn devices(&mut self) -> Result<Vec<Discovered<usize>>> {
            if self.fail {
                return Err(Error::Authentication(String::from("denied")));
            }
            Ok(self
                .devices
                .iter()
                .enumerate()
                .map(|(i, (alias, json))| Discovered {
                    identity: DeviceIdentity::new(alias),
                    handle: i,
                    reading: Some(Reading {
                        response: DeviceResponse::parse(json).unwrap_or_default(),
                        observed_at: 500,
                    }),
                })
                .collect())
        }

        fn query(&mut self, _: &usize, _: &DeviceQuery) -> Result<DeviceResponse> {
            Err(Error::Other(String::from("not queried")))
        }
    }

    fn cloud_source(replies: Vec<Result<serde_json::Value>>) -> CloudSource<ScriptedTransport> {
        let settings = settings();
        CloudSource::new(
            CloudClient::new(ScriptedTransport::new(replies), &settings),
            settings.credentials().unwrap(),
        )
    }

    #[test]
    fn local_run_writes_one_batch() {
        let mut source = StaticSource {
            devices: vec![
                ("Switch One", HS110_JSON),
                ("Lamp", r#"{"system":{"get_sysinfo":{"alias":"Lamp","relay_state":0}}}"#),
            ],
            fail: false,
        };
        let mut sink = MemorySink::new();

        let summary = Collector::new(false, DeviceClock::Utc)
            .run(&mut source, &mut sink)
            .unwrap();

        assert_eq!(sink.batches.len(), 1);
        assert_eq!(summary.points, 3);
        assert_eq!(summary.written, 3);
        let points = sink.points();
        assert_eq!(points[0].timestamp(), 1_682_935_200);
        assert_eq!(points[2].alias(), "Lamp");
        assert_eq!(points[2].timestamp(), 500);
    }

    #[test]
    fn malformed_device_does_not_stop_the_run() {
        let mut source = StaticSource {
            devices: vec![("Broken", "{}"), ("Switch One", HS110_JSON)],
            fail: false,
        };
        let mut sink = MemorySink::new();

        let summary = Collector::new(false, DeviceClock::Utc)
            .run(&mut source, &mut sink)
            .unwrap();

        assert_eq!(summary.devices, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(sink.points().len(), 2);
    }

    #[test]
    fn dry_run_writes_nothing() {
        let mut source = StaticSource {
            devices: vec![("Switch One", HS110_JSON)],
            fail: false,
        };
        let mut sink = MemorySink::new();

        let summary = Collector::new(true, DeviceClock::Utc)
            .run(&mut source, &mut sink)
            .unwrap();

        assert!(sink.batches.is_empty());
        assert_eq!(summary.points, 2);
        assert_eq!(summary.written, 0);
    }

    #[test]
    fn sink_failure_is_not_fatal() {
        let mut source = StaticSource {
            devices: vec![("Switch One", HS110_JSON)],
            fail: false,
        };
        let mut sink = MemorySink::new();
        sink.fail = true;

        let summary = Collector::new(false, DeviceClock::Utc)
            .run(&mut source, &mut sink)
            .unwrap();

        assert_eq!(summary.points, 2);
        assert_eq!(summary.written, 0);
    }

    #[test]
    fn run_level_failure_aborts() {
        let mut source = StaticSource {
            devices: vec![],
            fail: true,
        };
        let mut sink = MemorySink::new();

        let err = Collector::new(false, DeviceClock::Utc)
            .run(&mut source, &mut sink)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[test]
    fn cloud_run_skips_offline_devices_and_flushes_per_device() {
        let mut source = cloud_source(vec![
            login_ok(),
            device_list(&["Heater", "Switch One", "Lamp"]),
            // Heater
            cloud_error(-20571, "Device is offline"),
            // Switch One: sysinfo then meter
            passthrough(
                r#"{"system":{"get_sysinfo":{"alias":"Switch One","relay_state":1,"feature":"TIM:ENE"}}}"#,
            ),
            passthrough(r#"{"emeter":{"get_realtime":{"power_mw":12500,"err_code":0}}}"#),
            // Lamp: no meter
            passthrough(r#"{"system":{"get_sysinfo":{"alias":"Lamp","relay_state":0,"feature":"TIM"}}}"#),
        ]);
        let mut sink = MemorySink::new();

        let before = metrics::now();
        let summary = Collector::new(false, DeviceClock::Utc)
            .run(&mut source, &mut sink)
            .unwrap();

        assert_eq!(summary.devices, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(sink.batches.len(), 2);
        let points = sink.points();
        assert_eq!(points.len(), 3);
        assert_eq!(points[1].series(), Series::Power);
        assert_eq!(points[1].value(), PointValue::Float(12.5));
        assert!(points.iter().all(|p| p.timestamp() >= before));
    }

    #[test]
    fn cloud_run_aborts_on_rejected_login() {
        let mut source = cloud_source(vec![cloud_error(-20601, "Incorrect email or password")]);
        let mut sink = MemorySink::new();

        let err = Collector::new(false, DeviceClock::Utc)
            .run(&mut source, &mut sink)
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert!(sink.batches.is_empty());
    }
}
