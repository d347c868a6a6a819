extern crate kasa_recorder;

use std::{path::Path, process};

use clap::{App, Arg};
use log::{debug, error};

use kasa_recorder::{
    cloud::CloudSource,
    collector::{Collector, RunSummary},
    config::{Settings, Transport},
    error::Result,
    logger::setup_logger,
    sink::InfluxSink,
    source::LocalSource,
};

fn run(settings: &Settings, dry_run: bool) -> Result<RunSummary> {
    let mut sink = InfluxSink::new(settings.influx.clone())?;
    let collector = Collector::new(dry_run, settings.local.device_clock);

    match settings.transport {
        Transport::Local => {
            let local = &settings.local;
            let mut source = LocalSource::new(local.discovery_options()?)
                .with_hosts(local.host_addrs()?)
                .with_protocol(Box::new(kasa_recorder::protocol::TcpProtocol::with_timeout(
                    local.tcp_timeout(),
                )));
            collector.run(&mut source, &mut sink)
        }
        Transport::Cloud => {
            let mut source = CloudSource::from_settings(&settings.cloud)?;
            collector.run(&mut source, &mut sink)
        }
    }
}

fn main() {
    let matches = App::new("kasa-recorder")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Record state and power draw of TPLink Kasa smart plugs into InfluxDB.")
        .arg(Arg::with_name("dry-run")
            .long("dry-run")
            .takes_value(false)
            .help("Collect and log points without writing them.")
        )
        .arg(Arg::with_name("verbose")
            .short("v")
            .long("verbose")
            .takes_value(false)
            .help("Log at debug level.")
        )
        .arg(Arg::with_name("config")
            .short("c")
            .long("config")
            .value_name("FILE")
            .takes_value(true)
            .help("Read settings from FILE as well.")
        )
        .arg(Arg::with_name("cloud")
            .long("cloud")
            .takes_value(false)
            .help("Reach devices through the TPLink cloud instead of the local network.")
        )
        .get_matches();

    let mut settings = match Settings::load(matches.value_of("config").map(Path::new)) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("{}", err);
            process::exit(2);
        }
    };
    if matches.is_present("cloud") {
        settings.transport = Transport::Cloud;
    }

    let level = if matches.is_present("verbose") {
        "debug"
    } else {
        settings.log_level.as_str()
    };
    if let Err(err) = setup_logger(level) {
        eprintln!("could not set up logging: {}", err);
    }
    debug!("{:?}", settings.transport);

    if let Err(err) = run(&settings, matches.is_present("dry-run")) {
        error!("run aborted: {}", err);
        process::exit(1);
    }
}
