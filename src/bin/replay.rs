use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use aiding_control::types::{
    AirspeedSample, BaroSample, ExtVisionSample, FlowSample, GpsSample, MagSample, RangeSample,
    TimeUs, Timestamped,
};
use aiding_control::{
    AidingControl, AidingParams, CycleClock, EstimatorCore, ReferenceCore, SampleInbox,
    SensorBuffers,
};
use clap::Parser;
use env_logger::Env;
use flate2::read::GzDecoder;
use serde::Deserialize;
use serde_json::json;

#[derive(Parser, Debug)]
struct Args {
    /// Path to a sensor log (.json or .json.gz)
    #[arg(long, conflicts_with = "log_dir")]
    log: Option<PathBuf>,

    /// Directory of sensor logs to batch replay
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Aiding parameters as JSON (defaults when omitted)
    #[arg(long)]
    params: Option<PathBuf>,

    /// Fusion horizon delay behind the newest IMU time (ms)
    #[arg(long, default_value = "100")]
    delay_ms: u64,

    /// Samples kept per sensor history
    #[arg(long, default_value = "12")]
    buffer_len: usize,

    /// Only print the final summary, not every arbitration event
    #[arg(long, default_value_t = false)]
    quiet: bool,
}

/// One estimator cycle of a recorded log.
#[derive(Deserialize)]
struct Reading {
    time_us: TimeUs,
    #[serde(default)]
    in_air: bool,
    gps: Option<GpsSample>,
    baro: Option<BaroSample>,
    range: Option<RangeSample>,
    ext_vision: Option<ExtVisionSample>,
    flow: Option<FlowSample>,
    mag: Option<MagSample>,
    airspeed: Option<AirspeedSample>,
}

#[derive(Deserialize)]
struct LogFile {
    readings: Vec<Reading>,
}

fn load_log(path: &Path) -> anyhow::Result<LogFile> {
    let file = File::open(path)?;
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        let gz = GzDecoder::new(file);
        let reader = BufReader::new(gz);
        Ok(serde_json::from_reader(reader)?)
    } else {
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }
}

/// Driver-side queues, drained into the sensor histories once per cycle.
struct Inboxes {
    gps: SampleInbox<GpsSample>,
    baro: SampleInbox<BaroSample>,
    range: SampleInbox<RangeSample>,
    ext_vision: SampleInbox<ExtVisionSample>,
    flow: SampleInbox<FlowSample>,
    mag: SampleInbox<MagSample>,
    airspeed: SampleInbox<AirspeedSample>,
}

impl Inboxes {
    fn new(capacity: usize) -> anyhow::Result<Self> {
        Ok(Self {
            gps: SampleInbox::new(capacity)?,
            baro: SampleInbox::new(capacity)?,
            range: SampleInbox::new(capacity)?,
            ext_vision: SampleInbox::new(capacity)?,
            flow: SampleInbox::new(capacity)?,
            mag: SampleInbox::new(capacity)?,
            airspeed: SampleInbox::new(capacity)?,
        })
    }

    fn queue(&self, r: &Reading) {
        fn put<T: Timestamped + Clone>(inbox: &SampleInbox<T>, sample: &Option<T>) {
            if let Some(s) = sample {
                if inbox.push(s.clone()).is_some() {
                    log::warn!("inbox full, dropped sample");
                }
            }
        }
        put(&self.gps, &r.gps);
        put(&self.baro, &r.baro);
        put(&self.range, &r.range);
        put(&self.ext_vision, &r.ext_vision);
        put(&self.flow, &r.flow);
        put(&self.mag, &r.mag);
        put(&self.airspeed, &r.airspeed);
    }

    fn drain_into(&self, buffers: &mut SensorBuffers) -> usize {
        self.gps.drain_into(&mut buffers.gps)
            + self.baro.drain_into(&mut buffers.baro)
            + self.range.drain_into(&mut buffers.range)
            + self.ext_vision.drain_into(&mut buffers.ext_vision)
            + self.flow.drain_into(&mut buffers.flow)
            + self.mag.drain_into(&mut buffers.mag)
            + self.airspeed.drain_into(&mut buffers.airspeed)
    }
}

fn run_once(path: &Path, params: &AidingParams, args: &Args) -> anyhow::Result<serde_json::Value> {
    let log = load_log(path)?;
    let mut ctl = AidingControl::new(params.clone())?;
    let mut core = ReferenceCore::new(params);
    let mut buffers = SensorBuffers::new(args.buffer_len)?;
    let inboxes = Inboxes::new(args.buffer_len)?;
    let delay_us = args.delay_ms * 1_000;

    let mut event_counts: BTreeMap<&'static str, u64> = BTreeMap::new();
    let mut samples = 0usize;
    let mut last_time_us: Option<TimeUs> = None;

    for r in &log.readings {
        inboxes.queue(r);
        samples += inboxes.drain_into(&mut buffers);

        if r.gps.is_some() {
            core.set_origin_initialised(true);
        }

        let dt = last_time_us
            .map(|t| r.time_us.saturating_sub(t) as f64 * 1e-6)
            .unwrap_or(0.0);
        last_time_us = Some(r.time_us);
        core.predict(r.time_us, dt, !r.in_air);

        let clock = CycleClock {
            now_us: r.time_us,
            horizon_us: r.time_us.saturating_sub(delay_us),
        };
        ctl.set_in_air(r.in_air);
        let events = ctl.update(clock, &buffers, &mut core);

        let status = *ctl.status();
        core.fuse_active_sources(&status, &buffers, ctl.health_mut(), clock.horizon_us, clock.now_us);

        for event in &events {
            *event_counts.entry(event.name()).or_default() += 1;
            if !args.quiet {
                println!("{}", json!({ "time_us": r.time_us, "event": event }));
            }
        }
    }

    let end_us = last_time_us.unwrap_or(0);
    log::info!("{}", ctl.health().format_status(end_us));

    let status = ctl.status();
    let faulty: Vec<&str> = ctl
        .health()
        .faulty_sources()
        .iter()
        .map(|s| s.name())
        .collect();
    let pos = core.state().pos;

    Ok(json!({
        "log": path.display().to_string(),
        "cycles": log.readings.len(),
        "samples": samples,
        "status_bits": status.bits(),
        "status": status,
        "faulty_sources": faulty,
        "reset_counters": core.reset_status().counters(),
        "mag_declination_deg": core.mag_declination().to_degrees(),
        "events": event_counts,
        "final_position_ned": [pos.x, pos.y, pos.z],
        "last_known_pos_ne": [ctl.last_known_pos_ne().x, ctl.last_known_pos_ne().y],
    }))
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let params = match args.params.as_ref() {
        Some(path) => AidingParams::from_json_file(path)?,
        None => AidingParams::default(),
    };

    let mut results = Vec::new();
    if let Some(dir) = args.log_dir.as_ref() {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !(name.ends_with(".json") || name.ends_with(".json.gz")) {
                continue;
            }
            match run_once(&path, &params, &args) {
                Ok(res) => results.push(res),
                Err(e) => log::error!("Failed {}: {}", path.display(), e),
            }
        }
    } else if let Some(log) = args.log.as_ref() {
        results.push(run_once(log, &params, &args)?);
    } else {
        anyhow::bail!("Provide --log or --log-dir");
    }

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}
