//! Fix simulator
//!
//! Drives a fleet of simulated devices around circular routes with periodic
//! stops and sends their fixes to a running geotrack instance, either as
//! JSON lines over TCP or as batches to `POST /fixes`.
//!
//! Usage:
//!   cargo run --bin fixsim -- --devices 20 --rounds 100
//!   cargo run --bin fixsim -- --mode http --target http://127.0.0.1:8080
//!   cargo run --bin fixsim -- --backfill --step-secs 30 --rounds 500

use anyhow::Context;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::{Parser, ValueEnum};
use geotrack::domain::{DeviceId, Fix};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Tcp,
    Http,
}

#[derive(Parser, Debug)]
#[command(name = "fixsim")]
#[command(about = "Send simulated GPS fixes to geotrack")]
struct Args {
    /// Transport to use
    #[arg(long, value_enum, default_value = "tcp")]
    mode: Mode,

    /// host:port for tcp, base URL for http
    #[arg(long)]
    target: Option<String>,

    /// Number of simulated devices
    #[arg(long, default_value = "10")]
    devices: i64,

    /// First device id
    #[arg(long, default_value = "1")]
    first_device: i64,

    /// Fixes per device
    #[arg(long, default_value = "60")]
    rounds: u32,

    /// Seconds of simulated time between fixes
    #[arg(long, default_value = "10")]
    step_secs: i64,

    /// Send everything at once with past timestamps ending now
    #[arg(long)]
    backfill: bool,

    /// Route center latitude
    #[arg(long, default_value = "19.4326")]
    lat: f64,

    /// Route center longitude
    #[arg(long, default_value = "-99.1332")]
    lon: f64,

    /// Route radius in meters
    #[arg(long, default_value = "1500")]
    radius_m: f64,

    /// Cruising speed in km/h
    #[arg(long, default_value = "40")]
    speed_kmh: f64,

    /// Every N fixes a device stops for `stop_len` fixes (0 = never)
    #[arg(long, default_value = "20")]
    stop_every: u32,

    #[arg(long, default_value = "5")]
    stop_len: u32,
}

/// One simulated device driving around a circle
struct SimDevice {
    id: DeviceId,
    /// Current angle around the center (radians)
    angle: f64,
    /// Route radius, varied per device (meters)
    radius_m: f64,
}

impl SimDevice {
    fn new(id: i64, index: i64, args: &Args) -> Self {
        Self {
            id: DeviceId(id),
            angle: index as f64 * 0.7,
            radius_m: args.radius_m * (1.0 + (index % 5) as f64 * 0.15),
        }
    }

    /// Advance one step and report the resulting fix
    fn step(&mut self, round: u32, args: &Args, ts: DateTime<Utc>) -> Fix {
        let stopped = args.stop_every > 0 && round % (args.stop_every + args.stop_len) >= args.stop_every;
        let speed = if stopped { 0.0 } else { args.speed_kmh };

        let distance_m = speed / 3.6 * args.step_secs as f64;
        self.angle += distance_m / self.radius_m;

        let (north, east) = (self.radius_m * self.angle.sin(), self.radius_m * self.angle.cos());
        let lat = args.lat + (north / EARTH_RADIUS_M).to_degrees();
        let lon = args.lon + (east / (EARTH_RADIUS_M * args.lat.to_radians().cos())).to_degrees();
        let heading = (self.angle.to_degrees() + 90.0).rem_euclid(360.0);

        Fix::new(self.id, lat, lon, ts)
            .with_speed(speed)
            .with_heading((heading * 10.0).round() / 10.0)
            .with_accuracy(8.0)
    }
}

enum Sink {
    Tcp(TcpStream),
    Http { client: reqwest::Client, url: String },
}

impl Sink {
    async fn connect(args: &Args) -> anyhow::Result<Self> {
        match args.mode {
            Mode::Tcp => {
                let target = args.target.clone().unwrap_or_else(|| "127.0.0.1:5055".to_string());
                let stream = TcpStream::connect(&target)
                    .await
                    .with_context(|| format!("connecting to {target}"))?;
                info!(target = %target, "fixsim_connected");
                Ok(Sink::Tcp(stream))
            }
            Mode::Http => {
                let base = args.target.clone().unwrap_or_else(|| "http://127.0.0.1:8080".to_string());
                let client = reqwest::Client::builder()
                    .timeout(Duration::from_secs(10))
                    .build()
                    .context("building http client")?;
                let url = format!("{}/fixes", base.trim_end_matches('/'));
                info!(url = %url, "fixsim_http_ready");
                Ok(Sink::Http { client, url })
            }
        }
    }

    async fn send(&mut self, fixes: &[Fix]) -> anyhow::Result<()> {
        match self {
            Sink::Tcp(stream) => {
                let mut buf = Vec::with_capacity(fixes.len() * 160);
                for fix in fixes {
                    serde_json::to_writer(&mut buf, fix)?;
                    buf.push(b'\n');
                }
                stream.write_all(&buf).await.context("writing fixes")?;
            }
            Sink::Http { client, url } => {
                let body = serde_json::to_vec(fixes)?;
                let resp = client
                    .post(url.as_str())
                    .header("Content-Type", "application/json")
                    .body(body)
                    .send()
                    .await
                    .context("posting fixes")?;
                if !resp.status().is_success() {
                    warn!(status = %resp.status(), "fixsim_http_rejected");
                }
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.step_secs > 0, "--step-secs must be positive");
    anyhow::ensure!(args.radius_m > 0.0, "--radius-m must be positive");

    let mut devices: Vec<SimDevice> = (0..args.devices)
        .map(|i| SimDevice::new(args.first_device + i, i, &args))
        .collect();
    let mut sink = Sink::connect(&args).await?;

    let step = ChronoDuration::seconds(args.step_secs);
    let backfill_start = Utc::now() - step * (args.rounds as i32);
    let mut sent = 0usize;

    info!(
        devices = %devices.len(),
        rounds = %args.rounds,
        backfill = %args.backfill,
        "fixsim_started"
    );

    for round in 0..args.rounds {
        let ts = if args.backfill { backfill_start + step * (round as i32 + 1) } else { Utc::now() };
        let batch: Vec<Fix> = devices.iter_mut().map(|d| d.step(round, &args, ts)).collect();
        sink.send(&batch).await?;
        sent += batch.len();

        if !args.backfill {
            tokio::time::sleep(Duration::from_secs(args.step_secs as u64)).await;
        }
    }

    if let Sink::Tcp(stream) = &mut sink {
        let _ = stream.shutdown().await;
    }
    info!(fixes_sent = %sent, "fixsim_finished");
    Ok(())
}
