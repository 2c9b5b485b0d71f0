//! Offline route report
//!
//! Reads a JSONL file of fixes (one fix per line, the same format the TCP
//! listener accepts) and prints per-device route statistics, movement
//! breakdown, unauthorized stops and a simplified trajectory as JSON.
//!
//! Usage:
//!   cargo run --bin route-report -- fixes.jsonl
//!   cargo run --bin route-report -- fixes.jsonl --device 7 --tolerance 0.0005
//!   cargo run --bin route-report -- fixes.jsonl --config config/dev.toml

use anyhow::Context;
use clap::Parser;
use geotrack::domain::{DeviceId, Fix, Zone};
use geotrack::infra::Config;
use geotrack::services::movement::{self, MovementTimes, UnauthorizedStop, DEFAULT_STOP_MINUTES};
use geotrack::services::route::{self, RouteStats};
use geotrack::services::simplifier::{self, SimplifiedRoute, DEFAULT_TOLERANCE};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "route-report")]
#[command(about = "Summarize recorded fixes per device")]
struct Args {
    /// JSONL file with one fix per line
    input: String,

    /// Only report this device
    #[arg(long)]
    device: Option<i64>,

    /// Simplification tolerance in degrees
    #[arg(long, default_value_t = DEFAULT_TOLERANCE)]
    tolerance: f64,

    /// Minimum stop length reported as unauthorized (minutes)
    #[arg(long, default_value_t = DEFAULT_STOP_MINUTES)]
    stop_minutes: i64,

    /// Config file to take allowed zones from
    #[arg(long)]
    config: Option<String>,

    /// Leave the simplified trajectory out of the report
    #[arg(long)]
    no_points: bool,
}

#[derive(Debug, Serialize)]
struct DeviceReport {
    stats: RouteStats,
    movement: MovementTimes,
    unauthorized_stops: Vec<UnauthorizedStop>,
    route: SimplifiedRoute,
}

/// Read fixes grouped by device. Unparseable lines are counted and skipped.
fn read_fixes(path: &str, only: Option<DeviceId>) -> anyhow::Result<BTreeMap<DeviceId, Vec<Fix>>> {
    let file = File::open(path).with_context(|| format!("opening {path}"))?;
    let mut by_device: BTreeMap<DeviceId, Vec<Fix>> = BTreeMap::new();
    let mut skipped = 0usize;

    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("reading {path}"))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match Fix::from_json(line) {
            Ok(fix) if only.map_or(true, |d| d == fix.device_id) => {
                by_device.entry(fix.device_id).or_default().push(fix);
            }
            Ok(_) => {}
            Err(e) => {
                skipped += 1;
                warn!(line = %(n + 1), error = %e, "route_report_bad_line");
            }
        }
    }

    for fixes in by_device.values_mut() {
        fixes.sort_by_key(|f| f.timestamp);
    }
    if skipped > 0 {
        info!(skipped = %skipped, "route_report_lines_skipped");
    }
    Ok(by_device)
}

fn device_report(device_id: DeviceId, fixes: &[Fix], zones: &[Zone], args: &Args) -> Option<DeviceReport> {
    let (first, last) = (fixes.first()?, fixes.last()?);
    let mut simplified = simplifier::simplify_route(fixes, args.tolerance);
    if args.no_points {
        simplified.points.clear();
    }

    Some(DeviceReport {
        stats: route::route_stats(device_id, first.timestamp, last.timestamp, fixes),
        movement: movement::movement_times(fixes),
        unauthorized_stops: movement::unauthorized_stops(fixes, zones, args.stop_minutes),
        route: simplified,
    })
}

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.tolerance >= 0.0, "--tolerance must not be negative");

    let zones = match &args.config {
        Some(path) => Config::from_file(path)?.zones().to_vec(),
        None => Vec::new(),
    };

    let by_device = read_fixes(&args.input, args.device.map(DeviceId))?;
    let report: BTreeMap<String, DeviceReport> = by_device
        .iter()
        .filter_map(|(id, fixes)| {
            device_report(*id, fixes, &zones, &args).map(|r| (id.to_string(), r))
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
