//! HTTP API and Prometheus metrics endpoint
//!
//! Serves health, Prometheus text at /metrics, fix ingestion, zone
//! administration and the per-device queries. Uses hyper directly.
//!
//! Time parameters (`start`, `end`) accept RFC 3339 or epoch milliseconds.
//! Without them a window covers the last 24 hours.

use crate::domain::error::IngestError;
use crate::domain::types::{DeviceId, Fix};
use crate::domain::zone::Zone;
use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use crate::services::movement::DEFAULT_STOP_MINUTES;
use crate::services::route::DEFAULT_ROUTE_END_MINUTES;
use crate::services::smoothing::{DEFAULT_WINDOW, MAX_WINDOW};
use crate::services::tracker::{IngestOutcome, Tracker};
use anyhow::Context;
use bytes::Bytes;
use chrono::{DateTime, Duration, TimeZone, Utc};
use http_body_util::{BodyExt, Full, Limited};
use hyper::header::{HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt::{self, Write};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Window used when a query gives no `start`
const DEFAULT_WINDOW_HOURS: i64 = 24;

/// Shared state for request handlers
pub struct ApiState {
    pub tracker: Arc<Tracker>,
    pub metrics: Arc<Metrics>,
    pub site_id: String,
}

#[derive(Debug, Error)]
enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

type ApiResult = Result<Response<Full<Bytes>>, ApiError>;

// ---- Prometheus text ----

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {}", avg * count);
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(summary: &MetricsSummary, site: &str) -> String {
    let mut output = String::with_capacity(4096);

    write_metric(
        &mut output,
        "geotrack_fixes_total",
        "Fixes accepted into history",
        MetricType::Counter,
        site,
        summary.fixes_total,
    );
    let _ = writeln!(output, "# HELP geotrack_fixes_per_sec Fixes accepted per second");
    let _ = writeln!(output, "# TYPE geotrack_fixes_per_sec gauge");
    let _ = writeln!(output, "geotrack_fixes_per_sec{{site=\"{site}\"}} {:.2}", summary.fixes_per_sec);

    write_histogram(
        &mut output,
        "geotrack_ingest_latency_us",
        "Fix ingest latency in microseconds",
        site,
        &summary.lat_buckets,
        summary.avg_ingest_latency_us,
    );
    write_metric(
        &mut output,
        "geotrack_ingest_latency_p99_us",
        "99th percentile ingest latency",
        MetricType::Gauge,
        site,
        summary.lat_p99_us,
    );

    let _ = writeln!(output, "# HELP geotrack_fixes_rejected_total Fixes rejected by reason");
    let _ = writeln!(output, "# TYPE geotrack_fixes_rejected_total counter");
    for (reason, val) in [
        ("invalid", summary.rejected_invalid),
        ("out_of_order", summary.rejected_out_of_order),
        ("impossible_jump", summary.rejected_jump),
        ("parse_error", summary.parse_errors),
    ] {
        let _ = writeln!(
            output,
            "geotrack_fixes_rejected_total{{site=\"{site}\",reason=\"{reason}\"}} {val}"
        );
    }

    write_metric(
        &mut output,
        "geotrack_zone_entries_total",
        "Zone entry events",
        MetricType::Counter,
        site,
        summary.zone_entries_total,
    );
    write_metric(
        &mut output,
        "geotrack_zone_exits_total",
        "Zone exit events",
        MetricType::Counter,
        site,
        summary.zone_exits_total,
    );

    let _ = writeln!(output, "# HELP geotrack_alerts_total Alerts raised by kind");
    let _ = writeln!(output, "# TYPE geotrack_alerts_total counter");
    let _ = writeln!(
        output,
        "geotrack_alerts_total{{site=\"{site}\",kind=\"zone\"}} {}",
        summary.alerts_zone_total
    );
    let _ = writeln!(
        output,
        "geotrack_alerts_total{{site=\"{site}\",kind=\"speed\"}} {}",
        summary.alerts_speed_total
    );

    write_metric(
        &mut output,
        "geotrack_fixes_dropped_total",
        "Fixes dropped on full worker queues",
        MetricType::Counter,
        site,
        summary.fixes_dropped,
    );
    write_metric(
        &mut output,
        "geotrack_mqtt_events_dropped_total",
        "MQTT egress messages dropped on a full channel",
        MetricType::Counter,
        site,
        summary.mqtt_events_dropped,
    );
    write_metric(
        &mut output,
        "geotrack_fixes_pruned_total",
        "Fixes removed by retention",
        MetricType::Counter,
        site,
        summary.fixes_pruned,
    );
    write_metric(
        &mut output,
        "geotrack_fix_queue_depth",
        "Fixes waiting for an ingest worker",
        MetricType::Gauge,
        site,
        summary.fix_queue_depth,
    );
    write_metric(
        &mut output,
        "geotrack_devices",
        "Devices with state in memory",
        MetricType::Gauge,
        site,
        summary.devices as u64,
    );
    write_metric(
        &mut output,
        "geotrack_zones",
        "Zones in the current set",
        MetricType::Gauge,
        site,
        summary.zones as u64,
    );

    output
}

// ---- request helpers ----

fn response(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    let headers = resp.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    resp
}

fn json<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => response(status, "application/json", body),
        Err(e) => {
            error!(error = %e, "http_response_serialize_failed");
            response(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "serialization failed")
        }
    }
}

fn error_response(err: &ApiError) -> Response<Full<Bytes>> {
    json(err.status(), &serde_json::json!({ "error": err.to_string() }))
}

/// A `start`/`end` query value: RFC 3339 or epoch milliseconds
#[derive(Debug, Clone, Copy, PartialEq)]
struct TimeParam(DateTime<Utc>);

impl FromStr for TimeParam {
    type Err = ApiError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        parse_time(value).map(TimeParam)
    }
}

/// Missing and empty values both mean "not given"
fn empty_as_none<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match Option::<String>::deserialize(deserializer)?.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|e| de::Error::custom(format!("{value:?}: {e}"))),
    }
}

fn parse_query<T: DeserializeOwned>(raw: Option<&str>) -> Result<T, ApiError> {
    serde_urlencoded::from_str(raw.unwrap_or(""))
        .map_err(|e| ApiError::BadRequest(format!("invalid query: {e}")))
}

/// `[start, end]`, defaulting to the 24 hours before `end` (or `now`)
fn time_window(
    start: Option<TimeParam>,
    end: Option<TimeParam>,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), ApiError> {
    let end = end.map_or(now, |t| t.0);
    let start = match start {
        Some(t) => t.0,
        None => end
            .checked_sub_signed(Duration::hours(DEFAULT_WINDOW_HOURS))
            .ok_or_else(|| ApiError::BadRequest(format!("end out of range: {end}")))?,
    };
    if start > end {
        return Err(ApiError::BadRequest("start must not be after end".to_string()));
    }
    Ok((start, end))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WindowQuery {
    #[serde(deserialize_with = "empty_as_none")]
    start: Option<TimeParam>,
    #[serde(deserialize_with = "empty_as_none")]
    end: Option<TimeParam>,
}

impl WindowQuery {
    fn window(&self, now: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>), ApiError> {
        time_window(self.start, self.end, now)
    }
}

/// GET /devices/{id}/route
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RouteQuery {
    #[serde(deserialize_with = "empty_as_none")]
    start: Option<TimeParam>,
    #[serde(deserialize_with = "empty_as_none")]
    end: Option<TimeParam>,
    #[serde(deserialize_with = "empty_as_none")]
    limit: Option<usize>,
    /// Simplify with this tolerance (degrees) instead of returning raw points
    #[serde(deserialize_with = "empty_as_none")]
    tolerance: Option<f64>,
}

/// GET /zones/check
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ZoneCheckQuery {
    #[serde(deserialize_with = "empty_as_none")]
    device_id: Option<i64>,
    #[serde(deserialize_with = "empty_as_none")]
    lat: Option<f64>,
    #[serde(deserialize_with = "empty_as_none")]
    lon: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RouteEndQuery {
    #[serde(deserialize_with = "empty_as_none")]
    stopped_minutes: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StopsQuery {
    #[serde(deserialize_with = "empty_as_none")]
    min_minutes: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SmoothedQuery {
    #[serde(deserialize_with = "empty_as_none")]
    window: Option<usize>,
}

/// RFC 3339 or epoch milliseconds
fn parse_time(value: &str) -> Result<DateTime<Utc>, ApiError> {
    if let Ok(ms) = value.parse::<i64>() {
        return Utc
            .timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| ApiError::BadRequest(format!("timestamp out of range: {ms}")));
    }
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ApiError::BadRequest(format!("invalid time {value:?}: {e}")))
}

fn parse_device(id: &str) -> Result<DeviceId, ApiError> {
    id.parse::<i64>()
        .map(DeviceId)
        .map_err(|_| ApiError::BadRequest(format!("invalid device id: {id:?}")))
}

// ---- handlers ----

/// Body of POST /fixes: one fix or an array
#[derive(Deserialize)]
#[serde(untagged)]
enum FixBatch {
    One(Fix),
    Many(Vec<Fix>),
}

#[derive(Serialize)]
#[serde(untagged)]
enum FixResult {
    Accepted {
        accepted: bool,
        #[serde(flatten)]
        outcome: IngestOutcome,
    },
    Rejected {
        accepted: bool,
        device_id: DeviceId,
        error: &'static str,
        message: String,
    },
}

impl FixResult {
    fn from_result(device_id: DeviceId, result: Result<IngestOutcome, IngestError>) -> Self {
        match result {
            Ok(outcome) => FixResult::Accepted { accepted: true, outcome },
            Err(e) => FixResult::Rejected {
                accepted: false,
                device_id,
                error: e.code(),
                message: e.to_string(),
            },
        }
    }
}

#[derive(Serialize)]
struct IngestResponse {
    accepted: usize,
    rejected: usize,
    results: Vec<FixResult>,
}

fn post_fixes(state: &ApiState, body: &[u8], now: DateTime<Utc>) -> ApiResult {
    let batch: FixBatch = serde_json::from_slice(body).map_err(|e| {
        state.metrics.record_parse_error();
        ApiError::BadRequest(format!("invalid fix payload: {e}"))
    })?;
    let fixes = match batch {
        FixBatch::One(fix) => vec![fix],
        FixBatch::Many(fixes) => fixes,
    };

    let results: Vec<FixResult> = fixes
        .into_iter()
        .map(|fix| {
            let device_id = fix.device_id;
            FixResult::from_result(device_id, state.tracker.ingest(fix, now))
        })
        .collect();
    let accepted = results.iter().filter(|r| matches!(r, FixResult::Accepted { .. })).count();
    let rejected = results.len() - accepted;
    debug!(accepted = %accepted, rejected = %rejected, "http_fixes_ingested");

    Ok(json(StatusCode::OK, &IngestResponse { accepted, rejected, results }))
}

fn put_zones(state: &ApiState, body: &[u8]) -> ApiResult {
    let zones: Vec<Zone> = serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("invalid zone payload: {e}")))?;
    let count = state.tracker.replace_zones(zones).map_err(|e| {
        warn!(error = %e, "zone_replace_rejected");
        ApiError::BadRequest(e.to_string())
    })?;
    Ok(json(StatusCode::OK, &serde_json::json!({ "zones": count })))
}

fn check_zones(state: &ApiState, raw_query: Option<&str>) -> ApiResult {
    let query: ZoneCheckQuery = parse_query(raw_query)?;
    if let Some(device_id) = query.device_id.map(DeviceId) {
        let zones = state
            .tracker
            .zones_containing_device(device_id)
            .ok_or_else(|| ApiError::NotFound(format!("no fix for device {device_id}")))?;
        return Ok(json(StatusCode::OK, &zones));
    }

    let (Some(lat), Some(lon)) = (query.lat, query.lon) else {
        return Err(ApiError::BadRequest("lat and lon, or device_id, are required".to_string()));
    };
    Ok(json(StatusCode::OK, &state.tracker.zones_containing(lat, lon)))
}

fn device_route(
    state: &ApiState,
    device_id: DeviceId,
    raw_query: Option<&str>,
    now: DateTime<Utc>,
) -> ApiResult {
    let query: RouteQuery = parse_query(raw_query)?;
    let (start, end) = time_window(query.start, query.end, now)?;
    let tracker = &state.tracker;
    match query.tolerance {
        Some(tolerance) if tolerance.is_finite() && tolerance >= 0.0 => Ok(json(
            StatusCode::OK,
            &tracker.simplified_route(device_id, start, end, Some(tolerance)),
        )),
        Some(tolerance) => Err(ApiError::BadRequest(format!("invalid tolerance: {tolerance}"))),
        None => Ok(json(StatusCode::OK, &tracker.route_points(device_id, start, end, query.limit))),
    }
}

fn device_request(
    state: &ApiState,
    device_id: DeviceId,
    rest: &[&str],
    raw_query: Option<&str>,
    now: DateTime<Utc>,
) -> ApiResult {
    let tracker = &state.tracker;
    let window = || parse_query::<WindowQuery>(raw_query).and_then(|q| q.window(now));
    match rest {
        ["state"] => tracker
            .device_status(device_id, now)
            .map(|status| json(StatusCode::OK, &status))
            .ok_or_else(|| ApiError::NotFound(format!("unknown device {device_id}"))),
        ["route"] => device_route(state, device_id, raw_query, now),
        ["route", "stats"] => {
            let (start, end) = window()?;
            Ok(json(StatusCode::OK, &tracker.route_stats(device_id, start, end)))
        }
        ["route", "compare"] => {
            let (start, end) = window()?;
            Ok(json(StatusCode::OK, &tracker.compare_route(device_id, start, end, now)))
        }
        ["route", "start"] => Ok(json(StatusCode::OK, &tracker.route_start(device_id))),
        ["route", "end"] => {
            let query: RouteEndQuery = parse_query(raw_query)?;
            let minutes = query.stopped_minutes.unwrap_or(DEFAULT_ROUTE_END_MINUTES);
            Ok(json(StatusCode::OK, &tracker.route_end(device_id, minutes)))
        }
        ["movement"] => {
            let (start, end) = window()?;
            Ok(json(StatusCode::OK, &tracker.movement_times(device_id, start, end)))
        }
        ["stops"] => {
            let query: StopsQuery = parse_query(raw_query)?;
            let minutes = query.min_minutes.unwrap_or(DEFAULT_STOP_MINUTES);
            Ok(json(StatusCode::OK, &tracker.unauthorized_stops(device_id, minutes)))
        }
        ["smoothed"] => {
            let query: SmoothedQuery = parse_query(raw_query)?;
            let window = query.window.unwrap_or(DEFAULT_WINDOW);
            if !(1..=MAX_WINDOW).contains(&window) {
                return Err(ApiError::BadRequest(format!(
                    "window must be between 1 and {MAX_WINDOW}"
                )));
            }
            Ok(json(StatusCode::OK, &tracker.smoothed(device_id, window)))
        }
        ["quality"] => {
            let (start, end) = window()?;
            Ok(json(StatusCode::OK, &tracker.quality_report(device_id, start, end, now)))
        }
        ["invalid"] => {
            let (start, end) = window()?;
            Ok(json(StatusCode::OK, &tracker.invalid_fixes(device_id, start, end, now)))
        }
        _ => Err(ApiError::NotFound("not found".to_string())),
    }
}

/// Route a request with its body already read
fn dispatch(
    state: &ApiState,
    method: &Method,
    path: &str,
    raw_query: Option<&str>,
    body: &[u8],
    now: DateTime<Utc>,
) -> Response<Full<Bytes>> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();
    let tracker = &state.tracker;

    let result = match (method, segments.as_slice()) {
        (&Method::GET, ["health"]) => Ok(response(StatusCode::OK, "text/plain", "ok")),
        (&Method::GET, ["metrics"]) => {
            let summary = state.metrics.report(tracker.device_count(), tracker.zone_count());
            Ok(response(
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                format_prometheus_metrics(&summary, &state.site_id),
            ))
        }
        (&Method::POST, ["fixes"]) => post_fixes(state, body, now),
        (&Method::GET, ["zones"]) => Ok(json(StatusCode::OK, &*tracker.zones())),
        (&Method::PUT, ["zones"]) => put_zones(state, body),
        (&Method::GET, ["zones", "check"]) => check_zones(state, raw_query),
        (&Method::GET, ["devices", "summary"]) => {
            Ok(json(StatusCode::OK, &tracker.state_summary(now)))
        }
        (&Method::GET, ["devices", "inactive"]) => {
            Ok(json(StatusCode::OK, &tracker.inactive_devices(now)))
        }
        (&Method::GET, ["devices", "locations"]) => {
            Ok(json(StatusCode::OK, &tracker.current_locations(now)))
        }
        (&Method::GET, ["devices", id, rest @ ..]) => parse_device(id)
            .and_then(|device_id| device_request(state, device_id, rest, raw_query, now)),
        _ => Err(ApiError::NotFound("not found".to_string())),
    };

    result.unwrap_or_else(|e| error_response(&e))
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<ApiState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();

    let body = match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "http_body_read_failed");
            return Ok(error_response(&ApiError::BadRequest(format!("unreadable body: {e}"))));
        }
    };

    Ok(dispatch(&state, &parts.method, parts.uri.path(), parts.uri.query(), &body, Utc::now()))
}

/// Start the HTTP API server
pub async fn start_http_server(
    bind_address: &str,
    port: u16,
    state: Arc<ApiState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = format!("{bind_address}:{port}");
    let listener =
        TcpListener::bind(&addr).await.with_context(|| format!("binding http server on {addr}"))?;

    info!(addr = %addr, site = %state.site_id, "http_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let state = state.clone();
                                async move { handle_request(req, state).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "http_connection_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "http_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("http_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
