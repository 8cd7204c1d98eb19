//! Dashboard HTTP endpoint
//!
//! Serves the live feed and historical views to the dashboard front end, plus
//! Prometheus metrics and a health probe. Uses hyper http1 directly.
//!
//! Routes:
//! - `GET /health` - liveness probe
//! - `GET /metrics` - Prometheus text exposition
//! - `GET /api/today` - today's readings, persisted then buffered
//! - `GET /api/week[?end=YYYY-MM-DD]` - 7 days ending at `end`, Monday first
//! - `GET /api/capacity` - last known maximum per room
//! - `GET /api/live` - server-sent events: one `snapshot`, then one `reading` each

use crate::domain::Reading;
use crate::infra::metrics::{MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use crate::io::store::Store;
use crate::io::upstream::Fetcher;
use crate::services::error::{PollError, SchedulerError};
use crate::services::scheduler::PollingScheduler;
use anyhow::anyhow;
use bytes::Bytes;
use chrono::NaiveDate;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use std::fmt::Write;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Notify};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

/// Events buffered per live client before it is considered too slow
const LIVE_CHANNEL_CAPACITY: usize = 64;

type ResponseBody = BoxBody<Bytes, Infallible>;

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
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, site: &str, val: u64) {
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
    for (i, bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {}", avg * count);
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format a metrics summary in Prometheus text exposition format
fn format_prometheus_metrics(summary: &MetricsSummary, site: &str) -> String {
    let mut output = String::with_capacity(4096);

    write_metric(
        &mut output,
        "poller_fetch_attempts_total",
        "Upstream fetch attempts",
        MetricType::Counter,
        site,
        summary.fetch_attempts,
    );
    write_metric(
        &mut output,
        "poller_fetch_failures_total",
        "Upstream fetch failures",
        MetricType::Counter,
        site,
        summary.fetch_failures,
    );
    write_histogram(
        &mut output,
        "poller_fetch_latency_ms",
        "Upstream fetch latency in milliseconds",
        site,
        &summary.fetch_latency_buckets,
        summary.fetch_avg_ms,
    );
    write_metric(
        &mut output,
        "poller_readings_total",
        "Readings accepted",
        MetricType::Counter,
        site,
        summary.readings_total,
    );
    write_metric(
        &mut output,
        "poller_closed_waits_total",
        "Sleeps until opening hours",
        MetricType::Counter,
        site,
        summary.closed_waits,
    );
    write_metric(
        &mut output,
        "poller_flushes_total",
        "Successful buffer flushes",
        MetricType::Counter,
        site,
        summary.flushes_total,
    );
    write_metric(
        &mut output,
        "poller_flush_failures_total",
        "Failed buffer flushes",
        MetricType::Counter,
        site,
        summary.flush_failures,
    );
    write_metric(
        &mut output,
        "poller_rows_flushed_total",
        "Readings written to the store",
        MetricType::Counter,
        site,
        summary.rows_flushed,
    );
    write_metric(
        &mut output,
        "poller_subscriber_failures_total",
        "Live subscribers dropped after a failed delivery",
        MetricType::Counter,
        site,
        summary.subscriber_failures,
    );
    write_metric(
        &mut output,
        "poller_buffered_readings",
        "Readings waiting for the next flush",
        MetricType::Gauge,
        site,
        summary.buffer_len,
    );
    write_metric(
        &mut output,
        "poller_live_subscribers",
        "Live subscriptions",
        MetricType::Gauge,
        site,
        summary.subscribers,
    );

    output
}

fn sse_event(name: &str, data: &str) -> Bytes {
    Bytes::from(format!("event: {name}\ndata: {data}\n\n"))
}

fn full<T: Into<Bytes>>(body: T) -> ResponseBody {
    Full::new(body.into()).boxed()
}

fn text_response(status: StatusCode, body: &'static str) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(full(body))
        .expect("static response should not fail")
}

fn json_response<T: Serialize>(value: &T) -> Response<ResponseBody> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .header("Access-Control-Allow-Origin", "*")
            .body(full(body))
            .expect("static response should not fail"),
        Err(e) => {
            error!(error = %e, "dashboard_encode_failed");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "encode failed")
        }
    }
}

fn error_response(e: &SchedulerError) -> Response<ResponseBody> {
    let status = match e {
        SchedulerError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
        SchedulerError::AlreadyStarted | SchedulerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!(error = %e, status = status.as_u16(), "dashboard_query_failed");
    let body = json!({ "ok": false, "error": e.to_string() }).to_string();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(full(body))
        .expect("static response should not fail")
}

/// Value of `end` in a `?end=YYYY-MM-DD` query. `Ok(None)` when absent.
fn parse_end_param(query: Option<&str>) -> Result<Option<NaiveDate>, ()> {
    let Some(raw) = query.and_then(|q| q.split('&').find_map(|pair| pair.strip_prefix("end=")))
    else {
        return Ok(None);
    };
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map(Some).map_err(|_| ())
}

/// State shared by every dashboard connection
pub struct DashboardState<F, S> {
    scheduler: Arc<PollingScheduler<F, S>>,
    site_id: String,
    shutdown: watch::Receiver<bool>,
}

impl<F, S> DashboardState<F, S>
where
    F: Fetcher + 'static,
    S: Store + 'static,
{
    pub fn new(
        scheduler: Arc<PollingScheduler<F, S>>,
        site_id: String,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self { scheduler, site_id, shutdown }
    }

    fn week(&self, query: Option<&str>) -> Response<ResponseBody> {
        let result = match parse_end_param(query) {
            Ok(Some(end)) => self.scheduler.query_week(end).map(|days| (end, days)),
            Ok(None) => self.scheduler.query_last_week(),
            Err(()) => return text_response(StatusCode::BAD_REQUEST, "end must be YYYY-MM-DD"),
        };
        match result {
            Ok((end, days)) => json_response(&json!({ "end": end, "days": days })),
            Err(e) => error_response(&e),
        }
    }

    /// Open a server-sent event stream bound to a new live subscription
    fn live(&self) -> Response<ResponseBody> {
        let (tx, rx) = mpsc::channel::<Result<Frame<Bytes>, Infallible>>(LIVE_CHANNEL_CAPACITY);
        let dropped = Arc::new(Notify::new());

        let sink = tx.clone();
        let on_error_dropped = dropped.clone();
        let feed = self.scheduler.subscribe(
            move |reading: &Reading| {
                let data = serde_json::to_string(reading)?;
                sink.try_send(Ok(Frame::data(sse_event("reading", &data))))
                    .map_err(|e| anyhow!("live client not keeping up: {e}"))
            },
            move |e: &PollError| {
                debug!(error = %e, "live_stream_dropped");
                on_error_dropped.notify_one();
            },
        );
        let feed = match feed {
            Ok(feed) => feed,
            Err(e) => return error_response(&e),
        };

        let snapshot = match serde_json::to_string(&feed.snapshot) {
            Ok(data) => sse_event("snapshot", &data),
            Err(e) => {
                feed.subscription.cancel();
                error!(error = %e, "dashboard_encode_failed");
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, "encode failed");
            }
        };

        // Ends the subscription when the client goes away, the subscriber is
        // dropped for lagging, or the service shuts down
        let subscription = feed.subscription;
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let stopping = async {
                while !*shutdown.borrow_and_update() {
                    if shutdown.changed().await.is_err() {
                        return;
                    }
                }
            };
            tokio::select! {
                _ = tx.closed() => {}
                _ = dropped.notified() => {}
                _ = stopping => {}
            }
            subscription.cancel();
            debug!(subscription = subscription.id(), "live_client_closed");
        });

        let stream = tokio_stream::once(Ok(Frame::data(snapshot))).chain(ReceiverStream::new(rx));
        Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/event-stream")
            .header("Cache-Control", "no-cache")
            .header("Access-Control-Allow-Origin", "*")
            .body(StreamBody::new(stream).boxed())
            .expect("static response should not fail")
    }
}

/// Handle one dashboard request
pub async fn handle_request<B, F, S>(
    req: Request<B>,
    state: Arc<DashboardState<F, S>>,
) -> Result<Response<ResponseBody>, Infallible>
where
    F: Fetcher + 'static,
    S: Store + 'static,
{
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => text_response(StatusCode::OK, "ok"),
        (&Method::GET, "/metrics") => {
            let summary = state.scheduler.report_metrics();
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full(format_prometheus_metrics(&summary, &state.site_id)))
                .expect("static response should not fail")
        }
        (&Method::GET, "/api/today") => match state.scheduler.today_snapshot() {
            Ok(readings) => json_response(&readings),
            Err(e) => error_response(&e),
        },
        (&Method::GET, "/api/week") => state.week(req.uri().query()),
        (&Method::GET, "/api/capacity") => json_response(&state.scheduler.fetcher().capacities()),
        (&Method::GET, "/api/live") => state.live(),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };
    Ok(response)
}

/// Accept dashboard connections on `listener` until shutdown is signalled
pub async fn serve<F, S>(
    listener: TcpListener,
    state: Arc<DashboardState<F, S>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    F: Fetcher + 'static,
    S: Store + 'static,
{
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| handle_request(req, state.clone()));
                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                error!(error = %e, "dashboard_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "dashboard_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("dashboard_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

/// Bind and run the dashboard HTTP server
pub async fn start_dashboard_server<F, S>(
    bind_address: &str,
    port: u16,
    scheduler: Arc<PollingScheduler<F, S>>,
    site_id: String,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    F: Fetcher + 'static,
    S: Store + 'static,
{
    let listener = TcpListener::bind((bind_address, port)).await?;
    info!(addr = %listener.local_addr()?, site = %site_id, "dashboard_server_started");

    let state = Arc::new(DashboardState::new(scheduler, site_id, shutdown.clone()));
    serve(listener, state, shutdown).await
}
