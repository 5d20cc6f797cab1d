//! Prometheus metrics HTTP endpoint
//!
//! Exposes engine metrics in Prometheus text format at /metrics.
//! Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

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
    bounds: &[u64; 10],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.snapshot();
    let mut output = String::with_capacity(4096);

    write_core_metrics(&mut output, site_id, &summary);
    write_latency_metrics(&mut output, site_id, &summary);
    write_event_metrics(&mut output, site_id, &summary);
    write_region_metrics(&mut output, site_id, &summary);
    write_drop_metrics(&mut output, site_id, &summary);

    output
}

fn write_core_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "regionmatch_observations_total",
        "Total observations evaluated",
        MetricType::Counter,
        site,
        summary.observations_total,
    );
    let _ = writeln!(
        output,
        "# HELP regionmatch_observations_per_sec Observations evaluated per second"
    );
    let _ = writeln!(output, "# TYPE regionmatch_observations_per_sec gauge");
    let _ = writeln!(
        output,
        "regionmatch_observations_per_sec{{site=\"{site}\"}} {:.2}",
        summary.observations_per_sec
    );
    write_metric(
        output,
        "regionmatch_tracked_devices",
        "Devices with state across all partitions",
        MetricType::Gauge,
        site,
        summary.tracked_devices,
    );
    write_metric(
        output,
        "regionmatch_observation_queue_depth",
        "Observations waiting in worker queues",
        MetricType::Gauge,
        site,
        summary.observation_queue_depth,
    );
}

fn write_latency_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_histogram(
        output,
        "regionmatch_eval_latency_us",
        "Observation evaluation latency in microseconds",
        site,
        &summary.lat_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.avg_latency_us,
    );
    write_metric(
        output,
        "regionmatch_eval_latency_p99_us",
        "99th percentile evaluation latency",
        MetricType::Gauge,
        site,
        summary.lat_p99_us,
    );
    write_metric(
        output,
        "regionmatch_eval_latency_max_us",
        "Max evaluation latency since last report",
        MetricType::Gauge,
        site,
        summary.max_latency_us,
    );
}

fn write_event_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    let name = "regionmatch_events_total";
    let _ = writeln!(output, "# HELP {name} Match events emitted by type");
    let _ = writeln!(output, "# TYPE {name} counter");
    for (kind, val) in [
        ("ENTRY", summary.enter_events),
        ("EXIT", summary.exit_events),
        ("HANGOUT", summary.hangout_events),
    ] {
        let _ = writeln!(output, "{name}{{site=\"{site}\",type=\"{kind}\"}} {val}");
    }
    write_metric(
        output,
        "regionmatch_stale_region_exits_total",
        "Exits caused by memberships in deleted regions",
        MetricType::Counter,
        site,
        summary.stale_region_exits,
    );
}

fn write_region_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "regionmatch_active_regions",
        "Regions currently in the store",
        MetricType::Gauge,
        site,
        summary.active_regions,
    );
    write_metric(
        output,
        "regionmatch_regions_upserted_total",
        "Region definitions inserted or replaced",
        MetricType::Counter,
        site,
        summary.regions_upserted,
    );
    write_metric(
        output,
        "regionmatch_regions_removed_total",
        "Region removals applied",
        MetricType::Counter,
        site,
        summary.regions_removed,
    );
    write_metric(
        output,
        "regionmatch_regions_expired_total",
        "Regions purged after their timeout",
        MetricType::Counter,
        site,
        summary.regions_expired,
    );
}

fn write_drop_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "regionmatch_observations_rejected_total",
        "Observations rejected as invalid",
        MetricType::Counter,
        site,
        summary.observations_rejected,
    );
    write_metric(
        output,
        "regionmatch_regions_rejected_total",
        "Region updates rejected for bad geometry",
        MetricType::Counter,
        site,
        summary.regions_rejected,
    );
    write_metric(
        output,
        "regionmatch_records_malformed_total",
        "Inbound records that did not fit the schema",
        MetricType::Counter,
        site,
        summary.records_malformed,
    );
    write_metric(
        output,
        "regionmatch_ingress_dropped_total",
        "Observations dropped because the input channel was full",
        MetricType::Counter,
        site,
        summary.ingress_dropped,
    );
    write_metric(
        output,
        "regionmatch_egress_dropped_total",
        "Egress messages dropped because the channel was full",
        MetricType::Counter,
        site,
        summary.egress_dropped,
    );
}

fn text_response(status: StatusCode, content_type: &str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if let Ok(value) = hyper::header::HeaderValue::from_str(content_type) {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(route(req.method(), req.uri().path(), &metrics, &site_id))
}

fn route(method: &Method, path: &str, metrics: &Metrics, site_id: &str) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/metrics") => text_response(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            format_prometheus_metrics(metrics, site_id),
        ),
        (&Method::GET, "/health") => {
            text_response(StatusCode::OK, "text/plain", "ok".to_string())
        }
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string()),
    }
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let site_id = site_id.clone();
                                async move { handle_request(req, metrics, site_id).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
