use actix_web::{get, post, web, App, HttpResponse, HttpServer, Responder};
use prometheus::{Encoder, IntCounter, IntGauge, IntGaugeVec, Opts};

use crate::master::{ControlError, ControlHandle};

type Result<T, E> = std::result::Result<T, E>;

fn try_create_int_counter(name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let opts = Opts::new(name, help);
    let counter = IntCounter::with_opts(opts)?;
    prometheus::register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn try_create_int_gauge(name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    let opts = Opts::new(name, help);
    let gauge = IntGauge::with_opts(opts)?;
    prometheus::register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn try_create_int_gauge_vec(
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntGaugeVec, prometheus::Error> {
    let opts = Opts::new(name, help);
    let gauge = IntGaugeVec::new(opts, labels)?;
    prometheus::register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

lazy_static! {
    pub(crate) static ref BLOCKS_READ_TOTAL: IntCounter = try_create_int_counter(
        "ship_indexer_blocks_read_total",
        "Raw blocks pushed to the stage-1 queues by readers"
    )
    .unwrap();
    pub(crate) static ref BLOCKS_CONSUMED_TOTAL: IntCounter = try_create_int_counter(
        "ship_indexer_blocks_consumed_total",
        "Blocks deserialized and forwarded to the indexing queues"
    )
    .unwrap();
    pub(crate) static ref ACTIONS_DESERIALIZED_TOTAL: IntCounter = try_create_int_counter(
        "ship_indexer_actions_deserialized_total",
        "Action traces produced by deserializers"
    )
    .unwrap();
    pub(crate) static ref DELTAS_DESERIALIZED_TOTAL: IntCounter = try_create_int_counter(
        "ship_indexer_deltas_deserialized_total",
        "Table deltas produced by deserializers"
    )
    .unwrap();
    pub(crate) static ref RECORDS_INDEXED_TOTAL: IntCounter = try_create_int_counter(
        "ship_indexer_records_indexed_total",
        "Records durably written to storage"
    )
    .unwrap();
    pub(crate) static ref DS_ERRORS_TOTAL: IntCounter = try_create_int_counter(
        "ship_indexer_ds_errors_total",
        "Contract payloads that could not be decoded"
    )
    .unwrap();
    pub(crate) static ref WORKER_RESTARTS_TOTAL: IntCounter = try_create_int_counter(
        "ship_indexer_worker_restarts_total",
        "Workers relaunched after a crash"
    )
    .unwrap();
    // Prometheus Gauge Metric type do not support u64
    // https://github.com/tikv/rust-prometheus/issues/470
    pub(crate) static ref LAST_PROCESSED_BLOCK: IntGauge = try_create_int_gauge(
        "ship_indexer_last_processed_block",
        "Highest block consumed by the deserializers"
    )
    .unwrap();
    pub(crate) static ref LAST_IRREVERSIBLE_BLOCK: IntGauge = try_create_int_gauge(
        "ship_indexer_last_irreversible_block",
        "Last irreversible block reported by the live reader"
    )
    .unwrap();
    pub(crate) static ref ACTIVE_WORKERS: IntGauge = try_create_int_gauge(
        "ship_indexer_active_workers",
        "Workers currently supervised by the master"
    )
    .unwrap();
    pub(crate) static ref READERS_PAUSED: IntGauge = try_create_int_gauge(
        "ship_indexer_readers_paused",
        "1 while readers are paused by queue backpressure"
    )
    .unwrap();
    pub(crate) static ref QUEUE_DEPTH: IntGaugeVec = try_create_int_gauge_vec(
        "ship_indexer_queue_depth",
        "Messages waiting in a pipeline queue",
        &["queue"]
    )
    .unwrap();
}

#[get("/metrics")]
async fn get_metrics() -> impl Responder {
    let encoder = prometheus::TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!(target: crate::INDEXER, "could not encode metrics: {}", e);
    };

    match String::from_utf8(buffer.clone()) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(target: crate::INDEXER, "custom metrics could not be from_utf8'd: {}", e);
            String::default()
        }
    }
}

#[derive(serde::Deserialize, Debug)]
struct IndexerControlRequest {
    /// Record kind whose ingestors are targeted, all of them when omitted.
    #[serde(rename = "type", default)]
    kind: Option<ship_primitives::RecordKind>,
}

fn control_response(result: Result<usize, ControlError>) -> HttpResponse {
    match result {
        Ok(workers) => HttpResponse::Ok().json(serde_json::json!({"ack": true, "workers": workers})),
        Err(err) => {
            let body = serde_json::json!({"ack": false, "error": err.to_string()});
            match err {
                ControlError::Timeout { .. } => HttpResponse::GatewayTimeout().json(body),
                ControlError::Unreachable => HttpResponse::ServiceUnavailable().json(body),
                ControlError::Rejected(_) => HttpResponse::Conflict().json(body),
            }
        }
    }
}

#[post("/control/pause")]
async fn pause_indexer(
    control: web::Data<ControlHandle>,
    request: web::Json<IndexerControlRequest>,
) -> impl Responder {
    control_response(control.pause_indexer(request.kind).await)
}

#[post("/control/resume")]
async fn resume_indexer(
    control: web::Data<ControlHandle>,
    request: web::Json<IndexerControlRequest>,
) -> impl Responder {
    control_response(control.resume_indexer(request.kind).await)
}

#[post("/control/stop")]
async fn stop_indexer(control: web::Data<ControlHandle>) -> impl Responder {
    control_response(control.stop_indexer().await)
}

pub(crate) fn init_server(port: u16, control: ControlHandle) -> anyhow::Result<actix_web::dev::Server> {
    tracing::info!(target: crate::INDEXER, "Starting metrics server on http://0.0.0.0:{port}/metrics");

    let control = web::Data::new(control);
    Ok(HttpServer::new(move || {
        App::new()
            .app_data(control.clone())
            .service(get_metrics)
            .service(pause_indexer)
            .service(resume_indexer)
            .service(stop_indexer)
    })
    .bind(("0.0.0.0", port))?
    .disable_signals()
    .run())
}
