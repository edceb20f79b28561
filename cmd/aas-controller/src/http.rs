use axum::{
    Json, Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

use pkg_controllers::cancel::CancelToken;
use pkg_controllers::registry::Registry;
use pkg_controllers::store::TaskLister;
use pkg_metrics::MetricsRegistry;
use pkg_types::hpa::{CustomedHorizontalPodAutoscaler, ScalingSpec};
use pkg_types::meta::ObjectKey;
use pkg_types::metric::{Dimension, MetricSample};
use pkg_types::task::{ScalingTask, ScalingTaskSpec};
use pkg_types::validate::{validate_name, validate_scaling_spec, validate_scaling_task};

#[derive(Clone)]
struct HttpState {
    metrics: Arc<MetricsRegistry>,
    registry: Arc<Registry>,
}

pub fn router(metrics: Arc<MetricsRegistry>, registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .route("/healthz", get(healthz))
        .route("/api/v1/metrics", post(put_metric_data))
        .route(
            "/api/v1/namespaces/{ns}/scalingtasks",
            get(list_scaling_tasks),
        )
        .route(
            "/api/v1/namespaces/{ns}/scalingtasks/{name}",
            put(put_scaling_task)
                .get(get_scaling_task)
                .delete(delete_scaling_task),
        )
        .route(
            "/api/v1/namespaces/{ns}/targets/{name}",
            put(put_scaling_target).get(get_scaling_target),
        )
        .route("/api/v1/namespaces/{ns}/events", get(list_events))
        .with_state(HttpState { metrics, registry })
}

async fn render_metrics(State(state): State<HttpState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn healthz() -> &'static str {
    "ok"
}

fn internal_error(what: &str, e: anyhow::Error) -> Response {
    warn!("Failed to {}: {}", what, e);
    (StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to {}", what)).into_response()
}

// ============================================================
// Scaling tasks
// ============================================================

async fn put_scaling_task(
    State(state): State<HttpState>,
    Path((ns, name)): Path<(String, String)>,
    Json(spec): Json<ScalingTaskSpec>,
) -> Response {
    let task = ScalingTask {
        id: Uuid::new_v4().to_string(),
        name,
        namespace: ns,
        spec,
        resource_version: 0,
        created_at: Utc::now(),
    };
    if let Err(e) = validate_scaling_task(&task) {
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }
    match state.registry.put_task(task).await {
        Ok(task) => {
            info!(
                "Stored scaling task {} (version {})",
                task.key(),
                task.resource_version
            );
            (StatusCode::OK, Json(task)).into_response()
        }
        Err(e) => internal_error("store scaling task", e),
    }
}

async fn get_scaling_task(
    State(state): State<HttpState>,
    Path((ns, name)): Path<(String, String)>,
) -> Response {
    match state.registry.get_task(&ObjectKey::new(ns, name)).await {
        Ok(Some(task)) => (StatusCode::OK, Json(task)).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal_error("read scaling task", e),
    }
}

async fn list_scaling_tasks(
    State(state): State<HttpState>,
    Path(ns): Path<String>,
) -> Response {
    match state.registry.list_tasks().await {
        Ok(tasks) => {
            let tasks: Vec<ScalingTask> = tasks.into_iter().filter(|t| t.namespace == ns).collect();
            (StatusCode::OK, Json(tasks)).into_response()
        }
        Err(e) => internal_error("list scaling tasks", e),
    }
}

async fn delete_scaling_task(
    State(state): State<HttpState>,
    Path((ns, name)): Path<(String, String)>,
) -> Response {
    let key = ObjectKey::new(ns, name);
    match state.registry.delete_task(&key).await {
        Ok(true) => {
            info!("Deleted scaling task {}", key);
            StatusCode::OK.into_response()
        }
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal_error("delete scaling task", e),
    }
}

// ============================================================
// Scaling targets
// ============================================================

async fn put_scaling_target(
    State(state): State<HttpState>,
    Path((ns, name)): Path<(String, String)>,
    Json(spec): Json<ScalingSpec>,
) -> Response {
    if let Err(e) = validate_name(&ns)
        .and_then(|_| validate_name(&name))
        .and_then(|_| validate_scaling_spec(&spec))
    {
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }
    let target = CustomedHorizontalPodAutoscaler {
        id: Uuid::new_v4().to_string(),
        name,
        namespace: ns,
        spec,
        resource_version: 0,
        created_at: Utc::now(),
    };
    match state.registry.put_target(target).await {
        Ok(target) => (StatusCode::OK, Json(target)).into_response(),
        Err(e) => internal_error("store scaling target", e),
    }
}

async fn get_scaling_target(
    State(state): State<HttpState>,
    Path((ns, name)): Path<(String, String)>,
) -> Response {
    match state.registry.get_target(&ObjectKey::new(ns, name)).await {
        Ok(Some(target)) => (StatusCode::OK, Json(target)).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal_error("read scaling target", e),
    }
}

// ============================================================
// Metrics ingestion and events
// ============================================================

/// One data point of a `PutMetricData` request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetricDatum {
    #[serde(alias = "metric_name")]
    metric_name: String,
    #[serde(default)]
    dimensions: Vec<Dimension>,
    value: f64,
    #[serde(default)]
    unit: Option<String>,
    /// Defaults to the time of receipt.
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PutMetricData {
    #[serde(alias = "metric_data")]
    metric_data: Vec<MetricDatum>,
}

async fn put_metric_data(
    State(state): State<HttpState>,
    Json(request): Json<PutMetricData>,
) -> Response {
    if let Some(bad) = request
        .metric_data
        .iter()
        .find(|d| d.metric_name.is_empty() || !d.value.is_finite())
    {
        return (
            StatusCode::BAD_REQUEST,
            format!("invalid data point for metric '{}'", bad.metric_name),
        )
            .into_response();
    }
    let received = Utc::now();
    for datum in request.metric_data {
        let sample = MetricSample {
            metric_name: datum.metric_name,
            dimensions: datum.dimensions,
            value: datum.value,
            unit: datum.unit,
            timestamp: datum.timestamp.unwrap_or(received),
        };
        if let Err(e) = state.registry.put_metric_sample(&sample).await {
            return internal_error("store metric sample", e);
        }
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn list_events(State(state): State<HttpState>, Path(ns): Path<String>) -> Response {
    match state.registry.list_events(&ns).await {
        Ok(events) => (StatusCode::OK, Json(events)).into_response(),
        Err(e) => internal_error("list events", e),
    }
}

/// Serve the API and operations endpoints until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    metrics: Arc<MetricsRegistry>,
    registry: Arc<Registry>,
    mut shutdown: CancelToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Serving API, /metrics and /healthz on {}", addr);
    axum::serve(listener, router(metrics, registry))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
