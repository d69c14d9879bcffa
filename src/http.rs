use crate::analytics::SystemReport;
use crate::error::{AppError, AppResult};
use crate::scheduler::SchedulerState;
use crate::system::{EnergySystem, IngestSummary, StatusReport};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::{stream, Stream, StreamExt};
use serde::Serialize;
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpState {
    pub system: Arc<EnergySystem>,
}

#[derive(Debug, Serialize)]
struct SimulationResponse {
    state: SchedulerState,
}

#[derive(Debug, Serialize)]
struct ClearResponse {
    purged: u64,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn ping() -> &'static str {
    "pong"
}

async fn post_ingest(State(state): State<HttpState>, body: Bytes) -> AppResult<Json<IngestSummary>> {
    let summary = state.system.ingest(&body).await?;
    Ok(Json(summary))
}

async fn post_start(State(state): State<HttpState>) -> AppResult<Json<SimulationResponse>> {
    let state = state.system.start().await?;
    Ok(Json(SimulationResponse { state }))
}

async fn post_stop(State(state): State<HttpState>) -> Json<SimulationResponse> {
    state.system.stop();
    Json(SimulationResponse {
        state: SchedulerState::Stopped,
    })
}

async fn get_status(State(state): State<HttpState>) -> Json<StatusReport> {
    Json(state.system.status().await)
}

async fn get_full_report(State(state): State<HttpState>) -> AppResult<Json<Arc<SystemReport>>> {
    state
        .system
        .last_report()
        .map(Json)
        .ok_or_else(|| AppError::new(StatusCode::NOT_FOUND, "no report generated yet"))
}

/// Live report stream; the latest report, when present, is sent first.
async fn get_stream(
    State(state): State<HttpState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let subscription = state.system.subscribe();
    let initial = stream::iter(state.system.last_report());
    let events = initial
        .chain(subscription)
        .map(|report| Event::default().event("update").json_data(&*report));
    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn delete_data(State(state): State<HttpState>) -> AppResult<Json<ClearResponse>> {
    let purged = state.system.clear_all().await?;
    Ok(Json(ClearResponse { purged }))
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/ping", get(ping))
        .route("/api/ingest", post(post_ingest))
        .route("/api/simulation/start", post(post_start))
        .route("/api/simulation/stop", post(post_stop))
        .route("/api/status", get(get_status))
        .route("/api/full-report", get(get_full_report))
        .route("/api/stream", get(get_stream))
        .route("/api/data", delete(delete_data))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forecast::MovingAverageForecaster;
    use crate::queue_depth::QueueDepthMonitor;
    use crate::system::{PipelineSettings, Workers};
    use crate::test_support::{MemoryBroker, MemoryStore};
    use std::time::Duration;
    use tokio::sync::mpsc;

    const BODY: &str = "Timestamp,Temperature,Humidity,SquareFootage,Occupancy,HVACUsage,LightingUsage,RenewableEnergy,DayOfWeek,Holiday,EnergyConsumption\n\
        2022-01-01 00:00:00,25.1,43.4,1565.6,5,On,Off,2.77,Monday,No,75.36\n\
        2022-01-01 01:00:00,27.7,54.2,1411.0,1,On,On,21.83,Saturday,No,83.40\n";

    fn state() -> (HttpState, Workers, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(MemoryBroker::new(1000));
        let depth = Arc::new(QueueDepthMonitor::new(broker.clone(), None, Duration::from_millis(100)));
        let (_tx, rx) = mpsc::channel(4);
        let (system, workers) = EnergySystem::assemble(
            store.clone(),
            broker,
            rx,
            depth,
            Arc::new(MovingAverageForecaster::default()),
            PipelineSettings {
                burst_size: 24,
                ..PipelineSettings::default()
            },
        );
        (HttpState { system }, workers, store)
    }

    #[tokio::test]
    async fn start_before_ingest_conflicts() {
        let (state, workers, _) = state();
        let err = post_start(State(state)).await.unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);
        workers.abort();
    }

    #[tokio::test]
    async fn malformed_upload_is_a_bad_request() {
        let (state, workers, _) = state();
        let err = post_ingest(State(state), Bytes::from_static(b"Timestamp\nnope\n"))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        workers.abort();
    }

    #[tokio::test]
    async fn ingest_start_and_clear() {
        let (state, workers, store) = state();
        let Json(summary) = post_ingest(State(state.clone()), Bytes::from_static(BODY.as_bytes()))
            .await
            .unwrap();
        assert_eq!(summary.loaded, 2);

        let Json(started) = post_start(State(state.clone())).await.unwrap();
        assert_eq!(started.state, SchedulerState::Steady);
        assert_eq!(store.len(), 2);

        let Json(status) = get_status(State(state.clone())).await;
        assert_eq!(status.audit.saved_direct, 2);

        let Json(cleared) = delete_data(State(state)).await.unwrap();
        assert_eq!(cleared.purged, 2);
        assert_eq!(store.len(), 0);
        workers.abort();
    }

    #[tokio::test]
    async fn full_report_is_missing_until_generated() {
        let (state, workers, _) = state();
        let err = get_full_report(State(state)).await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        workers.abort();
    }
}
