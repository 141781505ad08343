use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::{
    AuditAction, AuditEntry, AuditLog, AuditQuery, BatchReport, DailyCloseout, PersistenceError,
    Policy, PolicySettings, PolicyStore, RescheduleError, RescheduleOutcome, Rescheduler,
    ScheduleStatus, StudentId, TriggerError, TriggerSchedule,
};

#[derive(Clone)]
pub struct AppState {
    engine: Arc<Rescheduler>,
    schedule: TriggerSchedule,
    workers: usize,
}

impl AppState {
    pub fn new(engine: Rescheduler, schedule: TriggerSchedule) -> Self {
        Self::with_shared(Arc::new(engine), schedule)
    }

    pub fn with_shared(engine: Arc<Rescheduler>, schedule: TriggerSchedule) -> Self {
        Self {
            engine,
            schedule,
            workers: 0,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    fn engine(&self) -> Arc<Rescheduler> {
        self.engine.clone()
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

#[derive(Debug)]
enum ApiError {
    NotFound(String),
    Conflict(String),
    Invalid(String),
    Unprocessable(String),
    Internal(String),
}

#[derive(Debug, Deserialize)]
struct ClosePayload {
    date: NaiveDate,
}

#[derive(Debug, Deserialize)]
struct AuditParams {
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    action: Option<AuditAction>,
    limit: Option<u32>,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        ApiError::Internal(message.into())
    }
}

impl From<PersistenceError> for ApiError {
    fn from(value: PersistenceError) -> Self {
        match value {
            PersistenceError::NotFound(_) => ApiError::NotFound(value.to_string()),
            PersistenceError::InvalidPolicy(_) | PersistenceError::InvalidData(_) => {
                ApiError::Invalid(value.to_string())
            }
            PersistenceError::Busy(_) => ApiError::Conflict(value.to_string()),
            _ => ApiError::Internal(value.to_string()),
        }
    }
}

impl From<RescheduleError> for ApiError {
    fn from(value: RescheduleError) -> Self {
        match value {
            RescheduleError::HorizonExceeded(_) => ApiError::Unprocessable(value.to_string()),
            RescheduleError::TransactionConflict { .. } => ApiError::Conflict(value.to_string()),
            RescheduleError::Persistence(err) => ApiError::from(err),
        }
    }
}

impl From<TriggerError> for ApiError {
    fn from(value: TriggerError) -> Self {
        match value {
            TriggerError::Persistence(err) => ApiError::from(err),
            TriggerError::Workers(err) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(value: tokio::task::JoinError) -> Self {
        ApiError::internal(format!("worker task failed: {value}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, "not_found", message),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, "conflict", message),
            ApiError::Invalid(message) => (StatusCode::BAD_REQUEST, "invalid_request", message),
            ApiError::Unprocessable(message) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "unprocessable", message)
            }
            ApiError::Internal(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
            }
        };
        (status, Json(ErrorBody { error, message })).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/schedule/status", get(schedule_status))
        .route("/closeout", post(close_out_all))
        .route("/students/:id/reschedule", post(reschedule_student))
        .route("/students/:id/policy", get(get_policy).put(update_policy))
        .route("/students/:id/audit", get(list_audit))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

/// Drives the automatic closeout from a tokio timer. Returns `None` when
/// the schedule is disabled.
pub fn spawn_daily_trigger(state: AppState) -> Option<JoinHandle<()>> {
    if !state.schedule.enabled {
        return None;
    }
    Some(tokio::spawn(async move {
        loop {
            let now = Local::now().naive_local();
            let Some(next) = state.schedule.next_run_after(now) else {
                break;
            };
            info!(next_run = %next, "daily closeout scheduled");
            let wait = (next - now).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            let date = TriggerSchedule::closing_date(next);
            let engine = state.engine();
            let workers = state.workers;
            let result = tokio::task::spawn_blocking(move || {
                DailyCloseout::new(&engine).with_workers(workers).run(date)
            })
            .await;
            match result {
                Ok(Ok(report)) => info!(summary = %report.to_cli_summary(), "daily closeout done"),
                Ok(Err(err)) => error!(%date, error = %err, "daily closeout failed"),
                Err(err) => error!(%date, error = %err, "daily closeout worker panicked"),
            }
        }
    }))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn schedule_status(State(state): State<AppState>) -> Json<ScheduleStatus> {
    Json(state.schedule.status(Local::now().naive_local()))
}

async fn close_out_all(
    State(state): State<AppState>,
    Json(payload): Json<ClosePayload>,
) -> Result<Json<BatchReport>, ApiError> {
    let engine = state.engine();
    let workers = state.workers;
    let report = tokio::task::spawn_blocking(move || {
        DailyCloseout::new(&engine)
            .with_workers(workers)
            .run(payload.date)
    })
    .await??;
    Ok(Json(report))
}

async fn reschedule_student(
    State(state): State<AppState>,
    Path(student_id): Path<StudentId>,
    Json(payload): Json<ClosePayload>,
) -> Result<Json<RescheduleOutcome>, ApiError> {
    let engine = state.engine();
    let outcome =
        tokio::task::spawn_blocking(move || engine.reschedule(student_id, payload.date)).await??;
    Ok(Json(outcome))
}

async fn get_policy(
    State(state): State<AppState>,
    Path(student_id): Path<StudentId>,
) -> Result<Json<Policy>, ApiError> {
    let engine = state.engine();
    let policy = tokio::task::spawn_blocking(move || {
        let defaults = engine.default_policy();
        engine
            .store()
            .read(|repo| repo.policy_or(student_id, defaults))
    })
    .await??;
    Ok(Json(policy))
}

async fn update_policy(
    State(state): State<AppState>,
    Path(student_id): Path<StudentId>,
    Json(settings): Json<PolicySettings>,
) -> Result<Json<Policy>, ApiError> {
    let policy = settings.for_student(student_id);
    let engine = state.engine();
    let stored = tokio::task::spawn_blocking(move || {
        engine.store().write(|repo| {
            repo.upsert_policy(&policy)?;
            repo.find_policy(student_id)?
                .ok_or_else(|| PersistenceError::NotFound(format!("policy {student_id}")))
        })
    })
    .await??;
    Ok(Json(stored))
}

async fn list_audit(
    State(state): State<AppState>,
    Path(student_id): Path<StudentId>,
    Query(params): Query<AuditParams>,
) -> Result<Json<Vec<AuditEntry>>, ApiError> {
    let query = AuditQuery {
        student_id,
        from: params.from,
        to: params.to,
        action: params.action,
        limit: params.limit,
    };
    let engine = state.engine();
    let entries =
        tokio::task::spawn_blocking(move || engine.store().read(|repo| repo.query_audit(&query)))
            .await??;
    Ok(Json(entries))
}
