//! Axum + Askama trigger surface for PayBridge: sync endpoints, progress
//! polling and a small operator dashboard.

use std::path::PathBuf;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use paybridge_core::{EppRateTable, ProgressStatus, SyncRunReport};
use paybridge_source::RecordSource;
use paybridge_sync::{
    run_epp_backfill, run_payment_recalculation, run_payment_sync, write_run_report, BridgeStore,
    ProgressTracker, SyncOptions,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "paybridge-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn BridgeStore>,
    pub source: Arc<dyn RecordSource>,
    pub tracker: ProgressTracker,
    pub rates: EppRateTable,
    pub reports_dir: Option<PathBuf>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn BridgeStore>,
        source: Arc<dyn RecordSource>,
        tracker: ProgressTracker,
        rates: EppRateTable,
        reports_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            store,
            source,
            tracker,
            rates,
            reports_dir,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct SyncRequest {
    #[serde(default)]
    clear_list: bool,
}

#[derive(Debug, Deserialize, Default)]
struct ResetRequest {
    #[serde(default)]
    confirm_delete: bool,
}

#[derive(Debug, Deserialize)]
struct SaveListRequest {
    ids: String,
}

#[derive(Debug, Deserialize, Default)]
struct ClearProblemsRequest {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProgressQuery {
    session_id: String,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    problem_rows: Vec<ProblemRowView>,
    session_rows: Vec<SessionRowView>,
}

struct ProblemRowView {
    id: String,
    reason: String,
    recorded_at: String,
}

struct SessionRowView {
    session_id: String,
    processed: usize,
    total: usize,
    errors: usize,
    status: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/sync/payment-sync", post(payment_sync_handler))
        .route("/sync/payment-recalculate", post(payment_recalculate_handler))
        .route("/sync/epp-backfill", post(epp_backfill_handler))
        .route("/sync/payment-reset", post(payment_reset_handler))
        .route("/sync/payment-save-list", post(payment_save_list_handler))
        .route(
            "/sync/payment-problems",
            get(payment_problems_handler).post(payment_problems_clear_handler),
        )
        .route("/sync/progress", get(progress_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "paybridge web listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn ok(mut payload: serde_json::Value) -> Response {
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("success".to_string(), json!(true));
    }
    Json(payload).into_response()
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "success": false, "error": message.into() })),
    )
        .into_response()
}

fn server_error(error: anyhow::Error) -> Response {
    error!(%error, "request failed");
    failure(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let problems = match state.store.list_problems().await {
        Ok(problems) => problems,
        Err(error) => return server_error(error.into()),
    };
    let sessions = state.tracker.sessions().await;

    let tpl = IndexTemplate {
        problem_rows: problems
            .into_iter()
            .map(|p| ProblemRowView {
                id: p.id.to_string(),
                reason: p.reason,
                recorded_at: p.recorded_at.to_rfc3339(),
            })
            .collect(),
        session_rows: sessions
            .into_iter()
            .map(|s| SessionRowView {
                session_id: s.session_id,
                processed: s.processed,
                total: s.total,
                errors: s.errors,
                status: format!("{:?}", s.status).to_lowercase(),
            })
            .collect(),
    };
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(error) => server_error(anyhow::anyhow!(error.to_string())),
    }
}

/// Spawn the orchestrator in the background and hand the session id back
/// immediately; the caller polls `/sync/progress`. There is no
/// cancellation; a run ends at completion or process exit.
async fn payment_sync_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SyncRequest>,
) -> Response {
    let session_id = format!("sync-{}", Uuid::new_v4());
    // Register before spawning so an immediate poll finds the session.
    state.tracker.create(&session_id, 0).await;

    let task_state = state.clone();
    let task_session = session_id.clone();
    tokio::spawn(async move {
        let started_at = Utc::now();
        let options = SyncOptions {
            clear_list_after: request.clear_list,
            ..Default::default()
        };
        match run_payment_sync(
            task_state.source.as_ref(),
            task_state.store.as_ref(),
            &task_state.tracker,
            &task_session,
            &options,
        )
        .await
        {
            Ok(summary) => {
                info!(
                    session_id = %task_session,
                    updated = summary.updated,
                    skipped = summary.skipped,
                    errored = summary.errored,
                    "payment sync finished"
                );
                if let Some(reports_dir) = &task_state.reports_dir {
                    let report = SyncRunReport {
                        run_id: Uuid::new_v4(),
                        session_id: task_session.clone(),
                        started_at,
                        finished_at: Utc::now(),
                        summary,
                    };
                    if let Err(error) = write_run_report(reports_dir, &report).await {
                        warn!(%error, "failed to write run report");
                    }
                }
            }
            Err(error) => {
                task_state
                    .tracker
                    .finish(&task_session, ProgressStatus::Failed)
                    .await;
                error!(session_id = %task_session, %error, "payment sync failed");
            }
        }
    });

    ok(json!({ "session_id": session_id }))
}

async fn payment_recalculate_handler(State(state): State<Arc<AppState>>) -> Response {
    match run_payment_recalculation(state.store.as_ref()).await {
        Ok(summary) => ok(json!({
            "invoices": summary.invoices,
            "updated": summary.updated,
            "errors": summary.errors,
        })),
        Err(error) => server_error(error),
    }
}

async fn epp_backfill_handler(State(state): State<Arc<AppState>>) -> Response {
    match run_epp_backfill(state.store.as_ref(), &state.rates).await {
        Ok(summary) => ok(json!({
            "updated": summary.updated,
            "skipped": summary.skipped,
            "errors": summary.errors,
            "skips": summary.skips,
        })),
        Err(error) => server_error(error),
    }
}

/// Destructive: refuses before touching anything unless the confirm flag
/// is explicitly set.
async fn payment_reset_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ResetRequest>,
) -> Response {
    if !request.confirm_delete {
        return failure(
            StatusCode::BAD_REQUEST,
            "payment reset requires confirm_delete: true",
        );
    }
    match state.store.reset_payments().await {
        Ok(deleted) => ok(json!({ "deleted": deleted })),
        Err(error) => server_error(error.into()),
    }
}

async fn payment_save_list_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SaveListRequest>,
) -> Response {
    let ids: Vec<paybridge_core::ExternalId> = request
        .ids
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(paybridge_core::ExternalId::from)
        .collect();

    if ids.is_empty() {
        return failure(StatusCode::BAD_REQUEST, "no ids supplied");
    }

    match state.store.save_id_list(&ids).await {
        Ok(()) => ok(json!({ "count": ids.len() })),
        Err(error) => server_error(error.into()),
    }
}

async fn payment_problems_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_problems().await {
        Ok(problems) => ok(json!({ "problems": problems })),
        Err(error) => server_error(error.into()),
    }
}

async fn payment_problems_clear_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ClearProblemsRequest>,
) -> Response {
    let result = match &request.id {
        Some(id) => {
            state
                .store
                .clear_problem(&paybridge_core::ExternalId::from(id.as_str()))
                .await
        }
        None => state.store.clear_problems().await,
    };
    match result {
        Ok(()) => ok(json!({})),
        Err(error) => server_error(error.into()),
    }
}

async fn progress_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProgressQuery>,
) -> Response {
    match state.tracker.get(&query.session_id).await {
        Some(snapshot) => ok(json!({ "progress": snapshot })),
        None => failure(StatusCode::NOT_FOUND, "session not found"),
    }
}
