//! HTTP route handlers for the run API.

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use healer::core::branch::generate_branch_name;
use healer::core::types::{CiStatus, FailureRecord};
use healer::heal::{HealRequest, new_run_id};
use healer::io::run_record::RunRecord;
use healer::progress::{FixSummary, RunStatus, fix_summaries};
use serde::{Deserialize, Serialize};

use crate::pipeline::spawn_run;
use crate::state::{AppState, RunEntry};

/// Log lines included in list and status views.
const VIEW_LOG_TAIL: usize = 10;
const DEFAULT_LIST_LIMIT: usize = 20;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/runs", get(list_runs).post(create_run))
        .route("/runs/{run_id}", get(get_run))
        .route("/runs/{run_id}/status", get(get_status))
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
pub struct CreateRun {
    pub repo_url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    pub team_id: Option<String>,
    pub team_name: Option<String>,
    pub leader_name: Option<String>,
    pub max_retries: Option<u32>,
}

fn default_branch() -> String {
    "main".to_string()
}

/// Status view of one run. `status` is `UNKNOWN` for ids the server has never seen.
#[derive(Debug, Serialize)]
pub struct StatusView {
    pub run_id: String,
    pub status: String,
    pub progress: u8,
    pub current_step: String,
    pub iteration: u32,
    pub failures_detected: Vec<FailureRecord>,
    pub fixes_applied: Vec<FixSummary>,
    pub logs: Vec<String>,
    pub ci_status: CiStatus,
    pub score: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn status_label(status: RunStatus) -> String {
    serde_json::to_value(status)
        .ok()
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_else(|| "UNKNOWN".to_string())
}

impl StatusView {
    fn from_entry(entry: &RunEntry) -> Self {
        let state = &entry.state;
        let tail = state.logs.len().saturating_sub(VIEW_LOG_TAIL);
        Self {
            run_id: state.run_id.clone(),
            status: status_label(entry.status),
            progress: entry.progress,
            current_step: entry.current_step.clone(),
            iteration: state.iteration,
            failures_detected: state.failures.clone(),
            fixes_applied: fix_summaries(state),
            logs: state.logs[tail..].to_vec(),
            ci_status: state.ci_status,
            score: state.score,
            error: entry.error.clone(),
        }
    }

    fn unknown(run_id: String) -> Self {
        Self {
            run_id,
            status: "UNKNOWN".to_string(),
            progress: 0,
            current_step: "No pipeline found".to_string(),
            iteration: 0,
            failures_detected: Vec::new(),
            fixes_applied: Vec::new(),
            logs: Vec::new(),
            ci_status: CiStatus::Pending,
            score: None,
            error: None,
        }
    }
}

/// Full view: status plus the run record and every log line.
#[derive(Debug, Serialize)]
struct RunView {
    #[serde(flatten)]
    status: StatusView,
    record: RunRecord,
    all_logs: Vec<String>,
}

/// POST /api/runs - submit a run; answers with its initial status.
async fn create_run(
    State(app): State<AppState>,
    Json(body): Json<CreateRun>,
) -> Result<(StatusCode, Json<StatusView>), (StatusCode, String)> {
    if body.repo_url.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "repo_url is required".to_string()));
    }
    let team_name = body
        .team_name
        .or(body.team_id)
        .unwrap_or_else(|| "default_team".to_string());
    let leader_name = body.leader_name.unwrap_or_else(|| "admin".to_string());
    if let Err(err) = generate_branch_name(&team_name, &leader_name) {
        return Err((StatusCode::BAD_REQUEST, err.to_string()));
    }

    let request = HealRequest {
        run_id: new_run_id(),
        repo_url: body.repo_url.trim().to_string(),
        source_branch: Some(body.branch).filter(|branch| !branch.trim().is_empty()),
        team_name,
        leader_name,
        max_retries: body.max_retries.unwrap_or(app.config.max_retries),
    };
    let run_id = request.run_id.clone();
    spawn_run(&app, request);

    let view = app
        .get(&run_id)
        .map(|entry| StatusView::from_entry(&entry))
        .unwrap_or_else(|| StatusView::unknown(run_id));
    Ok((StatusCode::ACCEPTED, Json(view)))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct RunsResponse {
    runs: Vec<StatusView>,
}

/// GET /api/runs - newest runs first.
async fn list_runs(
    State(app): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<RunsResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    let runs = app
        .recent(limit)
        .iter()
        .map(StatusView::from_entry)
        .collect();
    Json(RunsResponse { runs })
}

/// GET /api/runs/{run_id} - full run view.
async fn get_run(
    State(app): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunView>, StatusCode> {
    let entry = app.get(&run_id).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(RunView {
        status: StatusView::from_entry(&entry),
        record: RunRecord::from_state(&entry.state),
        all_logs: entry.state.logs.clone(),
    }))
}

/// GET /api/runs/{run_id}/status - status view; unknown ids are not an error.
async fn get_status(State(app): State<AppState>, Path(run_id): Path<String>) -> Json<StatusView> {
    let view = match app.get(&run_id) {
        Some(entry) => StatusView::from_entry(&entry),
        None => StatusView::unknown(run_id),
    };
    Json(view)
}

#[cfg(test)]
mod tests {
    use healer::io::config::HealerConfig;

    use super::*;

    fn pending(app: &AppState, run_id: &str) {
        app.register(&HealRequest {
            run_id: run_id.to_string(),
            repo_url: "https://github.com/o/r".to_string(),
            source_branch: None,
            team_name: "team".to_string(),
            leader_name: "lead".to_string(),
            max_retries: 3,
        });
    }

    #[tokio::test]
    async fn unknown_run_status_is_not_an_error() {
        let app = AppState::new(HealerConfig::default());
        let Json(view) = get_status(State(app), Path("run_missing".to_string())).await;
        assert_eq!(view.status, "UNKNOWN");
        assert_eq!(view.current_step, "No pipeline found");
        assert_eq!(view.progress, 0);
    }

    #[tokio::test]
    async fn registered_run_reports_pending() {
        let app = AppState::new(HealerConfig::default());
        pending(&app, "run_a");
        let Json(view) = get_status(State(app), Path("run_a".to_string())).await;
        assert_eq!(view.status, "PENDING");
        assert_eq!(view.logs, vec!["Pipeline started for https://github.com/o/r"]);
    }

    #[tokio::test]
    async fn full_view_of_missing_run_is_not_found() {
        let app = AppState::new(HealerConfig::default());
        let result = get_run(State(app), Path("run_missing".to_string())).await;
        assert_eq!(result.err(), Some(StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn list_honors_limit() {
        let app = AppState::new(HealerConfig::default());
        for id in ["run_a", "run_b", "run_c"] {
            pending(&app, id);
        }
        let Json(response) = list_runs(State(app), Query(ListQuery { limit: Some(2) })).await;
        assert_eq!(response.runs.len(), 2);
    }

    #[tokio::test]
    async fn blank_repo_is_rejected() {
        let app = AppState::new(HealerConfig::default());
        let body = CreateRun {
            repo_url: "  ".to_string(),
            branch: default_branch(),
            team_id: None,
            team_name: None,
            leader_name: None,
            max_retries: None,
        };
        let result = create_run(State(app), Json(body)).await;
        assert_eq!(
            result.err().map(|(status, _)| status),
            Some(StatusCode::BAD_REQUEST)
        );
    }

    #[test]
    fn status_labels_are_uppercase() {
        assert_eq!(status_label(RunStatus::Running), "RUNNING");
        assert_eq!(status_label(RunStatus::Completed), "COMPLETED");
    }
}
