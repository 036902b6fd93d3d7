//! API route handlers for the gateway.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use std::sync::Arc;
use taskherd_core::error::TaskherdError;
use taskherd_scheduler::{LogLevel, NewTask};

use crate::server::AppState;

type ApiResponse = (StatusCode, Json<serde_json::Value>);

fn ok(mut body: serde_json::Value) -> ApiResponse {
    if let Some(map) = body.as_object_mut() {
        map.insert("ok".into(), serde_json::Value::Bool(true));
    }
    (StatusCode::OK, Json(body))
}

fn fail(status: StatusCode, error: impl std::fmt::Display) -> ApiResponse {
    (status, Json(serde_json::json!({"ok": false, "error": error.to_string()})))
}

fn status_of(err: &TaskherdError) -> StatusCode {
    match err {
        TaskherdError::TaskNotFound(_) | TaskherdError::ReportNotFound(_) => StatusCode::NOT_FOUND,
        TaskherdError::Queue(_) => StatusCode::BAD_GATEWAY,
        e if e.is_user_error() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: TaskherdError) -> ApiResponse {
    let status = status_of(&err);
    if status.is_server_error() {
        tracing::error!("❌ API error: {err}");
    }
    fail(status, err)
}

fn to_json<T: serde::Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

// ---- Health ----

/// Liveness probe.
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "taskherd-gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Queue backend and counters.
pub async fn system_health(State(state): State<Arc<AppState>>) -> ApiResponse {
    let queue = &state.engine.queue;
    ok(serde_json::json!({
        "backend": queue.backend().name(),
        "cancel_failures": queue.cancel_failures(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

// ---- Commands ----

pub async fn list_commands(State(state): State<Arc<AppState>>) -> ApiResponse {
    match state.engine.service.list_commands() {
        Ok(commands) => ok(serde_json::json!({
            "count": commands.len(),
            "commands": to_json(&commands),
        })),
        Err(e) => error_response(e),
    }
}

// ---- Tasks ----

pub async fn list_tasks(State(state): State<Arc<AppState>>) -> ApiResponse {
    match state.engine.service.list_tasks() {
        Ok(tasks) => ok(serde_json::json!({"count": tasks.len(), "tasks": to_json(&tasks)})),
        Err(e) => error_response(e),
    }
}

pub async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewTask>,
) -> ApiResponse {
    match state.engine.service.create_task(body) {
        Ok(task) => ok(serde_json::json!({"id": task.id, "task": to_json(&task)})),
        Err(e) => error_response(e),
    }
}

pub async fn get_task(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResponse {
    match state.engine.service.get_task(id) {
        Ok(task) => ok(serde_json::json!({"task": to_json(&task)})),
        Err(e) => error_response(e),
    }
}

pub async fn delete_task(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResponse {
    match state.engine.service.delete(id).await {
        Ok(()) => ok(serde_json::json!({"id": id})),
        Err(e) => error_response(e),
    }
}

pub async fn launch_task(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResponse {
    match state.engine.service.launch(id).await {
        Ok(task) => ok(serde_json::json!({"task": to_json(&task)})),
        Err(e) => error_response(e),
    }
}

pub async fn stop_task(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResponse {
    match state.engine.service.stop(id).await {
        Ok(task) => ok(serde_json::json!({"task": to_json(&task)})),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct BulkRequest {
    pub ids: Vec<i64>,
}

/// Launch several tasks; each one succeeds or fails on its own.
pub async fn bulk_launch(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BulkRequest>,
) -> ApiResponse {
    let results = state.engine.service.bulk_launch(&body.ids).await;
    ok(serde_json::json!({"results": to_json(&results)}))
}

pub async fn bulk_stop(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BulkRequest>,
) -> ApiResponse {
    let results = state.engine.service.bulk_stop(&body.ids).await;
    ok(serde_json::json!({"results": to_json(&results)}))
}

// ---- Reports ----

pub async fn list_reports(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResponse {
    match state.engine.service.list_reports(id) {
        Ok(reports) => ok(serde_json::json!({
            "count": reports.len(),
            "reports": to_json(&reports),
        })),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct PruneRequest {
    pub keep: usize,
}

pub async fn prune_reports(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<PruneRequest>,
) -> ApiResponse {
    match state.engine.service.prune(id, body.keep) {
        Ok(deleted) => ok(serde_json::json!({"deleted": deleted})),
        Err(e) => error_response(e),
    }
}

pub async fn get_report(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResponse {
    match state.engine.service.report_view(id) {
        Ok(view) => ok(serde_json::json!({"report": to_json(&view)})),
        Err(e) => error_response(e),
    }
}

pub async fn delete_report(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResponse {
    match state.engine.service.delete_report(id) {
        Ok(()) => ok(serde_json::json!({"id": id})),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LinesQuery {
    pub level: Option<String>,
}

/// Formatted log lines, optionally only those of one level.
pub async fn report_lines(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<LinesQuery>,
) -> ApiResponse {
    let level = match query.level.as_deref().filter(|l| !l.is_empty()) {
        Some(raw) => match raw.parse::<LogLevel>() {
            Ok(level) => Some(level),
            Err(e) => return fail(StatusCode::BAD_REQUEST, e),
        },
        None => None,
    };
    match state.engine.service.report_lines(id, level) {
        Ok(lines) => ok(serde_json::json!({"count": lines.len(), "lines": lines})),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PollQuery {
    #[serde(default)]
    pub offset: usize,
}

/// Live log polling: lines past `offset` and the task's current status.
pub async fn poll_log(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<PollQuery>,
) -> ApiResponse {
    match state.engine.service.poll_log(id, query.offset) {
        Ok(poll) => ok(to_json(&poll)),
        Err(e) => error_response(e),
    }
}

/// Plain-text log of a report; the target of notification links.
pub async fn live_log(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> (StatusCode, String) {
    let service = &state.engine.service;
    let view = match service.report_view(id) {
        Ok(view) => view,
        Err(e) => return (status_of(&e), e.to_string()),
    };
    match service.report_lines(id, None) {
        Ok(lines) => {
            let mut body = format!(
                "{} (report {}): {}\n\n",
                view.task_name, id, view.report.invocation_result
            );
            body.push_str(&lines.join("\n"));
            (StatusCode::OK, body)
        }
        Err(e) => (status_of(&e), e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use taskherd_core::config::TaskherdConfig;
    use taskherd_scheduler::dispatch::HttpTransport;
    use taskherd_scheduler::{Engine, MemoryBackend, SchedulerDb, TaskStatus};
    use tower::ServiceExt;

    fn test_state_with(backend: Arc<MemoryBackend>) -> State<Arc<AppState>> {
        let config = TaskherdConfig::default();
        let engine = Engine::assemble(
            &config,
            Arc::new(SchedulerDb::open_in_memory().unwrap()),
            backend,
            Arc::new(HttpTransport::new().unwrap()),
        )
        .unwrap();
        State(Arc::new(AppState::new(&config, Arc::new(engine))))
    }

    fn test_state() -> State<Arc<AppState>> {
        test_state_with(Arc::new(MemoryBackend::new()))
    }

    fn new_task(name: &str, arguments: &str) -> NewTask {
        NewTask {
            name: name.into(),
            command: "emit_logs".into(),
            arguments: arguments.into(),
            category: None,
            note: None,
            scheduling: None,
            repetition_period: None,
            repetition_rate: None,
        }
    }

    async fn created(state: &State<Arc<AppState>>, name: &str, arguments: &str) -> i64 {
        let (status, body) = create_task(state.clone(), Json(new_task(name, arguments))).await;
        assert_eq!(status, StatusCode::OK);
        body.0["id"].as_i64().unwrap()
    }

    async fn run_worker(state: &State<Arc<AppState>>) {
        let worker = state.engine.worker(&TaskherdConfig::default());
        worker.tick().await.unwrap();
        worker.drain().await;
    }

    // ---- Health ----

    #[tokio::test]
    async fn test_health_check() {
        let result = health_check().await;
        assert_eq!(result.0["status"], "ok");
    }

    #[tokio::test]
    async fn test_system_health() {
        let (status, body) = system_health(test_state()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.0["backend"], "memory");
        assert_eq!(body.0["cancel_failures"], 0);
    }

    // ---- Tasks ----

    #[tokio::test]
    async fn test_list_commands_has_builtin() {
        let (_, body) = list_commands(test_state()).await;
        assert_eq!(body.0["ok"], true);
        assert_eq!(body.0["commands"][0]["name"], "emit_logs");
    }

    #[tokio::test]
    async fn test_create_and_get_task() {
        let state = test_state();
        let id = created(&state, "nightly", "--info hi").await;

        let (status, body) = get_task(state.clone(), Path(id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.0["task"]["name"], "nightly");
        assert_eq!(body.0["task"]["status"], "idle");

        let (_, body) = list_tasks(state).await;
        assert_eq!(body.0["count"], 1);
    }

    #[tokio::test]
    async fn test_create_task_unknown_command() {
        let mut task = new_task("x", "");
        task.command = "nope".into();
        let (status, body) = create_task(test_state(), Json(task)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.0["ok"], false);
    }

    #[tokio::test]
    async fn test_get_missing_task_is_404() {
        let (status, body) = get_task(test_state(), Path(99)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.0["error"], "task 99 not found");
    }

    #[tokio::test]
    async fn test_launch_past_schedule_is_400() {
        let state = test_state();
        let mut task = new_task("late", "");
        task.scheduling = Some(chrono::Utc::now() - chrono::Duration::hours(1));
        let (_, body) = create_task(state.clone(), Json(task)).await;
        let id = body.0["id"].as_i64().unwrap();

        let (status, body) = launch_task(state, Path(id)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.0["error"].as_str().unwrap().contains("past"));
    }

    #[tokio::test]
    async fn test_launch_with_queue_down_is_502() {
        let backend = Arc::new(MemoryBackend::new());
        let state = test_state_with(backend.clone());
        let id = created(&state, "t", "").await;

        backend.set_unavailable(true);
        let (status, body) = launch_task(state.clone(), Path(id)).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body.0["ok"], false);

        let (_, body) = get_task(state, Path(id)).await;
        assert_eq!(body.0["task"]["status"], "idle");
    }

    #[tokio::test]
    async fn test_launch_then_stop_scheduled() {
        let state = test_state();
        let mut task = new_task("later", "");
        task.scheduling = Some(chrono::Utc::now() + chrono::Duration::hours(1));
        let (_, body) = create_task(state.clone(), Json(task)).await;
        let id = body.0["id"].as_i64().unwrap();

        let (_, body) = launch_task(state.clone(), Path(id)).await;
        assert_eq!(body.0["task"]["status"], "scheduled");

        let (status, body) = stop_task(state, Path(id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.0["task"]["status"], "idle");
        assert!(body.0["task"]["scheduled_job_id"].is_null());
    }

    #[tokio::test]
    async fn test_bulk_launch_reports_each_task() {
        let state = test_state();
        let id = created(&state, "a", "").await;
        let (status, body) = bulk_launch(state, Json(BulkRequest { ids: vec![id, 404] })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.0["results"][0]["ok"], true);
        assert_eq!(body.0["results"][1]["ok"], false);
    }

    #[tokio::test]
    async fn test_delete_task() {
        let state = test_state();
        let id = created(&state, "gone", "").await;
        let (status, _) = delete_task(state.clone(), Path(id)).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = get_task(state, Path(id)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    // ---- Reports ----

    #[tokio::test]
    async fn test_report_views_after_run() {
        let state = test_state();
        let id = created(&state, "noisy", "--warning careful, --error broken").await;
        launch_task(state.clone(), Path(id)).await;
        run_worker(&state).await;

        let (_, body) = list_reports(state.clone(), Path(id)).await;
        assert_eq!(body.0["count"], 1);
        let report_id = body.0["reports"][0]["id"].as_i64().unwrap();

        let (_, body) = get_report(state.clone(), Path(report_id)).await;
        assert_eq!(body.0["report"]["task_name"], "noisy");
        assert_eq!(body.0["report"]["n_log_errors"], 1);
        assert_eq!(body.0["report"]["n_log_warnings"], 1);

        let (_, body) = report_lines(
            state.clone(),
            Path(report_id),
            Query(LinesQuery { level: Some("error".into()) }),
        )
        .await;
        assert_eq!(body.0["count"], 1);
        assert!(body.0["lines"][0].as_str().unwrap().contains("broken"));

        let (_, body) = poll_log(state.clone(), Path(report_id), Query(PollQuery { offset: 0 })).await;
        let total = body.0["total_log_size"].as_u64().unwrap();
        assert_eq!(total, 2);
        assert_eq!(body.0["task_status"], "idle");

        let (_, body) = poll_log(
            state.clone(),
            Path(report_id),
            Query(PollQuery { offset: total as usize }),
        )
        .await;
        assert_eq!(body.0["new_lines"].as_array().unwrap().len(), 0);

        let (status, text) = live_log(state, Path(report_id)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.starts_with("noisy (report"));
        assert!(text.contains("careful"));
    }

    #[tokio::test]
    async fn test_report_lines_bad_level() {
        let (status, _) = report_lines(
            test_state(),
            Path(1),
            Query(LinesQuery { level: Some("loud".into()) }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_prune_and_delete_report() {
        let state = test_state();
        let id = created(&state, "many", "--info x").await;
        for _ in 0..3 {
            launch_task(state.clone(), Path(id)).await;
            run_worker(&state).await;
        }

        let (_, body) = prune_reports(state.clone(), Path(id), Json(PruneRequest { keep: 1 })).await;
        assert_eq!(body.0["deleted"], 2);

        let (_, body) = list_reports(state.clone(), Path(id)).await;
        let report_id = body.0["reports"][0]["id"].as_i64().unwrap();
        let (status, _) = delete_report(state.clone(), Path(report_id)).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = delete_report(state.clone(), Path(report_id)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let task = state.engine.service.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Idle);
        assert!(task.cache.last_invocation_datetime.is_none());
    }

    // ---- Router ----

    #[tokio::test]
    async fn test_router_serves_health_and_tasks() {
        let app = crate::server::build_router_from_arc(test_state().0);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/tasks")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"name":"via http","command":"emit_logs"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["task"]["name"], "via http");
    }
}
