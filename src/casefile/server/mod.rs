// SPDX-License-Identifier: MIT

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::backend::error::{BackendError, CasefileError, PipelineError};
use crate::casefile::app::App;
use crate::casefile::workflow::graph::{RunRequest, DOCUMENT_TEXT};

/// How often the session sweeper runs
const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// Error body plus status code
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl From<CasefileError> for ApiError {
    fn from(err: CasefileError) -> Self {
        let status = match &err {
            CasefileError::Pipeline(e) => match e {
                PipelineError::UnknownTask(_) | PipelineError::MissingDocument(_) => {
                    StatusCode::BAD_REQUEST
                }
                PipelineError::SessionBusy(_) => StatusCode::CONFLICT,
                PipelineError::SessionNotFound(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            CasefileError::Backend(BackendError::UnreadableDocument(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            log::error!("Request failed: {}", err);
        }
        Self::new(status, err.to_string())
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        CasefileError::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/tasks", get(list_tasks))
        .route("/api/sessions/{session}/jobs", post(submit_job))
        .route(
            "/api/sessions/{session}",
            axum::routing::delete(reset_session),
        )
        .route("/api/sessions/{session}/result", get(session_result))
        .route("/api/sessions/{session}/export", get(export_session))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/events", get(job_events))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app)
}

pub async fn serve(app: Arc<App>, port: u16, session_ttl: Option<Duration>) -> Result<(), CasefileError> {
    if let Some(ttl) = session_ttl {
        spawn_sweeper(app.clone(), ttl);
    }

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    log::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(app)).await?;

    Ok(())
}

/// Evict idle sessions and finished jobs; sessions with a job in flight stay
fn spawn_sweeper(app: Arc<App>, ttl: Duration) {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let cutoff = chrono::Utc::now() - ttl;
            let busy = app.tracker().active_sessions();
            match app.scheduler().store().expire(cutoff, &busy).await {
                Ok(evicted) if !evicted.is_empty() => {
                    log::info!("Evicted {} idle sessions", evicted.len())
                }
                Ok(_) => {}
                Err(e) => log::error!("Session sweep failed: {}", e),
            }
            let forgotten = app.tracker().forget_finished(cutoff);
            if forgotten > 0 {
                log::debug!("Forgot {} finished jobs", forgotten);
            }
        }
    });
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_tasks(State(app): State<Arc<App>>) -> Json<Value> {
    let def = app.definition();
    let tasks: Vec<Value> = app
        .scheduler()
        .table()
        .specs()
        .iter()
        .map(|spec| {
            let description = def
                .tasks
                .iter()
                .find(|t| t.name == spec.name)
                .map(|t| t.description.as_str())
                .unwrap_or_default();
            json!({
                "name": spec.name,
                "description": description,
                "requires": spec.requires,
                "produces": spec.produces,
                "depends_on": spec.prerequisites,
            })
        })
        .collect();

    Json(json!({
        "pipeline": def.name,
        "fixed": app.scheduler().table().fixed(),
        "tasks": tasks,
    }))
}

#[derive(Debug, Deserialize)]
struct DocumentUpload {
    filename: String,
    content_base64: String,
}

#[derive(Debug, Deserialize)]
struct SubmitJob {
    #[serde(default)]
    tasks: Vec<String>,
    #[serde(default)]
    document: Option<DocumentUpload>,
    #[serde(default)]
    force: bool,
}

fn decode_document(upload: &DocumentUpload) -> Result<Vec<u8>, ApiError> {
    STANDARD.decode(upload.content_base64.trim()).map_err(|e| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("Invalid base64 for {}: {}", upload.filename, e),
        )
    })
}

/// Decode and extract the upload so unreadable documents are a 400, not a failed job
async fn build_request(app: &App, session: String, payload: SubmitJob) -> Result<RunRequest, ApiError> {
    let mut request = RunRequest::new(session.clone(), payload.tasks);
    request.force = payload.force;

    match &payload.document {
        Some(upload) => {
            let bytes = decode_document(upload)?;
            request = request.with_document(upload.filename.clone(), bytes);
            request = app.scheduler().prepare_document(request).await?;
        }
        None => {
            let has_document = app
                .scheduler()
                .snapshot(&session)
                .await?
                .is_some_and(|s| s.state.contains(DOCUMENT_TEXT));
            if !has_document {
                return Err(PipelineError::MissingDocument(session).into());
            }
        }
    }
    Ok(request)
}

async fn submit_job(
    State(app): State<Arc<App>>,
    Path(session): Path<String>,
    Json(payload): Json<SubmitJob>,
) -> Result<impl IntoResponse, ApiError> {
    let request = build_request(&app, session, payload).await?;
    let job_id = app.tracker().submit(request)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job_id }))))
}

async fn get_job(State(app): State<Arc<App>>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    let job = app
        .tracker()
        .poll(&id)
        .ok_or_else(|| ApiError::not_found(format!("Job '{}' not found", id)))?;
    Ok(Json(json!(job)))
}

async fn job_events(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let updates = app
        .tracker()
        .updates(&id)
        .ok_or_else(|| ApiError::not_found(format!("Job '{}' not found", id)))?;

    let stream = updates.map(|job| {
        Ok(Event::default()
            .json_data(&job)
            .unwrap_or_else(|e| Event::default().event("error").data(e.to_string())))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(1))))
}

async fn session_result(
    State(app): State<Arc<App>>,
    Path(session): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let snapshot = app
        .scheduler()
        .snapshot(&session)
        .await?
        .ok_or(PipelineError::SessionNotFound(session))?;
    Ok(Json(json!(snapshot)))
}

async fn export_session(
    State(app): State<Arc<App>>,
    Path(session): Path<String>,
) -> Result<Response, ApiError> {
    let rendered = app.export(&session).await?;
    let filename = app.export_filename(&session, &rendered);
    Ok((
        [
            (header::CONTENT_TYPE, rendered.content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        rendered.bytes,
    )
        .into_response())
}

async fn reset_session(
    State(app): State<Arc<App>>,
    Path(session): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let existed = app.tracker().reset_session(&session).await?;
    Ok(Json(json!({ "session": session, "reset": existed })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::document::PlainTextLoader;
    use crate::casefile::workflow::builder::Pipeline;
    use crate::casefile::workflow::graph::{DocumentContent, SchedulerConfig, TaskSpec, TaskTable};
    use crate::casefile::workflow::loader::PipelineLoader;
    use crate::casefile::workflow::registry::TaskRegistry;
    use crate::casefile::workflow::state::MemoryCheckpointStore;

    fn sample_app() -> App {
        let table = TaskTable::new(
            vec![TaskSpec::new("A").requires(["document_text"]).produces(["a"])],
            vec![],
        )
        .unwrap();
        App::with_parts(
            Pipeline {
                definition: PipelineLoader::parse_yaml("name: sample\ntasks: []\n").unwrap(),
                table: Arc::new(table),
                registry: TaskRegistry::new(),
            },
            Arc::new(MemoryCheckpointStore::new()),
            Arc::new(PlainTextLoader),
            SchedulerConfig::default(),
        )
    }

    fn payload(filename: &str, content: &[u8]) -> SubmitJob {
        SubmitJob {
            tasks: vec!["A".into()],
            document: Some(DocumentUpload {
                filename: filename.into(),
                content_base64: STANDARD.encode(content),
            }),
            force: false,
        }
    }

    #[tokio::test]
    async fn test_build_request_extracts_text() {
        let app = sample_app();
        let request = build_request(&app, "S1".into(), payload("fir.txt", b"  FIR 12/2024\n"))
            .await
            .unwrap();
        let document = request.document.unwrap();
        assert_eq!(document.filename, "fir.txt");
        assert_eq!(document.content, DocumentContent::Text("FIR 12/2024".into()));
    }

    #[tokio::test]
    async fn test_unreadable_upload_rejected_before_submit() {
        let app = sample_app();
        let err = build_request(&app, "S1".into(), payload("fir.pdf", b"%PDF-1.4 binary"))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.message.contains("fir.pdf"));

        let no_document = SubmitJob {
            tasks: vec!["A".into()],
            document: None,
            force: false,
        };
        let err = build_request(&app, "S1".into(), no_document).await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(app.tracker().active_sessions().is_empty());
    }

    #[test]
    fn test_error_status_mapping() {
        let busy: ApiError = PipelineError::SessionBusy("S1".into()).into();
        assert_eq!(busy.status, StatusCode::CONFLICT);

        let unknown: ApiError = PipelineError::UnknownTask("Z".into()).into();
        assert_eq!(unknown.status, StatusCode::BAD_REQUEST);

        let missing: ApiError = PipelineError::SessionNotFound("S9".into()).into();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);

        let unreadable: ApiError =
            CasefileError::from(BackendError::UnreadableDocument("fir.pdf".into())).into();
        assert_eq!(unreadable.status, StatusCode::BAD_REQUEST);

        let store: ApiError = PipelineError::Checkpoint("disk full".into()).into();
        assert_eq!(store.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_submit_payload() {
        let payload: SubmitJob = serde_json::from_value(json!({
            "tasks": ["timeline"],
            "document": {"filename": "fir.txt", "content_base64": "RklSIDEyLzIwMjQ="}
        }))
        .unwrap();
        assert!(!payload.force);
        let bytes = decode_document(payload.document.as_ref().unwrap()).unwrap();
        assert_eq!(bytes, b"FIR 12/2024");

        let bad = DocumentUpload {
            filename: "fir.txt".into(),
            content_base64: "***".into(),
        };
        assert_eq!(decode_document(&bad).unwrap_err().status, StatusCode::BAD_REQUEST);
    }
}
