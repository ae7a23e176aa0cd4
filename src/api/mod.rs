//! HTTP surface for the transcription service.
//!
//! Thin glue over the [`JobManager`]: upload validation and job status
//! lookups. Routes are built as a fragment with state applied, merged and
//! served by [`server::ApiServer`]. Generated artifacts are served
//! statically from the storage root under `/results`.

pub mod server;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::job::{Job, JobManager, JobOptions, JobStatus};

/// Chunk-independent slack on top of the configured upload cap, covering
/// multipart framing and option fields.
const BODY_LIMIT_SLACK: usize = 1024 * 1024;

/// Shared state for the API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<JobManager>,
    pub config: Arc<Config>,
}

/// Build the service router with all routes and middleware applied.
pub fn router(state: ApiState) -> Router {
    let results = ServeDir::new(&state.config.storage_dir);
    let body_limit = state.config.max_file_bytes() as usize + BODY_LIMIT_SLACK;
    Router::new()
        .route("/api/jobs", post(create_job))
        .route("/api/jobs/{job_id}", get(job_status))
        .route("/healthz", get(healthz))
        .nest_service("/results", results)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct JobCreateResponse {
    job_id: String,
}

#[derive(Debug, Serialize)]
struct ArtifactUrls {
    pdf: Option<String>,
    musicxml: Option<String>,
    midi: Option<String>,
}

#[derive(Debug, Serialize)]
struct JobStatusResponse {
    status: JobStatus,
    progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    urls: ArtifactUrls,
    #[serde(skip_serializing_if = "Option::is_none")]
    meta: Option<crate::job::JobMeta>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    detail: String,
}

fn bad_request(detail: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            detail: detail.into(),
        }),
    )
        .into_response()
}

fn status_payload(job: &Job) -> JobStatusResponse {
    let url_for = |kind| {
        job.artifacts.get(&kind).and_then(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|name| format!("/results/{}/{}", job.id, name))
        })
    };
    JobStatusResponse {
        status: job.status,
        progress: job.progress,
        error: job.error.clone(),
        urls: ArtifactUrls {
            pdf: url_for(crate::job::ArtifactKind::Pdf),
            musicxml: url_for(crate::job::ArtifactKind::Musicxml),
            midi: url_for(crate::job::ArtifactKind::Midi),
        },
        meta: job.meta.clone(),
    }
}

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn job_status(State(state): State<ApiState>, Path(job_id): Path<String>) -> Response {
    // Opportunistic reclamation keeps lookups from resurrecting expired
    // jobs between cleanup ticks.
    state.manager.cleanup_expired().await;
    match state.manager.get(&job_id).await {
        Some(job) => Json(status_payload(&job)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                detail: "Job not found".to_string(),
            }),
        )
            .into_response(),
    }
}

/// Option fields accumulated while walking the multipart body.
#[derive(Default)]
struct OptionsForm {
    options: JobOptions,
}

impl OptionsForm {
    fn apply(&mut self, name: &str, value: &str) -> Result<(), String> {
        let value = value.trim();
        match name {
            "clef" => {
                if !value.is_empty() {
                    self.options.clef = value.parse()?;
                }
            }
            "instrument" => {
                if !value.is_empty() {
                    self.options.instrument = value.parse()?;
                }
            }
            "tempo" => {
                if !value.is_empty() {
                    let tempo: u32 = value
                        .parse()
                        .map_err(|_| format!("invalid tempo: {value}"))?;
                    self.options.tempo = Some(tempo);
                }
            }
            "force_key" => {
                if !value.is_empty() {
                    self.options.force_key = Some(value.to_string());
                }
            }
            "detect_time_signature" => {
                self.options.detect_time_signature = parse_bool(value, true);
            }
            "quantization" => {
                if !value.is_empty() {
                    self.options.quantization = value.parse()?;
                }
            }
            "loose_quantization" => {
                self.options.loose_quantization = parse_bool(value, false);
            }
            other => {
                tracing::debug!("ignoring unknown form field {other}");
            }
        }
        Ok(())
    }
}

fn parse_bool(value: &str, default: bool) -> bool {
    if value.is_empty() {
        return default;
    }
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

async fn create_job(State(state): State<ApiState>, mut multipart: Multipart) -> Response {
    let mut form = OptionsForm::default();
    let mut allocated: Option<Job> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                if let Some(job) = allocated.take() {
                    state.manager.discard(&job.id).await;
                }
                return bad_request(format!("malformed multipart body: {e}"));
            }
        };
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };

        if name == "file" {
            if let Some(job) = allocated.take() {
                state.manager.discard(&job.id).await;
                return bad_request("duplicate file field");
            }
            match accept_upload(&state, field, form.options.clone()).await {
                Ok(job) => allocated = Some(job),
                Err(response) => return response,
            }
        } else {
            if allocated.is_some() {
                // Options are immutable once the job exists.
                tracing::warn!("ignoring option field {name} after file part");
                continue;
            }
            let value = match field.text().await {
                Ok(value) => value,
                Err(e) => return bad_request(format!("unreadable form field {name}: {e}")),
            };
            if let Err(reason) = form.apply(&name, &value) {
                return bad_request(reason);
            }
        }
    }

    let Some(job) = allocated else {
        return bad_request("Missing file upload");
    };
    let job_id = job.id.clone();
    state.manager.enqueue(job).await;
    (StatusCode::CREATED, Json(JobCreateResponse { job_id })).into_response()
}

/// Allocate a job for the parsed options and stream the file field into
/// its workdir, validating as bytes arrive. Any rejection discards the
/// allocated job so nothing half-uploaded survives.
async fn accept_upload(
    state: &ApiState,
    mut field: axum::extract::multipart::Field<'_>,
    options: JobOptions,
) -> Result<Job, Response> {
    let file_name = field.file_name().unwrap_or("audio").to_string();

    let declared_mime = field
        .content_type()
        .map(str::to_string)
        .or_else(|| mime_guess::from_path(&file_name).first_raw().map(str::to_string));
    if let Some(mime) = &declared_mime {
        if !state.config.accepts_mime(mime) {
            return Err(bad_request("Unsupported file type"));
        }
    }

    let suffix = std::path::Path::new(&file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_else(|| ".wav".to_string());

    let job = match state.manager.allocate(options).await {
        Ok(job) => job,
        Err(e) => {
            tracing::error!("failed to allocate job: {e}");
            return Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    detail: "failed to allocate job".to_string(),
                }),
            )
                .into_response());
        }
    };
    let upload_path = job.workdir.join(format!("upload{suffix}"));

    match stream_to_disk(state, &mut field, &upload_path).await {
        Ok(()) => Ok(job),
        Err(response) => {
            let _ = tokio::fs::remove_file(&upload_path).await;
            state.manager.discard(&job.id).await;
            Err(response)
        }
    }
}

async fn stream_to_disk(
    state: &ApiState,
    field: &mut axum::extract::multipart::Field<'_>,
    upload_path: &std::path::Path,
) -> Result<(), Response> {
    let max_bytes = state.config.max_file_bytes();
    let mut destination = tokio::fs::File::create(upload_path)
        .await
        .map_err(|e| internal(format!("failed to open upload destination: {e}")))?;

    let mut written: u64 = 0;
    loop {
        let chunk = match field.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => return Err(bad_request(format!("upload interrupted: {e}"))),
        };
        written += chunk.len() as u64;
        if written > max_bytes {
            return Err(bad_request(format!(
                "File exceeds maximum allowed size of {}MB",
                state.config.max_file_mb
            )));
        }
        destination
            .write_all(&chunk)
            .await
            .map_err(|e| internal(format!("failed to write upload: {e}")))?;
    }
    destination
        .flush()
        .await
        .map_err(|e| internal(format!("failed to flush upload: {e}")))?;

    if written == 0 {
        return Err(bad_request("Uploaded file is empty"));
    }

    validate_duration(state, upload_path).await
}

/// Reject WAV uploads longer than the configured ceiling. Non-WAV inputs
/// (and WAVs the probe cannot parse) defer to the pipeline's decoder.
async fn validate_duration(
    state: &ApiState,
    upload_path: &std::path::Path,
) -> Result<(), Response> {
    if upload_path.extension().and_then(|e| e.to_str()) != Some("wav") {
        return Ok(());
    }
    let path = upload_path.to_path_buf();
    let probed = tokio::task::spawn_blocking(move || crate::pipeline::audio::probe_wav(&path))
        .await
        .map_err(|e| internal(format!("duration probe panicked: {e}")))?;
    match probed {
        Ok(info) if info.duration_seconds > state.config.max_duration_seconds as f64 => {
            Err(bad_request(format!(
                "Audio duration exceeds limit of {} seconds",
                state.config.max_duration_seconds
            )))
        }
        Ok(_) => Ok(()),
        Err(e) => {
            tracing::debug!("duration probe failed, deferring to pipeline: {e}");
            Ok(())
        }
    }
}

fn internal(detail: String) -> Response {
    tracing::error!("{detail}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse { detail }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use std::path::Path as StdPath;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, header};
    use tempfile::tempdir;
    use tower::ServiceExt;

    use super::*;
    use crate::config::EngraverKind;
    use crate::job::store::JobStore;
    use crate::pipeline::{NullProcessor, TranscriptionPipeline, audio};

    fn test_state(root: &StdPath, real_pipeline: bool) -> ApiState {
        let config = Config {
            storage_dir: root.to_path_buf(),
            engraver: EngraverKind::Placeholder,
            ..Config::default()
        };
        let store = JobStore::new(root).unwrap();
        let processor: Arc<dyn crate::pipeline::Processor> = if real_pipeline {
            Arc::new(TranscriptionPipeline::new(&config))
        } else {
            Arc::new(NullProcessor)
        };
        ApiState {
            manager: Arc::new(JobManager::new(&config, store, processor)),
            config: Arc::new(config),
        }
    }

    fn multipart_body(boundary: &str, fields: &[(&str, &str)], file: Option<&[u8]>) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        if let Some(data) = file {
            body.extend_from_slice(
                format!(
                    "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; \
                     filename=\"take.wav\"\r\nContent-Type: audio/wav\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
        body
    }

    fn upload_request(boundary: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/jobs")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn response_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn audible_wav() -> Vec<u8> {
        let samples: Vec<i16> = (0..22_050)
            .map(|i| ((i as f32 * 0.07).sin() * 10_000.0) as i16)
            .collect();
        audio::tests::pcm16_wav(&samples, 22_050, 1)
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path(), false);
        let app = router(state.clone());

        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await["status"], "ok");

        state.manager.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_job_is_404() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path(), false);
        let app = router(state.clone());

        let response = app
            .oneshot(
                Request::get("/api/jobs/no-such-job")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        state.manager.shutdown().await;
    }

    #[tokio::test]
    async fn unsupported_mime_is_rejected_without_residue() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path(), false);
        let app = router(state.clone());

        let boundary = "testboundary1";
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; \
                 filename=\"movie.mp4\"\r\nContent-Type: video/mp4\r\n\r\nabcd\r\n--{boundary}--\r\n"
            )
            .as_bytes(),
        );
        let response = app.oneshot(upload_request(boundary, body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // No job record may survive a rejected upload.
        let store = JobStore::new(dir.path()).unwrap();
        assert!(store.list().unwrap().is_empty());

        state.manager.shutdown().await;
    }

    #[tokio::test]
    async fn empty_upload_is_rejected_and_discarded() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path(), false);
        let app = router(state.clone());

        let boundary = "testboundary2";
        let body = multipart_body(boundary, &[("clef", "bass")], Some(b""));
        let response = app.oneshot(upload_request(boundary, body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response_json(response).await["detail"],
            "Uploaded file is empty"
        );

        let store = JobStore::new(dir.path()).unwrap();
        assert!(store.list().unwrap().is_empty());

        state.manager.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_option_is_rejected_before_allocation() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path(), false);
        let app = router(state.clone());

        let boundary = "testboundary3";
        let body = multipart_body(
            boundary,
            &[("clef", "lute")],
            Some(&audible_wav()),
        );
        let response = app.oneshot(upload_request(boundary, body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let store = JobStore::new(dir.path()).unwrap();
        assert!(store.list().unwrap().is_empty());

        state.manager.shutdown().await;
    }

    #[tokio::test]
    async fn missing_file_field_is_rejected() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path(), false);
        let app = router(state.clone());

        let boundary = "testboundary4";
        let body = multipart_body(boundary, &[("clef", "treble")], None);
        let response = app.oneshot(upload_request(boundary, body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        state.manager.shutdown().await;
    }

    #[tokio::test]
    async fn upload_runs_to_done_with_artifact_urls() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path(), true);
        let app = router(state.clone());

        let boundary = "testboundary5";
        let body = multipart_body(
            boundary,
            &[("clef", "treble"), ("tempo", "120"), ("quantization", "eighth")],
            Some(&audible_wav()),
        );
        let response = app
            .clone()
            .oneshot(upload_request(boundary, body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = response_json(response).await;
        let job_id = created["job_id"].as_str().unwrap().to_string();

        state.manager.wait_idle().await;

        let response = app
            .oneshot(
                Request::get(format!("/api/jobs/{job_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let payload = response_json(response).await;
        assert_eq!(payload["status"], "done");
        assert_eq!(payload["progress"], 100);
        assert_eq!(
            payload["urls"]["pdf"],
            format!("/results/{job_id}/score.pdf")
        );
        assert_eq!(
            payload["urls"]["midi"],
            format!("/results/{job_id}/transcription.mid")
        );
        assert_eq!(payload["meta"]["note_count"], 8);
        assert!(payload.get("error").is_none());

        state.manager.shutdown().await;
    }

    #[tokio::test]
    async fn status_payload_reports_error_jobs() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path(), true);
        let app = router(state.clone());

        // Silent audio passes upload validation (peak is a pipeline
        // concern) and fails during processing.
        let silent = audio::tests::pcm16_wav(&vec![0i16; 22_050], 22_050, 1);
        let boundary = "testboundary6";
        let body = multipart_body(boundary, &[], Some(&silent));
        let response = app
            .clone()
            .oneshot(upload_request(boundary, body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let job_id = response_json(response).await["job_id"]
            .as_str()
            .unwrap()
            .to_string();

        state.manager.wait_idle().await;

        let response = app
            .oneshot(
                Request::get(format!("/api/jobs/{job_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let payload = response_json(response).await;
        assert_eq!(payload["status"], "error");
        assert!(
            payload["error"]
                .as_str()
                .unwrap()
                .contains("silent")
        );

        state.manager.shutdown().await;
    }

    #[tokio::test]
    async fn overlong_wav_is_rejected() {
        let dir = tempdir().unwrap();
        let mut state = test_state(dir.path(), false);
        // Tighten the ceiling instead of uploading five minutes of audio.
        let mut config = (*state.config).clone();
        config.max_duration_seconds = 1;
        state.config = Arc::new(config);
        let app = router(state.clone());

        let two_seconds = audio::tests::pcm16_wav(&vec![5_000i16; 16_000], 8_000, 1);
        let boundary = "testboundary7";
        let body = multipart_body(boundary, &[], Some(&two_seconds));
        let response = app.oneshot(upload_request(boundary, body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(
            response_json(response).await["detail"]
                .as_str()
                .unwrap()
                .contains("duration")
        );

        let store = JobStore::new(dir.path()).unwrap();
        assert!(store.list().unwrap().is_empty());

        state.manager.shutdown().await;
    }
}
