//! HTTP control API for the speech scheduler.
//!
//! Lets the avatar host submit speech, switch modes, clear the queue and
//! watch status. Runs on 127.0.0.1 (port from config) using axum.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backend::AudioClip;
use crate::scheduler::{
    Completion, Outcome, Payload, PolicyMode, RequestId, RequestState, Scheduler, SchedulerStatus,
};
use crate::synth::SynthesisRequest;

#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Scheduler,
}

// --- Request/Response types ---

#[derive(Deserialize)]
struct SpeakRequest {
    source: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    audio_base64: Option<String>,
    #[serde(default)]
    emotion: Option<String>,
    #[serde(default)]
    voice: Option<String>,
    #[serde(default)]
    speed: Option<f32>,
    #[serde(default)]
    priority: Option<i32>,
    #[serde(default)]
    wait: bool,
}

#[derive(Serialize)]
struct SpeakResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<RequestId>,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    completion: Option<Completion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl SpeakResponse {
    fn queued(id: RequestId) -> Self {
        Self {
            id: Some(id),
            status: "queued".into(),
            completion: None,
            kind: None,
            error: None,
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self {
            id: None,
            status: "error".into(),
            completion: None,
            kind: Some("invalid_request".into()),
            error: Some(message.into()),
        }
    }
}

#[derive(Deserialize)]
struct SetModeRequest {
    mode: PolicyMode,
}

#[derive(Serialize)]
struct SimpleResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<PolicyMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    changed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cleared: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl SimpleResponse {
    fn ok() -> Self {
        Self {
            status: "ok".into(),
            mode: None,
            changed: None,
            cleared: None,
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            status: "error".into(),
            error: Some(message.into()),
            ..Self::ok()
        }
    }
}

/// Build the axum router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/speak", post(handle_speak))
        .route("/mode", post(handle_set_mode))
        .route("/clear", post(handle_clear))
        .route("/requests/{id}", get(handle_lookup))
        .with_state(state)
}

/// Start the API server as a background tokio task.
pub async fn start_api(state: ApiState, port: u16) -> crate::Result<()> {
    let app = router(state);
    let addr = format!("127.0.0.1:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| crate::Error::Http(format!("Failed to bind {addr}: {e}")))?;
    info!("Speech API listening on {addr}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("Speech API server error: {e}");
        }
    });
    Ok(())
}

// --- Handlers ---

async fn handle_status(State(state): State<ApiState>) -> Json<SchedulerStatus> {
    Json(state.scheduler.status())
}

fn build_payload(req: &SpeakRequest) -> Result<Payload, String> {
    match (&req.text, &req.audio_base64) {
        (Some(text), None) => Ok(Payload::Speech(SynthesisRequest {
            text: text.clone(),
            emotion: req.emotion.clone(),
            voice: req.voice.clone(),
            speed: req.speed,
        })),
        (None, Some(encoded)) => base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map(|bytes| Payload::Audio(AudioClip::encoded(bytes)))
            .map_err(|e| format!("invalid audio_base64: {e}")),
        (Some(_), Some(_)) => Err("give either text or audio_base64, not both".into()),
        (None, None) => Err("one of text or audio_base64 is required".into()),
    }
}

async fn handle_speak(
    State(state): State<ApiState>,
    Json(req): Json<SpeakRequest>,
) -> (StatusCode, Json<SpeakResponse>) {
    let payload = match build_payload(&req) {
        Ok(payload) => payload,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(SpeakResponse::invalid(e))),
    };

    info!(
        "HTTP /speak [{}]: {} payload (priority={:?}, wait={})",
        req.source,
        payload.kind(),
        req.priority,
        req.wait,
    );

    let handle = state.scheduler.submit(req.source, payload, req.priority);
    let id = handle.id();
    if !req.wait {
        return (StatusCode::ACCEPTED, Json(SpeakResponse::queued(id)));
    }

    let response = match handle.await {
        Ok(completion) => SpeakResponse {
            id: Some(id),
            status: "success".into(),
            completion: Some(completion),
            kind: None,
            error: None,
        },
        Err(e) => SpeakResponse {
            id: Some(id),
            status: match e.outcome() {
                Outcome::Cancelled => "cancelled".into(),
                _ => "failed".into(),
            },
            completion: None,
            kind: Some(e.kind().into()),
            error: Some(e.to_string()),
        },
    };
    (StatusCode::OK, Json(response))
}

async fn handle_set_mode(
    State(state): State<ApiState>,
    Json(req): Json<SetModeRequest>,
) -> Json<SimpleResponse> {
    let changed = state.scheduler.set_mode(req.mode);
    Json(SimpleResponse {
        mode: Some(req.mode),
        changed: Some(changed),
        ..SimpleResponse::ok()
    })
}

async fn handle_clear(State(state): State<ApiState>) -> Json<SimpleResponse> {
    let cleared = state.scheduler.clear_queue();
    Json(SimpleResponse {
        cleared: Some(cleared),
        ..SimpleResponse::ok()
    })
}

async fn handle_lookup(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<RequestState>, (StatusCode, Json<SimpleResponse>)> {
    let id: RequestId = id
        .parse()
        .map_err(|e| (StatusCode::BAD_REQUEST, Json(SimpleResponse::err(format!("bad id: {e}")))))?;

    state
        .scheduler
        .lookup(id)
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, Json(SimpleResponse::err("unknown or expired request"))))
}
