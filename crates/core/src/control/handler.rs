use std::collections::BTreeMap;
use std::path::Path as FsPath;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::json;

use crate::compositor::CompositorConfig;
use crate::error::MosaicError;
use crate::registry::ChannelRegistry;
use crate::server::ServerConfig;
use crate::session::{OutputTarget, Protocol, SessionManager, StartRequest};
use crate::sink::SessionArtifact;
use crate::sink::hls::PLAYLIST;

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// State shared by every control route.
#[derive(Clone)]
pub struct ControlState {
    sessions: SessionManager,
    registry: Arc<ChannelRegistry>,
    config: Arc<ServerConfig>,
}

impl ControlState {
    pub fn new(sessions: SessionManager, registry: Arc<ChannelRegistry>, config: Arc<ServerConfig>) -> Self {
        Self {
            sessions,
            registry,
            config,
        }
    }
}

/// Control API routes, ready for [`axum::serve`].
pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/channels", get(api_channels))
        .route("/api/start", post(api_start))
        .route("/api/sessions", get(api_sessions))
        .route("/api/sessions/{id}", get(api_session).delete(api_stop))
        .route("/api/stop/{id}", post(api_stop))
        .route("/sdp/{id}", get(sdp_file))
        .route("/hls/{id}/{file}", get(hls_file))
        .fallback(no_route)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Body of `POST /api/start`. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartBody {
    protocol: Option<String>,
    ip: Option<String>,
    port: Option<PortField>,
    name: Option<String>,
    channels: Option<Vec<String>>,
    /// Seconds.
    ttl: Option<u64>,
    fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    font_size: Option<u32>,
    padding: Option<u32>,
    /// Shorthand for the `c:v` encoder option.
    encoder: Option<String>,
    options: Option<BTreeMap<String, String>>,
}

/// Browsers post the port field as text.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortField {
    Number(u16),
    Text(String),
}

impl PortField {
    fn value(&self) -> Result<u16, MosaicError> {
        match self {
            Self::Number(port) => Ok(*port),
            Self::Text(text) if text.trim().is_empty() => Ok(0),
            Self::Text(text) => text
                .trim()
                .parse()
                .map_err(|_| MosaicError::InvalidTarget(format!("bad port '{text}'"))),
        }
    }
}

fn in_range(field: &str, value: Option<u32>, min: u32, max: u32) -> Result<Option<u32>, MosaicError> {
    match value {
        Some(v) if v < min || v > max => Err(MosaicError::InvalidTarget(format!(
            "{field} must be between {min} and {max}"
        ))),
        other => Ok(other),
    }
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// A [`MosaicError`] on its way out as a JSON error body.
struct ApiError(MosaicError);

impl From<MosaicError> for ApiError {
    fn from(error: MosaicError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        json_error(status_for(&self.0), self.0.to_string())
    }
}

fn status_for(error: &MosaicError) -> StatusCode {
    match error {
        MosaicError::InvalidTarget(_) | MosaicError::InvalidOption(_) | MosaicError::Json(_) => {
            StatusCode::BAD_REQUEST
        }
        MosaicError::ChannelNotFound(_) | MosaicError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        MosaicError::TargetAlreadyActive(_) => StatusCode::CONFLICT,
        MosaicError::SinkStart(_) | MosaicError::StartupTimeout(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Run a session manager call off the async workers. Starting and stopping
/// wait on encoder processes.
async fn blocking<T, F>(call: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, MosaicError> + Send + 'static,
{
    match tokio::task::spawn_blocking(call).await {
        Ok(result) => result.map_err(ApiError),
        Err(e) => Err(ApiError(MosaicError::Io(std::io::Error::other(e)))),
    }
}

fn content_type(file: &str) -> &'static str {
    match FsPath::new(file).extension().and_then(|e| e.to_str()) {
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("ts") => "video/mp2t",
        _ => "application/octet-stream",
    }
}

/// A file name that cannot escape its directory.
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn no_route() -> Response {
    json_error(StatusCode::NOT_FOUND, "no such endpoint")
}

async fn api_channels(State(state): State<ControlState>) -> Json<serde_json::Value> {
    Json(json!({ "channels": state.registry.names() }))
}

async fn api_sessions(State(state): State<ControlState>) -> Json<serde_json::Value> {
    Json(json!({ "sessions": state.sessions.list_sessions() }))
}

async fn api_session(State(state): State<ControlState>, Path(id): Path<String>) -> Response {
    match state.sessions.get_session(&id) {
        Some(session) => Json(session.info()).into_response(),
        None => ApiError(MosaicError::SessionNotFound(id)).into_response(),
    }
}

fn start_request(state: &ControlState, body: StartBody) -> Result<StartRequest, MosaicError> {
    let protocol = match body.protocol.as_deref() {
        Some(p) => p.parse()?,
        None => Protocol::Rtp,
    };

    let mut options = body.options.unwrap_or_default();
    if let Some(encoder) = body.encoder.filter(|e| !e.trim().is_empty()) {
        options.insert("c:v".to_string(), encoder.trim().to_string());
    }

    let target = match protocol {
        Protocol::Rtp => {
            let ip = body
                .ip
                .filter(|ip| !ip.trim().is_empty())
                .ok_or_else(|| MosaicError::InvalidTarget("ip is required".to_string()))?;
            let port = match &body.port {
                Some(field) => match field.value()? {
                    0 => None,
                    port => Some(port),
                },
                None => None,
            };
            // A port inside the ip field wins over the configured default.
            let port = port.or_else(|| (!ip.contains(':')).then_some(state.config.default_rtp_port));
            OutputTarget::rtp(&ip, port)?
        }
        Protocol::Hls => {
            let name = body
                .name
                .ok_or_else(|| MosaicError::InvalidTarget("name is required".to_string()))?;
            OutputTarget::hls(&name)?
        }
        Protocol::Window => OutputTarget::window(),
    };
    let mut target = target.with_options(options);
    if let Some(fps) = in_range("fps", body.fps, 1, 120)? {
        target = target.with_fps(fps);
    }

    let names = body.channels.unwrap_or_default();
    let channels = state.registry.select(&names)?;

    let base = state.sessions.config().compositor.clone();
    let width = in_range("width", body.width, 16, 7680)?;
    let height = in_range("height", body.height, 16, 4320)?;
    let (w, h) = (width.unwrap_or(base.width), height.unwrap_or(base.height));
    if (width.is_some() || height.is_some()) && (w % 2 != 0 || h % 2 != 0) {
        // yuv420p needs even dimensions.
        return Err(MosaicError::InvalidTarget("width and height must be even".to_string()));
    }
    let font_size = in_range("fontSize", body.font_size, 4, 256)?;
    let compositor = (width.is_some() || height.is_some() || font_size.is_some() || body.padding.is_some())
        .then(|| CompositorConfig {
            width: w,
            height: h,
            label_font_size: font_size.unwrap_or(base.label_font_size),
            padding: body.padding.unwrap_or(base.padding),
            ..base
        });

    Ok(StartRequest {
        target,
        channels,
        ttl: body.ttl.filter(|&t| t > 0).map(Duration::from_secs),
        compositor,
    })
}


/// An empty body means every field takes its default.
fn start_body(body: &[u8]) -> Result<StartBody, MosaicError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(StartBody::default());
    }
    Ok(serde_json::from_slice(body)?)
}

async fn api_start(State(state): State<ControlState>, body: Bytes) -> Result<Json<serde_json::Value>, ApiError> {
    let start = start_body(&body).and_then(|body| start_request(&state, body));
    let start = match start {
        Ok(start) => start,
        Err(e) => {
            tracing::debug!(error = %e, "rejected start request");
            return Err(ApiError(e));
        }
    };

    let sessions = state.sessions.clone();
    let session = blocking(move || sessions.start_session(start)).await?;
    let location = match session.artifact() {
        Some(SessionArtifact::Sdp(_)) => Some(format!("/sdp/{}", session.id)),
        Some(SessionArtifact::Playlist(_)) => Some(format!("/hls/{}/{PLAYLIST}", session.id)),
        None => None,
    };
    let info = session.info();
    Ok(Json(json!({
        "session": session.id,
        "location": location,
        "target": info.target,
        "state": info.state,
        "expiresAt": info.expires_at,
    })))
}

async fn api_stop(
    State(state): State<ControlState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let sessions = state.sessions.clone();
    let stopping = id.clone();
    let stopped = blocking(move || sessions.stop_session(&stopping)).await?;
    Ok(Json(json!({ "session": id, "state": stopped })))
}

async fn sdp_file(State(state): State<ControlState>, Path(id): Path<String>) -> Response {
    let artifact = state.sessions.get_session(&id).and_then(|s| s.artifact());
    let Some(SessionArtifact::Sdp(path)) = artifact else {
        return json_error(StatusCode::NOT_FOUND, "SDP not found");
    };
    match tokio::fs::read(&path).await {
        Ok(sdp) => (
            [
                (header::CONTENT_TYPE, "application/sdp"),
                (header::CONTENT_DISPOSITION, "attachment; filename=\"mosaic.sdp\""),
            ],
            sdp,
        )
            .into_response(),
        Err(e) => {
            tracing::warn!(session_id = %id, path = %path.display(), error = %e, "published SDP unreadable");
            json_error(StatusCode::NOT_FOUND, "SDP not found")
        }
    }
}

async fn hls_file(State(state): State<ControlState>, Path((id, file)): Path<(String, String)>) -> Response {
    if !is_plain_file_name(&file) {
        return json_error(StatusCode::BAD_REQUEST, "bad file name");
    }
    let artifact = state.sessions.get_session(&id).and_then(|s| s.artifact());
    let Some(dir) = (match artifact {
        Some(SessionArtifact::Playlist(playlist)) => playlist.parent().map(FsPath::to_path_buf),
        _ => None,
    }) else {
        return json_error(StatusCode::NOT_FOUND, "stream not found");
    };
    match tokio::fs::read(dir.join(&file)).await {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, content_type(&file)),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            bytes,
        )
            .into_response(),
        Err(_) => json_error(StatusCode::NOT_FOUND, "segment not found"),
    }
}

const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head>
  <meta charset="utf-8">
  <title>Mosaic</title>
  <style>
    body { font-family: sans-serif; margin: 20px; background: #111; color: #eee; }
    .panel { background: #1b1b1b; padding: 16px; border-radius: 8px; max-width: 640px; }
    label { display: block; margin-top: 10px; }
    input, select { width: 100%; padding: 8px; border: 1px solid #333; background: #222; color: #eee; }
    select[multiple] { height: 200px; }
    button { margin-top: 16px; padding: 10px 16px; border: none; background: #2d7cf6; color: #fff; }
    #status { margin-top: 12px; }
  </style>
</head>
<body>
  <div class="panel">
    <h2>Start mosaic stream</h2>
    <label>Protocol</label>
    <select id="protocol"><option>rtp</option><option>hls</option></select>
    <label>Receiver IP (rtp)</label>
    <input id="ip" placeholder="192.168.1.50">
    <label>Port (rtp)</label>
    <input id="port" value="5004">
    <label>Stream name (hls)</label>
    <input id="name" placeholder="lobby">
    <label>Channels</label>
    <select id="channels" multiple></select>
    <button onclick="start()">Start</button>
    <div id="status"></div>
  </div>
  <script>
    async function loadChannels() {
      const data = await (await fetch('/api/channels')).json();
      const sel = document.getElementById('channels');
      (data.channels || []).forEach(name => sel.add(new Option(name, name)));
    }
    async function start() {
      const v = id => document.getElementById(id).value.trim();
      const channels = Array.from(document.getElementById('channels').selectedOptions).map(o => o.value);
      const payload = { protocol: v('protocol'), ip: v('ip'), port: v('port'), name: v('name'), channels };
      const res = await fetch('/api/start', { method: 'POST', headers: { 'Content-Type': 'application/json' }, body: JSON.stringify(payload) });
      const data = await res.json();
      const status = document.getElementById('status');
      if (!res.ok) { status.textContent = data.error || 'Failed to start.'; return; }
      const url = data.location ? new URL(data.location, window.location.origin).href : '';
      status.innerHTML = 'Started session ' + data.session + (url ? ' <a href="' + url + '">' + url + '</a>' : '');
    }
    loadChannels();
  </script>
</body>
</html>
"#;
