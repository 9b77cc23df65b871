#![forbid(unsafe_code)]

//! Axum front end over yt-dlp.
//!
//! Every request is independent: the handlers validate form input, hand the
//! URL to the extractor and relay what comes back. The only shared resource is
//! the download directory, and each buffered download only ever touches files
//! carrying its own random stem. Streamed downloads never touch disk; the
//! yt-dlp process lives exactly as long as the response body.

use std::{
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Form, Path as AxumPath, State, rejection::FormRejection},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use chrono::{Datelike, Local};
use futures::{StreamExt, stream};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::{
    fs::File,
    signal::{
        self,
        unix::{SignalKind, signal as unix_signal},
    },
};
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use url::Url;
use vidrelay::{
    artifact::prepare_download_dir,
    config::{Config, ConfigOverrides, DownloadMode, resolve_config},
    extractor::{ExtractorError, YtDlp},
    logging::init_logging,
    media::VideoMetadata,
};

// Landing page; `{{ current_year }}` is filled in per request.
const INDEX_TEMPLATE: &str = include_str!("../../templates/index.html");
const YEAR_PLACEHOLDER: &str = "{{ current_year }}";

// Attachments are always named `video.<ext>`.
const ATTACHMENT_STEM: &str = "video";
const DEFAULT_EXTENSION: &str = "mp4";
const STATIC_SERVE_FAILED: &str = "Could not serve file";

// Files older than this in the download directory belong to a dead process.
const STALE_DOWNLOAD_AGE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Default)]
struct BackendArgs {
    overrides: ConfigOverrides,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    /// Accepts both `--flag value` and `--flag=value`.
    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut overrides = ConfigOverrides::default();
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) if flag.starts_with("--") => {
                    (flag.to_string(), Some(value.to_string()))
                }
                _ => (arg, None),
            };

            match flag.as_str() {
                "--host" => {
                    let value = flag_value(&flag, inline, &mut args)?;
                    parse_host_arg(&value)?;
                    overrides.host = Some(value);
                }
                "--port" => {
                    let value = flag_value(&flag, inline, &mut args)?;
                    overrides.port = Some(parse_port_arg(&value)?);
                }
                "--download-dir" => {
                    let value = flag_value(&flag, inline, &mut args)?;
                    overrides.download_dir = Some(PathBuf::from(value));
                }
                "--static-dir" => {
                    let value = flag_value(&flag, inline, &mut args)?;
                    overrides.static_dir = Some(PathBuf::from(value));
                }
                "--yt-dlp" => {
                    let value = flag_value(&flag, inline, &mut args)?;
                    overrides.yt_dlp_path = Some(PathBuf::from(value));
                }
                "--env-file" => {
                    let value = flag_value(&flag, inline, &mut args)?;
                    overrides.env_path = Some(PathBuf::from(value));
                }
                _ => bail!("unknown argument: {flag}"),
            }
        }

        Ok(Self { overrides })
    }
}

fn flag_value(
    flag: &str,
    inline: Option<String>,
    rest: &mut impl Iterator<Item = String>,
) -> Result<String> {
    inline
        .or_else(|| rest.next())
        .ok_or_else(|| anyhow!("{flag} requires a value"))
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/HOST")
}

/// Shared, read-only request context.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    extractor: YtDlp,
}

impl AppState {
    fn new(config: Config) -> Self {
        let extractor = YtDlp::new(config.yt_dlp_path.clone()).with_geo_bypass(config.geo_bypass);
        Self {
            config: Arc::new(config),
            extractor,
        }
    }

    fn extractor_error(&self, err: ExtractorError) -> ApiError {
        ApiError::from_extractor(err, self.config.expose_extractor_errors)
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    /// Logs the full error and keeps only the stable public text unless the
    /// deployment opted into raw extractor messages.
    fn from_extractor(err: ExtractorError, expose: bool) -> Self {
        let status = if err.is_client_error() {
            warn!("extractor rejected request: {err}");
            StatusCode::BAD_REQUEST
        } else {
            error!("extractor failure: {err}");
            StatusCode::INTERNAL_SERVER_ERROR
        };
        let message = if expose {
            err.to_string()
        } else {
            err.public_message().to_string()
        };
        Self { status, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "success": false,
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
struct InfoForm {
    #[serde(default)]
    url: String,
}

#[derive(Debug, Default, Deserialize)]
struct DownloadForm {
    #[serde(default)]
    url: String,
    #[serde(default)]
    format_id: String,
    /// Optional per-request override of the configured download mode.
    #[serde(default)]
    mode: Option<String>,
}

#[derive(Serialize)]
struct InfoResponse {
    success: bool,
    info: VideoMetadata,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    let BackendArgs { overrides } = BackendArgs::parse()?;
    let config = resolve_config(overrides)?;

    let removed = prepare_download_dir(&config.download_dir, STALE_DOWNLOAD_AGE)?;
    if removed > 0 {
        info!(
            "removed {removed} stale file(s) from {}",
            config.download_dir.display()
        );
    }

    let addr = SocketAddr::new(parse_host_arg(&config.host)?, config.port);
    let state = AppState::new(config);

    // Missing yt-dlp is not fatal: /health must keep answering so the host
    // can report the instance as alive while it is being fixed.
    match state.extractor.version().await {
        Ok(version) => info!(
            "using yt-dlp {version} from {}",
            state.extractor.binary().display()
        ),
        Err(err) => warn!("yt-dlp probe failed, downloads will fail until fixed: {err}"),
    }

    let mode = state.config.download_mode;
    let environment = state.config.environment;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(
        mode = mode.as_str(),
        environment = ?environment,
        "listening on http://{addr}"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running HTTP server")?;

    info!("server stopped");
    Ok(())
}

fn build_router(state: AppState) -> Router {
    let body_limit = state.config.max_body_bytes;
    Router::new()
        .route("/", get(index))
        .route("/get_info", post(get_info))
        .route("/download", post(download))
        .route("/health", get(health))
        .route("/static/{*path}", get(serve_static))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match unix_signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown requested, draining connections");
}

async fn index() -> Html<String> {
    let year = Local::now().year().to_string();
    Html(INDEX_TEMPLATE.replace(YEAR_PLACEHOLDER, &year))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

async fn get_info(
    State(state): State<AppState>,
    form: Result<Form<InfoForm>, FormRejection>,
) -> ApiResult<Json<InfoResponse>> {
    let Form(form) = form.map_err(form_rejection)?;
    let url = normalize_video_url(&form.url)?;

    let info = state
        .extractor
        .fetch_info(&url)
        .await
        .map_err(|err| state.extractor_error(err))?;
    info!(formats = info.formats.len(), "fetched info for {url}");

    Ok(Json(InfoResponse {
        success: true,
        info,
    }))
}

async fn download(
    State(state): State<AppState>,
    form: Result<Form<DownloadForm>, FormRejection>,
) -> ApiResult<Response> {
    let Form(form) = form.map_err(form_rejection)?;
    let url = normalize_video_url(&form.url)?;
    let format_id = form.format_id.trim();
    if format_id.is_empty() {
        return Err(ApiError::bad_request("Format is required"));
    }
    let mode = match form.mode.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => DownloadMode::parse(raw)
            .ok_or_else(|| ApiError::bad_request(format!("Unknown download mode: {raw}")))?,
        _ => state.config.download_mode,
    };

    match mode {
        DownloadMode::Buffered => send_buffered(&state, &url, format_id).await,
        DownloadMode::Streamed => send_streamed(&state, &url, format_id).await,
    }
}

/// Downloads to the temp directory, then streams the file. The file is
/// removed when the body finishes or is dropped mid-transfer.
async fn send_buffered(state: &AppState, url: &str, format_id: &str) -> ApiResult<Response> {
    let downloaded = state
        .extractor
        .download(&state.config.download_dir, url, format_id)
        .await
        .map_err(|err| state.extractor_error(err))?;

    let ext = downloaded.extension().unwrap_or(DEFAULT_EXTENSION).to_string();
    let size = downloaded.size();
    info!(size, "serving format {format_id} of {url} from disk");

    let body = downloaded.into_stream().await.map_err(|err| {
        error!("opening downloaded file failed: {err}");
        ApiError::internal("Download failed: could not read file")
    })?;
    attachment_response(Body::from_stream(body), &ext, Some(size))
}

/// Pipes yt-dlp's stdout into the response. The first chunk is read before
/// the headers go out so an extractor that fails up front still gets a JSON
/// error instead of an empty attachment.
async fn send_streamed(state: &AppState, url: &str, format_id: &str) -> ApiResult<Response> {
    let ext = stream_extension(&state.extractor, url, format_id).await;
    let mut output = state
        .extractor
        .stream(url, format_id)
        .map_err(|err| state.extractor_error(err))?;

    let first = match output.next().await {
        Some(Ok(chunk)) => chunk,
        Some(Err(err)) => {
            error!("reading yt-dlp output failed: {err}");
            return Err(ApiError::internal("Download failed"));
        }
        None => return Err(state.extractor_error(output.into_failure().await)),
    };
    info!(
        pid = output.pid().unwrap_or_default(),
        "streaming format {format_id} of {url}"
    );

    let body = stream::iter([Ok::<_, std::io::Error>(first)]).chain(output);
    attachment_response(Body::from_stream(body), &ext, None)
}

/// Container extension for the streamed attachment name. Falls back to mp4
/// when the listing cannot be fetched or lacks the format.
async fn stream_extension(extractor: &YtDlp, url: &str, format_id: &str) -> String {
    match extractor.fetch_info(url).await {
        Ok(info) => match info.extension_for(format_id) {
            Some(ext) => ext.to_string(),
            None => {
                debug!("format {format_id} not in listing, naming as {DEFAULT_EXTENSION}");
                DEFAULT_EXTENSION.to_string()
            }
        },
        Err(err) => {
            warn!("could not resolve extension for format {format_id}: {err}");
            DEFAULT_EXTENSION.to_string()
        }
    }
}

fn attachment_response(body: Body, ext: &str, length: Option<u64>) -> ApiResult<Response> {
    let ext = sanitize_extension(ext);
    let filename = sanitize_ascii_filename(&format!("{ATTACHMENT_STEM}.{ext}"));
    let mime = MimeGuess::from_ext(&ext).first_or_octet_stream();

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mime.to_string())
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        );
    if let Some(length) = length {
        builder = builder.header(header::CONTENT_LENGTH, length);
    }
    builder
        .body(body)
        .map_err(|err| response_build_failed(err, "Download failed"))
}

/// Logs why a response could not be assembled; the client only sees `public`.
fn response_build_failed(err: axum::http::Error, public: &str) -> ApiError {
    error!("building response failed: {err}");
    ApiError::internal(public)
}

async fn serve_static(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
) -> ApiResult<Response> {
    let target = resolve_static_path(&state.config.static_dir, &path)?;
    let file = File::open(&target)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    if !metadata.is_file() {
        return Err(ApiError::not_found("file not found"));
    }

    let mime = MimeGuess::from_path(&target).first_or_octet_stream();
    Response::builder()
        .header(header::CONTENT_TYPE, mime.to_string())
        .header(header::CONTENT_LENGTH, metadata.len())
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|err| response_build_failed(err, STATIC_SERVE_FAILED))
}

/// Only plain relative segments are allowed below the static root.
fn resolve_static_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(ApiError::not_found("file not found"));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(root.join(candidate))
}

fn form_rejection(rejection: FormRejection) -> ApiError {
    debug!("rejected form body: {rejection}");
    ApiError::bad_request("Invalid form submission")
}

/// Requires an http(s) URL with a host. Scheme-less input such as
/// `youtube.com/watch?v=...` is read as https.
fn normalize_video_url(raw: &str) -> ApiResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ApiError::bad_request("URL is required"));
    }
    let invalid = || ApiError::bad_request("Invalid URL");

    let with_https = || Url::parse(&format!("https://{trimmed}")).map_err(|_| invalid());
    let parsed = match Url::parse(trimmed) {
        // `host:port/path` parses with `host` as the scheme.
        Ok(parsed)
            if !trimmed.contains("://") && !matches!(parsed.scheme(), "http" | "https") =>
        {
            with_https()?
        }
        Ok(parsed) => parsed,
        Err(url::ParseError::RelativeUrlWithoutBase) => with_https()?,
        Err(_) => return Err(invalid()),
    };
    let has_host = parsed.host_str().is_some_and(|host| !host.is_empty());
    if !matches!(parsed.scheme(), "http" | "https") || !has_host {
        return Err(invalid());
    }
    Ok(parsed.to_string())
}

fn sanitize_extension(ext: &str) -> String {
    let cleaned: String = ext
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect::<String>()
        .to_ascii_lowercase();
    if cleaned.is_empty() {
        DEFAULT_EXTENSION.to_string()
    } else {
        cleaned
    }
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric() || matches!(character, '.' | '-' | '_') {
                character
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = sanitized.trim_matches('.');
    if trimmed.is_empty() {
        format!("{ATTACHMENT_STEM}.{DEFAULT_EXTENSION}")
    } else {
        trimmed.to_string()
    }
}
