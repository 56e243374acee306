#![forbid(unsafe_code)]

//! GrabTube backend: accepts a media URL over HTTP, shells out to the
//! downloader, and serves the resulting file back.
//!
//! The server is a single Axum router. Fetches run on blocking tasks because
//! the downloader is a synchronous subprocess; batch requests are accepted
//! immediately and drained sequentially in the background.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path as AxumPath, State},
    http::{HeaderMap, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use grabtube_tools::bootstrap::{AppPaths, ensure_ytdlp};
use grabtube_tools::config::{RuntimeOverrides, resolve_runtime_paths};
use grabtube_tools::fetcher::{FetchContext, FetchOutcome, fetch_media};
use grabtube_tools::security::ensure_not_root;
use mime_guess::{MimeGuess, mime::Mime};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    signal, task,
};
use tokio_util::io::ReaderStream;

// Upload cap for cookies files; they are small Netscape-format text files.
const COOKIE_UPLOAD_LIMIT: usize = 5 * 1024 * 1024;

// JSON bodies (batch URL lists) get a little more room.
const BODY_LIMIT: usize = 10 * 1024 * 1024;

// Pause between sequential batch items so the remote end is not hammered.
const BATCH_ITEM_PAUSE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
struct BackendArgs {
    data_root: PathBuf,
    www_root: PathBuf,
    grabtube_port: u16,
    listen_host: IpAddr,
    ytdlp_path: Option<PathBuf>,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut data_root_override: Option<PathBuf> = None;
        let mut www_root_override: Option<PathBuf> = None;
        let mut port_override: Option<u16> = None;
        let mut host_override: Option<IpAddr> = None;
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--data-root=") {
                data_root_override = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--www-root=") {
                www_root_override = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                port_override = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                host_override = Some(parse_host_arg(value)?);
                continue;
            }

            match arg.as_str() {
                "--data-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--data-root requires a value"))?;
                    data_root_override = Some(PathBuf::from(value));
                }
                "--www-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--www-root requires a value"))?;
                    www_root_override = Some(PathBuf::from(value));
                }
                "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--port requires a value"))?;
                    port_override = Some(parse_port_arg(&value)?);
                }
                "--host" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--host requires a value"))?;
                    host_override = Some(parse_host_arg(&value)?);
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        let runtime_paths = resolve_runtime_paths(RuntimeOverrides {
            data_root: data_root_override.clone(),
            www_root: www_root_override.clone(),
            grabtube_port: port_override,
            grabtube_host: None,
            env_path: None,
        })?;
        let runtime_host = parse_host_arg(&runtime_paths.grabtube_host)?;
        let data_root = data_root_override.unwrap_or(runtime_paths.data_root);
        let www_root = www_root_override.unwrap_or(runtime_paths.www_root);
        let grabtube_port = port_override.unwrap_or(runtime_paths.grabtube_port);
        let listen_host = host_override.unwrap_or(runtime_host);

        Ok(Self {
            data_root,
            www_root,
            grabtube_port,
            listen_host,
            ytdlp_path: runtime_paths.ytdlp_path,
        })
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/GRABTUBE_HOST")
}

/// Tracks background batch jobs so clients can poll after the 202.
#[derive(Clone)]
struct BatchManager {
    inner: Arc<BatchManagerInner>,
}

struct BatchManagerInner {
    jobs: Mutex<HashMap<String, BatchJob>>,
    counter: AtomicUsize,
    fetch: Arc<FetchContext>,
}

#[derive(Clone)]
struct BatchJob {
    id: String,
    status: BatchStatus,
    completed: usize,
    total: usize,
    message: String,
}

#[derive(Clone, Copy, Debug)]
enum BatchStatus {
    Queued,
    Running,
    Success,
    Failed,
}

impl BatchStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "completed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct BatchJobStatus {
    id: String,
    status: String,
    completed: usize,
    total: usize,
    message: String,
}

impl BatchManager {
    fn new(fetch: Arc<FetchContext>) -> Self {
        Self {
            inner: Arc::new(BatchManagerInner {
                jobs: Mutex::new(HashMap::new()),
                counter: AtomicUsize::new(1),
                fetch,
            }),
        }
    }

    /// Registers a job and drains the URL list sequentially on a background
    /// task. Individual failures are logged and counted but never stop the
    /// loop.
    fn start(&self, urls: Vec<String>) -> String {
        let job_id = self.next_job_id();
        let total = urls.len();

        self.inner.jobs.lock().insert(
            job_id.clone(),
            BatchJob {
                id: job_id.clone(),
                status: BatchStatus::Queued,
                completed: 0,
                total,
                message: "Queued".to_string(),
            },
        );

        let inner = self.inner.clone();
        let job_id_clone = job_id.clone();
        tokio::spawn(async move {
            update_job(&inner, &job_id_clone, |job| {
                job.status = BatchStatus::Running;
                job.message = format!("Downloading 1/{total}");
            });

            let mut failures = 0usize;
            for (index, url) in urls.into_iter().enumerate() {
                let current = index + 1;
                println!("[{current}/{total}] Starting batch download for: {url}");

                let ctx = inner.fetch.clone();
                let url_for_log = url.clone();
                let result =
                    task::spawn_blocking(move || fetch_media(&ctx, &url, None)).await;

                match result {
                    Ok(Ok(outcome)) => {
                        if outcome.error {
                            failures += 1;
                        }
                        println!("[{current}/{total}] Completed: {}", outcome.filename);
                    }
                    Ok(Err(err)) => {
                        failures += 1;
                        eprintln!("[{current}/{total}] Warning: {url_for_log} failed: {err}");
                    }
                    Err(err) => {
                        failures += 1;
                        eprintln!("[{current}/{total}] Warning: fetch task died: {err}");
                    }
                }

                update_job(&inner, &job_id_clone, |job| {
                    job.completed = current;
                    if current < total {
                        job.message = format!("Downloading {}/{total}", current + 1);
                    }
                });

                if current < total {
                    tokio::time::sleep(BATCH_ITEM_PAUSE).await;
                }
            }

            println!("Batch finished: {total} item(s), {failures} failure(s)");
            update_job(&inner, &job_id_clone, |job| {
                if failures == total && total > 0 {
                    job.status = BatchStatus::Failed;
                    job.message = format!("All {total} downloads failed");
                } else {
                    job.status = BatchStatus::Success;
                    job.message = format!("Completed {} of {total}", total - failures);
                }
            });
        });

        job_id
    }

    fn get_status(&self, job_id: &str) -> Option<BatchJobStatus> {
        let job = self.inner.jobs.lock().get(job_id).cloned()?;
        Some(BatchJobStatus {
            id: job.id,
            status: job.status.as_str().to_string(),
            completed: job.completed,
            total: job.total,
            message: job.message,
        })
    }

    fn next_job_id(&self) -> String {
        let id = self.inner.counter.fetch_add(1, Ordering::Relaxed);
        format!("batch-{id}")
    }
}

fn update_job(inner: &BatchManagerInner, job_id: &str, apply: impl FnOnce(&mut BatchJob)) {
    if let Some(job) = inner.jobs.lock().get_mut(job_id) {
        apply(job);
    }
}

/// Shared state injected into every Axum handler.
///
/// * `paths` knows where downloads, cookies, and the static site live.
/// * `fetch` carries the resolved downloader and the simulation switch.
/// * `batches` tracks background batch jobs.
#[derive(Clone)]
struct AppState {
    paths: Arc<AppPaths>,
    fetch: Arc<FetchContext>,
    batches: BatchManager,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    /// Creates a 400 error with the provided message.
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    /// Creates a 404 error with the provided message.
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    /// Creates a 500 error with the provided message.
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadRequest {
    url: Option<String>,
    cookie_file: Option<String>,
}

#[derive(Deserialize)]
struct BatchRequest {
    urls: Option<Vec<String>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let BackendArgs {
        data_root,
        www_root,
        grabtube_port,
        listen_host,
        ytdlp_path,
    } = BackendArgs::parse()?;

    ensure_not_root("backend")?;

    let paths = AppPaths::with_roots(&data_root, &www_root);
    paths.prepare()?;

    println!("Downloads directory: {}", paths.downloads.display());
    println!("Cookies directory: {}", paths.cookies.display());

    let real_downloads = paths.real_downloads_enabled();
    println!("Real downloads enabled: {real_downloads}");

    let downloader = if real_downloads {
        ensure_ytdlp(&paths, ytdlp_path.as_deref())
    } else {
        None
    };

    let fetch = Arc::new(FetchContext {
        downloads_dir: paths.downloads.clone(),
        cookies_dir: paths.cookies.clone(),
        downloader,
        real_downloads,
    });

    let state = AppState {
        paths: Arc::new(paths),
        batches: BatchManager::new(fetch.clone()),
        fetch,
    };

    let app = router(state);

    let addr = SocketAddr::new(listen_host, grabtube_port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    println!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running server")?;

    Ok(())
}

/// Each route is extremely small; helpers supplement anything shared between
/// download artifacts and cookie files.
fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/downloads", get(list_downloads))
        .route("/api/platforms", get(list_platforms))
        .route("/api/upload-cookie", post(upload_cookie))
        .route("/api/download", post(start_download))
        .route("/api/download/batch", post(start_batch))
        .route("/api/download/batch/{id}", get(get_batch_status))
        .route("/downloads/{file}", get(serve_download))
        .route("/cookies/{file}", get(serve_cookie))
        .fallback(static_fallback)
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .with_state(state)
}

async fn shutdown_signal() {
    // We do not propagate this error up because it only affects graceful
    // shutdown; the process still terminates when Ctrl+C fires.
    if let Err(err) = signal::ctrl_c().await {
        eprintln!("Failed to install Ctrl+C handler: {}", err);
    }
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "OK",
        "timestamp": Utc::now().to_rfc3339(),
        "realDownloads": state.fetch.real_downloads,
        "downloadsDir": state.paths.downloads.display().to_string(),
        "cookiesDir": state.paths.cookies.display().to_string(),
    }))
}

/// Debug listing of everything currently sitting in the downloads directory.
async fn list_downloads(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let mut entries = tokio::fs::read_dir(&state.paths.downloads)
        .await
        .map_err(|err| ApiError::internal(format!("could not read downloads directory: {err}")))?;

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| ApiError::internal(format!("could not read downloads directory: {err}")))?
    {
        files.push(
            entry
                .file_name()
                .into_string()
                .unwrap_or_else(|os| os.to_string_lossy().into_owned()),
        );
    }
    files.sort();

    Ok(Json(json!({
        "success": true,
        "files": files,
        "count": files.len(),
    })))
}

async fn list_platforms() -> Json<Value> {
    Json(json!({
        "platforms": [
            { "name": "YouTube", "key": "youtube", "icon": "📺" },
            { "name": "Instagram", "key": "instagram", "icon": "📱" },
            { "name": "TikTok", "key": "tiktok", "icon": "🎵" },
            { "name": "Twitter/X", "key": "twitter", "icon": "🐦" },
            { "name": "Generic", "key": "generic", "icon": "🔗" }
        ]
    }))
}

async fn upload_cookie(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("invalid multipart body: {err}")))?
    {
        if field.name() != Some("cookieFile") {
            continue;
        }

        let data = field
            .bytes()
            .await
            .map_err(|err| ApiError::bad_request(format!("could not read cookie file: {err}")))?;
        if data.len() > COOKIE_UPLOAD_LIMIT {
            return Err(ApiError::bad_request("cookie file exceeds the 5MB limit"));
        }

        let filename = store_cookie_file(&state.paths.cookies, &data)
            .await
            .map_err(|err| ApiError::internal(err.to_string()))?;
        println!("Cookie file uploaded: {filename}");

        return Ok(Json(json!({
            "success": true,
            "message": "Cookie file uploaded",
            "filename": filename,
        })));
    }

    Err(ApiError::bad_request("No cookie file uploaded"))
}

/// Persists an uploaded cookies payload under a timestamped name.
async fn store_cookie_file(cookies_dir: &Path, data: &[u8]) -> Result<String> {
    let filename = format!("cookies_{}.txt", Utc::now().timestamp_millis());
    let path = cookies_dir.join(&filename);
    tokio::fs::write(&path, data)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(filename)
}

async fn start_download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> ApiResult<Json<FetchOutcome>> {
    let url = payload
        .url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::bad_request("URL is required"))?
        .to_string();

    println!("Download requested for: {url}");

    let ctx = state.fetch.clone();
    let cookie_file = payload.cookie_file;
    let outcome = task::spawn_blocking(move || fetch_media(&ctx, &url, cookie_file.as_deref()))
        .await
        .map_err(|err| ApiError::internal(format!("fetch task died: {err}")))?
        .map_err(|err| ApiError::internal(err.to_string()))?;

    Ok(Json(outcome))
}

async fn start_batch(
    State(state): State<AppState>,
    Json(payload): Json<BatchRequest>,
) -> ApiResult<Response> {
    let urls: Vec<String> = payload
        .urls
        .unwrap_or_default()
        .into_iter()
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .collect();

    if urls.is_empty() {
        return Err(ApiError::bad_request(
            "URLs array is required and must not be empty",
        ));
    }

    let total = urls.len();
    println!("Batch download requested for {total} video(s)");
    let job_id = state.batches.start(urls);

    let body = Json(json!({
        "success": true,
        "message": format!("Batch download started for {total} videos. Processing in background."),
        "total": total,
        "acceptedAt": Utc::now().to_rfc3339(),
        "id": job_id,
    }));

    Ok((StatusCode::ACCEPTED, body).into_response())
}

async fn get_batch_status(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<BatchJobStatus>> {
    let status = state
        .batches
        .get_status(&id)
        .ok_or_else(|| ApiError::not_found("batch job not found"))?;
    Ok(Json(status))
}

async fn serve_download(
    State(state): State<AppState>,
    AxumPath(file): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    ensure_safe_path_segment(&file)?;
    let path = state.paths.downloads.join(&file);
    let mut response = stream_file(path, None, Some(&headers)).await?;

    // Download artifacts churn constantly; never let a proxy cache them.
    let response_headers = response.headers_mut();
    response_headers.insert(
        header::CACHE_CONTROL,
        "no-cache, no-store, must-revalidate".parse().unwrap(),
    );
    response_headers.insert(header::PRAGMA, "no-cache".parse().unwrap());
    response_headers.insert(header::EXPIRES, "0".parse().unwrap());

    Ok(response)
}

async fn serve_cookie(
    State(state): State<AppState>,
    AxumPath(file): AxumPath<String>,
) -> ApiResult<Response> {
    ensure_safe_path_segment(&file)?;
    let path = state.paths.cookies.join(&file);
    stream_file(path, None, None).await
}

async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::not_found("endpoint not found").into_response();
    }

    match serve_www_path(&state.paths.www_root, path).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    let metadata = tokio::fs::metadata(&target).await;

    match metadata {
        Ok(meta) if meta.is_dir() => {
            let index = root.join("index.html");
            stream_file(index, None, None).await
        }
        Ok(_) => stream_file(target, None, None).await,
        Err(_) => {
            if should_fallback_to_index(request_path) {
                let index = root.join("index.html");
                stream_file(index, None, None).await
            } else {
                Err(ApiError::not_found("file not found"))
            }
        }
    }
}

fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
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

fn should_fallback_to_index(request_path: &str) -> bool {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return true;
    }
    let candidate = Path::new(trimmed);
    let has_extension = candidate.extension().is_some();
    !has_extension
}

/// Validates that a single dynamic path segment never escapes its base folder.
fn ensure_safe_path_segment(value: &str) -> ApiResult<()> {
    if value.is_empty()
        || Path::new(value)
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }

    Ok(())
}

async fn stream_file(
    path: PathBuf,
    mime: Option<Mime>,
    headers: Option<&HeaderMap>,
) -> ApiResult<Response> {
    let mut file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let size = metadata.len();

    let guessed = mime.or_else(|| MimeGuess::from_path(&path).first());
    let range = headers
        .and_then(|headers| headers.get(header::RANGE))
        .and_then(|value| parse_range_header(value, size));

    let mut response = if let Some((start, end)) = range {
        if start >= size {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                format!("bytes */{}", size).parse().unwrap(),
            );
            response
        } else {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|_| ApiError::not_found("file not found"))?;
            let stream = ReaderStream::new(file.take(length));
            let body = Body::from_stream(stream);
            let mut response = body.into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, end, size).parse().unwrap(),
            );
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, length.to_string().parse().unwrap());
            response
        }
    } else {
        let stream = ReaderStream::new(file);
        let body = Body::from_stream(stream);
        body.into_response()
    };

    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, "bytes".parse().unwrap());
    if let Some(mime) = guessed
        && let Ok(value) = mime.to_string().parse()
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }

    Ok(response)
}

fn parse_range_header(value: &header::HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?;
    let value = value.trim();
    let mut parts = value.split('=');
    let unit = parts.next()?.trim();
    if unit != "bytes" {
        return None;
    }
    let range = parts.next()?.trim();
    if range.is_empty() {
        return None;
    }
    let (start_str, end_str) = range.split_once('-')?;

    if start_str.is_empty() {
        // Suffix range: "-N" means last N bytes.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        if suffix_len >= size {
            return Some((0, size.saturating_sub(1)));
        }
        return Some((size - suffix_len, size.saturating_sub(1)));
    }

    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        size.saturating_sub(1)
    } else {
        end_str.parse().ok()?
    };
    if end < start {
        return None;
    }
    Some((start, end))
}
