use crate::error::ServerError;
use crate::token::{AccessToken, extract_token};
use axum::body::Body;
use axum::extract::{RawQuery, State};
use axum::http::{Method, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{error, info, trace, warn};

/// One embedded HTTP service exposing a single project's working tree
/// (spec §4.2). Construction, routing, auth, and path policy all live
/// here; lifecycle admission (eviction, reaping) is the Server Manager's
/// job.
pub struct ProjectFileServer {
    project_id: String,
    root: PathBuf,
    port: u16,
    token: AccessToken,
    created_at: Instant,
    last_accessed_ms: AtomicU64,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

struct Lifecycle {
    exit_signal: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl ProjectFileServer {
    /// Bind a listener for `project_id` at `root` on `port`, start serving,
    /// and return the running instance (spec §4.2 `start`).
    ///
    /// Binding is raced against `start_timeout`; on timeout the partial
    /// listener is dropped and `BindFailed` is returned (spec §5).
    pub async fn start(
        project_id: impl Into<String>,
        root: PathBuf,
        port: u16,
        token: AccessToken,
        bind_address: Ipv4Addr,
        start_timeout: Duration,
    ) -> Result<Arc<Self>, ServerError> {
        let project_id = project_id.into();

        let canonical_root = tokio::fs::canonicalize(&root)
            .await
            .map_err(|e| ServerError::RootInvalid(format!("{}: {e}", root.display())))?;
        if !canonical_root.is_dir() {
            return Err(ServerError::RootInvalid(format!(
                "{} is not a directory",
                canonical_root.display()
            )));
        }

        let addr = SocketAddr::from((bind_address, port));
        let listener = tokio::time::timeout(start_timeout, TcpListener::bind(addr))
            .await
            .map_err(|_| ServerError::BindFailed(project_id.clone(), "timed out".to_string()))?
            .map_err(|e| ServerError::BindFailed(project_id.clone(), e.to_string()))?;

        // `port` may be 0 (bind-any, used by tests); the OS-assigned port
        // from the live listener is the one callers must actually use.
        let bound_port = listener
            .local_addr()
            .map_err(|e| ServerError::BindFailed(project_id.clone(), e.to_string()))?
            .port();

        let instance = Arc::new(Self {
            project_id: project_id.clone(),
            root: canonical_root,
            port: bound_port,
            token,
            created_at: Instant::now(),
            last_accessed_ms: AtomicU64::new(0),
            lifecycle: tokio::sync::Mutex::new(Lifecycle {
                exit_signal: None,
                join: None,
            }),
        });

        let router = build_router(instance.clone());
        let (tx, rx) = oneshot::channel::<()>();
        let pid_for_task = project_id.clone();

        let handle = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await
            {
                warn!(project_id = %pid_for_task, error = %err, "file server task exited with error");
            }
        });

        {
            let mut lifecycle = instance.lifecycle.lock().await;
            lifecycle.exit_signal = Some(tx);
            lifecycle.join = Some(handle);
        }

        info!(%project_id, port = bound_port, root = %instance.root.display(), "project file server started");
        Ok(instance)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn token(&self) -> &AccessToken {
        &self.token
    }

    /// Milliseconds elapsed since the last authenticated request (or since
    /// construction, if none yet) — the quantity LRU eviction and idle
    /// reaping both compare against.
    pub fn idle_millis(&self) -> u64 {
        let since_creation = self.created_at.elapsed().as_millis() as u64;
        let last_touch = self.last_accessed_ms.load(Ordering::Acquire);
        since_creation.saturating_sub(last_touch)
    }

    fn touch(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_accessed_ms.store(elapsed, Ordering::Release);
    }

    /// Build the URL a caller should use to fetch `relative_path` (spec
    /// §4.2 `urlFor`). Performs the same containment check a request would,
    /// so escapes are rejected up front rather than producing a URL that
    /// would later 403.
    pub async fn url_for(&self, relative_path: &str) -> Result<String, ServerError> {
        resolve_within_root(&self.root, relative_path).await?;
        let encoded = percent_encoding::utf8_percent_encode(relative_path, PATH_ENCODE_SET);
        Ok(format!(
            "http://127.0.0.1:{}/{}?token={}",
            self.port,
            encoded,
            self.token.as_hex()
        ))
    }

    /// Close the listener and refuse further requests (spec §4.2 `stop`).
    /// Idempotent: stopping an already-stopped instance is a no-op.
    pub async fn stop(&self) {
        let (exit_signal, join) = {
            let mut lifecycle = self.lifecycle.lock().await;
            (lifecycle.exit_signal.take(), lifecycle.join.take())
        };

        if let Some(tx) = exit_signal {
            let _ = tx.send(());
        }
        if let Some(handle) = join {
            if tokio::time::timeout(Duration::from_secs(10), handle)
                .await
                .is_err()
            {
                warn!(project_id = %self.project_id, "file server task did not shut down within timeout");
            }
        }
        info!(project_id = %self.project_id, "project file server stopped");
    }
}

const PATH_ENCODE_SET: &percent_encoding::AsciiSet = &percent_encoding::NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

fn build_router(state: Arc<ProjectFileServer>) -> Router {
    Router::new()
        .route("/", any(handle_request))
        .route("/{*path}", any(handle_request))
        .with_state(state)
        .layer(CatchPanicLayer::custom(handle_panic))
}

/// A panicking handler must not take the listener down with it (spec §4.2,
/// §7: "Request handlers MUST NOT terminate the listener on handler
/// exceptions"). Logs the panic and responds `500` with an empty body —
/// no panic payload or backtrace ever reaches the client.
fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let message = err
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| err.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    error!(panic = %message, "request handler panicked");
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}

/// Attaches the "strict, minimal headers" spec §4.2 requires on every
/// response this service sends, success or failure alike — an early 401/403/
/// 404/405 is still a response an attacker can probe, so it gets the same
/// `nosniff`/`no-cache` treatment as a served file.
fn secured(mut resp: Response) -> Response {
    let headers_mut = resp.headers_mut();
    headers_mut.insert(
        header::HeaderName::from_static("x-content-type-options"),
        "nosniff".parse().expect("valid header value"),
    );
    headers_mut.insert(
        header::CACHE_CONTROL,
        "no-cache".parse().expect("valid header value"),
    );
    resp
}

async fn handle_request(
    State(state): State<Arc<ProjectFileServer>>,
    RawQuery(query): RawQuery,
    req: Request<Body>,
) -> Response {
    let method = req.method().clone();
    if method != Method::GET && method != Method::HEAD {
        return secured(
            (
                StatusCode::METHOD_NOT_ALLOWED,
                [(header::ALLOW, "GET, HEAD")],
            )
                .into_response(),
        );
    }

    let raw_path = req.uri().path().trim_start_matches('/').to_string();
    let headers = req.headers().clone();

    let token = extract_token(&headers, query.as_deref());
    let authed = token
        .as_deref()
        .map(|t| state.token.matches(t))
        .unwrap_or(false);
    if !authed {
        trace!(project_id = %state.project_id, "auth failed");
        return secured(StatusCode::UNAUTHORIZED.into_response());
    }
    state.touch();

    let decoded_path = match percent_encoding::percent_decode_str(&raw_path).decode_utf8() {
        Ok(p) => p.into_owned(),
        Err(_) => return secured(StatusCode::BAD_REQUEST.into_response()),
    };

    if has_hidden_component(&decoded_path) {
        warn!(project_id = %state.project_id, path = %decoded_path, "dotfile access denied");
        return secured(StatusCode::FORBIDDEN.into_response());
    }

    let target = match resolve_within_root(&state.root, &decoded_path).await {
        Ok(p) => p,
        Err(ServerError::PathEscape(p)) => {
            warn!(project_id = %state.project_id, path = %p, "path escape blocked");
            return secured(StatusCode::FORBIDDEN.into_response());
        }
        Err(_) => return secured(StatusCode::NOT_FOUND.into_response()),
    };

    let metadata = match tokio::fs::metadata(&target).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return secured(StatusCode::FORBIDDEN.into_response());
        }
        Err(_) => return secured(StatusCode::NOT_FOUND.into_response()),
    };

    if metadata.is_dir() {
        return secured(StatusCode::NOT_FOUND.into_response());
    }

    let content_type = mime_guess::from_path(&target)
        .first_or_octet_stream()
        .to_string();

    let is_range_eligible = content_type.starts_with("image/")
        || content_type.starts_with("video/")
        || content_type.starts_with("audio/")
        || content_type.starts_with("font/");

    let range_header = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let body = match tokio::fs::read(&target).await {
        Ok(bytes) => bytes,
        Err(_) => return secured(StatusCode::NOT_FOUND.into_response()),
    };

    let response = if is_range_eligible {
        if let Some(range) = range_header.as_deref().and_then(|r| parse_range(r, body.len())) {
            let (start, end) = range;
            let slice = body[start..=end].to_vec();
            let total = body.len();
            let mut resp = Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{total}"))
                .header(header::CONTENT_LENGTH, slice.len().to_string())
                .body(Body::from(if method == Method::HEAD {
                    Vec::new()
                } else {
                    slice
                }))
                .expect("range response");
            resp.headers_mut().insert(
                header::CONTENT_TYPE,
                content_type.parse().expect("valid content type"),
            );
            resp
        } else {
            full_response(&content_type, body, method == Method::HEAD)
        }
    } else {
        full_response(&content_type, body, method == Method::HEAD)
    };

    secured(response)
}

fn full_response(content_type: &str, body: Vec<u8>, head_only: bool) -> Response {
    let len = body.len();
    let body = if head_only { Vec::new() } else { body };
    let mut resp = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_LENGTH, len.to_string())
        .body(Body::from(body))
        .expect("ok response");
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        content_type.parse().expect("valid content type"),
    );
    resp
}

/// Parses a single-range `Range: bytes=start-end` header against a body of
/// `len` bytes. Multi-range and suffix-range (`bytes=-500`) requests are
/// treated as unsatisfiable and fall back to a full response, which spec
/// §4.2 permits for anything beyond the simple case.
fn parse_range(header_value: &str, len: usize) -> Option<(usize, usize)> {
    let spec = header_value.strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start_str, end_str) = spec.split_once('-')?;
    if start_str.is_empty() {
        return None;
    }
    let start: usize = start_str.parse().ok()?;
    let end: usize = if end_str.is_empty() {
        len.checked_sub(1)?
    } else {
        end_str.parse().ok()?
    };
    if start > end || end >= len {
        return None;
    }
    Some((start, end))
}

/// A component beginning with `.` is a denied dotfile (`.env`, `.git`, …)
/// *unless* it is a bare `.` or `..` traversal segment — those are left to
/// the containment check in [`resolve_within_root`] so a `..`-escape is
/// classified and logged as `PathEscape`, not folded into dotfile denial
/// (spec §8 scenario 3).
fn has_hidden_component(decoded_relative_path: &str) -> bool {
    decoded_relative_path
        .split('/')
        .any(|component| component.starts_with('.') && component != "." && component != "..")
}

/// Joins `relative` onto `root` and canonicalizes, verifying the result is
/// contained within `root` (spec §4.2 path policy). `root` must already be
/// canonical. Canonicalization is a blocking syscall; `tokio::fs` runs it on
/// the blocking thread pool so it never stalls the async runtime (spec §5).
async fn resolve_within_root(root: &FsPath, relative: &str) -> Result<PathBuf, ServerError> {
    let relative = relative.trim_start_matches('/');
    let joined = if relative.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    };

    let canonical = match tokio::fs::canonicalize(&joined).await {
        Ok(p) => p,
        Err(_) => return Err(ServerError::PathEscape(relative.to_string())),
    };

    let within_root = canonical == root
        || canonical
            .strip_prefix(root)
            .map(|_| true)
            .unwrap_or(false);

    if within_root {
        Ok(canonical)
    } else {
        Err(ServerError::PathEscape(relative.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;

    async fn start_test_server(dir: &TempDir) -> (Arc<ProjectFileServer>, AccessToken) {
        let token = AccessToken::generate();
        let server = ProjectFileServer::start(
            "proj1",
            dir.path().to_path_buf(),
            0,
            token.clone(),
            Ipv4Addr::LOCALHOST,
            StdDuration::from_secs(5),
        )
        .await
        .unwrap();
        (server, token)
    }

    #[test]
    fn detects_hidden_components() {
        assert!(has_hidden_component(".env"));
        assert!(has_hidden_component(".git/config"));
        assert!(has_hidden_component("a/.aws/credentials"));
        assert!(!has_hidden_component("index.html"));
        assert!(!has_hidden_component("assets/logo.png"));
    }

    #[test]
    fn traversal_segments_are_not_treated_as_hidden() {
        assert!(!has_hidden_component(".."));
        assert!(!has_hidden_component("."));
        assert!(!has_hidden_component("../../etc/passwd"));
    }

    #[tokio::test]
    async fn resolve_within_root_rejects_escape() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::write(root.join("index.html"), "<p>hi</p>").unwrap();

        assert!(resolve_within_root(&root, "index.html").await.is_ok());
        assert!(resolve_within_root(&root, "../../etc/passwd").await.is_err());
    }

    #[test]
    fn parse_range_rejects_multi_range_and_suffix() {
        assert_eq!(parse_range("bytes=0-9,20-29", 100), None);
        assert_eq!(parse_range("bytes=-500", 100), None);
        assert_eq!(parse_range("bytes=0-9", 100), Some((0, 9)));
        assert_eq!(parse_range("bytes=0-", 10), Some((0, 9)));
        assert_eq!(parse_range("bytes=5-200", 10), None);
    }

    #[tokio::test]
    async fn happy_path_serves_file_with_valid_token() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.html"), "<p>hi</p>").unwrap();
        let (server, token) = start_test_server(&dir).await;

        let url = format!(
            "http://127.0.0.1:{}/index.html?token={}",
            server.port(),
            token.as_hex()
        );
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/html"
        );
        let body = resp.text().await.unwrap();
        assert_eq!(body, "<p>hi</p>");

        server.stop().await;
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.html"), "hi").unwrap();
        let (server, _token) = start_test_server(&dir).await;

        let url = format!("http://127.0.0.1:{}/index.html", server.port());
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 401);
        assert_eq!(
            resp.headers()
                .get("x-content-type-options")
                .unwrap(),
            "nosniff"
        );

        server.stop().await;
    }

    #[tokio::test]
    async fn wrong_token_is_unauthorized() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.html"), "hi").unwrap();
        let (server, _token) = start_test_server(&dir).await;

        let url = format!(
            "http://127.0.0.1:{}/index.html?token=deadbeef",
            server.port()
        );
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 401);

        server.stop().await;
    }

    #[tokio::test]
    async fn dotfile_is_forbidden() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".env"), "SECRET=1").unwrap();
        let (server, token) = start_test_server(&dir).await;

        let url = format!(
            "http://127.0.0.1:{}/.env?token={}",
            server.port(),
            token.as_hex()
        );
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 403);

        server.stop().await;
    }

    #[tokio::test]
    async fn path_escape_is_forbidden() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.html"), "hi").unwrap();
        let (server, token) = start_test_server(&dir).await;

        let url = format!(
            "http://127.0.0.1:{}/..%2F..%2Fetc%2Fpasswd?token={}",
            server.port(),
            token.as_hex()
        );
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 403);
        assert_eq!(
            resp.headers()
                .get("x-content-type-options")
                .unwrap(),
            "nosniff"
        );

        server.stop().await;
    }

    #[tokio::test]
    async fn directory_request_is_not_found() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let (server, token) = start_test_server(&dir).await;

        let url = format!(
            "http://127.0.0.1:{}/sub?token={}",
            server.port(),
            token.as_hex()
        );
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 404);

        server.stop().await;
    }

    #[tokio::test]
    async fn empty_file_returns_zero_content_length() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("empty.txt"), "").unwrap();
        let (server, token) = start_test_server(&dir).await;

        let url = format!(
            "http://127.0.0.1:{}/empty.txt?token={}",
            server.port(),
            token.as_hex()
        );
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers().get(header::CONTENT_LENGTH).unwrap(), "0");

        server.stop().await;
    }

    #[tokio::test]
    async fn method_not_allowed_for_post() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.html"), "hi").unwrap();
        let (server, token) = start_test_server(&dir).await;

        let client = reqwest::Client::new();
        let url = format!(
            "http://127.0.0.1:{}/index.html?token={}",
            server.port(),
            token.as_hex()
        );
        let resp = client.post(&url).send().await.unwrap();
        assert_eq!(resp.status(), 405);
        assert_eq!(resp.headers().get(header::ALLOW).unwrap(), "GET, HEAD");

        server.stop().await;
    }

    #[tokio::test]
    async fn stopped_server_refuses_new_connections() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.html"), "hi").unwrap();
        let (server, token) = start_test_server(&dir).await;
        let port = server.port();
        server.stop().await;

        let url = format!("http://127.0.0.1:{port}/index.html?token={}", token.as_hex());
        assert!(reqwest::get(&url).await.is_err());
    }
}
