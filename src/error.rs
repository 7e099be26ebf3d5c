use thiserror::Error;

/// Error taxonomy surfaced to the host application (spec §7).
///
/// Variants are named after the stable discriminators the host uses to
/// localize messages without parsing prose. HTTP-facing failures (401/403/
/// 404/405) never become a `ServerError` — they are mapped directly to a
/// `StatusCode` at the request-handling boundary instead.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("no port available in configured range")]
    NoPortAvailable,

    #[error("listener for project '{0}' could not be started: {1}")]
    BindFailed(String, String),

    #[error("project root invalid: {0}")]
    RootInvalid(String),

    #[error("requested path escapes project root: {0}")]
    PathEscape(String),

    #[error("server for project '{0}' is not started")]
    NotStarted(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
