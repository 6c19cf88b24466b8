use std::time::Duration;

use floe_types::error::{FloeError, Result};

use crate::RetryConfig;

/// Sleep for the backoff before `attempt` (1-based) and return the next base delay.
fn backoff(delay_ms: u64, config: &RetryConfig) -> u64 {
    let jitter = rand::random::<u64>() % delay_ms.max(1);
    std::thread::sleep(Duration::from_millis(delay_ms + jitter));
    (delay_ms * 2).min(config.retry_max_delay_ms)
}

/// Retry a closure on transient [`FloeError`]s with exponential backoff + jitter.
///
/// The closure is re-invoked from scratch, so it must reopen any stream it
/// consumes. Non-transient errors are returned immediately.
pub fn retry_with_backoff<T>(
    config: &RetryConfig,
    op_name: &str,
    mut f: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut delay_ms = config.retry_delay_ms;
    let mut attempt = 0usize;

    loop {
        match f() {
            Ok(val) => return Ok(val),
            Err(e) if e.is_transient() && attempt < config.max_retries => {
                attempt += 1;
                tracing::warn!(
                    "{op_name}: transient error (attempt {attempt}/{}), retrying: {e}",
                    config.max_retries,
                );
                delay_ms = backoff(delay_ms, config);
            }
            Err(e) if e.is_transient() => {
                return Err(FloeError::transport(
                    op_name,
                    format!("giving up after {} retries: {e}", config.max_retries),
                    false,
                ));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Retry a raw HTTP call on transient `ureq::Error`s. Used for multipart
/// parts, whose bodies are buffered and cheap to resend.
#[allow(clippy::result_large_err)]
pub fn retry_http<T>(
    config: &RetryConfig,
    op_name: &str,
    f: impl Fn() -> std::result::Result<T, ureq::Error>,
) -> std::result::Result<T, ureq::Error> {
    let mut delay_ms = config.retry_delay_ms;
    let mut attempt = 0usize;

    loop {
        match f() {
            Ok(val) => return Ok(val),
            Err(e) if is_retryable_http(&e) && attempt < config.max_retries => {
                attempt += 1;
                tracing::warn!(
                    "S3 {op_name}: transient error (attempt {attempt}/{}), retrying: {e}",
                    config.max_retries,
                );
                delay_ms = backoff(delay_ms, config);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Whether an HTTP error is transient and worth retrying.
pub fn is_retryable_http(err: &ureq::Error) -> bool {
    match err {
        ureq::Error::Transport(_) => true,
        ureq::Error::Status(code, _) => *code == 429 || *code >= 500,
    }
}

/// Whether an I/O error is transient and worth retrying.
pub fn is_retryable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}

/// Map a `ureq` error into a [`FloeError::Transport`], keeping the
/// transient classification.
pub fn http_error(op: &str, err: ureq::Error) -> FloeError {
    let transient = is_retryable_http(&err);
    let message = match err {
        ureq::Error::Status(code, resp) => {
            let body = resp.into_string().unwrap_or_default();
            let detail = body
                .split("<Code>")
                .nth(1)
                .and_then(|s| s.split("</Code>").next())
                .unwrap_or("");
            if detail.is_empty() {
                format!("HTTP {code}")
            } else {
                format!("HTTP {code} ({detail})")
            }
        }
        ureq::Error::Transport(t) => t.to_string(),
    };
    FloeError::transport(op, message, transient)
}

/// Map a body read error into a [`FloeError::Transport`].
pub fn body_error(op: &str, err: std::io::Error) -> FloeError {
    let transient = is_retryable_io(&err);
    FloeError::transport(op, format!("body read error: {err}"), transient)
}
