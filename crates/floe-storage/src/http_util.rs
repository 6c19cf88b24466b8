use chrono::{DateTime, Utc};

use floe_types::error::{FloeError, Result};

use crate::RestoreStatus;

/// Extract and parse the `Content-Length` header from an HTTP response.
pub fn extract_content_length(resp: &ureq::Response, context: &str) -> Result<u64> {
    let header = resp.header("Content-Length").ok_or_else(|| {
        FloeError::Other(format!("{context}: response missing Content-Length header"))
    })?;
    header
        .parse::<u64>()
        .map_err(|_| FloeError::Other(format!("{context}: invalid Content-Length header: {header}")))
}

/// Strip the surrounding quotes S3 puts on etags.
pub fn clean_etag(raw: &str) -> String {
    raw.trim().trim_matches('"').to_string()
}

/// Parse the `x-amz-restore` header.
///
/// `ongoing-request="true"` means the thaw is still running;
/// `ongoing-request="false", expiry-date="..."` means a readable copy exists.
pub fn parse_restore_header(value: Option<&str>) -> RestoreStatus {
    let Some(value) = value else {
        return RestoreStatus::NotRequested;
    };
    if value.contains("ongoing-request=\"true\"") {
        return RestoreStatus::InProgress;
    }
    if value.contains("ongoing-request=\"false\"") {
        let expires = value
            .split("expiry-date=\"")
            .nth(1)
            .and_then(|s| s.split('"').next())
            .map(str::to_string);
        return RestoreStatus::Available { expires };
    }
    RestoreStatus::NotRequested
}

/// Parse either an RFC 2822 HTTP date or an RFC 3339 listing timestamp.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_rfc2822(raw))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
