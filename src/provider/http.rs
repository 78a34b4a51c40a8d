//! Shared HTTP plumbing for registry clients: the pooled client builder,
//! the uniform status classification, and tolerant registry date parsing.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::StatusCode;

use crate::error::{DncError, DncResult};

pub const CLIENT_USER_AGENT: &str = "DCE-DNC-Client/1.0";

/// Build the pooled client every provider uses: bounded idle pool, idle
/// timeout, default per-request timeout, JSON accept header.
pub fn build_client(request_timeout: Duration) -> DncResult<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));

    reqwest::Client::builder()
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .timeout(request_timeout)
        .default_headers(headers)
        .build()
        .map_err(|e| DncError::Configuration(format!("http client build failed: {e}")))
}

/// Map a non-success HTTP status to the uniform error taxonomy.
pub fn classify_status(provider: &str, status: StatusCode, body: &str) -> DncError {
    let detail = if body.is_empty() {
        format!("{provider} returned HTTP {status}")
    } else {
        let trimmed: String = body.chars().take(200).collect();
        format!("{provider} returned HTTP {status}: {trimmed}")
    };

    match status.as_u16() {
        401 => DncError::AuthenticationFailed(detail),
        429 => DncError::RateLimitExceeded(detail),
        400 => DncError::InvalidRequest(detail),
        503 => DncError::ProviderUnavailable(detail),
        s if s >= 500 => DncError::ProviderUnavailable(detail),
        _ => DncError::InvalidResponse(detail),
    }
}

/// Parse a registry-supplied date that may be RFC 3339 or bare
/// `YYYY-MM-DD`. A miss is absent, never an error — registries are not
/// consistent and a bad date must not fail a lookup.
pub fn parse_flexible_date(raw: &str) -> Option<DateTime<Utc>> {
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_table() {
        let classify = |code: u16| {
            classify_status("ftc", StatusCode::from_u16(code).unwrap(), "")
        };
        assert!(matches!(classify(401), DncError::AuthenticationFailed(_)));
        assert!(matches!(classify(429), DncError::RateLimitExceeded(_)));
        assert!(matches!(classify(400), DncError::InvalidRequest(_)));
        assert!(matches!(classify(503), DncError::ProviderUnavailable(_)));
        assert!(matches!(classify(502), DncError::ProviderUnavailable(_)));
        assert!(matches!(classify(404), DncError::InvalidResponse(_)));

        assert!(classify(429).is_retryable());
        assert!(classify(503).is_retryable());
        assert!(!classify(401).is_retryable());
        assert!(!classify(400).is_retryable());
    }

    #[test]
    fn test_flexible_dates() {
        let iso = parse_flexible_date("2024-06-01").unwrap();
        assert_eq!(iso.format("%Y-%m-%d %H:%M").to_string(), "2024-06-01 00:00");

        let rfc = parse_flexible_date("2024-06-01T12:30:00Z").unwrap();
        assert_eq!(rfc.format("%H:%M").to_string(), "12:30");

        assert!(parse_flexible_date("06/01/2024").is_none());
        assert!(parse_flexible_date("").is_none());
    }
}
