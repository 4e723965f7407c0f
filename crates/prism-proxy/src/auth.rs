//! Client authentication and host binding.
//!
//! The `Host` header alone decides the tenant; forwarding headers like
//! `X-Forwarded-Host` are deliberately ignored so a client cannot steer
//! itself into another tenant's credentials.

use std::sync::OnceLock;

use axum::http::HeaderMap;
use regex::Regex;

use prism_core::error::PrismError;

fn domain_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9]([a-z0-9-.]*[a-z0-9])?(:[0-9]+)?$").expect("domain regex compiles")
    })
}

/// Extract and validate the request's Host. Lowercased; a `:port` suffix is
/// kept (credential lookup tries it first, then the bare domain).
pub fn extract_host(headers: &HeaderMap) -> Result<String, PrismError> {
    let raw = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| PrismError::Authentication("missing Host header".into()))?;

    let host = raw.trim().to_ascii_lowercase();

    // Reject anything that could smuggle a path or traverse the credentials
    // directory before the grammar check even runs.
    if host.contains('\0') || host.contains('/') || host.contains('\\') || host.contains("%2e") {
        return Err(PrismError::Authentication("invalid Host header".into()));
    }
    if !domain_regex().is_match(&host) {
        return Err(PrismError::Authentication("invalid Host header".into()));
    }
    Ok(host)
}

/// Parse `Authorization: Bearer <token>`. Scheme is case-insensitive,
/// followed by at least one whitespace character and a non-empty token.
pub fn bearer_token(headers: &HeaderMap) -> Result<String, PrismError> {
    let raw = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| PrismError::Authentication("missing Authorization header".into()))?;

    let mut parts = raw.trim().splitn(2, char::is_whitespace);
    let scheme = parts.next().unwrap_or_default();
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(PrismError::Authentication("unsupported auth scheme".into()));
    }
    let token = parts.next().map(str::trim).unwrap_or_default();
    if token.is_empty() {
        return Err(PrismError::Authentication("empty bearer token".into()));
    }
    Ok(token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, value.parse().unwrap());
        }
        map
    }

    #[test]
    fn host_is_lowercased_and_kept_with_port() {
        let h = headers(&[("host", "Example.COM:8443")]);
        assert_eq!(extract_host(&h).unwrap(), "example.com:8443");
    }

    #[test]
    fn forwarding_headers_are_ignored() {
        let h = headers(&[
            ("host", "tenant-a.example.com"),
            ("x-forwarded-host", "tenant-b.example.com"),
            ("x-original-host", "tenant-c.example.com"),
        ]);
        assert_eq!(extract_host(&h).unwrap(), "tenant-a.example.com");
    }

    #[test]
    fn hostile_hosts_are_rejected() {
        for bad in [
            "../etc/passwd",
            "a/b.example.com",
            "a\\b.example.com",
            "tenant%2e%2e.example.com",
            "-leading.example.com",
            "trailing.example.com-",
            "under_score.example.com",
            "",
        ] {
            let h = headers(&[("host", bad)]);
            assert!(extract_host(&h).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn missing_host_is_rejected() {
        assert!(extract_host(&HeaderMap::new()).is_err());
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        for value in ["Bearer tok-1", "bearer tok-1", "BEARER  tok-1"] {
            let h = headers(&[("authorization", value)]);
            assert_eq!(bearer_token(&h).unwrap(), "tok-1");
        }
    }

    #[test]
    fn non_bearer_or_empty_tokens_are_rejected() {
        for value in ["Basic dXNlcg==", "Bearer", "Bearer   ", "tok-1"] {
            let h = headers(&[("authorization", value)]);
            assert!(bearer_token(&h).is_err(), "accepted {value:?}");
        }
    }
}
