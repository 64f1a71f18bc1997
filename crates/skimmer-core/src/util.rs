use url::Url;

use crate::error::AppError;

/// Parse a job URL, accepting only absolute http/https URLs with a host.
pub fn parse_job_url(raw: &str) -> Result<Url, AppError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(AppError::ValidationError("url must not be empty".into()));
    }
    let url = Url::parse(raw)
        .map_err(|e| AppError::ValidationError(format!("invalid url '{raw}': {e}")))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(AppError::ValidationError(format!(
                "unsupported url scheme '{other}', expected http or https"
            )));
        }
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(AppError::ValidationError(format!("url '{raw}' has no host")));
    }
    Ok(url)
}

/// Rate-limit domain of a URL: host lowercased, leading `www.` removed.
///
/// Example: `"https://WWW.Example.com/a?b"` → `"example.com"`
pub fn domain_of(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    let host = url.host_str()?.trim_end_matches('.').to_lowercase();
    if host.is_empty() {
        return None;
    }
    Some(match host.strip_prefix("www.") {
        Some(rest) => rest.to_string(),
        None => host,
    })
}

// xorshift seeded from the clock; jitter only, not crypto.
pub(crate) fn rand_jitter_ms(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let mut x = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
        | 1;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x % max_ms
}
