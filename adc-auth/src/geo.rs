use axum::http::HeaderMap;

/// Trusted header carrying the request's country code, set by the edge
/// proxy. Two uppercase letters; `XX` and `T1` are sentinel values for
/// "unknown".
pub const COUNTRY_HEADER: &str = "x-forwarded-country";

const UNKNOWN_SENTINELS: [&str; 2] = ["XX", "T1"];

/// Extract the country code from the trusted header.
///
/// Returns `None` for a missing header, a malformed value, or a sentinel.
pub fn country_from_headers(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(COUNTRY_HEADER)?.to_str().ok()?.trim();
    normalize_country(value)
}

/// Normalize a raw country value: uppercase two-letter codes only,
/// sentinels mapped to unknown.
pub fn normalize_country(raw: &str) -> Option<String> {
    let code = raw.trim().to_ascii_uppercase();
    if code.len() != 2 || !code.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return None;
    }
    if UNKNOWN_SENTINELS.contains(&code.as_str()) {
        return None;
    }
    Some(code)
}

/// True when a refresh must be refused: both countries known and
/// different. An unknown on either side is accepted.
pub fn country_changed(stored: Option<&str>, current: Option<&str>) -> bool {
    match (stored, current) {
        (Some(stored), Some(current)) => stored != current,
        _ => false,
    }
}
