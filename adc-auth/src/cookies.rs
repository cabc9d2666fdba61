use std::time::Duration;

use axum::http::header::SET_COOKIE;
use axum::http::HeaderValue;
use axum::response::Response;

pub const ACCESS_COOKIE: &str = "access_token";
pub const REFRESH_COOKIE: &str = "refresh_token";
pub const OAUTH_STATE_COOKIE: &str = "oauth_state";
pub const OAUTH_ORIGIN_COOKIE: &str = "oauth_origin_path";

/// Where the refresh cookie is replayed to — nothing else ever sees it.
pub const REFRESH_COOKIE_PATH: &str = "/auth/refresh";

/// Max age of the OAuth CSRF-state cookies.
pub const OAUTH_STATE_MAX_AGE: Duration = Duration::from_secs(10 * 60);

/// Cookie policy derived from runtime configuration: `Secure` in prod,
/// optional `Domain` for the refresh cookie.
#[derive(Clone, Debug, Default)]
pub struct CookiePolicy {
    pub secure: bool,
    pub refresh_domain: Option<String>,
}

impl CookiePolicy {
    /// Short-lived access cookie: `HttpOnly; SameSite=Lax; Path=/`.
    pub fn access_cookie(&self, token: &str, max_age: Duration) -> String {
        format!(
            "{ACCESS_COOKIE}={token}; HttpOnly; SameSite=Lax; Path=/; Max-Age={}{}",
            max_age.as_secs(),
            self.secure_suffix()
        )
    }

    /// Long-lived refresh cookie: `HttpOnly; SameSite=Strict`, scoped to
    /// the refresh path so no other endpoint ever receives it.
    pub fn refresh_cookie(&self, token: &str, max_age: Duration) -> String {
        format!(
            "{REFRESH_COOKIE}={token}; HttpOnly; SameSite=Strict; Path={REFRESH_COOKIE_PATH}; Max-Age={}{}{}",
            max_age.as_secs(),
            self.domain_suffix(),
            self.secure_suffix()
        )
    }

    /// OAuth CSRF-state cookie (10 minutes).
    pub fn oauth_state_cookie(&self, state: &str) -> String {
        format!(
            "{OAUTH_STATE_COOKIE}={state}; HttpOnly; SameSite=Lax; Path=/; Max-Age={}{}",
            OAUTH_STATE_MAX_AGE.as_secs(),
            self.secure_suffix()
        )
    }

    /// OAuth origin-path cookie (same policy as the state cookie).
    pub fn oauth_origin_cookie(&self, path: &str) -> String {
        format!(
            "{OAUTH_ORIGIN_COOKIE}={path}; HttpOnly; SameSite=Lax; Path=/; Max-Age={}{}",
            OAUTH_STATE_MAX_AGE.as_secs(),
            self.secure_suffix()
        )
    }

    /// Expire a cookie immediately.
    pub fn clear_cookie(&self, name: &str, path: &str) -> String {
        let domain = if name == REFRESH_COOKIE {
            self.domain_suffix()
        } else {
            String::new()
        };
        format!("{name}=; HttpOnly; Path={path}; Max-Age=0{domain}{}", self.secure_suffix())
    }

    fn secure_suffix(&self) -> &'static str {
        if self.secure {
            "; Secure"
        } else {
            ""
        }
    }

    fn domain_suffix(&self) -> String {
        match &self.refresh_domain {
            Some(domain) => format!("; Domain={domain}"),
            None => String::new(),
        }
    }
}

/// Append `Set-Cookie` headers to a response.
pub fn append_cookies(response: &mut Response, cookies: &[String]) {
    for cookie in cookies {
        if let Ok(value) = HeaderValue::from_str(cookie) {
            response.headers_mut().append(SET_COOKIE, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_cookie_shape() {
        let policy = CookiePolicy {
            secure: false,
            refresh_domain: None,
        };
        let cookie = policy.access_cookie("tok", Duration::from_secs(900));
        assert_eq!(
            cookie,
            "access_token=tok; HttpOnly; SameSite=Lax; Path=/; Max-Age=900"
        );
    }

    #[test]
    fn refresh_cookie_is_path_scoped_and_strict() {
        let policy = CookiePolicy {
            secure: true,
            refresh_domain: Some("example.com".into()),
        };
        let cookie = policy.refresh_cookie("tok", Duration::from_secs(2_592_000));
        assert!(cookie.contains("SameSite=Strict"));
        assert!(cookie.contains("Path=/auth/refresh"));
        assert!(cookie.contains("Domain=example.com"));
        assert!(cookie.ends_with("; Secure"));
    }

    #[test]
    fn state_cookie_expires_in_ten_minutes() {
        let policy = CookiePolicy::default();
        let cookie = policy.oauth_state_cookie("abc");
        assert!(cookie.contains("Max-Age=600"));
        assert!(cookie.contains("SameSite=Lax"));
    }

    #[test]
    fn clear_cookie_zeroes_max_age() {
        let policy = CookiePolicy::default();
        let cookie = policy.clear_cookie(ACCESS_COOKIE, "/");
        assert!(cookie.contains("Max-Age=0"));
        assert!(cookie.starts_with("access_token=;"));
    }
}
