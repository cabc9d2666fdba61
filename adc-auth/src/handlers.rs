use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::cookie::CookieJar;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use adc_identity::{NewUser, User};

use crate::cookies::{
    append_cookies, ACCESS_COOKIE, OAUTH_ORIGIN_COOKIE, OAUTH_STATE_COOKIE, REFRESH_COOKIE,
    REFRESH_COOKIE_PATH,
};
use crate::error::AuthError;
use crate::geo;
use crate::oauth::{random_state, OAuthUserProfile};
use crate::state::AuthState;
use crate::token::{IssueContext, SessionSeed, TokenPair};

/// Response header hinting that the access token only verified under the
/// previous sealing key and should be refreshed.
pub const REFRESH_REQUIRED_HEADER: &str = "x-token-refresh-required";

/// Build the auth endpoint router.
pub fn auth_routes(state: AuthState) -> Router {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/register", post(register))
        .route("/auth/session", get(session))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
        .route("/auth/oauth/{provider}", get(oauth_start))
        .route("/auth/oauth/{provider}/callback", get(oauth_callback))
        .with_state(state)
}

// ── Request / response bodies ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub org_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OrgChoiceResponse {
    requires_org_selection: bool,
    orgs: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthStartParams {
    #[serde(default)]
    pub return_to: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OAuthCallbackParams {
    pub code: String,
    pub state: String,
}

// ── Handlers ────────────────────────────────────────────────────────────

/// POST /auth/login — native credential login.
async fn login(
    State(state): State<AuthState>,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> Result<Response, AuthError> {
    let username = req.username.trim();
    if username.is_empty() || req.password.is_empty() {
        return Err(AuthError::Validation("username and password are required".into()));
    }

    // Failed attempts are keyed by username even before an account is
    // resolved, so unknown-user probing consumes that name's budget.
    let status = state.tracker.status(username).await;
    if status.blocked {
        return Err(AuthError::Blocked {
            blocked_until: status.blocked_until,
            permanent: status.permanent,
        });
    }

    let users = state.identity.users();
    let verified = match users.find_by_username(username).await? {
        Some(user) => {
            if adc_identity::verify_password(&user.password_hash, &req.password).await {
                Some(user)
            } else {
                state
                    .tracker
                    .record_login_failure(username, Some(&user.id))
                    .await;
                None
            }
        }
        None => {
            state.tracker.record_login_failure(username, None).await;
            None
        }
    };
    let Some(mut user) = verified else {
        return Err(AuthError::InvalidCredentials);
    };

    if user.permanently_blocked {
        return Err(AuthError::Blocked {
            blocked_until: None,
            permanent: true,
        });
    }

    // Organization selection: a user attached to several orgs must pick
    // one before tokens are issued.
    let orgs = available_orgs(&user);
    let selected_org = match (&req.org_id, orgs.len()) {
        (Some(requested), _) => {
            if !orgs.iter().any(|o| o == requested) {
                return Err(AuthError::Validation(format!(
                    "user does not belong to org '{requested}'"
                )));
            }
            Some(requested.clone())
        }
        (None, 0) => None,
        (None, 1) => Some(orgs[0].clone()),
        (None, _) => {
            return Ok(Json(OrgChoiceResponse {
                requires_org_selection: true,
                orgs,
            })
            .into_response())
        }
    };
    user.org_id = selected_org;

    state.tracker.record_login_success(username).await;

    let pair = issue_for(&state, &user, "native", &headers).await?;
    debug!(username, "Login succeeded");
    Ok(respond_with_cookies(&state, Json(user.profile()).into_response(), &pair))
}

/// POST /auth/register — create an account and log it in.
async fn register(
    State(state): State<AuthState>,
    headers: HeaderMap,
    Json(req): Json<RegisterRequest>,
) -> Result<Response, AuthError> {
    if req.username.trim().is_empty() || req.password.is_empty() || req.email.trim().is_empty() {
        return Err(AuthError::Validation(
            "username, email, and password are required".into(),
        ));
    }

    let user = state
        .identity
        .users()
        .create_user(
            NewUser {
                username: req.username.trim().to_string(),
                password: req.password,
                email: Some(req.email.trim().to_string()),
                ..Default::default()
            },
            None,
        )
        .await?;

    let pair = issue_for(&state, &user, "native", &headers).await?;
    Ok(respond_with_cookies(&state, Json(user.profile()).into_response(), &pair))
}

/// GET /auth/session — verify the access cookie.
async fn session(
    State(state): State<AuthState>,
    jar: CookieJar,
) -> Result<Response, AuthError> {
    let Some(cookie) = jar.get(ACCESS_COOKIE) else {
        return Ok(Json(SessionResponse {
            authenticated: false,
            user: None,
        })
        .into_response());
    };

    let verified = state.tokens.verify_access_token(cookie.value())?;

    let user = state
        .identity
        .users()
        .find_by_id(&verified.claims.user_id)
        .await?;
    let Some(user) = user else {
        return Ok(Json(SessionResponse {
            authenticated: false,
            user: None,
        })
        .into_response());
    };

    let mut response = Json(SessionResponse {
        authenticated: true,
        user: Some(user.profile()),
    })
    .into_response();
    if verified.used_previous_key {
        response.headers_mut().insert(
            REFRESH_REQUIRED_HEADER,
            axum::http::HeaderValue::from_static("true"),
        );
    }
    Ok(response)
}

/// POST /auth/refresh — rotate the refresh token and reissue cookies.
async fn refresh(
    State(state): State<AuthState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<Response, AuthError> {
    let Some(cookie) = jar.get(REFRESH_COOKIE) else {
        return Err(AuthError::MissingToken);
    };
    let presented = cookie.value().to_string();

    let record = state
        .tokens
        .refresh_store()
        .find_by_token(&presented)
        .await?
        .ok_or(AuthError::RefreshTokenNotFound)?;
    let user_id = record.user_id.clone();

    let status = state.tracker.status(&user_id).await;
    if status.blocked {
        return Err(AuthError::Blocked {
            blocked_until: status.blocked_until,
            permanent: status.permanent,
        });
    }

    // Geographic change invalidates every session of the user.
    let current_country = geo::country_from_headers(&headers);
    if geo::country_changed(record.country.as_deref(), current_country.as_deref()) {
        warn!(user_id, "Refresh refused: country changed");
        state
            .tokens
            .refresh_store()
            .revoke_all_for_user(&user_id)
            .await?;
        return Err(AuthError::GeoChanged);
    }

    let ctx = issue_context(&headers);
    let identity = state.identity.clone();
    let result = state
        .tokens
        .refresh_tokens(&presented, &ctx, move |uid| async move {
            let Some(user) = identity.users().find_by_id(&uid).await? else {
                return Ok(None);
            };
            if user.permanently_blocked {
                return Ok(None);
            }
            let permissions = identity
                .resolver()
                .resolve_permissions(&uid, user.org_id.as_deref())
                .await?
                .iter()
                .map(|p| p.encode())
                .collect();
            Ok(Some(SessionSeed { user, permissions }))
        })
        .await;

    match result {
        Ok((pair, _user)) => {
            let mut response = Json(serde_json::json!({ "success": true })).into_response();
            append_pair_cookies(&state, &mut response, &pair);
            Ok(response)
        }
        Err(err) => {
            // Replays of dead tokens feed the escalation counter; losing
            // a live rotation race does not. The block itself is enforced
            // on the next call.
            if matches!(
                err,
                AuthError::RefreshTokenNotFound | AuthError::RefreshTokenExpired
            ) {
                state
                    .tracker
                    .record_refresh_failure(&user_id, Some(&user_id))
                    .await;
            }
            Err(err)
        }
    }
}

/// POST /auth/logout — revoke the refresh token and clear cookies.
async fn logout(State(state): State<AuthState>, jar: CookieJar) -> Result<Response, AuthError> {
    if let Some(cookie) = jar.get(REFRESH_COOKIE) {
        state.tokens.refresh_store().revoke(cookie.value()).await?;
    }

    let mut response = Json(serde_json::json!({ "success": true })).into_response();
    append_cookies(
        &mut response,
        &[
            state.cookies.clear_cookie(ACCESS_COOKIE, "/"),
            state.cookies.clear_cookie(REFRESH_COOKIE, REFRESH_COOKIE_PATH),
        ],
    );
    Ok(response)
}

/// GET /auth/oauth/{provider} — store CSRF state and redirect out.
async fn oauth_start(
    State(state): State<AuthState>,
    Path(provider_id): Path<String>,
    Query(params): Query<OAuthStartParams>,
) -> Result<Response, AuthError> {
    let provider = state.oauth.get(&provider_id)?;

    let csrf_state = random_state();
    let redirect_uri = callback_uri(&state, provider.id());
    let url = provider.authorization_url(&csrf_state, &redirect_uri);

    let origin_path = params
        .return_to
        .filter(|p| p.starts_with('/'))
        .unwrap_or_else(|| "/".to_string());

    let mut response = Redirect::temporary(&url).into_response();
    append_cookies(
        &mut response,
        &[
            state.cookies.oauth_state_cookie(&csrf_state),
            state.cookies.oauth_origin_cookie(&origin_path),
        ],
    );
    Ok(response)
}

/// GET /auth/oauth/{provider}/callback — validate state, exchange the
/// code, link or create the user, and issue cookies.
async fn oauth_callback(
    State(state): State<AuthState>,
    Path(provider_id): Path<String>,
    Query(params): Query<OAuthCallbackParams>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<Response, AuthError> {
    let provider = state.oauth.get(&provider_id)?;

    let stored_state = jar
        .get(OAUTH_STATE_COOKIE)
        .map(|c| c.value().to_string())
        .ok_or(AuthError::OAuthStateMismatch)?;
    if stored_state != params.state {
        return Err(AuthError::OAuthStateMismatch);
    }

    let redirect_uri = callback_uri(&state, provider.id());
    let provider_token = provider.exchange_code(&params.code, &redirect_uri).await?;
    let profile = provider.user_profile(&provider_token).await?;

    let user = link_or_create_user(&state, provider.id(), &profile).await?;
    let pair = issue_for(&state, &user, provider.id(), &headers).await?;

    let origin_path = jar
        .get(OAUTH_ORIGIN_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|p| p.starts_with('/'))
        .unwrap_or_else(|| "/".to_string());

    let mut response = Redirect::temporary(&origin_path).into_response();
    append_pair_cookies(&state, &mut response, &pair);
    append_cookies(
        &mut response,
        &[
            state.cookies.clear_cookie(OAUTH_STATE_COOKIE, "/"),
            state.cookies.clear_cookie(OAUTH_ORIGIN_COOKIE, "/"),
        ],
    );
    Ok(response)
}

/// Build the OAuth redirect URI for a provider, matching the
/// `/auth/oauth/{provider}/callback` route registered in [`auth_routes`].
fn callback_uri(state: &AuthState, provider_id: &str) -> String {
    format!("{}/auth/oauth/{}/callback", state.base_url, provider_id)
}

// ── Helpers ─────────────────────────────────────────────────────────────

/// Match the OAuth profile to an existing account (provider id first,
/// then email) and link it, or create a fresh account with a random
/// password and the provider id recorded.
async fn link_or_create_user(
    state: &AuthState,
    provider_id: &str,
    profile: &OAuthUserProfile,
) -> Result<User, AuthError> {
    let users = state.identity.users();
    let id_key = format!("{provider_id}Id");

    if let Some(user) = users
        .find_by_provider_id(provider_id, &profile.provider_user_id)
        .await?
    {
        return Ok(user);
    }

    let mut link_entries = serde_json::Map::new();
    link_entries.insert(
        id_key.clone(),
        serde_json::Value::String(profile.provider_user_id.clone()),
    );
    if let Some(avatar) = &profile.avatar {
        link_entries.insert("avatar".into(), serde_json::Value::String(avatar.clone()));
    }

    if let Some(email) = &profile.email {
        if let Some(existing) = users.find_by_email(email).await? {
            debug!(provider = provider_id, user_id = %existing.id, "Linking OAuth identity by email");
            let linked = users.merge_metadata(&existing.id, link_entries, None).await?;
            return Ok(linked);
        }
    }

    // First login through this provider: create the account.
    let mut metadata = link_entries;
    metadata.insert(
        "provider".into(),
        serde_json::Value::String(provider_id.to_string()),
    );

    let mut username = profile.username.clone();
    if users.find_by_username(&username).await?.is_some() {
        username = format!("{username}-{}", &profile.provider_user_id);
    }

    let user = users
        .create_user(
            NewUser {
                username,
                password: random_state(),
                email: profile.email.clone(),
                metadata,
                ..Default::default()
            },
            None,
        )
        .await?;
    Ok(user)
}

/// Resolve permissions and issue a token pair for a user.
async fn issue_for(
    state: &AuthState,
    user: &User,
    provider: &str,
    headers: &HeaderMap,
) -> Result<TokenPair, AuthError> {
    let permissions = state
        .identity
        .resolver()
        .resolve_permissions(&user.id, user.org_id.as_deref())
        .await?
        .iter()
        .map(|p| p.encode())
        .collect();

    let ctx = issue_context(headers);
    state
        .tokens
        .create_token_pair(user, permissions, provider, &ctx)
        .await
}

fn issue_context(headers: &HeaderMap) -> IssueContext {
    let device_id = header_value(headers, "x-device-id")
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let ip_address = header_value(headers, "x-forwarded-for")
        .map(|v| v.split(',').next().unwrap_or("").trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    IssueContext {
        device_id,
        ip_address,
        country: geo::country_from_headers(headers),
        user_agent: header_value(headers, "user-agent").unwrap_or_default(),
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

/// Orgs a user may log into: the `orgIds` metadata list, or the single
/// `orgId` field.
fn available_orgs(user: &User) -> Vec<String> {
    if let Some(list) = user.metadata.get("orgIds").and_then(|v| v.as_array()) {
        let orgs: Vec<String> = list
            .iter()
            .filter_map(|v| v.as_str())
            .map(String::from)
            .collect();
        if !orgs.is_empty() {
            return orgs;
        }
    }
    user.org_id.clone().into_iter().collect()
}

fn respond_with_cookies(state: &AuthState, mut response: Response, pair: &TokenPair) -> Response {
    append_pair_cookies(state, &mut response, pair);
    response
}

fn append_pair_cookies(state: &AuthState, response: &mut Response, pair: &TokenPair) {
    append_cookies(
        response,
        &[
            state
                .cookies
                .access_cookie(&pair.access_token, pair.access_expires_in),
            state
                .cookies
                .refresh_cookie(&pair.refresh_token, pair.refresh_expires_in),
        ],
    );
}
