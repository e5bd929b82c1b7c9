//! Auth plumbing: token cookies or an externally supplied OIDC identity.
//!
//! The two modes are mutually exclusive per deployment. In token mode each
//! interactive component (`webtty`, `webchat`, `dashboard`, `webmeet`)
//! validates against its own token from the secret store and sets an
//! HttpOnly SameSite=Strict cookie. In OIDC mode the reverse proxy in front
//! of the router injects identity headers; handlers make their own
//! authorisation decisions from the attached identity.

use std::sync::Arc;

use {
    axum::{
        Json,
        extract::{Path, State},
        http::{HeaderMap, StatusCode, header},
        response::{IntoResponse, Response},
    },
    serde::{Deserialize, Serialize},
};

use crate::state::GatewayState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Token,
    Oidc,
}

/// The authenticated caller attached to a request.
#[derive(Debug, Clone, Serialize)]
pub struct Identity {
    pub id: String,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    pub method: &'static str,
}

/// Token env var for an interactive component, if it is one.
pub fn token_env_for(app: &str) -> Option<&'static str> {
    match app {
        "webtty" => Some("WEBTTY_TOKEN"),
        "webchat" => Some("WEBCHAT_TOKEN"),
        "dashboard" => Some("WEBDASHBOARD_TOKEN"),
        "webmeet" => Some("WEBMEET_TOKEN"),
        _ => None,
    }
}

fn cookie_name(app: &str) -> String {
    format!("ploinky_{app}_auth")
}

/// Parse one cookie value out of a `Cookie` header.
pub fn parse_cookie<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    for part in header.split(';') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix(name)
            && let Some(value) = value.strip_prefix('=')
        {
            return Some(value);
        }
    }
    None
}

fn identity_from_headers(headers: &HeaderMap) -> Option<Identity> {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    let id = get("x-auth-user-id").or_else(|| get("x-forwarded-user"))?;
    Some(Identity {
        username: get("x-auth-username").unwrap_or_else(|| id.clone()),
        email: get("x-auth-email"),
        roles: get("x-auth-roles")
            .map(|r| r.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default(),
        id,
        method: "oidc",
    })
}

/// Resolve the caller's identity for a component, or `None` when the
/// request carries no valid credential.
pub fn authenticate(state: &GatewayState, app: &str, headers: &HeaderMap) -> Option<Identity> {
    match state.auth_mode {
        AuthMode::Oidc => identity_from_headers(headers),
        AuthMode::Token => {
            let env = token_env_for(app)?;
            let expected = state.store.resolve_var_value(env)?;
            let cookies = headers
                .get(header::COOKIE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            let presented = parse_cookie(cookies, &cookie_name(app))?;
            if presented == expected {
                Some(Identity {
                    id: app.to_string(),
                    username: format!("{app}-user"),
                    email: None,
                    roles: Vec::new(),
                    method: "token",
                })
            } else {
                None
            }
        },
    }
}

#[derive(Debug, Deserialize)]
pub struct AuthRequest {
    pub token: String,
}

/// `POST /<app>/auth` — legacy token login; sets the component cookie.
pub async fn auth_handler(
    State(state): State<Arc<GatewayState>>,
    Path(app): Path<String>,
    Json(body): Json<AuthRequest>,
) -> Response {
    if state.auth_mode == AuthMode::Oidc {
        return error_response(
            StatusCode::CONFLICT,
            "forbidden",
            "token auth is disabled under OIDC",
        );
    }
    let Some(env) = token_env_for(&app) else {
        return error_response(StatusCode::NOT_FOUND, "internal", "unknown component");
    };
    let expected = state.store.resolve_var_value(env);
    if expected.as_deref() != Some(body.token.as_str()) {
        return error_response(StatusCode::FORBIDDEN, "forbidden", "invalid token");
    }
    let cookie = format!(
        "{}={}; HttpOnly; SameSite=Strict; Path=/",
        cookie_name(&app),
        body.token
    );
    (
        [(header::SET_COOKIE, cookie)],
        Json(serde_json::json!({ "ok": true })),
    )
        .into_response()
}

/// `GET /<app>/whoami` — report the authenticated identity.
pub async fn whoami_handler(
    State(state): State<Arc<GatewayState>>,
    Path(app): Path<String>,
    headers: HeaderMap,
) -> Response {
    match authenticate(&state, &app, &headers) {
        Some(identity) => Json(serde_json::json!({
            "authenticated": true,
            "user": identity,
        }))
        .into_response(),
        None => Json(serde_json::json!({ "authenticated": false })).into_response(),
    }
}

pub fn error_response(status: StatusCode, error: &str, detail: &str) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": error, "detail": detail })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cookie() {
        assert_eq!(
            parse_cookie("ploinky_webtty_auth=tok; other=x", "ploinky_webtty_auth"),
            Some("tok")
        );
        assert_eq!(
            parse_cookie("a=1; ploinky_webtty_auth=tok", "ploinky_webtty_auth"),
            Some("tok")
        );
        assert_eq!(parse_cookie("a=1", "ploinky_webtty_auth"), None);
    }

    #[test]
    fn test_token_env_mapping() {
        assert_eq!(token_env_for("webtty"), Some("WEBTTY_TOKEN"));
        assert_eq!(token_env_for("dashboard"), Some("WEBDASHBOARD_TOKEN"));
        assert_eq!(token_env_for("blobs"), None);
    }

    #[test]
    fn test_identity_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-auth-user-id", "u1".parse().unwrap());
        headers.insert("x-auth-email", "u1@example.com".parse().unwrap());
        headers.insert("x-auth-roles", "admin, dev".parse().unwrap());
        let identity = identity_from_headers(&headers).unwrap();
        assert_eq!(identity.id, "u1");
        assert_eq!(identity.roles, vec!["admin", "dev"]);
        assert_eq!(identity.method, "oidc");

        assert!(identity_from_headers(&HeaderMap::new()).is_none());
    }
}
