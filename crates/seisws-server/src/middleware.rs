use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, HeaderMap, Request},
    middleware::Next,
    response::Response,
};
use base64::Engine;
use seisws_access::IdentityProvider;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::api::{ApiError, Caller};
use crate::AppState;

fn client_ip(req: &Request<Body>) -> String {
    if let Some(forwarded) = req
        .headers()
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
    {
        return forwarded.trim().to_string();
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default()
}

fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Decodes `Authorization: Basic ...` into (user, password).
pub fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value
        .strip_prefix("Basic ")
        .or_else(|| value.strip_prefix("basic "))?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// Attaches an anonymous [`Caller`] to public service requests.
pub async fn caller_middleware(mut req: Request<Body>, next: Next) -> Response {
    let caller = Caller {
        identity: None,
        user_name: None,
        client_ip: client_ip(&req),
        user_agent: user_agent(req.headers()),
    };
    req.extensions_mut().insert(caller);
    next.run(req).await
}

/// Requires HTTP Basic credentials known to the user database.
///
/// Blacklisted users authenticate but carry the flag in their identity,
/// so every restricted stream is denied to them.
pub async fn auth_middleware(mut req: Request<Body>, next: Next) -> Result<Response, ApiError> {
    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or_else(|| ApiError::InternalServerError("application state missing".to_string()))?
        .clone();

    let (user, password) = basic_credentials(req.headers()).ok_or(ApiError::Unauthorized)?;
    let users = state.users.load();
    let Some(identity) = users.authenticate(&user, &password) else {
        tracing::info!(user = %user, "rejected credentials");
        return Err(ApiError::Unauthorized);
    };
    tracing::debug!(user = %user, blacklisted = identity.blacklisted, "authenticated");

    let caller = Caller {
        identity: Some(identity),
        user_name: Some(user),
        client_ip: client_ip(&req),
        user_agent: user_agent(req.headers()),
    };
    req.extensions_mut().insert(caller);
    Ok(next.run(req).await)
}
