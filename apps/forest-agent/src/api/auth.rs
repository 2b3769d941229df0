//! Admin session tokens.
//!
//! The admin UI sends an HS256 JWT either as `Authorization: Bearer <token>`
//! or in the `forest_session_token` cookie. `id` and `rendering_id` may be
//! numbers or strings; both are normalized to their string form.

use axum::http::HeaderMap;
use axum::http::header::{AUTHORIZATION, COOKIE};
use chrono::{DateTime, Utc};
use forest_core::{RenderingId, User, UserId, identifier_string};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const SESSION_COOKIE: &str = "forest_session_token";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no session token")]
    MissingToken,

    #[error("invalid session token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),

    #[error("session token has no usable {0} claim")]
    BadClaim(&'static str),
}

/// Claims carried by a session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub id: Value,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub team: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_id: Option<Value>,
    pub rendering_id: Value,
    pub exp: i64,
}

impl Claims {
    fn into_user(self) -> Result<User, AuthError> {
        let id = identifier_string(&self.id).ok_or(AuthError::BadClaim("id"))?;
        let rendering = identifier_string(&self.rendering_id).ok_or(AuthError::BadClaim("rendering_id"))?;
        Ok(User {
            id: UserId(id),
            email: self.email,
            first_name: self.first_name,
            last_name: self.last_name,
            team: self.team,
            role_id: self.role_id.as_ref().and_then(identifier_string),
            rendering_id: RenderingId(rendering),
        })
    }
}

/// Raw token of a request, bearer header first.
pub fn token_from_headers(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if bearer.is_some() {
        return bearer;
    }

    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value)
}

/// Verify a token and build the user it describes.
pub fn decode_user(token: &str, secret: &str) -> Result<User, AuthError> {
    let validation = Validation::new(Algorithm::HS256);
    let data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;
    data.claims.into_user()
}

/// Authenticate a request from its headers.
pub fn authenticate(headers: &HeaderMap, secret: &str) -> Result<User, AuthError> {
    let token = token_from_headers(headers).ok_or(AuthError::MissingToken)?;
    decode_user(token, secret)
}

/// Sign a session token for `user`, mostly for hosts and tests.
pub fn issue_token(user: &User, secret: &str, expires_at: DateTime<Utc>) -> Result<String, AuthError> {
    let claims = Claims {
        id: Value::from(user.id.0.clone()),
        email: user.email.clone(),
        first_name: user.first_name.clone(),
        last_name: user.last_name.clone(),
        team: user.team.clone(),
        role_id: user.role_id.clone().map(Value::from),
        rendering_id: Value::from(user.rendering_id.0.clone()),
        exp: expires_at.timestamp(),
    };
    Ok(jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use axum::http::HeaderValue;
    use chrono::TimeDelta;
    use serde_json::json;

    const SECRET: &str = "auth-secret";

    fn later() -> DateTime<Utc> {
        Utc::now() + TimeDelta::hours(1)
    }

    #[test]
    fn bearer_header_wins_over_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        headers.insert(COOKIE, HeaderValue::from_static("forest_session_token=def"));
        assert_eq!(token_from_headers(&headers), Some("abc"));
    }

    #[test]
    fn cookie_is_found_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("csrftoken=x; forest_session_token=def; other=1"),
        );
        assert_eq!(token_from_headers(&headers), Some("def"));
        assert_eq!(token_from_headers(&HeaderMap::new()), None);
    }

    #[test]
    fn issued_tokens_round_trip() {
        let mut user = User::new("5", "1");
        user.first_name = "Guillaume".into();
        user.role_id = Some("3".into());
        let token = issue_token(&user, SECRET, later()).unwrap();
        assert_eq!(decode_user(&token, SECRET).unwrap(), user);
    }

    #[test]
    fn numeric_claims_are_normalized() {
        let claims = json!({"id": 1, "rendering_id": 1, "exp": later().timestamp()});
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        let user = decode_user(&token, SECRET).unwrap();
        assert_eq!(user.id, UserId("1".into()));
        assert_eq!(user.rendering_id, RenderingId("1".into()));
    }

    #[test]
    fn wrong_secret_and_expired_tokens_are_rejected() {
        let user = User::new("1", "1");
        let token = issue_token(&user, SECRET, later()).unwrap();
        assert!(matches!(decode_user(&token, "other"), Err(AuthError::Invalid(_))));

        let expired = issue_token(&user, SECRET, Utc::now() - TimeDelta::hours(2)).unwrap();
        assert!(matches!(decode_user(&expired, SECRET), Err(AuthError::Invalid(_))));
    }
}
