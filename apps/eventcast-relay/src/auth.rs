use axum::http::{header, HeaderMap, StatusCode};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;

/// Verified identity of the client behind a connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Identity {
    pub subject: Option<String>,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(subject: impl Into<String>) -> Self {
        Self {
            subject: Some(subject.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no token provided")]
    MissingToken,
    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("token does not name a user")]
    MissingSubject,
}

impl AuthError {
    /// Upgrade requests are rejected with 401 when no credentials were sent
    /// and 403 when the credentials were rejected.
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::MissingToken => StatusCode::UNAUTHORIZED,
            AuthError::InvalidToken(_) | AuthError::MissingSubject => StatusCode::FORBIDDEN,
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "missing_token",
            AuthError::InvalidToken(_) => "invalid_token",
            AuthError::MissingSubject => "missing_subject",
        }
    }
}

/// Hands the relay a verified identity for an upgrade request, or rejects it
/// before any connection state exists.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: Option<&str>) -> Result<Identity, AuthError>;
}

/// Accepts everyone. Used when no signing secret is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousAuthenticator;

impl Authenticator for AnonymousAuthenticator {
    fn authenticate(&self, _token: Option<&str>) -> Result<Identity, AuthError> {
        Ok(Identity::anonymous())
    }
}

#[derive(Debug, Deserialize)]
struct AccessTokenClaims {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    sub: Option<String>,
}

/// Validates HS256 tokens issued by the REST API with the shared secret.
#[derive(Clone)]
pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl Authenticator for JwtAuthenticator {
    fn authenticate(&self, token: Option<&str>) -> Result<Identity, AuthError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;
        let data = decode::<AccessTokenClaims>(token, &self.key, &self.validation)?;

        let subject = data
            .claims
            .id
            .or(data.claims.sub)
            .filter(|s| !s.trim().is_empty())
            .ok_or(AuthError::MissingSubject)?;
        Ok(Identity::user(subject))
    }
}

/// Pull a bearer token from the `Authorization` header, falling back to the
/// `token` query parameter since browsers cannot set headers on a WebSocket
/// upgrade.
pub fn extract_token<'a>(headers: &'a HeaderMap, query_token: Option<&'a str>) -> Option<&'a str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split_once(' '))
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
        .map(|(_, token)| token)
        .or(query_token)
}
