//! Optional authentication for push and dashboard endpoints.
//!
//! Device delivery endpoints are open: a tile only needs to know its id.
//! Endpoints that change what a tile shows, or observe it, accept a token
//! either as a query parameter or a bearer header:
//!
//! ```text
//! POST /v0/devices/tile-1/push?token=s3cret
//! Authorization: Bearer s3cret
//! ```
//!
//! A request is allowed if the token matches the device's own API key or the
//! server-wide token. With neither configured, access is open.

use std::collections::HashMap;

use crate::model::Device;

/// Authentication error returned when token validation fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthError {
    pub message: &'static str,
}

impl AuthError {
    pub fn new(message: &'static str) -> Self {
        Self { message }
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AuthError {}

/// Token presented with a request, if any.
#[derive(Debug, Clone, Default)]
pub struct TokenAuth {
    pub token: Option<String>,
}

impl TokenAuth {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }

    /// Validate the token against an expected value.
    pub fn validate(&self, expected: &str) -> Result<(), AuthError> {
        match &self.token {
            Some(token) if token == expected => Ok(()),
            Some(_) => Err(AuthError::new("Invalid token")),
            None => Err(AuthError::new("Missing token")),
        }
    }

    /// Validate against the server token. No server token means open access.
    pub fn validate_server(&self, server_token: Option<&str>) -> Result<(), AuthError> {
        match server_token {
            Some(expected) => self.validate(expected),
            None => Ok(()),
        }
    }

    /// Validate for an operation on `device`.
    ///
    /// Either the device API key or the server token is accepted.
    pub fn authorize_device(
        &self,
        device: &Device,
        server_token: Option<&str>,
    ) -> Result<(), AuthError> {
        let accepted: Vec<&str> = device
            .api_key
            .as_deref()
            .into_iter()
            .chain(server_token)
            .filter(|t| !t.is_empty())
            .collect();
        if accepted.is_empty() {
            return Ok(());
        }
        match &self.token {
            Some(token) if accepted.contains(&token.as_str()) => Ok(()),
            Some(_) => Err(AuthError::new("Invalid token")),
            None => Err(AuthError::new("Missing token")),
        }
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Extract the `token` parameter from a query string.
    pub fn from_query_string(query: &str) -> Self {
        let params: HashMap<_, _> = form_urlencoded::parse(query.as_bytes()).collect();
        Self {
            token: params.get("token").map(|s| s.to_string()),
        }
    }

    /// Extract the token from an `Authorization: Bearer` header value.
    pub fn from_bearer(header: &str) -> Self {
        let token = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        Self { token }
    }
}

#[cfg(feature = "axum")]
mod axum_impl {
    use super::*;
    use axum::extract::FromRequestParts;
    use axum::http::request::Parts;
    use axum::http::{header, StatusCode};

    /// Reads `?token=` first, then an `Authorization: Bearer` header.
    impl<S> FromRequestParts<S> for TokenAuth
    where
        S: Send + Sync,
    {
        type Rejection = (StatusCode, &'static str);

        async fn from_request_parts(
            parts: &mut Parts,
            _state: &S,
        ) -> Result<Self, Self::Rejection> {
            let from_query = parts
                .uri
                .query()
                .map(TokenAuth::from_query_string)
                .filter(TokenAuth::has_token);
            if let Some(auth) = from_query {
                return Ok(auth);
            }

            let from_header = parts
                .headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(TokenAuth::from_bearer)
                .unwrap_or_default();
            Ok(from_header)
        }
    }
}
