use crate::config::AuthConfig;
use async_trait::async_trait;
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// Authenticated uploader identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credentials")]
    Missing,

    #[error("invalid token")]
    Invalid,
}

/// External collaborator that turns a bearer token into an identity.
///
/// Token issuance, rotation, and revocation live outside this service; the
/// gateway only needs an authenticated-identity-or-reject decision.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Verifier backed by the configured token list
pub struct StaticTokenVerifier {
    subjects: HashMap<String, String>,
}

impl StaticTokenVerifier {
    pub fn new(config: &AuthConfig) -> Self {
        let subjects = config
            .tokens
            .iter()
            .map(|entry| (entry.token.clone(), entry.subject.clone()))
            .collect();

        Self { subjects }
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        match self.subjects.get(token) {
            Some(subject) => {
                debug!(subject = %subject, "Upload token verified");
                Ok(Identity {
                    subject: subject.clone(),
                })
            }
            None => Err(AuthError::Invalid),
        }
    }
}

/// Extract the bearer token from request headers
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}
