//! Scope and ownership evaluation.
//!
//! Two independent checks: the request must carry the right scope for
//! the operation, and for submission-bucket documents the requester
//! must be the owner, a delegate of the owner, or hold the admin
//! scope. Announced e-prints need no ownership check. Token
//! verification itself is an external collaborator behind
//! [`TokenVerifier`].

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Bucket;

pub const SCOPE_READ: &str = "fulltext:read";
pub const SCOPE_CREATE: &str = "fulltext:create";
/// Global privilege: may act on any submission regardless of owner.
pub const SCOPE_ADMIN: &str = "fulltext:admin";

/// Verified identity attached to a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub subject: String,
    pub scopes: Vec<String>,
    /// Owners this identity may act on behalf of.
    #[serde(default)]
    pub delegations: Vec<String>,
}

impl Claims {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing required scope `{0}`")]
    MissingScope(&'static str),
    #[error("requester is not the owner of this submission")]
    NotOwner,
}

/// Authorize a GET-equivalent operation.
pub fn authorize_read(
    claims: &Claims,
    bucket: Bucket,
    owner: Option<&str>,
) -> Result<(), AuthError> {
    authorize(claims, SCOPE_READ, bucket, owner)
}

/// Authorize a POST-equivalent (extraction-triggering) operation.
pub fn authorize_trigger(
    claims: &Claims,
    bucket: Bucket,
    owner: Option<&str>,
) -> Result<(), AuthError> {
    authorize(claims, SCOPE_CREATE, bucket, owner)
}

fn authorize(
    claims: &Claims,
    scope: &'static str,
    bucket: Bucket,
    owner: Option<&str>,
) -> Result<(), AuthError> {
    if !claims.has_scope(scope) {
        return Err(AuthError::MissingScope(scope));
    }
    if bucket != Bucket::Submission {
        return Ok(());
    }
    if claims.has_scope(SCOPE_ADMIN) {
        return Ok(());
    }
    // A submission with no recorded owner is accessible to no one but
    // admins.
    let Some(owner) = owner else {
        return Err(AuthError::NotOwner);
    };
    if claims.subject == owner || claims.delegations.iter().any(|d| d == owner) {
        Ok(())
    } else {
        Err(AuthError::NotOwner)
    }
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("invalid token")]
    InvalidToken,
    #[error("auth service error: {0}")]
    Upstream(#[from] reqwest::Error),
}

/// The auth collaborator: turns a bearer token into [`Claims`].
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Claims, VerifyError>;
}

/// Verifier backed by an HTTP auth service.
pub struct HttpTokenVerifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTokenVerifier {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl TokenVerifier for HttpTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Claims, VerifyError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(VerifyError::InvalidToken);
        }
        Ok(response.json::<Claims>().await?)
    }
}

/// Fixed token table for tests and local development.
#[derive(Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Claims>,
}

impl StaticTokenVerifier {
    pub fn new(tokens: HashMap<String, Claims>) -> Self {
        Self { tokens }
    }

    pub fn insert(mut self, token: impl Into<String>, claims: Claims) -> Self {
        self.tokens.insert(token.into(), claims);
        self
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Claims, VerifyError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(VerifyError::InvalidToken)
    }
}
