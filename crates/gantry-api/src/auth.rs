//! Request rejection policies.

use crate::error::ApiError;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use gantry_config::AuthConfig;
use std::collections::HashSet;
use std::sync::Arc;

/// Decides whether a request may see a resource before any data is served.
pub trait RejectionPolicy: Send + Sync {
    fn is_authenticated(&self, headers: &HeaderMap) -> bool;

    /// Public resources are visible to everyone; private ones need credentials.
    fn authorize(&self, headers: &HeaderMap, public: bool) -> Result<(), ApiError> {
        if public || self.is_authenticated(headers) {
            Ok(())
        } else {
            Err(unauthorized())
        }
    }

    /// Turn a failed lookup into a rejection for unauthenticated callers.
    ///
    /// A missing resource then looks the same as a private one, so ids
    /// cannot be told apart without credentials.
    fn conceal_missing(&self, headers: &HeaderMap, err: ApiError) -> ApiError {
        match err {
            ApiError::NotFound(_) if !self.is_authenticated(headers) => unauthorized(),
            other => other,
        }
    }
}

fn unauthorized() -> ApiError {
    ApiError::Unauthorized("missing or invalid credentials".to_string())
}

/// Accepts every request. Used when no tokens are configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenPolicy;

impl RejectionPolicy for OpenPolicy {
    fn is_authenticated(&self, _headers: &HeaderMap) -> bool {
        true
    }
}

/// Accepts requests carrying one of a fixed set of bearer tokens.
#[derive(Debug, Clone)]
pub struct TokenPolicy {
    tokens: HashSet<String>,
}

impl TokenPolicy {
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }
}

impl RejectionPolicy for TokenPolicy {
    fn is_authenticated(&self, headers: &HeaderMap) -> bool {
        bearer_token(headers).is_some_and(|token| self.tokens.contains(token))
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|t| !t.is_empty())
}

/// Build the policy described by the node's `auth` section.
pub fn policy_from_config(config: &AuthConfig) -> Arc<dyn RejectionPolicy> {
    if config.tokens.is_empty() {
        Arc::new(OpenPolicy)
    } else {
        Arc::new(TokenPolicy::new(config.tokens.iter().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn with_auth(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_token_policy() {
        let policy = TokenPolicy::new(["s3cret".to_string()]);
        assert!(policy.is_authenticated(&with_auth("Bearer s3cret")));
        assert!(policy.is_authenticated(&with_auth("bearer s3cret")));
        assert!(!policy.is_authenticated(&with_auth("Bearer wrong")));
        assert!(!policy.is_authenticated(&with_auth("Basic s3cret")));
        assert!(!policy.is_authenticated(&HeaderMap::new()));
    }

    #[test]
    fn test_public_resources_skip_credentials() {
        let policy = TokenPolicy::new(["s3cret".to_string()]);
        assert!(policy.authorize(&HeaderMap::new(), true).is_ok());
        assert!(matches!(
            policy.authorize(&HeaderMap::new(), false),
            Err(ApiError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_missing_resource_concealed_without_credentials() {
        let policy = TokenPolicy::new(["s3cret".to_string()]);
        let missing = || ApiError::NotFound("build 9".to_string());

        assert!(matches!(
            policy.conceal_missing(&HeaderMap::new(), missing()),
            ApiError::Unauthorized(_)
        ));
        assert!(matches!(
            policy.conceal_missing(&with_auth("Bearer s3cret"), missing()),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            policy.conceal_missing(&HeaderMap::new(), ApiError::Internal("db".to_string())),
            ApiError::Internal(_)
        ));
    }

    #[test]
    fn test_empty_config_is_open() {
        let policy = policy_from_config(&AuthConfig::default());
        assert!(policy.authorize(&HeaderMap::new(), false).is_ok());
    }
}
