//! Caller identity claims — HS256 JSON Web Tokens per auth context
//!
//! A function with an auth context only accepts calls carrying a token signed
//! with that context's secret. The decoded claims are forwarded to the runner.

use http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use std::collections::HashMap;

use crate::error::{GateError, Result};

const TOKEN_PREFIX: &str = "Bearer ";

struct AuthContext {
    decoding_key: DecodingKey,
    validation: Validation,
}

/// Auth context name → token verifier
pub struct ClaimsVerifier {
    contexts: HashMap<String, AuthContext>,
}

impl ClaimsVerifier {
    /// Build from `name → HMAC secret` pairs
    pub fn new(secrets: &HashMap<String, String>) -> Result<Self> {
        let mut contexts = HashMap::new();
        for (name, secret) in secrets {
            if secret.is_empty() {
                return Err(GateError::Config(format!(
                    "auth context '{}' has an empty secret",
                    name
                )));
            }
            let mut validation = Validation::new(Algorithm::HS256);
            // Don't validate aud/iss
            validation.validate_aud = false;
            validation.required_spec_claims = ["exp"].iter().map(|s| s.to_string()).collect();
            contexts.insert(
                name.clone(),
                AuthContext {
                    decoding_key: DecodingKey::from_secret(secret.as_bytes()),
                    validation,
                },
            );
        }
        Ok(Self { contexts })
    }

    /// Verifier without any auth context
    pub fn empty() -> Self {
        Self {
            contexts: HashMap::new(),
        }
    }

    pub fn has_context(&self, name: &str) -> bool {
        self.contexts.contains_key(name)
    }

    /// Validate a raw token against an auth context and return its claims
    pub fn verify_token(&self, context: &str, token: &str) -> Result<serde_json::Value> {
        let ctx = self
            .contexts
            .get(context)
            .ok_or_else(|| GateError::Unauthorized(format!("unknown auth context '{}'", context)))?;
        decode::<serde_json::Value>(token, &ctx.decoding_key, &ctx.validation)
            .map(|data| data.claims)
            .map_err(|e| GateError::Unauthorized(format!("token validation failed: {}", e)))
    }

    /// Extract the bearer token from the Authorization header and verify it
    pub fn verify(&self, context: &str, headers: &HeaderMap) -> Result<serde_json::Value> {
        let value = headers
            .get(http::header::AUTHORIZATION)
            .ok_or_else(|| GateError::Unauthorized("missing authorization header".to_string()))?
            .to_str()
            .map_err(|_| GateError::Unauthorized("invalid authorization header".to_string()))?;
        let token = value.strip_prefix(TOKEN_PREFIX).unwrap_or(value);
        self.verify_token(context, token)
    }
}
