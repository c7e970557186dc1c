//! CORS policy for the call path — Cross-Origin Resource Sharing

use http::{HeaderMap, HeaderValue, Method};

use crate::config::CorsConfig;

/// Resolved CORS policy
#[derive(Debug, Clone)]
pub struct CorsPolicy {
    allowed_origins: Vec<String>,
    allowed_methods: Vec<String>,
    allowed_headers: Vec<String>,
    max_age: u64,
}

/// Answer to a preflight request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preflight {
    Allowed(HeaderMap),
    Forbidden,
}

impl CorsPolicy {
    pub fn new(config: &CorsConfig) -> Self {
        Self {
            allowed_origins: if config.allowed_origins.is_empty() {
                vec!["*".to_string()]
            } else {
                config.allowed_origins.clone()
            },
            allowed_methods: if config.allowed_methods.is_empty() {
                ["GET", "POST", "PUT", "DELETE", "PATCH", "OPTIONS"]
                    .iter()
                    .map(|m| m.to_string())
                    .collect()
            } else {
                config.allowed_methods.clone()
            },
            allowed_headers: if config.allowed_headers.is_empty() {
                vec!["Content-Type".to_string(), "Authorization".to_string()]
            } else {
                config.allowed_headers.clone()
            },
            max_age: config.max_age.unwrap_or(86400),
        }
    }

    fn origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.iter().any(|o| o == "*" || o == origin)
    }

    fn allow_origin(&self, origin: Option<&str>) -> Option<HeaderValue> {
        if self.allowed_origins.iter().any(|o| o == "*") {
            return Some(HeaderValue::from_static("*"));
        }
        let origin = origin?;
        if self.origin_allowed(origin) {
            HeaderValue::from_str(origin).ok()
        } else {
            None
        }
    }

    /// Whether a request is a CORS preflight
    pub fn is_preflight(method: &Method, headers: &HeaderMap) -> bool {
        method == Method::OPTIONS && headers.contains_key("Access-Control-Request-Method")
    }

    /// Answer a preflight request
    pub fn preflight(&self, headers: &HeaderMap) -> Preflight {
        let origin = headers.get("Origin").and_then(|v| v.to_str().ok());
        let Some(allow_origin) = self.allow_origin(origin) else {
            return Preflight::Forbidden;
        };

        let mut out = HeaderMap::new();
        out.insert("Access-Control-Allow-Origin", allow_origin);
        if let Ok(v) = HeaderValue::from_str(&self.allowed_methods.join(", ")) {
            out.insert("Access-Control-Allow-Methods", v);
        }
        if let Ok(v) = HeaderValue::from_str(&self.allowed_headers.join(", ")) {
            out.insert("Access-Control-Allow-Headers", v);
        }
        out.insert("Access-Control-Max-Age", HeaderValue::from(self.max_age));
        Preflight::Allowed(out)
    }

    /// Decorate a call response
    pub fn apply(&self, request: &HeaderMap, response: &mut HeaderMap) {
        let origin = request.get("Origin").and_then(|v| v.to_str().ok());
        if let Some(allow_origin) = self.allow_origin(origin) {
            response.insert("Access-Control-Allow-Origin", allow_origin);
            if !self.allowed_origins.iter().any(|o| o == "*") {
                response.insert("Vary", HeaderValue::from_static("Origin"));
            }
        }
    }
}

impl Default for CorsPolicy {
    fn default() -> Self {
        Self::new(&CorsConfig::default())
    }
}
