//! Inbound call → run request

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use http::{HeaderMap, Method};
use std::collections::HashMap;

use super::runner::RunRequest;
use crate::error::{GateError, Result};

/// An inbound call as seen by the dispatcher
#[derive(Debug, Clone)]
pub struct InboundCall {
    pub method: Method,
    /// Path below the call prefix, always starting with '/'
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl InboundCall {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            method,
            path: if path.is_empty() { "/".to_string() } else { path },
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        if let Ok(value) = content_type.parse() {
            self.headers.insert(http::header::CONTENT_TYPE, value);
        }
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: http::header::HeaderName, value: &str) -> Self {
        if let Ok(value) = value.parse() {
            self.headers.insert(name, value);
        }
        self
    }

    /// Media type without parameters, lowercased
    pub fn content_type(&self) -> Option<String> {
        let value = self.headers.get(http::header::CONTENT_TYPE)?.to_str().ok()?;
        let media = value.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        if media.is_empty() {
            None
        } else {
            Some(media)
        }
    }

    /// Bytes received from the caller (query plus body)
    pub fn size(&self) -> u64 {
        (self.query.as_deref().map(str::len).unwrap_or(0) + self.body.len()) as u64
    }
}

/// Build the run request for a call. Recognized bodies are decoded: JSON
/// as-is, text as a string, and form fields merged into the args. Any other
/// body is passed raw, as a string when it is UTF-8 and base64 otherwise.
pub fn build_run_request(
    call: &InboundCall,
    token: String,
    claims: Option<serde_json::Value>,
) -> Result<RunRequest> {
    let mut args: HashMap<String, String> = HashMap::new();
    if let Some(query) = &call.query {
        args.extend(url::form_urlencoded::parse(query.as_bytes()).into_owned());
    }

    let content_type = call.content_type();
    let mut body = None;
    let mut body_encoding = None;
    if !call.body.is_empty() {
        match content_type.as_deref() {
            Some("application/json") => {
                let value: serde_json::Value = serde_json::from_slice(&call.body)
                    .map_err(|e| GateError::BadRequest(format!("invalid JSON body: {}", e)))?;
                body = Some(value);
            }
            Some(ct) if ct.starts_with("text/") => {
                body = Some(serde_json::Value::String(
                    String::from_utf8_lossy(&call.body).into_owned(),
                ));
            }
            Some("application/x-www-form-urlencoded") => {
                args.extend(url::form_urlencoded::parse(&call.body).into_owned());
            }
            _ => match std::str::from_utf8(&call.body) {
                Ok(text) => body = Some(serde_json::Value::String(text.to_string())),
                Err(_) => {
                    body = Some(serde_json::Value::String(STANDARD.encode(&call.body)));
                    body_encoding = Some("base64".to_string());
                }
            },
        }
    }

    Ok(RunRequest {
        token,
        args,
        content_type,
        body,
        body_encoding,
        headers: forwarded_headers(&call.headers),
        method: call.method.to_string(),
        path: call.path.clone(),
        claims,
    })
}

/// Caller headers passed to the runner. Credentials are replaced by the
/// verified claims and hop-by-hop headers stay at the gate.
fn forwarded_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out: HashMap<String, String> = HashMap::new();
    for (name, value) in headers {
        if is_withheld(name.as_str()) {
            continue;
        }
        let Ok(value) = value.to_str() else { continue };
        out.entry(name.as_str().to_string())
            .and_modify(|v| {
                v.push_str(", ");
                v.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    out
}

fn is_withheld(name: &str) -> bool {
    matches!(
        name,
        "authorization"
            | "proxy-authorization"
            | "connection"
            | "keep-alive"
            | "transfer-encoding"
            | "upgrade"
            | "te"
            | "trailer"
            | "content-length"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_args() {
        let call = InboundCall::new(Method::GET, "/hello").with_query("a=1&b=two%20words");
        let req = build_run_request(&call, "tok".into(), None).unwrap();
        assert_eq!(req.args.get("a").map(String::as_str), Some("1"));
        assert_eq!(req.args.get("b").map(String::as_str), Some("two words"));
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/hello");
        assert!(req.body.is_none());
    }

    #[test]
    fn test_json_body() {
        let call = InboundCall::new(Method::POST, "/")
            .with_body("application/json; charset=utf-8", r#"{"x":[1,2]}"#);
        let req = build_run_request(&call, "tok".into(), None).unwrap();
        assert_eq!(req.content_type.as_deref(), Some("application/json"));
        assert_eq!(req.body.unwrap()["x"][1], 2);
    }

    #[test]
    fn test_invalid_json_is_bad_request() {
        let call = InboundCall::new(Method::POST, "/").with_body("application/json", "{nope");
        let err = build_run_request(&call, "tok".into(), None).unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn test_text_body() {
        let call = InboundCall::new(Method::PUT, "/").with_body("text/plain", "hi there");
        let req = build_run_request(&call, "tok".into(), None).unwrap();
        assert_eq!(req.body, Some(serde_json::Value::String("hi there".into())));
    }

    #[test]
    fn test_form_merged_into_args() {
        let call = InboundCall::new(Method::POST, "/")
            .with_query("a=1")
            .with_body("application/x-www-form-urlencoded", "b=2&c=3");
        let req = build_run_request(&call, "tok".into(), None).unwrap();
        assert_eq!(req.args.len(), 3);
        assert!(req.body.is_none());
    }

    #[test]
    fn test_binary_body_base64() {
        let call = InboundCall::new(Method::POST, "/")
            .with_body("application/octet-stream", vec![0xffu8, 0, 1, 2]);
        let req = build_run_request(&call, "tok".into(), None).unwrap();
        assert_eq!(req.body, Some(serde_json::Value::String("/wABAg==".into())));
        assert_eq!(req.body_encoding.as_deref(), Some("base64"));
        assert_eq!(req.content_type.as_deref(), Some("application/octet-stream"));
        assert_eq!(call.size(), 4);
    }

    #[test]
    fn test_utf8_octet_stream_kept_as_text() {
        let call = InboundCall::new(Method::POST, "/").with_body("application/xml", "<a/>");
        let req = build_run_request(&call, "tok".into(), None).unwrap();
        assert_eq!(req.body, Some(serde_json::Value::String("<a/>".into())));
        assert!(req.body_encoding.is_none());
    }

    #[test]
    fn test_body_without_content_type() {
        let mut call = InboundCall::new(Method::POST, "/");
        call.body = Bytes::from_static(b"raw payload");
        let req = build_run_request(&call, "tok".into(), None).unwrap();
        assert!(req.content_type.is_none());
        assert_eq!(req.body, Some(serde_json::Value::String("raw payload".into())));

        call.body = Bytes::from_static(&[0xc3, 0x28]);
        let req = build_run_request(&call, "tok".into(), None).unwrap();
        assert_eq!(req.body_encoding.as_deref(), Some("base64"));
        assert_eq!(req.body, Some(serde_json::Value::String("wyg=".into())));
    }

    #[test]
    fn test_headers_forwarded() {
        let mut call = InboundCall::new(Method::GET, "/")
            .with_header(http::HeaderName::from_static("x-trace-id"), "abc")
            .with_header(http::header::AUTHORIZATION, "Bearer secret")
            .with_header(http::header::CONNECTION, "keep-alive");
        call.headers
            .append(http::header::ACCEPT, "text/plain".parse().unwrap());
        call.headers
            .append(http::header::ACCEPT, "application/json".parse().unwrap());

        let req = build_run_request(&call, "tok".into(), None).unwrap();
        assert_eq!(req.headers.get("x-trace-id").map(String::as_str), Some("abc"));
        assert_eq!(
            req.headers.get("accept").map(String::as_str),
            Some("text/plain, application/json")
        );
        assert!(!req.headers.contains_key("authorization"));
        assert!(!req.headers.contains_key("connection"));
    }

    #[test]
    fn test_claims_passed_through() {
        let call = InboundCall::new(Method::GET, "");
        let claims = serde_json::json!({"sub": "alice"});
        let req = build_run_request(&call, "tok".into(), Some(claims.clone())).unwrap();
        assert_eq!(req.claims, Some(claims));
        assert_eq!(req.path, "/");
    }
}
