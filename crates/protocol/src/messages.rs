//! Request and response shapes shared by the transport clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error code returned when the access token is not valid.
pub const ERROR_INVALID_TOKEN: &str = "invalid_token";

/// Error code returned when the access token has expired.
pub const ERROR_EXPIRED_TOKEN: &str = "expired_token";

/// HTTP method of an API request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

/// A transport-agnostic API request.
///
/// `path` is relative to the transport's base (`/oauth2` for the cloud
/// service, `/api` for a gateway on the LAN).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub query: Vec<(String, String)>,
}

impl ApiRequest {
    /// Creates a GET request for `path`.
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            path: path.into(),
            query: Vec::new(),
        }
    }

    /// Creates a POST request for `path`.
    pub fn post(path: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Post,
            path: path.into(),
            query: Vec::new(),
        }
    }

    /// Appends a query parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    /// Looks up the first value of a query parameter.
    pub fn param_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// An `error` reported in a JSON response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiFault {
    /// The bearer token was rejected; a refresh may recover.
    TokenRejected(String),
    /// Any other error; terminal for the call.
    Other(String),
}

impl ApiFault {
    /// Inspects a decoded body for an `error` field.
    pub fn from_body(body: &Value) -> Option<Self> {
        let error = body.get("error")?;
        let code = match error {
            Value::String(s) if s.is_empty() => return None,
            Value::String(s) => s.clone(),
            Value::Null => return None,
            other => other.to_string(),
        };
        if code == ERROR_INVALID_TOKEN || code == ERROR_EXPIRED_TOKEN {
            Some(ApiFault::TokenRejected(code))
        } else {
            let description = body
                .get("error_description")
                .and_then(Value::as_str)
                .map(|d| format!("{code}: {d}"));
            Some(ApiFault::Other(description.unwrap_or(code)))
        }
    }
}
