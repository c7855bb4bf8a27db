//! Shared plumbing for the HTTP-based connectors.
use reqwest::{Client, Method, RequestBuilder, Url};
use serde_json::Value;
use tracing::debug;

use super::profile::{ConnectionProfile, Secret};
use super::ConnectorSettings;
use crate::backend::AuthShape;
use crate::error::ConnectorError;

#[derive(Debug, Clone)]
enum HttpAuth {
    Basic { username: String, password: Secret },
    Bearer(Secret),
}

/// A base URL plus the credentials and headers every request carries.
#[derive(Debug, Clone)]
pub struct HttpEndpoint {
    client: Client,
    base: Url,
    auth: Option<HttpAuth>,
    headers: Vec<(String, String)>,
    max_response_bytes: usize,
}

impl HttpEndpoint {
    pub fn from_profile(
        profile: &ConnectionProfile,
        settings: &ConnectorSettings,
    ) -> Result<Self, ConnectorError> {
        let base = Url::parse(&profile.base_url())
            .map_err(|e| ConnectorError::connection(format!("invalid address: {e}")))?;
        let client = Client::builder()
            .pool_max_idle_per_host(settings.pool_size)
            .connect_timeout(settings.timeout)
            .timeout(settings.timeout)
            .build()
            .map_err(|e| ConnectorError::connection(format!("failed to build HTTP client: {e}")))?;

        let secret = profile.credentials.resolve_secret()?;
        let auth = match (profile.backend.descriptor().auth, secret) {
            (AuthShape::BearerToken, Some(token)) => Some(HttpAuth::Bearer(token)),
            (_, Some(password)) => Some(HttpAuth::Basic {
                username: profile.credentials.username.clone().unwrap_or_default(),
                password,
            }),
            (_, None) => None,
        };

        let headers = profile
            .options
            .iter()
            .filter_map(|(k, v)| k.strip_prefix("header.").map(|name| (name.to_string(), v.clone())))
            .collect();

        Ok(Self {
            client,
            base,
            auth,
            headers,
            max_response_bytes: settings.max_response_bytes,
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Append path segments to the base URL, percent-encoding each one.
    pub fn url(&self, segments: &[&str]) -> Result<Url, ConnectorError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ConnectorError::connection("address cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let mut builder = self.client.request(method, url);
        builder = match &self.auth {
            Some(HttpAuth::Basic { username, password }) => {
                builder.basic_auth(username, Some(password.expose()))
            }
            Some(HttpAuth::Bearer(token)) => builder.bearer_auth(token.expose()),
            None => builder,
        };
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }

    pub async fn get_json(&self, segments: &[&str]) -> Result<Value, ConnectorError> {
        let url = self.url(segments)?;
        self.send_json(self.request(Method::GET, url)).await
    }

    pub async fn post_json(&self, segments: &[&str], body: &Value) -> Result<Value, ConnectorError> {
        let url = self.url(segments)?;
        self.send_json(self.request(Method::POST, url).json(body)).await
    }

    /// Send a request and decode a JSON body, classifying failures. Bodies
    /// past `max_response_bytes` are abandoned.
    pub async fn send_json(&self, builder: RequestBuilder) -> Result<Value, ConnectorError> {
        let mut response = builder.send().await.map_err(transport_error)?;
        let status = response.status().as_u16();
        if response
            .content_length()
            .is_some_and(|len| len > self.max_response_bytes as u64)
        {
            return Err(oversized(self.max_response_bytes));
        }
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(transport_error)? {
            append_chunk(&mut body, &chunk, self.max_response_bytes)?;
        }
        let text = String::from_utf8_lossy(&body);
        if !(200..300).contains(&status) {
            debug!(status, body = %text, "backend returned an error status");
            return Err(classify_status(status, &text));
        }
        serde_json::from_slice(&body)
            .map_err(|e| ConnectorError::connection(format!("backend returned invalid JSON: {e}")))
    }
}

fn append_chunk(body: &mut Vec<u8>, chunk: &[u8], max_bytes: usize) -> Result<(), ConnectorError> {
    if body.len() + chunk.len() > max_bytes {
        return Err(oversized(max_bytes));
    }
    body.extend_from_slice(chunk);
    Ok(())
}

fn oversized(max_bytes: usize) -> ConnectorError {
    ConnectorError::connection(format!("response body exceeded {max_bytes} bytes"))
}

/// Map an HTTP status to a failure kind.
pub fn classify_status(status: u16, body: &str) -> ConnectorError {
    let message = format!("HTTP {status}: {}", error_summary(body));
    match status {
        401 | 407 => ConnectorError::connection(message),
        403 => ConnectorError::permission(message),
        400 | 404 | 405 | 409 | 422 => ConnectorError::syntax(message),
        _ => ConnectorError::connection(message),
    }
}

pub fn transport_error(err: reqwest::Error) -> ConnectorError {
    if err.is_timeout() {
        ConnectorError::connection("request timed out")
    } else {
        ConnectorError::connection(format!("request failed: {err}"))
    }
}

/// Pull a readable reason out of a JSON error body, else the raw text.
fn error_summary(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        for key in ["reason", "message", "error"] {
            if let Some(text) = value.get(key).and_then(Value::as_str) {
                return text.to_string();
            }
        }
    }
    body.chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::error::FailureKind;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(401, "").kind, FailureKind::Connection);
        assert_eq!(classify_status(403, "").kind, FailureKind::Permission);
        assert_eq!(classify_status(400, "").kind, FailureKind::Syntax);
        assert_eq!(classify_status(404, "").kind, FailureKind::Syntax);
        assert_eq!(classify_status(503, "").kind, FailureKind::Connection);
    }

    #[test]
    fn test_error_summary_prefers_reason() {
        let err = classify_status(
            400,
            r#"{"error":"bad_request","reason":"invalid operator: $foo"}"#,
        );
        assert!(err.message.contains("invalid operator"));
    }

    #[test]
    fn test_body_cap() {
        let mut body = Vec::new();
        append_chunk(&mut body, b"{\"docs\":", 16).unwrap();
        append_chunk(&mut body, b"[]}", 16).unwrap();
        assert_eq!(body, b"{\"docs\":[]}");

        let err = append_chunk(&mut body, b"0123456789", 16).unwrap_err();
        assert_eq!(err.kind, FailureKind::Connection);
        assert_eq!(err.message, "response body exceeded 16 bytes");
        assert_eq!(body.len(), 11);
    }

    #[test]
    fn test_url_encodes_segments() {
        let profile = ConnectionProfile::new("c", Backend::CouchDb, "localhost:5984", "");
        let endpoint = HttpEndpoint::from_profile(&profile, &ConnectorSettings::default()).unwrap();
        let url = endpoint.url(&["team/orders", "_find"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:5984/team%2Forders/_find");
    }

    #[test]
    fn test_url_keeps_base_path() {
        let profile = ConnectionProfile::new("g", Backend::GraphQl, "https://api.example.com/v1/", "");
        let endpoint = HttpEndpoint::from_profile(&profile, &ConnectorSettings::default()).unwrap();
        let url = endpoint.url(&["graphql"]).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/graphql");
    }

    #[test]
    fn test_bearer_auth_for_graphql() {
        let mut profile = ConnectionProfile::new("g", Backend::GraphQl, "https://api.example.com", "")
            .with_option("header.X-Tenant", "acme");
        profile.credentials.secret = Some(Secret::new("tok"));
        let endpoint = HttpEndpoint::from_profile(&profile, &ConnectorSettings::default()).unwrap();
        assert!(matches!(endpoint.auth, Some(HttpAuth::Bearer(_))));
        assert_eq!(endpoint.headers, vec![("X-Tenant".to_string(), "acme".to_string())]);
    }
}
