//! HTTP client for the cloud SCIM surface
//!
//! One outstanding request at a time is the pusher's contract, so the
//! client exposes plain async calls and returns a [`ScimResponse`] instead
//! of propagating transport errors: a missing HTTP status *is* the signal
//! ("network error, pause the push"), not an exceptional condition.

use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

/// HTTP 200
pub const OK: u16 = 200;
/// HTTP 201
pub const CREATED: u16 = 201;
/// HTTP 400
pub const BAD_REQUEST: u16 = 400;
/// HTTP 404
pub const NOT_FOUND: u16 = 404;
/// HTTP 409
pub const CONFLICT: u16 = 409;
/// HTTP 422, returned by the cloud when a mandatory field is missing
pub const MANDATORY_FIELD_MISSING: u16 = 422;

/// Outcome of one SCIM request
///
/// `status` is `None` when the request never produced an HTTP response
/// (DNS failure, refused connection, timeout); `body` then carries the
/// transport error text.
#[derive(Debug, Clone)]
pub struct ScimResponse {
    pub status: Option<u16>,
    pub body: String,
}

impl ScimResponse {
    pub fn is_network_error(&self) -> bool {
        self.status.is_none()
    }

    pub fn is(&self, code: u16) -> bool {
        self.status == Some(code)
    }

    /// Parses the body as JSON, `None` when it isn't valid JSON
    pub fn json(&self) -> Option<Value> {
        serde_json::from_str(&self.body).ok()
    }

    /// Extracts the cloud-assigned `id` field from the response body
    pub fn cloud_id(&self) -> Option<String> {
        self.json()?
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    }
}

/// Client for the cloud's SCIM-style REST surface
///
/// Authenticates with Basic auth using the pre-shared API key as the user
/// name. The base address is injectable so tests can point the client at a
/// local mock server.
pub struct ScimClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl ScimClient {
    /// Creates a client for the given cloud address
    ///
    /// `server_address` is the bare host address; the `/scimv2` base path
    /// is appended here.
    pub fn new(server_address: impl Into<String>, api_key: impl Into<String>) -> Self {
        let server = server_address.into();
        Self {
            http: Client::new(),
            base_url: format!("{}/scimv2", server.trim_end_matches('/')),
            api_key: api_key.into(),
        }
    }

    /// The errors after which a row must not be resent until its directory
    /// data changes
    pub fn permanent_errors() -> &'static [u16] {
        &[BAD_REQUEST, NOT_FOUND, MANDATORY_FIELD_MISSING]
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        json: Option<&Value>,
        avatar: Option<Vec<u8>>,
    ) -> ScimResponse {
        let url = format!("{}{}", self.base_url, path);
        debug!(method = %method, url = %url, "SCIM request");

        let mut request = self
            .http
            .request(method, &url)
            .basic_auth(&self.api_key, Some(""));

        request = match (json, avatar) {
            (Some(body), Some(bytes)) => {
                // Avatar uploads ride along as multipart with the SCIM JSON
                // in the `data` part
                let form = reqwest::multipart::Form::new()
                    .text("data", body.to_string())
                    .part(
                        "avatar",
                        reqwest::multipart::Part::bytes(bytes).file_name("avatar.jpg"),
                    );
                request.multipart(form)
            }
            (Some(body), None) => request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.to_string()),
            (None, _) => request,
        };

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                if status != StatusCode::OK && status != StatusCode::CREATED {
                    debug!(status = status.as_u16(), body = %body, "SCIM non-success response");
                }
                ScimResponse {
                    status: Some(status.as_u16()),
                    body,
                }
            }
            Err(e) => {
                warn!(error = %e, "SCIM request failed without HTTP status");
                ScimResponse {
                    status: None,
                    body: e.to_string(),
                }
            }
        }
    }

    // --- Users ---

    pub async fn create_user(&self, json: &Value, avatar: Option<Vec<u8>>) -> ScimResponse {
        self.send(Method::POST, "/Users", Some(json), avatar).await
    }

    pub async fn get_user(&self, cloud_id: &str) -> ScimResponse {
        self.send(Method::GET, &format!("/Users/{cloud_id}"), None, None)
            .await
    }

    pub async fn update_user(
        &self,
        cloud_id: &str,
        json: &Value,
        avatar: Option<Vec<u8>>,
    ) -> ScimResponse {
        self.send(Method::PUT, &format!("/Users/{cloud_id}"), Some(json), avatar)
            .await
    }

    pub async fn delete_user(&self, cloud_id: &str) -> ScimResponse {
        self.send(Method::DELETE, &format!("/Users/{cloud_id}"), None, None)
            .await
    }

    // --- Groups ---

    pub async fn create_group(&self, json: &Value) -> ScimResponse {
        self.send(Method::POST, "/Groups", Some(json), None).await
    }

    pub async fn get_group(&self, cloud_id: &str) -> ScimResponse {
        self.send(Method::GET, &format!("/Groups/{cloud_id}"), None, None)
            .await
    }

    pub async fn update_group(&self, cloud_id: &str, json: &Value) -> ScimResponse {
        self.send(Method::PUT, &format!("/Groups/{cloud_id}"), Some(json), None)
            .await
    }

    pub async fn delete_group(&self, cloud_id: &str) -> ScimResponse {
        self.send(Method::DELETE, &format!("/Groups/{cloud_id}"), None, None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_errors() {
        assert_eq!(ScimClient::permanent_errors(), &[400, 404, 422]);
    }

    #[test]
    fn test_response_helpers() {
        let response = ScimResponse {
            status: Some(201),
            body: r#"{"id":"Q1"}"#.to_string(),
        };
        assert!(response.is(201));
        assert!(!response.is_network_error());
        assert_eq!(response.cloud_id().unwrap(), "Q1");

        let network = ScimResponse {
            status: None,
            body: "connection refused".to_string(),
        };
        assert!(network.is_network_error());
        assert!(network.cloud_id().is_none());

        let empty_id = ScimResponse {
            status: Some(200),
            body: r#"{"id":""}"#.to_string(),
        };
        assert!(empty_id.cloud_id().is_none());
    }

    #[test]
    fn test_base_url_trimming() {
        let client = ScimClient::new("https://cloud.example.com/", "key");
        assert_eq!(client.base_url, "https://cloud.example.com/scimv2");
    }
}
