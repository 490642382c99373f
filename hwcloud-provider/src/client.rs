//! REST client bound to one Huawei Cloud service endpoint

use std::time::Duration;

use hwcloud_core::provider::ProviderError;
use hwcloud_core::refresh::RefreshError;
use reqwest::{Method, StatusCode};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ApiError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }

    pub fn is_forbidden(&self) -> bool {
        self.status_code() == Some(403)
    }

    pub fn is_server_error(&self) -> bool {
        self.status_code().is_some_and(|s| s >= 500)
    }

    /// Service error code from the response body
    ///
    /// Services disagree on the key, so `error_code`, `errCode` and `code`
    /// are all tried, including one level of nesting under `error`.
    pub fn error_code(&self) -> Option<String> {
        let Self::Status { body, .. } = self else {
            return None;
        };
        let parsed: Value = serde_json::from_str(body).ok()?;
        let scope = parsed.get("error").unwrap_or(&parsed);
        ["error_code", "errCode", "code"]
            .iter()
            .find_map(|key| scope.get(*key).and_then(Value::as_str))
            .map(str::to_string)
    }

    /// A 403 whose error code really means "does not exist"
    pub fn is_expected_forbidden(&self, code: &str) -> bool {
        self.is_forbidden() && self.error_code().as_deref() == Some(code)
    }
}

impl From<ApiError> for RefreshError {
    fn from(err: ApiError) -> Self {
        RefreshError::new(err.to_string()).with_source(err)
    }
}

impl From<ApiError> for ProviderError {
    fn from(err: ApiError) -> Self {
        ProviderError::new(err.to_string()).with_cause(err)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Client for one service in one region
#[derive(Debug, Clone)]
pub struct ServiceClient {
    http: reqwest::Client,
    endpoint: String,
    project_id: String,
    auth_token: Option<String>,
}

impl ServiceClient {
    pub fn new(
        http: reqwest::Client,
        endpoint: impl Into<String>,
        project_id: impl Into<String>,
        auth_token: Option<String>,
    ) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            project_id: project_id.into(),
            auth_token,
        }
    }

    /// Shared HTTP client for every service of one provider
    pub fn http_client(request_timeout: Duration, insecure: bool) -> ApiResult<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .timeout(request_timeout)
            .danger_accept_invalid_certs(insecure)
            .build()?)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Full URL for a path template relative to the endpoint
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}{}",
            self.endpoint,
            path.trim_start_matches('/')
                .replace("{project_id}", &self.project_id)
        )
    }

    pub async fn get(&self, path: &str) -> ApiResult<Value> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> ApiResult<Value> {
        self.request(Method::POST, path, Some(body)).await
    }

    pub async fn put(&self, path: &str, body: &Value) -> ApiResult<Value> {
        self.request(Method::PUT, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> ApiResult<Value> {
        self.request(Method::DELETE, path, None).await
    }

    async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> ApiResult<Value> {
        let url = self.url(path);
        log::debug!("{} {}", method, url);

        let mut request = self.http.request(method, &url);
        if let Some(token) = &self.auth_token {
            request = request.header("X-Auth-Token", token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        if text.trim().is_empty() || status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> ServiceClient {
        ServiceClient::new(
            reqwest::Client::new(),
            format!("{}/", server.uri()),
            "proj-1",
            Some("tok".to_string()),
        )
    }

    #[test]
    fn url_expands_project_id() {
        let client = ServiceClient::new(reqwest::Client::new(), "https://ecs.example/", "p9", None);
        assert_eq!(
            client.url("/v1/{project_id}/cloudservers/abc"),
            "https://ecs.example/v1/p9/cloudservers/abc"
        );
    }

    #[test]
    fn error_code_is_found_under_any_known_key() {
        let err = ApiError::Status {
            status: 403,
            body: r#"{"errCode":"SFS.TURBO.9000","errMsg":"no privileges to operate"}"#.to_string(),
        };
        assert_eq!(err.error_code().as_deref(), Some("SFS.TURBO.9000"));
        assert!(err.is_expected_forbidden("SFS.TURBO.9000"));

        let nested = ApiError::Status {
            status: 400,
            body: r#"{"error":{"code":"Ecs.0005","message":"bad"}}"#.to_string(),
        };
        assert_eq!(nested.error_code().as_deref(), Some("Ecs.0005"));
        assert!(!nested.is_expected_forbidden("Ecs.0005"));
    }

    #[tokio::test]
    async fn get_sends_token_and_parses_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/proj-1/cloudservers/srv"))
            .and(header("X-Auth-Token", "tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"server": {"status": "ACTIVE"}})))
            .mount(&server)
            .await;

        let body = client(&server).get("v1/{project_id}/cloudservers/srv").await.unwrap();
        assert_eq!(body["server"]["status"], "ACTIVE");
    }

    #[tokio::test]
    async fn non_success_status_becomes_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/proj-1/subnets/s1"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not here"))
            .mount(&server)
            .await;

        let err = client(&server).delete("v1/{project_id}/subnets/s1").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "HTTP 404: not here");
    }

    #[tokio::test]
    async fn post_sends_json_and_accepts_empty_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/proj-1/cloudservers/action"))
            .and(body_json(json!({"os-start": {"servers": [{"id": "s"}]}})))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let body = client(&server)
            .post(
                "v1/{project_id}/cloudservers/action",
                &json!({"os-start": {"servers": [{"id": "s"}]}}),
            )
            .await
            .unwrap();
        assert_eq!(body, Value::Null);
    }
}
