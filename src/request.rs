//! Construction of authenticated HTTP requests.

use reqwest::header::{ACCEPT, CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use reqwest::Url;
use serde::Serialize;

use crate::config::ApiType;
use crate::Error;

/// Fluent builder for a JSON `POST` against the completion service.
pub struct RequestBuilder {
    auth_token: String,
    base_url: Option<String>,
    path: String,
    api_type: ApiType,
    body: Option<Result<Vec<u8>, serde_json::Error>>,
}

impl RequestBuilder {
    pub fn new(auth_token: impl Into<String>) -> Self {
        Self {
            auth_token: auth_token.into(),
            base_url: None,
            path: String::new(),
            api_type: ApiType::default(),
            body: None,
        }
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn api_type(mut self, api_type: ApiType) -> Self {
        self.api_type = api_type;
        self
    }

    /// Serialize `body` as the JSON request body.
    pub fn json_body<B: Serialize + ?Sized>(mut self, body: &B) -> Self {
        self.body = Some(serde_json::to_vec(body));
        self
    }

    /// Full request URL: base URL and path joined by exactly one slash.
    pub fn url(&self) -> Result<Url, Error> {
        let base = self
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|base| !base.is_empty())
            .ok_or_else(|| Error::request_build("base URL is required"))?;

        let joined = format!(
            "{}/{}",
            base.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        );
        Url::parse(&joined).map_err(|e| Error::request_build(format!("invalid URL '{joined}': {e}")))
    }

    /// Build a request that expects a single JSON response.
    pub fn build(self, client: &reqwest::Client) -> Result<reqwest::Request, Error> {
        self.into_request(client, false)
    }

    /// Build a request that asks the server to keep the connection open and
    /// deliver the response as an event stream.
    pub fn build_stream(self, client: &reqwest::Client) -> Result<reqwest::Request, Error> {
        self.into_request(client, true)
    }

    fn into_request(self, client: &reqwest::Client, stream: bool) -> Result<reqwest::Request, Error> {
        let url = self.url()?;
        let body = match self.body {
            Some(Ok(body)) => body,
            Some(Err(e)) => {
                return Err(Error::request_build(format!("failed to serialize request body: {e}")))
            }
            None => return Err(Error::request_build("request body is required")),
        };

        let mut builder = client.post(url).header(CONTENT_TYPE, "application/json");
        builder = match self.api_type {
            ApiType::DeepSeek => builder.bearer_auth(&self.auth_token),
            ApiType::Azure => builder.header("api-key", &self.auth_token),
        };
        builder = if stream {
            builder
                .header(ACCEPT, "text/event-stream")
                .header(CACHE_CONTROL, "no-cache")
                .header(CONNECTION, "keep-alive")
        } else {
            builder.header(ACCEPT, "application/json")
        };

        builder
            .body(body)
            .build()
            .map_err(|e| Error::request_build(format!("invalid request: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn header<'a>(request: &'a reqwest::Request, name: &str) -> Option<&'a str> {
        request.headers().get(name).and_then(|v| v.to_str().ok())
    }

    #[test]
    fn test_url_joining() {
        let cases = [
            ("https://api.deepseek.com/", "chat/completions"),
            ("https://api.deepseek.com", "chat/completions"),
            ("https://api.deepseek.com/", "/chat/completions"),
        ];
        for (base, path) in cases {
            let url = RequestBuilder::new("k").base_url(base).path(path).url().unwrap();
            assert_eq!(url.as_str(), "https://api.deepseek.com/chat/completions");
        }

        let url = RequestBuilder::new("k")
            .base_url("https://api.deepseek.com/beta/")
            .path("/completions")
            .url()
            .unwrap();
        assert_eq!(url.as_str(), "https://api.deepseek.com/beta/completions");
    }

    #[test]
    fn test_build_sets_auth_and_body() {
        let client = reqwest::Client::new();
        let request = RequestBuilder::new("sk-test")
            .base_url("https://api.deepseek.com/")
            .path("chat/completions")
            .json_body(&json!({"model": "deepseek-chat"}))
            .build(&client)
            .unwrap();

        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(header(&request, "authorization"), Some("Bearer sk-test"));
        assert_eq!(header(&request, "content-type"), Some("application/json"));
        assert_eq!(header(&request, "accept"), Some("application/json"));

        let body = request.body().and_then(|b| b.as_bytes()).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(parsed["model"], "deepseek-chat");
    }

    #[test]
    fn test_build_stream_sets_event_stream_headers() {
        let client = reqwest::Client::new();
        let request = RequestBuilder::new("sk-test")
            .base_url("https://api.deepseek.com/")
            .path("chat/completions")
            .json_body(&json!({}))
            .build_stream(&client)
            .unwrap();

        assert_eq!(header(&request, "accept"), Some("text/event-stream"));
        assert_eq!(header(&request, "cache-control"), Some("no-cache"));
        assert_eq!(header(&request, "connection"), Some("keep-alive"));
    }

    #[test]
    fn test_azure_uses_api_key_header() {
        let client = reqwest::Client::new();
        let request = RequestBuilder::new("azure-key")
            .base_url("https://example.openai.azure.com/")
            .path("chat/completions")
            .api_type(ApiType::Azure)
            .json_body(&json!({}))
            .build(&client)
            .unwrap();

        assert_eq!(header(&request, "api-key"), Some("azure-key"));
        assert!(header(&request, "authorization").is_none());
    }

    #[test]
    fn test_missing_pieces_are_request_build_errors() {
        let client = reqwest::Client::new();

        let err = RequestBuilder::new("k")
            .path("chat/completions")
            .json_body(&json!({}))
            .build(&client)
            .unwrap_err();
        assert!(matches!(err, Error::RequestBuild(_)));

        let err = RequestBuilder::new("k")
            .base_url("https://api.deepseek.com/")
            .build(&client)
            .unwrap_err();
        assert!(matches!(err, Error::RequestBuild(ref msg) if msg.contains("body")));
    }
}
