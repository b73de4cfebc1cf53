use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::request::RequestBuilder;
use crate::stream::{ByteStream, ChatCompletionStream, CompletionStream, FimCompletionStream, StreamPayload};
use crate::types::{
    ApiErrorBody, ChatCompletionRequest, ChatCompletionResponse, FimCompletionRequest,
    FimCompletionResponse, Streaming, FIM_MAX_TOKENS,
};
use crate::Error;

const CHAT_COMPLETIONS_PATH: &str = "chat/completions";
const FIM_COMPLETIONS_PATH: &str = "completions";

/// Client for the chat and fill-in-middle completion endpoints.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    config: ClientConfig,
}

impl Client {
    /// Create a new client from explicit configuration.
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        let mut builder = reqwest::Client::builder().connect_timeout(config.connect_timeout);
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            http: builder.build()?,
            config,
        })
    }

    /// Create a new client with the public endpoints and the given API key.
    pub fn with_api_key(api_key: impl Into<String>) -> Result<Self, Error> {
        Self::new(ClientConfig::new(api_key))
    }

    /// Create a new client configured from environment variables.
    pub fn from_env() -> Result<Self, Error> {
        Self::new(ClientConfig::from_env()?)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Send a chat completion request and wait for the whole response.
    pub async fn create_chat_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, Error> {
        validate_chat(request)?;

        let http_request = self
            .request(&self.config.base_url, CHAT_COMPLETIONS_PATH)
            .json_body(request)
            .build(&self.http)?;

        let response = self.send(http_request).await?;
        decode_json(response).await
    }

    /// Send a chat completion request with `"stream": true` and return a session
    /// over the streamed response.
    ///
    /// A status of 400 or above is returned as [`Error::Api`] and no session is
    /// created. Cancelling `cancel` stops the session.
    pub async fn create_chat_completion_stream(
        &self,
        request: &ChatCompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatCompletionStream, Error> {
        validate_chat(request)?;

        let http_request = self
            .request(&self.config.base_url, CHAT_COMPLETIONS_PATH)
            .json_body(&Streaming::new(request))
            .build_stream(&self.http)?;

        self.open_stream(http_request, cancel).await
    }

    /// Send a fill-in-middle completion request to the beta endpoint.
    pub async fn create_fim_completion(
        &self,
        request: &FimCompletionRequest,
    ) -> Result<FimCompletionResponse, Error> {
        validate_fim(request)?;

        let http_request = self
            .request(&self.config.fim_base_url, FIM_COMPLETIONS_PATH)
            .json_body(request)
            .build(&self.http)?;

        let response = self.send(http_request).await?;
        decode_json(response).await
    }

    /// Streaming variant of [`create_fim_completion`](Self::create_fim_completion).
    pub async fn create_fim_completion_stream(
        &self,
        request: &FimCompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<FimCompletionStream, Error> {
        validate_fim(request)?;

        let http_request = self
            .request(&self.config.fim_base_url, FIM_COMPLETIONS_PATH)
            .json_body(&Streaming::new(request))
            .build_stream(&self.http)?;

        self.open_stream(http_request, cancel).await
    }

    fn request(&self, base_url: &str, path: &str) -> RequestBuilder {
        RequestBuilder::new(self.config.auth_token.as_str())
            .base_url(base_url)
            .path(path)
            .api_type(self.config.api_type)
    }

    /// Execute a request, turning a 4xx/5xx status into an API error.
    async fn send(&self, request: reqwest::Request) -> Result<reqwest::Response, Error> {
        debug!(method = %request.method(), url = %request.url(), "sending request");

        let response = self.http.execute(request).await?;
        if response.status().as_u16() >= 400 {
            return Err(api_error(response).await);
        }
        Ok(response)
    }

    async fn open_stream<T: StreamPayload>(
        &self,
        request: reqwest::Request,
        cancel: &CancellationToken,
    ) -> Result<CompletionStream<T>, Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            response = self.send(request) => response?,
        };

        let status = response.status().as_u16();
        debug!(mode = T::MODE, status, "stream session opened");

        let body: ByteStream = Box::pin(response.bytes_stream());
        Ok(CompletionStream::new(body, cancel)
            .with_status(status)
            .with_end_of_stream(self.config.end_of_stream))
    }
}

fn validate_model(model: &str) -> Result<(), Error> {
    if model.trim().is_empty() {
        return Err(Error::request_build("model is required"));
    }
    Ok(())
}

fn validate_chat(request: &ChatCompletionRequest) -> Result<(), Error> {
    validate_model(&request.model)?;
    if request.messages.is_empty() {
        return Err(Error::request_build("at least one message is required"));
    }
    Ok(())
}

fn validate_fim(request: &FimCompletionRequest) -> Result<(), Error> {
    validate_model(&request.model)?;
    if let Some(max_tokens) = request.max_tokens {
        if max_tokens > FIM_MAX_TOKENS {
            return Err(Error::request_build(format!(
                "max tokens must be <= {FIM_MAX_TOKENS}, got {max_tokens}"
            )));
        }
    }
    Ok(())
}

/// Build an [`Error::Api`] from a failed response, using the service's error
/// body when it can be parsed.
async fn api_error(response: reqwest::Response) -> Error {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();

    let error = match serde_json::from_str::<ApiErrorBody>(&text) {
        Ok(body) => Error::Api {
            status: status.as_u16(),
            message: body.error.message,
            error_type: body.error.r#type,
            code: body.error.code,
        },
        Err(_) => {
            let message = match text.trim() {
                "" => status.canonical_reason().unwrap_or("unknown error").to_string(),
                trimmed => trimmed.to_string(),
            };
            Error::Api {
                status: status.as_u16(),
                message,
                error_type: None,
                code: None,
            }
        }
    };

    warn!(status = status.as_u16(), %error, "request rejected by API");
    error
}

async fn decode_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, Error> {
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| Error::decode(body.as_str(), e))
}
