use std::env;
use std::time::Duration;

use crate::stream::EndOfStreamPolicy;
use crate::Error;

/// Default endpoint for chat completions.
pub const DEFAULT_BASE_URL: &str = "https://api.deepseek.com/";
/// Fill-in-middle completions are only served from the beta endpoint.
pub const DEFAULT_FIM_BASE_URL: &str = "https://api.deepseek.com/beta/";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How the auth token is presented to the service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ApiType {
    /// `Authorization: Bearer <token>`
    #[default]
    DeepSeek,
    /// `api-key: <token>`, as used by Azure-hosted deployments.
    Azure,
}

impl std::str::FromStr for ApiType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "deepseek" => Ok(ApiType::DeepSeek),
            "azure" => Ok(ApiType::Azure),
            other => Err(Error::config(format!(
                "Unknown API type '{other}'. Supported types: deepseek, azure"
            ))),
        }
    }
}

/// Configuration for [`Client`](crate::Client).
#[derive(Clone)]
pub struct ClientConfig {
    pub auth_token: String,
    pub base_url: String,
    pub fim_base_url: String,
    pub api_type: ApiType,
    /// Total time allowed for a request, including reading a streamed body.
    /// Unset by default so long streams are not cut off.
    pub timeout: Option<Duration>,
    pub connect_timeout: Duration,
    pub end_of_stream: EndOfStreamPolicy,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("auth_token", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("fim_base_url", &self.fim_base_url)
            .field("api_type", &self.api_type)
            .field("timeout", &self.timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("end_of_stream", &self.end_of_stream)
            .finish()
    }
}

impl ClientConfig {
    /// Create configuration for the public DeepSeek endpoints.
    pub fn new(auth_token: impl Into<String>) -> Self {
        Self {
            auth_token: auth_token.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            fim_base_url: DEFAULT_FIM_BASE_URL.to_string(),
            api_type: ApiType::default(),
            timeout: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            end_of_stream: EndOfStreamPolicy::default(),
        }
    }

    /// Point both chat and FIM calls at a custom base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        self.fim_base_url = base_url.clone();
        self.base_url = base_url;
        self
    }

    pub fn with_fim_base_url(mut self, fim_base_url: impl Into<String>) -> Self {
        self.fim_base_url = fim_base_url.into();
        self
    }

    pub fn with_api_type(mut self, api_type: ApiType) -> Self {
        self.api_type = api_type;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_end_of_stream(mut self, policy: EndOfStreamPolicy) -> Self {
        self.end_of_stream = policy;
        self
    }

    /// Create configuration from environment variables.
    ///
    /// `DEEPSEEK_API_KEY` is required. `DEEPSEEK_BASE_URL`, `DEEPSEEK_FIM_BASE_URL`,
    /// `DEEPSEEK_API_TYPE` and `DEEPSEEK_TIMEOUT_SECS` are optional.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let auth_token = lookup("DEEPSEEK_API_KEY")
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| Error::config("DEEPSEEK_API_KEY environment variable is required"))?;

        let mut config = Self::new(auth_token);

        if let Some(base_url) = lookup("DEEPSEEK_BASE_URL") {
            config = config.with_base_url(base_url);
        }
        if let Some(fim_base_url) = lookup("DEEPSEEK_FIM_BASE_URL") {
            config = config.with_fim_base_url(fim_base_url);
        }
        if let Some(api_type) = lookup("DEEPSEEK_API_TYPE") {
            config = config.with_api_type(api_type.parse()?);
        }
        if let Some(timeout) = lookup("DEEPSEEK_TIMEOUT_SECS") {
            let secs: u64 = timeout.trim().parse().map_err(|_| {
                Error::config(format!("DEEPSEEK_TIMEOUT_SECS must be a whole number of seconds, got '{timeout}'"))
            })?;
            config = config.with_timeout(Duration::from_secs(secs));
        }

        Ok(config)
    }
}
