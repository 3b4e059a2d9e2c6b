//! JSON REST client shared by the HTTP-backed providers

use std::time::Duration;

use hostbroker_core::BrokerError;
use reqwest::{Client, RequestBuilder};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use url::Url;

/// Errors from a REST backend
#[derive(Error, Debug)]
pub enum ClientError {
    /// Transport failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Body was not the JSON we expected
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Bad base URL or path
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// Non-success status
    #[error("API error {status}: {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body
        message: String,
    },
}

impl ClientError {
    /// Convert into a broker error attributed to `provider`
    #[must_use]
    pub fn into_broker(self, provider: &str) -> BrokerError {
        match self {
            ClientError::Api { status: 401, message } => BrokerError::Authentication {
                provider: provider.to_string(),
                message,
            },
            ClientError::Api { status: 403, message } => {
                BrokerError::Permission(format!("{provider}: {message}"))
            }
            other => BrokerError::provider(provider, other.to_string()),
        }
    }
}

/// Result type for REST calls
pub type Result<T> = std::result::Result<T, ClientError>;

/// How requests authenticate
#[derive(Clone, Default)]
pub enum Auth {
    /// No credentials
    #[default]
    None,
    /// HTTP basic auth
    Basic {
        /// User name
        username: String,
        /// Password
        password: String,
    },
    /// Bearer token
    Bearer(String),
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Auth::None => f.write_str("None"),
            Auth::Basic { username, .. } => write!(f, "Basic({username}, ***)"),
            Auth::Bearer(_) => f.write_str("Bearer(***)"),
        }
    }
}

/// JSON client bound to one backend
#[derive(Debug, Clone)]
pub struct RestClient {
    client: Client,
    base_url: Url,
    auth: Auth,
}

impl RestClient {
    /// Create a client for `base_url`
    ///
    /// # Errors
    /// Returns an error if the base URL is invalid or the client cannot be built
    pub fn new(base_url: impl AsRef<str>, auth: Auth, verify: bool) -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(!verify)
            .timeout(Duration::from_secs(300))
            .build()?;
        Self::with_client(base_url, auth, client)
    }

    /// Create a client with a custom `reqwest::Client`
    ///
    /// # Errors
    /// Returns an error if the base URL is invalid
    pub fn with_client(base_url: impl AsRef<str>, auth: Auth, client: Client) -> Result<Self> {
        Ok(Self {
            client,
            base_url: Url::parse(base_url.as_ref())?,
            auth,
        })
    }

    /// Backend base URL
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Build a full URL from a path
    pub fn url(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).map_err(ClientError::Url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Auth::None => request,
            Auth::Basic { username, password } => request.basic_auth(username, Some(password)),
            Auth::Bearer(token) => request.bearer_auth(token),
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = self.authorize(request).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::Api { status, message });
        }

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(serde_json::from_value(Value::Null)?);
        }
        Ok(serde_json::from_str(&body)?)
    }

    /// Perform a GET request and deserialize the response
    ///
    /// # Errors
    /// Returns an error on transport failure, non-success status or bad JSON
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path)?;
        self.send(self.client.get(url)).await
    }

    /// Perform a GET request with query parameters
    ///
    /// # Errors
    /// Returns an error on transport failure, non-success status or bad JSON
    pub async fn get_query<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let url = self.url(path)?;
        self.send(self.client.get(url).query(query)).await
    }

    /// Perform a POST request with JSON body
    ///
    /// # Errors
    /// Returns an error on transport failure, non-success status or bad JSON
    pub async fn post<T: DeserializeOwned>(&self, path: &str, body: impl Serialize) -> Result<T> {
        let url = self.url(path)?;
        self.send(self.client.post(url).json(&body)).await
    }

    /// Perform a DELETE request with JSON body
    ///
    /// # Errors
    /// Returns an error on transport failure or non-success status
    pub async fn delete(&self, path: &str, body: impl Serialize) -> Result<Value> {
        let url = self.url(path)?;
        self.send(self.client.delete(url).json(&body)).await
    }
}
