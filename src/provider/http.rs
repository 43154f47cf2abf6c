//! JSON-over-HTTP provider.
//!
//! Protocol, relative to the configured endpoint:
//!
//! | Call                      | Body                     | Response             |
//! |---------------------------|--------------------------|----------------------|
//! | `POST /resources`         | `{type, properties}`     | `{id, outputs}`      |
//! | `PUT /resources/{id}`     | `{type, properties}`     | `{outputs}`          |
//! | `DELETE /resources/{id}`  | none, `?type=` query     | any                  |
//!
//! 429, 502, 503, 504, connection failures and timeouts are transient.
//! A 404 on delete means the resource is already gone.

use reqwest::{Client, StatusCode, Url, header};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{ConfigError, HalyardError, ProviderError, Result};

use super::{CreatedResource, Outputs, Properties, Provider};

/// HTTP provider client.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// HTTP client.
    client: Client,
    /// Base URL of the provider service.
    endpoint: Url,
    /// Optional bearer token.
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct ResourceRequest<'a> {
    #[serde(rename = "type")]
    resource_type: &'a str,
    properties: &'a Properties,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: String,
    #[serde(default)]
    outputs: Outputs,
}

#[derive(Debug, Deserialize)]
struct UpdateResponse {
    #[serde(default)]
    outputs: Outputs,
}

impl HttpProvider {
    /// Creates a client for the provider at `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is not a valid base URL or the HTTP
    /// client cannot be created.
    pub fn new(endpoint: &str, timeout_secs: u64, token: Option<String>) -> Result<Self> {
        let endpoint = Url::parse(endpoint).map_err(|e| {
            HalyardError::Config(ConfigError::validation(
                format!("Invalid provider endpoint '{endpoint}': {e}"),
                "provider.endpoint",
            ))
        })?;
        if endpoint.cannot_be_a_base() {
            return Err(HalyardError::Config(ConfigError::validation(
                format!("Provider endpoint '{endpoint}' cannot be used as a base URL"),
                "provider.endpoint",
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| HalyardError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            token,
        })
    }

    /// Builds `<endpoint>/resources[/<id>]` with each segment percent-encoded.
    fn resource_url(&self, provider_id: Option<&str>) -> std::result::Result<Url, ProviderError> {
        let mut url = self.endpoint.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| ProviderError::permanent("Provider endpoint cannot be a base URL"))?;
            segments.pop_if_empty().push("resources");
            if let Some(id) = provider_id {
                segments.push(id);
            }
        }
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header(header::AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> std::result::Result<reqwest::Response, ProviderError> {
        self.authorize(request)
            .send()
            .await
            .map_err(|e| classify_transport(&e))
    }
}

/// Classifies a transport-level failure.
fn classify_transport(err: &reqwest::Error) -> ProviderError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ProviderError::transient(format!("Request failed: {err}"))
    } else {
        ProviderError::permanent(format!("Request failed: {err}"))
    }
}

/// Classifies a non-success HTTP status.
fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    let message = if body.is_empty() {
        format!("Provider returned {status}")
    } else {
        format!("Provider returned {status}: {body}")
    };

    match status.as_u16() {
        429 | 502 | 503 | 504 => ProviderError::transient(message),
        _ => ProviderError::permanent(message),
    }
}

async fn error_from(response: reqwest::Response) -> ProviderError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    classify_status(status, body.trim())
}

async fn decode<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
) -> std::result::Result<T, ProviderError> {
    response
        .json()
        .await
        .map_err(|e| ProviderError::permanent(format!("Failed to parse provider response: {e}")))
}

#[async_trait::async_trait]
impl Provider for HttpProvider {
    async fn create_resource(
        &self,
        resource_type: &str,
        properties: &Properties,
    ) -> std::result::Result<CreatedResource, ProviderError> {
        let url = self.resource_url(None)?;
        trace!("POST {url} ({resource_type})");

        let response = self
            .send(self.client.post(url).json(&ResourceRequest {
                resource_type,
                properties,
            }))
            .await?;

        if !response.status().is_success() {
            return Err(error_from(response).await);
        }

        let created: CreateResponse = decode(response).await?;
        debug!("Provider created {resource_type} {}", created.id);
        Ok(CreatedResource {
            provider_id: created.id,
            outputs: created.outputs,
        })
    }

    async fn update_resource(
        &self,
        resource_type: &str,
        provider_id: &str,
        properties: &Properties,
    ) -> std::result::Result<Outputs, ProviderError> {
        let url = self.resource_url(Some(provider_id))?;
        trace!("PUT {url} ({resource_type})");

        let response = self
            .send(self.client.put(url).json(&ResourceRequest {
                resource_type,
                properties,
            }))
            .await?;

        if !response.status().is_success() {
            return Err(error_from(response).await);
        }

        let updated: UpdateResponse = decode(response).await?;
        Ok(updated.outputs)
    }

    async fn delete_resource(
        &self,
        resource_type: &str,
        provider_id: &str,
    ) -> std::result::Result<(), ProviderError> {
        let url = self.resource_url(Some(provider_id))?;
        trace!("DELETE {url} ({resource_type})");

        let response = self
            .send(self.client.delete(url).query(&[("type", resource_type)]))
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!("{resource_type} {provider_id} already gone");
            return Ok(());
        }
        if !status.is_success() {
            return Err(error_from(response).await);
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
