use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use reqwest::header;
use serde_json::Value;

use crate::error::InferenceError;

/// The downstream compute API. The request carries the `messages` sequence
/// plus every passed-through field; the response is opaque to the pipeline.
#[async_trait]
pub trait InferenceClient {
    async fn invoke(&self, payload: &Value) -> Result<Value, InferenceError>;
}

pub struct HttpInferenceClient {
    client: reqwest::Client,
    url: reqwest::Url,
}

impl HttpInferenceClient {
    /// Fails with `InferenceError::Configuration` when the endpoint,
    /// deployment or API key is missing; per-call errors never report
    /// configuration problems.
    pub fn new(
        endpoint: &str,
        deployment: &str,
        api_key: &str,
        api_version: &str,
        timeout: Duration,
    ) -> Result<Self, InferenceError> {
        if endpoint.is_empty() || deployment.is_empty() || api_key.is_empty() {
            return Err(InferenceError::Configuration(String::from(
                "endpoint, deployment and API key must all be set",
            )));
        }

        let url = format!(
            "{}/deployments/{}/chat/completions?api-version={}",
            endpoint.trim_end_matches('/'),
            deployment,
            api_version,
        );
        let url = reqwest::Url::parse(&url)
            .map_err(|e| InferenceError::Configuration(format!("invalid endpoint: {}", e)))?;

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        let mut api_key_value = header::HeaderValue::from_str(api_key)
            .map_err(|_| InferenceError::Configuration(String::from("API key is not a valid header value")))?;
        api_key_value.set_sensitive(true);
        headers.insert("api-key", api_key_value);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .expect("failed to construct reqwest client for inference calls");

        Ok(Self { client, url })
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn invoke(&self, payload: &Value) -> Result<Value, InferenceError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(payload)
            .send()
            .await?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => Err(InferenceError::RateLimited),
            status if !status.is_success() => {
                let body = response.text().await.unwrap_or_default();
                Err(InferenceError::Upstream { status, body })
            }
            _ => Ok(response.json().await?),
        }
    }
}
