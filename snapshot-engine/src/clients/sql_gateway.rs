//! SQL Gateway Client
//!
//! HTTP warehouse integration. A SQL gateway fronts the customer's warehouses
//! and exposes two endpoints:
//!
//! - `POST /v1/query` with `{query_id, datasource, sql}`, answering `{rows, statement_id}`
//! - `DELETE /v1/query/{query_id}` to stop a running statement
//!
//! Requests carry a bearer token when one is configured. Rate limiting,
//! gateway unavailability and transport timeouts are retried with
//! exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::warehouse::{QueryOutput, Warehouse, WarehouseError, WarehouseRegistry};
use crate::contracts::{DatasourceConfig, Row};

/// Warehouse statements may legitimately run for up to 30 minutes.
pub const DEFAULT_GATEWAY_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone)]
pub struct SqlGatewayConfig {
    /// Base URL of the gateway
    pub base_url: Url,

    /// Bearer token
    pub auth_token: Option<String>,

    /// Per-request timeout
    pub timeout: Duration,

    /// Maximum attempts per request
    pub max_retries: u32,

    /// Retry backoff base (milliseconds)
    pub retry_backoff_ms: u64,
}

impl SqlGatewayConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            auth_token: None,
            timeout: DEFAULT_GATEWAY_TIMEOUT,
            max_retries: 3,
            retry_backoff_ms: 100,
        }
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }
}

impl From<reqwest::Error> for WarehouseError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            WarehouseError::Timeout
        } else if err.is_connect() {
            WarehouseError::Connection(err.to_string())
        } else {
            WarehouseError::Query(err.to_string())
        }
    }
}

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    query_id: &'a str,
    datasource: &'a str,
    sql: &'a str,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    rows: Vec<Row>,
    statement_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorBody {
    message: String,
}

/// Shared HTTP client for the gateway.
#[derive(Clone)]
pub struct SqlGatewayClient {
    client: Client,
    config: SqlGatewayConfig,
}

impl SqlGatewayClient {
    pub fn new(config: SqlGatewayConfig) -> Result<Self, WarehouseError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| WarehouseError::Configuration(e.to_string()))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &SqlGatewayConfig {
        &self.config
    }

    fn build_url(&self, path: &str) -> Result<Url, WarehouseError> {
        self.config
            .base_url
            .join(path)
            .map_err(|e| WarehouseError::Configuration(e.to_string()))
    }

    /// Execute a request with retry logic, returning the response body.
    #[instrument(skip(self, request_builder), fields(path = %path))]
    async fn execute_with_retry(
        &self,
        path: &str,
        request_builder: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<String, WarehouseError> {
        let mut attempts = 0;
        let mut last_error = String::new();

        while attempts < self.config.max_retries {
            attempts += 1;

            let request = request_builder();
            let request = match self.config.auth_token {
                Some(ref token) => request.bearer_auth(token),
                None => request,
            };

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response.text().await?);
                    }

                    match status {
                        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                            return Err(WarehouseError::Authentication(
                                "Invalid or missing gateway token".to_string(),
                            ));
                        }
                        StatusCode::NOT_IMPLEMENTED => {
                            return Err(WarehouseError::CancelUnsupported);
                        }
                        StatusCode::TOO_MANY_REQUESTS => {
                            warn!("Rate limited, retrying after backoff");
                            last_error = "Rate limited".to_string();
                        }
                        StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
                            warn!("Gateway unavailable, retrying");
                            last_error = format!("Gateway unavailable: {}", status);
                        }
                        _ => {
                            let body = response.text().await.unwrap_or_default();
                            let message = serde_json::from_str::<GatewayErrorBody>(&body)
                                .map(|e| e.message)
                                .unwrap_or(body);
                            return Err(WarehouseError::Response {
                                status: status.as_u16(),
                                message,
                            });
                        }
                    }
                }
                Err(e) => {
                    if e.is_timeout() {
                        warn!("Request timeout, attempt {}/{}", attempts, self.config.max_retries);
                        last_error = "Timeout".to_string();
                    } else if e.is_connect() {
                        warn!("Connection error, attempt {}/{}", attempts, self.config.max_retries);
                        last_error = e.to_string();
                    } else {
                        return Err(e.into());
                    }
                }
            }

            if attempts < self.config.max_retries {
                let backoff = Duration::from_millis(self.config.retry_backoff_ms * 2u64.pow(attempts - 1));
                tokio::time::sleep(backoff).await;
            }
        }

        Err(WarehouseError::RetryExhausted { attempts, last_error })
    }

    #[instrument(skip(self, sql), fields(query_id = %query_id, datasource = %datasource))]
    pub async fn run_query(&self, datasource: &str, query_id: &str, sql: &str) -> Result<QueryOutput, WarehouseError> {
        let url = self.build_url("v1/query")?;
        let body = QueryRequest {
            query_id,
            datasource,
            sql,
        };

        let text = self
            .execute_with_retry("v1/query", || self.client.post(url.clone()).json(&body))
            .await?;

        let parsed: QueryResponse =
            serde_json::from_str(&text).map_err(|e| WarehouseError::Query(format!("Malformed gateway response: {}", e)))?;

        debug!(rows = parsed.rows.len(), "Query finished");

        Ok(QueryOutput {
            rows: parsed.rows,
            statement_id: parsed.statement_id,
        })
    }

    #[instrument(skip(self), fields(query_id = %query_id))]
    pub async fn cancel_query(&self, query_id: &str) -> Result<(), WarehouseError> {
        let path = format!("v1/query/{}", query_id);
        let url = self.build_url(&path)?;

        self.execute_with_retry(&path, || self.client.delete(url.clone()))
            .await?;

        info!("Cancellation accepted by gateway");
        Ok(())
    }

    /// Whether the gateway answers its health endpoint.
    pub async fn health_check(&self) -> bool {
        let Ok(url) = self.build_url("health") else {
            return false;
        };

        match self.client.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!("Gateway health check failed: {}", e);
                false
            }
        }
    }
}

/// A gateway client bound to one datasource.
pub struct SqlGatewayWarehouse {
    client: SqlGatewayClient,
    datasource: String,
}

#[async_trait]
impl Warehouse for SqlGatewayWarehouse {
    async fn run_query(&self, query_id: &str, sql: &str) -> Result<QueryOutput, WarehouseError> {
        self.client.run_query(&self.datasource, query_id, sql).await
    }

    async fn cancel_query(&self, query_id: &str) -> Result<(), WarehouseError> {
        self.client.cancel_query(query_id).await
    }
}

/// Registry that routes every datasource through one SQL gateway.
#[derive(Clone)]
pub struct SqlGatewayRegistry {
    client: SqlGatewayClient,
}

impl SqlGatewayRegistry {
    pub fn new(client: SqlGatewayClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WarehouseRegistry for SqlGatewayRegistry {
    async fn resolve(&self, datasource: &DatasourceConfig) -> Result<Arc<dyn Warehouse>, WarehouseError> {
        if datasource.kind.trim().is_empty() {
            return Err(WarehouseError::Configuration(format!(
                "datasource {} has no warehouse type",
                datasource.id
            )));
        }

        Ok(Arc::new(SqlGatewayWarehouse {
            client: self.client.clone(),
            datasource: datasource.id.clone(),
        }))
    }
}
