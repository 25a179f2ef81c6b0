//! Node gateway over the node's JSON HTTP API
//!
//! Endpoints used:
//! - `GET  /bid-suggestion` storage price quote
//! - `POST /publish` and `GET /publish/{operationId}` submission and replication
//! - `POST /get` and `GET /get/{operationId}` content retrieval
//! - `GET  /search` paged topic search

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client as HttpClient, StatusCode};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::{
    Bid, BidRequest, GatewayError, GatewayResult, NodeGateway, NodeReceipt, ReplicationStatus,
    UalStream,
};
use crate::assertion::{Assertion, AssertionDigest};
use crate::error::{Error, Result};
use crate::finalization::Backoff;
use crate::ual::{Address, Ual};

/// Hash function identifier understood by nodes (SHA-256)
const HASH_FUNCTION_ID: u8 = 1;

/// Results requested per search page
const SEARCH_PAGE_SIZE: usize = 50;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BidSuggestionResponse {
    bid_suggestion: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PublishRequest<'a> {
    assertion_id: &'a str,
    assertion: &'a [String],
    blockchain: &'a str,
    contract: &'a str,
    token_id: u64,
    hash_function_id: u8,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GetRequest<'a> {
    id: String,
    state: &'a str,
    hash_function_id: u8,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationCreated {
    operation_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationData {
    #[serde(default)]
    acknowledged: Option<u32>,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    assertion: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct OperationResult {
    status: String,
    #[serde(default)]
    data: OperationData,
}

impl OperationResult {
    fn failure(&self) -> String {
        match (&self.data.error_type, &self.data.error_message) {
            (Some(kind), Some(message)) => format!("{}: {}", kind, message),
            (Some(kind), None) => kind.clone(),
            (None, Some(message)) => message.clone(),
            (None, None) => "operation failed".to_string(),
        }
    }

    fn replication(&self) -> ReplicationStatus {
        match self.status.as_str() {
            "COMPLETED" => ReplicationStatus {
                acknowledged: self.data.acknowledged.unwrap_or(0),
                complete: true,
                rejected: None,
            },
            "FAILED" => ReplicationStatus {
                acknowledged: self.data.acknowledged.unwrap_or(0),
                complete: false,
                rejected: Some(self.failure()),
            },
            _ => ReplicationStatus {
                acknowledged: self.data.acknowledged.unwrap_or(0),
                complete: false,
                rejected: None,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    assets: Vec<String>,
}

/// How `fetch_assertion` waits for the node's get operation to complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetPolling {
    pub attempts: u32,
    pub backoff: Backoff,
}

impl Default for GetPolling {
    fn default() -> Self {
        Self {
            attempts: 10,
            backoff: Backoff::new(Duration::from_millis(500), Duration::from_secs(4), 2),
        }
    }
}

impl GetPolling {
    /// Longest total wait before giving up
    pub fn max_wait(&self) -> Duration {
        (1..=self.attempts).map(|attempt| self.backoff.delay(attempt)).sum()
    }
}

/// Builder for creating an HttpNodeGateway
#[derive(Debug, Default)]
pub struct HttpNodeGatewayBuilder {
    base_url: Option<String>,
    blockchain: Option<String>,
    contract: Option<Address>,
    auth_token: Option<String>,
    timeout: Option<Duration>,
    get_polling: Option<GetPolling>,
}

impl HttpNodeGatewayBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Node endpoint, e.g. `http://localhost:8900`
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Network identifier sent with every request
    pub fn blockchain(mut self, blockchain: impl Into<String>) -> Self {
        self.blockchain = Some(blockchain.into());
        self
    }

    /// Asset contract the node should resolve tokens against
    pub fn contract(mut self, contract: Address) -> Self {
        self.contract = Some(contract);
        self
    }

    /// Bearer token for nodes that require authentication
    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Poll schedule for content retrieval
    pub fn get_polling(mut self, polling: GetPolling) -> Self {
        self.get_polling = Some(polling);
        self
    }

    pub fn build(self) -> Result<HttpNodeGateway> {
        let base_url = self
            .base_url
            .ok_or_else(|| Error::ConfigError("node base URL is required".to_string()))?;
        let blockchain = self
            .blockchain
            .ok_or_else(|| Error::ConfigError("blockchain is required".to_string()))?;
        let contract = self
            .contract
            .ok_or_else(|| Error::ConfigError("asset contract is required".to_string()))?;
        let timeout = self.timeout.unwrap_or(Duration::from_secs(60));

        let http_client = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::ConfigError(format!("failed to build HTTP client: {}", e)))?;

        Ok(HttpNodeGateway {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            blockchain,
            contract,
            auth_token: self.auth_token,
            timeout,
            get_polling: self.get_polling.unwrap_or_default(),
        })
    }
}

/// Node gateway backed by a node's HTTP API
#[derive(Clone)]
pub struct HttpNodeGateway {
    http_client: HttpClient,
    base_url: String,
    blockchain: String,
    contract: Address,
    auth_token: Option<String>,
    timeout: Duration,
    get_polling: GetPolling,
}

impl std::fmt::Debug for HttpNodeGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpNodeGateway")
            .field("base_url", &self.base_url)
            .field("blockchain", &self.blockchain)
            .field("authenticated", &self.auth_token.is_some())
            .finish()
    }
}

impl HttpNodeGateway {
    pub fn builder() -> HttpNodeGatewayBuilder {
        HttpNodeGatewayBuilder::new()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn get_polling(&self) -> &GetPolling {
        &self.get_polling
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Send a request and decode its JSON body
    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> GatewayResult<T> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        response
            .json()
            .await
            .map_err(|e| GatewayError::Transient(format!("failed to parse node response: {}", e)))
    }

    async fn operation_result(&self, kind: &str, operation_id: &str) -> GatewayResult<OperationResult> {
        let url = self.url(&format!("{}/{}", kind, operation_id));
        self.send(self.http_client.get(&url)).await
    }
}

/// Classify a non-success HTTP status
fn status_error(status: StatusCode, body: &str) -> GatewayError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body)
    };

    match status.as_u16() {
        404 => GatewayError::NotFound(detail),
        409 => GatewayError::Conflict(detail),
        408 | 429 | 500..=599 => GatewayError::Transient(detail),
        _ => GatewayError::Rejected(detail),
    }
}

fn transport_error(error: reqwest::Error, timeout: Duration) -> GatewayError {
    if error.is_timeout() {
        GatewayError::Timeout(timeout)
    } else {
        GatewayError::Transient(error.to_string())
    }
}

/// Bid suggestions arrive as decimal strings or plain numbers
fn parse_amount(value: &Value) -> GatewayResult<u128> {
    let parsed = match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64().map(u128::from),
        _ => None,
    };
    parsed.ok_or_else(|| GatewayError::Rejected(format!("unreadable bid suggestion: {}", value)))
}

#[async_trait]
impl NodeGateway for HttpNodeGateway {
    async fn estimate_bid(&self, request: &BidRequest) -> GatewayResult<Bid> {
        debug!(
            size_bytes = request.size_bytes,
            epochs = request.epochs,
            range = %request.range,
            "Requesting bid suggestion"
        );

        let query = [
            ("blockchain", self.blockchain.clone()),
            ("epochsNumber", request.epochs.to_string()),
            ("assertionSize", request.size_bytes.to_string()),
            ("contentAssetStorageAddress", self.contract.to_string()),
            ("firstAssertionId", request.digest.to_string()),
            ("hashFunctionId", HASH_FUNCTION_ID.to_string()),
            ("bidSuggestionRange", request.range.as_str().to_uppercase()),
        ];
        let response: BidSuggestionResponse = self
            .send(self.http_client.get(self.url("bid-suggestion")).query(&query))
            .await?;

        Ok(Bid {
            amount: parse_amount(&response.bid_suggestion)?,
            size_bytes: request.size_bytes,
            epochs: request.epochs,
        })
    }

    async fn submit_assertion(&self, ual: &Ual, assertion: &Assertion) -> GatewayResult<NodeReceipt> {
        let body = PublishRequest {
            assertion_id: assertion.digest().as_str(),
            assertion: assertion.statements(),
            blockchain: &self.blockchain,
            contract: self.contract.as_str(),
            token_id: ual.token_id(),
            hash_function_id: HASH_FUNCTION_ID,
        };

        let created: OperationCreated = self
            .send(self.http_client.post(self.url("publish")).json(&body))
            .await?;

        debug!(ual = %ual, operation_id = %created.operation_id, "Assertion submitted to node");
        Ok(NodeReceipt(created.operation_id))
    }

    async fn get_replication_status(&self, receipt: &NodeReceipt) -> GatewayResult<ReplicationStatus> {
        Ok(self.operation_result("publish", &receipt.0).await?.replication())
    }

    async fn fetch_assertion(&self, ual: &Ual, digest: &AssertionDigest) -> GatewayResult<Vec<String>> {
        let body = GetRequest {
            id: ual.to_string(),
            state: digest.as_str(),
            hash_function_id: HASH_FUNCTION_ID,
        };
        let created: OperationCreated = self
            .send(self.http_client.post(self.url("get")).json(&body))
            .await?;

        let polling = self.get_polling;
        for attempt in 1..=polling.attempts {
            let result = self.operation_result("get", &created.operation_id).await?;
            match result.status.as_str() {
                "COMPLETED" => {
                    return result.data.assertion.ok_or_else(|| {
                        GatewayError::NotFound(format!("no content for {} at {}", ual, digest))
                    });
                }
                "FAILED" => return Err(GatewayError::NotFound(result.failure())),
                status => {
                    let wait = polling.backoff.delay(attempt);
                    debug!(operation_id = %created.operation_id, status = %status, wait_ms = wait.as_millis() as u64, "Get operation still running");
                    tokio::time::sleep(wait).await;
                }
            }
        }

        Err(GatewayError::Timeout(polling.max_wait()))
    }

    fn search_topic(&self, pattern: &str) -> UalStream {
        let gateway = self.clone();
        let pattern = pattern.to_string();

        Box::pin(async_stream::stream! {
            let mut offset = 0usize;

            loop {
                let query = [
                    ("query", pattern.clone()),
                    ("offset", offset.to_string()),
                    ("limit", SEARCH_PAGE_SIZE.to_string()),
                ];
                let page: GatewayResult<SearchPage> = gateway
                    .send(gateway.http_client.get(gateway.url("search")).query(&query))
                    .await;

                let assets = match page {
                    Ok(page) => page.assets,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                };
                let count = assets.len();

                for text in assets {
                    yield Ual::parse(&text)
                        .map_err(|e| GatewayError::Rejected(format!("node returned bad UAL: {}", e)));
                }

                if count < SEARCH_PAGE_SIZE {
                    break;
                }
                offset += count;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_requires_base_url() {
        let result = HttpNodeGateway::builder()
            .blockchain("base:84532")
            .contract(Address::zero())
            .build();
        assert!(matches!(result, Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_get_polling_is_configurable() {
        let default = GetPolling::default();
        assert_eq!(default.max_wait(), Duration::from_millis(500 + 1000 + 2000 + 4000 * 7));

        let polling = GetPolling {
            attempts: 3,
            backoff: Backoff::new(Duration::from_millis(100), Duration::from_millis(150), 2),
        };
        let gateway = HttpNodeGateway::builder()
            .base_url("http://localhost:8900")
            .blockchain("base:84532")
            .contract(Address::zero())
            .get_polling(polling)
            .build()
            .unwrap();
        assert_eq!(gateway.get_polling(), &polling);
        assert_eq!(polling.max_wait(), Duration::from_millis(400));
    }

    #[test]
    fn test_builder_trims_trailing_slash() {
        let gateway = HttpNodeGateway::builder()
            .base_url("http://localhost:8900/")
            .blockchain("base:84532")
            .contract(Address::zero())
            .build()
            .unwrap();
        assert_eq!(gateway.base_url(), "http://localhost:8900");
        assert_eq!(gateway.url("publish"), "http://localhost:8900/publish");
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(status_error(StatusCode::NOT_FOUND, ""), GatewayError::NotFound(_)));
        assert!(matches!(status_error(StatusCode::CONFLICT, ""), GatewayError::Conflict(_)));
        assert!(status_error(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(matches!(
            status_error(StatusCode::BAD_REQUEST, "bad assertion"),
            GatewayError::Rejected(detail) if detail.contains("bad assertion")
        ));
    }

    #[test]
    fn test_operation_result_mapping() {
        let completed: OperationResult =
            serde_json::from_str(r#"{"status":"COMPLETED","data":{"acknowledged":3}}"#).unwrap();
        assert_eq!(
            completed.replication(),
            ReplicationStatus {
                acknowledged: 3,
                complete: true,
                rejected: None
            }
        );

        let pending: OperationResult = serde_json::from_str(r#"{"status":"PENDING"}"#).unwrap();
        assert_eq!(pending.replication(), ReplicationStatus::default());

        let failed: OperationResult = serde_json::from_str(
            r#"{"status":"FAILED","data":{"errorType":"PublishError","errorMessage":"too large"}}"#,
        )
        .unwrap();
        assert_eq!(
            failed.replication().rejected,
            Some("PublishError: too large".to_string())
        );
    }

    #[test]
    fn test_parse_amount_accepts_strings_and_numbers() {
        assert_eq!(parse_amount(&Value::String("1000000000000000000000".into())), Ok(1_000_000_000_000_000_000_000));
        assert_eq!(parse_amount(&serde_json::json!(42)), Ok(42));
        assert!(parse_amount(&serde_json::json!(null)).is_err());
    }
}
