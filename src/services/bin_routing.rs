use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::commands::{CommandExecutor, CommandFailure, ExternalCommand, FallbackReason};
use crate::models::{values::Bin, BillerName, SessionId};

use super::http::{HttpCallError, JsonHttpClient};

pub const COMMAND_NAME: &str = "bin_routing";

#[derive(Debug, Error)]
pub enum BinRoutingError {
    #[error("bin routing service returned status {status}")]
    Api { status: u16 },
    #[error("bin routing service unreachable: {0}")]
    Transport(String),
    #[error("unexpected bin routing response: {0}")]
    InvalidResponse(String),
}

impl From<HttpCallError> for BinRoutingError {
    fn from(e: HttpCallError) -> Self {
        match e {
            HttpCallError::Status { status, .. } => BinRoutingError::Api { status },
            HttpCallError::NotFound => BinRoutingError::Api { status: 404 },
            HttpCallError::Decode(msg) => BinRoutingError::InvalidResponse(msg),
            HttpCallError::Transport(msg) | HttpCallError::InvalidUrl(msg) => {
                BinRoutingError::Transport(msg)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinRoutingCode {
    pub attempt: u32,
    pub routing_code: String,
    pub bank_name: String,
}

/// Routing codes for a purchase, keyed `"{item_id}_{attempt}"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BinRoutingCodeCollection(HashMap<String, BinRoutingCode>);

impl BinRoutingCodeCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(item_id: Uuid, attempt: u32) -> String {
        format!("{}_{}", item_id, attempt)
    }

    pub fn insert(&mut self, item_id: Uuid, code: BinRoutingCode) {
        self.0.insert(Self::key(item_id, code.attempt), code);
    }

    pub fn get(&self, item_id: Uuid, attempt: u32) -> Option<&BinRoutingCode> {
        self.0.get(&Self::key(item_id, attempt))
    }

    /// Codes for one item ordered by attempt.
    pub fn for_item(&self, item_id: Uuid) -> Vec<&BinRoutingCode> {
        let prefix = format!("{}_", item_id);
        let mut codes: Vec<&BinRoutingCode> = self
            .0
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, code)| code)
            .collect();
        codes.sort_by_key(|code| code.attempt);
        codes
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinRoutingRequest {
    pub item_id: Uuid,
    pub first_six: Bin,
    pub site_id: Uuid,
    pub biller_name: BillerName,
    pub attempt: u32,
    pub business_group_id: Uuid,
    pub session_id: SessionId,
}

#[async_trait]
pub trait BinRoutingServiceClient: Send + Sync {
    async fn retrieve(
        &self,
        request: &BinRoutingRequest,
    ) -> Result<Vec<BinRoutingCode>, BinRoutingError>;
}

#[derive(Debug, Clone)]
pub struct HttpBinRoutingServiceClient {
    http: JsonHttpClient,
}

impl HttpBinRoutingServiceClient {
    pub fn new(http: JsonHttpClient) -> Self {
        Self { http }
    }
}

#[async_trait]
impl BinRoutingServiceClient for HttpBinRoutingServiceClient {
    async fn retrieve(
        &self,
        request: &BinRoutingRequest,
    ) -> Result<Vec<BinRoutingCode>, BinRoutingError> {
        let query = [
            ("bin", request.first_six.to_string()),
            ("siteId", request.site_id.to_string()),
            ("billerName", request.biller_name.to_string()),
            ("attempt", request.attempt.to_string()),
            ("businessGroupId", request.business_group_id.to_string()),
        ];
        Ok(self
            .http
            .get_json("api/v1/routing-codes", &query, request.session_id)
            .await?)
    }
}

struct RetrieveRoutingCodesCommand {
    client: Arc<dyn BinRoutingServiceClient>,
    request: BinRoutingRequest,
}

#[async_trait]
impl ExternalCommand for RetrieveRoutingCodesCommand {
    type Output = BinRoutingCodeCollection;
    type Error = BinRoutingError;

    fn name(&self) -> &'static str {
        COMMAND_NAME
    }

    async fn run(&self) -> Result<Self::Output, CommandFailure<Self::Error>> {
        let codes = self
            .client
            .retrieve(&self.request)
            .await
            .map_err(CommandFailure::Recoverable)?;
        let mut collection = BinRoutingCodeCollection::new();
        for code in codes {
            collection.insert(self.request.item_id, code);
        }
        Ok(collection)
    }

    fn fallback(&self, reason: FallbackReason<Self::Error>) -> Result<Self::Output, Self::Error> {
        warn!(
            item_id = %self.request.item_id,
            reason = reason.label(),
            "bin routing unavailable, charging without routing codes"
        );
        Ok(BinRoutingCodeCollection::new())
    }
}

#[derive(Clone)]
pub struct BinRoutingAdapter {
    client: Arc<dyn BinRoutingServiceClient>,
    executor: CommandExecutor,
}

impl BinRoutingAdapter {
    pub fn new(client: Arc<dyn BinRoutingServiceClient>, executor: CommandExecutor) -> Self {
        Self { client, executor }
    }

    #[instrument(skip(self, request), fields(item_id = %request.item_id, biller = %request.biller_name))]
    pub async fn retrieve(&self, request: BinRoutingRequest) -> BinRoutingCodeCollection {
        let command = RetrieveRoutingCodesCommand {
            client: self.client.clone(),
            request,
        };
        self.executor.execute(&command).await.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerRegistry;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(item_id: Uuid) -> BinRoutingRequest {
        BinRoutingRequest {
            item_id,
            first_six: Bin::parse("411111").unwrap(),
            site_id: Uuid::new_v4(),
            biller_name: BillerName::Netbilling,
            attempt: 1,
            business_group_id: Uuid::new_v4(),
            session_id: SessionId::new(),
        }
    }

    fn executor() -> CommandExecutor {
        CommandExecutor::new(
            Arc::new(CircuitBreakerRegistry::in_memory()),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn collection_is_keyed_by_item_and_attempt() {
        let item_id = Uuid::new_v4();
        let mut collection = BinRoutingCodeCollection::new();
        for attempt in [2, 1] {
            collection.insert(
                item_id,
                BinRoutingCode {
                    attempt,
                    routing_code: format!("RC{}", attempt),
                    bank_name: "First Bank".into(),
                },
            );
        }
        assert_eq!(
            collection.get(item_id, 2).map(|c| c.routing_code.as_str()),
            Some("RC2")
        );
        assert!(collection.get(Uuid::new_v4(), 1).is_none());
        let ordered: Vec<u32> = collection.for_item(item_id).iter().map(|c| c.attempt).collect();
        assert_eq!(ordered, vec![1, 2]);
        assert_eq!(
            BinRoutingCodeCollection::key(item_id, 3),
            format!("{}_3", item_id)
        );
    }

    #[tokio::test]
    async fn http_client_reads_codes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/routing-codes"))
            .and(query_param("bin", "411111"))
            .and(query_param("billerName", "netbilling"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"attempt": 1, "routingCode": "NB-1", "bankName": "First Bank"}
            ])))
            .mount(&server)
            .await;

        let http = JsonHttpClient::new(&server.uri(), Duration::from_secs(1)).unwrap();
        let adapter = BinRoutingAdapter::new(Arc::new(HttpBinRoutingServiceClient::new(http)), executor());

        let item_id = Uuid::new_v4();
        let codes = adapter.retrieve(request(item_id)).await;
        assert_eq!(codes.len(), 1);
        assert_eq!(codes.get(item_id, 1).unwrap().routing_code, "NB-1");
    }

    #[tokio::test]
    async fn service_error_falls_back_to_no_codes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let http = JsonHttpClient::new(&server.uri(), Duration::from_secs(1)).unwrap();
        let executor = executor();
        let adapter =
            BinRoutingAdapter::new(Arc::new(HttpBinRoutingServiceClient::new(http)), executor.clone());

        assert!(adapter.retrieve(request(Uuid::new_v4())).await.is_empty());
        assert_eq!(executor.breaker(COMMAND_NAME).metrics().total_failures, 1);
    }
}
