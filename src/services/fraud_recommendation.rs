use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum::{Display, EnumString};
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::commands::{CommandExecutor, CommandFailure, ExternalCommand, FallbackReason};
use crate::models::{
    fraud_advice::{FraudRecommendation, FraudRecommendationCollection},
    values::{Bin, Email, Ip, Zip},
    SessionId,
};

use super::http::{HttpCallError, JsonHttpClient};

pub const COMMAND_NAME: &str = "fraud_recommendation";

#[derive(Debug, Error)]
pub enum FraudRecommendationError {
    #[error("fraud service returned status {status}")]
    Api { status: u16 },
    #[error("fraud service unreachable: {0}")]
    Transport(String),
    #[error("unexpected fraud service response: {0}")]
    InvalidResponse(String),
}

impl From<HttpCallError> for FraudRecommendationError {
    fn from(e: HttpCallError) -> Self {
        match e {
            HttpCallError::Status { status, .. } => FraudRecommendationError::Api { status },
            HttpCallError::NotFound => FraudRecommendationError::Api { status: 404 },
            HttpCallError::Decode(msg) => FraudRecommendationError::InvalidResponse(msg),
            HttpCallError::Transport(msg) | HttpCallError::InvalidUrl(msg) => {
                FraudRecommendationError::Transport(msg)
            }
        }
    }
}

/// Point in the purchase at which the member is screened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum FraudEvent {
    InitCustomer,
    ProcessCustomer,
}

/// Signals sent for scoring; absent fields are simply not sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FraudDataFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<Ip>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<Email>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip: Option<Zip>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bin: Option<Bin>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FraudRecommendationRequest {
    pub business_group_id: Uuid,
    pub site_id: Uuid,
    pub event: FraudEvent,
    pub data: FraudDataFields,
    #[serde(skip)]
    pub session_id: SessionId,
}

#[async_trait]
pub trait FraudServiceClient: Send + Sync {
    async fn retrieve(
        &self,
        request: &FraudRecommendationRequest,
    ) -> Result<Vec<FraudRecommendation>, FraudRecommendationError>;
}

#[derive(Debug, Deserialize)]
struct RecommendationResponse {
    #[serde(default)]
    recommendations: Vec<FraudRecommendation>,
}

#[derive(Debug, Clone)]
pub struct HttpFraudServiceClient {
    http: JsonHttpClient,
}

impl HttpFraudServiceClient {
    pub fn new(http: JsonHttpClient) -> Self {
        Self { http }
    }
}

#[async_trait]
impl FraudServiceClient for HttpFraudServiceClient {
    async fn retrieve(
        &self,
        request: &FraudRecommendationRequest,
    ) -> Result<Vec<FraudRecommendation>, FraudRecommendationError> {
        let response: RecommendationResponse = self
            .http
            .post_json("api/v1/recommendation", request, request.session_id)
            .await?;
        Ok(response.recommendations)
    }
}

struct RetrieveRecommendationCommand {
    client: Arc<dyn FraudServiceClient>,
    request: FraudRecommendationRequest,
}

#[async_trait]
impl ExternalCommand for RetrieveRecommendationCommand {
    type Output = FraudRecommendationCollection;
    type Error = FraudRecommendationError;

    fn name(&self) -> &'static str {
        COMMAND_NAME
    }

    async fn run(&self) -> Result<Self::Output, CommandFailure<Self::Error>> {
        let recommendations = self
            .client
            .retrieve(&self.request)
            .await
            .map_err(CommandFailure::Recoverable)?;
        if recommendations.is_empty() {
            info!(session_id = %self.request.session_id, "no recommendation returned, allowing");
            return Ok(FraudRecommendationCollection::default_allow());
        }
        Ok(FraudRecommendationCollection::new(recommendations))
    }

    fn fallback(&self, reason: FallbackReason<Self::Error>) -> Result<Self::Output, Self::Error> {
        warn!(
            session_id = %self.request.session_id,
            reason = reason.label(),
            "fraud service unavailable, allowing purchase"
        );
        Ok(FraudRecommendationCollection::default_allow())
    }
}

/// Fraud scoring behind a circuit breaker. Never blocks a purchase because
/// the fraud service is down: any failure yields a single default-allow.
#[derive(Clone)]
pub struct FraudRecommendationAdapter {
    client: Arc<dyn FraudServiceClient>,
    executor: CommandExecutor,
}

impl FraudRecommendationAdapter {
    pub fn new(client: Arc<dyn FraudServiceClient>, executor: CommandExecutor) -> Self {
        Self { client, executor }
    }

    #[instrument(skip(self, request), fields(session_id = %request.session_id, event = %request.event))]
    pub async fn retrieve(&self, request: FraudRecommendationRequest) -> FraudRecommendationCollection {
        let command = RetrieveRecommendationCommand {
            client: self.client.clone(),
            request,
        };
        self.executor
            .execute(&command)
            .await
            .unwrap_or_else(|_| FraudRecommendationCollection::default_allow())
    }
}
