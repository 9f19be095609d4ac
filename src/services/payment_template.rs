use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::commands::{CommandExecutor, CommandFailure, ExternalCommand, FallbackReason};
use crate::models::{
    values::{Bin, LastFour},
    BillerName, SessionId,
};

use super::http::{HttpCallError, JsonHttpClient};

pub const RETRIEVE_ALL_COMMAND: &str = "payment_template_retrieve_all";
pub const RETRIEVE_COMMAND: &str = "payment_template_retrieve";
pub const VALIDATE_COMMAND: &str = "payment_template_validate";

#[derive(Debug, Error)]
pub enum PaymentTemplateError {
    #[error("payment template {0} not found")]
    NotFound(Uuid),
    #[error("invalid last four digits: {0}")]
    InvalidLastFour(String),
    #[error("last four digits do not match payment template {0}")]
    ValidationFailed(Uuid),
    #[error("payment template service returned status {status}")]
    Api { status: u16 },
    #[error("payment template service unreachable: {0}")]
    Transport(String),
    #[error("unexpected payment template response: {0}")]
    InvalidResponse(String),
    #[error("unable to retrieve payment template {template_id}: {reason}")]
    UnableToRetrieve { template_id: Uuid, reason: String },
    #[error("{command} circuit is open")]
    CircuitOpen { command: &'static str },
}

impl PaymentTemplateError {
    fn from_http(e: HttpCallError, template_id: Option<Uuid>) -> Self {
        match (e, template_id) {
            (HttpCallError::NotFound, Some(id)) => PaymentTemplateError::NotFound(id),
            (HttpCallError::NotFound, None) => PaymentTemplateError::Api { status: 404 },
            (HttpCallError::Status { status, .. }, _) => PaymentTemplateError::Api { status },
            (HttpCallError::Decode(msg), _) => PaymentTemplateError::InvalidResponse(msg),
            (HttpCallError::Transport(msg), _) | (HttpCallError::InvalidUrl(msg), _) => {
                PaymentTemplateError::Transport(msg)
            }
        }
    }

    /// Errors caused by the request itself rather than the service.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            PaymentTemplateError::NotFound(_)
                | PaymentTemplateError::InvalidLastFour(_)
                | PaymentTemplateError::ValidationFailed(_)
        )
    }
}

/// A stored card of a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentTemplate {
    pub template_id: Uuid,
    pub member_id: Uuid,
    pub biller_name: BillerName,
    pub first_six: Bin,
    pub last_four: LastFour,
    pub expiration_month: u8,
    pub expiration_year: u16,
    #[serde(default)]
    pub last_used_date: Option<DateTime<Utc>>,
    /// Biller specific fields, passed through untouched.
    #[serde(default)]
    pub biller_fields: serde_json::Map<String, serde_json::Value>,
}

#[async_trait]
pub trait PaymentTemplateServiceClient: Send + Sync {
    async fn retrieve_all(
        &self,
        member_id: Uuid,
        payment_type: &str,
        session_id: SessionId,
    ) -> Result<Vec<PaymentTemplate>, PaymentTemplateError>;

    async fn retrieve(
        &self,
        template_id: Uuid,
        session_id: SessionId,
    ) -> Result<PaymentTemplate, PaymentTemplateError>;

    async fn validate(
        &self,
        template_id: Uuid,
        last_four: &LastFour,
        session_id: SessionId,
    ) -> Result<PaymentTemplate, PaymentTemplateError>;
}

#[derive(Debug, Clone)]
pub struct HttpPaymentTemplateServiceClient {
    http: JsonHttpClient,
}

impl HttpPaymentTemplateServiceClient {
    pub fn new(http: JsonHttpClient) -> Self {
        Self { http }
    }
}

#[async_trait]
impl PaymentTemplateServiceClient for HttpPaymentTemplateServiceClient {
    async fn retrieve_all(
        &self,
        member_id: Uuid,
        payment_type: &str,
        session_id: SessionId,
    ) -> Result<Vec<PaymentTemplate>, PaymentTemplateError> {
        self.http
            .get_json(
                "api/v1/payment-templates",
                &[
                    ("memberId", member_id.to_string()),
                    ("paymentType", payment_type.to_string()),
                ],
                session_id,
            )
            .await
            .map_err(|e| PaymentTemplateError::from_http(e, None))
    }

    async fn retrieve(
        &self,
        template_id: Uuid,
        session_id: SessionId,
    ) -> Result<PaymentTemplate, PaymentTemplateError> {
        self.http
            .get_json(
                &format!("api/v1/payment-templates/{}", template_id),
                &[] as &[(&str, &str)],
                session_id,
            )
            .await
            .map_err(|e| PaymentTemplateError::from_http(e, Some(template_id)))
    }

    async fn validate(
        &self,
        template_id: Uuid,
        last_four: &LastFour,
        session_id: SessionId,
    ) -> Result<PaymentTemplate, PaymentTemplateError> {
        self.http
            .post_json(
                &format!("api/v1/payment-templates/{}/validate", template_id),
                &serde_json::json!({ "lastFour": last_four }),
                session_id,
            )
            .await
            .map_err(|e| match e {
                HttpCallError::Status {
                    status: 400 | 422, ..
                } => PaymentTemplateError::ValidationFailed(template_id),
                other => PaymentTemplateError::from_http(other, Some(template_id)),
            })
    }
}

fn classify(e: PaymentTemplateError) -> CommandFailure<PaymentTemplateError> {
    if e.is_caller_error() {
        CommandFailure::Validation(e)
    } else {
        CommandFailure::Recoverable(e)
    }
}

/// A picked card has no safe default: an open circuit is reported as such,
/// anything else as a failed retrieval.
fn unable_to_retrieve(
    command: &'static str,
    template_id: Uuid,
    reason: FallbackReason<PaymentTemplateError>,
) -> PaymentTemplateError {
    match reason {
        FallbackReason::ForcedOpen | FallbackReason::CircuitOpen => {
            PaymentTemplateError::CircuitOpen { command }
        }
        FallbackReason::Failure(e) => PaymentTemplateError::UnableToRetrieve {
            template_id,
            reason: e.to_string(),
        },
        other => PaymentTemplateError::UnableToRetrieve {
            template_id,
            reason: other.label().to_string(),
        },
    }
}

struct RetrieveAllTemplatesCommand {
    client: Arc<dyn PaymentTemplateServiceClient>,
    member_id: Uuid,
    payment_type: String,
    session_id: SessionId,
}

#[async_trait]
impl ExternalCommand for RetrieveAllTemplatesCommand {
    type Output = Vec<PaymentTemplate>;
    type Error = PaymentTemplateError;

    fn name(&self) -> &'static str {
        RETRIEVE_ALL_COMMAND
    }

    async fn run(&self) -> Result<Self::Output, CommandFailure<Self::Error>> {
        self.client
            .retrieve_all(self.member_id, &self.payment_type, self.session_id)
            .await
            .map_err(classify)
    }

    fn fallback(&self, reason: FallbackReason<Self::Error>) -> Result<Self::Output, Self::Error> {
        warn!(
            member_id = %self.member_id,
            reason = reason.label(),
            "payment templates unavailable, continuing without saved cards"
        );
        Ok(Vec::new())
    }
}

struct RetrieveTemplateCommand {
    client: Arc<dyn PaymentTemplateServiceClient>,
    template_id: Uuid,
    session_id: SessionId,
}

#[async_trait]
impl ExternalCommand for RetrieveTemplateCommand {
    type Output = PaymentTemplate;
    type Error = PaymentTemplateError;

    fn name(&self) -> &'static str {
        RETRIEVE_COMMAND
    }

    async fn run(&self) -> Result<Self::Output, CommandFailure<Self::Error>> {
        self.client
            .retrieve(self.template_id, self.session_id)
            .await
            .map_err(classify)
    }

    fn fallback(&self, reason: FallbackReason<Self::Error>) -> Result<Self::Output, Self::Error> {
        Err(unable_to_retrieve(RETRIEVE_COMMAND, self.template_id, reason))
    }
}

struct ValidateTemplateCommand {
    client: Arc<dyn PaymentTemplateServiceClient>,
    template_id: Uuid,
    last_four: String,
    session_id: SessionId,
}

#[async_trait]
impl ExternalCommand for ValidateTemplateCommand {
    type Output = PaymentTemplate;
    type Error = PaymentTemplateError;

    fn name(&self) -> &'static str {
        VALIDATE_COMMAND
    }

    async fn run(&self) -> Result<Self::Output, CommandFailure<Self::Error>> {
        let last_four = LastFour::parse(&self.last_four).map_err(|_| {
            CommandFailure::Validation(PaymentTemplateError::InvalidLastFour(
                self.last_four.clone(),
            ))
        })?;
        self.client
            .validate(self.template_id, &last_four, self.session_id)
            .await
            .map_err(classify)
    }

    fn fallback(&self, reason: FallbackReason<Self::Error>) -> Result<Self::Output, Self::Error> {
        Err(unable_to_retrieve(VALIDATE_COMMAND, self.template_id, reason))
    }
}

/// Saved card lookups. Listing degrades to no saved cards; a lookup of the
/// card the member picked has no safe default and fails instead.
#[derive(Clone)]
pub struct PaymentTemplateAdapter {
    client: Arc<dyn PaymentTemplateServiceClient>,
    executor: CommandExecutor,
}

impl PaymentTemplateAdapter {
    pub fn new(client: Arc<dyn PaymentTemplateServiceClient>, executor: CommandExecutor) -> Self {
        Self { client, executor }
    }

    #[instrument(skip(self))]
    pub async fn retrieve_all(
        &self,
        member_id: Uuid,
        payment_type: &str,
        session_id: SessionId,
    ) -> Vec<PaymentTemplate> {
        let command = RetrieveAllTemplatesCommand {
            client: self.client.clone(),
            member_id,
            payment_type: payment_type.to_string(),
            session_id,
        };
        self.executor
            .execute(&command)
            .await
            .unwrap_or_default()
    }

    #[instrument(skip(self))]
    pub async fn retrieve(
        &self,
        template_id: Uuid,
        session_id: SessionId,
    ) -> Result<PaymentTemplate, PaymentTemplateError> {
        let command = RetrieveTemplateCommand {
            client: self.client.clone(),
            template_id,
            session_id,
        };
        self.executor.execute(&command).await
    }

    #[instrument(skip(self, last_four))]
    pub async fn validate(
        &self,
        template_id: Uuid,
        last_four: &str,
        session_id: SessionId,
    ) -> Result<PaymentTemplate, PaymentTemplateError> {
        let command = ValidateTemplateCommand {
            client: self.client.clone(),
            template_id,
            last_four: last_four.to_string(),
            session_id,
        };
        self.executor.execute(&command).await
    }
}
